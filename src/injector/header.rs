//! Metadata rewriting.

use super::{Injector, InjectorType, Registry};
use crate::config::{ActionConfig, HeaderAction, HeaderValueSpec};
use crate::error::ChaosError;
use crate::frame::{Direction, Frame};
use async_trait::async_trait;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
struct ValueMod {
    prefix: String,
    suffix: String,
    values: Vec<String>,
}

impl ValueMod {
    fn render(&self) -> Vec<String> {
        if self.values.is_empty() {
            return vec![format!("{}{}", self.prefix, self.suffix)];
        }
        self.values
            .iter()
            .map(|v| format!("{}{}{}", self.prefix, v, self.suffix))
            .collect()
    }
}

impl From<&HeaderValueSpec> for ValueMod {
    fn from(spec: &HeaderValueSpec) -> Self {
        match spec {
            HeaderValueSpec::Literal(value) => ValueMod {
                prefix: String::new(),
                suffix: String::new(),
                values: vec![value.clone()],
            },
            HeaderValueSpec::Modified(m) => ValueMod {
                prefix: m.prefix.clone(),
                suffix: m.suffix.clone(),
                values: m.values.clone(),
            },
        }
    }
}

/// Rewrites, adds and prunes call metadata in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderInjector {
    headers: Vec<(String, ValueMod)>,
    direction: Direction,
    allowlist: Vec<String>,
}

impl HeaderInjector {
    pub fn new(action: &HeaderAction) -> Self {
        Self {
            headers: action
                .headers
                .iter()
                .map(|(name, spec)| (name.to_ascii_lowercase(), ValueMod::from(spec)))
                .collect(),
            direction: action.direction,
            allowlist: action
                .allowlist
                .iter()
                .map(|k| k.to_ascii_lowercase())
                .collect(),
        }
    }

    fn from_config(config: &ActionConfig) -> Result<Self, ChaosError> {
        match config {
            ActionConfig::Header(action) => Ok(Self::new(action)),
            other => Err(ChaosError::invalid(format!(
                "header injector given {} config",
                other.kind()
            ))),
        }
    }
}

#[async_trait]
impl Injector for HeaderInjector {
    async fn apply(&self, frame: &mut Frame) -> Result<(), ChaosError> {
        if self.direction != Direction::Both && frame.direction != self.direction {
            return Ok(());
        }

        // Prune before adding so configured headers survive their own allowlist.
        if !self.allowlist.is_empty() {
            frame
                .metadata
                .retain_keys(|k| self.allowlist.iter().any(|a| a == k));
        }

        for (name, value_mod) in &self.headers {
            frame.metadata.remove(name);
            for value in value_mod.render() {
                frame.metadata.append(name, value);
            }
        }

        Ok(())
    }
}

pub(super) fn register(registry: &Registry) {
    registry.register(InjectorType::Header, |config, _| {
        Ok(Arc::new(HeaderInjector::from_config(config)?))
    });
}
