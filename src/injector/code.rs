//! Status-code injection with method filters and per-frame repeat limits.

use super::{roll, Injector, InjectorType, Registry};
use crate::config::{ActionConfig, CodeAction};
use crate::error::ChaosError;
use crate::frame::Frame;
use crate::status::{Code, Status};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const DEFAULT_MESSAGE: &str = "chaos code injected";
const REPEAT_KEY_PREFIX: &str = "x-chaos-repeat-";

/// Fails matching calls with a configured status code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeInjector {
    code: Code,
    code_name: String,
    message: String,
    percentage: u32,
    metadata: BTreeMap<String, String>,
    delay: Duration,
    only_on: Vec<String>,
    repeat_count: u32,
}

impl CodeInjector {
    /// An absent percentage injects on every call; an explicit 0 never does.
    pub fn new(action: &CodeAction) -> Result<Self, ChaosError> {
        let percentage = action.percentage.unwrap_or(100);
        if !(0..=100).contains(&percentage) {
            return Err(ChaosError::invalid(format!(
                "code percentage must be between 0 and 100, got {}",
                percentage
            )));
        }

        let message = if action.message.is_empty() {
            DEFAULT_MESSAGE.to_string()
        } else {
            action.message.clone()
        };

        Ok(Self {
            code: Code::from_name(&action.code).unwrap_or(Code::Unknown),
            code_name: action.code.to_ascii_lowercase(),
            message,
            percentage: percentage as u32,
            metadata: action.metadata.clone(),
            delay: Duration::from_millis(action.delay_ms),
            only_on: action.only_on.clone(),
            repeat_count: action.repeat_count,
        })
    }

    fn from_config(config: &ActionConfig) -> Result<Self, ChaosError> {
        match config {
            ActionConfig::Code(action) => Self::new(action),
            other => Err(ChaosError::invalid(format!(
                "code injector given {} config",
                other.kind()
            ))),
        }
    }

    fn applies_to(&self, method: &str) -> bool {
        self.only_on.is_empty() || self.only_on.iter().any(|m| m.eq_ignore_ascii_case(method))
    }

    fn repeat_key(&self) -> String {
        format!("{}{}", REPEAT_KEY_PREFIX, self.code_name)
    }

    /// Count this injection against the frame's repeat budget.
    ///
    /// Returns `false` once the budget is spent.
    fn consume_repeat(&self, frame: &mut Frame) -> bool {
        if self.repeat_count == 0 {
            return true;
        }

        let key = self.repeat_key();
        let count: u32 = frame
            .metadata
            .get(&key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0);
        if count >= self.repeat_count {
            return false;
        }
        frame.metadata.set(&key, (count + 1).to_string());
        true
    }
}

#[async_trait]
impl Injector for CodeInjector {
    async fn apply(&self, frame: &mut Frame) -> Result<(), ChaosError> {
        if !self.applies_to(&frame.method) {
            return Ok(());
        }
        if !roll(self.percentage) {
            return Ok(());
        }
        if !self.consume_repeat(frame) {
            debug!(method = %frame.method, code = %self.code, "Repeat budget spent, passing through");
            return Ok(());
        }

        frame.context.sleep(self.delay).await?;

        for (key, value) in &self.metadata {
            frame.metadata.set(key, value.clone());
        }

        Err(Status::new(self.code, self.message.clone()).into())
    }
}

pub(super) fn register(registry: &Registry) {
    registry.register(InjectorType::Code, |config, _| {
        Ok(Arc::new(CodeInjector::from_config(config)?))
    });
}
