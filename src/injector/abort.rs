//! Probabilistic abort with a configured status code.

use super::{roll, Injector, InjectorType, Registry};
use crate::config::{AbortAction, ActionConfig};
use crate::error::ChaosError;
use crate::frame::Frame;
use crate::status::{Code, Status};
use async_trait::async_trait;
use std::sync::Arc;

const ABORT_MESSAGE: &str = "chaos abort injected";

/// Terminates `percentage`% of calls with the configured status code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortInjector {
    code: Code,
    percentage: u32,
}

impl AbortInjector {
    /// Unknown code names fall back to `INTERNAL`; the percentage is clamped.
    pub fn new(action: &AbortAction) -> Self {
        Self {
            code: Code::from_name(&action.code).unwrap_or(Code::Internal),
            percentage: action.percentage.clamp(0, 100) as u32,
        }
    }

    fn from_config(config: &ActionConfig) -> Result<Self, ChaosError> {
        match config {
            ActionConfig::Abort(action) => Ok(Self::new(action)),
            other => Err(ChaosError::invalid(format!(
                "abort injector given {} config",
                other.kind()
            ))),
        }
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn percentage(&self) -> u32 {
        self.percentage
    }
}

#[async_trait]
impl Injector for AbortInjector {
    async fn apply(&self, _frame: &mut Frame) -> Result<(), ChaosError> {
        if roll(self.percentage) {
            return Err(Status::new(self.code, ABORT_MESSAGE).into());
        }
        Ok(())
    }
}

pub(super) fn register(registry: &Registry) {
    registry.register(InjectorType::Abort, |config, _| {
        Ok(Arc::new(AbortInjector::from_config(config)?))
    });
}
