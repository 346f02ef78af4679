//! Simulated connection drops.

use super::{roll, Injector, InjectorType, Registry};
use crate::config::{ActionConfig, DisconnectAction};
use crate::error::ChaosError;
use crate::frame::Frame;
use crate::status::{Code, Status};
use async_trait::async_trait;
use std::sync::Arc;

const DISCONNECT_MESSAGE: &str = "chaos disconnect injected";

/// Fails `percentage`% of calls with `UNAVAILABLE`, as a dropped connection would.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectInjector {
    percentage: u32,
}

impl DisconnectInjector {
    /// Unlike abort, an out-of-range percentage is rejected rather than clamped.
    pub fn new(action: &DisconnectAction) -> Result<Self, ChaosError> {
        if !(0..=100).contains(&action.percentage) {
            return Err(ChaosError::invalid(format!(
                "disconnect percentage must be between 0 and 100, got {}",
                action.percentage
            )));
        }
        Ok(Self {
            percentage: action.percentage as u32,
        })
    }

    fn from_config(config: &ActionConfig) -> Result<Self, ChaosError> {
        match config {
            ActionConfig::Disconnect(action) => Self::new(action),
            other => Err(ChaosError::invalid(format!(
                "disconnect injector given {} config",
                other.kind()
            ))),
        }
    }
}

#[async_trait]
impl Injector for DisconnectInjector {
    async fn apply(&self, _frame: &mut Frame) -> Result<(), ChaosError> {
        if roll(self.percentage) {
            return Err(Status::new(Code::Unavailable, DISCONNECT_MESSAGE).into());
        }
        Ok(())
    }
}

pub(super) fn register(registry: &Registry) {
    registry.register(InjectorType::Disconnect, |config, _| {
        Ok(Arc::new(DisconnectInjector::from_config(config)?))
    });
}
