//! Latency injection.

use super::{jitter_ms, normalize_range, Injector, InjectorType, Registry};
use crate::config::{ActionConfig, DelayAction};
use crate::error::ChaosError;
use crate::frame::Frame;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Sleeps for a random duration in `[min, max]` before letting the call through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayInjector {
    min_ms: u64,
    max_ms: u64,
}

impl DelayInjector {
    pub fn new(action: &DelayAction) -> Self {
        let (min_ms, max_ms) = normalize_range(action.min_ms, action.max_ms);
        Self { min_ms, max_ms }
    }

    fn from_config(config: &ActionConfig) -> Result<Self, ChaosError> {
        match config {
            ActionConfig::Delay(action) => Ok(Self::new(action)),
            other => Err(ChaosError::invalid(format!(
                "delay injector given {} config",
                other.kind()
            ))),
        }
    }

    pub fn range_ms(&self) -> (u64, u64) {
        (self.min_ms, self.max_ms)
    }
}

#[async_trait]
impl Injector for DelayInjector {
    async fn apply(&self, frame: &mut Frame) -> Result<(), ChaosError> {
        if self.max_ms == 0 {
            return Ok(());
        }

        let delay_ms = jitter_ms(self.min_ms, self.max_ms);
        debug!(service = %frame.service, method = %frame.method, delay_ms, "Applying delay");
        frame.context.sleep(Duration::from_millis(delay_ms)).await
    }
}

pub(super) fn register(registry: &Registry) {
    registry.register(InjectorType::Delay, |config, _| {
        Ok(Arc::new(DelayInjector::from_config(config)?))
    });
}
