//! Network-condition simulation: packet loss and throttling.

use super::{roll, Injector, InjectorType, Registry};
use crate::config::{ActionConfig, NetworkAction};
use crate::error::ChaosError;
use crate::frame::Frame;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Drops `loss_percentage`% of calls; the survivors are slowed by `throttle_ms`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInjector {
    loss_percentage: u32,
    throttle: Duration,
}

impl NetworkInjector {
    pub fn new(action: &NetworkAction) -> Result<Self, ChaosError> {
        if !(0..=100).contains(&action.loss_percentage) {
            return Err(ChaosError::invalid(format!(
                "loss percentage must be between 0 and 100, got {}",
                action.loss_percentage
            )));
        }
        if action.throttle_ms < 0 {
            return Err(ChaosError::invalid(format!(
                "throttle ms must be non-negative, got {}",
                action.throttle_ms
            )));
        }
        Ok(Self {
            loss_percentage: action.loss_percentage as u32,
            throttle: Duration::from_millis(action.throttle_ms as u64),
        })
    }

    fn from_config(config: &ActionConfig) -> Result<Self, ChaosError> {
        match config {
            ActionConfig::Network(action) => Self::new(action),
            other => Err(ChaosError::invalid(format!(
                "network injector given {} config",
                other.kind()
            ))),
        }
    }
}

#[async_trait]
impl Injector for NetworkInjector {
    async fn apply(&self, frame: &mut Frame) -> Result<(), ChaosError> {
        if roll(self.loss_percentage) {
            return Err(ChaosError::PacketLoss {
                percentage: self.loss_percentage,
            });
        }
        frame.context.sleep(self.throttle).await
    }
}

pub(super) fn register(registry: &Registry) {
    registry.register(InjectorType::Network, |config, _| {
        Ok(Arc::new(NetworkInjector::from_config(config)?))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn network(loss_percentage: i64, throttle_ms: i64) -> Result<NetworkInjector, ChaosError> {
        NetworkInjector::new(&NetworkAction {
            loss_percentage,
            throttle_ms,
        })
    }

    #[test]
    fn test_validation() {
        assert!(network(101, 0).is_err());
        assert!(network(-1, 0).is_err());
        assert!(network(0, -10).is_err());
        assert!(network(50, 10).is_ok());
    }

    #[tokio::test]
    async fn test_full_loss_skips_throttle() {
        let inj = network(100, 500).unwrap();
        let mut frame = Frame::new("svc", "m");

        let start = Instant::now();
        let err = inj.apply(&mut frame).await.unwrap_err();
        assert!(matches!(err, ChaosError::PacketLoss { percentage: 100 }));
        assert!(start.elapsed() < Duration::from_millis(100));
        assert_eq!(err.to_string(), "network chaos: simulated packet loss (100%)");
    }

    #[tokio::test]
    async fn test_throttle_without_loss() {
        let inj = network(0, 30).unwrap();
        let mut frame = Frame::new("svc", "m");

        let start = Instant::now();
        inj.apply(&mut frame).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_throttle_stops_on_cancelled_call() {
        let inj = network(0, 1000).unwrap();
        let mut frame = Frame::new("svc", "m");
        frame.context.cancel();

        let start = Instant::now();
        let err = inj.apply(&mut frame).await.unwrap_err();
        assert!(matches!(err, ChaosError::Cancelled));
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
