//! Random composition of other strategies.

use super::{BuildContext, Injector, InjectorType, Registry};
use crate::config::{ActionConfig, ChaosAction};
use crate::error::ChaosError;
use crate::frame::Frame;
use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;

/// Delegates each call to one of its children, picked uniformly at random.
#[derive(Debug)]
pub struct ChaosInjector {
    injectors: Vec<Arc<dyn Injector>>,
}

impl ChaosInjector {
    /// Build every child through the registry. Only delay, abort and spammer
    /// may be composed.
    pub fn new(action: &ChaosAction, ctx: &BuildContext<'_>) -> Result<Self, ChaosError> {
        if action.actions.is_empty() {
            return Err(ChaosError::invalid("chaos requires at least one action"));
        }

        let mut injectors = Vec::with_capacity(action.actions.len());
        for (i, spec) in action.actions.iter().enumerate() {
            if spec.populated() != 1 {
                return Err(ChaosError::invalid(format!(
                    "chaos action {} must set exactly one of delay, abort or spammer",
                    i
                )));
            }
            let config = spec.resolve().ok_or_else(|| {
                ChaosError::invalid(format!("chaos action {} has no recognized fields", i))
            })?;
            match config.kind() {
                InjectorType::Delay | InjectorType::Abort | InjectorType::Spammer => {}
                other => {
                    return Err(ChaosError::invalid(format!(
                        "chaos action {}: {} cannot be composed",
                        i, other
                    )))
                }
            }
            injectors.push(ctx.build(&config)?);
        }

        Ok(Self { injectors })
    }

    pub fn len(&self) -> usize {
        self.injectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.injectors.is_empty()
    }
}

#[async_trait]
impl Injector for ChaosInjector {
    async fn apply(&self, frame: &mut Frame) -> Result<(), ChaosError> {
        let idx = rand::thread_rng().gen_range(0..self.injectors.len());
        self.injectors[idx].apply(frame).await
    }
}

pub(super) fn register(registry: &Registry) {
    registry.register(InjectorType::Chaos, |config, ctx| match config {
        ActionConfig::Chaos(action) => Ok(Arc::new(ChaosInjector::new(action, ctx)?)),
        other => Err(ChaosError::invalid(format!(
            "chaos injector given {} config",
            other.kind()
        ))),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AbortAction, ActionSpec, DelayAction, NetworkAction};
    use crate::status::Code;

    fn build(actions: Vec<ActionSpec>) -> Result<ChaosInjector, ChaosError> {
        let registry = Registry::with_builtins();
        let ctx = BuildContext::new(&registry, "127.0.0.1:0");
        ChaosInjector::new(&ChaosAction { actions }, &ctx)
    }

    fn delay_spec(ms: u64) -> ActionSpec {
        ActionSpec {
            delay: Some(DelayAction {
                min_ms: ms,
                max_ms: ms,
            }),
            ..Default::default()
        }
    }

    fn abort_spec() -> ActionSpec {
        ActionSpec {
            abort: Some(AbortAction {
                code: "INTERNAL".to_string(),
                percentage: 100,
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_single_action() {
        let inj = build(vec![abort_spec()]).unwrap();
        assert_eq!(inj.len(), 1);

        let mut frame = Frame::new("svc", "m");
        let err = inj.apply(&mut frame).await.unwrap_err();
        assert!(matches!(err, ChaosError::Status(ref s) if s.code == Code::Internal));
    }

    #[tokio::test]
    async fn test_outcomes_are_exclusive() {
        let inj = build(vec![delay_spec(1), abort_spec()]).unwrap();

        let (mut delayed, mut aborted) = (0, 0);
        for _ in 0..200 {
            let mut frame = Frame::new("svc", "m");
            match inj.apply(&mut frame).await {
                Ok(()) => delayed += 1,
                Err(ChaosError::Status(status)) => {
                    assert_eq!(status.code, Code::Internal);
                    aborted += 1;
                }
                Err(other) => panic!("unexpected error {:?}", other),
            }
        }
        assert!(delayed > 0, "delay never chosen");
        assert!(aborted > 0, "abort never chosen");
        assert_eq!(delayed + aborted, 200);
    }

    #[test]
    fn test_empty_actions() {
        assert!(matches!(build(vec![]), Err(ChaosError::InvalidConfig(_))));
    }

    #[test]
    fn test_action_without_fields() {
        let err = build(vec![ActionSpec::default()]);
        assert!(matches!(err, Err(ChaosError::InvalidConfig(_))));
    }

    #[test]
    fn test_non_composable_action() {
        let network = ActionSpec {
            network: Some(NetworkAction {
                loss_percentage: 10,
                throttle_ms: 0,
            }),
            ..Default::default()
        };
        let err = build(vec![delay_spec(1), network]);
        assert!(matches!(err, Err(ChaosError::InvalidConfig(_))));
    }

    #[test]
    fn test_child_build_error_propagates() {
        let registry = Registry::new();
        registry.register(InjectorType::Chaos, |config, ctx| match config {
            ActionConfig::Chaos(action) => Ok(Arc::new(ChaosInjector::new(action, ctx)?)),
            _ => unreachable!(),
        });
        let ctx = BuildContext::new(&registry, "");
        let err = ChaosInjector::new(
            &ChaosAction {
                actions: vec![delay_spec(1)],
            },
            &ctx,
        )
        .unwrap_err();
        assert!(matches!(err, ChaosError::UnknownInjectorType(InjectorType::Delay)));
    }
}
