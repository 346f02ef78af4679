//! Request amplification: replays the matched call before letting it through.

use super::{jitter_ms, Injector, InjectorType, Registry};
use crate::config::{ActionConfig, DelayAction, SpammerAction};
use crate::error::ChaosError;
use crate::frame::{Frame, Metadata};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Metadata key carried by every replay. A frame that already has it is
/// itself a replay and is never amplified again.
pub const SPAMMER_MARKER: &str = "x-spammer-request";

/// Outbound client that issues one replayed call.
#[async_trait]
pub trait ReplaySender: Send + Sync + fmt::Debug {
    async fn send(
        &self,
        target: &str,
        service: &str,
        method: &str,
        metadata: Metadata,
    ) -> Result<(), ChaosError>;
}

/// Sender that drops every replay.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReplaySender;

#[async_trait]
impl ReplaySender for NoopReplaySender {
    async fn send(&self, _: &str, _: &str, _: &str, _: Metadata) -> Result<(), ChaosError> {
        Ok(())
    }
}

/// Replays each matched call `count` times against the proxy itself.
#[derive(Debug)]
pub struct SpammerInjector {
    count: u32,
    delay: Option<DelayAction>,
    target: String,
    sender: Arc<dyn ReplaySender>,
}

impl SpammerInjector {
    pub fn new(
        action: &SpammerAction,
        target: impl Into<String>,
        sender: Arc<dyn ReplaySender>,
    ) -> Result<Self, ChaosError> {
        if action.count <= 0 {
            return Err(ChaosError::invalid(format!(
                "spammer count must be greater than 0, got {}",
                action.count
            )));
        }
        let count = u32::try_from(action.count)
            .map_err(|_| ChaosError::invalid(format!("spammer count {} too large", action.count)))?;

        Ok(Self {
            count,
            delay: action.delay.clone(),
            target: target.into(),
            sender,
        })
    }

    fn is_replay(frame: &Frame) -> bool {
        frame.metadata.get(SPAMMER_MARKER) == Some("1")
    }

    /// First value of each key, plus the replay marker.
    fn replay_metadata(frame: &Frame) -> Metadata {
        let mut md = Metadata::new();
        for key in frame.metadata.keys() {
            if let Some(value) = frame.metadata.get(key) {
                md.set(key, value);
            }
        }
        md.set(SPAMMER_MARKER, "1");
        md
    }
}

#[async_trait]
impl Injector for SpammerInjector {
    async fn apply(&self, frame: &mut Frame) -> Result<(), ChaosError> {
        if Self::is_replay(frame) {
            return Ok(());
        }

        for i in 0..self.count {
            if let Some(delay) = &self.delay {
                let ms = jitter_ms(delay.min_ms, delay.max_ms);
                frame.context.sleep(Duration::from_millis(ms)).await?;
            }

            let metadata = Self::replay_metadata(frame);
            if let Err(e) = self
                .sender
                .send(&self.target, &frame.service, &frame.method, metadata)
                .await
            {
                debug!(
                    replay = i + 1,
                    target = %self.target,
                    method = %frame.full_method(),
                    error = %e,
                    "Replay failed"
                );
            }
        }

        Ok(())
    }
}

pub(super) fn register(registry: &Registry) {
    registry.register(InjectorType::Spammer, |config, ctx| match config {
        ActionConfig::Spammer(action) => Ok(Arc::new(SpammerInjector::new(
            action,
            ctx.listener_address,
            ctx.replay_sender.clone(),
        )?)),
        other => Err(ChaosError::invalid(format!(
            "spammer injector given {} config",
            other.kind()
        ))),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Instant;

    #[derive(Debug, Default)]
    struct Recorder {
        calls: Mutex<Vec<(String, String, String, Metadata)>>,
        fail: bool,
    }

    #[async_trait]
    impl ReplaySender for Recorder {
        async fn send(
            &self,
            target: &str,
            service: &str,
            method: &str,
            metadata: Metadata,
        ) -> Result<(), ChaosError> {
            self.calls.lock().push((
                target.to_string(),
                service.to_string(),
                method.to_string(),
                metadata,
            ));
            if self.fail {
                Err(ChaosError::Transport("connection refused".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn spammer(count: i64, delay: Option<DelayAction>, sender: Arc<Recorder>) -> SpammerInjector {
        SpammerInjector::new(&SpammerAction { count, delay }, "127.0.0.1:50051", sender).unwrap()
    }

    #[tokio::test]
    async fn test_replays_with_marker() {
        let recorder = Arc::new(Recorder::default());
        let inj = spammer(3, None, recorder.clone());

        let md: Metadata = [("x-user", "a"), ("x-user", "b"), ("x-trace", "t")]
            .into_iter()
            .collect();
        let mut frame = Frame::new("pkg.Svc", "Do").with_metadata(md);
        tokio_test::assert_ok!(inj.apply(&mut frame).await);

        let calls = recorder.calls.lock();
        assert_eq!(calls.len(), 3);
        for (target, service, method, md) in calls.iter() {
            assert_eq!(target, "127.0.0.1:50051");
            assert_eq!(service, "pkg.Svc");
            assert_eq!(method, "Do");
            assert_eq!(md.get(SPAMMER_MARKER), Some("1"));
            assert_eq!(md.get_all("x-user"), vec!["a"]);
            assert_eq!(md.get("x-trace"), Some("t"));
        }
        assert!(!frame.metadata.contains_key(SPAMMER_MARKER));
    }

    #[tokio::test]
    async fn test_replay_is_not_amplified() {
        let recorder = Arc::new(Recorder::default());
        let inj = spammer(5, None, recorder.clone());

        let md: Metadata = [(SPAMMER_MARKER, "1")].into_iter().collect();
        let mut frame = Frame::new("svc", "m").with_metadata(md);
        tokio_test::assert_ok!(inj.apply(&mut frame).await);
        assert!(recorder.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_replay_errors_discarded() {
        let recorder = Arc::new(Recorder {
            fail: true,
            ..Default::default()
        });
        let inj = spammer(2, None, recorder.clone());

        let mut frame = Frame::new("svc", "m");
        tokio_test::assert_ok!(inj.apply(&mut frame).await);
        assert_eq!(recorder.calls.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_delay_between_replays() {
        let recorder = Arc::new(Recorder::default());
        let inj = spammer(
            2,
            Some(DelayAction {
                min_ms: 20,
                max_ms: 20,
            }),
            recorder,
        );

        let mut frame = Frame::new("svc", "m");
        let start = Instant::now();
        inj.apply(&mut frame).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_invalid_count() {
        for count in [0, -1] {
            let err = SpammerInjector::new(
                &SpammerAction { count, delay: None },
                "",
                Arc::new(NoopReplaySender),
            );
            assert!(matches!(err, Err(ChaosError::InvalidConfig(_))));
        }
    }

    #[tokio::test]
    async fn test_target_from_build_context() {
        let registry = Registry::with_builtins();
        let recorder = Arc::new(Recorder::default());
        let ctx = super::super::BuildContext::new(&registry, "10.0.0.1:9000")
            .with_replay_sender(recorder.clone());

        let inj = ctx
            .build(&ActionConfig::Spammer(SpammerAction {
                count: 1,
                delay: None,
            }))
            .unwrap();
        let mut frame = Frame::new("svc", "m");
        inj.apply(&mut frame).await.unwrap();
        assert_eq!(recorder.calls.lock()[0].0, "10.0.0.1:9000");
    }
}
