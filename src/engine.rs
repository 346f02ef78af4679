//! Rule compilation and per-call evaluation.
//!
//! The engine owns the live generation of compiled rules. A reload compiles
//! a complete new rule list and publishes it with a single atomic swap, so a
//! call in flight always sees exactly one generation.

use crate::config::ProxyConfig;
use crate::error::ChaosError;
use crate::frame::Frame;
use crate::injector::{BuildContext, Injector, NoopReplaySender, Registry, ReplaySender};
use crate::matcher::Matcher;
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Supplier of configuration snapshots.
pub trait ConfigSource: Send + Sync {
    /// The current snapshot, if one has been loaded.
    fn current(&self) -> Option<Arc<ProxyConfig>>;

    /// Receiver that changes whenever a new snapshot is published.
    fn subscribe(&self) -> watch::Receiver<u64>;
}

/// A rule ready for evaluation.
#[derive(Debug)]
pub struct CompiledRule {
    pub name: String,
    pub matcher: Matcher,
    pub injector: Arc<dyn Injector>,
}

#[derive(Debug, Default)]
struct RuleSet {
    /// `None` until the first successful reload
    generation: Option<u64>,
    rules: Vec<CompiledRule>,
}

/// Point-in-time copy of the engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub calls_processed: u64,
    pub calls_matched: u64,
    pub calls_unmatched: u64,
    pub faults_injected: u64,
    pub reloads_failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    calls_processed: AtomicU64,
    calls_matched: AtomicU64,
    calls_unmatched: AtomicU64,
    faults_injected: AtomicU64,
    reloads_failed: AtomicU64,
}

/// Fault-injection engine.
pub struct Engine {
    source: Arc<dyn ConfigSource>,
    registry: Arc<Registry>,
    replay_sender: Arc<dyn ReplaySender>,
    rules: ArcSwap<RuleSet>,
    /// Serializes reloads so generations are numbered in publish order
    reload_lock: Mutex<()>,
    counters: Counters,
}

impl Engine {
    /// Create an engine and compile the initial generation.
    ///
    /// Fails with [`ChaosError::ConfigNotLoaded`] if the source has no
    /// snapshot yet, or with the compilation error of the first reload.
    pub fn new(source: Arc<dyn ConfigSource>, registry: Arc<Registry>) -> Result<Self, ChaosError> {
        Self::with_replay_sender(source, registry, Arc::new(NoopReplaySender))
    }

    /// Like [`Engine::new`], with the client spammer replays go through.
    pub fn with_replay_sender(
        source: Arc<dyn ConfigSource>,
        registry: Arc<Registry>,
        replay_sender: Arc<dyn ReplaySender>,
    ) -> Result<Self, ChaosError> {
        if source.current().is_none() {
            return Err(ChaosError::ConfigNotLoaded);
        }

        let engine = Self {
            source,
            registry,
            replay_sender,
            rules: ArcSwap::from_pointee(RuleSet::default()),
            reload_lock: Mutex::new(()),
            counters: Counters::default(),
        };
        engine.reload()?;
        Ok(engine)
    }

    /// Recompile the current snapshot and publish it as a new generation.
    ///
    /// On failure the previous generation stays live.
    pub fn reload(&self) -> Result<u64, ChaosError> {
        let _guard = self.reload_lock.lock();

        let result = self
            .source
            .current()
            .ok_or(ChaosError::ConfigNotLoaded)
            .and_then(|config| self.compile(&config));

        let rules = match result {
            Ok(rules) => rules,
            Err(e) => {
                self.counters.reloads_failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    error = %e,
                    generation = ?self.generation(),
                    "Reload failed, keeping previous rules"
                );
                return Err(e);
            }
        };

        let generation = self.generation().map_or(0, |g| g + 1);
        let rule_count = rules.len();
        self.rules.store(Arc::new(RuleSet {
            generation: Some(generation),
            rules,
        }));

        info!(generation, rules = rule_count, "Rules compiled");
        Ok(generation)
    }

    fn compile(&self, config: &ProxyConfig) -> Result<Vec<CompiledRule>, ChaosError> {
        let ctx = BuildContext::new(&self.registry, &config.listener.address)
            .with_replay_sender(self.replay_sender.clone());

        let mut compiled = Vec::new();
        for rule in config.enabled_rules() {
            // A bad pattern fails the whole generation.
            let matcher = Matcher::compile(&rule.matcher)?;

            let Some(action) = rule.action.resolve() else {
                warn!(rule = %rule.name, "Rule has no action, skipping");
                continue;
            };

            let injector = match ctx.build(&action) {
                Ok(injector) => injector,
                Err(e) => {
                    warn!(rule = %rule.name, injector = %action.kind(), error = %e, "Skipping rule");
                    continue;
                }
            };

            debug!(rule = %rule.name, injector = %action.kind(), "Compiled rule");
            compiled.push(CompiledRule {
                name: rule.name.clone(),
                matcher,
                injector,
            });
        }
        Ok(compiled)
    }

    /// Evaluate a call against the live generation; first match wins.
    ///
    /// `Ok(())` means the call should be forwarded to the backend.
    pub async fn process(&self, frame: &mut Frame) -> Result<(), ChaosError> {
        self.counters.calls_processed.fetch_add(1, Ordering::Relaxed);

        let rules = self.rules.load_full();
        let Some(rule) = rules.rules.iter().find(|r| r.matcher.matches(frame)) else {
            self.counters.calls_unmatched.fetch_add(1, Ordering::Relaxed);
            debug!(method = %frame.full_method(), "No matching rule");
            return Err(ChaosError::NoMatchingRule);
        };

        self.counters.calls_matched.fetch_add(1, Ordering::Relaxed);
        debug!(rule = %rule.name, method = %frame.full_method(), "Rule matched");

        let result = rule.injector.apply(frame).await;
        if let Err(e) = &result {
            self.counters.faults_injected.fetch_add(1, Ordering::Relaxed);
            debug!(rule = %rule.name, error = %e, "Fault injected");
        }
        result
    }

    /// Live generation number; `None` before the first successful reload.
    pub fn generation(&self) -> Option<u64> {
        self.rules.load().generation
    }

    /// Names of the live rules, in evaluation order.
    pub fn rule_names(&self) -> Vec<String> {
        self.rules.load().rules.iter().map(|r| r.name.clone()).collect()
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            calls_processed: self.counters.calls_processed.load(Ordering::Relaxed),
            calls_matched: self.counters.calls_matched.load(Ordering::Relaxed),
            calls_unmatched: self.counters.calls_unmatched.load(Ordering::Relaxed),
            faults_injected: self.counters.faults_injected.load(Ordering::Relaxed),
            reloads_failed: self.counters.reloads_failed.load(Ordering::Relaxed),
        }
    }

    /// Reload on every change notification from the config source.
    ///
    /// Notifications that arrive while a reload runs are coalesced into one.
    pub fn spawn_reload_task(self: Arc<Self>) -> JoinHandle<()> {
        let mut changes = self.source.subscribe();
        tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                let version = *changes.borrow_and_update();
                debug!(version, "Config change notified");
                // Failures are logged by reload and leave the old rules live.
                let _ = self.reload();
            }
            debug!("Config source closed, reload task exiting");
        })
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("generation", &self.generation())
            .field("rules", &self.rule_names())
            .finish()
    }
}
