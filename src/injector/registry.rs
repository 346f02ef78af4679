//! Injector registry: type tag to factory.

use super::{Injector, InjectorType, NoopReplaySender, ReplaySender};
use crate::config::ActionConfig;
use crate::error::ChaosError;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Builds an injector from its raw action config.
///
/// A factory must reject an `ActionConfig` of the wrong variant with
/// [`ChaosError::InvalidConfig`].
pub type InjectorFactory = Arc<
    dyn Fn(&ActionConfig, &BuildContext<'_>) -> Result<Arc<dyn Injector>, ChaosError>
        + Send
        + Sync,
>;

/// Everything a factory may need beyond its own config.
pub struct BuildContext<'a> {
    /// Registry for composite strategies that build children
    pub registry: &'a Registry,
    /// The proxy's own listener address (spammer replay target)
    pub listener_address: &'a str,
    /// Outbound client used for replays
    pub replay_sender: Arc<dyn ReplaySender>,
}

impl<'a> BuildContext<'a> {
    pub fn new(registry: &'a Registry, listener_address: &'a str) -> Self {
        Self {
            registry,
            listener_address,
            replay_sender: Arc::new(NoopReplaySender),
        }
    }

    pub fn with_replay_sender(mut self, sender: Arc<dyn ReplaySender>) -> Self {
        self.replay_sender = sender;
        self
    }

    /// Shorthand for `self.registry.build(config.kind(), config, self)`.
    pub fn build(&self, config: &ActionConfig) -> Result<Arc<dyn Injector>, ChaosError> {
        self.registry.build(config.kind(), config, self)
    }
}

/// Mapping from injector type to factory.
#[derive(Default)]
pub struct Registry {
    factories: RwLock<HashMap<InjectorType, InjectorFactory>>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in strategy registered.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        super::register_builtins(&registry);
        registry
    }

    /// Record a factory; a second registration for the same type wins.
    pub fn register<F>(&self, kind: InjectorType, factory: F)
    where
        F: Fn(&ActionConfig, &BuildContext<'_>) -> Result<Arc<dyn Injector>, ChaosError>
            + Send
            + Sync
            + 'static,
    {
        let previous = self.factories.write().insert(kind, Arc::new(factory));
        if previous.is_some() {
            debug!(injector = %kind, "Replaced injector factory");
        }
    }

    pub fn contains(&self, kind: InjectorType) -> bool {
        self.factories.read().contains_key(&kind)
    }

    /// Build an injector of type `kind` from `config`.
    pub fn build(
        &self,
        kind: InjectorType,
        config: &ActionConfig,
        ctx: &BuildContext<'_>,
    ) -> Result<Arc<dyn Injector>, ChaosError> {
        // Clone out of the lock: chaos builds its children through us.
        let factory = self
            .factories
            .read()
            .get(&kind)
            .cloned()
            .ok_or(ChaosError::UnknownInjectorType(kind))?;
        factory(config, ctx)
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kinds: Vec<_> = self.factories.read().keys().map(|k| k.as_str()).collect();
        f.debug_struct("Registry").field("factories", &kinds).finish()
    }
}
