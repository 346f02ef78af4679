//! Fault strategies.
//!
//! Every strategy implements [`Injector`] and registers a factory under its
//! [`InjectorType`] with the [`Registry`]. Rule compilation and the chaos
//! strategy both build injectors through the registry only.

mod abort;
mod chaos;
mod code;
mod delay;
mod disconnect;
mod header;
mod network;
mod rate_limit;
mod registry;
mod script;
mod spammer;

pub use abort::AbortInjector;
pub use chaos::ChaosInjector;
pub use code::CodeInjector;
pub use delay::DelayInjector;
pub use disconnect::DisconnectInjector;
pub use header::HeaderInjector;
pub use network::NetworkInjector;
pub use rate_limit::RateLimitInjector;
pub use registry::{BuildContext, InjectorFactory, Registry};
pub use script::ScriptInjector;
pub use spammer::{NoopReplaySender, ReplaySender, SpammerInjector, SPAMMER_MARKER};

use crate::error::ChaosError;
use crate::frame::Frame;
use async_trait::async_trait;
use rand::Rng;
use std::fmt;

/// A fault: blocks, modifies or interrupts a call.
///
/// `Ok(())` lets the call through to the backend; any error is the call's
/// outcome.
#[async_trait]
pub trait Injector: Send + Sync + fmt::Debug {
    async fn apply(&self, frame: &mut Frame) -> Result<(), ChaosError>;
}

/// Registry key of a fault strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InjectorType {
    Abort,
    Chaos,
    Delay,
    Spammer,
    Network,
    Header,
    RateLimit,
    Disconnect,
    Code,
    Script,
}

impl InjectorType {
    pub fn as_str(self) -> &'static str {
        match self {
            InjectorType::Abort => "abort",
            InjectorType::Chaos => "chaos",
            InjectorType::Delay => "delay",
            InjectorType::Spammer => "spammer",
            InjectorType::Network => "network",
            InjectorType::Header => "header",
            InjectorType::RateLimit => "rate_limit",
            InjectorType::Disconnect => "disconnect",
            InjectorType::Code => "code",
            InjectorType::Script => "script",
        }
    }
}

impl fmt::Display for InjectorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Register every built-in strategy.
pub(crate) fn register_builtins(registry: &Registry) {
    abort::register(registry);
    chaos::register(registry);
    code::register(registry);
    delay::register(registry);
    disconnect::register(registry);
    header::register(registry);
    network::register(registry);
    rate_limit::register(registry);
    script::register(registry);
    spammer::register(registry);
}

/// True with probability `percentage / 100`.
pub(crate) fn roll(percentage: u32) -> bool {
    if percentage == 0 {
        return false;
    }
    rand::thread_rng().gen_range(0..100) < percentage
}

/// Duration drawn uniformly from `[min_ms, max_ms]`, normalized the same way
/// for every strategy that jitters: `max == 0` means `max = min`, and an
/// inverted range is swapped.
pub(crate) fn jitter_ms(min_ms: u64, max_ms: u64) -> u64 {
    let (lo, hi) = normalize_range(min_ms, max_ms);
    if hi > lo {
        rand::thread_rng().gen_range(lo..=hi)
    } else {
        lo
    }
}

pub(crate) fn normalize_range(min_ms: u64, max_ms: u64) -> (u64, u64) {
    let max_ms = if max_ms == 0 { min_ms } else { max_ms };
    if min_ms > max_ms {
        (max_ms, min_ms)
    } else {
        (min_ms, max_ms)
    }
}
