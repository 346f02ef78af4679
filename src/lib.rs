//! Chaos Proxy
//!
//! A transparent fault-injection proxy for unary gRPC. Every call is matched
//! against an ordered rule list; the first matching rule decides whether the
//! call is delayed, rejected, rewritten or amplified before it reaches the
//! real backend.
//!
//! # Features
//!
//! - **Rule Matching**: Match by service name and method regex, first match wins
//! - **Latency and Network**: Jittered delays, simulated packet loss, throttling
//! - **Failure Injection**: Abort, disconnect and custom status codes
//! - **Rate Limiting**: Token bucket per rule
//! - **Metadata Rewrites**: Add, rewrite and prune call headers
//! - **Scripts**: Shell scripts that can fail calls or set headers
//! - **Amplification**: Replay calls against the proxy itself
//! - **Hot Reload**: Rules recompile on file change or SIGHUP
//!
//! # Example Configuration
//!
//! ```yaml
//! listener: { address: "0.0.0.0:50051" }
//! backend:  { address: "127.0.0.1:50052" }
//! rules:
//!   - name: slow-users
//!     match:
//!       service: users.UserService
//!       method_regex: "^Get"
//!     action:
//!       delay: { min_ms: 100, max_ms: 300 }
//! ```

pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod frame;
pub mod injector;
pub mod loader;
pub mod matcher;
pub mod proxy;
pub mod status;

pub use config::ProxyConfig;
pub use engine::{ConfigSource, Engine};
pub use error::ChaosError;
pub use frame::{Direction, Frame, Metadata};
pub use injector::{Injector, InjectorType, Registry};
pub use loader::ConfigLoader;
pub use status::{Code, Status};
