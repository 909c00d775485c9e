//! redscale-redis — Redis connection lifecycle and metric evaluation.
//!
//! The scaler protocol is polled at high frequency across many
//! independently configured targets, each pointing at its own Redis
//! endpoint. This crate owns the two pieces with real resource
//! concerns:
//!
//! ```text
//! ConnectionManager
//!   ├── acquire() → cached connection per target, or a fresh one
//!   ├── sweep task → closes connections idle past the threshold
//!   └── shutdown() → stops the sweep, closes every connection
//!
//! evaluator
//!   ├── decode_string_list() → YAML key/arg lists
//!   └── run_script() → Lua script → single integer metric value
//! ```

pub mod error;
pub mod evaluator;
pub mod manager;

pub use error::{StoreError, StoreResult};
pub use manager::{ConnectOptions, ConnectionManager, Connector, RedisConnectionManager};
