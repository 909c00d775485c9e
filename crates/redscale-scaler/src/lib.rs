//! redscale-scaler — the external scaler protocol surface.
//!
//! Implements the gRPC contract the orchestrator polls to drive
//! workload scaling, backed by Lua scripts evaluated against Redis.
//!
//! # Architecture
//!
//! ```text
//! ExternalScalerService (gRPC)
//!   ├── GetMetricSpec() → metric name + target value from metadata
//!   ├── GetMetrics()    → resolve metadata → acquire connection
//!   │                     → run script → one integer value
//!   ├── IsActive()      → GetMetrics, then value > activationValue
//!   └── StreamIsActive() → IsActive every 5s until the caller hangs up
//!
//! metadata
//!   └── resolve() → typed ScalerMetadata from the opaque per-target map
//! ```

pub mod metadata;
pub mod server;

/// Generated protobuf types and gRPC service stubs.
pub mod proto {
    tonic::include_proto!("externalscaler");
}

pub use metadata::ScalerMetadata;
pub use server::{ExternalScalerService, RedisScaler};
