pub mod config; // gateway configuration file
pub mod context; // per-turn prompt assembly
pub mod endpoints; // API endpoints
pub mod error; // error handling
pub mod gateway_util; // utilities for gateway
pub mod identity; // caller identity from the session layer
pub mod observability; // utilities for observability (logs, metrics, etc.)
pub mod postprocess; // priority tag extraction
pub mod providers; // AI provider workflows
pub mod rate_limit; // rate limiting
pub mod store; // durable store access
pub mod telemetry; // error and activity reporting
mod testing;
pub mod usage_limit; // usage limiting

pub mod built_info {
    #![expect(clippy::allow_attributes)]
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}
