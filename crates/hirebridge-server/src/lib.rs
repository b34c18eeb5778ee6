//! Hosting process for the hirebridge response cache: configuration, tracing,
//! Prometheus metrics, the change feed wiring and the operator admin routes.

pub mod admin;
pub mod config;
pub mod error;
pub mod metrics;
pub mod observability;
pub mod server;

pub use admin::AdminState;
pub use config::AppConfig;
pub use error::AdminError;
pub use server::{HirebridgeServer, ServerBuilder, build_app};
