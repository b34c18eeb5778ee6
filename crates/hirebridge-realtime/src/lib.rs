//! Row-change feed for the hirebridge response cache.
//!
//! A [`ChangeSource`] produces [`hirebridge_core::ChangeEvent`]s; the
//! [`ChangeListener`] pushes them into the bounded invalidation queue; the
//! [`ConnectionSupervisor`] owns the subscription lifecycle and retries with
//! exponential backoff.

pub mod error;
pub mod listener;
pub mod metrics;
pub mod postgres;
pub mod source;
pub mod supervisor;

pub use error::ListenerError;
pub use listener::{ChangeListener, Enqueued, ForwardEnd, ListenerState};
pub use postgres::{NOTIFY_FUNCTION_SQL, PgChangeSource, validate_identifier};
pub use source::{ChangeSource, ChangeStream};
pub use supervisor::{BackoffPolicy, ConnectionSupervisor, SupervisorState, SupervisorStatus};
