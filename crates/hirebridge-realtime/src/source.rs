//! Change feed abstraction.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use hirebridge_core::ChangeEvent;

use crate::error::ListenerError;

/// Stream of normalized row changes for one subscription.
///
/// The stream ends (or yields an error) when the subscription is lost; a new
/// subscription must then be created from scratch.
pub type ChangeStream = BoxStream<'static, Result<ChangeEvent, ListenerError>>;

/// A row-change feed with at-least-once delivery.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Opens one subscription covering `tables`.
    async fn subscribe(&self, tables: &[String]) -> Result<ChangeStream, ListenerError>;

    /// Short name for logs.
    fn name(&self) -> &str;
}
