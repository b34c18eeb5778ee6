pub mod error;
pub mod events;
pub mod notify;

pub use error::{CoreError, ErrorCategory, Result};
pub use events::{ChangeEvent, EventKind, FeedMessage, OverflowSignal, Row};
pub use notify::ChangeNotification;
