//! Fire-and-forget work outside the request path: deferred sync and push
//! notifications.

mod push;
mod sync;

pub use push::{ConsoleNotifier, Notification, Notifier, PushHandler};
pub use sync::{SyncRegistry, DEFAULT_SYNC_TAG};
