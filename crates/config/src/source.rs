use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::Result;

/// Group used when none is given.
pub const DEFAULT_GROUP: &str = "plexus";

/// Maps a group name onto its stored form: `/` becomes `-`, empty becomes
/// [`DEFAULT_GROUP`].
#[must_use]
pub fn normalize_group(group: &str) -> String {
    if group.is_empty() {
        DEFAULT_GROUP.to_string()
    } else {
        group.replace('/', "-")
    }
}

/// What happened to a key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    /// The key did not exist before.
    Added,
    /// The key existed with a different value.
    Modified,
    /// The key was removed.
    Deleted,
}

/// A change delivered to listeners.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Changed key.
    pub key: String,
    /// Normalised group of the key.
    pub group: String,
    /// New value; `None` for [`ChangeKind::Deleted`].
    pub value: Option<String>,
    /// Kind of change.
    pub kind: ChangeKind,
}

/// Callback invoked for every change of the key it was added for.
pub type Listener = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Handle identifying one listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) Uuid);

/// Dynamic configuration source.
///
/// Implementations own any background task they need and release it in
/// [`Source::close`]. After `close`, every other operation fails with
/// [`ConfigError::Closed`](crate::ConfigError::Closed).
#[async_trait]
pub trait Source: Debug + Send + Sync + 'static {
    /// Current value of `key` in `group`.
    async fn get(&self, key: &str, group: &str) -> Result<Option<String>>;

    /// Sets `key` in `group`, notifying listeners.
    async fn publish(&self, key: &str, group: &str, value: &str) -> Result<()>;

    /// Removes `key` from `group`, notifying listeners if it existed.
    async fn remove(&self, key: &str, group: &str) -> Result<()>;

    /// Keys present in `group`, sorted.
    async fn keys_by_group(&self, group: &str) -> Result<Vec<String>>;

    /// Calls `listener` on every later change of `key` in `group`.
    async fn add_listener(&self, key: &str, group: &str, listener: Listener)
    -> Result<ListenerId>;

    /// Stops a listener. Unknown ids are ignored.
    async fn remove_listener(&self, id: ListenerId) -> Result<()>;

    /// Whether the source can serve requests.
    fn is_available(&self) -> bool;

    /// Releases every background resource. Safe to call more than once.
    async fn close(&self) -> Result<()>;
}
