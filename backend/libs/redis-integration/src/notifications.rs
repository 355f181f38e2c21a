//! Keyspace notification patterns, events and the handler registry
//!
//! Deleting key `mykey` in database 0 publishes two messages:
//!
//! ```text
//! PUBLISH __keyspace@0__:mykey del
//! PUBLISH __keyevent@0__:del mykey
//! ```
//!
//! The first is a key-space notification (channel names the key, payload the
//! event), the second a key-event notification (channel names the event,
//! payload the key).

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Opaque state shared with every handler invocation
pub type UserContext = Arc<dyn Any + Send + Sync>;

/// Callback run for each event matching a registered pattern
pub type NotificationHandler = Arc<dyn Fn(&KeyspaceEvent, Option<&UserContext>) + Send + Sync>;

/// Build the channel pattern `__key<class>@<database>__:<prefix>`.
///
/// `class` is usually `space`, `event` or `*`; it is not validated, an unknown
/// class simply yields a pattern that never matches.
///
/// ```
/// use redis_integration::notification_pattern;
///
/// assert_eq!(notification_pattern("event", 0, "Foo:*"), "__keyevent@0__:Foo:*");
/// assert_eq!(notification_pattern("space", 9, "*"), "__keyspace@9__:*");
/// ```
pub fn notification_pattern(class: &str, database: u32, prefix: &str) -> String {
    format!("__key{}@{}__:{}", class, database, prefix)
}

/// Which notification channel an event arrived on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationKind {
    Keyspace,
    Keyevent,
    /// Anything else matched by a wildcard pattern
    Other,
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationKind::Keyspace => write!(f, "keyspace"),
            NotificationKind::Keyevent => write!(f, "keyevent"),
            NotificationKind::Other => write!(f, "other"),
        }
    }
}

/// One inbound pub/sub message, with the key and event name pulled out of
/// the channel/payload pair when it follows the notification layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyspaceEvent {
    pub pattern: String,
    pub channel: String,
    pub payload: String,
    pub kind: NotificationKind,
    pub database: Option<u32>,
    pub key: Option<String>,
    pub event: Option<String>,
}

impl KeyspaceEvent {
    pub fn new(
        pattern: impl Into<String>,
        channel: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        let pattern = pattern.into();
        let channel = channel.into();
        let payload = payload.into();

        let (kind, database, subject) = match parse_channel(&channel) {
            Some((class, database, subject)) => {
                let kind = match class {
                    "space" => NotificationKind::Keyspace,
                    "event" => NotificationKind::Keyevent,
                    _ => NotificationKind::Other,
                };
                (kind, Some(database), Some(subject.to_string()))
            }
            None => (NotificationKind::Other, None, None),
        };

        let (key, event) = match kind {
            NotificationKind::Keyspace => (subject, Some(payload.clone())),
            NotificationKind::Keyevent => (Some(payload.clone()), subject),
            NotificationKind::Other => (None, None),
        };

        Self {
            pattern,
            channel,
            payload,
            kind,
            database,
            key,
            event,
        }
    }
}

/// Split `__key<class>@<db>__:<subject>` into its parts
fn parse_channel(channel: &str) -> Option<(&str, u32, &str)> {
    let rest = channel.strip_prefix("__key")?;
    let (class, rest) = rest.split_once('@')?;
    let (database, subject) = rest.split_once("__:")?;
    let database = database.parse().ok()?;
    Some((class, database, subject))
}

/// Pattern -> handler map, populated before the dispatch loop starts
#[derive(Default, Clone)]
pub struct NotificationRegistry {
    rules: BTreeMap<String, NotificationHandler>,
}

impl NotificationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for its pattern; a later registration of the same
    /// pattern replaces the earlier handler. Returns the pattern.
    pub fn register(
        &mut self,
        class: &str,
        database: u32,
        prefix: &str,
        handler: NotificationHandler,
    ) -> String {
        let pattern = notification_pattern(class, database, prefix);
        if self.rules.insert(pattern.clone(), handler).is_some() {
            debug!(pattern = %pattern, "Replacing notification handler");
        }
        pattern
    }

    pub fn get(&self, pattern: &str) -> Option<&NotificationHandler> {
        self.rules.get(pattern)
    }

    /// Registered patterns in subscription order
    pub fn patterns(&self) -> Vec<String> {
        self.rules.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl fmt::Debug for NotificationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationRegistry")
            .field("patterns", &self.rules.keys().collect::<Vec<_>>())
            .finish()
    }
}
