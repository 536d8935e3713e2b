//! This is a library for keeping a client's local view of server state consistent while the
//! server pushes changes and the user makes changes of their own.
//! It was created for the storefront client, so it doesn't include much that was not needed for that project.
//!
//! Syncing strategy:
//! 1. Each logical channel (for example "commerce events" or "chat") gets one persistent duplex connection,
//!    owned by a [`connection::ConnectionManager`]. It authenticates with the session token, and reconnects with
//!    exponential backoff when the transport drops.
//! 2. Inbound frames are decoded into a typed event enum and fanned out by the channel's [`router::EventRouter`]
//!    to whoever subscribed to that event's topic.
//! 3. Entity state lives in a [`cache::CacheStore`], which survives reloads and is readable synchronously for the first paint.
//! 4. User actions go through a [`mutation::MutationController`]:
//!   1. The change is applied to the cache immediately and marked as pending.
//!   2. When the REST call resolves, the change is either confirmed (optionally replaced by the server's copy) or rolled back.
//!   3. Push events for a key with a pending mutation are held back until the mutation resolves, so the two never race.
//!
//! Sounds simple, but there are a few tricky parts that this library handles.

pub mod cache;
mod config;
pub mod connection;
pub mod mutation;
pub mod router;
pub mod runtime;
pub mod storage;
pub mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

use std::{fmt, hash::Hash};

pub use config::{RetryPolicy, SyncConfig};

/// Names one logical connection, such as the commerce events channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize)]
pub struct ChannelId(pub &'static str);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// An event carried over a channel.
///
/// Every channel has a closed set of topics, and each topic carries one payload shape,
/// so implementors are usually an adjacently tagged enum.
pub trait ChannelEvent: serde::Serialize + serde::de::DeserializeOwned + Clone + 'static {
    type Topic: Copy + Eq + Hash + fmt::Debug + 'static;

    fn topic(&self) -> Self::Topic;

    fn decode(frame: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(frame)
    }

    fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// A cached domain entity, such as a cart or a balance.
///
/// `Default` is what a mutation starts from when nothing is cached for the key yet.
pub trait Entity:
    Clone + PartialEq + Default + fmt::Debug + serde::Serialize + serde::de::DeserializeOwned + 'static
{
    /// Namespaces cache keys, e.g. `"cart"`.
    const KIND: &'static str;
}
