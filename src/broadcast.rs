//! Cross-context replication of a [`CacheStore`].
//!
//! A [`BroadcastQuery`] attaches to an existing store and mirrors it to every
//! other store attached to the same named channel. The protocol has two
//! messages, encoded as JSON:
//!
//! - `{"type":"GET"}` asks peers for their current cache.
//! - `{"type":"SET","value":{..}}` carries a full cache snapshot, merged into
//!   the receiving store with the peer winning on overlapping keys.
//!
//! Every local write to the store results in one outgoing `SET`. Writes that
//! were themselves applied from an incoming `SET` are not sent back out.
//!
//! Channels are provided by a [`Transport`]. [`BroadcastHub`] is an
//! in-process implementation over `tokio::sync::broadcast`; other transports
//! (sockets, IPC) only need to move strings around.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::QueryError;
use crate::key::{QueryKey, QueryValue};
use crate::signal::Subscription;
use crate::state::QueryState;
use crate::store::{CacheStore, WeakCacheStore};

/// Messages exchanged between synchronized stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum BroadcastMessage<K, D, E>
where
    K: Eq + Hash,
{
    /// Request the receiver's full cache.
    Get,
    /// A full cache snapshot.
    Set {
        value: HashMap<K, QueryState<D, E>>,
    },
}

impl<K, D, E> BroadcastMessage<K, D, E>
where
    K: Eq + Hash + Serialize,
    D: Serialize,
    E: Serialize,
{
    /// Encode as JSON.
    pub fn encode(&self) -> Result<String, QueryError> {
        serde_json::to_string(self).map_err(QueryError::Encode)
    }
}

impl<K, D, E> BroadcastMessage<K, D, E>
where
    K: Eq + Hash + DeserializeOwned,
    D: DeserializeOwned,
    E: DeserializeOwned,
{
    /// Decode from JSON.
    pub fn decode(raw: &str) -> Result<Self, QueryError> {
        serde_json::from_str(raw).map_err(QueryError::Decode)
    }
}

/// A named publish/subscribe endpoint.
///
/// An endpoint must not receive what it posted itself.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Name of the channel, for logging.
    fn name(&self) -> &str;

    /// Send a message to every other endpoint on the channel.
    fn post(&self, message: String) -> Result<(), QueryError>;

    /// Next message from another endpoint, or `None` once the channel is gone.
    async fn recv(&self) -> Option<String>;
}

/// Default number of undelivered messages a hub channel buffers per endpoint.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct Envelope {
    origin: u64,
    payload: Arc<str>,
}

/// In-process registry of named channels.
///
/// This is cheap to clone - clones share the same channels.
#[derive(Clone)]
pub struct BroadcastHub {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<Envelope>>>>,
    next_endpoint: Arc<AtomicU64>,
    capacity: usize,
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastHub {
    /// Create a hub with [`DEFAULT_CHANNEL_CAPACITY`].
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a hub whose channels buffer `capacity` messages per endpoint.
    ///
    /// # Panics
    ///
    /// If `capacity` is zero.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "broadcast capacity must be positive");
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            next_endpoint: Arc::new(AtomicU64::new(0)),
            capacity,
        }
    }

    /// Open a new endpoint on channel `name`, creating the channel if needed.
    pub fn open(&self, name: impl Into<String>) -> HubChannel {
        let name = name.into();
        let sender = self
            .channels
            .lock()
            .entry(name.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone();
        let receiver = sender.subscribe();
        let id = self.next_endpoint.fetch_add(1, Ordering::Relaxed);
        trace!(channel = %name, endpoint = id, "opened hub endpoint");
        HubChannel {
            id,
            name,
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
        }
    }

    /// Number of open endpoints on channel `name`.
    pub fn endpoint_count(&self, name: &str) -> usize {
        self.channels
            .lock()
            .get(name)
            .map_or(0, broadcast::Sender::receiver_count)
    }
}

/// One endpoint of a [`BroadcastHub`] channel.
pub struct HubChannel {
    id: u64,
    name: String,
    sender: broadcast::Sender<Envelope>,
    receiver: tokio::sync::Mutex<broadcast::Receiver<Envelope>>,
}

#[async_trait]
impl Transport for HubChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn post(&self, message: String) -> Result<(), QueryError> {
        let envelope = Envelope {
            origin: self.id,
            payload: message.into(),
        };
        self.sender
            .send(envelope)
            .map(|_| ())
            .map_err(|_| QueryError::ChannelClosed(self.name.clone()))
    }

    async fn recv(&self) -> Option<String> {
        let mut receiver = self.receiver.lock().await;
        loop {
            match receiver.recv().await {
                Ok(envelope) if envelope.origin == self.id => continue,
                Ok(envelope) => return Some(envelope.payload.to_string()),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(channel = %self.name, skipped, "broadcast endpoint lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

/// Configuration for [`BroadcastQuery::join`].
#[derive(Debug, Clone)]
pub struct BroadcastOptions {
    /// Channel name shared by every store to keep in sync.
    pub channel: String,
    /// Ask peers for their cache right away. Defaults to `true`.
    pub initialize: bool,
}

impl BroadcastOptions {
    /// Options for channel `channel`, asking peers for their cache on join.
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            initialize: true,
        }
    }

    /// Whether to post a `GET` when joining.
    pub fn initialize(mut self, initialize: bool) -> Self {
        self.initialize = initialize;
        self
    }
}

/// Thread currently applying an incoming snapshot. The store notifies
/// subscribers synchronously on the writing thread, so every notification
/// seen on that thread until the merge returns stems from the incoming write.
/// That includes writes other subscribers make in reaction to it; those go
/// out with the next local write's snapshot.
type Applying = Arc<Mutex<Option<ThreadId>>>;

/// Keeps a [`CacheStore`] in sync with its peers on one channel.
///
/// Replication stops when this is closed or dropped.
pub struct BroadcastQuery {
    channel: String,
    task: Option<JoinHandle<()>>,
    subscription: Option<Subscription>,
}

impl BroadcastQuery {
    /// Open `options.channel` on `hub` and start synchronizing `store` over it.
    pub fn join<K, D, E>(
        store: &CacheStore<K, D, E>,
        hub: &BroadcastHub,
        options: BroadcastOptions,
    ) -> Result<Self, QueryError>
    where
        K: QueryKey + Serialize + DeserializeOwned,
        D: QueryValue + Serialize + DeserializeOwned,
        E: QueryValue + Serialize + DeserializeOwned,
    {
        Self::start(store, hub.open(options.channel), options.initialize)
    }

    /// Start synchronizing `store` over `transport`.
    ///
    /// If `initialize` is set, a `GET` is posted so that already running peers
    /// send their cache.
    ///
    /// # Errors
    ///
    /// [`QueryError::NoRuntime`] outside a tokio runtime, or the transport's
    /// error if the initial `GET` cannot be posted.
    pub fn start<K, D, E, T>(
        store: &CacheStore<K, D, E>,
        transport: T,
        initialize: bool,
    ) -> Result<Self, QueryError>
    where
        K: QueryKey + Serialize + DeserializeOwned,
        D: QueryValue + Serialize + DeserializeOwned,
        E: QueryValue + Serialize + DeserializeOwned,
        T: Transport,
    {
        let handle = Handle::try_current().map_err(|_| QueryError::NoRuntime)?;
        let transport: Arc<dyn Transport> = Arc::new(transport);
        let channel = transport.name().to_string();
        let applying = Applying::default();

        let subscription = store.subscribe({
            let store = store.downgrade();
            let transport = transport.clone();
            let applying = applying.clone();
            move || {
                if *applying.lock() == Some(thread::current().id()) {
                    trace!(channel = %transport.name(), "not echoing peer snapshot");
                    return;
                }
                if let Some(store) = store.upgrade() {
                    send_snapshot(&*transport, &store);
                }
            }
        });

        let task = handle.spawn(receive_loop(store.downgrade(), transport.clone(), applying));

        if initialize {
            debug!(channel = %channel, "requesting peer caches");
            if let Err(error) = BroadcastMessage::<K, D, E>::Get
                .encode()
                .and_then(|message| transport.post(message))
            {
                task.abort();
                return Err(error);
            }
        }

        Ok(Self {
            channel,
            task: Some(task),
            subscription: Some(subscription),
        })
    }

    /// Name of the channel this is synchronizing over.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Returns true once the receive loop has ended or was closed.
    pub fn is_closed(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Stop replicating. Local writes are no longer sent and incoming
    /// messages are no longer applied.
    pub fn close(&mut self) {
        self.subscription.take();
        if let Some(task) = self.task.take() {
            task.abort();
            debug!(channel = %self.channel, "broadcast closed");
        }
    }
}

impl Drop for BroadcastQuery {
    fn drop(&mut self) {
        self.close();
    }
}

fn send_snapshot<K, D, E>(transport: &dyn Transport, store: &CacheStore<K, D, E>)
where
    K: QueryKey + Serialize,
    D: QueryValue + Serialize,
    E: QueryValue + Serialize,
{
    let message = BroadcastMessage::Set {
        value: store.snapshot(),
    };
    let result = message.encode().and_then(|raw| transport.post(raw));
    match result {
        Ok(()) => trace!(channel = %transport.name(), "sent cache snapshot"),
        Err(error) => warn!(channel = %transport.name(), %error, "failed to send cache snapshot"),
    }
}

async fn receive_loop<K, D, E>(
    store: WeakCacheStore<K, D, E>,
    transport: Arc<dyn Transport>,
    applying: Applying,
) where
    K: QueryKey + Serialize + DeserializeOwned,
    D: QueryValue + Serialize + DeserializeOwned,
    E: QueryValue + Serialize + DeserializeOwned,
{
    while let Some(raw) = transport.recv().await {
        let Some(store) = store.upgrade() else {
            break;
        };
        match BroadcastMessage::<K, D, E>::decode(&raw) {
            Ok(BroadcastMessage::Get) => {
                debug!(channel = %transport.name(), "peer requested cache");
                send_snapshot(&*transport, &store);
            }
            Ok(BroadcastMessage::Set { value }) => {
                debug!(channel = %transport.name(), entries = value.len(), "applying peer cache");
                *applying.lock() = Some(thread::current().id());
                store.merge(value);
                *applying.lock() = None;
            }
            Err(error) => {
                warn!(channel = %transport.name(), %error, "dropping undecodable broadcast message");
            }
        }
    }
    debug!(channel = %transport.name(), "broadcast receive loop ended");
}
