//! Collaborator contracts: where connection parameters come from and how a
//! channel is opened, observed and released.

use std::collections::BTreeMap;
use std::fmt::Display;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use url::Url;

use super::config::ChannelOptions;
use super::manager::Command;

/// Everything needed to open a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionParams {
    /// Scheme + host (+ port), e.g. `wss://api.example.com`
    pub endpoint: String,
    /// Path of the channel on the endpoint, e.g. `/ws`
    pub path: String,
    #[serde(default)]
    pub query: BTreeMap<String, Value>,
}

impl ConnectionParams {
    pub fn new(endpoint: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            path: path.into(),
            query: BTreeMap::new(),
        }
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    /// Full channel URL. String query values are used verbatim, everything
    /// else in its JSON form.
    pub fn url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.endpoint)
            .with_context(|| format!("invalid endpoint {:?}", self.endpoint))?;
        if !self.path.is_empty() {
            url.set_path(&self.path);
        }
        if !self.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &self.query {
                match value {
                    Value::String(s) => pairs.append_pair(key, s),
                    other => pairs.append_pair(key, &other.to_string()),
                };
            }
        }
        Ok(url)
    }
}

/// Supplies connection parameters, e.g. after authenticating or discovering
/// the endpoint. A failure counts as a failed connect.
#[async_trait]
pub trait ConnectionResolver: Send + Sync + 'static {
    async fn resolve(&self) -> Result<ConnectionParams>;
}

/// Resolver for deployments with fixed parameters
#[derive(Debug, Clone)]
pub struct StaticResolver {
    params: ConnectionParams,
}

impl StaticResolver {
    pub fn new(params: ConnectionParams) -> Self {
        Self { params }
    }
}

#[async_trait]
impl ConnectionResolver for StaticResolver {
    async fn resolve(&self) -> Result<ConnectionParams> {
        Ok(self.params.clone())
    }
}

/// Opens channels. Must not block: the open request is issued and the outcome
/// is reported later through the listener.
pub trait ChannelFactory: Send + Sync + 'static {
    fn open(
        &self,
        params: &ConnectionParams,
        options: &ChannelOptions,
        listener: ChannelListener,
    ) -> Result<Box<dyn ChannelHandle>>;
}

/// A live channel owned by the manager.
///
/// The manager releases a handle by calling all three methods in order
/// (`remove_all_listeners`, `off_any`, `disconnect`); each step is attempted
/// even if an earlier one failed.
pub trait ChannelHandle: Send {
    /// Detach the lifecycle listener; no event may be delivered afterwards
    fn remove_all_listeners(&mut self) -> Result<()>;
    /// Detach catch-all message listeners
    fn off_any(&mut self) -> Result<()>;
    /// Request the transport-level disconnect
    fn disconnect(&mut self) -> Result<()>;
}

/// Lifecycle event reported by a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Opened,
    /// The open attempt failed; a `Closed` is expected to follow
    OpenFailed(String),
    Closed(String),
    /// The transport engine dropped underneath an open channel
    EngineClosed(String),
}

/// Event sink handed to the factory for one channel.
///
/// Tagged with the channel id, so events from a channel the manager has
/// already released are ignored even if the transport keeps emitting.
#[derive(Debug, Clone)]
pub struct ChannelListener {
    channel_id: u64,
    queue: mpsc::UnboundedSender<Command>,
}

impl ChannelListener {
    pub(crate) fn new(channel_id: u64, queue: mpsc::UnboundedSender<Command>) -> Self {
        Self { channel_id, queue }
    }

    pub fn channel_id(&self) -> u64 {
        self.channel_id
    }

    /// Deliver an event. Returns false once the manager is gone.
    pub fn emit(&self, event: ChannelEvent) -> bool {
        self.queue
            .send(Command::Channel {
                channel_id: self.channel_id,
                event,
            })
            .is_ok()
    }

    pub fn opened(&self) -> bool {
        self.emit(ChannelEvent::Opened)
    }

    pub fn open_failed(&self, error: impl Display) -> bool {
        self.emit(ChannelEvent::OpenFailed(error.to_string()))
    }

    pub fn closed(&self, reason: impl Into<String>) -> bool {
        self.emit(ChannelEvent::Closed(reason.into()))
    }

    pub fn engine_closed(&self, reason: impl Into<String>) -> bool {
        self.emit(ChannelEvent::EngineClosed(reason.into()))
    }
}
