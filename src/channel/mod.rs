//! Host side of the stdio channel
//!
//! `IpcChannel` drives one long-lived child process through its stdin/stdout
//! and offers three call styles over the same line protocol:
//!
//! - [`IpcChannel::notify`]: fire-and-forget
//! - [`IpcChannel::request`]: callback-based, never waits for the reply
//! - [`IpcChannel::get`]: waits for the reply, an error, or a timeout
//!
//! ```ignore
//! use pipecall::{ChannelConfig, IpcChannel};
//! use serde_json::json;
//!
//! let channel = IpcChannel::new(ChannelConfig::new("/opt/tools/helper"));
//! channel.start()?;
//! let reply = channel.get("ping", json!({})).await?;
//! channel.stop();
//! ```

pub mod framing;
mod process;
mod reader;
pub mod registry;

use std::sync::Arc;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::broadcast;

use crate::config::ChannelConfig;
use crate::{Error, Result};

use framing::{encode_call, into_payload, Payload};
use process::{Liveness, ProcessSupervisor};
use reader::ReaderContext;
use registry::{CallHandler, CorrelationRegistry, ReplySlot};

const EVENT_CAPACITY: usize = 256;

/// Lifecycle and diagnostic events published by a channel
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ChannelEvent {
    /// A new process generation is running
    Started { pid: u32, generation: u64 },
    /// A line the child printed without the protocol prefix
    Output { generation: u64, line: String },
    /// The child reported an error that no handler marked as handled
    UnhandledError { id: String, message: String },
    /// The generation was stopped, killed, or found dead
    Stopped { generation: u64 },
    /// The child closed its stdout
    Disconnected { generation: u64 },
}

struct Inner {
    config: Arc<ChannelConfig>,
    registry: Arc<CorrelationRegistry>,
    supervisor: ProcessSupervisor,
    events: broadcast::Sender<ChannelEvent>,
}

/// Host-side handle to a child process speaking the line protocol.
///
/// Cloning is cheap; all clones share the same child and pending calls.
#[derive(Clone)]
pub struct IpcChannel {
    inner: Arc<Inner>,
}

impl IpcChannel {
    pub fn new(config: ChannelConfig) -> Self {
        let config = Arc::new(config);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                supervisor: ProcessSupervisor::new(config.clone()),
                registry: Arc::new(CorrelationRegistry::new()),
                config,
                events,
            }),
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    /// Spawn the child and its reader.
    ///
    /// Returns `Ok(false)` without doing anything if a child is already alive.
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) -> Result<bool> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Spawn(format!("No Tokio runtime: {}", e)))?;
        let inner = &self.inner;

        let started = inner.supervisor.spawn(|spawned| {
            let stale = inner.registry.clear();
            if stale > 0 {
                tracing::debug!("Discarded {} pending calls from a previous process", stale);
            }

            let ctx = ReaderContext {
                generation: spawned.generation,
                current: inner.supervisor.current_token(),
                registry: inner.registry.clone(),
                events: inner.events.clone(),
                echo_output: inner.config.echo_output,
                backoff: inner.config.loop_interval() * 2,
            };
            runtime.spawn(reader::run(spawned.stdout, ctx, spawned.shutdown_rx));

            (spawned.pid, spawned.generation)
        })?;

        match started {
            Some((pid, generation)) => {
                let _ = inner.events.send(ChannelEvent::Started { pid, generation });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Ask the child to terminate and release it. Does not wait for exit.
    pub fn stop(&self) {
        if let Some(generation) = self.inner.supervisor.stop() {
            self.retire(generation);
        }
    }

    /// Kill the child and release it
    pub fn kill(&self) {
        if let Some(generation) = self.inner.supervisor.kill() {
            self.retire(generation);
        }
    }

    /// Stop the current child (if any) and start a new generation
    pub fn restart(&self) -> Result<bool> {
        self.stop();
        self.start()
    }

    pub fn is_alive(&self) -> bool {
        match self.inner.supervisor.poll() {
            Liveness::Alive(_) => true,
            Liveness::Reclaimed(generation) => {
                self.retire(generation);
                false
            }
            Liveness::Idle => false,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.supervisor.pid()
    }

    /// Number of process generations started by this channel
    pub fn generation(&self) -> u64 {
        self.inner.supervisor.generations()
    }

    /// Calls still waiting for a reply
    pub fn pending_calls(&self) -> usize {
        self.inner.registry.len()
    }

    /// Subscribe to lifecycle and passthrough output events
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.inner.events.subscribe()
    }

    /// Send a call. With a handler, its reply is routed to the handler on the
    /// reader task; without one the call is fire-and-forget.
    pub async fn request(
        &self,
        call: &str,
        args: JsonValue,
        handler: Option<Box<dyn CallHandler>>,
    ) -> Result<()> {
        self.send(call, args, handler).await.map(|_| ())
    }

    /// Fire-and-forget call
    pub async fn notify(&self, call: &str, args: JsonValue) -> Result<()> {
        self.send(call, args, None).await.map(|_| ())
    }

    /// Send a call and wait for its reply, using the configured default timeout
    pub async fn get(&self, call: &str, args: JsonValue) -> Result<Payload> {
        self.get_with_timeout(call, args, self.inner.config.default_timeout())
            .await
    }

    /// Send a call and wait for its reply. `None` waits forever.
    ///
    /// On timeout the pending entry is removed, so a late reply is dropped as
    /// an orphan.
    pub async fn get_with_timeout(
        &self,
        call: &str,
        args: JsonValue,
        timeout: Option<Duration>,
    ) -> Result<Payload> {
        let (slot, rx) = ReplySlot::new();
        let id = self.send(call, args, Some(Box::new(slot))).await?;

        let reply = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    self.inner.registry.forget(&id);
                    tracing::debug!("Call {} ({}) timed out after {:?}", call, id, limit);
                    return Err(Error::Timeout(limit));
                }
            },
            None => rx.await,
        };

        match reply {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(message)) => Err(Error::Remote(message)),
            Err(_) => Err(Error::ChannelClosed),
        }
    }

    /// Typed wrapper over [`IpcChannel::get`]
    pub async fn call<T, R>(&self, call: &str, params: T) -> Result<R>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let args = serde_json::to_value(params)?;
        let data = self.get(call, args).await?;
        serde_json::from_value(JsonValue::Object(data)).map_err(Error::Json)
    }

    /// A generation ended: its pending calls can never be answered
    fn retire(&self, generation: u64) {
        let dropped = self.inner.registry.clear();
        if dropped > 0 {
            tracing::debug!(
                "Dropped {} pending calls of generation {}",
                dropped,
                generation
            );
        }
        let _ = self.inner.events.send(ChannelEvent::Stopped { generation });
    }

    /// Register the handler, then write the line. Returns the call id.
    async fn send(
        &self,
        call: &str,
        args: JsonValue,
        handler: Option<Box<dyn CallHandler>>,
    ) -> Result<String> {
        if !self.is_alive() {
            return Err(Error::NotRunning);
        }
        let data = into_payload(args)?;

        // Registered before writing so a fast reply always finds its handler
        let id = self.inner.registry.reserve(handler);
        let line = match encode_call(call, &id, &data) {
            Ok(line) => line,
            Err(e) => {
                self.inner.registry.forget(&id);
                return Err(e);
            }
        };

        if let Err(e) = self.inner.supervisor.write_line(&line).await {
            self.inner.registry.forget(&id);
            return Err(e);
        }
        Ok(id)
    }
}
