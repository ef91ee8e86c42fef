//! Background task that consumes the child's stdout

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{broadcast, mpsc};

use super::framing::{decode_line, Frame};
use super::registry::{CorrelationRegistry, DispatchOutcome};
use super::ChannelEvent;

/// Everything one reader instance needs, bound to a single process generation
pub(crate) struct ReaderContext {
    /// Generation this reader serves
    pub generation: u64,

    /// Generation currently owned by the channel, 0 when none is live
    pub current: Arc<AtomicU64>,

    pub registry: Arc<CorrelationRegistry>,

    pub events: broadcast::Sender<ChannelEvent>,

    /// Broadcast passthrough lines
    pub echo_output: bool,

    /// Sleep between retries after a failed read
    pub backoff: Duration,
}

impl ReaderContext {
    fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.generation
    }

    fn handle_line(&self, line: &str) {
        let frame = match decode_line(line) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Dropping undecodable line: {} - {}", e, line.trim_end());
                return;
            }
        };

        match frame {
            Frame::Passthrough(text) => {
                tracing::debug!("[child {}] {}", self.generation, text);
                if self.echo_output {
                    let _ = self.events.send(ChannelEvent::Output {
                        generation: self.generation,
                        line: text,
                    });
                }
            }
            Frame::Heartbeat => {
                tracing::trace!("Heartbeat from generation {}", self.generation);
            }
            Frame::Response(response) => {
                let id = response.id().to_string();
                match self.registry.dispatch(response) {
                    DispatchOutcome::Delivered | DispatchOutcome::Suppressed => {}
                    DispatchOutcome::Orphan => {
                        tracing::debug!("Dropping reply with no pending call: {:?}", id);
                    }
                    DispatchOutcome::HandlerPanicked => {
                        tracing::error!("Handler for call {} panicked", id);
                    }
                    DispatchOutcome::Unhandled(message) => {
                        tracing::error!("Unhandled remote error for call {:?}: {}", id, message);
                        let _ = self.events.send(ChannelEvent::UnhandledError { id, message });
                    }
                }
            }
        }
    }
}

/// Read lines until EOF, shutdown, or a newer generation takes over
pub(crate) async fn run<R>(stdout: R, ctx: ReaderContext, mut shutdown_rx: mpsc::Receiver<()>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();

    tracing::debug!("Reader started for generation {}", ctx.generation);

    while ctx.is_current() {
        buf.clear();
        tokio::select! {
            // Resolves on an explicit signal or when the process slot drops the sender
            _ = shutdown_rx.recv() => {
                tracing::debug!("Reader for generation {} received shutdown signal", ctx.generation);
                break;
            }
            read = reader.read_until(b'\n', &mut buf) => {
                match read {
                    Ok(0) => {
                        tracing::info!("Child stdout closed (EOF), generation {}", ctx.generation);
                        // No reply can arrive any more; waiting callers see the channel close
                        if ctx.is_current() {
                            let dropped = ctx.registry.clear();
                            if dropped > 0 {
                                tracing::debug!("Dropped {} pending calls after EOF", dropped);
                            }
                        }
                        let _ = ctx.events.send(ChannelEvent::Disconnected {
                            generation: ctx.generation,
                        });
                        break;
                    }
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf);
                        ctx.handle_line(&line);
                    }
                    Err(e) => {
                        tracing::warn!("Error reading child stdout: {}", e);
                        if !ctx.is_current() {
                            break;
                        }
                        tokio::time::sleep(ctx.backoff).await;
                    }
                }
            }
        }
    }

    tracing::info!("Reader for generation {} has exited", ctx.generation);
}
