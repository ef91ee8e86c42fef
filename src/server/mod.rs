//! Child side of the stdio channel
//!
//! A Rust child process uses [`IpcServer`] to answer calls from its host:
//! register a handler per call name, then run the server over stdin/stdout.
//!
//! ```ignore
//! use pipecall::server::IpcServer;
//!
//! let mut server = IpcServer::new();
//! server.register("ping", |_data, _outbox| async {
//!     Ok::<_, String>(serde_json::json!({"pong": true}).as_object().cloned().unwrap_or_default())
//! });
//! server.run_stdio().await?;
//! ```

mod parent;

pub use parent::{parent_alive, parent_pid_from_args};

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::channel::framing::{
    decode_request, encode_data, encode_error, encode_heartbeat, Payload,
};
use crate::Result;

type HandlerFuture = Pin<Box<dyn Future<Output = std::result::Result<Payload, String>> + Send>>;
type Handler = Arc<dyn Fn(Payload, Outbox) -> HandlerFuture + Send + Sync>;

const DEFAULT_PARENT_CHECK: Duration = Duration::from_millis(500);
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Shared writer for everything the child sends to its host.
///
/// Every write is a whole line under one lock, so replies from concurrent
/// handlers never interleave.
#[derive(Clone)]
pub struct Outbox {
    writer: Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>,
}

impl Outbox {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            writer: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    async fn write_line(&self, line: &str) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Send the reply for call `id`
    pub async fn reply(
        &self,
        id: &str,
        result: std::result::Result<Payload, String>,
    ) -> Result<()> {
        let line = match result {
            Ok(data) => encode_data(id, &data)?,
            Err(error) => encode_error(id, &error)?,
        };
        self.write_line(&line).await
    }

    pub async fn heartbeat(&self) -> Result<()> {
        self.write_line(&encode_heartbeat()).await
    }

    /// Print a non-protocol line, the way diagnostics reach the host
    pub async fn print(&self, text: &str) -> Result<()> {
        let mut line = text.replace(['\r', '\n'], " ");
        line.push('\n');
        self.write_line(&line).await
    }
}

/// Dispatches host calls to registered handlers
pub struct IpcServer {
    handlers: HashMap<String, Handler>,

    /// Emit a heartbeat this often while idle or busy
    heartbeat_interval: Option<Duration>,

    /// Exit when this process disappears
    parent_pid: Option<u32>,

    parent_check_interval: Duration,
}

impl IpcServer {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            heartbeat_interval: None,
            parent_pid: None,
            parent_check_interval: DEFAULT_PARENT_CHECK,
        }
    }

    /// Register the handler for `call`, replacing any previous one
    pub fn register<F, Fut>(&mut self, call: &str, handler: F) -> &mut Self
    where
        F: Fn(Payload, Outbox) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Payload, String>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |data: Payload, outbox: Outbox| -> HandlerFuture {
            Box::pin(handler(data, outbox))
        });
        self.handlers.insert(call.to_string(), handler);
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval.max(MIN_INTERVAL));
        self
    }

    /// Watch `pid` and stop serving once it exits. `None` disables the check.
    pub fn watch_parent(mut self, pid: Option<u32>) -> Self {
        self.parent_pid = pid;
        self
    }

    pub fn with_parent_check_interval(mut self, interval: Duration) -> Self {
        self.parent_check_interval = interval.max(MIN_INTERVAL);
        self
    }

    pub fn handles(&self, call: &str) -> bool {
        self.handlers.contains_key(call)
    }

    /// Serve on this process's stdin and stdout
    pub async fn run_stdio(self) -> Result<()> {
        self.run(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Serve until `input` reaches EOF or the watched parent exits.
    ///
    /// Each call runs on its own task, so replies may come back out of order.
    pub async fn run<R, W>(self, input: R, output: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let outbox = Outbox::new(output);
        let mut lines = BufReader::new(input).lines();

        let heartbeat_period = self.heartbeat_interval.unwrap_or(Duration::from_secs(3600));
        let mut heartbeat = interval_at(Instant::now() + heartbeat_period, heartbeat_period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut parent_check = interval_at(
            Instant::now() + self.parent_check_interval,
            self.parent_check_interval,
        );
        parent_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!("Serving {} handlers", self.handlers.len());

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => self.dispatch(&line, &outbox),
                        Ok(None) => {
                            tracing::info!("Host closed stdin (EOF)");
                            break;
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                            tracing::warn!("Skipping non UTF-8 input: {}", e);
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                _ = heartbeat.tick(), if self.heartbeat_interval.is_some() => {
                    outbox.heartbeat().await?;
                }
                _ = parent_check.tick(), if self.parent_pid.is_some() => {
                    if let Some(pid) = self.parent_pid {
                        if !parent_alive(pid) {
                            tracing::warn!("Parent process {} is gone, exiting", pid);
                            break;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn dispatch(&self, line: &str, outbox: &Outbox) {
        let Some(request) = decode_request(line) else {
            tracing::debug!("Ignoring non-protocol input: {}", line);
            return;
        };

        let handler = self.handlers.get(&request.call).cloned();
        let outbox = outbox.clone();
        tokio::spawn(async move {
            let result = match handler {
                Some(handler) => {
                    // Run on its own task so a panic becomes an error reply
                    let data = request.data;
                    let handler_outbox = outbox.clone();
                    let task = tokio::spawn(async move { handler(data, handler_outbox).await });
                    match task.await {
                        Ok(result) => result,
                        Err(e) if e.is_panic() => {
                            let message = panic_message(e.into_panic());
                            tracing::error!("Handler for {} panicked: {}", request.call, message);
                            Err(message)
                        }
                        Err(e) => Err(e.to_string()),
                    }
                }
                None => Err(format!("No handler: {}", request.call)),
            };
            if let Err(e) = outbox.reply(&request.id, result).await {
                tracing::warn!("Failed to reply to {} ({}): {}", request.call, request.id, e);
            }
        });
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "Handler panicked".to_string()
    }
}

impl Default for IpcServer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::framing::{decode_line, encode_call, Frame, Response};
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, DuplexStream};
    use tokio::time::timeout;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap_or_default()
    }

    fn test_server() -> IpcServer {
        let mut server = IpcServer::new();
        server
            .register("echo", |data, _| async move { Ok::<_, String>(data) })
            .register("fail", |_, _| async { Err::<Payload, _>("boom".to_string()) })
            .register("slow", |data, _| async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, String>(data)
            });
        server
    }

    struct Session {
        host_in: DuplexStream,
        host_out: tokio::io::Lines<BufReader<DuplexStream>>,
        task: tokio::task::JoinHandle<Result<()>>,
    }

    fn serve(server: IpcServer) -> Session {
        let (host_in, child_in) = tokio::io::duplex(4096);
        let (child_out, host_out) = tokio::io::duplex(4096);
        let task = tokio::spawn(server.run(child_in, child_out));
        Session {
            host_in,
            host_out: BufReader::new(host_out).lines(),
            task,
        }
    }

    async fn next_frame(session: &mut Session) -> Frame {
        let line = timeout(TEST_TIMEOUT, session.host_out.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        decode_line(&line).unwrap()
    }

    async fn send(session: &mut Session, call: &str, id: &str, data: serde_json::Value) {
        let line = encode_call(call, id, &payload(data)).unwrap();
        session.host_in.write_all(line.as_bytes()).await.unwrap();
    }

    #[tokio::test]
    async fn test_replies_with_data_and_errors() {
        let mut session = serve(test_server());

        send(&mut session, "echo", "1", json!({"x": 1})).await;
        assert_eq!(
            next_frame(&mut session).await,
            Frame::Response(Response::Data {
                id: "1".to_string(),
                data: payload(json!({"x": 1})),
            })
        );

        send(&mut session, "fail", "2", json!({})).await;
        assert_eq!(
            next_frame(&mut session).await,
            Frame::Response(Response::Error {
                id: "2".to_string(),
                message: "boom".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_unknown_call_gets_no_handler_error() {
        let mut session = serve(test_server());
        send(&mut session, "nope", "9", json!({})).await;
        assert_eq!(
            next_frame(&mut session).await,
            Frame::Response(Response::Error {
                id: "9".to_string(),
                message: "No handler: nope".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_ignores_noise_and_serves_concurrently() {
        let mut session = serve(test_server());
        session
            .host_in
            .write_all(b"not protocol\nPYIPCHEAD_{oops\n")
            .await
            .unwrap();
        send(&mut session, "slow", "a", json!({"tag": "a"})).await;
        send(&mut session, "echo", "b", json!({"tag": "b"})).await;

        // The fast call overtakes the slow one
        let first = next_frame(&mut session).await;
        let second = next_frame(&mut session).await;
        assert!(matches!(first, Frame::Response(ref r) if r.id() == "b"));
        assert!(matches!(second, Frame::Response(ref r) if r.id() == "a"));
    }

    #[tokio::test]
    async fn test_panicking_handler_replies_with_error() {
        let mut server = test_server();
        server.register("explode", |data, _| async move {
            if data.is_empty() {
                panic!("handler bug");
            }
            Ok::<_, String>(data)
        });
        let mut session = serve(server);

        send(&mut session, "explode", "1", json!({})).await;
        assert_eq!(
            next_frame(&mut session).await,
            Frame::Response(Response::Error {
                id: "1".to_string(),
                message: "handler bug".to_string(),
            })
        );

        // The server keeps serving after the panic
        send(&mut session, "echo", "2", json!({"x": 2})).await;
        assert!(matches!(next_frame(&mut session).await, Frame::Response(ref r) if r.id() == "2"));
    }

    #[tokio::test]
    async fn test_exits_on_eof() {
        let session = serve(test_server());
        drop(session.host_in);
        timeout(TEST_TIMEOUT, session.task).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_emits_heartbeats() {
        let mut session = serve(test_server().with_heartbeat(Duration::from_millis(20)));
        assert_eq!(next_frame(&mut session).await, Frame::Heartbeat);
    }

    #[tokio::test]
    async fn test_handler_can_print_and_beat() {
        let mut server = IpcServer::new();
        server.register("chatty", |_, outbox| async move {
            outbox.print("working\non it").await.map_err(|e| e.to_string())?;
            outbox.heartbeat().await.map_err(|e| e.to_string())?;
            Ok::<_, String>(Payload::new())
        });
        let mut session = serve(server);

        send(&mut session, "chatty", "c", json!({})).await;
        assert_eq!(
            next_frame(&mut session).await,
            Frame::Passthrough("working on it".to_string())
        );
        assert_eq!(next_frame(&mut session).await, Frame::Heartbeat);
        assert!(matches!(next_frame(&mut session).await, Frame::Response(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exits_when_parent_is_gone() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        let server = test_server()
            .watch_parent(Some(pid))
            .with_parent_check_interval(Duration::from_millis(20));
        let session = serve(server);
        timeout(TEST_TIMEOUT, session.task).await.unwrap().unwrap().unwrap();
    }
}
