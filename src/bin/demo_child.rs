//! Demo child process for pipecall
//!
//! Answers a handful of calls over stdio. Used by the integration tests and as
//! a reference for writing real children. Logs go to stderr.

use std::time::Duration;

use pipecall::server::{parent_pid_from_args, IpcServer};
use pipecall::Payload;
use serde_json::{json, Value as JsonValue};

fn payload(value: JsonValue) -> Payload {
    match value {
        JsonValue::Object(map) => map,
        _ => Payload::new(),
    }
}

fn text_field(data: &Payload, key: &str) -> String {
    data.get(key)
        .and_then(JsonValue::as_str)
        .unwrap_or_default()
        .to_string()
}

#[tokio::main]
async fn main() -> pipecall::Result<()> {
    pipecall::init_tracing();

    let args: Vec<String> = std::env::args().collect();
    let parent_pid = parent_pid_from_args(&args);
    tracing::info!("Demo child started, parent pid: {:?}", parent_pid);

    let mut server = IpcServer::new().watch_parent(parent_pid);
    server
        .register("ping", |_, _| async {
            Ok::<_, String>(payload(json!({"pong": true})))
        })
        .register("echo", |data, _| async move { Ok::<_, String>(data) })
        .register("fail", |data, _| async move {
            let message = text_field(&data, "message");
            Err::<Payload, _>(if message.is_empty() {
                "boom".to_string()
            } else {
                message
            })
        })
        .register("say", |data, outbox| async move {
            let text = text_field(&data, "text");
            outbox.print(&text).await.map_err(|e| e.to_string())?;
            Ok::<_, String>(payload(json!({"said": text})))
        })
        .register("delay", |data, _| async move {
            let ms = data.get("ms").and_then(JsonValue::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok::<_, String>(data)
        })
        .register("beat", |_, outbox| async move {
            outbox.heartbeat().await.map_err(|e| e.to_string())?;
            Ok::<_, String>(payload(json!({"beat": true})))
        })
        .register("exit", |_, _| async {
            // Reply first, then leave without being asked to stop
            tokio::spawn(async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                std::process::exit(0);
            });
            Ok::<_, String>(Payload::new())
        });

    server.run_stdio().await
}
