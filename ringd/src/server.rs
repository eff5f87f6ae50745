//! Unix socket server for the ring daemon.
//!
//! Accepts multiple clients on a Unix domain socket. Broadcasts heart rate
//! data at 1 Hz as newline-delimited JSON and accepts lifecycle commands.
//! Commands that can take tens of seconds (connect, sync, reset) run in their
//! own task and answer when done, so the broadcast keeps flowing.

use std::sync::Arc;

use log::{debug, info, warn};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};

use crate::manager::RingManager;

/// A parsed client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Scan,
    StopScan,
    Connect(String),
    Disconnect,
    Sync,
    Monitor(bool),
    Reset,
    Status,
}

/// Parse one JSON command line. The error is the message sent back to the client.
pub fn parse_command(line: &str) -> Result<Command, String> {
    let parsed: Value = serde_json::from_str(line).map_err(|e| format!("invalid JSON: {}", e))?;
    let cmd = parsed.get("cmd").and_then(|v| v.as_str()).unwrap_or("");
    match cmd {
        "scan" => Ok(Command::Scan),
        "stop_scan" => Ok(Command::StopScan),
        "connect" => {
            let id = parsed.get("id").and_then(|v| v.as_str()).unwrap_or("");
            if id.is_empty() {
                return Err("missing 'id' field".to_string());
            }
            Ok(Command::Connect(id.to_string()))
        }
        "disconnect" => Ok(Command::Disconnect),
        "sync" => Ok(Command::Sync),
        "monitor" => match parsed.get("on").and_then(|v| v.as_bool()) {
            Some(on) => Ok(Command::Monitor(on)),
            None => Err("missing boolean 'on' field".to_string()),
        },
        "reset" => Ok(Command::Reset),
        "status" => Ok(Command::Status),
        _ => Err(format!("unknown command: '{}'", cmd)),
    }
}

/// Run the Unix socket server. Listens for clients and broadcasts HR data.
pub async fn run(
    manager: Arc<RingManager>,
    socket_path: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Remove stale socket file
    let _ = std::fs::remove_file(socket_path);

    let listener = UnixListener::bind(socket_path)?;

    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o777))?;

    info!("Ring server listening on {}", socket_path);

    loop {
        let (stream, _addr) = listener.accept().await?;
        info!("Client connected");

        let manager = manager.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, manager).await {
                debug!("Client disconnected: {}", e);
            }
        });
    }
}

async fn handle_client(
    stream: tokio::net::UnixStream,
    manager: Arc<RingManager>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let (reply_tx, mut reply_rx) = mpsc::channel::<Value>(8);

    let mut broadcast_interval = interval(Duration::from_secs(1));
    // Skip the first immediate tick
    broadcast_interval.tick().await;

    loop {
        tokio::select! {
            line_result = lines.next_line() => {
                match line_result {
                    Ok(Some(line)) => {
                        let line = line.trim().to_string();
                        if line.is_empty() {
                            continue;
                        }
                        if let Err(e) = handle_command(&line, &manager, &reply_tx, &mut writer).await {
                            warn!("Error handling command: {}", e);
                        }
                    }
                    Ok(None) => return Ok(()), // EOF
                    Err(e) => return Err(e.into()),
                }
            }
            Some(reply) = reply_rx.recv() => {
                send_json(&mut writer, &reply).await?;
            }
            _ = broadcast_interval.tick() => {
                let msg = {
                    let state = manager.shared_state();
                    let s = state.lock().await;
                    json!({
                        "type": "hr",
                        "bpm": s.heart_rate,
                        "simulated": s.heart_rate_simulated,
                        "measuring": s.measuring,
                        "connection": s.connection,
                        "device": s.target,
                    })
                };
                if send_json(&mut writer, &msg).await.is_err() {
                    return Ok(()); // Client gone
                }
            }
        }
    }
}

async fn handle_command(
    line: &str,
    manager: &Arc<RingManager>,
    reply_tx: &mpsc::Sender<Value>,
    writer: &mut OwnedWriteHalf,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let command = match parse_command(line) {
        Ok(command) => command,
        Err(message) => return send_error(writer, &message).await,
    };
    info!("Command: {:?}", command);

    match command {
        Command::Scan => match manager.scan().await {
            Ok(()) => send_status(manager, writer).await?,
            Err(e) => send_error(writer, &e.to_string()).await?,
        },
        Command::StopScan => {
            manager.stop_scan().await;
            send_status(manager, writer).await?;
        }
        Command::Connect(id) => {
            let manager = manager.clone();
            let reply_tx = reply_tx.clone();
            tokio::spawn(async move {
                let ok = manager.connect(&id).await;
                let error = if ok { None } else { manager.state().await.last_error };
                let _ = reply_tx
                    .send(json!({ "type": "connect", "id": id, "ok": ok, "error": error }))
                    .await;
            });
        }
        Command::Disconnect => {
            manager.disconnect().await;
            send_status(manager, writer).await?;
        }
        Command::Sync => {
            let manager = manager.clone();
            let reply_tx = reply_tx.clone();
            tokio::spawn(async move {
                let snapshot = manager.sync().await;
                let _ = reply_tx.send(json!({ "type": "snapshot", "snapshot": snapshot })).await;
            });
        }
        Command::Monitor(true) => {
            manager.start_heart_rate_monitor(|_| {}).await;
            send_status(manager, writer).await?;
        }
        Command::Monitor(false) => {
            manager.stop_heart_rate_monitor().await;
            send_status(manager, writer).await?;
        }
        Command::Reset => {
            let manager = manager.clone();
            let reply_tx = reply_tx.clone();
            tokio::spawn(async move {
                let ok = manager.reset_all().await;
                let _ = reply_tx.send(json!({ "type": "reset", "ok": ok })).await;
            });
        }
        Command::Status => send_status(manager, writer).await?,
    }

    Ok(())
}

async fn send_status(
    manager: &RingManager,
    writer: &mut OwnedWriteHalf,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let state = manager.state().await;
    let msg = json!({
        "type": "status",
        "state": state,
    });
    send_json(writer, &msg).await
}

async fn send_error(
    writer: &mut OwnedWriteHalf,
    message: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let msg = json!({
        "type": "error",
        "message": message,
    });
    send_json(writer, &msg).await
}

async fn send_json(
    writer: &mut OwnedWriteHalf,
    msg: &Value,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut line = serde_json::to_string(msg)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    Ok(())
}
