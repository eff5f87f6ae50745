//! TCP debug console for poking the ring daemon by hand.
//!
//! Listens on a TCP port (default 8828) and accepts line-based text commands
//! for inspecting state and driving the lifecycle.
//!
//! Usage from dev machine:
//!   nc rpi 8828
//!
//! Commands:
//!   state           show lifecycle state, devices and latest snapshot
//!   sub             subscribe to 1 Hz HR stream
//!   scan            start a scan for rings
//!   stop            stop the running scan
//!   connect <id>    connect to a ring
//!   disconnect      disconnect from the current ring
//!   sync            sync telemetry and print the snapshot
//!   monitor on|off  start or stop the heart rate monitor
//!   fault <text>    route an error message as if the transport raised it
//!   reset           reset everything, including the adapter
//!   help            list commands
//!   quit            disconnect

use std::sync::Arc;

use log::info;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use crate::config;
use crate::error::LinkError;
use crate::manager::RingManager;
use crate::state::{RingState, StatusKind};
use crate::telemetry::TelemetrySnapshot;
use crate::transport::TransportError;

/// Run the TCP debug server.
pub async fn run(
    manager: Arc<RingManager>,
    config_path: String,
    port: u16,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!("Debug server listening on port {}", port);

    loop {
        let (stream, addr) = listener.accept().await?;
        info!("Debug client connected from {}", addr);

        let manager = manager.clone();
        let config_path = config_path.clone();

        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, manager, config_path).await {
                info!("Debug client {} disconnected: {}", addr, e);
            }
        });
    }
}

async fn handle_client(
    stream: tokio::net::TcpStream,
    manager: Arc<RingManager>,
    config_path: String,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    writer
        .write_all(b"ringd-debug> connected. type 'help' for commands.\n")
        .await?;

    loop {
        writer.write_all(b"ringd-debug> ").await?;

        let Some(line) = lines.next_line().await? else {
            return Ok(());
        };
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }

        let response = match line.split_once(' ') {
            // Device ids are case-sensitive on some stacks, keep the argument as typed.
            Some(("connect", id)) => handle_connect(id.trim(), &manager).await,
            Some(("monitor", arg)) => handle_monitor(arg.trim(), &manager).await,
            Some(("fault", text)) => handle_fault(text.trim(), &manager).await,
            _ => match line.to_lowercase().as_str() {
                "help" => HELP_TEXT.to_string(),
                "state" => format_state(&manager.state().await, config::load(&config_path)),
                "scan" => match manager.scan().await {
                    Ok(()) => "scan started".to_string(),
                    Err(e) => format!("error: {}", e),
                },
                "stop" => {
                    manager.stop_scan().await;
                    "scan stopped".to_string()
                }
                "disconnect" => {
                    manager.disconnect().await;
                    "disconnected".to_string()
                }
                "sync" => format_snapshot(&manager.sync().await),
                "reset" => {
                    if manager.reset_all().await {
                        "reset complete".to_string()
                    } else {
                        "reset failed, see state".to_string()
                    }
                }
                "connect" => "usage: connect <id>".to_string(),
                "monitor" => "usage: monitor on|off".to_string(),
                "fault" => "usage: fault <error text>".to_string(),
                "sub" => {
                    handle_subscribe(&manager, &mut writer).await?;
                    continue;
                }
                "quit" | "exit" => return Ok(()),
                _ => format!("unknown command: '{}'. type 'help'.", line),
            },
        };

        writer.write_all(response.as_bytes()).await?;
        writer.write_all(b"\n").await?;
    }
}

async fn handle_connect(id: &str, manager: &RingManager) -> String {
    if id.is_empty() {
        return "usage: connect <id>".to_string();
    }
    if manager.connect(id).await {
        format!("connected to {}", id)
    } else {
        let reason = manager.state().await.last_error.unwrap_or_else(|| "unknown".to_string());
        format!("connect to {} failed: {}", id, reason)
    }
}

async fn handle_monitor(arg: &str, manager: &RingManager) -> String {
    match arg {
        "on" => {
            manager.start_heart_rate_monitor(|_| {}).await;
            "heart rate monitor started".to_string()
        }
        "off" => {
            manager.stop_heart_rate_monitor().await;
            "heart rate monitor stopped".to_string()
        }
        _ => "usage: monitor on|off".to_string(),
    }
}

async fn handle_fault(text: &str, manager: &RingManager) -> String {
    let err = LinkError::Transport(TransportError::new(text));
    let action = manager.report_error(&err).await;
    format!("routed as {:?}", action)
}

fn format_state(s: &RingState, saved: Option<config::RingConfig>) -> String {
    let saved_info = match saved {
        Some(cfg) if !cfg.paired.is_empty() => cfg
            .paired
            .iter()
            .map(|d| format!("{} ({})", d.name, d.id))
            .collect::<Vec<_>>()
            .join(", "),
        _ => "none".to_string(),
    };
    let heart_rate = match (s.heart_rate, s.measuring) {
        (_, true) => "measuring...".to_string(),
        (Some(bpm), _) if s.heart_rate_simulated => format!("{} bpm (simulated)", bpm),
        (Some(bpm), _) => format!("{} bpm", bpm),
        (None, _) => "-- bpm".to_string(),
    };
    let status = match &s.status {
        Some(m) if m.kind == StatusKind::Fatal => format!("{} [fatal]", m.text),
        Some(m) => m.text.clone(),
        None => "-".to_string(),
    };

    let mut out = format!(
        "connection: {:?}\n\
         target:     {}\n\
         power:      {:?}\n\
         scanning:   {}\n\
         services:   {}\n\
         heart_rate: {}\n\
         status:     {}\n\
         last_error: {}\n\
         saved:      {}",
        s.connection,
        s.target.as_deref().unwrap_or("-"),
        s.power,
        s.scanning,
        if s.services_ready { "ready" } else { "-" },
        heart_rate,
        status,
        s.last_error.as_deref().unwrap_or("-"),
        saved_info,
    );

    if !s.available_devices.is_empty() {
        out.push_str("\navailable devices:");
        for d in &s.available_devices {
            out.push_str(&format!("\n  {} - {} (RSSI: {})", d.id, d.display_name, d.signal));
        }
    }
    if !s.paired_devices.is_empty() {
        out.push_str("\npaired devices:");
        for d in &s.paired_devices {
            let mark = if d.connected { " [connected]" } else { "" };
            out.push_str(&format!("\n  {} - {}{}", d.id, d.display_name, mark));
        }
    }
    if let Some(snapshot) = &s.snapshot {
        out.push('\n');
        out.push_str(&format_snapshot(snapshot));
    }
    out
}

fn format_snapshot(snapshot: &TelemetrySnapshot) -> String {
    fn field<T: std::fmt::Display>(v: Option<T>) -> String {
        v.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
    }
    let mut out = format!(
        "snapshot at {}: battery {}%, steps {}, distance {} km, calories {}, hr {}",
        snapshot.captured_at.format("%Y-%m-%d %H:%M:%S"),
        field(snapshot.battery),
        field(snapshot.steps),
        field(snapshot.distance_km),
        field(snapshot.calories),
        field(snapshot.heart_rate),
    );
    if let Some(sleep) = &snapshot.sleep {
        out.push_str(&format!(
            ", sleep {} min (deep {}, light {}, awake {})",
            sleep.total_minutes, sleep.deep_minutes, sleep.light_minutes, sleep.awake_minutes
        ));
    }
    if snapshot.connection.is_some() {
        out.push_str(" [reconnected, partial]");
    }
    out
}

async fn handle_subscribe(
    manager: &RingManager,
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    writer
        .write_all(b"subscribed to HR data at 1 Hz. ctrl-c to stop.\n")
        .await?;

    let state = manager.shared_state();
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
    loop {
        interval.tick().await;

        let s = state.lock().await;
        let line = match (s.heart_rate, s.target.as_deref()) {
            (Some(bpm), Some(id)) => format!(
                "hr {} bpm{} | {:?} {}\n",
                bpm,
                if s.heart_rate_simulated { " (sim)" } else { "" },
                s.connection,
                id
            ),
            (Some(bpm), None) => format!("hr {} bpm (sim) | {:?}\n", bpm, s.connection),
            (None, _) => format!("hr -- bpm | {:?} (scanning: {})\n", s.connection, s.scanning),
        };
        drop(s);

        if writer.write_all(line.as_bytes()).await.is_err() {
            break;
        }
    }

    Ok(())
}

const HELP_TEXT: &str = "\
commands:
  state           show lifecycle state, devices and latest snapshot
  sub             subscribe to 1 Hz HR stream
  scan            start a scan for rings
  stop            stop the running scan
  connect <id>    connect to a ring by id
  disconnect      disconnect from the current ring
  sync            sync telemetry and print the snapshot
  monitor on|off  start or stop the heart rate monitor
  fault <text>    route an error as if the transport raised it
  reset           reset everything, including the adapter
  help            this message
  quit            disconnect

examples:
  scan
  connect AA:BB:CC:DD:EE:FF
  monitor on
  fault BleManager was destroyed
  state";
