//! QMP transport for the control channel.
//!
//! Each VM exposes a QMP Unix socket at `<socket_dir>/<host>.qmp`. A command
//! opens a fresh session:
//!
//! ```text
//! <- {"QMP": {...}}                       greeting
//! -> {"execute": "qmp_capabilities"}
//! <- {"return": {}}
//! -> {"execute": "human-monitor-command", "arguments": {"command-line": "..."}}
//! <- {"return": "<monitor output>"}
//! ```
//!
//! Asynchronous `{"event": ...}` lines may arrive at any point and are skipped.
//! The human monitor reports its own failures as output text, so any output
//! other than nothing or `OK` counts as a rejection.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tracing::{debug, instrument, warn};

use super::{bounded, ControlChannel, DEFAULT_COMMAND_TIMEOUT};
use crate::error::{VolumeError, VolumeResult};
use crate::types::HostId;

/// QMP channel configuration.
#[derive(Debug, Clone)]
pub struct QmpChannelConfig {
    /// Directory holding one `<host>.qmp` socket per VM
    pub socket_dir: PathBuf,
    /// Bound on one full command session
    pub timeout: Duration,
}

impl QmpChannelConfig {
    /// Creates a configuration with the default command timeout.
    pub fn new(socket_dir: impl Into<PathBuf>) -> Self {
        Self {
            socket_dir: socket_dir.into(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

#[derive(Serialize)]
struct QmpCommand<'a> {
    execute: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    arguments: Option<HmpArguments<'a>>,
}

#[derive(Serialize)]
struct HmpArguments<'a> {
    #[serde(rename = "command-line")]
    command_line: &'a str,
}

#[derive(Debug, Deserialize)]
struct QmpErrorBody {
    class: String,
    desc: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum QmpMessage {
    Return {
        #[serde(rename = "return")]
        value: serde_json::Value,
    },
    Error {
        error: QmpErrorBody,
    },
    Event {
        event: String,
    },
    Greeting {
        #[serde(rename = "QMP")]
        _qmp: serde_json::Value,
    },
}

/// Outcome of one QMP exchange that reached the remote side.
enum Reply {
    Return(serde_json::Value),
    Error(QmpErrorBody),
}

/// Control channel speaking QMP over per-VM Unix sockets.
#[derive(Debug, Clone)]
pub struct QmpChannel {
    config: QmpChannelConfig,
}

impl QmpChannel {
    /// Creates a channel.
    pub fn new(config: QmpChannelConfig) -> Self {
        Self { config }
    }

    /// Returns the socket path for a host.
    pub fn socket_path(&self, host: &HostId) -> PathBuf {
        self.config.socket_dir.join(format!("{}.qmp", host))
    }

    async fn session(&self, host: &HostId, command: &str) -> VolumeResult<String> {
        let path = self.socket_path(host);
        let unreachable = |reason: String| VolumeError::unreachable(host.as_str(), reason);

        let stream = UnixStream::connect(&path)
            .await
            .map_err(|e| unreachable(format!("connect {}: {}", path.display(), e)))?;
        let (read_half, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        match read_message(&mut reader).await.map_err(&unreachable)? {
            QmpMessage::Greeting { .. } => {}
            other => return Err(unreachable(format!("unexpected greeting: {:?}", other))),
        }

        send(&mut writer, &QmpCommand {
            execute: "qmp_capabilities",
            arguments: None,
        })
        .await
        .map_err(&unreachable)?;
        if let Reply::Error(e) = read_reply(&mut reader).await.map_err(&unreachable)? {
            return Err(unreachable(format!(
                "capabilities negotiation failed: {}: {}",
                e.class, e.desc
            )));
        }

        send(&mut writer, &QmpCommand {
            execute: "human-monitor-command",
            arguments: Some(HmpArguments {
                command_line: command,
            }),
        })
        .await
        .map_err(&unreachable)?;

        match read_reply(&mut reader).await.map_err(&unreachable)? {
            Reply::Error(e) => Err(VolumeError::rejected(
                host.as_str(),
                command,
                format!("{}: {}", e.class, e.desc),
            )),
            Reply::Return(value) => {
                let output = value.as_str().unwrap_or_default().trim();
                if output.is_empty() || output == "OK" {
                    Ok(output.to_string())
                } else {
                    Err(VolumeError::rejected(host.as_str(), command, output))
                }
            }
        }
    }
}

#[async_trait]
impl ControlChannel for QmpChannel {
    #[instrument(skip(self), fields(host = %host))]
    async fn send_command(&self, host: &HostId, command: &str) -> VolumeResult<String> {
        let result = bounded(host, self.config.timeout, self.session(host, command)).await;
        match &result {
            Ok(_) => debug!(command, "Monitor command acknowledged"),
            Err(e) => warn!(command, error = %e, "Monitor command failed"),
        }
        result
    }
}

async fn send(writer: &mut OwnedWriteHalf, command: &QmpCommand<'_>) -> Result<(), String> {
    let mut line = serde_json::to_vec(command).map_err(|e| e.to_string())?;
    line.push(b'\n');
    writer
        .write_all(&line)
        .await
        .map_err(|e| format!("write: {}", e))?;
    writer.flush().await.map_err(|e| format!("flush: {}", e))
}

async fn read_message(reader: &mut BufReader<OwnedReadHalf>) -> Result<QmpMessage, String> {
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader
            .read_line(&mut line)
            .await
            .map_err(|e| format!("read: {}", e))?;
        if n == 0 {
            return Err("connection closed by peer".to_string());
        }
        if line.trim().is_empty() {
            continue;
        }
        return serde_json::from_str(line.trim())
            .map_err(|e| format!("malformed QMP message '{}': {}", line.trim(), e));
    }
}

/// Reads until a command reply, skipping asynchronous events.
async fn read_reply(reader: &mut BufReader<OwnedReadHalf>) -> Result<Reply, String> {
    loop {
        match read_message(reader).await? {
            QmpMessage::Return { value } => return Ok(Reply::Return(value)),
            QmpMessage::Error { error } => return Ok(Reply::Error(error)),
            QmpMessage::Event { event } => debug!(event, "Skipping QMP event"),
            QmpMessage::Greeting { .. } => return Err("unexpected second greeting".to_string()),
        }
    }
}
