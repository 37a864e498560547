//! Just enough of the QEMU Machine Protocol to power a guest off.

use std::path::Path;
use std::time::Duration;

use facet::Facet;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

use crate::error::MkvmError;

const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Facet)]
struct QmpRequest {
    execute: String,
}

/// Any line QEMU sends: greeting, command reply, or asynchronous event.
#[derive(Debug, Default, Facet)]
#[facet(default)]
struct QmpMessage {
    #[facet(default, rename = "QMP")]
    greeting: Option<QmpGreeting>,
    #[facet(default, rename = "return")]
    ret: Option<QmpReturn>,
    #[facet(default)]
    error: Option<QmpError>,
    #[facet(default)]
    event: Option<String>,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct QmpGreeting {
    #[facet(default)]
    capabilities: Vec<String>,
}

/// Only argument-less commands are sent, which all return `{}`.
#[derive(Debug, Default, Facet)]
struct QmpReturn {}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct QmpError {
    #[facet(default)]
    class: String,
    #[facet(default)]
    desc: String,
}

fn parse_message(line: &str) -> Result<QmpMessage, MkvmError> {
    facet_json::from_str(line).map_err(|e| MkvmError::Qmp {
        message: format!("malformed reply {line}: {e}"),
    })
}

pub struct QmpClient {
    lines: tokio::io::Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl QmpClient {
    /// Connect, read the greeting and leave capabilities negotiation mode.
    pub async fn connect(socket: &Path) -> Result<Self, MkvmError> {
        let stream = UnixStream::connect(socket).await.map_err(|e| MkvmError::Io {
            context: format!("connecting to QMP socket {}", socket.display()),
            source: e,
        })?;
        let (r, w) = stream.into_split();
        let mut client = Self {
            lines: BufReader::new(r).lines(),
            writer: w,
        };

        let line = client.next_line().await?;
        match parse_message(&line)?.greeting {
            Some(greeting) => {
                tracing::debug!(capabilities = ?greeting.capabilities, "QMP greeting");
            }
            None => {
                return Err(MkvmError::Qmp {
                    message: format!("unexpected greeting: {line}"),
                });
            }
        }
        client.execute("qmp_capabilities").await?;
        Ok(client)
    }

    async fn next_line(&mut self) -> Result<String, MkvmError> {
        match tokio::time::timeout(REPLY_TIMEOUT, self.lines.next_line()).await {
            Err(_) => Err(MkvmError::Timeout {
                what: "QMP reply".into(),
                secs: REPLY_TIMEOUT.as_secs(),
            }),
            Ok(Err(e)) => Err(MkvmError::Io {
                context: "reading QMP socket".into(),
                source: e,
            }),
            Ok(Ok(None)) => Err(MkvmError::Qmp {
                message: "connection closed".into(),
            }),
            Ok(Ok(Some(line))) => Ok(line),
        }
    }

    /// Run an argument-less command and wait for its reply, skipping events.
    pub async fn execute(&mut self, command: &str) -> Result<(), MkvmError> {
        let mut request = facet_json::to_string(&QmpRequest {
            execute: command.to_string(),
        })
        .map_err(|e| MkvmError::Qmp {
            message: format!("encoding {command}: {e}"),
        })?;
        request.push('\n');
        self.writer
            .write_all(request.as_bytes())
            .await
            .map_err(|e| MkvmError::Io {
                context: format!("sending QMP {command}"),
                source: e,
            })?;

        loop {
            let line = self.next_line().await?;
            match parse_message(&line)? {
                QmpMessage {
                    error: Some(error), ..
                } => {
                    return Err(MkvmError::Qmp {
                        message: format!("{command}: {}: {}", error.class, error.desc),
                    });
                }
                QmpMessage { ret: Some(_), .. } => return Ok(()),
                QmpMessage {
                    event: Some(event), ..
                } => tracing::debug!(%event, "QMP event"),
                _ => tracing::debug!(%line, "ignoring QMP line"),
            }
        }
    }
}

/// ACPI power button press, like `system_powerdown` in the monitor.
pub async fn system_powerdown(socket: &Path) -> Result<(), MkvmError> {
    let mut client = QmpClient::connect(socket).await?;
    client.execute("system_powerdown").await?;
    tracing::info!("sent ACPI powerdown over QMP");
    Ok(())
}
