//! Expect-style automation of a guest serial console.
//!
//! Commands are typed line by line, followed by an `echo` of `$?` with a
//! marker, and the console output is scanned for the marker carrying a
//! number. The typed echo line itself shows `$?` rather than digits, so
//! the terminal echo never matches.

use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

use crate::backend::GuestConsole;
use crate::config::ConsoleConfig;
use crate::error::MkvmError;
use crate::logging::ConsoleTranscript;
use crate::util::command_label;

const STATUS_MARKER: &[u8] = b"mkvm-status=";
const STATUS_ECHO: &str = "echo \"mkvm-status=$?\"";

pub struct SerialConsole<R, W> {
    reader: R,
    writer: W,
    buf: Vec<u8>,
    prompts: ConsoleConfig,
    login_timeout: Duration,
    transcript: Option<ConsoleTranscript>,
}

impl<R, W> SerialConsole<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W, prompts: ConsoleConfig, login_timeout: Duration) -> Self {
        Self {
            reader,
            writer,
            buf: Vec::new(),
            prompts,
            login_timeout,
            transcript: None,
        }
    }

    pub fn with_transcript(mut self, transcript: ConsoleTranscript) -> Self {
        tracing::debug!(path = %transcript.path().display(), "recording guest console");
        self.transcript = Some(transcript);
        self
    }

    /// Read one chunk of console output into the buffer.
    async fn fill(
        &mut self,
        deadline: Instant,
        waiting_for: &str,
        timeout: Duration,
    ) -> Result<(), MkvmError> {
        let mut chunk = [0u8; 4096];
        let n = match tokio::time::timeout_at(deadline, self.reader.read(&mut chunk)).await {
            Err(_) => {
                return Err(MkvmError::Timeout {
                    what: format!("{waiting_for:?} on the guest console"),
                    secs: timeout.as_secs(),
                });
            }
            Ok(Err(e)) => {
                return Err(MkvmError::Io {
                    context: "reading guest console".into(),
                    source: e,
                });
            }
            Ok(Ok(0)) => {
                return Err(MkvmError::ConsoleClosed {
                    waiting_for: waiting_for.to_string(),
                });
            }
            Ok(Ok(n)) => n,
        };

        if let Some(t) = self.transcript.as_mut() {
            t.record(&chunk[..n]);
        }
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(())
    }

    /// Wait until `pattern` shows up and return everything up to and
    /// including it.
    pub async fn wait_for(
        &mut self,
        pattern: &str,
        timeout: Duration,
    ) -> Result<String, MkvmError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(pos) = find(&self.buf, pattern.as_bytes()) {
                let seen: Vec<u8> = self.buf.drain(..pos + pattern.len()).collect();
                return Ok(String::from_utf8_lossy(&seen).into_owned());
            }
            self.fill(deadline, pattern, timeout).await?;
        }
    }

    pub async fn send_line(&mut self, line: &str) -> Result<(), MkvmError> {
        let io = |e: std::io::Error| MkvmError::Io {
            context: "writing to guest console".into(),
            source: e,
        };
        self.writer.write_all(line.as_bytes()).await.map_err(io)?;
        self.writer.write_all(b"\n").await.map_err(io)?;
        self.writer.flush().await.map_err(io)
    }

    async fn wait_for_status(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<i32, MkvmError> {
        let deadline = Instant::now() + timeout;
        let waiting_for = format!("exit status of `{}`", command_label(command));
        loop {
            if let Some((end, status)) = find_status(&self.buf) {
                self.buf.drain(..end);
                return Ok(status);
            }
            self.fill(deadline, &waiting_for, timeout).await?;
        }
    }
}

impl<R, W> GuestConsole for SerialConsole<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    async fn login(&mut self) -> Result<(), MkvmError> {
        let timeout = self.login_timeout;
        let login_prompt = self.prompts.login_prompt.clone();
        let shell_prompt = self.prompts.shell_prompt.clone();
        let user = self.prompts.user.clone();

        self.wait_for(&login_prompt, timeout).await?;
        self.send_line(&user).await?;
        self.wait_for(&shell_prompt, timeout).await?;
        tracing::info!(%user, "logged in on guest console");
        Ok(())
    }

    async fn run_command(&mut self, command: &str, timeout: Duration) -> Result<(), MkvmError> {
        // Output left over from the previous command can't hold a status.
        self.buf.clear();

        for line in command.lines() {
            self.send_line(line).await?;
        }
        self.send_line(STATUS_ECHO).await?;

        let status = self.wait_for_status(command, timeout).await?;
        if status != 0 {
            return Err(MkvmError::CommandFailed {
                command: command.to_string(),
                status,
            });
        }
        tracing::debug!(command = %command_label(command), "guest command succeeded");
        Ok(())
    }

    fn finish(&mut self, success: bool) -> Option<PathBuf> {
        let path = self.transcript.take()?.finish(success);
        tracing::info!(path = %path.display(), "console transcript saved");
        Some(path)
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Locate a complete `mkvm-status=<digits>` in console output.
///
/// Returns the offset just past the digits and the parsed status. A
/// marker followed by anything but digits (the echoed command line) is
/// skipped; digits still at the end of the buffer may be incomplete.
fn find_status(buf: &[u8]) -> Option<(usize, i32)> {
    let mut from = 0;
    while let Some(rel) = find(&buf[from..], STATUS_MARKER) {
        let start = from + rel + STATUS_MARKER.len();
        let digits = buf[start..].iter().take_while(|b| b.is_ascii_digit()).count();
        let end = start + digits;
        if digits > 0 && end < buf.len() {
            let status = std::str::from_utf8(&buf[start..end])
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(i32::MAX);
            return Some((end, status));
        }
        if digits > 0 {
            return None;
        }
        from = start;
    }
    None
}
