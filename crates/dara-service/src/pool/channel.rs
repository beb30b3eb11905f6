//! Line framing of the messages on the worker pipes.

use std::fs::File;
use std::io::{self, BufRead, Write};
use std::sync::Mutex;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use super::messages::{WorkerCommand, WorkerMessage};

fn encode_line<T: Serialize>(message: &T) -> io::Result<Vec<u8>> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    Ok(line)
}

fn decode_line<T: DeserializeOwned>(line: &str) -> serde_json::Result<T> {
    serde_json::from_str(line.trim_end())
}

/// Sends a command to a worker.
pub async fn send_command<W>(writer: &mut W, command: &WorkerCommand) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode_line(command)?).await?;
    writer.flush().await
}

/// Forwards all messages a worker writes to `reader` into `messages`, tagged with its pid.
///
/// Returns once the worker closes its end of the pipe. Lines that do not parse are logged and
/// skipped.
pub async fn forward_messages<R>(
    pid: u32,
    reader: R,
    messages: mpsc::UnboundedSender<(u32, WorkerMessage)>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => match decode_line(&line) {
                Ok(message) => {
                    if messages.send((pid, message)).is_err() {
                        break;
                    }
                }
                Err(err) => tracing::warn!(
                    pid,
                    error = &err as &dyn std::error::Error,
                    %line,
                    "invalid message from worker"
                ),
            },
            Ok(None) => break,
            Err(err) => {
                tracing::debug!(
                    pid,
                    error = &err as &dyn std::error::Error,
                    "failed to read from worker"
                );
                break;
            }
        }
    }
    tracing::trace!(pid, "worker closed its message pipe");
}

/// The worker end of the message pipe.
///
/// Messages may be sent from multiple threads, each one is written as a single line.
#[derive(Debug)]
pub struct MessageSender {
    out: Mutex<File>,
}

impl MessageSender {
    pub fn new(out: File) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn send(&self, message: &WorkerMessage) -> io::Result<()> {
        let line = encode_line(message)?;
        let mut out = self.out.lock().unwrap();
        out.write_all(&line)?;
        out.flush()
    }
}

/// Reads the commands a worker receives, blocking until the next one arrives.
///
/// Returns `Ok(None)` once the pool closed the pipe.
pub fn read_command<R: BufRead>(reader: &mut R) -> io::Result<Option<WorkerCommand>> {
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        if line.trim().is_empty() {
            continue;
        }
        return decode_line(&line)
            .map(Some)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err));
    }
}
