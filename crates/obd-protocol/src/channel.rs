//! Command Channel
//!
//! The only path by which bytes reach the adapter. One command is written,
//! then the reply is accumulated until the `>` prompt or the deadline.
//! Replies are returned verbatim; interpretation belongs to the parser.

use crate::error::ObdError;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, trace};

/// Upper bound for a single command, whatever the caller asks for
pub const MAX_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// ELM327 prompt character
const PROMPT: u8 = b'>';

/// A byte stream to an adapter
pub trait Link: AsyncRead + AsyncWrite + Unpin + Send {
    /// Drop any unread bytes from the device
    fn discard_input(&mut self) -> io::Result<()>;
}

impl Link for tokio_serial::SerialStream {
    fn discard_input(&mut self) -> io::Result<()> {
        use tokio_serial::SerialPort;
        self.clear(tokio_serial::ClearBuffer::Input)
            .map_err(io::Error::from)
    }
}

/// Text received in answer to one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub text: String,
    /// The reply ended with the prompt rather than the deadline
    pub complete: bool,
    pub elapsed: Duration,
}

impl RawResponse {
    /// No bytes arrived at all
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// I/O failures after which the handle cannot be reused
fn is_fatal(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::UnexpectedEof
    )
}

fn io_error(err: io::Error) -> ObdError {
    if is_fatal(&err) {
        ObdError::LinkClosed(err.to_string())
    } else {
        ObdError::Serial(err.to_string())
    }
}

/// Request/reply channel over an exclusively owned link
pub struct CommandChannel {
    link: Box<dyn Link>,
    write_timeout: Duration,
}

impl CommandChannel {
    /// Wrap an open link; `write_timeout` bounds each write
    pub fn new(link: Box<dyn Link>, write_timeout: Duration) -> Self {
        Self {
            link,
            write_timeout,
        }
    }

    /// Send `command` and wait up to `timeout` for the prompt.
    ///
    /// A device that stays silent yields an empty response, not an error.
    /// Errors are returned only for I/O failures on the link itself.
    pub async fn send(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<RawResponse, ObdError> {
        let timeout = timeout.min(MAX_COMMAND_TIMEOUT);
        self.link.discard_input().map_err(io_error)?;

        debug!("-> {}", command);
        let frame = format!("{command}\r");
        let write_timeout = self.write_timeout;
        let link = &mut self.link;
        let write = async {
            link.write_all(frame.as_bytes()).await?;
            link.flush().await
        };
        tokio::time::timeout(write_timeout, write)
            .await
            .map_err(|_| ObdError::Timeout(write_timeout.as_millis() as u64))?
            .map_err(io_error)?;

        let started = Instant::now();
        let deadline = started + timeout;
        let mut received = Vec::new();
        let mut chunk = [0u8; 256];
        let mut complete = false;

        loop {
            match tokio::time::timeout_at(deadline, self.link.read(&mut chunk)).await {
                Err(_) => break,
                Ok(Ok(0)) => {
                    return Err(ObdError::LinkClosed("device closed the link".to_string()));
                }
                Ok(Ok(n)) => {
                    trace!("read {} bytes", n);
                    received.extend_from_slice(&chunk[..n]);
                    if chunk[..n].contains(&PROMPT) {
                        complete = true;
                        break;
                    }
                }
                Ok(Err(e)) => return Err(io_error(e)),
            }
        }

        let text = String::from_utf8_lossy(&received).into_owned();
        let elapsed = started.elapsed();
        if complete {
            debug!("<- {:?} ({} ms)", text, elapsed.as_millis());
        } else {
            debug!("<- {:?} (no prompt after {} ms)", text, elapsed.as_millis());
        }
        Ok(RawResponse {
            text,
            complete,
            elapsed,
        })
    }
}
