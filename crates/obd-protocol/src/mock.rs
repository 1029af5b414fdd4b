//! In-memory ELM327 adapter
//!
//! Scripted replies per command, used in place of a serial port. Unscripted
//! `AT` commands answer `OK` and unscripted OBD requests answer `NO DATA`,
//! which is what a real adapter does for most of them. Echo follows `ATE0`.

use crate::channel::Link;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;

/// Bytes handed out per read, so callers see replies arrive in pieces
const CHUNK: usize = 16;

#[derive(Debug, Clone)]
enum Scripted {
    Reply(VecDeque<String>),
    Silent,
    Fail(io::ErrorKind),
}

/// Shared record of the commands a mock received
#[derive(Debug, Clone, Default)]
pub struct CommandLog(Arc<Mutex<Vec<String>>>);

impl CommandLog {
    fn push(&self, command: String) {
        if let Ok(mut log) = self.0.lock() {
            log.push(command);
        }
    }

    /// Commands in the order they were written
    pub fn commands(&self) -> Vec<String> {
        self.0.lock().map(|log| log.clone()).unwrap_or_default()
    }

    /// Number of times `command` was written
    pub fn count(&self, command: &str) -> usize {
        self.commands().iter().filter(|c| *c == command).count()
    }
}

/// Simulated ELM327 adapter
#[derive(Debug)]
pub struct MockElm327 {
    script: HashMap<String, Scripted>,
    echo: bool,
    pending: Vec<u8>,
    outbound: VecDeque<u8>,
    error: Option<io::ErrorKind>,
    log: CommandLog,
    /// Each write is accepted only after this long
    write_delay: Option<Duration>,
    write_stall: Option<Pin<Box<Sleep>>>,
}

impl Default for MockElm327 {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize(command: &str) -> String {
    command
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_uppercase()
}

impl MockElm327 {
    /// Adapter on a CAN 11-bit/500k vehicle that supports the common PIDs
    pub fn new() -> Self {
        Self {
            script: HashMap::new(),
            echo: true,
            pending: Vec::new(),
            outbound: VecDeque::new(),
            error: None,
            log: CommandLog::default(),
            write_delay: None,
            write_stall: None,
        }
        .reply("ATZ", "\rELM327 v1.5")
        .reply("ATI", "ELM327 v1.5")
        .reply("ATDPN", "A6")
        .reply("0100", "7E8 06 41 00 BE 3F A8 13")
    }

    /// Answer `command` with `body` followed by the prompt
    pub fn reply(self, command: &str, body: &str) -> Self {
        self.replies(command, &[body])
    }

    /// Answer successive `command`s with `bodies` in turn; the last repeats
    pub fn replies(mut self, command: &str, bodies: &[&str]) -> Self {
        let queue = bodies.iter().map(|b| b.to_string()).collect();
        self.script.insert(normalize(command), Scripted::Reply(queue));
        self
    }

    /// Never answer `command`
    pub fn silent(mut self, command: &str) -> Self {
        self.script.insert(normalize(command), Scripted::Silent);
        self
    }

    /// Fail the read after `command` with a transient framing error
    pub fn fail(self, command: &str) -> Self {
        self.fail_with(command, io::ErrorKind::InvalidData)
    }

    /// Fail the read after `command` with an error of `kind`
    pub fn fail_with(mut self, command: &str, kind: io::ErrorKind) -> Self {
        self.script.insert(normalize(command), Scripted::Fail(kind));
        self
    }

    /// Hold every write for `delay` before accepting it, like a slow link
    pub fn stall_writes(mut self, delay: Duration) -> Self {
        self.write_delay = Some(delay);
        self
    }

    /// Handle to the received commands, valid after the mock is moved
    pub fn command_log(&self) -> CommandLog {
        self.log.clone()
    }

    fn default_reply(command: &str) -> String {
        if command.starts_with("AT") {
            "OK".to_string()
        } else {
            "NO DATA".to_string()
        }
    }

    fn handle(&mut self, command: String) {
        self.log.push(command.clone());
        let echoed = self.echo;
        match command.as_str() {
            "ATZ" | "ATE1" => self.echo = true,
            "ATE0" => self.echo = false,
            _ => {}
        }

        let body = match self.script.get_mut(&command) {
            Some(Scripted::Silent) => return,
            Some(Scripted::Fail(kind)) => {
                self.error = Some(*kind);
                return;
            }
            Some(Scripted::Reply(queue)) => {
                if queue.len() > 1 {
                    queue.pop_front().unwrap_or_default()
                } else {
                    queue.front().cloned().unwrap_or_default()
                }
            }
            None => Self::default_reply(&command),
        };

        let mut text = String::new();
        if echoed {
            text.push_str(&command);
            text.push('\r');
        }
        text.push_str(&body);
        text.push_str("\r\r>");
        self.outbound.extend(text.bytes());
    }
}

impl AsyncRead for MockElm327 {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(kind) = self.error.take() {
            return Poll::Ready(Err(io::Error::new(kind, "simulated link failure")));
        }
        if self.outbound.is_empty() {
            // A silent adapter; the caller's deadline ends the wait
            return Poll::Pending;
        }
        let n = buf.remaining().min(CHUNK).min(self.outbound.len());
        let bytes: Vec<u8> = self.outbound.drain(..n).collect();
        buf.put_slice(&bytes);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MockElm327 {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if let Some(delay) = self.write_delay {
            let stall = self
                .write_stall
                .get_or_insert_with(|| Box::pin(tokio::time::sleep(delay)));
            if stall.as_mut().poll(cx).is_pending() {
                return Poll::Pending;
            }
            self.write_stall = None;
        }
        for byte in buf {
            if *byte == b'\r' {
                let line = std::mem::take(&mut self.pending);
                let command = normalize(&String::from_utf8_lossy(&line));
                if !command.is_empty() {
                    self.handle(command);
                }
            } else {
                self.pending.push(*byte);
            }
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl Link for MockElm327 {
    fn discard_input(&mut self) -> io::Result<()> {
        self.outbound.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn exchange(mock: &mut MockElm327, command: &str) -> String {
        mock.write_all(format!("{command}\r").as_bytes()).await.unwrap();
        let mut out = Vec::new();
        let mut buf = [0u8; 64];
        while !out.ends_with(b">") {
            let n = mock.read(&mut buf).await.unwrap();
            out.extend_from_slice(&buf[..n]);
        }
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn test_echo_until_disabled() {
        let mut mock = MockElm327::new();
        assert_eq!(exchange(&mut mock, "ATE0").await, "ATE0\rOK\r\r>");
        assert_eq!(exchange(&mut mock, "010C").await, "NO DATA\r\r>");
    }

    #[tokio::test]
    async fn test_reply_sequence() {
        let mut mock = MockElm327::new()
            .reply("ATE0", "OK")
            .replies("0100", &["NO DATA", "41 00 BE 3F A8 13"]);
        exchange(&mut mock, "ATE0").await;
        assert_eq!(exchange(&mut mock, "0100").await, "NO DATA\r\r>");
        assert_eq!(exchange(&mut mock, "01 00").await, "41 00 BE 3F A8 13\r\r>");
        assert_eq!(exchange(&mut mock, "0100").await, "41 00 BE 3F A8 13\r\r>");
        assert_eq!(mock.command_log().count("0100"), 3);
    }
}
