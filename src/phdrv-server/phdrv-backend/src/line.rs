// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Line framed links over byte streams.
//!
//! Every message ends with `\n`; a trailing `\r` is dropped. Devices on
//! these links report service requests in-band as `SRQ <code>` lines, which
//! are split off from the replies as they are read.

use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::trace;

use phdrv_core::link::LinkFuture;
use phdrv_core::{Link, LinkError, LinkKind};

const EVENT_PREFIX: &str = "SRQ";
const READ_CHUNK: usize = 256;
const MAX_LINE: usize = 4096;

/// Byte stream a [`LineLink`] can run on.
pub trait LineStream: AsyncRead + AsyncWrite + Unpin + Send {
    /// Drop input the device sent that nobody has read yet.
    fn discard_input(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl LineStream for TcpStream {}

impl LineStream for DuplexStream {}

pub struct LineLink<S> {
    stream: S,
    kind: LinkKind,
    partial: Vec<u8>,
    replies: VecDeque<Vec<u8>>,
    events: VecDeque<u8>,
}

impl LineLink<TcpStream> {
    pub fn tcp(stream: TcpStream) -> Self {
        Self::new(stream, LinkKind::Lan)
    }
}

impl<S: LineStream> LineLink<S> {
    pub fn new(stream: S, kind: LinkKind) -> Self {
        Self {
            stream,
            kind,
            partial: Vec::new(),
            replies: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    /// Read until one more line has been queued as a reply or an event.
    async fn read_line(&mut self) -> Result<(), LinkError> {
        loop {
            if let Some(end) = self.partial.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.partial.drain(..=end).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                self.route(line);
                return Ok(());
            }
            if self.partial.len() > MAX_LINE {
                self.partial.clear();
                return Err(LinkError::Transport(format!(
                    "no line terminator within {} bytes",
                    MAX_LINE
                )));
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(LinkError::Transport("connection closed by device".into()));
            }
            self.partial.extend_from_slice(&chunk[..n]);
        }
    }

    fn route(&mut self, line: Vec<u8>) {
        match parse_event(&line) {
            Some(code) => {
                trace!("in-band event 0x{:02x}", code);
                self.events.push_back(code);
            }
            None => self.replies.push_back(line),
        }
    }
}

/// `SRQ 65` or `SRQ 0x41`.
fn parse_event(line: &[u8]) -> Option<u8> {
    let text = std::str::from_utf8(line).ok()?.trim();
    let code = text.strip_prefix(EVENT_PREFIX)?.trim();
    match code.strip_prefix("0x").or_else(|| code.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16).ok(),
        None => code.parse().ok(),
    }
}

impl<S: LineStream> Link for LineLink<S> {
    fn kind(&self) -> LinkKind {
        self.kind
    }

    fn send<'a>(&'a mut self, message: &'a [u8], limit: Duration) -> LinkFuture<'a, ()> {
        Box::pin(async move {
            let write = async {
                self.stream.write_all(message).await?;
                self.stream.flush().await
            };
            timeout(limit, write).await.map_err(|_| LinkError::Timeout)??;
            Ok(())
        })
    }

    fn receive<'a>(&'a mut self, limit: Duration) -> LinkFuture<'a, Vec<u8>> {
        Box::pin(async move {
            let wait = async {
                while self.replies.is_empty() {
                    self.read_line().await?;
                }
                Ok::<(), LinkError>(())
            };
            timeout(limit, wait).await.map_err(|_| LinkError::Timeout)??;
            self.replies.pop_front().ok_or(LinkError::Timeout)
        })
    }

    fn poll_event<'a>(&'a mut self, limit: Duration) -> LinkFuture<'a, Option<u8>> {
        Box::pin(async move {
            if let Some(code) = self.events.pop_front() {
                return Ok(Some(code));
            }
            let wait = async {
                while self.events.is_empty() {
                    self.read_line().await?;
                }
                Ok::<(), LinkError>(())
            };
            match timeout(limit, wait).await {
                Ok(result) => result?,
                Err(_) => return Ok(None),
            }
            Ok(self.events.pop_front())
        })
    }

    fn clear<'a>(&'a mut self) -> LinkFuture<'a, ()> {
        Box::pin(async move {
            self.partial.clear();
            self.replies.clear();
            self.events.clear();
            self.stream.discard_input()?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    const WAIT: Duration = Duration::from_millis(50);

    fn pair() -> (LineLink<DuplexStream>, DuplexStream) {
        let (near, far) = duplex(1024);
        (LineLink::new(near, LinkKind::Lan), far)
    }

    #[tokio::test]
    async fn test_lines_and_events_are_split() {
        let (mut link, mut device) = pair();
        device
            .write_all(b"HELLO\r\nSRQ 0x41\r\nWORLD\n")
            .await
            .unwrap();

        assert_eq!(link.receive(WAIT).await, Ok(b"HELLO".to_vec()));
        assert_eq!(link.poll_event(Duration::ZERO).await, Ok(Some(0x41)));
        assert_eq!(link.receive(WAIT).await, Ok(b"WORLD".to_vec()));
        assert_eq!(link.poll_event(Duration::ZERO).await, Ok(None));
    }

    #[tokio::test]
    async fn test_event_ahead_of_reply() {
        let (mut link, mut device) = pair();
        device.write_all(b"SRQ 65\nOK\n").await.unwrap();

        assert_eq!(link.receive(WAIT).await, Ok(b"OK".to_vec()));
        assert_eq!(link.poll_event(WAIT).await, Ok(Some(65)));
    }

    #[tokio::test]
    async fn test_reply_split_across_writes() {
        let (mut link, mut device) = pair();
        device.write_all(b"12 ").await.unwrap();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            device.write_all(b"34\r\n").await.unwrap();
            device
        });
        assert_eq!(link.receive(Duration::from_secs(1)).await, Ok(b"12 34".to_vec()));
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_and_closed_peer() {
        let (mut link, device) = pair();
        assert_eq!(link.receive(WAIT).await, Err(LinkError::Timeout));
        drop(device);
        assert!(matches!(
            link.receive(WAIT).await,
            Err(LinkError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_send_and_clear() {
        let (mut link, mut device) = pair();
        link.send(b"SQB?\r\n", WAIT).await.unwrap();
        let mut buf = [0u8; 6];
        device.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"SQB?\r\n");

        device.write_all(b"stale\nSRQ 1\n").await.unwrap();
        assert_eq!(link.poll_event(WAIT).await, Ok(Some(1)));
        link.clear().await.unwrap();
        assert_eq!(link.receive(WAIT).await, Err(LinkError::Timeout));
    }

    #[test]
    fn test_parse_event() {
        assert_eq!(parse_event(b"SRQ 0x10"), Some(0x10));
        assert_eq!(parse_event(b"SRQ 33"), Some(33));
        assert_eq!(parse_event(b"SRQ"), None);
        assert_eq!(parse_event(b"BIN 1:1"), None);
    }
}
