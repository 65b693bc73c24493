//! Outgoing half of a DDP transport plus a newline-delimited JSON client over TCP.
//!
//! The connection engine only needs `send`. Incoming frames and transport
//! resets are pushed into it with [`Connection::on_message`] and
//! [`Connection::on_reset`].

use bytes::{Buf, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

use crate::connection::Connection;
use crate::error::Result;

pub trait Stream: Send + Sync {
    fn send(&self, text: String);
}

/// Stream backed by an unbounded channel. The receiving half is drained by a
/// transport task, or inspected directly in tests.
#[derive(Clone)]
pub struct ChannelStream {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelStream {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Stream for ChannelStream {
    fn send(&self, text: String) {
        if self.tx.send(text).is_err() {
            tracing::debug!("stream closed; dropping outgoing message");
        }
    }
}

/// Maximum frame accepted from the server.
const MAX_FRAME: usize = 16 * 1024 * 1024;

/// Drive `conn` over TCP until `shutdown` flips to true, reconnecting after
/// `reconnect_delay` whenever the socket drops. Frames are one JSON object per line.
pub async fn run_tcp(
    addr: String,
    conn: Connection,
    mut outgoing: mpsc::UnboundedReceiver<String>,
    reconnect_delay: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        if *shutdown.borrow() {
            return Ok(());
        }
        match TcpStream::connect(&addr).await {
            Ok(socket) => {
                tracing::info!(addr = %addr, "connected");
                // Anything queued while disconnected is re-sent by on_reset.
                while outgoing.try_recv().is_ok() {}
                conn.on_reset();
                match pump(socket, &conn, &mut outgoing, &mut shutdown).await {
                    Ok(PumpExit::Shutdown) => return Ok(()),
                    Ok(PumpExit::Disconnected) => tracing::warn!(addr = %addr, "connection closed by server"),
                    Err(e) => tracing::warn!(addr = %addr, error = %e, "connection error"),
                }
            }
            Err(e) => tracing::warn!(addr = %addr, error = %e, "connect failed"),
        }
        tokio::select! {
            _ = tokio::time::sleep(reconnect_delay) => {}
            _ = shutdown.changed() => {}
        }
    }
}

enum PumpExit {
    Disconnected,
    Shutdown,
}

async fn pump(
    socket: TcpStream,
    conn: &Connection,
    outgoing: &mut mpsc::UnboundedReceiver<String>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<PumpExit> {
    let (mut reader, mut writer) = socket.into_split();
    let mut buf = BytesMut::with_capacity(16 * 1024);
    loop {
        tokio::select! {
            read = reader.read_buf(&mut buf) => {
                if read? == 0 {
                    return Ok(PumpExit::Disconnected);
                }
                while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let line = buf.split_to(pos);
                    buf.advance(1);
                    let text = String::from_utf8_lossy(&line);
                    let text = text.trim();
                    if !text.is_empty() {
                        conn.on_message(text);
                    }
                }
                if buf.len() > MAX_FRAME {
                    return Err(crate::error::Error::Protocol("frame exceeds maximum size".into()));
                }
            }
            out = outgoing.recv() => match out {
                Some(mut text) => {
                    text.push('\n');
                    writer.write_all(text.as_bytes()).await?;
                }
                None => return Ok(PumpExit::Shutdown),
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(PumpExit::Shutdown);
                }
            }
        }
    }
}
