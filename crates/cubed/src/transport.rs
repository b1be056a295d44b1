//! Newline-delimited JSON framing over TCP, for director links and
//! client sessions alike. One frame per line:
//!
//!   {"cellet": "Contact", "envelope": {"name": "...", "params": {...}}}

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use cube_core::Envelope;
use cube_dispatch::{Endpoint, Performer, Session, SessionId, Speaker};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub cellet: String,
    pub envelope: Envelope,
}

pub fn encode(cellet: &str, envelope: &Envelope) -> Result<Bytes> {
    let mut line = serde_json::to_vec(&FrameRef { cellet, envelope }).context("failed to encode frame")?;
    line.push(b'\n');
    Ok(Bytes::from(line))
}

pub fn decode(line: &str) -> Result<Frame> {
    serde_json::from_str(line).context("malformed frame")
}

#[derive(Serialize)]
struct FrameRef<'a> {
    cellet: &'a str,
    envelope: &'a Envelope,
}

/// Drain `rx` onto the socket until every sender is gone.
async fn write_loop(mut write: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Bytes>, peer: String) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write.write_all(&frame).await {
            tracing::warn!(peer = %peer, error = %e, "write failed");
            return;
        }
    }
    let _ = write.shutdown().await;
    tracing::debug!(peer = %peer, "writer closed");
}

// ── Director links ────────────────────────────────────────────────────────────

/// Outbound half of a director connection; frames are queued to a writer task.
pub struct DirectorLink {
    endpoint: Endpoint,
    tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
}

impl Speaker for DirectorLink {
    fn speak(&self, cellet: &str, envelope: &Envelope) -> Result<()> {
        let frame = encode(cellet, envelope)?;
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        match tx.as_ref() {
            Some(tx) => tx
                .send(frame)
                .map_err(|_| anyhow::anyhow!("link to {} is closed", self.endpoint)),
            None => anyhow::bail!("link to {} was shut down", self.endpoint),
        }
    }

    fn close(&self) {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        tracing::debug!(endpoint = %self.endpoint, "director link closed");
    }
}

/// Connect to a director; inbound frames are routed into `performer`.
pub async fn connect_director(endpoint: Endpoint, performer: Arc<Performer>) -> Result<Arc<dyn Speaker>> {
    let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
        .await
        .with_context(|| format!("failed to connect to director {endpoint}"))?;
    stream.set_nodelay(true).ok();
    let (read, write) = stream.into_split();

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(write_loop(write, rx, endpoint.to_string()));
    tokio::spawn(director_read_loop(read, endpoint.clone(), performer));

    Ok(Arc::new(DirectorLink {
        endpoint,
        tx: Mutex::new(Some(tx)),
    }))
}

async fn director_read_loop(read: OwnedReadHalf, endpoint: Endpoint, performer: Arc<Performer>) {
    let mut lines = BufReader::new(read).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => match decode(&line) {
                Ok(frame) => performer.on_received(&frame.cellet, frame.envelope),
                Err(e) => tracing::warn!(%endpoint, error = %e, "dropping director frame"),
            },
            Ok(None) => {
                tracing::warn!(%endpoint, "director closed the link");
                return;
            }
            Err(e) => {
                tracing::warn!(%endpoint, error = %e, "director read failed");
                return;
            }
        }
    }
}

// ── Client sessions ───────────────────────────────────────────────────────────

/// A connected client. Invalid once its socket closes; the failure time is
/// what the reaper's device grace window counts from.
pub struct ClientSession {
    id: SessionId,
    peer: String,
    valid: AtomicBool,
    failed_at: Mutex<Option<Instant>>,
    tx: mpsc::UnboundedSender<Bytes>,
}

impl ClientSession {
    pub fn new(id: SessionId, peer: String, tx: mpsc::UnboundedSender<Bytes>) -> Self {
        Self {
            id,
            peer,
            valid: AtomicBool::new(true),
            failed_at: Mutex::new(None),
            tx,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Queue a frame for the client. False once the session is gone.
    pub fn send(&self, cellet: &str, envelope: &Envelope) -> bool {
        if !self.is_valid() {
            return false;
        }
        match encode(cellet, envelope) {
            Ok(frame) => self.tx.send(frame).is_ok(),
            Err(e) => {
                tracing::warn!(session = %self.id, error = %e, "frame not encoded");
                false
            }
        }
    }

    pub fn invalidate(&self) {
        if self.valid.swap(false, Ordering::AcqRel) {
            *self.failed_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        }
    }
}

impl Session for ClientSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    fn failure_time(&self) -> Option<Instant> {
        *self.failed_at.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Split a client socket: spawn its writer, return the session and the
/// read half for the caller's frame loop.
pub fn accept_client(stream: TcpStream, id: SessionId) -> (Arc<ClientSession>, OwnedReadHalf) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    stream.set_nodelay(true).ok();
    let (read, write) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(write_loop(write, rx, peer.clone()));
    (Arc::new(ClientSession::new(id, peer, tx)), read)
}
