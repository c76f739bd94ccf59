//! TCP transport provider
//!
//! Connection attempts run as spawned tasks (dial out, or listen and wait
//! for the remote side to dial in, per the spec's `listen` flag) and report
//! into a completion channel; `poll` waits on that channel with a bounded
//! timeout. Every new connection exchanges handshake tokens before it is
//! handed to the session: the dialing side sends its token, the listening
//! side verifies and echoes it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use conclave_core::ConnectionSpec;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::frame::{read_frame, write_frame};
use crate::protocol::HANDSHAKE_TAG;
use crate::transport::{PeerGroup, PollStatus, TransportProvider};

enum Attempt {
    Pending,
    Ready(TcpStream, SocketAddr),
    Failed(String),
}

type Completion = (String, Result<(TcpStream, SocketAddr)>);

/// [`TransportProvider`] over tokio TCP.
pub struct TcpTransport {
    attempts: HashMap<String, Attempt>,
    completion_tx: mpsc::Sender<Completion>,
    completion_rx: mpsc::Receiver<Completion>,
    /// A failure landed via [`Self::drain_completions`] and has not yet
    /// been reported by `poll`.
    unreported_failure: bool,
}

impl TcpTransport {
    pub fn new() -> Self {
        let (completion_tx, completion_rx) = mpsc::channel(8);
        TcpTransport {
            attempts: HashMap::new(),
            completion_tx,
            completion_rx,
            unreported_failure: false,
        }
    }

    /// Move any finished attempts from the completion channel into the
    /// attempt table without blocking. Failures consumed here are held
    /// for the next `poll` to report.
    fn drain_completions(&mut self) {
        while let Ok((key, result)) = self.completion_rx.try_recv() {
            if result.is_err() {
                self.unreported_failure = true;
            }
            self.record_completion(key, result);
        }
    }

    fn record_completion(&mut self, key: String, result: Result<(TcpStream, SocketAddr)>) {
        match result {
            Ok((stream, peer)) => {
                debug!(spec = %key, peer = %peer, "Connection attempt completed");
                self.attempts.insert(key, Attempt::Ready(stream, peer));
            }
            Err(e) => {
                warn!(spec = %key, error = %e, "Connection attempt failed");
                self.attempts.insert(key, Attempt::Failed(e.to_string()));
            }
        }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportProvider for TcpTransport {
    async fn try_connect(&mut self, spec: &ConnectionSpec) -> Result<Option<Box<dyn PeerGroup>>> {
        self.drain_completions();

        let key = spec.to_spec_string();
        match self.attempts.get(&key) {
            // A failed attempt is finished, not terminal: a later connect
            // for the same spec starts over.
            None | Some(Attempt::Failed(_)) => {
                if let Some(Attempt::Failed(reason)) = self.attempts.remove(&key) {
                    debug!(spec = %key, reason = %reason, "Restarting failed connection attempt");
                }
                let tx = self.completion_tx.clone();
                let spec = spec.clone();
                let task_key = key.clone();
                tokio::spawn(async move {
                    let result = establish(&spec).await;
                    let _ = tx.send((task_key, result)).await;
                });
                self.attempts.insert(key, Attempt::Pending);
                Ok(None)
            }
            Some(Attempt::Pending) => Ok(None),
            Some(Attempt::Ready(..)) => {
                let Some(Attempt::Ready(stream, peer)) = self.attempts.remove(&key) else {
                    unreachable!();
                };
                info!(spec = %key, peer = %peer, "Peer group established");
                Ok(Some(Box::new(TcpPeerGroup { stream, peer })))
            }
        }
    }

    async fn poll(&mut self, timeout: Duration) -> PollStatus {
        if self.unreported_failure {
            self.unreported_failure = false;
            return PollStatus::Error;
        }
        match tokio::time::timeout(timeout, self.completion_rx.recv()).await {
            Ok(Some((key, result))) => {
                let failed = result.is_err();
                self.record_completion(key, result);
                if failed {
                    PollStatus::Error
                } else {
                    PollStatus::Activity
                }
            }
            // We hold a sender, so the channel cannot close under us.
            Ok(None) => PollStatus::Error,
            Err(_) => PollStatus::Timeout,
        }
    }
}

/// Run one connection attempt to completion, handshake included.
async fn establish(spec: &ConnectionSpec) -> Result<(TcpStream, SocketAddr)> {
    if spec.listen {
        let listener = TcpListener::bind(("0.0.0.0", spec.port)).await?;
        debug!(port = spec.port, "Listening for reverse connection");
        let (mut stream, peer) = listener.accept().await?;
        verify_and_echo_handshake(&mut stream, &spec.handshake).await?;
        Ok((stream, peer))
    } else {
        let mut stream = TcpStream::connect((spec.host.as_str(), spec.port)).await?;
        let peer = stream.peer_addr()?;
        send_handshake(&mut stream, &spec.handshake).await?;
        Ok((stream, peer))
    }
}

/// Dialing side: send our token, expect it echoed back.
async fn send_handshake(stream: &mut TcpStream, token: &str) -> Result<()> {
    write_frame(stream, HANDSHAKE_TAG, token.as_bytes()).await?;
    let (tag, payload) = read_frame(stream).await?;
    if tag != HANDSHAKE_TAG || payload != token.as_bytes() {
        return Err(Error::Handshake(format!(
            "Peer did not confirm {token:?}"
        )));
    }
    Ok(())
}

/// Listening side: the remote dialer speaks first; verify and echo.
async fn verify_and_echo_handshake(stream: &mut TcpStream, token: &str) -> Result<()> {
    let (tag, payload) = read_frame(stream).await?;
    if tag != HANDSHAKE_TAG || payload != token.as_bytes() {
        return Err(Error::Handshake(format!(
            "Peer offered {:?}, expected {token:?}",
            String::from_utf8_lossy(&payload)
        )));
    }
    write_frame(stream, HANDSHAKE_TAG, token.as_bytes()).await?;
    Ok(())
}

/// One established TCP connection to a peer group. The remote entry point
/// fans broadcasts out to the rest of the group; the root's replies come
/// back on this same stream.
pub struct TcpPeerGroup {
    stream: TcpStream,
    peer: SocketAddr,
}

impl TcpPeerGroup {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

#[async_trait]
impl PeerGroup for TcpPeerGroup {
    async fn broadcast_to_all(&mut self, tag: u32, message: &[u8]) -> Result<()> {
        write_frame(&mut self.stream, tag, message).await
    }

    async fn receive_from_root(&mut self, tag: u32, len: usize) -> Result<Vec<u8>> {
        let (frame_tag, payload) = read_frame(&mut self.stream).await?;
        if frame_tag != tag {
            return Err(Error::Protocol(format!(
                "Expected tag {tag}, received {frame_tag}"
            )));
        }
        if payload.len() != len {
            return Err(Error::Protocol(format!(
                "Expected {len} bytes from root, received {}",
                payload.len()
            )));
        }
        Ok(payload)
    }
}
