//! Transport capabilities
//!
//! The session never touches sockets directly. It drives a
//! [`TransportProvider`] that turns connection specs into established
//! [`PeerGroup`] handles, and speaks to each group through the handle's
//! broadcast/receive primitives. The TCP implementation lives in
//! [`crate::tcp`]; tests substitute a scripted provider.

use std::time::Duration;

use async_trait::async_trait;
use conclave_core::ConnectionSpec;

use crate::error::Result;

/// Outcome of one bounded wait for connection progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    /// At least one pending attempt made progress; retry `try_connect`.
    Activity,
    /// Nothing happened within the wait.
    Timeout,
    /// Transport-level failure; the connect loop gives up.
    Error,
}

/// Produces connected peer-group handles from connection specs.
#[async_trait]
pub trait TransportProvider: Send {
    /// Start (or re-check) a connection attempt for `spec`. Returns the
    /// established handle once the attempt has completed, `None` while it
    /// is still pending. Idempotent per spec: repeat calls never launch a
    /// second attempt for an attempt already in flight.
    async fn try_connect(&mut self, spec: &ConnectionSpec) -> Result<Option<Box<dyn PeerGroup>>>;

    /// Advance pending attempts, waiting at most `timeout`.
    async fn poll(&mut self, timeout: Duration) -> PollStatus;
}

/// An established connection to every participant of one remote process
/// group, with one designated root. Exclusively owned by the session that
/// created it; dropping the handle releases the connection.
#[async_trait]
pub trait PeerGroup: Send {
    /// Send one tagged message to all participants of the group.
    async fn broadcast_to_all(&mut self, tag: u32, message: &[u8]) -> Result<()>;

    /// Receive exactly `len` bytes from the group's root for `tag`. A
    /// short or failed read is an error.
    async fn receive_from_root(&mut self, tag: u32, len: usize) -> Result<Vec<u8>>;
}
