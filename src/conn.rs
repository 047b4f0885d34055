//! The per-connection protocol engine.
//!
//! [`Connection`] implements the convergence-layer state machine: the
//! contact-initiation handshake, segmenting outgoing bundles, reassembling
//! incoming ones, acknowledgements, keepalives, and shutdown. It is
//! written sans-I/O and is driven through the [`ClConnection`] capability
//! set; [`crate::driver`] supplies the byte stream and the clock, and the
//! tests wire two engines directly together.

use crate::bundle::Bundle;
use crate::event::{ContactReason, DaemonEvent};
use std::sync::Arc;
use std::time::{Duration, Instant};

mod connection;
mod contact_header;
mod inflight;

pub use connection::Connection;
pub use contact_header::{ContactHeader, MAGIC, SCL_VERSION};
pub use inflight::{InFlightBundle, IncomingBundle};

/// Wire message type codes. Every message is identified by its first byte;
/// the parser never looks further before dispatching.
pub const START_BUNDLE: u8 = 0x01;
pub const END_BUNDLE: u8 = 0x02;
pub const DATA_SEGMENT: u8 = 0x03;
pub const ACK_SEGMENT: u8 = 0x04;
pub const KEEPALIVE: u8 = 0x05;
pub const SHUTDOWN: u8 = 0x06;

/// The operations a convergence-layer connection supplies to its loop
/// driver. The driver is parametric over this set, so variants of the
/// stream protocol can reuse the same loop.
pub trait ClConnection {
    /// Queues this side's contact header and announce bundle. Called once,
    /// immediately on connect, on both the active and passive sides; the
    /// exchange is full duplex and never serialized.
    fn initiate_contact(&mut self, now: Instant);

    /// Enqueues a bundle for transmission.
    fn handle_send_bundle(&mut self, bundle: Arc<Bundle>);

    /// Mid-stream cancellation is not supported by this protocol; this is
    /// a documented no-op.
    fn handle_cancel_bundle(&mut self, bundle: &Bundle);

    /// Moves queued acks and bundle data into the send buffer. Returns
    /// whether anything new was queued; the driver keeps calling until the
    /// engine has nothing more to add.
    fn send_pending_data(&mut self, now: Instant) -> bool;

    /// Processes whatever bytes have accumulated in the receive buffer.
    fn process_data(&mut self, now: Instant);

    /// Runs the data-timeout, idle-close, and keepalive checks.
    fn handle_poll_timeout(&mut self, now: Instant);

    /// Tears the contact down. Idempotent.
    fn break_contact(&mut self, reason: ContactReason);

    /// Appends bytes read from the transport to the receive buffer.
    fn receive_bytes(&mut self, bytes: &[u8]);

    /// The number of unprocessed received bytes.
    fn recv_pending(&self) -> usize;

    /// Bytes waiting to be written to the transport.
    fn pending_output(&self) -> &[u8];

    /// Marks `n` output bytes as written.
    fn consume_output(&mut self, n: usize);

    /// Takes the next queued daemon event, in posting order.
    fn poll_event(&mut self) -> Option<DaemonEvent>;

    fn is_broken(&self) -> bool;

    /// How long the driver may sleep between poll timeouts.
    fn poll_interval(&self) -> Duration;
}
