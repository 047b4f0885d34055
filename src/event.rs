//! Events the convergence layer posts to the bundle daemon.

use crate::bundle::{Bundle, EndpointId};
use crate::contact::ContactId;
use std::sync::Arc;

/// Why a contact went down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactReason {
    /// A protocol or transport error; abortive.
    Broken,
    /// The peer sent SHUTDOWN, or we closed in an orderly way.
    Shutdown,
    /// An on-demand link sat idle past its close time.
    Idle,
    /// The daemon asked for the contact to close.
    User,
}

/// An event posted to the daemon's queue. Within one connection, events are
/// posted in protocol order: receives in END_BUNDLE order, transmits in
/// final-ack order.
#[derive(Debug)]
pub enum DaemonEvent {
    /// The contact handshake completed.
    ContactUp { contact: ContactId },
    /// The contact closed; no further events follow for it.
    ContactDown {
        contact: ContactId,
        reason: ContactReason,
    },
    /// A bundle arrived from the peer. `bytes_received` counts payload
    /// bytes. `fragment` is set when a partially received bundle was
    /// salvaged from a broken contact under reactive fragmentation.
    BundleReceived {
        bundle: Bundle,
        from: EndpointId,
        bytes_received: usize,
        fragment: bool,
    },
    /// A bundle was fully sent and acknowledged. Both counts are payload
    /// bytes.
    BundleTransmitted {
        bundle: Arc<Bundle>,
        contact: ContactId,
        bytes_sent: usize,
        bytes_acked: usize,
    },
}
