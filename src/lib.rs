//! A stream convergence layer for a delay/disruption-tolerant networking
//! (DTN) bundle router.
//!
//! A convergence layer adapts bundles to a particular kind of underlying
//! network. This one runs over any reliable, ordered byte stream (TCP and
//! friends) and implements the per-peer protocol that frames bundles into
//! segments, negotiates a session at contact start, acknowledges received
//! segments, emits keepalives, detects idle or broken contacts, and shuts
//! down gracefully.
//!
//! # Organization
//!
//! - [`sdnv`], [`buffer`], and [`bitmap`] provide the wire-level utilities:
//!   self-delimiting numeric values, the send/receive byte buffers, and
//!   run-length tracking of which byte offsets of a bundle have been sent,
//!   received, or acknowledged.
//! - [`bundle`] is the bundle-protocol facade: the bundle data model, the
//!   header-block codec, and the announce bundle exchanged at contact start.
//! - [`link`] and [`contact`] describe how to reach a peer and track the
//!   time-bounded communication opportunities with it.
//! - [`conn`] implements the per-connection protocol engine. The engine is
//!   written sans-I/O so that two peers can be wired directly together in
//!   tests; [`driver`] runs an engine against a real byte stream on tokio.
//! - [`event`] defines the events the engine posts to the bundle daemon.
//!
//! # Engine structure
//!
//! [`conn::Connection`] owns all per-connection state: the send and receive
//! buffers, the queues of in-flight and incoming bundles, the negotiated
//! link parameters, and the keepalive/idle timers. It never touches a
//! socket. The driver pushes received bytes in, drains pending output, and
//! calls into the engine at poll timeouts; everything else happens inside
//! the state machine.

pub mod bitmap;
pub mod buffer;
pub mod bundle;
pub mod conn;
pub mod contact;
pub mod driver;
pub mod event;
pub mod link;
pub mod sdnv;

pub use bitmap::DataBitmap;
pub use buffer::StreamBuffer;
pub use bundle::{Bundle, EndpointId};
pub use conn::{ClConnection, Connection};
pub use contact::{ContactId, ContactManager, LinkId};
pub use event::{ContactReason, DaemonEvent};
pub use link::{LinkParams, LinkType};

use dashmap::DashMap;
use std::hash::BuildHasherDefault;
pub type FxDashMap<K, V> = DashMap<K, V, BuildHasherDefault<rustc_hash::FxHasher>>;
