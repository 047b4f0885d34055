//! The bundle data model and the pieces of the bundle protocol the
//! convergence layer needs: computing formatted lengths, formatting and
//! parsing header blocks, and the announce bundle exchanged at contact
//! start.
//!
//! The convergence layer treats bundles as mostly opaque. It needs to know
//! how long the formatted form is, how to put the header blocks on the wire
//! ahead of the payload, and how to rebuild a bundle from received header
//! bytes; everything else (routing, expiration handling, custody) belongs
//! to the daemon.

use std::sync::atomic::{AtomicU64, Ordering};

mod announce;
mod eid;
mod payload;
pub mod protocol;

pub use announce::{create_announce_bundle, parse_announce_bundle};
pub use eid::{EidError, EndpointId};
pub use payload::BundlePayload;
pub use protocol::{formatted_length, header_block_length, tail_block_length, CodecError};

static NEXT_BUNDLE_ID: AtomicU64 = AtomicU64::new(1);

/// A DTN application data unit: header blocks, a payload, and optional
/// trailing blocks.
#[derive(Debug)]
pub struct Bundle {
    /// A stable id, unique within this process. Used for logging and for
    /// matching cancel requests; never put on the wire.
    pub id: u64,
    pub source: EndpointId,
    pub dest: EndpointId,
    pub replyto: EndpointId,
    pub custodian: EndpointId,
    pub is_admin: bool,
    /// Lifetime in seconds.
    pub expiration: u32,
    pub payload: BundlePayload,
}

impl Bundle {
    /// Creates an empty bundle addressed from and to the null endpoint.
    pub fn new() -> Self {
        Self {
            id: NEXT_BUNDLE_ID.fetch_add(1, Ordering::Relaxed),
            source: EndpointId::null(),
            dest: EndpointId::null(),
            replyto: EndpointId::null(),
            custodian: EndpointId::null(),
            is_admin: false,
            expiration: 0,
            payload: BundlePayload::new(),
        }
    }
}

impl Default for Bundle {
    fn default() -> Self {
        Self::new()
    }
}
