//! The announce bundle exchanged inside the contact handshake.
//!
//! An announce is an admin bundle whose source names the sending router;
//! everything else is nulled out. The payload is a single octet carrying
//! the admin record type in the high nibble.

use super::{Bundle, EndpointId};

/// Admin record type for an announce, carried in the high nibble of the
/// one-byte payload.
pub const ADMIN_ANNOUNCE: u8 = 0x0a;

/// Builds the announce bundle for this router.
pub fn create_announce_bundle(local_eid: &EndpointId) -> Bundle {
    let mut announce = Bundle::new();

    // only meant for DTN admin consumption
    announce.is_admin = true;
    announce.source = local_eid.clone();
    announce.dest = EndpointId::null();
    announce.replyto = EndpointId::null();
    announce.custodian = EndpointId::null();

    // non-zero expire time
    announce.expiration = 3600;

    announce.payload.set_data(&[ADMIN_ANNOUNCE << 4]);
    announce
}

/// Extracts the peer's endpoint id from a received announce bundle, or
/// `None` if the bundle is not an announce.
pub fn parse_announce_bundle(bundle: &Bundle) -> Option<EndpointId> {
    if !bundle.is_admin {
        return None;
    }
    let payload = bundle.payload.as_slice();
    if payload.is_empty() || payload[0] >> 4 != ADMIN_ANNOUNCE {
        return None;
    }
    Some(bundle.source.clone())
}
