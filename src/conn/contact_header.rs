//! The fixed-size header both sides write at connection establishment.

use crate::link::LinkParams;

/// "dtn!" in network byte order.
pub const MAGIC: u32 = 0x6474_6e21;

/// The protocol version this engine speaks. A peer advertising anything
/// else is disconnected.
pub const SCL_VERSION: u8 = 3;

const SEGMENT_ACK_ENABLED: u8 = 1 << 0;
const REACTIVE_FRAG_ENABLED: u8 = 1 << 1;

/// The 8-byte contact header: magic, version, negotiation flags, and the
/// advertised keepalive interval in seconds, all big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContactHeader {
    pub magic: u32,
    pub version: u8,
    pub flags: u8,
    pub keepalive_interval: u16,
}

impl ContactHeader {
    pub const LEN: usize = 8;

    /// Builds the header this side advertises.
    pub fn from_params(params: &LinkParams) -> Self {
        let mut flags = 0;
        if params.segment_ack_enabled {
            flags |= SEGMENT_ACK_ENABLED;
        }
        if params.reactive_frag_enabled {
            flags |= REACTIVE_FRAG_ENABLED;
        }
        Self {
            magic: MAGIC,
            version: SCL_VERSION,
            flags,
            keepalive_interval: params.keepalive_interval,
        }
    }

    pub fn segment_ack_enabled(&self) -> bool {
        self.flags & SEGMENT_ACK_ENABLED != 0
    }

    pub fn reactive_frag_enabled(&self) -> bool {
        self.flags & REACTIVE_FRAG_ENABLED != 0
    }

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[..4].copy_from_slice(&self.magic.to_be_bytes());
        buf[4] = self.version;
        buf[5] = self.flags;
        buf[6..8].copy_from_slice(&self.keepalive_interval.to_be_bytes());
        buf
    }

    /// Reads a header from the front of `buf`, or `None` when fewer than
    /// eight bytes have arrived. Magic and version are the caller's to
    /// check.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::LEN {
            return None;
        }
        Some(Self {
            magic: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            version: buf[4],
            flags: buf[5],
            keepalive_interval: u16::from_be_bytes([buf[6], buf[7]]),
        })
    }
}
