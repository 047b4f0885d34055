//! The bundle wire codec: formatted lengths, header-block formatting and
//! parsing, and whole-bundle formatting for the announce exchange.
//!
//! The layout is a version octet, a flags octet, the four endpoint ids as
//! SDNV-length-prefixed strings, then SDNVs for the expiration and the
//! payload length. There are no tail blocks in this codec, but the lengths
//! are reported separately so the engine treats them generically.

use super::{Bundle, BundlePayload, EndpointId};
use crate::sdnv::{self, SdnvError};
use thiserror::Error as ThisError;

pub const BP_VERSION: u8 = 0x06;

const FLAG_ADMIN: u8 = 0x01;

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    /// The input ended mid-structure. More bytes may complete the parse.
    #[error("input ended before the structure was complete")]
    Incomplete,
    /// The input cannot be a bundle no matter how many bytes follow.
    #[error("malformed bundle data")]
    Malformed,
}

impl From<SdnvError> for CodecError {
    fn from(err: SdnvError) -> Self {
        match err {
            SdnvError::Incomplete => CodecError::Incomplete,
            _ => CodecError::Malformed,
        }
    }
}

fn eid_len(eid: &EndpointId) -> usize {
    let bytes = eid.as_str().len();
    sdnv::encoding_len(bytes as u64) + bytes
}

/// The length of the formatted header blocks for `bundle`.
pub fn header_block_length(bundle: &Bundle) -> usize {
    2 + eid_len(&bundle.source)
        + eid_len(&bundle.dest)
        + eid_len(&bundle.replyto)
        + eid_len(&bundle.custodian)
        + sdnv::encoding_len(u64::from(bundle.expiration))
        + sdnv::encoding_len(bundle.payload.len() as u64)
}

/// The length of the formatted tail blocks for `bundle`. This codec has
/// none.
pub fn tail_block_length(_bundle: &Bundle) -> usize {
    0
}

/// The total formatted length: header blocks, payload, tail blocks.
pub fn formatted_length(bundle: &Bundle) -> usize {
    header_block_length(bundle) + bundle.payload.len() + tail_block_length(bundle)
}

fn put_eid(eid: &EndpointId, buf: &mut [u8], mut at: usize) -> usize {
    let bytes = eid.as_str().as_bytes();
    at += sdnv::encode(bytes.len() as u64, &mut buf[at..]).unwrap();
    buf[at..at + bytes.len()].copy_from_slice(bytes);
    at + bytes.len()
}

/// Formats the header blocks into the front of `buf` and returns the
/// number of bytes written, always exactly [`header_block_length`]. The
/// caller sizes the buffer first.
pub fn format_header_blocks(bundle: &Bundle, buf: &mut [u8]) -> usize {
    let len = header_block_length(bundle);
    assert!(buf.len() >= len);

    buf[0] = BP_VERSION;
    buf[1] = if bundle.is_admin { FLAG_ADMIN } else { 0 };
    let mut at = 2;
    at = put_eid(&bundle.source, buf, at);
    at = put_eid(&bundle.dest, buf, at);
    at = put_eid(&bundle.replyto, buf, at);
    at = put_eid(&bundle.custodian, buf, at);
    at += sdnv::encode(u64::from(bundle.expiration), &mut buf[at..]).unwrap();
    at += sdnv::encode(bundle.payload.len() as u64, &mut buf[at..]).unwrap();

    assert_eq!(at, len);
    at
}

/// Formats the whole bundle (headers then payload) and returns the number
/// of bytes written, always exactly [`formatted_length`].
pub fn format_bundle(bundle: &Bundle, buf: &mut [u8]) -> usize {
    let header_len = format_header_blocks(bundle, buf);
    let payload = bundle.payload.as_slice();
    assert!(buf.len() >= header_len + payload.len());
    buf[header_len..header_len + payload.len()].copy_from_slice(payload);
    header_len + payload.len()
}

fn take_eid(buf: &[u8], at: usize) -> Result<(EndpointId, usize), CodecError> {
    let (len, sdnv_len) = sdnv::decode(&buf[at..])?;
    let len = usize::try_from(len).map_err(|_| CodecError::Malformed)?;
    let start = at + sdnv_len;
    if buf.len() < start + len {
        return Err(CodecError::Incomplete);
    }
    let text = std::str::from_utf8(&buf[start..start + len]).map_err(|_| CodecError::Malformed)?;
    let eid = text.parse().map_err(|_| CodecError::Malformed)?;
    Ok((eid, start + len))
}

/// Parses header blocks from the front of `buf`, returning the new bundle
/// (payload sized but unfilled) and the number of bytes consumed.
pub fn parse_header_blocks(buf: &[u8]) -> Result<(Bundle, usize), CodecError> {
    if buf.len() < 2 {
        return Err(CodecError::Incomplete);
    }
    if buf[0] != BP_VERSION {
        return Err(CodecError::Malformed);
    }
    if buf[1] & !FLAG_ADMIN != 0 {
        return Err(CodecError::Malformed);
    }
    let is_admin = buf[1] & FLAG_ADMIN != 0;

    let (source, at) = take_eid(buf, 2)?;
    let (dest, at) = take_eid(buf, at)?;
    let (replyto, at) = take_eid(buf, at)?;
    let (custodian, at) = take_eid(buf, at)?;
    let (expiration, sdnv_len) = sdnv::decode(&buf[at..])?;
    let at = at + sdnv_len;
    let (payload_len, sdnv_len) = sdnv::decode(&buf[at..])?;
    let at = at + sdnv_len;

    let expiration = u32::try_from(expiration).map_err(|_| CodecError::Malformed)?;
    let payload_len = usize::try_from(payload_len).map_err(|_| CodecError::Malformed)?;

    let mut payload = BundlePayload::new();
    payload.set_length(payload_len);

    let mut bundle = Bundle::new();
    bundle.source = source;
    bundle.dest = dest;
    bundle.replyto = replyto;
    bundle.custodian = custodian;
    bundle.is_admin = is_admin;
    bundle.expiration = expiration;
    bundle.payload = payload;
    Ok((bundle, at))
}

/// Parses a whole formatted bundle, returning it and the number of bytes
/// consumed.
pub fn parse_bundle(buf: &[u8]) -> Result<(Bundle, usize), CodecError> {
    let (mut bundle, header_len) = parse_header_blocks(buf)?;
    let payload_len = bundle.payload.len();
    if buf.len() < header_len + payload_len {
        return Err(CodecError::Incomplete);
    }
    bundle
        .payload
        .write_data(0, &buf[header_len..header_len + payload_len]);
    bundle.payload.close_file();
    Ok((bundle, header_len + payload_len))
}
