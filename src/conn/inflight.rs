//! Per-direction, per-bundle transfer state.

use crate::bitmap::DataBitmap;
use crate::bundle::{protocol, Bundle};
use std::sync::Arc;

/// State for one bundle being sent to the peer.
///
/// Entries live on the connection's FIFO inflight queue until the bundle
/// has been fully segmented out (`finish_bundle` ran) and every formatted
/// byte is covered by `ack_data`.
#[derive(Debug)]
pub struct InFlightBundle {
    pub bundle: Arc<Bundle>,
    pub header_block_length: usize,
    pub tail_block_length: usize,
    /// Header blocks, payload, and tail blocks together.
    pub formatted_length: usize,
    /// Byte offsets copied into the send buffer so far.
    pub sent_data: DataBitmap,
    /// Byte offsets covered by cumulative acks from the peer.
    pub ack_data: DataBitmap,
}

impl InFlightBundle {
    pub fn new(bundle: Arc<Bundle>) -> Self {
        let header_block_length = protocol::header_block_length(&bundle);
        let tail_block_length = protocol::tail_block_length(&bundle);
        let formatted_length = header_block_length + bundle.payload.len() + tail_block_length;
        Self {
            bundle,
            header_block_length,
            tail_block_length,
            formatted_length,
            sent_data: DataBitmap::new(),
            ack_data: DataBitmap::new(),
        }
    }
}

/// State for one bundle arriving from the peer.
///
/// The entry at the back of the incoming queue is the one segments are
/// being read into; entries ahead of it are only waiting for their acks to
/// go out and are removed once `acked_length` reaches `total_length`.
#[derive(Debug, Default)]
pub struct IncomingBundle {
    /// Allocated once the header blocks of the first segment parse. Taken
    /// when the bundle is delivered to the daemon.
    pub bundle: Option<Bundle>,
    pub header_block_length: usize,
    /// Byte offsets received so far.
    pub rcvd_data: DataBitmap,
    /// The final offset of each received segment, cleared as acks are
    /// emitted.
    pub ack_data: DataBitmap,
    /// How many leading bytes have been acked to the peer.
    pub acked_length: usize,
    /// Set from `rcvd_data` when END_BUNDLE arrives; zero until then.
    pub total_length: usize,
}

impl IncomingBundle {
    pub fn new() -> Self {
        Self::default()
    }
}
