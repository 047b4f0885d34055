//! The connection state machine.

use super::contact_header::{ContactHeader, MAGIC, SCL_VERSION};
use super::inflight::{InFlightBundle, IncomingBundle};
use super::{
    ClConnection, ACK_SEGMENT, DATA_SEGMENT, END_BUNDLE, KEEPALIVE, SHUTDOWN, START_BUNDLE,
};
use crate::buffer::StreamBuffer;
use crate::bundle::{
    create_announce_bundle, parse_announce_bundle, protocol, Bundle, CodecError, EndpointId,
};
use crate::contact::{ContactId, ContactManager, LinkId};
use crate::event::{ContactReason, DaemonEvent};
use crate::link::{LinkParams, LinkType};
use crate::sdnv::{self, SdnvError};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[cfg(test)]
mod tests;

const INITIAL_BUFFER_CAPACITY: usize = 32 * 1024;

/// The poll loop never sleeps longer than this, so timeout checks stay
/// responsive even with long keepalive intervals.
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// One convergence-layer connection: the handshake, the segment engine,
/// the timers, and the shutdown path. Owns its buffers and queues
/// exclusively; everything cross-connection goes through the contact
/// manager or the daemon event queue.
#[derive(Debug)]
pub struct Connection {
    link: LinkId,
    link_type: LinkType,
    contact: Option<ContactId>,
    local_eid: EndpointId,
    peer_eid: Option<EndpointId>,
    mgr: Arc<ContactManager>,
    params: LinkParams,

    sendbuf: StreamBuffer,
    recvbuf: StreamBuffer,

    inflight: VecDeque<InFlightBundle>,
    incoming: VecDeque<IncomingBundle>,
    /// The bundle id of the inflight entry currently being segmented.
    current_inflight: Option<u64>,
    /// Payload bytes of the current outbound segment still to copy.
    send_segment_todo: usize,
    /// Bytes of the current inbound segment still to consume.
    recv_segment_todo: usize,

    contact_up: bool,
    contact_broken: bool,
    data_rcvd: Instant,
    data_sent: Instant,
    keepalive_sent: Instant,

    events: VecDeque<DaemonEvent>,
}

enum Handshake {
    NeedMore,
    Fail,
    Ready {
        header: ContactHeader,
        announce: Bundle,
        consume: usize,
    },
}

impl Connection {
    /// Creates a connection for `link`. The active side passes the contact
    /// it was opened for; the passive side passes `None` and the contact is
    /// resolved from the peer's announce bundle.
    pub fn new(
        link: LinkId,
        link_type: LinkType,
        params: LinkParams,
        local_eid: EndpointId,
        contact: Option<ContactId>,
        mgr: Arc<ContactManager>,
        now: Instant,
    ) -> Self {
        Self {
            link,
            link_type,
            contact,
            local_eid,
            peer_eid: None,
            mgr,
            params,
            sendbuf: StreamBuffer::with_capacity(INITIAL_BUFFER_CAPACITY),
            recvbuf: StreamBuffer::with_capacity(INITIAL_BUFFER_CAPACITY),
            inflight: VecDeque::new(),
            incoming: VecDeque::new(),
            current_inflight: None,
            send_segment_todo: 0,
            recv_segment_todo: 0,
            contact_up: false,
            contact_broken: false,
            data_rcvd: now,
            data_sent: now,
            keepalive_sent: now,
            events: VecDeque::new(),
        }
    }

    pub fn is_contact_up(&self) -> bool {
        self.contact_up
    }

    pub fn is_broken(&self) -> bool {
        self.contact_broken
    }

    pub fn contact(&self) -> Option<ContactId> {
        self.contact
    }

    /// The parameters in force, reflecting negotiation once the contact is
    /// up.
    pub fn params(&self) -> &LinkParams {
        &self.params
    }

    pub fn poll_event(&mut self) -> Option<DaemonEvent> {
        self.events.pop_front()
    }

    pub fn receive_bytes(&mut self, bytes: &[u8]) {
        self.recvbuf.extend(bytes);
    }

    pub fn recv_pending(&self) -> usize {
        self.recvbuf.fullbytes()
    }

    pub fn pending_output(&self) -> &[u8] {
        self.sendbuf.readable()
    }

    pub fn consume_output(&mut self, n: usize) {
        self.sendbuf.consume(n);
    }

    pub fn poll_interval(&self) -> Duration {
        if self.params.keepalive_interval == 0 {
            MAX_POLL_INTERVAL
        } else {
            MAX_POLL_INTERVAL.min(Duration::from_secs(u64::from(self.params.keepalive_interval)))
        }
    }

    fn note_data_rcvd(&mut self, now: Instant) {
        self.data_rcvd = now;
    }

    fn note_data_sent(&mut self, now: Instant) {
        self.data_sent = now;
    }

    fn contact_id(&self) -> ContactId {
        self.contact.expect("contact resolved before use")
    }

    fn peer(&self) -> &EndpointId {
        self.peer_eid.as_ref().expect("peer eid known after handshake")
    }

    /// Queues this side's contact header and announce bundle. The exchange
    /// is full duplex: we write ours immediately and read the peer's
    /// whenever it arrives.
    pub fn initiate_contact(&mut self, now: Instant) {
        debug!(link = self.link.0, "initiating contact");
        debug_assert_eq!(self.sendbuf.fullbytes(), 0);

        let header = ContactHeader::from_params(&self.params);
        self.sendbuf.extend(&header.encode());

        let announce = create_announce_bundle(&self.local_eid);
        let announce_len = protocol::formatted_length(&announce);
        let sdnv_len = sdnv::encoding_len(announce_len as u64);
        self.sendbuf.reserve(sdnv_len + announce_len);

        let n = sdnv::encode(announce_len as u64, self.sendbuf.writable())
            .expect("reserved room for the announce length");
        self.sendbuf.fill(n);
        let n = protocol::format_bundle(&announce, self.sendbuf.writable());
        debug_assert_eq!(n, announce_len);
        self.sendbuf.fill(n);

        self.note_data_sent(now);
    }

    /// Consumes the peer's contact header and announce bundle from the
    /// receive buffer. Returns without consuming anything while the
    /// sequence is still incomplete.
    fn handle_contact_initiation(&mut self, now: Instant) {
        debug_assert!(!self.contact_up);

        let step = {
            let buf = self.recvbuf.readable();
            match ContactHeader::decode(buf) {
                None => Handshake::NeedMore,
                Some(header) => match sdnv::decode(&buf[ContactHeader::LEN..]) {
                    Err(SdnvError::Incomplete) => Handshake::NeedMore,
                    Err(_) => {
                        error!("protocol error: malformed announce length");
                        Handshake::Fail
                    }
                    Ok((announce_len, sdnv_len)) => {
                        let announce_len = announce_len as usize;
                        let start = ContactHeader::LEN + sdnv_len;
                        if buf.len() < start + announce_len {
                            Handshake::NeedMore
                        } else {
                            match protocol::parse_bundle(&buf[start..start + announce_len]) {
                                Ok((announce, consumed)) if consumed == announce_len => {
                                    Handshake::Ready {
                                        header,
                                        announce,
                                        consume: start + announce_len,
                                    }
                                }
                                Ok((_, consumed)) => {
                                    error!(
                                        given = announce_len,
                                        parsed = consumed,
                                        "protocol error: announce bundle length mismatch"
                                    );
                                    Handshake::Fail
                                }
                                Err(err) => {
                                    error!(%err, "protocol error: bad announce bundle");
                                    Handshake::Fail
                                }
                            }
                        }
                    }
                },
            }
        };

        let (header, announce, consume) = match step {
            Handshake::NeedMore => {
                debug!(
                    have = self.recvbuf.fullbytes(),
                    "contact initiation incomplete, waiting for more data"
                );
                return;
            }
            Handshake::Fail => {
                self.break_contact(ContactReason::Broken);
                return;
            }
            Handshake::Ready {
                header,
                announce,
                consume,
            } => (header, announce, consume),
        };

        if header.magic != MAGIC {
            warn!(
                got = format_args!("{:#010x}", header.magic),
                expected = format_args!("{:#010x}", MAGIC),
                "remote sent bad magic number, disconnecting"
            );
            self.break_contact(ContactReason::Broken);
            return;
        }
        if header.version != SCL_VERSION {
            warn!(
                got = header.version,
                expected = SCL_VERSION,
                "remote sent unsupported version, disconnecting"
            );
            self.break_contact(ContactReason::Broken);
            return;
        }

        self.params.negotiate(
            header.segment_ack_enabled(),
            header.reactive_frag_enabled(),
            header.keepalive_interval,
        );

        let Some(peer) = parse_announce_bundle(&announce) else {
            error!("protocol error: handshake bundle is not an announce");
            self.break_contact(ContactReason::Broken);
            return;
        };

        self.recvbuf.consume(consume);

        let contact = self.mgr.ensure_contact(self.link, &peer);
        self.contact = Some(contact);
        self.peer_eid = Some(peer);

        self.data_rcvd = now;
        self.data_sent = now;
        self.keepalive_sent = now;
        self.contact_up = true;

        debug!(contact = contact.0, "contact established");
        self.events.push_back(DaemonEvent::ContactUp { contact });
    }

    /// Enqueues a bundle; segments go out from the poll loop.
    pub fn handle_send_bundle(&mut self, bundle: Arc<Bundle>) {
        self.inflight.push_back(InFlightBundle::new(bundle));
    }

    /// Mid-stream cancellation is not part of the protocol; once queued, a
    /// bundle either completes or dies with the contact.
    pub fn handle_cancel_bundle(&mut self, bundle: &Bundle) {
        debug!(bundle = bundle.id, "cancel is a no-op on this convergence layer");
    }

    /// One pass of the outbound engine: continue a partially copied
    /// segment, emit due acks, then start or continue a bundle. Acks and
    /// data interleave in every pass so neither starves the other.
    pub fn send_pending_data(&mut self, now: Instant) -> bool {
        if self.sendbuf.tailbytes() == 0 {
            return false;
        }

        if self.send_segment_todo != 0 {
            debug_assert!(self.current_inflight.is_some());
            self.send_data_todo(now);
        }

        if self.contact_broken || self.send_segment_todo != 0 {
            return false;
        }

        if !self.contact_up {
            return false;
        }

        let sent_ack = self.send_pending_acks(now);

        let sent_data = if self.current_inflight.is_none() {
            self.start_next_bundle(now)
        } else {
            self.send_next_segment(now)
        };

        sent_ack || sent_data
    }

    /// Emits ACK_SEGMENTs for every fully received segment of the front
    /// incoming bundle, then retires the record once everything through
    /// END_BUNDLE has been acked.
    fn send_pending_acks(&mut self, now: Instant) -> bool {
        if self.contact_broken || self.incoming.is_empty() {
            return false;
        }

        let mut generated_ack = false;
        if self.params.segment_ack_enabled {
            // Segment ends are marked in ack_data when the segment header
            // arrives, so check rcvd_data before acking: the mark alone does
            // not mean the bytes are here yet.
            loop {
                let incoming = self.incoming.front_mut().expect("checked non-empty");
                let Some(mark) = incoming.ack_data.first() else {
                    break;
                };
                let ack_len = mark + 1;
                let rcvd_bytes = incoming.rcvd_data.last().map_or(0, |last| last + 1);
                if ack_len > rcvd_bytes {
                    debug!(
                        ack_len,
                        rcvd_bytes, "waiting to ack a segment that has not fully arrived"
                    );
                    break;
                }

                let need = 1 + sdnv::encoding_len(ack_len as u64);
                if need > self.sendbuf.tailbytes() {
                    debug!(need, have = self.sendbuf.tailbytes(), "no room for ack");
                    break;
                }

                debug!(ack_len, "sending ack");
                let buf = self.sendbuf.writable();
                buf[0] = ACK_SEGMENT;
                let n = sdnv::encode(ack_len as u64, &mut buf[1..])
                    .expect("checked room for the ack");
                self.sendbuf.fill(1 + n);

                generated_ack = true;
                incoming.acked_length = ack_len;
                incoming.ack_data.clear(mark);
            }
        }

        if generated_ack {
            self.note_data_sent(now);
        }

        // The END_BUNDLE message comes after the last segment, so the
        // record is done only once total_length is known and fully acked.
        let incoming = self.incoming.front().expect("checked non-empty");
        if incoming.total_length != 0 && incoming.total_length == incoming.acked_length {
            debug!(
                total = incoming.total_length,
                "acked every byte of incoming bundle"
            );
            self.incoming.pop_front();
        }

        generated_ack
    }

    fn current_index(&self) -> Option<usize> {
        let id = self.current_inflight?;
        self.inflight.iter().position(|inf| inf.bundle.id == id)
    }

    /// Picks the next unsent inflight bundle and emits START_BUNDLE plus
    /// the first data segment, which carries at least the header blocks.
    fn start_next_bundle(&mut self, now: Instant) -> bool {
        debug_assert!(self.current_inflight.is_none());

        let Some(idx) = self
            .inflight
            .iter()
            .position(|inf| inf.sent_data.num_contiguous() < inf.formatted_length)
        else {
            return false;
        };

        // Entries before idx are fully sent and only waiting on acks; this
        // one must be untouched since partial-send-then-reset never happens.
        debug_assert!(self.inflight[idx].sent_data.is_empty());

        let bundle = self.inflight[idx].bundle.clone();
        let header_len = self.inflight[idx].header_block_length;
        let formatted_len = self.inflight[idx].formatted_length;
        self.current_inflight = Some(bundle.id);

        let mut segment_len = (self.params.segment_length as usize).min(formatted_len);
        if segment_len < header_len {
            warn!(
                segment_len,
                header_len,
                "configured segment length smaller than the header blocks, raising it for this segment"
            );
            segment_len = header_len;
        }

        let sdnv_len = sdnv::encoding_len(segment_len as u64);

        // The header blocks are formatted in one shot, so the buffer must
        // hold the whole leading sequence at once.
        let min_buffer_len = 1 + 1 + sdnv_len + header_len;
        if min_buffer_len > self.sendbuf.tailbytes() {
            if min_buffer_len > self.sendbuf.capacity() {
                warn!(
                    need = min_buffer_len,
                    have = self.sendbuf.capacity(),
                    "send buffer too small for header blocks, expanding"
                );
                self.sendbuf.reserve(min_buffer_len);
            } else {
                debug!(
                    need = min_buffer_len,
                    have = self.sendbuf.tailbytes(),
                    "waiting for the send buffer to drain before starting a bundle"
                );
                self.current_inflight = None;
                return false;
            }
        }

        debug!(
            bundle = bundle.id,
            segment_len, header_len, "sending START_BUNDLE and the header segment"
        );

        let buf = self.sendbuf.writable();
        buf[0] = START_BUNDLE;
        buf[1] = DATA_SEGMENT;
        let n = sdnv::encode(segment_len as u64, &mut buf[2..])
            .expect("checked room for the segment header");
        debug_assert_eq!(n, sdnv_len);
        let written = protocol::format_header_blocks(&bundle, &mut buf[2 + n..]);
        debug_assert_eq!(written, header_len);
        self.sendbuf.fill(2 + n + header_len);

        self.inflight[idx].sent_data.set_range(0, header_len);
        self.send_segment_todo = segment_len - header_len;
        self.note_data_sent(now);

        if self.send_segment_todo == 0 {
            return true;
        }
        self.send_data_todo(now)
    }

    /// Emits the next DATA_SEGMENT header for the current bundle, or
    /// END_BUNDLE once the payload has all been sent.
    fn send_next_segment(&mut self, now: Instant) -> bool {
        if self.sendbuf.tailbytes() == 0 {
            return false;
        }
        debug_assert_eq!(self.send_segment_todo, 0);

        let Some(idx) = self.current_index() else {
            return false;
        };
        let inflight = &self.inflight[idx];
        debug_assert!(!inflight.sent_data.is_empty());

        let header_len = inflight.header_block_length;
        let payload_len = inflight.bundle.payload.len();
        let bytes_sent = inflight.sent_data.last().map_or(0, |last| last + 1);
        let payload_sent = bytes_sent - header_len;

        if payload_sent == payload_len {
            debug!(payload_len, "payload fully sent, finishing bundle");
            return self.finish_bundle(now);
        }

        let segment_len = (self.params.segment_length as usize).min(payload_len - payload_sent);
        let sdnv_len = sdnv::encoding_len(segment_len as u64);
        if self.sendbuf.tailbytes() < 1 + sdnv_len {
            debug!(
                need = 1 + sdnv_len,
                have = self.sendbuf.tailbytes(),
                "no room for the segment header"
            );
            return false;
        }

        debug!(
            segment_len,
            payload_sent, "starting the next payload segment"
        );

        let buf = self.sendbuf.writable();
        buf[0] = DATA_SEGMENT;
        let n = sdnv::encode(segment_len as u64, &mut buf[1..])
            .expect("checked room for the segment header");
        self.sendbuf.fill(1 + n);

        self.send_segment_todo = segment_len;
        self.send_data_todo(now)
    }

    /// Copies payload bytes of the current segment into whatever room the
    /// send buffer has. Returns whether the segment was completed.
    fn send_data_todo(&mut self, now: Instant) -> bool {
        debug_assert_ne!(self.send_segment_todo, 0);
        let Some(idx) = self.current_index() else {
            return false;
        };

        let mut progressed = false;
        while self.send_segment_todo != 0 && self.sendbuf.tailbytes() != 0 {
            let inflight = &mut self.inflight[idx];
            let bytes_sent = inflight.sent_data.last().map_or(0, |last| last + 1);
            let payload_offset = bytes_sent - inflight.header_block_length;
            let send_len = self.send_segment_todo.min(self.sendbuf.tailbytes());

            inflight
                .bundle
                .payload
                .read_data(payload_offset, &mut self.sendbuf.writable()[..send_len]);
            self.sendbuf.fill(send_len);
            inflight.sent_data.set_range(bytes_sent, send_len);

            self.send_segment_todo -= send_len;
            progressed = true;
        }

        if progressed {
            self.note_data_sent(now);
        }
        self.send_segment_todo == 0
    }

    /// Emits END_BUNDLE and releases the current slot. With segment acks
    /// negotiated off there is no final ack to wait for, so the full ack is
    /// synthesized here and the transmitted event posted immediately.
    fn finish_bundle(&mut self, now: Instant) -> bool {
        if self.sendbuf.tailbytes() == 0 {
            warn!("send buffer full while finishing a bundle, making room for one byte");
            self.sendbuf.reserve(1);
        }

        self.sendbuf.writable()[0] = END_BUNDLE;
        self.sendbuf.fill(1);
        self.note_data_sent(now);

        let Some(idx) = self.current_index() else {
            return false;
        };
        debug_assert!(!self.inflight[idx].bundle.payload.is_file_open());

        let id = self.inflight[idx].bundle.id;

        if !self.params.segment_ack_enabled {
            let formatted_len = self.inflight[idx].formatted_length;
            self.inflight[idx].ack_data.set_range(0, formatted_len);

            let inflight = &self.inflight[idx];
            let header_len = inflight.header_block_length;
            self.events.push_back(DaemonEvent::BundleTransmitted {
                bundle: inflight.bundle.clone(),
                contact: self.contact_id(),
                bytes_sent: inflight.sent_data.num_contiguous() - header_len,
                bytes_acked: inflight.ack_data.num_contiguous() - header_len,
            });
        }

        self.current_inflight = None;
        self.check_completed(id);
        true
    }

    /// Retires an inflight entry once both finish_bundle has run and the
    /// final ack has arrived.
    fn check_completed(&mut self, id: u64) {
        if self.current_inflight == Some(id) {
            debug!(bundle = id, "still waiting for finish_bundle");
            return;
        }
        let Some(idx) = self.inflight.iter().position(|inf| inf.bundle.id == id) else {
            return;
        };
        let inflight = &self.inflight[idx];
        let acked_len = inflight.ack_data.num_contiguous();
        if acked_len < inflight.formatted_length {
            debug!(
                bundle = id,
                acked_len,
                formatted_len = inflight.formatted_length,
                "not fully acked yet"
            );
            return;
        }
        debug!(bundle = id, "transmission complete");
        debug_assert_eq!(idx, 0);
        self.inflight.remove(idx);
    }

    fn send_keepalive(&mut self, now: Instant) {
        // Another byte in a non-empty buffer buys nothing: the queued data
        // will prove liveness when it arrives.
        if self.sendbuf.fullbytes() != 0 {
            debug!(
                queued = self.sendbuf.fullbytes(),
                "send buffer non-empty, suppressing keepalive"
            );
            return;
        }
        self.keepalive_sent = now;
        self.sendbuf.writable()[0] = KEEPALIVE;
        self.sendbuf.fill(1);
        // data_sent stays untouched: keepalives must not hold an idle
        // on-demand link open.
    }

    /// The periodic timeout pass: data timeout, idle close, keepalive.
    pub fn handle_poll_timeout(&mut self, now: Instant) {
        if self.contact_broken {
            return;
        }

        let since_rcvd = now.duration_since(self.data_rcvd);
        if since_rcvd.as_millis() > u128::from(self.params.data_timeout) {
            info!(
                elapsed_ms = since_rcvd.as_millis() as u64,
                "no data heard within the data timeout, closing contact"
            );
            self.break_contact(ContactReason::Broken);
            return;
        }

        if self.contact_up
            && self.link_type == LinkType::OnDemand
            && self.params.idle_close_time != 0
        {
            let idle = Duration::from_secs(u64::from(self.params.idle_close_time));
            let since_sent = now.duration_since(self.data_sent);
            if since_rcvd > idle && since_sent > idle {
                info!(
                    rcvd_idle_ms = since_rcvd.as_millis() as u64,
                    sent_idle_ms = since_sent.as_millis() as u64,
                    "closing idle connection"
                );
                self.break_contact(ContactReason::Idle);
                return;
            }
        }

        if self.contact_up && self.params.keepalive_interval != 0 {
            let interval = Duration::from_secs(u64::from(self.params.keepalive_interval));
            let since_sent = now.duration_since(self.data_sent);
            let since_keepalive = now.duration_since(self.keepalive_sent);
            if since_sent.min(since_keepalive) > interval {
                debug!("sending keepalive");
                self.send_keepalive(now);
            }
        }
    }

    /// Processes whatever has accumulated in the receive buffer: the
    /// handshake while the contact is coming up, then a partially consumed
    /// data segment if one is open, then one message per leading type byte
    /// for as long as complete messages remain.
    pub fn process_data(&mut self, now: Instant) {
        if self.recvbuf.fullbytes() == 0 {
            return;
        }

        // Everything, keepalives included, counts as hearing from the peer.
        self.note_data_rcvd(now);

        if !self.contact_up {
            self.handle_contact_initiation(now);
            return;
        }

        if self.recv_segment_todo != 0 && !self.handle_data_todo() {
            return;
        }

        while self.recvbuf.fullbytes() != 0 {
            if self.contact_broken {
                return;
            }

            let message_type = self.recvbuf.readable()[0];
            let ok = match message_type {
                START_BUNDLE => self.handle_start_bundle(),
                END_BUNDLE => self.handle_end_bundle(),
                DATA_SEGMENT => self.handle_data_segment(),
                ACK_SEGMENT => self.handle_ack_segment(),
                KEEPALIVE => self.handle_keepalive(),
                SHUTDOWN => self.handle_shutdown(),
                other => {
                    error!(message_type = other, "invalid message type");
                    self.break_contact(ContactReason::Broken);
                    return;
                }
            };

            // An incomplete message stays in the buffer; make sure there is
            // room to receive the rest of it.
            if !ok {
                if self.recvbuf.fullbytes() == self.recvbuf.capacity() {
                    warn!(
                        capacity = self.recvbuf.capacity(),
                        message_type, "receive buffer full but message incomplete, doubling"
                    );
                    let capacity = self.recvbuf.capacity();
                    self.recvbuf.reserve(capacity);
                } else if self.recvbuf.tailbytes() == 0 {
                    let want = self.recvbuf.capacity() - self.recvbuf.fullbytes();
                    self.recvbuf.reserve(want);
                    debug_assert_ne!(self.recvbuf.tailbytes(), 0);
                }
                return;
            }
        }
    }

    fn handle_start_bundle(&mut self) -> bool {
        self.recvbuf.consume(1);

        if let Some(previous) = self.incoming.back() {
            if previous.total_length == 0 {
                error!("protocol error: got START_BUNDLE before the previous bundle completed");
                self.break_contact(ContactReason::Broken);
                return false;
            }
        }

        debug!("got START_BUNDLE, expecting a new incoming bundle");
        self.incoming.push_back(IncomingBundle::new());
        true
    }

    fn handle_end_bundle(&mut self) -> bool {
        self.recvbuf.consume(1);

        let ok = match self.incoming.back() {
            None => {
                error!("protocol error: got END_BUNDLE with no incoming bundle");
                false
            }
            Some(incoming) if incoming.rcvd_data.is_empty() => {
                error!("protocol error: got END_BUNDLE with no DATA_SEGMENT");
                false
            }
            Some(_) => true,
        };
        if !ok {
            self.break_contact(ContactReason::Broken);
            return false;
        }

        // END_BUNDLE can arrive before every payload byte if the peer
        // reorders its segments; total_length tells the ack path when the
        // record is really done.
        let incoming = self.incoming.back_mut().expect("checked non-empty");
        let total_length = incoming.rcvd_data.last().expect("checked non-empty") + 1;
        incoming.total_length = total_length;

        let formatted_len =
            protocol::formatted_length(incoming.bundle.as_ref().expect("allocated with first segment"));
        if total_length > formatted_len {
            error!(
                rcvd = total_length,
                formatted_len, "protocol error: received too much data"
            );
            // Pretend nothing arrived so the shutdown cleanup does not
            // deliver it as a fragment.
            incoming.rcvd_data.clear_all();
            self.break_contact(ContactReason::Broken);
            return false;
        }

        let header_len = incoming.header_block_length;
        let payload_rcvd = total_length - header_len;
        let bundle = incoming.bundle.take().expect("allocated with first segment");
        bundle.payload.close_file();

        if !self.params.segment_ack_enabled {
            // No acks will flow, so the record is finished on delivery.
            incoming.acked_length = total_length;
            incoming.ack_data.clear_all();
        }

        debug!(
            bundle = bundle.id,
            payload_rcvd, "got END_BUNDLE, delivering bundle"
        );

        let from = self.peer().clone();
        self.events.push_back(DaemonEvent::BundleReceived {
            bundle,
            from,
            bytes_received: payload_rcvd,
            fragment: false,
        });
        true
    }

    fn handle_data_segment(&mut self) -> bool {
        if self.incoming.is_empty() {
            error!("protocol error: got data segment before START_BUNDLE");
            self.break_contact(ContactReason::Broken);
            return false;
        }

        let decoded = sdnv::decode(&self.recvbuf.readable()[1..]);
        let (segment_len, sdnv_len) = match decoded {
            Ok((len, n)) => (len, n),
            Err(SdnvError::Incomplete) => {
                debug!(
                    have = self.recvbuf.fullbytes(),
                    "too few bytes for the segment length"
                );
                return false;
            }
            Err(_) => {
                error!("protocol error: malformed segment length");
                self.break_contact(ContactReason::Broken);
                return false;
            }
        };
        let Ok(segment_len) = usize::try_from(segment_len) else {
            error!("protocol error: oversized segment length");
            self.break_contact(ContactReason::Broken);
            return false;
        };
        if segment_len == 0 {
            error!("protocol error: zero-length data segment");
            self.break_contact(ContactReason::Broken);
            return false;
        }

        // The back entry is the one being read into; anything ahead of it
        // is just waiting for acks to go out.
        let segment_offset;
        if self.incoming.back().expect("checked non-empty").rcvd_data.is_empty() {
            // First segment: parse the header blocks and allocate the
            // bundle. A partial header stays in the buffer until more
            // bytes arrive.
            let parsed = protocol::parse_header_blocks(&self.recvbuf.readable()[1 + sdnv_len..]);
            let (bundle, header_len) = match parsed {
                Ok(parsed) => parsed,
                Err(CodecError::Incomplete) => {
                    debug!(
                        have = self.recvbuf.fullbytes(),
                        "not enough data to parse the header blocks"
                    );
                    return false;
                }
                Err(CodecError::Malformed) => {
                    error!("protocol error: malformed header blocks");
                    self.break_contact(ContactReason::Broken);
                    return false;
                }
            };
            if segment_len < header_len {
                error!(
                    segment_len,
                    header_len, "protocol error: first segment shorter than the header blocks"
                );
                self.break_contact(ContactReason::Broken);
                return false;
            }

            debug!(bundle = bundle.id, header_len, "got the header segment");

            let incoming = self.incoming.back_mut().expect("checked non-empty");
            incoming.bundle = Some(bundle);
            incoming.header_block_length = header_len;
            incoming.rcvd_data.set_range(0, header_len);
            self.recvbuf.consume(1 + sdnv_len + header_len);
            self.recv_segment_todo = segment_len - header_len;
            segment_offset = 0;
        } else {
            // A chunk of payload, landing right after everything received
            // so far.
            let incoming = self.incoming.back().expect("checked non-empty");
            segment_offset = incoming.rcvd_data.num_contiguous();
            debug!(
                segment_len,
                segment_offset, "got a payload segment header"
            );
            self.recvbuf.consume(1 + sdnv_len);
            self.recv_segment_todo = segment_len;
        }

        // Mark the segment end now; the ack goes out once every byte up to
        // it has arrived.
        self.incoming
            .back_mut()
            .expect("checked non-empty")
            .ack_data
            .set(segment_offset + segment_len - 1);

        if self.recv_segment_todo != 0 {
            self.handle_data_todo();
        }
        true
    }

    /// Drains received bytes of the open data segment into the payload.
    /// Returns whether the segment was completed.
    fn handle_data_todo(&mut self) -> bool {
        debug_assert!(!self.incoming.is_empty());
        debug_assert_ne!(self.recv_segment_todo, 0);

        let rcvd_len = self.recvbuf.fullbytes();
        if rcvd_len == 0 {
            return false;
        }

        let incoming = self.incoming.back_mut().expect("checked non-empty");
        let rcvd_offset = incoming.rcvd_data.num_contiguous();
        let payload_offset = rcvd_offset - incoming.header_block_length;
        let payload_len = incoming
            .bundle
            .as_ref()
            .expect("allocated with first segment")
            .payload
            .len();
        let chunk_len = rcvd_len.min(self.recv_segment_todo);

        if chunk_len + payload_offset > payload_len {
            error!(
                chunk_len,
                payload_offset, payload_len, "segment data overruns the payload"
            );
            self.break_contact(ContactReason::Broken);
            return false;
        }

        let incoming = self.incoming.back_mut().expect("checked non-empty");
        incoming
            .bundle
            .as_mut()
            .expect("allocated with first segment")
            .payload
            .write_data(payload_offset, &self.recvbuf.readable()[..chunk_len]);
        incoming.rcvd_data.set_range(rcvd_offset, chunk_len);

        self.recvbuf.consume(chunk_len);
        self.recv_segment_todo -= chunk_len;

        debug!(
            chunk_len,
            todo = self.recv_segment_todo,
            "consumed segment data"
        );

        self.recv_segment_todo == 0
    }

    fn handle_ack_segment(&mut self) -> bool {
        let decoded = sdnv::decode(&self.recvbuf.readable()[1..]);
        let (acked_len, sdnv_len) = match decoded {
            Ok((len, n)) => (len, n),
            Err(SdnvError::Incomplete) => {
                debug!(
                    have = self.recvbuf.fullbytes(),
                    "too few bytes for the ack length"
                );
                return false;
            }
            Err(_) => {
                error!("protocol error: malformed ack length");
                self.break_contact(ContactReason::Broken);
                return false;
            }
        };
        let Ok(acked_len) = usize::try_from(acked_len) else {
            error!("protocol error: oversized ack length");
            self.break_contact(ContactReason::Broken);
            return false;
        };

        self.recvbuf.consume(1 + sdnv_len);

        if self.inflight.is_empty() {
            error!("protocol error: got ack segment with no inflight bundle");
            self.break_contact(ContactReason::Broken);
            return false;
        }

        let contact = self.contact_id();
        let inflight = self.inflight.front_mut().expect("checked non-empty");

        // Acks are cumulative; one that moves backwards is a peer bug.
        let ack_begin = inflight.ack_data.num_contiguous();
        if acked_len < ack_begin {
            error!(
                acked_len,
                ack_begin, "protocol error: ack regressed below what was already acked"
            );
            self.break_contact(ContactReason::Broken);
            return false;
        }

        inflight.ack_data.set_range(0, acked_len);

        if acked_len == inflight.formatted_length {
            let header_len = inflight.header_block_length;
            let bytes_sent = inflight.sent_data.num_contiguous() - header_len;
            let bytes_acked = inflight.ack_data.num_contiguous() - header_len;
            let bundle = inflight.bundle.clone();
            let id = bundle.id;

            debug!(bundle = id, acked_len, "got the final ack");
            self.events.push_back(DaemonEvent::BundleTransmitted {
                bundle,
                contact,
                bytes_sent,
                bytes_acked,
            });
            self.check_completed(id);
        } else {
            debug!(acked_len, "ack advanced");
        }
        true
    }

    fn handle_keepalive(&mut self) -> bool {
        debug!("got keepalive");
        self.recvbuf.consume(1);
        true
    }

    fn handle_shutdown(&mut self) -> bool {
        debug!("got SHUTDOWN");
        self.recvbuf.consume(1);
        self.break_contact(ContactReason::Shutdown);
        false
    }

    /// Tears the contact down, orderly for everything except transport and
    /// protocol failures. Unfinished outbound bundles are dropped without
    /// transmitted events; partially received inbound bundles become
    /// fragments when reactive fragmentation was negotiated, and are
    /// discarded otherwise. Idempotent.
    pub fn break_contact(&mut self, reason: ContactReason) {
        if self.contact_broken {
            return;
        }
        self.contact_broken = true;
        info!(?reason, "breaking contact");

        // Queued output always ends on a message boundary unless a segment
        // is mid-copy, and a SHUTDOWN byte inside a segment would be read
        // as payload.
        if reason != ContactReason::Broken && self.contact_up && self.send_segment_todo == 0 {
            if self.sendbuf.tailbytes() == 0 {
                self.sendbuf.reserve(1);
            }
            self.sendbuf.writable()[0] = SHUTDOWN;
            self.sendbuf.fill(1);
        }

        self.current_inflight = None;
        self.send_segment_todo = 0;
        self.recv_segment_todo = 0;
        self.inflight.clear();

        let reactive_frag = self.params.reactive_frag_enabled;
        let mut salvaged = Vec::new();
        for mut incoming in self.incoming.drain(..) {
            if incoming.total_length != 0 {
                // Already delivered; it was only waiting on acks.
                continue;
            }
            if incoming.rcvd_data.is_empty() {
                continue;
            }
            let Some(bundle) = incoming.bundle.take() else {
                continue;
            };
            bundle.payload.close_file();
            if !reactive_frag {
                debug!(bundle = bundle.id, "dropping partially received bundle");
                continue;
            }
            let payload_rcvd = incoming
                .rcvd_data
                .num_contiguous()
                .saturating_sub(incoming.header_block_length);
            debug!(
                bundle = bundle.id,
                payload_rcvd, "delivering partially received bundle as a fragment"
            );
            salvaged.push((bundle, payload_rcvd));
        }
        if let Some(from) = self.peer_eid.clone() {
            for (bundle, payload_rcvd) in salvaged {
                self.events.push_back(DaemonEvent::BundleReceived {
                    bundle,
                    from: from.clone(),
                    bytes_received: payload_rcvd,
                    fragment: true,
                });
            }
        }

        if let Some(contact) = self.contact {
            self.events.push_back(DaemonEvent::ContactDown { contact, reason });
        }
    }
}

impl ClConnection for Connection {
    fn initiate_contact(&mut self, now: Instant) {
        Connection::initiate_contact(self, now);
    }

    fn handle_send_bundle(&mut self, bundle: Arc<Bundle>) {
        Connection::handle_send_bundle(self, bundle);
    }

    fn handle_cancel_bundle(&mut self, bundle: &Bundle) {
        Connection::handle_cancel_bundle(self, bundle);
    }

    fn send_pending_data(&mut self, now: Instant) -> bool {
        Connection::send_pending_data(self, now)
    }

    fn process_data(&mut self, now: Instant) {
        Connection::process_data(self, now);
    }

    fn handle_poll_timeout(&mut self, now: Instant) {
        Connection::handle_poll_timeout(self, now);
    }

    fn break_contact(&mut self, reason: ContactReason) {
        Connection::break_contact(self, reason);
    }

    fn receive_bytes(&mut self, bytes: &[u8]) {
        Connection::receive_bytes(self, bytes);
    }

    fn recv_pending(&self) -> usize {
        Connection::recv_pending(self)
    }

    fn pending_output(&self) -> &[u8] {
        Connection::pending_output(self)
    }

    fn consume_output(&mut self, n: usize) {
        Connection::consume_output(self, n);
    }

    fn poll_event(&mut self) -> Option<DaemonEvent> {
        Connection::poll_event(self)
    }

    fn is_broken(&self) -> bool {
        Connection::is_broken(self)
    }

    fn poll_interval(&self) -> Duration {
        Connection::poll_interval(self)
    }
}
