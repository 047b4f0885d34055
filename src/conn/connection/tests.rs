use super::*;
use crate::link::LinkType;
use rand::{rngs::SmallRng, Rng, SeedableRng};

fn params(configure: impl FnOnce(&mut LinkParams)) -> LinkParams {
    let mut params = LinkParams::default();
    configure(&mut params);
    params
}

fn new_conn(
    eid: &str,
    link_type: LinkType,
    params: LinkParams,
    active: bool,
    now: Instant,
) -> Connection {
    let mgr = Arc::new(ContactManager::new());
    let link = mgr.add_link(link_type, params.clone());
    let contact = if active {
        Some(mgr.ensure_contact(link, &"dtn://peer-b/".parse().unwrap()))
    } else {
        None
    };
    Connection::new(
        link,
        link_type,
        params,
        eid.parse().unwrap(),
        contact,
        mgr,
        now,
    )
}

fn take_output(conn: &mut Connection) -> Vec<u8> {
    let bytes = conn.pending_output().to_vec();
    conn.consume_output(bytes.len());
    bytes
}

fn deliver(to: &mut Connection, bytes: &[u8], now: Instant) {
    to.receive_bytes(bytes);
    loop {
        let before = to.recv_pending();
        to.process_data(now);
        if to.recv_pending() == before {
            break;
        }
    }
}

/// Moves bytes between the two peers until both go quiet.
fn shuttle(a: &mut Connection, b: &mut Connection, now: Instant) {
    loop {
        while a.send_pending_data(now) {}
        while b.send_pending_data(now) {}
        let from_a = take_output(a);
        let from_b = take_output(b);
        if from_a.is_empty() && from_b.is_empty() {
            break;
        }
        deliver(b, &from_a, now);
        deliver(a, &from_b, now);
    }
}

/// Brings up a connected pair: A is the active opener, B the passive
/// acceptor. Both ContactUp events are drained.
fn connect(
    params_a: LinkParams,
    params_b: LinkParams,
    link_type: LinkType,
) -> (Connection, Connection, Instant) {
    let now = Instant::now();
    let mut a = new_conn("dtn://peer-a/", link_type, params_a, true, now);
    let mut b = new_conn("dtn://peer-b/", link_type, params_b, false, now);
    a.initiate_contact(now);
    b.initiate_contact(now);
    shuttle(&mut a, &mut b, now);
    assert!(a.is_contact_up());
    assert!(b.is_contact_up());
    assert!(matches!(a.poll_event(), Some(DaemonEvent::ContactUp { .. })));
    assert!(matches!(b.poll_event(), Some(DaemonEvent::ContactUp { .. })));
    (a, b, now)
}

fn make_bundle(payload: &[u8]) -> Arc<Bundle> {
    let mut bundle = Bundle::new();
    bundle.source = "dtn://peer-a/".parse().unwrap();
    bundle.dest = "dtn://peer-b/inbox".parse().unwrap();
    bundle.expiration = 300;
    bundle.payload.set_data(payload);
    Arc::new(bundle)
}

fn expect_received(conn: &mut Connection) -> (Bundle, usize, bool) {
    match conn.poll_event() {
        Some(DaemonEvent::BundleReceived {
            bundle,
            bytes_received,
            fragment,
            ..
        }) => (bundle, bytes_received, fragment),
        other => panic!("expected BundleReceived, got {other:?}"),
    }
}

fn expect_transmitted(conn: &mut Connection) -> (usize, usize) {
    match conn.poll_event() {
        Some(DaemonEvent::BundleTransmitted {
            bytes_sent,
            bytes_acked,
            ..
        }) => (bytes_sent, bytes_acked),
        other => panic!("expected BundleTransmitted, got {other:?}"),
    }
}

fn expect_contact_down(conn: &mut Connection) -> ContactReason {
    match conn.poll_event() {
        Some(DaemonEvent::ContactDown { reason, .. }) => reason,
        other => panic!("expected ContactDown, got {other:?}"),
    }
}

fn ack_message(len: usize) -> Vec<u8> {
    let mut msg = vec![ACK_SEGMENT];
    let mut buf = [0u8; sdnv::MAX_LENGTH];
    let n = sdnv::encode(len as u64, &mut buf).unwrap();
    msg.extend_from_slice(&buf[..n]);
    msg
}

struct WireSummary {
    starts: usize,
    ends: usize,
    segment_lengths: Vec<usize>,
}

fn walk_bundle_wire(mut wire: &[u8]) -> WireSummary {
    let mut summary = WireSummary {
        starts: 0,
        ends: 0,
        segment_lengths: Vec::new(),
    };
    while !wire.is_empty() {
        match wire[0] {
            START_BUNDLE => {
                summary.starts += 1;
                wire = &wire[1..];
            }
            END_BUNDLE => {
                summary.ends += 1;
                wire = &wire[1..];
            }
            DATA_SEGMENT => {
                let (len, n) = sdnv::decode(&wire[1..]).unwrap();
                let len = len as usize;
                summary.segment_lengths.push(len);
                wire = &wire[1 + n + len..];
            }
            other => panic!("unexpected message type {other:#04x}"),
        }
    }
    summary
}

fn parse_acks(mut wire: &[u8]) -> Vec<usize> {
    let mut acks = Vec::new();
    while !wire.is_empty() {
        assert_eq!(wire[0], ACK_SEGMENT);
        let (len, n) = sdnv::decode(&wire[1..]).unwrap();
        acks.push(len as usize);
        wire = &wire[1 + n..];
    }
    acks
}

#[test]
fn handshake_brings_the_contact_up() {
    let (a, b, _) = connect(LinkParams::default(), LinkParams::default(), LinkType::AlwaysOn);
    assert_eq!(a.peer().as_str(), "dtn://peer-b/");
    assert_eq!(b.peer().as_str(), "dtn://peer-a/");
    assert!(a.contact().is_some());
    assert!(b.contact().is_some());
}

#[test]
fn handshake_negotiates_the_weaker_settings() {
    let params_a = params(|p| {
        p.keepalive_interval = 10;
        p.segment_ack_enabled = true;
        p.reactive_frag_enabled = true;
    });
    let params_b = params(|p| {
        p.keepalive_interval = 4;
        p.segment_ack_enabled = true;
        p.reactive_frag_enabled = false;
    });
    let (a, b, _) = connect(params_a, params_b, LinkType::AlwaysOn);

    for side in [&a, &b] {
        assert_eq!(side.params().keepalive_interval, 4);
        assert!(side.params().segment_ack_enabled);
        assert!(!side.params().reactive_frag_enabled);
    }
}

#[test]
fn handshake_tolerates_arbitrary_byte_boundaries() {
    let now = Instant::now();
    let mut a = new_conn(
        "dtn://peer-a/",
        LinkType::AlwaysOn,
        LinkParams::default(),
        true,
        now,
    );
    let mut b = new_conn(
        "dtn://peer-b/",
        LinkType::AlwaysOn,
        LinkParams::default(),
        false,
        now,
    );
    a.initiate_contact(now);
    b.initiate_contact(now);
    take_output(&mut b);

    let from_a = take_output(&mut a);
    for &byte in &from_a {
        assert!(!b.is_contact_up());
        deliver(&mut b, &[byte], now);
    }
    assert!(b.is_contact_up());
    assert!(!b.is_broken());
}

#[test]
fn single_byte_payload_round_trip() {
    let (mut a, mut b, now) =
        connect(LinkParams::default(), LinkParams::default(), LinkType::AlwaysOn);

    let bundle = make_bundle(&[0xab]);
    let header_len = protocol::header_block_length(&bundle);
    let formatted_len = protocol::formatted_length(&bundle);
    assert_eq!(formatted_len, header_len + 1);

    a.handle_send_bundle(bundle);
    while a.send_pending_data(now) {}
    let wire = take_output(&mut a);

    // START_BUNDLE, then one DATA_SEGMENT carrying the header blocks plus
    // the single payload byte, then END_BUNDLE.
    assert_eq!(wire[0], START_BUNDLE);
    assert_eq!(wire[1], DATA_SEGMENT);
    let (segment_len, sdnv_len) = sdnv::decode(&wire[2..]).unwrap();
    assert_eq!(segment_len as usize, formatted_len);
    let (parsed, parsed_len) = protocol::parse_header_blocks(&wire[2 + sdnv_len..]).unwrap();
    assert_eq!(parsed_len, header_len);
    assert_eq!(parsed.source.as_str(), "dtn://peer-a/");
    assert_eq!(wire[2 + sdnv_len + header_len], 0xab);
    assert_eq!(wire[2 + sdnv_len + header_len + 1], END_BUNDLE);
    assert_eq!(wire.len(), 2 + sdnv_len + header_len + 2);

    deliver(&mut b, &wire, now);
    let (received, bytes_received, fragment) = expect_received(&mut b);
    assert_eq!(received.payload.as_slice(), &[0xab]);
    assert_eq!(bytes_received, 1);
    assert!(!fragment);

    // B acks the whole formatted length in one cumulative ack.
    while b.send_pending_data(now) {}
    let ack = take_output(&mut b);
    assert_eq!(parse_acks(&ack), vec![formatted_len]);

    deliver(&mut a, &ack, now);
    let (bytes_sent, bytes_acked) = expect_transmitted(&mut a);
    assert_eq!(bytes_sent, 1);
    assert_eq!(bytes_acked, 1);
    assert!(a.inflight.is_empty());
}

#[test]
fn fragmented_send_uses_cumulative_acks() {
    let (mut a, mut b, now) =
        connect(LinkParams::default(), LinkParams::default(), LinkType::AlwaysOn);

    let payload: Vec<u8> = (0..9000u32).map(|i| i as u8).collect();
    let bundle = make_bundle(&payload);
    let header_len = protocol::header_block_length(&bundle);
    let formatted_len = protocol::formatted_length(&bundle);

    a.handle_send_bundle(bundle);
    while a.send_pending_data(now) {}
    let wire = take_output(&mut a);

    // The first segment is 4096 bytes including the header blocks; the
    // rest of the payload goes out in 4096-byte segments.
    let summary = walk_bundle_wire(&wire);
    assert_eq!(summary.starts, 1);
    assert_eq!(summary.ends, 1);
    assert_eq!(
        summary.segment_lengths,
        vec![4096, 4096, formatted_len - 8192]
    );

    deliver(&mut b, &wire, now);
    let (received, bytes_received, _) = expect_received(&mut b);
    assert_eq!(received.payload.as_slice(), payload.as_slice());
    assert_eq!(bytes_received, 9000);

    while b.send_pending_data(now) {}
    let acks = parse_acks(&take_output(&mut b));
    assert_eq!(acks, vec![4096, 8192, formatted_len]);

    // The transmitted event fires only on the final ack.
    for &ack in &acks[..2] {
        deliver(&mut a, &ack_message(ack), now);
        assert!(a.poll_event().is_none());
        let inflight = a.inflight.front().unwrap();
        assert!(inflight.ack_data.num_contiguous() <= inflight.sent_data.num_contiguous());
        assert_eq!(inflight.ack_data.num_contiguous(), ack);
    }
    deliver(&mut a, &ack_message(acks[2]), now);
    let (bytes_sent, bytes_acked) = expect_transmitted(&mut a);
    assert_eq!(bytes_sent, 9000);
    assert_eq!(bytes_acked, 9000);
    assert_eq!(bytes_acked, formatted_len - header_len);
    assert!(a.inflight.is_empty());
}

#[test]
fn tiny_segment_length_still_carries_whole_headers() {
    let params_small = params(|p| p.segment_length = 4);
    let (mut a, mut b, now) = connect(params_small.clone(), params_small, LinkType::AlwaysOn);

    let payload: Vec<u8> = (0..10u8).collect();
    a.handle_send_bundle(make_bundle(&payload));
    shuttle(&mut a, &mut b, now);

    let (received, bytes_received, _) = expect_received(&mut b);
    assert_eq!(received.payload.as_slice(), payload.as_slice());
    assert_eq!(bytes_received, 10);
    let (bytes_sent, bytes_acked) = expect_transmitted(&mut a);
    assert_eq!(bytes_sent, 10);
    assert_eq!(bytes_acked, 10);
}

#[test]
fn back_to_back_bundles_stay_in_order() {
    let (mut a, mut b, now) =
        connect(LinkParams::default(), LinkParams::default(), LinkType::AlwaysOn);

    a.handle_send_bundle(make_bundle(b"first"));
    a.handle_send_bundle(make_bundle(b"second"));
    a.handle_send_bundle(make_bundle(b"third"));
    shuttle(&mut a, &mut b, now);

    for expected in [&b"first"[..], b"second", b"third"] {
        let (received, _, _) = expect_received(&mut b);
        assert_eq!(received.payload.as_slice(), expected);
    }
    for _ in 0..3 {
        expect_transmitted(&mut a);
    }
    assert!(a.inflight.is_empty());
    assert!(b.incoming.is_empty());
}

#[test]
fn chunked_delivery_reassembles_exactly() {
    let (mut a, mut b, now) =
        connect(LinkParams::default(), LinkParams::default(), LinkType::AlwaysOn);

    let mut rng = SmallRng::seed_from_u64(7);
    let payload: Vec<u8> = (0..5000).map(|_| rng.gen()).collect();
    a.handle_send_bundle(make_bundle(&payload));
    while a.send_pending_data(now) {}
    let wire = take_output(&mut a);

    // Feed the stream to B in arbitrary small reads.
    let mut offset = 0;
    while offset < wire.len() {
        let chunk = rng.gen_range(1..=97).min(wire.len() - offset);
        deliver(&mut b, &wire[offset..offset + chunk], now);
        offset += chunk;
    }

    let (received, bytes_received, _) = expect_received(&mut b);
    assert_eq!(received.payload.as_slice(), payload.as_slice());
    assert_eq!(bytes_received, payload.len());

    while b.send_pending_data(now) {}
    deliver(&mut a, &take_output(&mut b), now);
    let (bytes_sent, bytes_acked) = expect_transmitted(&mut a);
    assert_eq!(bytes_sent, payload.len());
    assert_eq!(bytes_acked, payload.len());
}

#[test]
fn keepalives_pace_from_the_last_keepalive() {
    let keepalive = params(|p| p.keepalive_interval = 2);
    let (mut a, mut b, now) = connect(keepalive.clone(), keepalive, LinkType::AlwaysOn);

    // Idle past the interval: one keepalive goes out.
    a.handle_poll_timeout(now + Duration::from_millis(2100));
    assert_eq!(take_output(&mut a), vec![KEEPALIVE]);

    // data_sent was not updated, so the next keepalive paces from
    // keepalive_sent: nothing at T+4s, another at T+4.3s.
    a.handle_poll_timeout(now + Duration::from_millis(4000));
    assert!(take_output(&mut a).is_empty());
    a.handle_poll_timeout(now + Duration::from_millis(4300));
    assert_eq!(take_output(&mut a), vec![KEEPALIVE]);

    // The receiver just swallows them.
    deliver(&mut b, &[KEEPALIVE], now + Duration::from_millis(2200));
    assert!(b.poll_event().is_none());
    assert!(!b.is_broken());
}

#[test]
fn keepalive_suppressed_while_output_is_queued() {
    let keepalive = params(|p| p.keepalive_interval = 2);
    let (mut a, _b, now) = connect(keepalive.clone(), keepalive, LinkType::AlwaysOn);

    a.handle_send_bundle(make_bundle(b"queued"));
    while a.send_pending_data(now) {}
    let queued = a.pending_output().len();
    assert!(queued > 0);

    a.handle_poll_timeout(now + Duration::from_millis(2100));
    assert_eq!(a.pending_output().len(), queued);
}

#[test]
fn data_timeout_breaks_the_contact() {
    let (mut a, _b, now) =
        connect(LinkParams::default(), LinkParams::default(), LinkType::AlwaysOn);

    a.handle_poll_timeout(now + Duration::from_secs(29));
    assert!(!a.is_broken());

    a.handle_poll_timeout(now + Duration::from_secs(31));
    assert!(a.is_broken());
    assert_eq!(expect_contact_down(&mut a), ContactReason::Broken);
}

#[test]
fn idle_on_demand_link_closes() {
    let idle = params(|p| {
        p.idle_close_time = 30;
        p.data_timeout = 60_000;
        p.keepalive_interval = 0;
    });
    let (mut a, _b, now) = connect(idle.clone(), idle, LinkType::OnDemand);

    // Traffic in one direction resets that side of the idle clock.
    deliver(&mut a, &[KEEPALIVE], now + Duration::from_secs(29));
    a.handle_poll_timeout(now + Duration::from_secs(31));
    assert!(!a.is_broken());

    // Both directions idle past the threshold: orderly idle close.
    a.handle_poll_timeout(now + Duration::from_millis(59_500));
    assert!(a.is_broken());
    assert_eq!(expect_contact_down(&mut a), ContactReason::Idle);
    assert_eq!(take_output(&mut a), vec![SHUTDOWN]);
}

#[test]
fn always_on_links_ignore_idle_close() {
    let idle = params(|p| {
        p.idle_close_time = 1;
        p.data_timeout = 60_000;
    });
    let (mut a, _b, now) = connect(idle.clone(), idle, LinkType::AlwaysOn);

    a.handle_poll_timeout(now + Duration::from_secs(10));
    assert!(!a.is_broken());
}

fn handshake_bytes(configure: impl FnOnce(&mut ContactHeader)) -> Vec<u8> {
    let mut header = ContactHeader::from_params(&LinkParams::default());
    configure(&mut header);

    let mut bytes = Vec::from(header.encode());
    let announce = create_announce_bundle(&"dtn://peer-b/".parse().unwrap());
    let announce_len = protocol::formatted_length(&announce);
    let mut sdnv_buf = [0u8; sdnv::MAX_LENGTH];
    let n = sdnv::encode(announce_len as u64, &mut sdnv_buf).unwrap();
    bytes.extend_from_slice(&sdnv_buf[..n]);
    let mut formatted = vec![0u8; announce_len];
    protocol::format_bundle(&announce, &mut formatted);
    bytes.extend_from_slice(&formatted);
    bytes
}

#[test]
fn bad_magic_breaks_the_contact() {
    let now = Instant::now();
    let mut a = new_conn(
        "dtn://peer-a/",
        LinkType::AlwaysOn,
        LinkParams::default(),
        true,
        now,
    );
    a.initiate_contact(now);
    take_output(&mut a);

    deliver(&mut a, &handshake_bytes(|h| h.magic = 0xdead_beef), now);
    assert!(a.is_broken());
    assert!(!a.is_contact_up());
    assert_eq!(expect_contact_down(&mut a), ContactReason::Broken);
    assert!(a.poll_event().is_none());
    // Abortive close: no SHUTDOWN byte goes out.
    assert!(a.pending_output().is_empty());
}

#[test]
fn version_mismatch_breaks_the_contact() {
    let now = Instant::now();
    let mut a = new_conn(
        "dtn://peer-a/",
        LinkType::AlwaysOn,
        LinkParams::default(),
        true,
        now,
    );
    a.initiate_contact(now);
    take_output(&mut a);

    deliver(&mut a, &handshake_bytes(|h| h.version = SCL_VERSION + 1), now);
    assert!(a.is_broken());
    assert_eq!(expect_contact_down(&mut a), ContactReason::Broken);
}

#[test]
fn peer_shutdown_mid_bundle_drops_the_inflight() {
    let (mut a, _b, now) =
        connect(LinkParams::default(), LinkParams::default(), LinkType::AlwaysOn);

    // More payload than the send buffer holds, so the transfer is
    // genuinely mid-segment when the shutdown arrives.
    let payload = vec![0x5a; 64_000];
    a.handle_send_bundle(make_bundle(&payload));
    while a.send_pending_data(now) {}
    assert_ne!(a.send_segment_todo, 0);

    deliver(&mut a, &[SHUTDOWN], now);
    assert!(a.is_broken());
    // No transmitted event for the unfinished bundle, just the contact
    // going down.
    assert_eq!(expect_contact_down(&mut a), ContactReason::Shutdown);
    assert!(a.poll_event().is_none());
    assert!(a.inflight.is_empty());
}

#[test]
fn reactive_fragmentation_salvages_a_partial_bundle() {
    let reactive = params(|p| {
        p.reactive_frag_enabled = true;
        p.segment_length = 256;
    });
    let (mut a, mut b, now) = connect(reactive.clone(), reactive, LinkType::AlwaysOn);
    assert!(b.params().reactive_frag_enabled);

    let payload: Vec<u8> = (0..1000u32).map(|i| (i * 7) as u8).collect();
    a.handle_send_bundle(make_bundle(&payload));
    while a.send_pending_data(now) {}
    let wire = take_output(&mut a);

    // Only part of the stream arrives before the transport dies.
    deliver(&mut b, &wire[..500], now);
    b.break_contact(ContactReason::Broken);

    let (fragment, bytes_received, is_fragment) = expect_received(&mut b);
    assert!(is_fragment);
    assert!(bytes_received > 0);
    assert!(bytes_received < payload.len());
    assert_eq!(
        &fragment.payload.as_slice()[..bytes_received],
        &payload[..bytes_received]
    );
    assert_eq!(expect_contact_down(&mut b), ContactReason::Broken);
}

#[test]
fn partial_bundle_discarded_without_reactive_fragmentation() {
    let plain = params(|p| p.segment_length = 256);
    let (mut a, mut b, now) = connect(plain.clone(), plain, LinkType::AlwaysOn);
    assert!(!b.params().reactive_frag_enabled);

    let payload = vec![0x11; 1000];
    a.handle_send_bundle(make_bundle(&payload));
    while a.send_pending_data(now) {}
    let wire = take_output(&mut a);

    deliver(&mut b, &wire[..500], now);
    b.break_contact(ContactReason::Broken);

    // Straight to ContactDown; the partial bundle evaporates.
    assert_eq!(expect_contact_down(&mut b), ContactReason::Broken);
    assert!(b.poll_event().is_none());
}

#[test]
fn disabled_segment_acks_complete_on_finish() {
    let no_acks = params(|p| p.segment_ack_enabled = false);
    let (mut a, mut b, now) = connect(LinkParams::default(), no_acks, LinkType::AlwaysOn);
    assert!(!a.params().segment_ack_enabled);
    assert!(!b.params().segment_ack_enabled);

    a.handle_send_bundle(make_bundle(b"unacked"));
    while a.send_pending_data(now) {}

    // The transmitted event fires at finish_bundle, with a synthesized
    // full ack; nothing comes back from B.
    let (bytes_sent, bytes_acked) = expect_transmitted(&mut a);
    assert_eq!(bytes_sent, 7);
    assert_eq!(bytes_acked, 7);
    assert!(a.inflight.is_empty());

    deliver(&mut b, &take_output(&mut a), now);
    let (received, _, _) = expect_received(&mut b);
    assert_eq!(received.payload.as_slice(), b"unacked");
    while b.send_pending_data(now) {}
    assert!(b.pending_output().is_empty());
    assert!(b.incoming.is_empty());

    // The connection is still healthy for the next bundle.
    a.handle_send_bundle(make_bundle(b"again"));
    shuttle(&mut a, &mut b, now);
    expect_transmitted(&mut a);
    let (received, _, _) = expect_received(&mut b);
    assert_eq!(received.payload.as_slice(), b"again");
}

#[test]
fn start_bundle_before_previous_completes_is_fatal() {
    let (_a, mut b, now) =
        connect(LinkParams::default(), LinkParams::default(), LinkType::AlwaysOn);

    deliver(&mut b, &[START_BUNDLE, START_BUNDLE], now);
    assert!(b.is_broken());
    assert_eq!(expect_contact_down(&mut b), ContactReason::Broken);
}

#[test]
fn data_segment_before_start_bundle_is_fatal() {
    let (_a, mut b, now) =
        connect(LinkParams::default(), LinkParams::default(), LinkType::AlwaysOn);

    deliver(&mut b, &[DATA_SEGMENT, 0x05], now);
    assert!(b.is_broken());
    assert_eq!(expect_contact_down(&mut b), ContactReason::Broken);
}

#[test]
fn end_bundle_without_data_is_fatal() {
    let (_a, mut b, now) =
        connect(LinkParams::default(), LinkParams::default(), LinkType::AlwaysOn);

    deliver(&mut b, &[START_BUNDLE, END_BUNDLE], now);
    assert!(b.is_broken());
    assert_eq!(expect_contact_down(&mut b), ContactReason::Broken);
}

#[test]
fn unknown_message_type_is_fatal() {
    let (mut a, _b, now) =
        connect(LinkParams::default(), LinkParams::default(), LinkType::AlwaysOn);

    deliver(&mut a, &[0x42], now);
    assert!(a.is_broken());
    assert_eq!(expect_contact_down(&mut a), ContactReason::Broken);
}

#[test]
fn ack_without_inflight_is_fatal() {
    let (mut a, _b, now) =
        connect(LinkParams::default(), LinkParams::default(), LinkType::AlwaysOn);

    deliver(&mut a, &ack_message(5), now);
    assert!(a.is_broken());
    assert_eq!(expect_contact_down(&mut a), ContactReason::Broken);
}

#[test]
fn regressing_ack_is_fatal() {
    let (mut a, _b, now) =
        connect(LinkParams::default(), LinkParams::default(), LinkType::AlwaysOn);

    let payload = vec![0x77; 9000];
    a.handle_send_bundle(make_bundle(&payload));
    while a.send_pending_data(now) {}
    take_output(&mut a);

    deliver(&mut a, &ack_message(4096), now);
    assert!(!a.is_broken());
    deliver(&mut a, &ack_message(100), now);
    assert!(a.is_broken());
    assert_eq!(expect_contact_down(&mut a), ContactReason::Broken);
}

#[test]
fn data_beyond_the_payload_is_fatal() {
    let (mut a, mut b, now) =
        connect(LinkParams::default(), LinkParams::default(), LinkType::AlwaysOn);

    // An empty-payload bundle: START plus the header-only segment, END.
    a.handle_send_bundle(make_bundle(b""));
    while a.send_pending_data(now) {}
    let wire = take_output(&mut a);
    assert_eq!(*wire.last().unwrap(), END_BUNDLE);

    // Withhold END_BUNDLE and append a bogus extra data segment instead.
    deliver(&mut b, &wire[..wire.len() - 1], now);
    deliver(&mut b, &[DATA_SEGMENT, 0x01, 0x00], now);
    assert!(b.is_broken());
    assert_eq!(expect_contact_down(&mut b), ContactReason::Broken);
}

#[test]
fn break_contact_is_idempotent() {
    let (mut a, _b, _now) =
        connect(LinkParams::default(), LinkParams::default(), LinkType::AlwaysOn);

    a.break_contact(ContactReason::User);
    assert_eq!(expect_contact_down(&mut a), ContactReason::User);
    a.break_contact(ContactReason::Broken);
    a.break_contact(ContactReason::User);
    assert!(a.poll_event().is_none());
}

#[test]
fn cancel_bundle_is_a_no_op() {
    let (mut a, mut b, now) =
        connect(LinkParams::default(), LinkParams::default(), LinkType::AlwaysOn);

    let bundle = make_bundle(b"uncancellable");
    a.handle_send_bundle(bundle.clone());
    a.handle_cancel_bundle(&bundle);
    shuttle(&mut a, &mut b, now);

    // The bundle still goes through.
    let (received, _, _) = expect_received(&mut b);
    assert_eq!(received.payload.as_slice(), b"uncancellable");
    expect_transmitted(&mut a);
}
