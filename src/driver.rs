//! Runs a connection engine against a real byte stream.
//!
//! One task owns the engine and the stream. The engine suspends in exactly
//! three places: reading when nothing has arrived, writing when the
//! transport is not accepting bytes, and the poll-timeout wait. Everything
//! else runs to completion inside the state machine, so no locks are
//! needed and per-connection ordering falls out of the structure.

use crate::bundle::Bundle;
use crate::conn::ClConnection;
use crate::event::{ContactReason, DaemonEvent};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Requests the daemon sends a running connection.
#[derive(Debug)]
pub enum ConnectionCommand {
    /// Enqueue a bundle for transmission.
    SendBundle(Arc<Bundle>),
    /// Revoke a queued bundle. The protocol cannot cancel mid-stream, so
    /// this is a no-op; it exists so the daemon surface is complete.
    CancelBundle(Arc<Bundle>),
    /// Tear the contact down with the given reason.
    Break(ContactReason),
}

/// Drives `conn` over `stream` until the contact closes. Events are
/// forwarded to the daemon's queue in posting order; commands arrive on
/// `commands`, and dropping the command sender closes the contact with
/// [`ContactReason::User`].
pub async fn run_connection<C, S>(
    mut conn: C,
    stream: S,
    events: mpsc::UnboundedSender<DaemonEvent>,
    mut commands: mpsc::UnboundedReceiver<ConnectionCommand>,
) where
    C: ClConnection,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut read_buf = vec![0u8; 8192];
    let mut poll = tokio::time::interval(conn.poll_interval());
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    conn.initiate_contact(Instant::now());

    loop {
        // Pump the engine and drain its output before suspending; acks and
        // data interleave inside send_pending_data.
        loop {
            let progressed = conn.send_pending_data(Instant::now());
            let mut wrote = false;
            while !conn.pending_output().is_empty() {
                match writer.write(conn.pending_output()).await {
                    Ok(0) | Err(_) => {
                        conn.break_contact(ContactReason::Broken);
                        break;
                    }
                    Ok(n) => {
                        conn.consume_output(n);
                        wrote = true;
                    }
                }
            }
            if !progressed && !wrote {
                break;
            }
            if conn.is_broken() {
                break;
            }
        }

        forward_events(&mut conn, &events);
        if conn.is_broken() {
            break;
        }

        tokio::select! {
            read = reader.read(&mut read_buf) => {
                let now = Instant::now();
                match read {
                    Ok(0) => {
                        debug!("remote closed the stream");
                        conn.break_contact(ContactReason::Broken);
                    }
                    Ok(n) => {
                        conn.receive_bytes(&read_buf[..n]);
                        // Handshake completion can leave whole messages
                        // sitting behind it in the buffer; keep processing
                        // while bytes are being consumed.
                        loop {
                            let before = conn.recv_pending();
                            conn.process_data(now);
                            if conn.recv_pending() == before {
                                break;
                            }
                        }
                    }
                    Err(err) => {
                        warn!(%err, "read failed");
                        conn.break_contact(ContactReason::Broken);
                    }
                }
            }
            _ = poll.tick() => {
                conn.handle_poll_timeout(Instant::now());
            }
            command = commands.recv() => {
                match command {
                    Some(ConnectionCommand::SendBundle(bundle)) => {
                        conn.handle_send_bundle(bundle);
                    }
                    Some(ConnectionCommand::CancelBundle(bundle)) => {
                        conn.handle_cancel_bundle(&bundle);
                    }
                    Some(ConnectionCommand::Break(reason)) => {
                        conn.break_contact(reason);
                    }
                    None => {
                        conn.break_contact(ContactReason::User);
                    }
                }
            }
        }
    }

    // Flush the shutdown byte if the orderly path queued one, then hand
    // over whatever events the teardown produced.
    while !conn.pending_output().is_empty() {
        match writer.write(conn.pending_output()).await {
            Ok(0) | Err(_) => break,
            Ok(n) => conn.consume_output(n),
        }
    }
    let _ = writer.shutdown().await;
    forward_events(&mut conn, &events);
}

fn forward_events<C: ClConnection>(conn: &mut C, events: &mpsc::UnboundedSender<DaemonEvent>) {
    while let Some(event) = conn.poll_event() {
        if events.send(event).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::EndpointId;
    use crate::conn::Connection;
    use crate::contact::ContactManager;
    use crate::link::{LinkParams, LinkType};
    use std::time::Duration;
    use tokio::time::timeout;

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<DaemonEvent>) -> DaemonEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("event channel closed")
    }

    fn make_side(
        eid: &str,
        params: LinkParams,
    ) -> (
        Connection,
        mpsc::UnboundedSender<ConnectionCommand>,
        mpsc::UnboundedReceiver<ConnectionCommand>,
        mpsc::UnboundedSender<DaemonEvent>,
        mpsc::UnboundedReceiver<DaemonEvent>,
    ) {
        let mgr = Arc::new(ContactManager::new());
        let link = mgr.add_link(LinkType::AlwaysOn, params.clone());
        let local: EndpointId = eid.parse().unwrap();
        let conn = Connection::new(
            link,
            LinkType::AlwaysOn,
            params,
            local,
            None,
            mgr,
            Instant::now(),
        );
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (conn, cmd_tx, cmd_rx, event_tx, event_rx)
    }

    #[tokio::test]
    async fn bundle_round_trip_over_a_duplex_stream() {
        let (stream_a, stream_b) = tokio::io::duplex(1024);

        let (conn_a, cmd_a, cmd_rx_a, event_tx_a, mut events_a) =
            make_side("dtn://alpha/", LinkParams::default());
        let (conn_b, _cmd_b, cmd_rx_b, event_tx_b, mut events_b) =
            make_side("dtn://bravo/", LinkParams::default());

        let task_a = tokio::spawn(run_connection(conn_a, stream_a, event_tx_a, cmd_rx_a));
        let task_b = tokio::spawn(run_connection(conn_b, stream_b, event_tx_b, cmd_rx_b));

        assert!(matches!(
            next_event(&mut events_a).await,
            DaemonEvent::ContactUp { .. }
        ));
        assert!(matches!(
            next_event(&mut events_b).await,
            DaemonEvent::ContactUp { .. }
        ));

        let mut bundle = Bundle::new();
        bundle.source = "dtn://alpha/".parse().unwrap();
        bundle.dest = "dtn://bravo/inbox".parse().unwrap();
        bundle.expiration = 60;
        bundle.payload.set_data(b"over the wire");
        let payload_len = bundle.payload.len();
        cmd_a
            .send(ConnectionCommand::SendBundle(Arc::new(bundle)))
            .unwrap();

        match next_event(&mut events_b).await {
            DaemonEvent::BundleReceived {
                bundle,
                bytes_received,
                fragment,
                ..
            } => {
                assert_eq!(bundle.payload.as_slice(), b"over the wire");
                assert_eq!(bytes_received, payload_len);
                assert!(!fragment);
            }
            other => panic!("expected BundleReceived, got {other:?}"),
        }

        match next_event(&mut events_a).await {
            DaemonEvent::BundleTransmitted {
                bytes_sent,
                bytes_acked,
                ..
            } => {
                assert_eq!(bytes_sent, payload_len);
                assert_eq!(bytes_acked, payload_len);
            }
            other => panic!("expected BundleTransmitted, got {other:?}"),
        }

        // Dropping the command sender closes the contact from A's side; B
        // sees the SHUTDOWN message.
        drop(cmd_a);
        assert!(matches!(
            next_event(&mut events_a).await,
            DaemonEvent::ContactDown {
                reason: ContactReason::User,
                ..
            }
        ));
        assert!(matches!(
            next_event(&mut events_b).await,
            DaemonEvent::ContactDown {
                reason: ContactReason::Shutdown,
                ..
            }
        ));

        task_a.await.unwrap();
        task_b.await.unwrap();
    }
}
