//! Client-facing proxy contexts: one owns the shared UDP socket, one owns
//! each accepted TCP connection. Both decode inbound messages, hand them to
//! the dispatcher, and turn the eventual completion (or timeout) into a
//! reply.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{watch, Notify};

use crate::dispatcher::Dispatcher;
use crate::dns::{decode_message, encode_message, truncate_message, Header, Message};
use crate::framed::{read_datagram, FramedReader};
use crate::query::{ClientEndpoint, QueryContext, QueryStatus};
use crate::stats::Stats;

/// RFC 1035 RCODE 2: the server was unable to process the query due to a
/// problem with the server. Used as the default synthesized failure code.
const SERVER_FAILURE_RCODE: u8 = 2;

pub struct ProxySettings {
    pub udp_payload_size_limit: u16,
    pub query_timeout: Duration,
    pub stats: Rc<Stats>,
}

/// Validate that `raw` (no framing prefix) is a structurally decodable DNS
/// message. The forwarder never inspects field values beyond this, only
/// discards frames it cannot even parse (RFC 5625 transparency).
fn is_well_formed(raw: &[u8]) -> bool {
    decode_message(raw).is_ok()
}

fn framed(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + raw.len());
    out.extend_from_slice(&(raw.len() as u16).to_be_bytes());
    out.extend_from_slice(raw);
    out
}

fn synthesize_failure(id: u16, rcode: u8) -> Vec<u8> {
    let message = Message {
        header: Header::server_failure(id, rcode),
        questions: Vec::new(),
        answers: Vec::new(),
        authorities: Vec::new(),
        additional: Vec::new(),
    };
    let mut raw = Vec::new();
    encode_message(&message, &mut raw).expect("a header-only message always encodes");
    raw
}

/// Race the query's completion against its deadline. Returns once the
/// query has left `Waiting`, marking it `Expired` if the deadline won.
async fn await_with_deadline(query: &Rc<QueryContext>, timeout: Duration) {
    tokio::select! {
        _ = query.wait_for_completion() => {}
        _ = tokio::time::sleep(timeout) => {
            query.expire();
        }
    }
}

/// UDP proxy context: one shared socket serves every client. Each datagram
/// is handled by its own task; tokio's `UdpSocket::send_to` is safe to call
/// concurrently, so unlike the TCP path there is no shared write queue.
///
/// Returns once `shutdown` reports `true`, closing the acceptor side (no
/// more datagrams are read off `socket`) while already-dispatched queries
/// keep running and reply over their own clone of the socket.
pub async fn run_udp(
    socket: Rc<UdpSocket>,
    dispatcher: Rc<Dispatcher>,
    settings: Rc<ProxySettings>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = read_datagram(&socket, settings.udp_payload_size_limit as usize) => {
                match result {
                    Ok((bytes, source)) => {
                        tokio::task::spawn_local(handle_udp_query(
                            Rc::clone(&socket),
                            bytes,
                            source,
                            Rc::clone(&dispatcher),
                            Rc::clone(&settings),
                        ));
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "udp recv failed");
                    }
                }
            }
            _ = shutdown.changed() => {
                tracing::info!("udp listener closing on shutdown signal");
                return;
            }
        }
    }
}

async fn handle_udp_query(
    socket: Rc<UdpSocket>,
    raw: Vec<u8>,
    source: SocketAddr,
    dispatcher: Rc<Dispatcher>,
    settings: Rc<ProxySettings>,
) {
    if !is_well_formed(&raw) {
        tracing::error!(%source, "malformed udp query, dropping");
        settings.stats.record_malformed_dropped();
        return;
    }
    settings.stats.record_received();

    let started = Instant::now();
    let query = QueryContext::new(framed(&raw), ClientEndpoint::Udp(source));
    dispatcher.dispatch(&query);
    await_with_deadline(&query, settings.query_timeout).await;

    let mut reply = match query.answer_framed.borrow().clone() {
        Some(framed_answer) => {
            query.accept();
            settings
                .stats
                .record_forwarded(started.elapsed().as_secs_f64() * 1000.0);
            framed_answer[2..].to_vec()
        }
        None => {
            if query.status() == QueryStatus::Expired {
                settings.stats.record_timed_out();
            }
            synthesize_failure(query.original_id, SERVER_FAILURE_RCODE)
        }
    };
    let limit = settings.udp_payload_size_limit as usize;
    if reply.len() > limit {
        if let Err(e) = truncate_message(&mut reply, limit) {
            tracing::error!(error = %e, "failed to truncate oversized udp reply, sending as-is");
        } else {
            tracing::warn!(%source, limit, "udp reply truncated to fit payload limit");
            settings.stats.record_udp_truncated();
        }
    }

    if let Err(e) = socket.send_to(&reply, source).await {
        tracing::error!(%source, error = %e, "udp send failed");
    }
}

/// TCP proxy context: one instance per accepted connection. Replies are
/// written strictly in completion order (not arrival order) through a
/// single-writer queue, matching RFC 7766 pipelining semantics.
///
/// Returns once `shutdown` reports `true`, closing the acceptor so no new
/// connections are taken in; already-accepted connections keep running
/// until their client disconnects or their in-flight queries settle.
pub async fn run_tcp_listener(
    listener: TcpListener,
    dispatcher: Rc<Dispatcher>,
    settings: Rc<ProxySettings>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!(%peer, "tcp client connected");
                        tokio::task::spawn_local(run_tcp_connection(
                            stream,
                            Rc::clone(&dispatcher),
                            Rc::clone(&settings),
                        ));
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "tcp accept failed");
                    }
                }
            }
            _ = shutdown.changed() => {
                tracing::info!("tcp listener closing on shutdown signal");
                return;
            }
        }
    }
}

struct ReplyQueue {
    pending: RefCell<VecDeque<Vec<u8>>>,
    work_available: Notify,
    done: RefCell<bool>,
}

async fn run_tcp_connection(stream: TcpStream, dispatcher: Rc<Dispatcher>, settings: Rc<ProxySettings>) {
    let (read_half, write_half) = tokio::io::split(stream);
    let queue = Rc::new(ReplyQueue {
        pending: RefCell::new(VecDeque::new()),
        work_available: Notify::new(),
        done: RefCell::new(false),
    });

    let writer_queue = Rc::clone(&queue);
    let writer = tokio::task::spawn_local(drain_replies(writer_queue, write_half));

    let mut reader = FramedReader::new(read_half);
    loop {
        match reader.next_message().await {
            Ok(Some(raw_framed)) => {
                let raw = raw_framed[2..].to_vec();
                if !is_well_formed(&raw) {
                    tracing::error!("malformed tcp query, dropping frame (connection stays open)");
                    settings.stats.record_malformed_dropped();
                    continue;
                }
                settings.stats.record_received();
                tokio::task::spawn_local(handle_tcp_query(
                    raw_framed,
                    Rc::clone(&dispatcher),
                    Rc::clone(&settings),
                    Rc::clone(&queue),
                ));
            }
            Ok(None) => break,
            Err(_) => break,
        }
    }

    *queue.done.borrow_mut() = true;
    queue.work_available.notify_one();
    let _ = writer.await;
}

async fn handle_tcp_query(
    query_framed: Vec<u8>,
    dispatcher: Rc<Dispatcher>,
    settings: Rc<ProxySettings>,
    queue: Rc<ReplyQueue>,
) {
    let started = Instant::now();
    let query = QueryContext::new(query_framed, ClientEndpoint::Tcp);
    dispatcher.dispatch(&query);
    await_with_deadline(&query, settings.query_timeout).await;

    let reply = match query.answer_framed.borrow().clone() {
        Some(framed_answer) => {
            query.accept();
            settings
                .stats
                .record_forwarded(started.elapsed().as_secs_f64() * 1000.0);
            framed_answer
        }
        None => {
            if query.status() == QueryStatus::Expired {
                settings.stats.record_timed_out();
            }
            framed(&synthesize_failure(query.original_id, SERVER_FAILURE_RCODE))
        }
    };
    queue.pending.borrow_mut().push_back(reply);
    queue.work_available.notify_one();
}

async fn drain_replies<W: tokio::io::AsyncWrite + Unpin>(queue: Rc<ReplyQueue>, mut write_half: W) {
    loop {
        while let Some(reply) = {
            let next = queue.pending.borrow_mut().pop_front();
            next
        } {
            if write_half.write_all(&reply).await.is_err() {
                return;
            }
        }
        if *queue.done.borrow() && queue.pending.borrow().is_empty() {
            return;
        }
        queue.work_available.notified().await;
    }
}
