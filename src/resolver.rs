//! One persistent, pipelined DNS-over-TLS connection to a single upstream.
//!
//! Kept per I/O worker, never shared across threads. Multiplexes many
//! outstanding queries over one TLS connection using a local 16-bit ID
//! space, remapping back to the client's original transaction ID on the
//! way out.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use rustls_pki_types::ServerName;
use tokio::io::{split, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_rustls::{client::TlsStream, TlsConnector};

use crate::dns::{read_id, rewrite_id};
use crate::framed::FramedReader;
use crate::query::QueryContext;

const FIRST_RETRY_INTERVAL: Duration = Duration::from_millis(500);
const MAX_RETRY_INTERVAL: Duration = Duration::from_secs(5 * 60);
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ResolverError {
    #[error("connect failed: {0}")]
    Connect(#[source] std::io::Error),
    #[error("tls handshake failed: {0}")]
    Handshake(#[source] std::io::Error),
    #[error("all configured addresses are unreachable")]
    NoAddresses,
}

/// Everything one upstream connection needs that survives reconnects.
struct ResolverShared {
    hostname: String,
    addresses: Vec<SocketAddr>,
    /// Reused across every reconnect, so rustls's session cache (embedded
    /// in the config's resumption store) carries over automatically.
    tls_config: Arc<rustls::ClientConfig>,
    idle_timeout: Duration,

    write_queue: RefCell<VecDeque<Rc<QueryContext>>>,
    remap: RefCell<FxHashMap<u16, Rc<QueryContext>>>,
    next_local_id: Cell<u16>,
    retry_count: Cell<u32>,

    /// Woken whenever a query is submitted, so the write pump can stop
    /// idling. Also used to break out of the idle-timeout race promptly.
    work_available: Notify,
    /// The currently live reader task, if connected; aborted on reconnect
    /// so a stale reader can never deliver a response on a dead connection.
    reader_task: RefCell<Option<JoinHandle<()>>>,
}

/// Handle to one upstream's resolver. Cheap to clone (`Rc`); the actual
/// connection lifecycle runs in a background task spawned by [`TlsResolver::spawn`].
#[derive(Clone)]
pub struct TlsResolver {
    shared: Rc<ResolverShared>,
}

impl TlsResolver {
    pub fn new(
        hostname: String,
        addresses: Vec<SocketAddr>,
        tls_config: Arc<rustls::ClientConfig>,
        idle_timeout: Option<Duration>,
    ) -> Self {
        Self {
            shared: Rc::new(ResolverShared {
                hostname,
                addresses,
                tls_config,
                idle_timeout: idle_timeout.unwrap_or(DEFAULT_IDLE_TIMEOUT),
                write_queue: RefCell::new(VecDeque::new()),
                remap: RefCell::new(FxHashMap::default()),
                next_local_id: Cell::new(0),
                retry_count: Cell::new(0),
                work_available: Notify::new(),
                reader_task: RefCell::new(None),
            }),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.shared.hostname
    }

    /// Number of queries currently outstanding on this upstream (used by the
    /// dispatcher's load accounting).
    pub fn load(&self) -> usize {
        self.shared.remap.borrow().len() + self.shared.write_queue.borrow().len()
    }

    /// Spawn the background connection-lifecycle task. Must be called once,
    /// on the worker's `LocalSet`.
    pub fn spawn(&self) {
        let shared = Rc::clone(&self.shared);
        tokio::task::spawn_local(run_lifecycle(shared));
    }

    /// Enqueue a query for this upstream. Queries that are no longer
    /// `Waiting` by the time they are popped are dropped lazily, never here.
    pub fn submit(&self, query: Rc<QueryContext>) {
        self.shared.write_queue.borrow_mut().push_back(query);
        self.shared.work_available.notify_one();
    }
}

async fn run_lifecycle(shared: Rc<ResolverShared>) {
    loop {
        let conn = match connect_with_backoff(&shared).await {
            Ok(conn) => conn,
            Err(ResolverError::NoAddresses) => {
                tracing::error!(hostname = %shared.hostname, "no addresses configured, giving up");
                return;
            }
            Err(_) => unreachable!("connect_with_backoff retries until it succeeds"),
        };
        shared.retry_count.set(0);

        let (read_half, write_half) = split(conn);
        let reader_shared = Rc::clone(&shared);
        let reader_handle = tokio::task::spawn_local(run_reader(reader_shared, read_half));
        *shared.reader_task.borrow_mut() = Some(reader_handle);

        let outcome = drive_writes(&shared, write_half).await;

        if let Some(handle) = shared.reader_task.borrow_mut().take() {
            handle.abort();
        }

        match outcome {
            ConnectionOutcome::IdleClosed => {
                tracing::info!(hostname = %shared.hostname, "idle timeout, connection closed");
            }
            ConnectionOutcome::Broken => {
                tracing::warn!(hostname = %shared.hostname, "connection lost, reconnecting");
                requeue_outstanding(&shared);
            }
        }
    }
}

enum ConnectionOutcome {
    /// No outstanding queries and nothing queued when the idle timer fired;
    /// a clean, intentional close.
    IdleClosed,
    /// A write failed, or the idle timer fired while queries were still
    /// outstanding (the reference's "this connection looks dead" signal).
    Broken,
}

async fn connect_with_backoff(shared: &ResolverShared) -> Result<TlsStream<TcpStream>, ResolverError> {
    if shared.addresses.is_empty() {
        return Err(ResolverError::NoAddresses);
    }
    loop {
        match try_connect(shared).await {
            Ok(conn) => return Ok(conn),
            Err(e) => {
                let retry_count = shared.retry_count.get();
                tracing::error!(hostname = %shared.hostname, error = %e, retry_count, "connect/handshake failed");
                if retry_count > 0 {
                    let delay = backoff_delay(retry_count);
                    tokio::time::sleep(delay).await;
                }
                shared.retry_count.set(retry_count + 1);
            }
        }
    }
}

fn backoff_delay(retry_count: u32) -> Duration {
    let scaled = FIRST_RETRY_INTERVAL
        .checked_shl(retry_count)
        .unwrap_or(MAX_RETRY_INTERVAL);
    scaled.min(MAX_RETRY_INTERVAL)
}

async fn try_connect(shared: &ResolverShared) -> Result<TlsStream<TcpStream>, ResolverError> {
    let mut last_err = None;
    for addr in &shared.addresses {
        match TcpStream::connect(addr).await {
            Ok(tcp) => {
                let connector = TlsConnector::from(Arc::clone(&shared.tls_config));
                let server_name = ServerName::try_from(shared.hostname.clone()).map_err(|_| {
                    ResolverError::Handshake(std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "invalid hostname for TLS verification",
                    ))
                })?;
                return connector
                    .connect(server_name, tcp)
                    .await
                    .map_err(ResolverError::Handshake);
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(ResolverError::Connect(
        last_err.unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses")),
    ))
}

/// Drains the write queue, issuing one framed write at a time (pipelining:
/// we do not wait for the *response* before issuing the next write, only
/// for the previous write's socket op to complete), until the connection
/// breaks or the idle timer fires with an empty queue.
async fn drive_writes<W: tokio::io::AsyncWrite + Unpin>(
    shared: &ResolverShared,
    mut write_half: W,
) -> ConnectionOutcome {
    loop {
        while let Some(query) = pop_next_waiting(shared) {
            match write_one(shared, &query, &mut write_half).await {
                Ok(()) => {}
                Err(e) => {
                    tracing::error!(hostname = %shared.hostname, error = %e, "write failed");
                    shared.write_queue.borrow_mut().push_front(query);
                    return ConnectionOutcome::Broken;
                }
            }
        }

        let queue_empty = shared.write_queue.borrow().is_empty();
        if queue_empty {
            tokio::select! {
                _ = shared.work_available.notified() => {}
                _ = tokio::time::sleep(shared.idle_timeout) => {
                    return if shared.remap.borrow().is_empty() {
                        ConnectionOutcome::IdleClosed
                    } else {
                        ConnectionOutcome::Broken
                    };
                }
            }
        }
    }
}

/// Pop queued entries until one is still `Waiting`, dropping stale ones.
fn pop_next_waiting(shared: &ResolverShared) -> Option<Rc<QueryContext>> {
    loop {
        let query = shared.write_queue.borrow_mut().pop_front()?;
        if query.is_waiting() {
            return Some(query);
        }
    }
}

fn next_local_id(shared: &ResolverShared) -> u16 {
    loop {
        let id = shared.next_local_id.get();
        shared.next_local_id.set(id.wrapping_add(1));
        if !shared.remap.borrow().contains_key(&id) {
            return id;
        }
        // Collision with a still-outstanding entry: never overwrite it,
        // just keep scanning for a free slot.
    }
}

async fn write_one<W: tokio::io::AsyncWrite + Unpin>(
    shared: &ResolverShared,
    query: &Rc<QueryContext>,
    write_half: &mut W,
) -> std::io::Result<()> {
    let local_id = next_local_id(shared);
    let mut outgoing = query.query_framed.clone();
    rewrite_id(&mut outgoing[2..], local_id);
    shared.remap.borrow_mut().insert(local_id, Rc::clone(query));
    write_half.write_all(&outgoing).await
}

fn requeue_outstanding(shared: &ResolverShared) {
    let outstanding: Vec<_> = shared
        .remap
        .borrow_mut()
        .drain()
        .map(|(_, query)| query)
        .filter(|query| query.is_waiting())
        .collect();
    let mut queue = shared.write_queue.borrow_mut();
    for query in outstanding.into_iter().rev() {
        queue.push_front(query);
    }
}

async fn run_reader<R: tokio::io::AsyncRead + Unpin>(shared: Rc<ResolverShared>, read_half: R) {
    let mut reader = FramedReader::new(read_half);
    loop {
        match reader.next_message().await {
            Ok(Some(framed)) => handle_response(&shared, framed),
            Ok(None) => return,
            Err(_) => return,
        }
    }
}

fn handle_response(shared: &ResolverShared, mut framed: Vec<u8>) {
    let Some(local_id) = read_id(&framed[2..]) else {
        tracing::error!(hostname = %shared.hostname, "response shorter than a transaction id");
        return;
    };
    let Some(query) = shared.remap.borrow_mut().remove(&local_id) else {
        tracing::debug!(hostname = %shared.hostname, local_id, "no matching query, discarding");
        return;
    };
    if !query.is_waiting() {
        return;
    }
    rewrite_id(&mut framed[2..], query.original_id);
    query.try_write_answer(framed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(0), FIRST_RETRY_INTERVAL);
        assert_eq!(backoff_delay(1), FIRST_RETRY_INTERVAL * 2);
        assert_eq!(backoff_delay(4), FIRST_RETRY_INTERVAL * 16);
        assert_eq!(backoff_delay(20), MAX_RETRY_INTERVAL);
    }

    fn test_shared() -> ResolverShared {
        let roots = rustls::RootCertStore::empty();
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        );
        ResolverShared {
            hostname: "example.test".into(),
            addresses: vec![],
            tls_config,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            write_queue: RefCell::new(VecDeque::new()),
            remap: RefCell::new(FxHashMap::default()),
            next_local_id: Cell::new(0),
            retry_count: Cell::new(0),
            work_available: Notify::new(),
            reader_task: RefCell::new(None),
        }
    }

    #[test]
    fn next_local_id_skips_outstanding_entries() {
        let shared = test_shared();
        let ctx = QueryContext::new(vec![0xAB, 0xCD, 0, 0], crate::query::ClientEndpoint::Tcp);
        shared.remap.borrow_mut().insert(0, ctx);
        assert_eq!(next_local_id(&shared), 1);
    }

    #[test]
    fn pop_next_waiting_drops_stale_entries_first() {
        let shared = test_shared();
        let expired = QueryContext::new(vec![0, 0, 0, 0], crate::query::ClientEndpoint::Tcp);
        expired.expire();
        let live = QueryContext::new(vec![1, 1, 0, 0], crate::query::ClientEndpoint::Tcp);
        shared.write_queue.borrow_mut().push_back(expired);
        shared.write_queue.borrow_mut().push_back(Rc::clone(&live));

        let popped = pop_next_waiting(&shared).unwrap();
        assert!(Rc::ptr_eq(&popped, &live));
    }

    #[test]
    fn requeue_outstanding_keeps_only_waiting_queries_in_order() {
        let shared = test_shared();
        let first = QueryContext::new(vec![0, 1, 0, 0], crate::query::ClientEndpoint::Tcp);
        let second = QueryContext::new(vec![0, 2, 0, 0], crate::query::ClientEndpoint::Tcp);
        let answered = QueryContext::new(vec![0, 3, 0, 0], crate::query::ClientEndpoint::Tcp);
        answered.try_write_answer(vec![9]);
        shared.remap.borrow_mut().insert(1, Rc::clone(&first));
        shared.remap.borrow_mut().insert(2, Rc::clone(&second));
        shared.remap.borrow_mut().insert(3, answered);

        requeue_outstanding(&shared);

        assert!(shared.remap.borrow().is_empty());
        let queue = shared.write_queue.borrow();
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn handle_response_rewrites_id_and_removes_remap_entry() {
        let shared = test_shared();
        let query = QueryContext::new(vec![0xAB, 0xCD, 0, 0], crate::query::ClientEndpoint::Tcp);
        shared.remap.borrow_mut().insert(7, Rc::clone(&query));

        let mut framed_response = vec![0u8, 12]; // length prefix, body len 12
        framed_response.extend_from_slice(&[0, 7, 0x80, 0, 0, 1, 0, 0, 0, 0, 0, 0]);
        handle_response(&shared, framed_response);

        assert!(shared.remap.borrow().is_empty());
        let answer = query.answer_framed.borrow();
        let answer = answer.as_ref().unwrap();
        assert_eq!(&answer[2..4], &[0xAB, 0xCD]);
    }
}
