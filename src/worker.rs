//! One OS thread's worth of the proxy: its own single-threaded tokio
//! runtime, its own [`Dispatcher`] and upstream [`TlsResolver`]s, its own
//! UDP and TCP listeners bound with `SO_REUSEPORT` so the kernel spreads
//! client connections across workers. Nothing here is shared with any
//! other worker.

use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;
use tokio::task::LocalSet;

use crate::config::UpstreamSpec;
use crate::dispatcher::Dispatcher;
use crate::proxy::{run_tcp_listener, run_udp, ProxySettings};
use crate::resolver::TlsResolver;
use crate::stats::Stats;

pub struct WorkerConfig {
    pub listen_address: std::net::IpAddr,
    pub listen_port: u16,
    pub udp_payload_size_limit: u16,
    pub query_timeout: Duration,
    pub upstreams: Vec<UpstreamSpec>,
    pub tls_config: Arc<rustls::ClientConfig>,
    /// Flips to `true` once the process has received a shutdown signal.
    pub shutdown: watch::Receiver<bool>,
}

/// Waits for Ctrl+C, or on Unix, for SIGTERM as well. Each worker thread
/// runs its own tokio runtime, but tokio's signal driver fans a single OS
/// signal out to every listener registered across them, so calling this
/// from several runtimes in the same process is safe.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Bind a `SO_REUSEPORT` socket of the given type to `addr`. Every worker
/// calls this with the same address; the kernel load-balances incoming
/// datagrams/connections across the bound sockets.
fn bind_reuseport(addr: SocketAddr, ty: Type) -> std::io::Result<Socket> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let protocol = match ty {
        Type::DGRAM => Some(Protocol::UDP),
        Type::STREAM => Some(Protocol::TCP),
        _ => None,
    };
    let socket = Socket::new(domain, ty, protocol)?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    if ty == Type::STREAM {
        socket.listen(1024)?;
    }
    Ok(socket)
}

/// Run one worker to completion on the current OS thread. Spawns a
/// single-threaded tokio runtime, so every task here stays on this
/// thread and can freely use `Rc`/`RefCell` for shared state.
pub fn run_worker(worker_id: usize, config: WorkerConfig) -> std::io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let local = LocalSet::new();
    local.block_on(&runtime, async move {
        if let Err(e) = run_worker_async(worker_id, config).await {
            tracing::error!(worker_id, error = %e, "worker exited with an error");
        }
    });
    Ok(())
}

async fn run_worker_async(worker_id: usize, config: WorkerConfig) -> std::io::Result<()> {
    let bind_addr = SocketAddr::new(config.listen_address, config.listen_port);

    let udp_socket = bind_reuseport(bind_addr, Type::DGRAM)?;
    let udp_socket: std::net::UdpSocket = udp_socket.into();
    let udp_socket = Rc::new(UdpSocket::from_std(udp_socket)?);

    let tcp_socket = bind_reuseport(bind_addr, Type::STREAM)?;
    let tcp_listener: std::net::TcpListener = tcp_socket.into();
    let tcp_listener = TcpListener::from_std(tcp_listener)?;

    let resolvers: Vec<TlsResolver> = config
        .upstreams
        .iter()
        .map(|upstream| {
            let addresses: Vec<SocketAddr> = upstream
                .addresses
                .iter()
                .map(|ip| SocketAddr::new(*ip, upstream.port))
                .collect();
            TlsResolver::new(
                upstream.hostname.clone(),
                addresses,
                Arc::clone(&config.tls_config),
                None,
            )
        })
        .collect();

    let dispatcher = Rc::new(Dispatcher::new(resolvers));
    dispatcher.spawn_all();

    let stats = Rc::new(Stats::new());
    let settings = Rc::new(ProxySettings {
        udp_payload_size_limit: config.udp_payload_size_limit,
        query_timeout: config.query_timeout,
        stats: Rc::clone(&stats),
    });

    tracing::info!(worker_id, %bind_addr, "worker listening");

    let mut shutdown_rx = config.shutdown;

    let udp_task = tokio::task::spawn_local(run_udp(
        Rc::clone(&udp_socket),
        Rc::clone(&dispatcher),
        Rc::clone(&settings),
        shutdown_rx.clone(),
    ));
    let tcp_task = tokio::task::spawn_local(run_tcp_listener(
        tcp_listener,
        dispatcher,
        settings,
        shutdown_rx.clone(),
    ));
    let stats_task = tokio::task::spawn_local(log_stats_periodically(worker_id, stats));

    while !*shutdown_rx.borrow() {
        if shutdown_rx.changed().await.is_err() {
            break;
        }
    }

    tracing::info!(worker_id, "shutdown signal received, closing listeners");
    stats_task.abort();
    let _ = tokio::join!(udp_task, tcp_task);

    // The listeners are closed; any already-dispatched query still races its
    // own query-timeout deadline (see await_with_deadline), so it settles on
    // its own within one timeout window. Give that window to elapse before
    // this worker's runtime tears down and cancels whatever's left.
    tokio::time::sleep(config.query_timeout).await;
    tracing::info!(worker_id, "worker shut down");
    Ok(())
}

async fn log_stats_periodically(worker_id: usize, stats: Rc<Stats>) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let snapshot = stats.snapshot_and_reset();
        tracing::info!(
            worker_id,
            received = snapshot.received,
            forwarded = snapshot.forwarded,
            timed_out = snapshot.timed_out,
            malformed_dropped = snapshot.malformed_dropped,
            udp_truncated = snapshot.udp_truncated,
            avg_response_ms = snapshot.avg_response_ms,
            "worker stats"
        );
    }
}
