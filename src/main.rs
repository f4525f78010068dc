//! Forwards DNS queries from local clients to upstream resolvers over
//! DNS-over-TLS, sharding listeners across worker threads via
//! `SO_REUSEPORT`.

mod config;
mod dispatcher;
mod dns;
mod framed;
mod proxy;
mod query;
mod resolver;
mod stats;
mod worker;

use std::io;
use std::sync::Arc;

use clap::Parser;

use config::{Cli, Config};
use worker::WorkerConfig;

fn main() -> io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::try_parse().unwrap_or_else(|e| {
        e.print().expect("failed to write clap usage output");
        std::process::exit(1);
    });
    let config = Config::from_file(&cli.config).unwrap_or_else(|e| {
        tracing::error!(error = %e, "failed to load configuration");
        std::process::exit(1);
    });

    let tls_config = build_tls_config();

    // Upstream hostname resolution happens once, up front, on this runtime;
    // every worker then gets the same resolved address list so a transient
    // DNS hiccup during startup doesn't strand some workers with no
    // upstreams at all. The same runtime then sits on the main thread
    // waiting for a shutdown signal while the workers run on their own.
    let bootstrap = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let upstreams = bootstrap
        .block_on(config.resolve_upstreams())
        .unwrap_or_else(|e| {
            tracing::error!(error = %e, "failed to resolve upstream servers");
            std::process::exit(1);
        });

    let worker_count = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    tracing::info!(worker_count, listen_port = config.listen_port, "starting");

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let mut handles = Vec::with_capacity(worker_count);
    for worker_id in 0..worker_count {
        let worker_config = WorkerConfig {
            listen_address: config.listen_address,
            listen_port: config.listen_port,
            udp_payload_size_limit: config.udp_payload_size_limit,
            query_timeout: config.query_timeout,
            upstreams: upstreams.clone(),
            tls_config: Arc::clone(&tls_config),
            shutdown: shutdown_rx.clone(),
        };
        handles.push(
            std::thread::Builder::new()
                .name(format!("dns-worker-{worker_id}"))
                .spawn(move || worker::run_worker(worker_id, worker_config))
                .expect("failed to spawn worker thread"),
        );
    }

    // Reuse the bootstrap runtime (still alive, still on the main thread) to
    // wait for a shutdown signal while the workers run on their own threads.
    bootstrap.block_on(worker::shutdown_signal());
    tracing::info!("shutdown signal received, stopping workers");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        if let Err(e) = handle.join().expect("worker thread panicked") {
            tracing::error!(error = %e, "worker thread exited with an error");
        }
    }

    Ok(())
}

fn build_tls_config() -> Arc<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}
