//! Command-line parsing and the `key=value` configuration file format.
//!
//! The file grammar (particularly `remote-servers`, a comma/slash/pipe
//! mini-language) is bespoke enough that a generic config crate buys
//! nothing over a small hand-rolled reader; the reference implementation
//! hand-parses it too.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;

const DEFAULT_CONFIG_PATH: &str = "./dnstoy.conf";
const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0";
const DEFAULT_LISTEN_PORT: u16 = 53;
const DEFAULT_UDP_PAYLOAD_SIZE_LIMIT: u16 = 65507;
const DEFAULT_QUERY_TIMEOUT_MS: u32 = 10_000;
const DEFAULT_EDNS0_CLIENT_SUBNET: &str = "0.0.0.0/0";
const DEFAULT_REMOTE_SERVERS: &str = "tls@853/1.0.0.1/cloudflare-dns.com";
const DEFAULT_TLS_PORT: u16 = 853;

#[derive(Parser)]
#[command(name = "dnsrelay")]
#[command(about = "Forwards DNS queries to upstream resolvers over DNS-over-TLS", long_about = None)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config file {path}, line {line}: {message}")]
    Malformed {
        path: PathBuf,
        line: usize,
        message: String,
    },
    #[error("remote-servers entry has no usable transport or address: {entry}")]
    NoUsableUpstream { entry: String },
    #[error("could not resolve hostname {hostname}: {source}")]
    Resolve {
        hostname: String,
        #[source]
        source: std::io::Error,
    },
}

/// A parsed `remote-servers` entry before hostname resolution has run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawUpstreamSpec {
    pub ports: Vec<u16>,
    pub addresses: Vec<IpAddr>,
    pub hostname: String,
}

/// A fully resolved upstream: one TLS port, a non-empty address list, and
/// the hostname used for TLS hostname verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamSpec {
    pub port: u16,
    pub addresses: Vec<IpAddr>,
    pub hostname: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_address: IpAddr,
    pub listen_port: u16,
    pub udp_payload_size_limit: u16,
    pub query_timeout: Duration,
    /// Reserved: parsed and carried but not yet injected into upstream
    /// queries (see DESIGN.md).
    pub edns0_client_subnet: String,
    pub remote_servers: Vec<RawUpstreamSpec>,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let mut listen_address = DEFAULT_LISTEN_ADDRESS.to_string();
        let mut listen_port = DEFAULT_LISTEN_PORT;
        let mut udp_payload_size_limit = DEFAULT_UDP_PAYLOAD_SIZE_LIMIT;
        let mut query_timeout_ms = DEFAULT_QUERY_TIMEOUT_MS;
        let mut edns0_client_subnet = DEFAULT_EDNS0_CLIENT_SUBNET.to_string();
        let mut remote_servers_raw = DEFAULT_REMOTE_SERVERS.to_string();

        for (line_no, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::Malformed {
                    path: path.to_path_buf(),
                    line: line_no + 1,
                    message: "expected key=value".into(),
                });
            };
            let (key, value) = (key.trim(), value.trim());
            let malformed = |message: &str| ConfigError::Malformed {
                path: path.to_path_buf(),
                line: line_no + 1,
                message: message.to_string(),
            };
            match key {
                "listen-address" => listen_address = value.to_string(),
                "listen-port" => {
                    listen_port = value.parse().map_err(|_| malformed("invalid listen-port"))?
                }
                "udp-payload-size-limit" => {
                    udp_payload_size_limit = value
                        .parse()
                        .map_err(|_| malformed("invalid udp-payload-size-limit"))?
                }
                "query-timeout" => {
                    query_timeout_ms = value.parse().map_err(|_| malformed("invalid query-timeout"))?
                }
                "edns0-client-subnet" => edns0_client_subnet = value.to_string(),
                "remote-servers" => remote_servers_raw = value.to_string(),
                other => {
                    tracing::warn!(key = other, "unrecognized configuration key, ignoring");
                }
            }
        }

        let listen_address = listen_address
            .parse()
            .map_err(|_| ConfigError::Malformed {
                path: path.to_path_buf(),
                line: 0,
                message: format!("invalid listen-address: {listen_address}"),
            })?;
        let remote_servers = parse_remote_servers(&remote_servers_raw)
            .map_err(|message| ConfigError::Malformed {
                path: path.to_path_buf(),
                line: 0,
                message,
            })?;

        Ok(Config {
            listen_address,
            listen_port,
            udp_payload_size_limit,
            query_timeout: Duration::from_millis(query_timeout_ms as u64),
            edns0_client_subnet,
            remote_servers,
        })
    }

    /// Resolve every raw upstream entry into one or more [`UpstreamSpec`]s
    /// (one per configured port), looking up addresses via the system
    /// resolver wherever an entry's address list was left empty.
    pub async fn resolve_upstreams(&self) -> Result<Vec<UpstreamSpec>, ConfigError> {
        let mut resolved = Vec::new();
        for raw in &self.remote_servers {
            let addresses = if raw.addresses.is_empty() {
                lookup_hostname(&raw.hostname).await?
            } else {
                raw.addresses.clone()
            };
            if addresses.is_empty() {
                return Err(ConfigError::NoUsableUpstream {
                    entry: raw.hostname.clone(),
                });
            }
            let ports = if raw.ports.is_empty() {
                vec![DEFAULT_TLS_PORT]
            } else {
                raw.ports.clone()
            };
            for port in ports {
                resolved.push(UpstreamSpec {
                    port,
                    addresses: addresses.clone(),
                    hostname: raw.hostname.clone(),
                });
            }
        }
        if resolved.is_empty() {
            return Err(ConfigError::NoUsableUpstream {
                entry: "remote-servers".into(),
            });
        }
        Ok(resolved)
    }
}

async fn lookup_hostname(hostname: &str) -> Result<Vec<IpAddr>, ConfigError> {
    tokio::net::lookup_host((hostname, DEFAULT_TLS_PORT))
        .await
        .map(|iter| iter.map(|addr| addr.ip()).collect())
        .map_err(|source| ConfigError::Resolve {
            hostname: hostname.to_string(),
            source,
        })
}

/// Parse `remote-servers`: comma-separated entries, each up to three
/// slash-separated fields (transport-spec / address-list / hostname), with
/// transport-spec and address-list each accepting pipe-separated
/// alternatives. A transport-spec token is `tls` (port 853) or
/// `tls@<port>`.
fn parse_remote_servers(text: &str) -> Result<Vec<RawUpstreamSpec>, String> {
    let mut entries = Vec::new();
    for entry in text.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let mut fields = entry.splitn(3, '/');
        let transport_field = fields.next().unwrap_or("");
        let address_field = fields.next().unwrap_or("");
        let hostname = fields.next().unwrap_or("").trim().to_string();

        let ports = parse_transport_field(transport_field)?;
        let addresses = parse_address_field(address_field)?;

        if ports.is_empty() && addresses.is_empty() {
            return Err(format!(
                "remote-servers entry '{entry}' has no usable transport or address"
            ));
        }
        if hostname.is_empty() {
            return Err(format!(
                "remote-servers entry '{entry}' is missing the hostname field required for TLS verification"
            ));
        }

        entries.push(RawUpstreamSpec {
            ports,
            addresses,
            hostname,
        });
    }
    Ok(entries)
}

fn parse_transport_field(field: &str) -> Result<Vec<u16>, String> {
    let field = field.trim();
    if field.is_empty() {
        return Ok(Vec::new());
    }
    field
        .split('|')
        .map(|token| {
            let token = token.trim();
            match token.split_once('@') {
                Some(("tls", port)) => port
                    .parse()
                    .map_err(|_| format!("invalid transport port in '{token}'")),
                None if token == "tls" => Ok(DEFAULT_TLS_PORT),
                _ => Err(format!("unsupported transport spec '{token}' (only tls/tls@<port> are supported)")),
            }
        })
        .collect()
}

fn parse_address_field(field: &str) -> Result<Vec<IpAddr>, String> {
    let field = field.trim();
    if field.is_empty() {
        return Ok(Vec::new());
    }
    field
        .split('|')
        .map(|token| {
            token
                .trim()
                .parse()
                .map_err(|_| format!("invalid address '{token}'"))
        })
        .collect()
}
