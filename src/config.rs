//! Server configuration

use crate::protocol::DEFAULT_MAX_PAYLOAD_SIZE;
use std::path::PathBuf;

/// Default bind address
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:4730";

/// Default maximum number of concurrent connections
pub const DEFAULT_MAX_CONNECTIONS: usize = 1000;

/// Default number of frames buffered for one connection's writer
pub const DEFAULT_OUTBOUND_QUEUE_SIZE: usize = 1024;

/// TLS material for one endpoint.
///
/// When `cert_path` and `key_path` are set the endpoint presents that
/// identity. A server with `ca_cert_path` set requires client certificates
/// signed by that CA; a client or worker uses it to verify the server.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Path to the CA certificate (PEM format).
    pub ca_cert_path: Option<PathBuf>,

    /// Path to this endpoint's certificate (PEM format).
    pub cert_path: Option<PathBuf>,

    /// Path to this endpoint's private key (PEM format).
    pub key_path: Option<PathBuf>,
}

impl TlsConfig {
    /// Build a config from key, certificate and CA paths
    pub fn new(
        key_path: impl Into<PathBuf>,
        cert_path: impl Into<PathBuf>,
        ca_cert_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            ca_cert_path: Some(ca_cert_path.into()),
            cert_path: Some(cert_path.into()),
            key_path: Some(key_path.into()),
        }
    }

    /// Whether all three paths are present
    pub fn is_complete(&self) -> bool {
        self.ca_cert_path.is_some() && self.cert_path.is_some() && self.key_path.is_some()
    }
}

/// Broker settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to; port 0 picks a free port
    pub bind_addr: String,
    /// Largest accepted payload or admin line
    pub max_payload_size: u32,
    /// Connections beyond this are dropped on accept
    pub max_connections: usize,
    /// Frames buffered per connection; a peer that lets it fill is disconnected
    pub outbound_queue_size: usize,
    /// Middle part of generated handles (`H:<prefix>:<n>`)
    pub handle_prefix: String,
    /// Wrap accepted sockets in TLS when set
    pub tls: Option<TlsConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            outbound_queue_size: DEFAULT_OUTBOUND_QUEUE_SIZE,
            handle_prefix: "gearq".to_string(),
            tls: None,
        }
    }
}

impl ServerConfig {
    /// Defaults with the given bind address
    pub fn new(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            ..Default::default()
        }
    }

    /// Serve over TLS with the given material
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Defaults overridden by any `GEARQ_*` environment variables that are set
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(addr) = lookup("GEARQ_BIND_ADDR") {
            cfg.bind_addr = addr;
        }
        if let Some(size) = lookup("GEARQ_MAX_PAYLOAD").and_then(|v| v.parse().ok()) {
            cfg.max_payload_size = size;
        }
        if let Some(max) = lookup("GEARQ_MAX_CONNECTIONS").and_then(|v| v.parse().ok()) {
            cfg.max_connections = max;
        }
        if let Some(size) = lookup("GEARQ_OUTBOUND_QUEUE").and_then(|v| v.parse().ok()) {
            cfg.outbound_queue_size = size;
        }
        if let Some(prefix) = lookup("GEARQ_HANDLE_PREFIX") {
            cfg.handle_prefix = prefix;
        }

        let tls = TlsConfig {
            ca_cert_path: lookup("GEARQ_TLS_CA").map(PathBuf::from),
            cert_path: lookup("GEARQ_TLS_CERT").map(PathBuf::from),
            key_path: lookup("GEARQ_TLS_KEY").map(PathBuf::from),
        };
        if tls.cert_path.is_some() || tls.key_path.is_some() {
            cfg.tls = Some(tls);
        }

        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn server_config_default() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.bind_addr, "127.0.0.1:4730");
        assert_eq!(cfg.max_payload_size, DEFAULT_MAX_PAYLOAD_SIZE);
        assert_eq!(cfg.max_connections, 1000);
        assert_eq!(cfg.outbound_queue_size, DEFAULT_OUTBOUND_QUEUE_SIZE);
        assert!(cfg.tls.is_none());
    }

    #[test]
    fn tls_config_is_complete_when_all_paths_set() {
        let cfg = TlsConfig::new("/key.pem", "/cert.pem", "/ca.pem");
        assert!(cfg.is_complete());

        let mut cfg = cfg;
        cfg.ca_cert_path = None;
        assert!(!cfg.is_complete());
    }

    #[test]
    fn server_config_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("GEARQ_BIND_ADDR", "0.0.0.0:4731"),
            ("GEARQ_MAX_PAYLOAD", "2048"),
            ("GEARQ_MAX_CONNECTIONS", "not-a-number"),
            ("GEARQ_OUTBOUND_QUEUE", "16"),
            ("GEARQ_TLS_CERT", "/srv/cert.pem"),
            ("GEARQ_TLS_KEY", "/srv/key.pem"),
        ]
        .into_iter()
        .collect();

        let cfg = ServerConfig::from_lookup(|k| vars.get(k).map(|v| (*v).to_string()));
        assert_eq!(cfg.bind_addr, "0.0.0.0:4731");
        assert_eq!(cfg.max_payload_size, 2048);
        assert_eq!(cfg.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(cfg.outbound_queue_size, 16);

        let tls = cfg.tls.unwrap();
        assert_eq!(tls.cert_path, Some(PathBuf::from("/srv/cert.pem")));
        assert!(tls.ca_cert_path.is_none());
    }
}
