//! Launcher configuration.
//!
//! The server binary turns its flags into a [`ServerConfig`]; the TLS pair,
//! when present, is loaded once and applied to both raw TCP endpoints
//! (backend and WebSocket).

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio_rustls::rustls;
use tokio_rustls::TlsAcceptor;

/// Default storage location, one directory per node.
pub const DEFAULT_STORAGE_DIR: &str = "/var/lib/webrocket";

/// Resolved launcher settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub websocket_addr: SocketAddr,
    pub backend_addr: SocketAddr,
    pub admin_addr: SocketAddr,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub node_name: Option<String>,
    pub storage_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            websocket_addr: "0.0.0.0:8080".parse().expect("static addr"),
            backend_addr: "0.0.0.0:8081".parse().expect("static addr"),
            admin_addr: "0.0.0.0:8082".parse().expect("static addr"),
            cert: None,
            key: None,
            node_name: None,
            storage_dir: PathBuf::from(DEFAULT_STORAGE_DIR),
        }
    }
}

/// Configuration failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read tls material: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid tls material: {0}")]
    Tls(String),

    #[error("--cert and --key must be given together")]
    IncompleteTlsPair,
}

impl ServerConfig {
    /// Load the TLS acceptor from the configured cert/key pair, if any.
    pub fn tls_acceptor(&self) -> Result<Option<TlsAcceptor>, ConfigError> {
        match (&self.cert, &self.key) {
            (Some(cert), Some(key)) => Ok(Some(load_tls(cert, key)?)),
            (None, None) => Ok(None),
            _ => Err(ConfigError::IncompleteTlsPair),
        }
    }
}

/// Build a TLS acceptor from PEM-encoded certificate chain and key files.
pub fn load_tls(cert: &Path, key: &Path) -> Result<TlsAcceptor, ConfigError> {
    let mut cert_reader = std::io::BufReader::new(std::fs::File::open(cert)?);
    let certs = rustls_pemfile::certs(&mut cert_reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(ConfigError::Tls(format!(
            "no certificates in {}",
            cert.display()
        )));
    }

    let mut key_reader = std::io::BufReader::new(std::fs::File::open(key)?);
    let key = rustls_pemfile::private_key(&mut key_reader)?
        .ok_or_else(|| ConfigError::Tls(format!("no private key in {}", key.display())))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| ConfigError::Tls(err.to_string()))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.backend_addr.port(), 8081);
        assert_eq!(config.websocket_addr.port(), 8080);
        assert_eq!(config.admin_addr.port(), 8082);
        assert_eq!(config.storage_dir, PathBuf::from("/var/lib/webrocket"));
    }

    #[test]
    fn test_incomplete_tls_pair() {
        let config = ServerConfig {
            cert: Some(PathBuf::from("cert.pem")),
            ..ServerConfig::default()
        };
        assert!(matches!(
            config.tls_acceptor(),
            Err(ConfigError::IncompleteTlsPair)
        ));
    }

    #[test]
    fn test_no_tls_by_default() {
        assert!(ServerConfig::default().tls_acceptor().unwrap().is_none());
    }
}
