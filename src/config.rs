/// Server configuration: a YAML file merged with command-line flags, plus
/// the TLS acceptor loader.
///
/// Flag names match the YAML keys; flags override file values. When all
/// three of `sslKey`/`sslCert`/`sslCA` are set the listener is TLS with
/// mandatory client certificate verification; when none are set it is plain
/// TCP; anything in between is a fatal configuration error.
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tokio_rustls::rustls::pki_types::PrivateKeyDer;
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::version::{TLS12, TLS13};
use tokio_rustls::rustls::{RootCertStore, ServerConfig as RustlsServerConfig};
use tokio_rustls::TlsAcceptor;

use crate::irc::bridge::BridgeConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("incomplete TLS material: sslKey, sslCert and sslCA must all be set")]
    IncompleteTls,
    #[error("invalid TLS material: {0}")]
    Tls(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Hostname echoed in every server-originated reply. Falls back to the
    /// OS hostname when empty.
    pub hostname: String,
    /// Address to bind to; a bare `:port` binds all interfaces.
    pub bind: String,
    /// Path to the MOTD file, or empty for none.
    pub motd: String,
    #[serde(rename = "sslKey")]
    pub ssl_key: String,
    #[serde(rename = "sslCert")]
    pub ssl_cert: String,
    #[serde(rename = "sslCA")]
    pub ssl_ca: String,
    /// Human-readable console logging.
    #[serde(rename = "prettyConsole")]
    pub pretty_console: bool,
    /// Rooms bridged to the event bus.
    pub channels: Vec<BridgeConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            bind: ":6667".into(),
            motd: String::new(),
            ssl_key: String::new(),
            ssl_cert: String::new(),
            ssl_ca: String::new(),
            pretty_console: false,
            channels: Vec::new(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    /// The hostname to echo, resolving an empty setting to the OS hostname.
    pub fn resolved_hostname(&self) -> String {
        if !self.hostname.is_empty() {
            return self.hostname.clone();
        }
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".into())
    }

    /// The bind address in `host:port` form.
    pub fn bind_addr(&self) -> String {
        if self.bind.is_empty() {
            "0.0.0.0:6667".into()
        } else if self.bind.starts_with(':') {
            format!("0.0.0.0{}", self.bind)
        } else {
            self.bind.clone()
        }
    }

    /// Build the TLS acceptor when TLS material is configured.
    pub fn tls_acceptor(&self) -> Result<Option<TlsAcceptor>, ConfigError> {
        let set = [&self.ssl_key, &self.ssl_cert, &self.ssl_ca]
            .iter()
            .filter(|p| !p.is_empty())
            .count();
        match set {
            0 => return Ok(None),
            3 => {}
            _ => return Err(ConfigError::IncompleteTls),
        }

        let cert_data = std::fs::read(&self.ssl_cert)?;
        let cert_chain = rustls_pemfile::certs(&mut Cursor::new(&cert_data))
            .collect::<Result<Vec<_>, _>>()?;
        if cert_chain.is_empty() {
            return Err(ConfigError::Tls(format!(
                "no certificate found in {}",
                self.ssl_cert
            )));
        }

        let key_data = std::fs::read(&self.ssl_key)?;
        let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut Cursor::new(&key_data))?
            .ok_or_else(|| {
                ConfigError::Tls(format!("no private key found in {}", self.ssl_key))
            })?;

        let ca_data = std::fs::read(&self.ssl_ca)?;
        let mut roots = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut Cursor::new(&ca_data)) {
            roots
                .add(cert?)
                .map_err(|e| ConfigError::Tls(e.to_string()))?;
        }

        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| ConfigError::Tls(e.to_string()))?;

        let tls = RustlsServerConfig::builder_with_protocol_versions(&[&TLS13, &TLS12])
            .with_client_cert_verifier(verifier)
            .with_single_cert(cert_chain, key)
            .map_err(|e| ConfigError::Tls(e.to_string()))?;

        Ok(Some(TlsAcceptor::from(Arc::new(tls))))
    }
}
