//! TLS termination: PEM loading and name-based certificate selection

use crate::config::ServerConfig;
use crate::registry::Application;
use rcgen::generate_simple_self_signed;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

pub fn load_certs(path: &str) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open certificate file {}: {}", path, e))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to parse certificates from {}: {}", path, e))?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path);
    }

    Ok(certs)
}

pub fn load_key(path: &str) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open key file {}: {}", path, e))?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| anyhow::anyhow!("Failed to parse key from {}: {}", path, e))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => break,
            _ => continue,
        }
    }

    anyhow::bail!("No private key found in {}", path)
}

fn certified_key(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> anyhow::Result<Arc<CertifiedKey>> {
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| anyhow::anyhow!("Failed to create signing key: {}", e))?;
    Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}

/// Load a certificate chain and its key into a signing-ready form
pub fn load_certified_key(cert_path: &str, key_path: &str) -> anyhow::Result<Arc<CertifiedKey>> {
    certified_key(load_certs(cert_path)?, load_key(key_path)?)
}

/// Development certificate for `localhost` and `127.0.0.1`
pub fn generate_self_signed_cert() -> anyhow::Result<Arc<CertifiedKey>> {
    let subject_alt_names = vec!["localhost".to_string(), "127.0.0.1".to_string()];

    let rcgen::CertifiedKey { cert, key_pair } = generate_simple_self_signed(subject_alt_names)
        .map_err(|e| anyhow::anyhow!("Failed to generate self-signed certificate: {}", e))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| anyhow::anyhow!("Failed to serialize private key: {}", e))?;

    certified_key(vec![cert_der], key_der)
}

/// Picks a certificate by SNI hostname, falling back to the wildcard
pub struct SniResolver {
    default: Arc<CertifiedKey>,
    by_host: HashMap<String, Arc<CertifiedKey>>,
}

impl std::fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniResolver")
            .field("hosts", &self.by_host.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SniResolver {
    pub fn new(default: Arc<CertifiedKey>) -> Self {
        Self {
            default,
            by_host: HashMap::new(),
        }
    }

    pub fn insert(&mut self, host: &str, key: Arc<CertifiedKey>) {
        self.by_host.insert(host.to_lowercase(), key);
    }

    /// Load and register per-host material; unreadable files are logged and skipped
    pub fn add_host_files(&mut self, host: &str, cert_path: &str, key_path: &str) -> bool {
        match load_certified_key(cert_path, key_path) {
            Ok(key) => {
                debug!(host, cert = cert_path, "Loaded host certificate");
                self.insert(host, key);
                true
            }
            Err(e) => {
                warn!(host, error = %e, "Skipping unreadable host certificate");
                false
            }
        }
    }

    pub fn host_count(&self) -> usize {
        self.by_host.len()
    }

    pub fn has_host(&self, host: &str) -> bool {
        self.by_host.contains_key(&host.to_lowercase())
    }

    /// The certificate served for an SNI name (or for no SNI at all)
    pub fn certified_key_for(&self, server_name: Option<&str>) -> Arc<CertifiedKey> {
        server_name
            .and_then(|name| self.by_host.get(&name.to_lowercase()))
            .unwrap_or(&self.default)
            .clone()
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.certified_key_for(client_hello.server_name()))
    }
}

/// Build the resolver from the server settings and the registry's TLS applications.
///
/// The wildcard material must load; per-host material is best-effort.
pub fn build_resolver(server: &ServerConfig, apps: &[Application]) -> anyhow::Result<SniResolver> {
    let default = match (&server.tls_cert, &server.tls_key) {
        (Some(cert), Some(key)) => {
            let loaded = load_certified_key(cert, key)?;
            info!(cert = %cert, key = %key, "TLS enabled with provided certificates");
            loaded
        }
        _ => {
            warn!("TLS enabled with auto-generated self-signed certificate (not for production)");
            generate_self_signed_cert()?
        }
    };

    let mut resolver = SniResolver::new(default);

    for entry in &server.certificates {
        if let (Some(cert), Some(key)) = (&entry.cert, &entry.key) {
            resolver.add_host_files(&entry.host, cert, key);
        }
    }

    for app in apps {
        for binding in &app.hosts {
            if let Some((cert, key)) = binding.tls_material() {
                if resolver.has_host(&binding.host) {
                    continue;
                }
                resolver.add_host_files(&binding.host, cert, key);
            }
        }
    }

    info!(hosts = resolver.host_count(), "SNI certificates loaded");
    Ok(resolver)
}

/// Acceptor using the ring provider, independent of any process-wide default
pub fn acceptor(resolver: SniResolver) -> anyhow::Result<TlsAcceptor> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| anyhow::anyhow!("Failed to configure TLS protocol versions: {}", e))?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(resolver));
    Ok(TlsAcceptor::from(Arc::new(config)))
}
