use crate::ports::{PortRange, PortRangeError};
use crate::probe::ProbeConfig;
use crate::registry::Application;
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::path::Path;
use std::time::Duration;

/// Configuration shared by the router and the process manager
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    /// Managed port range for spawned backends
    #[serde(default)]
    pub ports: PortsConfig,

    /// Readiness probe budget
    #[serde(default)]
    pub probe: ProbeSettings,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub provisioning: ProvisioningConfig,

    #[serde(default)]
    pub process_manager: ProcessManagerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Plain-text listen port (default: 31415)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// TLS listen port (default: 31416, set to 0 to disable)
    #[serde(default = "default_tls_port")]
    pub tls_port: u16,

    /// Address this node registers its own instances under.
    /// Detected from the routing table when unset.
    pub local_ip: Option<String>,

    /// Enable TLS with a generated self-signed certificate when no files are given
    #[serde(default)]
    pub tls: bool,

    /// Path to the wildcard certificate file (PEM format)
    pub tls_cert: Option<String>,

    /// Path to the wildcard private key file (PEM format)
    pub tls_key: Option<String>,

    /// Per-hostname certificates selected by SNI
    #[serde(default)]
    pub certificates: Vec<CertificateOverride>,

    /// Maximum idle connections per backend host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            tls_port: default_tls_port(),
            local_ip: None,
            tls: false,
            tls_cert: None,
            tls_key: None,
            certificates: Vec::new(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

impl ServerConfig {
    /// TLS is served when a port is set and there is something to serve with
    pub fn tls_enabled(&self) -> bool {
        self.tls_port != 0 && (self.tls || self.has_tls_files())
    }

    pub fn has_tls_files(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }

    /// Socket address for `port` on the configured bind address
    pub fn socket_addr(&self, port: u16) -> anyhow::Result<SocketAddr> {
        let ip: IpAddr = self
            .bind
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid bind address '{}': {}", self.bind, e))?;
        Ok(SocketAddr::new(ip, port))
    }
}

/// Certificate for one hostname, chosen over the wildcard by SNI
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct CertificateOverride {
    pub host: String,
    pub cert: Option<String>,
    pub key: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PortsConfig {
    /// Inclusive range in the form "start-end" (default: 8000-9000)
    #[serde(default = "default_port_range")]
    pub range: String,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            range: default_port_range(),
        }
    }
}

impl PortsConfig {
    pub fn port_range(&self) -> Result<PortRange, PortRangeError> {
        self.range.parse()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProbeSettings {
    /// Retries after the first failed connect (default: 3).
    ///
    /// This is not the attempt count: `retries = 3` means one initial connect
    /// plus three retries, four connects in total, sleeping
    /// `initial_delay_ms`, then 1.5x, then 2.25x of it in between.
    #[serde(default = "default_probe_retries")]
    pub retries: u32,

    /// Delay before the first retry in milliseconds (default: 1000)
    #[serde(default = "default_probe_delay")]
    pub initial_delay_ms: u64,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            retries: default_probe_retries(),
            initial_delay_ms: default_probe_delay(),
        }
    }
}

impl ProbeSettings {
    pub fn probe_config(&self) -> ProbeConfig {
        ProbeConfig {
            retries: self.retries,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RegistryConfig {
    /// Store connection string: `sqlite://<path>` or `memory://`
    #[serde(default = "default_registry_url")]
    pub url: String,

    /// Applications upserted into the registry at startup
    #[serde(default)]
    pub applications: Vec<Application>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            url: default_registry_url(),
            applications: Vec::new(),
        }
    }
}

/// Where new instances are created
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProvisioningMode {
    /// Spawn on this node
    #[default]
    Local,
    /// Delegate to a process-manager peer
    Remote,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProvisioningConfig {
    #[serde(default)]
    pub mode: ProvisioningMode,

    /// Base URL of the process-manager peer, required in remote mode
    pub peer: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProcessManagerConfig {
    /// Listen port of the process-manager binary (default: 31415)
    #[serde(default = "default_listen_port")]
    pub port: u16,
}

impl Default for ProcessManagerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    31415
}

fn default_tls_port() -> u16 {
    31416
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_port_range() -> String {
    "8000-9000".to_string()
}

fn default_probe_retries() -> u32 {
    3
}

fn default_probe_delay() -> u64 {
    1000
}

fn default_registry_url() -> String {
    "sqlite://hostgate.db".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.port != 0 && self.server.port == self.server.tls_port {
            errors.push(format!(
                "server.port and server.tls_port must differ (both are {})",
                self.server.port
            ));
        }

        if let Err(e) = self.ports.port_range() {
            errors.push(format!("ports.range: {}", e));
        }

        if self.server.tls_cert.is_some() != self.server.tls_key.is_some() {
            errors.push("server.tls_cert and server.tls_key must be set together".to_string());
        }

        for cert in &self.server.certificates {
            if cert.cert.is_none() || cert.key.is_none() {
                errors.push(format!(
                    "Certificate for '{}': both 'cert' and 'key' are required",
                    cert.host
                ));
            }
        }

        if self.provisioning.mode == ProvisioningMode::Remote && self.provisioning.peer.is_none() {
            errors.push("provisioning.peer is required when provisioning.mode = \"remote\"".to_string());
        }

        for app in &self.registry.applications {
            if let Err(e) = app.validate() {
                errors.push(e);
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// The configured node address, or the detected one
    pub fn local_ip(&self) -> anyhow::Result<String> {
        match &self.server.local_ip {
            Some(ip) => Ok(ip.clone()),
            None => detect_local_ip(),
        }
    }
}

/// Find the IPv4 address this host uses for outbound traffic.
///
/// Connecting a UDP socket sends nothing; it only asks the kernel to pick a
/// route and source address.
pub fn detect_local_ip() -> anyhow::Result<String> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket
        .connect("192.0.2.1:80")
        .map_err(|e| anyhow::anyhow!("Unable to determine local IP address: {}", e))?;
    let ip = socket.local_addr()?.ip();
    if ip.is_loopback() || ip.is_unspecified() {
        anyhow::bail!("Unable to determine local IP address: only {} is routable", ip);
    }
    Ok(ip.to_string())
}
