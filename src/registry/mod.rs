//! Application registry: the shared record of applications and their live
//! instances.
//!
//! The router and the launcher only ever read applications and append or
//! remove instances; each of those operations is atomic in the store. Two
//! backends are provided: [`MemoryRegistry`] and [`SqliteRegistry`].

pub mod memory;
pub mod sqlite;

pub use self::memory::MemoryRegistry;
pub use self::sqlite::SqliteRegistry;

use crate::error::RegistryError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// TLS policy bound to one hostname of an application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsPolicy {
    /// Plain-text only
    None,
    /// Plain-text and TLS
    Allow,
    /// TLS only
    Require,
}

impl TlsPolicy {
    /// Whether a connection with the given encryption state is acceptable
    pub fn permits(&self, secure: bool) -> bool {
        match self {
            TlsPolicy::None => !secure,
            TlsPolicy::Allow => true,
            TlsPolicy::Require => secure,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TlsPolicy::None => "none",
            TlsPolicy::Allow => "allow",
            TlsPolicy::Require => "require",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(TlsPolicy::None),
            "allow" => Some(TlsPolicy::Allow),
            "require" => Some(TlsPolicy::Require),
            _ => None,
        }
    }
}

/// A hostname bound to an application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostBinding {
    pub host: String,
    pub ssl: TlsPolicy,
    /// Certificate PEM path for name-based TLS termination
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert: Option<String>,
    /// Private key PEM path for name-based TLS termination
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl HostBinding {
    pub fn new(host: &str, ssl: TlsPolicy) -> Self {
        Self {
            host: host.to_lowercase(),
            ssl,
            cert: None,
            key: None,
        }
    }

    /// Per-host certificate material, when the host accepts TLS and both files are set
    pub fn tls_material(&self) -> Option<(&str, &str)> {
        if self.ssl == TlsPolicy::None {
            return None;
        }
        Some((self.cert.as_deref()?, self.key.as_deref()?))
    }
}

/// How to start a backend process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub executable: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl LaunchSpec {
    pub fn new(executable: &str) -> Self {
        Self {
            executable: executable.to_string(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

impl fmt::Display for LaunchSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.executable)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// One live backend process, identified by where it listens
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instance {
    pub host: String,
    pub port: u16,
}

impl Instance {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
        }
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Which instances a removal applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceMatch {
    /// Exactly this endpoint
    Endpoint(Instance),
    /// Every instance on this host, whatever its port
    Host(String),
}

impl InstanceMatch {
    pub fn matches(&self, instance: &Instance) -> bool {
        match self {
            InstanceMatch::Endpoint(target) => target == instance,
            InstanceMatch::Host(host) => &instance.host == host,
        }
    }
}

impl From<Instance> for InstanceMatch {
    fn from(instance: Instance) -> Self {
        InstanceMatch::Endpoint(instance)
    }
}

/// A registered web tenant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub id: String,
    pub hosts: Vec<HostBinding>,
    /// Target maximum number of live instances
    #[serde(rename = "instances")]
    pub max_instances: usize,
    pub process: LaunchSpec,
    /// Instances currently believed live
    #[serde(default)]
    pub machines: Vec<Instance>,
}

impl Application {
    pub fn new(id: &str, hosts: Vec<HostBinding>, max_instances: usize, process: LaunchSpec) -> Self {
        Self {
            id: id.to_string(),
            hosts,
            max_instances,
            process,
            machines: Vec::new(),
        }
    }

    /// The binding for `hostname`, compared case-insensitively
    pub fn host_binding(&self, hostname: &str) -> Option<&HostBinding> {
        self.hosts
            .iter()
            .find(|h| h.host.eq_ignore_ascii_case(hostname))
    }

    pub fn accepts_tls(&self) -> bool {
        self.hosts.iter().any(|h| h.ssl != TlsPolicy::None)
    }

    /// Check the record is usable for routing and launching
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("application id must not be empty".to_string());
        }
        if self.hosts.is_empty() {
            return Err(format!("Application '{}': at least one host is required", self.id));
        }
        if self.process.executable.is_empty() {
            return Err(format!("Application '{}': 'process.executable' is required", self.id));
        }
        Ok(())
    }
}

/// Client of the external application registry
#[async_trait]
pub trait Registry: Send + Sync {
    /// Find the application bound to `hostname`
    async fn find_by_hostname(&self, hostname: &str) -> Result<Option<Application>, RegistryError>;

    /// Record a new live instance; appending an already present instance is a no-op
    async fn append_instance(&self, app_id: &str, instance: &Instance) -> Result<(), RegistryError>;

    /// Remove matching instances; removing nothing is not an error
    async fn remove_instance(&self, app_id: &str, target: &InstanceMatch) -> Result<(), RegistryError>;

    /// Applications with at least one TLS-capable hostname
    async fn tls_applications(&self) -> Result<Vec<Application>, RegistryError>;

    /// Upsert configured applications, keeping instances already recorded
    async fn seed(&self, apps: &[Application]) -> Result<(), RegistryError>;
}

/// Shared registry handle passed to the router and launcher
pub type SharedRegistry = Arc<dyn Registry>;

/// Open the registry named by a connection string.
///
/// Supported forms are `sqlite://<path>` and `memory://`.
pub fn connect(url: &str) -> Result<SharedRegistry, RegistryError> {
    if let Some(path) = url.strip_prefix("sqlite://") {
        if path.is_empty() || path == ":memory:" {
            return Ok(Arc::new(SqliteRegistry::open_in_memory()?));
        }
        return Ok(Arc::new(SqliteRegistry::open(path)?));
    }
    if url == "memory://" || url == "memory" {
        return Ok(Arc::new(MemoryRegistry::new()));
    }
    Err(RegistryError::UnsupportedUrl(url.to_string()))
}
