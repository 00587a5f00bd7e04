//! Routing engine: decides which instance serves a request for a hostname
//!
//! Per request the engine resolves the application, enforces the hostname's
//! TLS policy, then either reuses an existing instance or provisions, probes
//! and registers a new one.

use crate::error::RouteError;
use crate::probe::{probe, ProbeConfig};
use crate::provision::Provisioner;
use crate::registry::{Application, Instance, InstanceMatch, SharedRegistry};
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Where a request was routed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTarget {
    pub app_id: String,
    pub instance: Instance,
    /// True when the instance was created for this request
    pub provisioned: bool,
}

/// Outcome of instance selection for an application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// An instance running on this node
    Local(Instance),
    /// Capacity is saturated; one existing instance picked at random
    Random(Instance),
    /// No suitable instance; a new one must be created
    Provision,
}

/// Reject connections whose encryption state the hostname's policy forbids
pub fn check_policy(app: &Application, hostname: &str, secure: bool) -> Result<(), RouteError> {
    match app.host_binding(hostname) {
        Some(binding) if binding.ssl.permits(secure) => Ok(()),
        _ => Err(RouteError::PolicyMismatch(hostname.to_string())),
    }
}

/// Pick an instance for `app`.
///
/// An instance on `local_ip` always wins. Otherwise, once the live count has
/// reached the application's maximum, one existing instance is chosen
/// uniformly at random. An application whose maximum allows no instances at
/// all has no capacity.
pub fn select_instance<R: Rng + ?Sized>(
    app: &Application,
    local_ip: &str,
    rng: &mut R,
) -> Result<Selection, RouteError> {
    if let Some(local) = app.machines.iter().find(|m| m.host == local_ip) {
        return Ok(Selection::Local(local.clone()));
    }

    if app.machines.len() >= app.max_instances {
        if app.machines.is_empty() {
            return Err(RouteError::NoCapacity(app.id.clone()));
        }
        let index = rng.gen_range(0..app.machines.len());
        return Ok(Selection::Random(app.machines[index].clone()));
    }

    Ok(Selection::Provision)
}

/// Placement engine shared by every connection on a router node
pub struct Router {
    registry: SharedRegistry,
    provisioner: Arc<dyn Provisioner>,
    local_ip: String,
    probe: ProbeConfig,
}

impl Router {
    pub fn new(
        registry: SharedRegistry,
        provisioner: Arc<dyn Provisioner>,
        local_ip: impl Into<String>,
        probe: ProbeConfig,
    ) -> Self {
        Self {
            registry,
            provisioner,
            local_ip: local_ip.into(),
            probe,
        }
    }

    pub fn local_ip(&self) -> &str {
        &self.local_ip
    }

    /// Choose the backend for a request to `hostname`, provisioning one if needed
    pub async fn route(&self, hostname: &str, secure: bool) -> Result<RouteTarget, RouteError> {
        let app = match self.registry.find_by_hostname(hostname).await {
            Ok(Some(app)) => app,
            Ok(None) => {
                debug!(hostname, "No application registered for hostname");
                return Err(RouteError::NotFound(hostname.to_string()));
            }
            Err(e) => {
                error!(hostname, error = %e, "Registry lookup failed");
                return Err(RouteError::NotFound(hostname.to_string()));
            }
        };

        if let Err(e) = check_policy(&app, hostname, secure) {
            debug!(hostname, secure, app_id = %app.id, "Request rejected by TLS policy");
            return Err(e);
        }

        let selection = select_instance(&app, &self.local_ip, &mut rand::thread_rng())?;
        let instance = match selection {
            Selection::Local(instance) | Selection::Random(instance) => {
                debug!(hostname, app_id = %app.id, %instance, "Routing to existing instance");
                return Ok(RouteTarget {
                    app_id: app.id,
                    instance,
                    provisioned: false,
                });
            }
            Selection::Provision => self.provision(&app).await?,
        };

        if let Err(e) = self.registry.append_instance(&app.id, &instance).await {
            error!(app_id = %app.id, %instance, error = %e, "Failed to register new instance");
        }

        Ok(RouteTarget {
            app_id: app.id,
            instance,
            provisioned: true,
        })
    }

    async fn provision(&self, app: &Application) -> Result<Instance, RouteError> {
        info!(app_id = %app.id, live = app.machines.len(), max = app.max_instances, "Provisioning new instance");
        let instance = self.provisioner.provision(app).await?;

        if let Err(e) = probe(&instance.host, instance.port, &self.probe).await {
            warn!(app_id = %app.id, %instance, "New instance never became ready");
            self.provisioner.abandon(&instance).await;
            return Err(e);
        }

        info!(app_id = %app.id, %instance, "New instance ready");
        Ok(instance)
    }

    /// Drop an instance that failed at the transport layer from the registry.
    ///
    /// Best-effort: failures are logged and otherwise ignored.
    pub async fn evict(&self, app_id: &str, instance: &Instance) {
        warn!(app_id, %instance, "Evicting unreachable instance");
        let target = InstanceMatch::Endpoint(instance.clone());
        if let Err(e) = self.registry.remove_instance(app_id, &target).await {
            error!(app_id, %instance, error = %e, "Failed to evict instance");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{HostBinding, LaunchSpec, MemoryRegistry, Registry, TlsPolicy};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio::net::TcpListener;

    const LOCAL: &str = "10.0.0.1";

    fn app(hosts: Vec<HostBinding>, max: usize, machines: Vec<Instance>) -> Application {
        let mut app = Application::new("app1", hosts, max, LaunchSpec::new("backend"));
        app.machines = machines;
        app
    }

    fn plain(host: &str) -> Vec<HostBinding> {
        vec![HostBinding::new(host, TlsPolicy::None)]
    }

    /// Provisioner handing out a fixed endpoint and recording what it was asked
    struct FakeProvisioner {
        endpoint: Instance,
        provisioned: Mutex<Vec<String>>,
        abandoned: Mutex<Vec<Instance>>,
    }

    impl FakeProvisioner {
        fn new(endpoint: Instance) -> Arc<Self> {
            Arc::new(Self {
                endpoint,
                provisioned: Mutex::new(Vec::new()),
                abandoned: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Provisioner for FakeProvisioner {
        async fn provision(&self, app: &Application) -> Result<Instance, RouteError> {
            self.provisioned.lock().push(app.id.clone());
            Ok(self.endpoint.clone())
        }

        async fn abandon(&self, instance: &Instance) {
            self.abandoned.lock().push(instance.clone());
        }
    }

    fn fast_probe() -> ProbeConfig {
        ProbeConfig {
            retries: 1,
            initial_delay: Duration::from_millis(20),
        }
    }

    #[test]
    fn test_policy_enforcement() {
        let app = app(
            vec![
                HostBinding::new("plain.test", TlsPolicy::None),
                HostBinding::new("both.test", TlsPolicy::Allow),
                HostBinding::new("secure.test", TlsPolicy::Require),
            ],
            1,
            vec![],
        );

        assert!(check_policy(&app, "plain.test", false).is_ok());
        assert!(matches!(check_policy(&app, "plain.test", true), Err(RouteError::PolicyMismatch(_))));
        assert!(check_policy(&app, "both.test", false).is_ok());
        assert!(check_policy(&app, "both.test", true).is_ok());
        assert!(matches!(check_policy(&app, "secure.test", false), Err(RouteError::PolicyMismatch(_))));
        assert!(check_policy(&app, "secure.test", true).is_ok());
        assert!(matches!(check_policy(&app, "other.test", false), Err(RouteError::PolicyMismatch(_))));
    }

    #[test]
    fn test_local_affinity_dominates() {
        let mut rng = StdRng::seed_from_u64(7);
        let local = Instance::new(LOCAL, 8003);
        let app = app(
            plain("x.test"),
            5,
            vec![Instance::new("10.0.0.2", 8000), local.clone(), Instance::new("10.0.0.3", 8001)],
        );

        for _ in 0..50 {
            assert_eq!(select_instance(&app, LOCAL, &mut rng).unwrap(), Selection::Local(local.clone()));
        }
    }

    #[test]
    fn test_capacity_cap_picks_existing() {
        let mut rng = StdRng::seed_from_u64(42);
        let fleet = vec![Instance::new("10.0.0.2", 8000), Instance::new("10.0.0.3", 8000)];
        let app = app(plain("x.test"), 2, fleet.clone());

        let mut seen = HashSet::new();
        for _ in 0..200 {
            match select_instance(&app, LOCAL, &mut rng).unwrap() {
                Selection::Random(instance) => {
                    assert!(fleet.contains(&instance));
                    seen.insert(instance);
                }
                other => panic!("expected a random pick, got {:?}", other),
            }
        }
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_below_capacity_provisions() {
        let mut rng = StdRng::seed_from_u64(1);
        let app = app(plain("x.test"), 2, vec![Instance::new("10.0.0.2", 8000)]);
        assert_eq!(select_instance(&app, LOCAL, &mut rng).unwrap(), Selection::Provision);
    }

    #[test]
    fn test_zero_capacity_without_instances() {
        let mut rng = StdRng::seed_from_u64(1);
        let app = app(plain("x.test"), 0, vec![]);
        assert!(matches!(select_instance(&app, LOCAL, &mut rng), Err(RouteError::NoCapacity(_))));
    }

    #[tokio::test]
    async fn test_unknown_host_is_not_found() {
        let registry = Arc::new(MemoryRegistry::new());
        let router = Router::new(registry, FakeProvisioner::new(Instance::new(LOCAL, 1)), LOCAL, fast_probe());

        let result = router.route("nobody.test", false).await;
        assert!(matches!(result, Err(RouteError::NotFound(h)) if h == "nobody.test"));
    }

    #[tokio::test]
    async fn test_route_provisions_probes_and_registers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Instance::new("127.0.0.1", listener.local_addr().unwrap().port());

        let registry = Arc::new(MemoryRegistry::new());
        registry.put_application(app(plain("x.test"), 1, vec![]));
        let provisioner = FakeProvisioner::new(endpoint.clone());
        let router = Router::new(registry.clone(), provisioner.clone(), "127.0.0.1", fast_probe());

        let first = router.route("X.test", false).await.unwrap();
        assert_eq!(
            first,
            RouteTarget {
                app_id: "app1".into(),
                instance: endpoint.clone(),
                provisioned: true
            }
        );
        assert_eq!(registry.instances("app1"), vec![endpoint.clone()]);

        // serialized second request reuses the registered instance
        let second = router.route("x.test", false).await.unwrap();
        assert_eq!(second.instance, endpoint);
        assert!(!second.provisioned);
        assert_eq!(provisioner.provisioned.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_probe_failure_abandons_instance() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let endpoint = Instance::new("127.0.0.1", port);

        let registry = Arc::new(MemoryRegistry::new());
        registry.put_application(app(plain("x.test"), 1, vec![]));
        let provisioner = FakeProvisioner::new(endpoint.clone());
        let router = Router::new(registry.clone(), provisioner.clone(), "127.0.0.1", fast_probe());

        let result = router.route("x.test", false).await;
        assert!(matches!(result, Err(RouteError::Timeout)));
        assert_eq!(*provisioner.abandoned.lock(), vec![endpoint]);
        assert!(registry.instances("app1").is_empty());
    }

    #[tokio::test]
    async fn test_policy_mismatch_never_provisions() {
        let registry = Arc::new(MemoryRegistry::new());
        registry.put_application(app(vec![HostBinding::new("x.test", TlsPolicy::Require)], 1, vec![]));
        let provisioner = FakeProvisioner::new(Instance::new(LOCAL, 1));
        let router = Router::new(registry, provisioner.clone(), LOCAL, fast_probe());

        let result = router.route("x.test", false).await;
        assert!(matches!(result, Err(RouteError::PolicyMismatch(_))));
        assert!(provisioner.provisioned.lock().is_empty());
    }

    #[tokio::test]
    async fn test_evicted_instance_is_never_selected_again() {
        let a = Instance::new("10.0.0.2", 8000);
        let b = Instance::new("10.0.0.3", 8000);
        let registry = Arc::new(MemoryRegistry::new());
        registry.put_application(app(plain("x.test"), 1, vec![a.clone(), b.clone()]));

        let provisioner = FakeProvisioner::new(Instance::new(LOCAL, 1));
        let router = Router::new(registry.clone(), provisioner.clone(), LOCAL, fast_probe());

        router.evict("app1", &a).await;
        assert_eq!(registry.instances("app1"), vec![b.clone()]);

        for _ in 0..20 {
            let target = router.route("x.test", false).await.unwrap();
            assert_eq!(target.instance, b);
        }
        assert!(provisioner.provisioned.lock().is_empty());

        // evicting twice is harmless
        router.evict("app1", &a).await;
        assert!(registry.find_by_hostname("x.test").await.unwrap().is_some());
    }
}
