//! Provisioning strategies and the process-manager side of the
//! provisioning protocol.
//!
//! A router either launches instances itself ([`InstanceLauncher`]) or asks a
//! process-manager peer to do it ([`RemoteProvisioner`]). The peer runs a
//! [`ProvisionServer`], which launches and probes the backend before
//! answering `201 {"host", "port"}`.

use crate::error::RouteError;
use crate::launcher::InstanceLauncher;
use crate::probe::{probe, ProbeConfig};
use crate::registry::{Application, Instance, LaunchSpec};
use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Upper bound on a provisioning round-trip; covers a peer's full probe budget
const REMOTE_PROVISION_TIMEOUT: Duration = Duration::from_secs(30);

/// Creates new instances for an application
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Start a new instance and return the endpoint it will listen on.
    ///
    /// The returned endpoint is not yet known to be ready.
    async fn provision(&self, app: &Application) -> Result<Instance, RouteError>;

    /// Best-effort teardown of an instance that never became ready
    async fn abandon(&self, instance: &Instance);
}

#[async_trait]
impl Provisioner for InstanceLauncher {
    async fn provision(&self, app: &Application) -> Result<Instance, RouteError> {
        let launched = self.launch(&app.id, &app.process)?;
        Ok(Instance::new(self.local_ip(), launched.port))
    }

    async fn abandon(&self, instance: &Instance) {
        if instance.host != self.local_ip() {
            return;
        }
        if !self.terminate(instance.port) {
            debug!(%instance, "Abandoned instance had already exited");
        }
    }
}

/// Endpoint reported by a process-manager peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedEndpoint {
    pub host: String,
    pub port: u16,
}

/// Delegates instance creation to a process-manager peer over HTTP
#[derive(Debug, Clone)]
pub struct RemoteProvisioner {
    client: reqwest::Client,
    peer: String,
}

impl RemoteProvisioner {
    pub fn new(peer: impl Into<String>) -> Result<Self, RouteError> {
        let client = reqwest::Client::builder()
            .timeout(REMOTE_PROVISION_TIMEOUT)
            .build()
            .map_err(|e| RouteError::SpawnFailed(format!("provisioning client: {}", e)))?;
        Ok(Self {
            client,
            peer: peer.into(),
        })
    }

    fn endpoint_url(&self) -> String {
        format!("{}/", self.peer.trim_end_matches('/'))
    }
}

#[async_trait]
impl Provisioner for RemoteProvisioner {
    async fn provision(&self, app: &Application) -> Result<Instance, RouteError> {
        let url = self.endpoint_url();
        debug!(app_id = %app.id, peer = %url, "Requesting remote instance");

        let response = self.client.post(&url).json(app).send().await.map_err(|e| {
            error!(app_id = %app.id, peer = %url, error = %e, "Provisioning request failed");
            RouteError::SpawnFailed(format!("{} via {}", app.process, url))
        })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            RouteError::InvalidResponse(format!("unreadable body from {}: {}", url, e))
        })?;

        if status != reqwest::StatusCode::CREATED {
            warn!(app_id = %app.id, peer = %url, %status, body = %body, "Peer refused to provision");
            return Err(RouteError::SpawnFailed(body));
        }

        let endpoint = parse_endpoint(&body)?;
        info!(app_id = %app.id, host = %endpoint.host, port = endpoint.port, "Remote instance provisioned");
        Ok(Instance::new(&endpoint.host, endpoint.port))
    }

    async fn abandon(&self, instance: &Instance) {
        // the peer probes before answering and kills its own unresponsive children
        warn!(%instance, peer = %self.peer, "Remote instance never became ready");
    }
}

fn parse_endpoint(body: &str) -> Result<ProvisionedEndpoint, RouteError> {
    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| RouteError::InvalidResponse(format!("{}: {}", e, body)))?;

    let host = value
        .get("host")
        .and_then(|h| h.as_str())
        .filter(|h| !h.is_empty());
    let port = value
        .get("port")
        .and_then(|p| p.as_u64())
        .and_then(|p| u16::try_from(p).ok())
        .filter(|p| *p != 0);

    match (host, port) {
        (Some(host), Some(port)) => Ok(ProvisionedEndpoint {
            host: host.to_string(),
            port,
        }),
        _ => Err(RouteError::InvalidResponse(format!(
            "missing host or port in {}",
            body
        ))),
    }
}

/// Body of a provisioning request; extra application fields are ignored
#[derive(Debug, Deserialize)]
struct ProvisionRequest {
    #[serde(default)]
    id: Option<String>,
    process: LaunchSpec,
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

struct ProvisionContext {
    launcher: InstanceLauncher,
    probe: ProbeConfig,
}

/// Serves the provisioning protocol on a process-manager node
pub struct ProvisionServer {
    bind_addr: SocketAddr,
    ctx: Arc<ProvisionContext>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProvisionServer {
    pub fn new(
        bind_addr: SocketAddr,
        launcher: InstanceLauncher,
        probe: ProbeConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            ctx: Arc::new(ProvisionContext { launcher, probe }),
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown is signalled
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Process manager listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let ctx = Arc::clone(&self.ctx);
                            tokio::spawn(async move {
                                if let Err(e) = serve_provision_connection(stream, ctx).await {
                                    debug!(addr = %addr, error = %e, "Provisioning connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept provisioning connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Process manager shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_provision_connection<S>(stream: S, ctx: Arc<ProvisionContext>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let ctx = Arc::clone(&ctx);
        async move { handle_provision_request(req, ctx).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Provisioning connection error: {}", e))?;

    Ok(())
}

async fn handle_provision_request(
    req: Request<hyper::body::Incoming>,
    ctx: Arc<ProvisionContext>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!(%method, %path, "Provisioning request");

    if method != Method::POST || path != "/" {
        return Ok(not_implemented(&method, &path));
    }

    let body = req.into_body().collect().await?.to_bytes();
    Ok(provision_from_body(&body, &ctx).await)
}

fn not_implemented(method: &Method, path: &str) -> Response<Full<Bytes>> {
    text_response(
        StatusCode::BAD_REQUEST,
        format!("HTTP endpoint not implemented: {} {}", method, path),
    )
}

async fn provision_from_body(body: &[u8], ctx: &ProvisionContext) -> Response<Full<Bytes>> {
    let request: ProvisionRequest = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "Invalid provisioning request body");
            return text_response(StatusCode::BAD_REQUEST, format!("Invalid application: {}", e));
        }
    };
    if request.process.executable.is_empty() {
        return text_response(StatusCode::BAD_REQUEST, "Invalid application: missing process.executable");
    }

    let app_id = request.id.unwrap_or_else(|| request.process.executable.clone());
    let launched = match ctx.launcher.launch(&app_id, &request.process) {
        Ok(l) => l,
        Err(e) => return text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    let host = ctx.launcher.local_ip().to_string();
    if let Err(e) = probe(&host, launched.port, &ctx.probe).await {
        warn!(app_id = %app_id, port = launched.port, "Backend never started listening, killing it");
        ctx.launcher.terminate(launched.port);
        return text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }

    let endpoint = ProvisionedEndpoint {
        host,
        port: launched.port,
    };
    info!(app_id = %app_id, host = %endpoint.host, port = endpoint.port, "Instance provisioned for peer");
    match serde_json::to_string(&endpoint) {
        Ok(json) => json_response(StatusCode::CREATED, json),
        Err(e) => text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
