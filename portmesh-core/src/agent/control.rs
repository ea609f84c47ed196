//! Control endpoint: port events in, tunnel lifecycle calls out
//!
//! `POST /connect` and `POST /disconnect` take `{"lport": "8080", "rport": "0"}`
//! and answer `{"errno": 0}` or `{"errno": -1, "error": "..."}`.

use super::manager::TunnelManager;
use super::spec::TunnelSpec;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use portmesh_common::{Result, TunnelError};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Arguments of both control calls, as port strings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortArgs {
    pub lport: String,
    /// Omitted: each spec's own remote port. `"0"`: let the server pick.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rport: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlReply {
    pub errno: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ControlReply {
    pub fn ok() -> Self {
        Self {
            errno: 0,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            errno: -1,
            error: Some(error.into()),
        }
    }
}

/// Applies port events to every configured spec
#[derive(Debug, Clone)]
pub struct ControlService {
    manager: TunnelManager,
    specs: Arc<Vec<TunnelSpec>>,
}

impl ControlService {
    /// Create a service applying port events to `specs` through `manager`
    pub fn new(manager: TunnelManager, specs: Vec<TunnelSpec>) -> Self {
        Self {
            manager,
            specs: Arc::new(specs),
        }
    }

    pub fn manager(&self) -> &TunnelManager {
        &self.manager
    }

    /// Connect every spec matching `local_port`, all or nothing
    ///
    /// When one spec fails, the specs connected earlier in this call are
    /// disconnected again and the error is returned.
    pub async fn connect(&self, local_port: u16, remote_port: Option<u16>) -> Result<()> {
        let mut connected: Vec<&TunnelSpec> = Vec::new();
        for spec in self.specs.iter().filter(|s| s.matches_local_port(local_port)) {
            let rport = remote_port.unwrap_or_else(|| spec.remote_port().fixed().unwrap_or(0));
            match self.manager.connect(spec, local_port, rport).await {
                Ok(bound) => {
                    debug!(%spec, local_port, remote_port = bound, "connected");
                    connected.push(spec);
                }
                Err(e) => {
                    error!(%spec, local_port, "connect failed: {}", e);
                    for done in connected {
                        self.manager.disconnect_spec(done, local_port).await;
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Tear down whatever tracks `local_port`; never fails
    pub async fn disconnect(&self, local_port: u16) {
        self.manager.disconnect(local_port).await;
    }
}

fn reply(status: StatusCode, body: ControlReply) -> Response {
    (status, Json(body)).into_response()
}

fn parse_ports(args: &PortArgs) -> std::result::Result<(u16, Option<u16>), String> {
    let lport = match args.lport.trim().parse::<u16>() {
        Ok(0) | Err(_) => return Err(format!("invalid lport {:?}", args.lport)),
        Ok(port) => port,
    };
    let rport = match args.rport.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(
            raw.parse::<u16>()
                .map_err(|_| format!("invalid rport {raw:?}"))?,
        ),
    };
    Ok((lport, rport))
}

/// POST /connect
pub async fn connect_handler(
    State(service): State<ControlService>,
    Json(args): Json<PortArgs>,
) -> Response {
    let (lport, rport) = match parse_ports(&args) {
        Ok(ports) => ports,
        Err(e) => return reply(StatusCode::BAD_REQUEST, ControlReply::failed(e)),
    };
    info!(lport, ?rport, "control connect");
    match service.connect(lport, rport).await {
        Ok(()) => reply(StatusCode::OK, ControlReply::ok()),
        Err(e) => reply(StatusCode::BAD_GATEWAY, ControlReply::failed(e.to_string())),
    }
}

/// POST /disconnect
pub async fn disconnect_handler(
    State(service): State<ControlService>,
    Json(args): Json<PortArgs>,
) -> Response {
    let (lport, _) = match parse_ports(&args) {
        Ok(ports) => ports,
        Err(e) => return reply(StatusCode::BAD_REQUEST, ControlReply::failed(e)),
    };
    info!(lport, "control disconnect");
    service.disconnect(lport).await;
    reply(StatusCode::OK, ControlReply::ok())
}

pub fn router(service: ControlService) -> Router {
    Router::new()
        .route("/connect", post(connect_handler))
        .route("/disconnect", post(disconnect_handler))
        .with_state(service)
}

/// Serve the control endpoint until `shutdown` fires
pub async fn serve(
    listener: TcpListener,
    service: ControlService,
    shutdown: CancellationToken,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("control endpoint listening on {}", addr);
    }
    axum::serve(listener, router(service))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

/// Client for a running control endpoint
#[derive(Debug, Clone)]
pub struct ControlClient {
    base: String,
    http: reqwest::Client,
}

impl ControlClient {
    /// Create a client for the endpoint at `addr`
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            base: format!("http://{addr}"),
            http: reqwest::Client::new(),
        }
    }

    pub async fn connect(&self, lport: &str, rport: Option<&str>) -> Result<()> {
        self.call("connect", lport, rport).await
    }

    pub async fn disconnect(&self, lport: &str) -> Result<()> {
        self.call("disconnect", lport, None).await
    }

    async fn call(&self, op: &str, lport: &str, rport: Option<&str>) -> Result<()> {
        let args = PortArgs {
            lport: lport.to_string(),
            rport: rport.map(str::to_string),
        };
        let response = self
            .http
            .post(format!("{}/{op}", self.base))
            .json(&args)
            .send()
            .await
            .map_err(|e| TunnelError::Connection(format!("control {op}: {e}")))?;
        let status = response.status();
        let body: ControlReply = response
            .json()
            .await
            .map_err(|e| TunnelError::Protocol(format!("control {op} ({status}): {e}")))?;

        if body.errno == 0 {
            Ok(())
        } else {
            Err(TunnelError::Connection(
                body.error
                    .unwrap_or_else(|| format!("control {op} failed ({status})")),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::manager::ManagerConfig;
    use crate::agent::resolve::{FixedAddresses, StaticResolver};
    use crate::connection::ConnectionOptions;
    use crate::events::{RecordingSink, TunnelEvent};
    use crate::forward::{AuthPolicy, ForwardServer};
    use crate::users::UserRegistry;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tower::ServiceExt;

    fn service(specs: &[&str]) -> ControlService {
        let config = ManagerConfig {
            server_port: 1,
            retry_interval: Duration::from_millis(50),
            ..ManagerConfig::default()
        };
        let manager = TunnelManager::new(
            config,
            ConnectionOptions::default(),
            Arc::new(RecordingSink::new()),
        )
        .with_resolver(Arc::new(StaticResolver::new()))
        .with_local_addresses(Arc::new(FixedAddresses::default()));
        let specs = specs.iter().map(|s| TunnelSpec::parse(s).unwrap()).collect();
        ControlService::new(manager, specs)
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn read_reply(response: Response) -> ControlReply {
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[test]
    fn test_parse_ports() {
        let args = |l: &str, r: Option<&str>| PortArgs {
            lport: l.into(),
            rport: r.map(Into::into),
        };
        assert_eq!(parse_ports(&args("8080", Some("0"))), Ok((8080, Some(0))));
        assert_eq!(parse_ports(&args("8080", None)), Ok((8080, None)));
        assert_eq!(parse_ports(&args(" 22 ", Some(""))), Ok((22, None)));
        assert!(parse_ports(&args("0", None)).is_err());
        assert!(parse_ports(&args("http", None)).is_err());
        assert!(parse_ports(&args("80", Some("70000"))).is_err());
    }

    #[tokio::test]
    async fn test_disconnect_always_succeeds() {
        let app = router(service(&["web:*@db"]));
        let response = app
            .oneshot(post_json("/disconnect", r#"{"lport":"8080"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(read_reply(response).await, ControlReply::ok());
    }

    #[tokio::test]
    async fn test_bad_port_is_bad_request() {
        let app = router(service(&["web:*@db"]));
        let response = app
            .oneshot(post_json("/connect", r#"{"lport":"web","rport":"0"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let reply = read_reply(response).await;
        assert_eq!(reply.errno, -1);
        assert!(reply.error.unwrap().contains("lport"));
    }

    #[tokio::test]
    async fn test_connect_without_matching_spec_is_ok() {
        let service = service(&["web:8080@db"]);
        let response = connect_handler(
            State(service.clone()),
            Json(PortArgs {
                lport: "9090".into(),
                rport: Some("0".into()),
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(service.manager().task_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_failure_reports_error() {
        let service = service(&["web:*@db"]);
        let response = connect_handler(
            State(service.clone()),
            Json(PortArgs {
                lport: "8080".into(),
                rport: Some("0".into()),
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let reply = read_reply(response).await;
        assert_eq!(reply.errno, -1);
        assert!(reply.error.unwrap().contains("db"));

        // The failing spec keeps retrying in the background
        assert!(service.manager().is_tracking(8080));
        service.manager().shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_batch_rolls_back_earlier_specs() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server_events = Arc::new(RecordingSink::new());
        let server = ForwardServer::new(addr, "secret".into(), UserRegistry::new(), server_events.clone())
            .with_auth_policy(AuthPolicy::AnyPrincipal);
        let shutdown = CancellationToken::new();
        tokio::spawn(server.serve(listener, shutdown.clone()));

        let config = ManagerConfig {
            server_port: addr.port(),
            credential: "secret".into(),
            retry_interval: Duration::from_secs(60),
            forward_bind_host: None,
        };
        let manager = TunnelManager::new(
            config,
            ConnectionOptions::default(),
            Arc::new(RecordingSink::new()),
        )
        .with_resolver(Arc::new(
            StaticResolver::new().with_host("db", vec![Ipv4Addr::LOCALHOST]),
        ))
        .with_local_addresses(Arc::new(FixedAddresses::default()));
        let specs = ["localhost:*@db", "other:*@nowhere"]
            .iter()
            .map(|s| TunnelSpec::parse(s).unwrap())
            .collect();
        let service = ControlService::new(manager, specs);

        // The first spec connects, the second cannot resolve
        let err = service.connect(8080, Some(0)).await.unwrap_err();
        assert!(matches!(err, TunnelError::Resolution { .. }));
        assert!(service.manager().pool().is_empty());

        let mut cancelled = 0;
        for _ in 0..100 {
            cancelled = server_events.count(|e| matches!(e, TunnelEvent::ForwardCancelled { .. }));
            if cancelled > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(cancelled, 1);

        service.manager().shutdown().await;
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_client_against_running_endpoint() {
        let service = service(&["web:*@db"]);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve(listener, service.clone(), shutdown.clone()));

        let client = ControlClient::new(addr);
        client.disconnect("8080").await.unwrap();
        let err = client.connect("8080", Some("0")).await.unwrap_err();
        assert!(matches!(err, TunnelError::Connection(_)));
        assert!(client.connect("nope", None).await.is_err());

        service.manager().shutdown().await;
        shutdown.cancel();
        server.await.unwrap().unwrap();
    }
}
