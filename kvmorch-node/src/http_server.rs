//! REST API for the VM lifecycle operations.
//!
//! Handlers run hypervisor calls on the blocking pool since every call opens
//! and closes its own daemon connection.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::{Method, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};

use kvmorch_hypervisor::{
    DomainDetails, DomainSummary, HypervisorError, LeftoverArtifact, NetworkSummary,
    ProvisioningRequest,
};

use crate::service::OrchestratorService;

/// Shared state for HTTP handlers
pub struct AppState {
    pub service: Arc<OrchestratorService>,
}

// ============================================================================
// API Response Types
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
    pub message: String,
}

impl ApiError {
    fn new(error: &str, message: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
        }
    }
}

type ApiFailure = (StatusCode, Json<ApiError>);
type ApiResult<T> = Result<Json<T>, ApiFailure>;

/// Map a hypervisor error onto a status code and error body.
fn reject(e: HypervisorError) -> ApiFailure {
    let (status, code) = match &e {
        _ if e.is_not_found() => (StatusCode::NOT_FOUND, "not_found"),
        HypervisorError::TimeoutNoResult(_) => (StatusCode::NOT_FOUND, "no_address"),
        HypervisorError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
        HypervisorError::InvalidRequest(_) => (StatusCode::UNPROCESSABLE_ENTITY, "invalid_request"),
        HypervisorError::ConnectionFailed(_) => (StatusCode::SERVICE_UNAVAILABLE, "connection_failed"),
        HypervisorError::ExternalTool { .. } => (StatusCode::BAD_REQUEST, "external_tool"),
        _ => (StatusCode::BAD_REQUEST, "operation_failed"),
    };

    if status == StatusCode::SERVICE_UNAVAILABLE {
        error!(error = %e, "Hypervisor unreachable");
    } else {
        warn!(error = %e, status = status.as_u16(), "Request failed");
    }

    (status, Json(ApiError::new(code, &e.to_string())))
}

/// Run a synchronous hypervisor call off the async workers.
async fn blocking<T, F>(f: F) -> Result<T, ApiFailure>
where
    F: FnOnce() -> kvmorch_hypervisor::Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(reject),
        Err(e) => {
            error!(error = %e, "Blocking task failed");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError::new("internal", &e.to_string())),
            ))
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    fn new(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            message: message.into(),
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
    pub backend: String,
    pub uri: String,
    pub domains: usize,
}

#[derive(Debug, Serialize)]
pub struct VmListResponse {
    pub vms: Vec<DomainSummary>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateVmResponse {
    pub message: String,
    pub ip: Option<String>,
    pub source: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DeleteVmResponse {
    pub message: String,
    pub leftovers: Vec<LeftoverArtifact>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IpResponse {
    pub ip: String,
    pub source: String,
}

#[derive(Debug, Serialize)]
pub struct NetworkListResponse {
    pub networks: Vec<NetworkSummary>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AttachResponse {
    pub message: String,
    pub mac: String,
}

// ============================================================================
// Request Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct IpQuery {
    pub network: Option<String>,
    /// Seconds per resolution tier
    pub timeout: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct CreateNetworkRequest {
    pub name: String,
    pub bridge: String,
}

#[derive(Debug, Deserialize)]
pub struct AttachQuery {
    pub vm: String,
    pub network: String,
}

#[derive(Debug, Deserialize)]
pub struct DetachQuery {
    pub vm: String,
    pub mac: String,
}

// ============================================================================
// Router
// ============================================================================

/// Build the application router with all routes
pub fn build_router(service: Arc<OrchestratorService>) -> Router {
    let state = Arc::new(AppState { service });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/", get(root))
        .route("/status", get(status))
        // VM lifecycle
        .route("/vms", get(list_vms).post(create_vm))
        .route("/vms/:name", get(get_vm).delete(delete_vm))
        .route("/vms/:name/start", post(start_vm))
        .route("/vms/:name/shutdown", post(shutdown_vm))
        .route("/vms/:name/destroy", post(destroy_vm))
        .route("/vms/:name/ip", get(get_vm_ip))
        // Networks
        .route("/networks", get(list_networks).post(create_network))
        .route("/networks/attach", post(attach_interface))
        .route("/networks/detach", post(detach_interface))
        .route("/networks/:name", axum::routing::delete(delete_network))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Handlers
// ============================================================================

async fn root() -> Json<MessageResponse> {
    MessageResponse::new("It works!")
}

async fn status(State(state): State<Arc<AppState>>) -> (StatusCode, Json<StatusResponse>) {
    let service = state.service.clone();
    let health = tokio::task::spawn_blocking(move || service.health()).await;

    let (code, healthy, uri, domains) = match health {
        Ok(h) => (
            if h.healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE },
            h.healthy,
            h.uri,
            h.domains,
        ),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, false, state.service.uri().to_string(), 0),
    };

    (
        code,
        Json(StatusResponse {
            status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
            backend: state.service.backend().to_string(),
            uri,
            domains,
        }),
    )
}

async fn list_vms(State(state): State<Arc<AppState>>) -> ApiResult<VmListResponse> {
    let service = state.service.clone();
    let vms = blocking(move || service.list_vms()).await?;
    Ok(Json(VmListResponse { vms }))
}

async fn get_vm(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<DomainDetails> {
    let service = state.service.clone();
    blocking(move || service.get_vm(&name)).await.map(Json)
}

async fn create_vm(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ProvisioningRequest>,
) -> ApiResult<CreateVmResponse> {
    info!(vm = %request.name, vcpus = request.vcpus, memory_mb = request.memory_mb, "Create VM requested");

    let outcome = state.service.create_vm(&request).await.map_err(reject)?;

    Ok(Json(CreateVmResponse {
        message: format!("VM '{}' created", outcome.name),
        ip: outcome.ip.map(|r| r.ip.to_string()),
        source: outcome.ip.map(|r| r.source.to_string()),
    }))
}

async fn delete_vm(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<DeleteVmResponse> {
    let service = state.service.clone();
    let report = blocking(move || service.delete_vm(&name)).await?;

    let message = if report.is_clean() {
        format!("VM '{}' deleted", report.name)
    } else {
        format!(
            "VM '{}' deleted, {} artifact(s) left behind",
            report.name,
            report.leftovers.len()
        )
    };

    Ok(Json(DeleteVmResponse {
        message,
        leftovers: report.leftovers,
    }))
}

async fn start_vm(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<MessageResponse> {
    let service = state.service.clone();
    let vm = name.clone();
    blocking(move || service.start_vm(&vm)).await?;
    Ok(MessageResponse::new(format!("VM '{}' started", name)))
}

async fn shutdown_vm(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<MessageResponse> {
    let service = state.service.clone();
    let vm = name.clone();
    blocking(move || service.shutdown_vm(&vm)).await?;
    Ok(MessageResponse::new(format!("VM '{}' shutdown signaled", name)))
}

async fn destroy_vm(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<MessageResponse> {
    let service = state.service.clone();
    let vm = name.clone();
    blocking(move || service.destroy_vm(&vm)).await?;
    Ok(MessageResponse::new(format!("VM '{}' force-stopped", name)))
}

async fn get_vm_ip(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<IpQuery>,
) -> ApiResult<IpResponse> {
    let resolved = state
        .service
        .resolve_ip(
            &name,
            query.network.as_deref(),
            query.timeout.map(Duration::from_secs),
        )
        .await
        .map_err(reject)?;

    Ok(Json(IpResponse {
        ip: resolved.ip.to_string(),
        source: resolved.source.to_string(),
    }))
}

async fn list_networks(State(state): State<Arc<AppState>>) -> ApiResult<NetworkListResponse> {
    let service = state.service.clone();
    let networks = blocking(move || service.list_networks()).await?;
    Ok(Json(NetworkListResponse { networks }))
}

async fn create_network(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateNetworkRequest>,
) -> ApiResult<MessageResponse> {
    let service = state.service.clone();
    let summary =
        blocking(move || service.ensure_network(&request.name, &request.bridge)).await?;

    Ok(MessageResponse::new(format!(
        "network '{}' bound to bridge '{}'",
        summary.name,
        summary.bridge.unwrap_or_default()
    )))
}

async fn delete_network(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<MessageResponse> {
    let service = state.service.clone();
    let network = name.clone();
    blocking(move || service.delete_network(&network)).await?;
    Ok(MessageResponse::new(format!("network '{}' deleted", name)))
}

async fn attach_interface(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AttachQuery>,
) -> ApiResult<AttachResponse> {
    let service = state.service.clone();
    let (vm, network) = (query.vm.clone(), query.network.clone());
    let mac = blocking(move || service.attach_interface(&vm, &network)).await?;

    Ok(Json(AttachResponse {
        message: format!("attached {} to {}", query.vm, query.network),
        mac,
    }))
}

async fn detach_interface(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DetachQuery>,
) -> ApiResult<MessageResponse> {
    let service = state.service.clone();
    let (vm, mac) = (query.vm.clone(), query.mac.clone());
    blocking(move || service.detach_interface(&vm, &mac)).await?;
    Ok(MessageResponse::new(format!("detached {} from {}", query.mac, query.vm)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::tests::fixture;
    use axum::body::Body;
    use axum::http::Request;
    use kvmorch_hypervisor::MockDomain;
    use tower::ServiceExt;

    async fn send(router: Router, method: &str, uri: &str, body: Option<&str>) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };

        let response = router.oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_root_and_status() {
        let fx = fixture(false);

        let (code, body) = send(build_router(fx.service.clone()), "GET", "/", None).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["message"], "It works!");

        let (code, body) = send(build_router(fx.service.clone()), "GET", "/status", None).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["backend"], "mock");
    }

    #[tokio::test]
    async fn test_status_when_daemon_unreachable() {
        let fx = fixture(false);
        fx.connector.set_fail_connect(true);

        let (code, body) = send(build_router(fx.service.clone()), "GET", "/status", None).await;

        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "unhealthy");
    }

    #[tokio::test]
    async fn test_create_then_conflict() {
        let fx = fixture(false);
        let request = r#"{"name":"web1","ssh_pubkey":"ssh-ed25519 AAAA"}"#;

        let (code, body) =
            send(build_router(fx.service.clone()), "POST", "/vms", Some(request)).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["message"], "VM 'web1' created");
        assert!(body["ip"].is_null());

        let (code, body) =
            send(build_router(fx.service.clone()), "POST", "/vms", Some(request)).await;
        assert_eq!(code, StatusCode::CONFLICT);
        assert_eq!(body["error"], "conflict");
    }

    #[tokio::test]
    async fn test_create_invalid_name() {
        let fx = fixture(false);

        let (code, body) = send(
            build_router(fx.service.clone()),
            "POST",
            "/vms",
            Some(r#"{"name":"bad name!"}"#),
        )
        .await;

        assert_eq!(code, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"], "invalid_request");
    }

    #[tokio::test]
    async fn test_list_and_get() {
        let fx = fixture(false);
        fx.connector
            .add_domain(MockDomain::new("db").with_vcpus(4).with_memory_kib(4 * 1024 * 1024));

        let (code, body) = send(build_router(fx.service.clone()), "GET", "/vms", None).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["vms"][0]["name"], "db");

        let (code, body) = send(build_router(fx.service.clone()), "GET", "/vms/db", None).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["vcpus"], 4);
        assert_eq!(body["name"], "db");

        let (code, body) = send(build_router(fx.service.clone()), "GET", "/vms/ghost", None).await;
        assert_eq!(code, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
    }

    #[tokio::test]
    async fn test_power_routes() {
        let fx = fixture(false);
        fx.connector.add_domain(MockDomain::new("db"));
        let router = || build_router(fx.service.clone());

        let (code, body) = send(router(), "POST", "/vms/db/start", None).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["message"], "VM 'db' started");

        let (code, _) = send(router(), "POST", "/vms/db/destroy", None).await;
        assert_eq!(code, StatusCode::OK);
        let (code, _) = send(router(), "POST", "/vms/db/destroy", None).await;
        assert_eq!(code, StatusCode::OK);

        let (code, _) = send(router(), "POST", "/vms/db/shutdown", None).await;
        assert_eq!(code, StatusCode::BAD_REQUEST);

        let (code, _) = send(router(), "POST", "/vms/ghost/start", None).await;
        assert_eq!(code, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_delete_route() {
        let fx = fixture(false);
        fx.connector.add_domain(MockDomain::new("db"));

        let (code, body) =
            send(build_router(fx.service.clone()), "DELETE", "/vms/db", None).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["message"], "VM 'db' deleted");
        assert_eq!(body["leftovers"].as_array().map(Vec::len), Some(0));

        let (code, _) = send(build_router(fx.service.clone()), "DELETE", "/vms/db", None).await;
        assert_eq!(code, StatusCode::NOT_FOUND);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ip_route() {
        let fx = fixture(false);
        fx.connector.add_domain(
            MockDomain::new("db")
                .running()
                .with_interface("52:54:00:aa:bb:cc", "default"),
        );

        let (code, body) = send(
            build_router(fx.service.clone()),
            "GET",
            "/vms/db/ip?timeout=1",
            None,
        )
        .await;
        assert_eq!(code, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "no_address");

        fx.connector
            .add_lease("default", "52:54:00:aa:bb:cc", "10.0.0.5/24", "db");
        let (code, body) = send(
            build_router(fx.service.clone()),
            "GET",
            "/vms/db/ip?network=default",
            None,
        )
        .await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["ip"], "10.0.0.5");
        assert_eq!(body["source"], "dhcp-leases");
    }

    #[tokio::test]
    async fn test_network_routes() {
        let fx = fixture(false);
        fx.connector.add_domain(MockDomain::new("db"));
        let router = || build_router(fx.service.clone());

        let (code, body) = send(
            router(),
            "POST",
            "/networks",
            Some(r#"{"name":"lan","bridge":"br0"}"#),
        )
        .await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["message"], "network 'lan' bound to bridge 'br0'");

        let (code, body) = send(router(), "GET", "/networks", None).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["networks"].as_array().map(Vec::len), Some(2));

        let (code, body) = send(router(), "POST", "/networks/attach?vm=db&network=lan", None).await;
        assert_eq!(code, StatusCode::OK);
        let mac = body["mac"].as_str().unwrap().to_string();
        assert!(mac.starts_with("52:54:00:"));

        let uri = format!("/networks/detach?vm=db&mac={}", mac);
        let (code, _) = send(router(), "POST", &uri, None).await;
        assert_eq!(code, StatusCode::OK);

        let (code, _) = send(router(), "POST", &uri, None).await;
        assert_eq!(code, StatusCode::NOT_FOUND);

        let (code, _) = send(router(), "POST", "/networks/attach?vm=db&network=nope", None).await;
        assert_eq!(code, StatusCode::NOT_FOUND);

        let (code, _) = send(router(), "DELETE", "/networks/lan", None).await;
        assert_eq!(code, StatusCode::OK);
        let (code, _) = send(router(), "DELETE", "/networks/lan", None).await;
        assert_eq!(code, StatusCode::NOT_FOUND);
    }
}
