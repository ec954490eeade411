use axum::{
    extract::{FromRequestParts, Path, State},
    http::{request::Parts, StatusCode},
    Json,
};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use vmrelay_core::CoordinatorError;

use crate::models::*;
use crate::AppState;

/// Authenticated owner identity, taken from the `x-owner-id` header.
///
/// Authentication itself happens in a fronting layer; by the time a request
/// reaches this service the header carries a verified UUID. Requests without
/// one are rejected with 401.
pub struct OwnerId(pub String);

impl<S> FromRequestParts<S> for OwnerId
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<ErrorResponse>);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get("x-owner-id")
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| unauthorized("missing x-owner-id header"))?;

        let owner_id = Uuid::parse_str(value)
            .map_err(|_| unauthorized("x-owner-id is not a valid UUID"))?;

        Ok(Self(owner_id.to_string()))
    }
}

fn unauthorized(message: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse {
            error: message.to_string(),
            code: Some("UNAUTHORIZED".to_string()),
        }),
    )
}

/// Map a coordinator error onto an HTTP status and error body.
fn error_response(err: CoordinatorError) -> (StatusCode, Json<ErrorResponse>) {
    let (status, code) = match &err {
        CoordinatorError::PoolExhausted(_) => (StatusCode::SERVICE_UNAVAILABLE, "POOL_EXHAUSTED"),
        CoordinatorError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
        CoordinatorError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
        CoordinatorError::Forbidden(_) => (StatusCode::FORBIDDEN, "FORBIDDEN"),
        CoordinatorError::ConfigCorrupt(_) => (StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_CORRUPT"),
        CoordinatorError::ExternalTool(_) => (StatusCode::BAD_GATEWAY, "EXTERNAL_TOOL"),
        CoordinatorError::Store(_) | CoordinatorError::Io(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL")
        }
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
            code: Some(code.to_string()),
        }),
    )
}

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/api/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "system"
)]
pub async fn health_check(
    State(state): State<Arc<AppState>>,
) -> Result<Json<HealthResponse>, (StatusCode, Json<ErrorResponse>)> {
    let vm_count = state
        .coordinator
        .store()
        .count()
        .await
        .map_err(|err| error_response(err.into()))?;

    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        vm_count,
    }))
}

/// List the caller's VMs
#[utoipa::path(
    get,
    path = "/api/vms",
    responses(
        (status = 200, description = "List of VMs", body = VmList),
        (status = 401, description = "Missing or invalid owner identity", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "vms"
)]
pub async fn list_vms(
    State(state): State<Arc<AppState>>,
    OwnerId(owner_id): OwnerId,
) -> Result<Json<VmList>, (StatusCode, Json<ErrorResponse>)> {
    debug!("Listing VMs");

    let records = state
        .coordinator
        .list_vms(&owner_id)
        .await
        .map_err(error_response)?;

    let vms: Vec<Vm> = records.into_iter().map(Vm::from).collect();
    let total = vms.len();

    Ok(Json(VmList { vms, total }))
}

/// Create a new VM
#[utoipa::path(
    post,
    path = "/api/vms",
    request_body = CreateVmRequest,
    responses(
        (status = 201, description = "VM created, provisioning in progress", body = CreateVmResponse),
        (status = 401, description = "Missing or invalid owner identity", body = ErrorResponse),
        (status = 404, description = "SSH key not found", body = ErrorResponse),
        (status = 409, description = "Name or port conflict", body = ErrorResponse),
        (status = 503, description = "IP or port pool exhausted", body = ErrorResponse)
    ),
    tag = "vms"
)]
pub async fn create_vm(
    State(state): State<Arc<AppState>>,
    OwnerId(owner_id): OwnerId,
    Json(request): Json<CreateVmRequest>,
) -> Result<(StatusCode, Json<CreateVmResponse>), (StatusCode, Json<ErrorResponse>)> {
    info!(vm = %request.name, "Creating VM");

    let created = state
        .coordinator
        .create_vm(
            &owner_id,
            vmrelay_core::CreateVmRequest {
                name: request.name,
                key_name: request.key_name,
                ram: request.ram,
                cpu: request.cpu,
                image: request.image,
                inbound_rules: request
                    .inbound_rules
                    .into_iter()
                    .map(Into::into)
                    .collect(),
                provisioning_script: request.provisioning_script,
            },
        )
        .await
        .map_err(error_response)?;

    Ok((
        StatusCode::CREATED,
        Json(CreateVmResponse {
            vm: created.record.into(),
            ssh_command: created.ssh_command,
        }),
    ))
}

/// Delete a VM
#[utoipa::path(
    delete,
    path = "/api/vms/{name}",
    params(
        ("name" = String, Path, description = "VM name")
    ),
    responses(
        (status = 202, description = "Deletion scheduled", body = MessageResponse),
        (status = 401, description = "Missing or invalid owner identity", body = ErrorResponse),
        (status = 403, description = "VM not found or not owned by caller", body = ErrorResponse)
    ),
    tag = "vms"
)]
pub async fn delete_vm(
    State(state): State<Arc<AppState>>,
    OwnerId(owner_id): OwnerId,
    Path(name): Path<String>,
) -> Result<(StatusCode, Json<MessageResponse>), (StatusCode, Json<ErrorResponse>)> {
    info!(vm = %name, "Deleting VM");

    state
        .coordinator
        .delete_vm(&owner_id, &name)
        .await
        .map_err(error_response)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(MessageResponse {
            message: format!("VM '{name}' deletion scheduled"),
        }),
    ))
}

/// Start a stopped VM
#[utoipa::path(
    post,
    path = "/api/vms/{name}/start",
    params(
        ("name" = String, Path, description = "VM name")
    ),
    responses(
        (status = 202, description = "Start scheduled", body = MessageResponse),
        (status = 401, description = "Missing or invalid owner identity", body = ErrorResponse),
        (status = 403, description = "VM not found or not owned by caller", body = ErrorResponse),
        (status = 404, description = "VM directory missing", body = ErrorResponse)
    ),
    tag = "vms"
)]
pub async fn start_vm(
    State(state): State<Arc<AppState>>,
    OwnerId(owner_id): OwnerId,
    Path(name): Path<String>,
) -> Result<(StatusCode, Json<MessageResponse>), (StatusCode, Json<ErrorResponse>)> {
    info!(vm = %name, "Starting VM");

    state
        .coordinator
        .start_vm(&owner_id, &name)
        .await
        .map_err(error_response)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(MessageResponse {
            message: format!("VM '{name}' start scheduled"),
        }),
    ))
}

/// Stop a running VM
#[utoipa::path(
    post,
    path = "/api/vms/{name}/stop",
    params(
        ("name" = String, Path, description = "VM name")
    ),
    responses(
        (status = 202, description = "Stop scheduled", body = MessageResponse),
        (status = 401, description = "Missing or invalid owner identity", body = ErrorResponse),
        (status = 403, description = "VM not found or not owned by caller", body = ErrorResponse),
        (status = 404, description = "VM directory missing", body = ErrorResponse)
    ),
    tag = "vms"
)]
pub async fn stop_vm(
    State(state): State<Arc<AppState>>,
    OwnerId(owner_id): OwnerId,
    Path(name): Path<String>,
) -> Result<(StatusCode, Json<MessageResponse>), (StatusCode, Json<ErrorResponse>)> {
    info!(vm = %name, "Stopping VM");

    state
        .coordinator
        .stop_vm(&owner_id, &name)
        .await
        .map_err(error_response)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(MessageResponse {
            message: format!("VM '{name}' stop scheduled"),
        }),
    ))
}

/// Add an inbound rule to a VM
#[utoipa::path(
    post,
    path = "/api/vms/{name}/rules",
    params(
        ("name" = String, Path, description = "VM name")
    ),
    request_body = RuleRequest,
    responses(
        (status = 201, description = "Rule added", body = InboundRule),
        (status = 401, description = "Missing or invalid owner identity", body = ErrorResponse),
        (status = 403, description = "VM not found or not owned by caller", body = ErrorResponse),
        (status = 503, description = "Port pool exhausted", body = ErrorResponse)
    ),
    tag = "rules"
)]
pub async fn add_rule(
    State(state): State<Arc<AppState>>,
    OwnerId(owner_id): OwnerId,
    Path(name): Path<String>,
    Json(request): Json<RuleRequest>,
) -> Result<(StatusCode, Json<InboundRule>), (StatusCode, Json<ErrorResponse>)> {
    info!(vm = %name, vm_port = request.vm_port, "Adding inbound rule");

    let rule = state
        .coordinator
        .add_rule(&owner_id, &name, request.into())
        .await
        .map_err(error_response)?;

    Ok((StatusCode::CREATED, Json(rule.into())))
}

/// Remove an inbound rule by its public tunnel port
#[utoipa::path(
    delete,
    path = "/api/vms/{name}/rules/{remote_port}",
    params(
        ("name" = String, Path, description = "VM name"),
        ("remote_port" = u16, Path, description = "Public tunnel port of the rule")
    ),
    responses(
        (status = 204, description = "Rule removed"),
        (status = 401, description = "Missing or invalid owner identity", body = ErrorResponse),
        (status = 403, description = "VM not found or not owned by caller", body = ErrorResponse),
        (status = 404, description = "No rule with that port", body = ErrorResponse)
    ),
    tag = "rules"
)]
pub async fn remove_rule(
    State(state): State<Arc<AppState>>,
    OwnerId(owner_id): OwnerId,
    Path((name, remote_port)): Path<(String, u16)>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    info!(vm = %name, remote_port, "Removing inbound rule");

    state
        .coordinator
        .remove_rule(&owner_id, &name, remote_port)
        .await
        .map_err(error_response)?;

    Ok(StatusCode::NO_CONTENT)
}
