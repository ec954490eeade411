pub mod handlers;
pub mod models;

use axum::{
    http::{header, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use std::{net::SocketAddr, sync::Arc};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use vmrelay_core::AllocationCoordinator;

/// Application state shared across handlers
pub struct AppState {
    pub coordinator: AllocationCoordinator,
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "VM Relay API",
        version = "0.1.0",
        description = "REST API for provisioning VMs exposed through a reverse tunnel",
        contact(
            name = "VM Relay Team",
            email = "team@vmrelay.dev"
        )
    ),
    paths(
        handlers::health_check,
        handlers::list_vms,
        handlers::create_vm,
        handlers::delete_vm,
        handlers::start_vm,
        handlers::stop_vm,
        handlers::add_rule,
        handlers::remove_rule,
    ),
    components(
        schemas(
            models::RuleProtocol,
            models::VmStatus,
            models::InboundRule,
            models::Vm,
            models::VmList,
            models::RuleRequest,
            models::CreateVmRequest,
            models::CreateVmResponse,
            models::MessageResponse,
            models::HealthResponse,
            models::ErrorResponse,
        )
    ),
    tags(
        (name = "vms", description = "VM lifecycle endpoints"),
        (name = "rules", description = "Inbound rule management endpoints"),
        (name = "system", description = "System health and info endpoints")
    )
)]
struct ApiDoc;

/// API server configuration
pub struct ApiServerConfig {
    /// Address to bind the API server
    pub bind_addr: SocketAddr,
    /// Enable CORS (for development)
    pub enable_cors: bool,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".parse().unwrap(),
            enable_cors: true,
        }
    }
}

/// API Server
pub struct ApiServer {
    config: ApiServerConfig,
    state: Arc<AppState>,
}

impl ApiServer {
    /// Create a new API server
    pub fn new(config: ApiServerConfig, coordinator: AllocationCoordinator) -> Self {
        let state = Arc::new(AppState { coordinator });
        Self { config, state }
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        let api_doc = ApiDoc::openapi();

        let api_router = Router::new()
            .route("/api/health", get(handlers::health_check))
            .route(
                "/api/vms",
                get(handlers::list_vms).post(handlers::create_vm),
            )
            .route("/api/vms/{name}", axum::routing::delete(handlers::delete_vm))
            .route("/api/vms/{name}/start", post(handlers::start_vm))
            .route("/api/vms/{name}/stop", post(handlers::stop_vm))
            .route("/api/vms/{name}/rules", post(handlers::add_rule))
            .route(
                "/api/vms/{name}/rules/{remote_port}",
                axum::routing::delete(handlers::remove_rule),
            )
            .with_state(self.state.clone());

        // SwaggerUi automatically creates a route for /api/openapi.json
        let router = Router::new()
            .merge(SwaggerUi::new("/swagger-ui").url("/api/openapi.json", api_doc))
            .merge(api_router);

        let cors = if self.config.enable_cors {
            use tower_http::cors::AllowOrigin;

            let cors_layer = CorsLayer::new()
                .allow_methods([Method::GET, Method::POST, Method::DELETE])
                .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
                .allow_origin(AllowOrigin::predicate(|origin: &HeaderValue, _| {
                    // Allow common development origins
                    let origin_str = origin.to_str().unwrap_or("");
                    origin_str.starts_with("http://localhost:")
                        || origin_str.starts_with("http://127.0.0.1:")
                        || origin_str.starts_with("https://localhost:")
                        || origin_str.starts_with("https://127.0.0.1:")
                }));

            Some(cors_layer)
        } else {
            None
        };

        let mut router = router.layer(TraceLayer::new_for_http());

        if let Some(cors) = cors {
            router = router.layer(cors);
        }

        router
    }

    /// Start the API server
    pub async fn start(self) -> Result<(), anyhow::Error> {
        let router = self.build_router();

        info!("Starting API server on {}", self.config.bind_addr);
        info!(
            "OpenAPI spec: http://{}/api/openapi.json",
            self.config.bind_addr
        );
        info!("Swagger UI: http://{}/swagger-ui", self.config.bind_addr);

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;

        axum::serve(listener, router)
            .await
            .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_generation() {
        // Ensure OpenAPI spec can be generated without panics
        let _api_doc = ApiDoc::openapi();
    }
}
