//! Remote firewall gateway
//!
//! Thin idempotent client for opening and closing individual ports on a
//! security-group style API. A duplicate-rule response to open, or a
//! missing-rule response to close, is treated as success; any other failure
//! is surfaced to the caller, which decides whether to proceed, retry, or
//! abort. Already-applied local state is never unwound here.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::CoordinatorError;

/// Error codes the security-group API uses for the two benign outcomes
const CODE_DUPLICATE: &str = "InvalidPermission.Duplicate";
const CODE_NOT_FOUND: &str = "InvalidPermission.NotFound";

/// Gateway to a remote firewall that filters the public tunnel ports
#[async_trait]
pub trait FirewallGateway: Send + Sync {
    /// Authorize inbound TCP traffic on `port` from 0.0.0.0/0.
    async fn open_port(&self, port: u16, description: &str) -> Result<(), CoordinatorError>;

    /// Revoke the inbound rule for `port`. Succeeds if the rule is already gone.
    async fn close_port(&self, port: u16) -> Result<(), CoordinatorError>;
}

#[derive(Serialize)]
struct IngressRule<'a> {
    ip_protocol: &'static str,
    from_port: u16,
    to_port: u16,
    cidr: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
}

impl<'a> IngressRule<'a> {
    fn tcp(port: u16, description: Option<&'a str>) -> Self {
        Self {
            ip_protocol: "tcp",
            from_port: port,
            to_port: port,
            cidr: "0.0.0.0/0",
            description,
        }
    }
}

#[derive(Deserialize, Default)]
struct ApiError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

/// HTTP client for a remote security-group API
pub struct SecurityGroupClient {
    http: reqwest::Client,
    endpoint: String,
    group_id: String,
    api_token: Option<String>,
}

impl SecurityGroupClient {
    pub fn new(endpoint: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
            group_id: group_id.into(),
            api_token: None,
        }
    }

    pub fn with_api_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }

    fn ingress_url(&self) -> String {
        format!(
            "{}/security-groups/{}/ingress",
            self.endpoint.trim_end_matches('/'),
            self.group_id
        )
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Read the API's error code out of a non-success response body.
    async fn error_of(response: reqwest::Response) -> ApiError {
        response.json().await.unwrap_or_default()
    }
}

#[async_trait]
impl FirewallGateway for SecurityGroupClient {
    async fn open_port(&self, port: u16, description: &str) -> Result<(), CoordinatorError> {
        debug!(port, "firewall: authorizing inbound traffic");

        let response = self
            .authorize(self.http.post(self.ingress_url()))
            .json(&IngressRule::tcp(port, Some(description)))
            .send()
            .await
            .map_err(|err| {
                CoordinatorError::ExternalTool(format!("firewall authorize request failed: {err}"))
            })?;

        if response.status().is_success() {
            info!(port, "firewall: opened port");
            return Ok(());
        }

        let status = response.status();
        let api_error = Self::error_of(response).await;
        if api_error.code == CODE_DUPLICATE {
            debug!(port, "firewall: rule already exists");
            return Ok(());
        }

        Err(CoordinatorError::ExternalTool(format!(
            "firewall authorize for port {port} failed ({status}): {} {}",
            api_error.code, api_error.message
        )))
    }

    async fn close_port(&self, port: u16) -> Result<(), CoordinatorError> {
        debug!(port, "firewall: revoking inbound traffic");

        let response = self
            .authorize(self.http.delete(self.ingress_url()))
            .json(&IngressRule::tcp(port, None))
            .send()
            .await
            .map_err(|err| {
                CoordinatorError::ExternalTool(format!("firewall revoke request failed: {err}"))
            })?;

        if response.status().is_success() {
            info!(port, "firewall: closed port");
            return Ok(());
        }

        let status = response.status();
        let api_error = Self::error_of(response).await;
        if api_error.code == CODE_NOT_FOUND || status == reqwest::StatusCode::NOT_FOUND {
            debug!(port, "firewall: rule was already gone");
            return Ok(());
        }

        Err(CoordinatorError::ExternalTool(format!(
            "firewall revoke for port {port} failed ({status}): {} {}",
            api_error.code, api_error.message
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing, Json, Router};
    use serde_json::json;

    /// Serve the given router on an ephemeral port, returning its base URL.
    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn ingress_route(handler: axum::routing::MethodRouter) -> Router {
        Router::new().route("/security-groups/sg-test/ingress", handler)
    }

    #[tokio::test]
    async fn open_succeeds_on_duplicate_rule() {
        let router = ingress_route(routing::post(|| async {
            (
                StatusCode::BAD_REQUEST,
                Json(json!({"code": "InvalidPermission.Duplicate", "message": "rule exists"})),
            )
        }));
        let endpoint = serve(router).await;

        let client = SecurityGroupClient::new(endpoint, "sg-test");
        client.open_port(2222, "SSH access").await.unwrap();
    }

    #[tokio::test]
    async fn close_succeeds_on_missing_rule() {
        let router = ingress_route(routing::delete(|| async {
            (
                StatusCode::BAD_REQUEST,
                Json(json!({"code": "InvalidPermission.NotFound", "message": "no such rule"})),
            )
        }));
        let endpoint = serve(router).await;

        let client = SecurityGroupClient::new(endpoint, "sg-test");
        client.close_port(2222).await.unwrap();
    }

    #[tokio::test]
    async fn close_succeeds_on_http_404() {
        let router = ingress_route(routing::delete(|| async { StatusCode::NOT_FOUND }));
        let endpoint = serve(router).await;

        let client = SecurityGroupClient::new(endpoint, "sg-test");
        client.close_port(2222).await.unwrap();
    }

    #[tokio::test]
    async fn other_api_errors_are_surfaced() {
        let router = ingress_route(routing::post(|| async {
            (
                StatusCode::FORBIDDEN,
                Json(json!({"code": "UnauthorizedOperation", "message": "denied"})),
            )
        }));
        let endpoint = serve(router).await;

        let client = SecurityGroupClient::new(endpoint, "sg-test");
        let result = client.open_port(2222, "SSH access").await;
        assert!(matches!(result, Err(CoordinatorError::ExternalTool(_))));
    }
}
