use crate::api::{ApiState, BUILD_COMMIT, BUILD_SEMVER};
use dropshot::{endpoint, HttpError, HttpResponseOk, RequestContext};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct GetSystemMetadataResponse {
    /// The commit of the current build.
    pub commit: String,

    /// The semver version of the current build.
    pub semver: String,
}

/// Describe current system meta-information.
///
/// Returns internal metadata about the waypost service itself.
#[endpoint(
    method = GET,
    path = "/api/system/metadata",
    tags = ["System"],
)]
pub async fn get_system_metadata(
    _rqctx: RequestContext<Arc<ApiState>>,
) -> Result<HttpResponseOk<GetSystemMetadataResponse>, HttpError> {
    let resp = GetSystemMetadataResponse {
        commit: BUILD_COMMIT.to_string(),
        semver: BUILD_SEMVER.to_string(),
    };
    Ok(HttpResponseOk(resp))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct GetHealthResponse {
    /// Whether the service considers itself able to serve traffic.
    pub healthy: bool,
}

/// Health check endpoint for load balancers and uptime monitors.
#[endpoint(
    method = GET,
    path = "/api/system/health",
    tags = ["System"],
)]
pub async fn get_health(
    _rqctx: RequestContext<Arc<ApiState>>,
) -> Result<HttpResponseOk<GetHealthResponse>, HttpError> {
    Ok(HttpResponseOk(GetHealthResponse { healthy: true }))
}
