use crate::{
    api::{epoch_milli, event_utils, provision, ApiState},
    http_error, storage,
};
use anyhow::{Context, Result};
use dropshot::{
    endpoint, HttpError, HttpResponseCreated, HttpResponseDeleted, HttpResponseOk, Path,
    RequestContext, TypedBody,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{str::FromStr, sync::Arc};
use strum::{Display, EnumString};

#[derive(Debug, Clone, Display, PartialEq, EnumString, Eq, Serialize, Deserialize, JsonSchema)]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
#[schemars(rename = "deployment_kind")]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    /// Bare-metal provisioning on hardware waypost can reach directly.
    Local,

    /// Provisioning against rented cloud infrastructure.
    Cloud,
}

#[derive(
    Debug, Clone, Display, Default, PartialEq, EnumString, Eq, Serialize, Deserialize, JsonSchema,
)]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
#[schemars(rename = "deployment_status")]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Created, but a provisioner has not picked the deployment up yet.
    #[default]
    Pending,

    /// A provisioner is actively working through the step plan.
    InProgress,

    /// Every step of the plan finished successfully.
    Completed,

    /// A step failed or progress could no longer be persisted.
    Failed,
}

#[derive(
    Debug, Clone, Display, Default, PartialEq, EnumString, Eq, Serialize, Deserialize, JsonSchema,
)]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
#[schemars(rename = "deployment_status_reason_type")]
#[serde(rename_all = "snake_case")]
pub enum StatusReasonType {
    #[default]
    Unknown,

    /// A provisioning step reported a failure.
    StepFailed,

    /// Deployment state could no longer be written to storage mid-plan.
    PersistenceFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[schemars(rename = "deployment_status_reason")]
pub struct StatusReason {
    /// The specific type of deployment failure.
    pub reason: StatusReasonType,

    /// A description of why the deployment might have failed and what was going on at the time.
    pub description: String,
}

/// A deployment tracks the provisioning of a single server environment from request to
/// terminal status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct Deployment {
    /// Unique identifier for the deployment, assigned by storage at creation.
    pub id: u64,

    /// Humanized name for the deployment.
    pub name: String,

    /// Which provisioning plan the deployment runs. Immutable after creation.
    pub kind: Kind,

    /// Opaque configuration blob handed through to the provisioning plan unmodified.
    pub config: serde_json::Value,

    /// The current state of the deployment within waypost's execution model.
    pub status: Status,

    /// Percentage of the provisioning plan completed; monotonically non-decreasing while the
    /// deployment is in progress and frozen once it reaches a terminal status.
    pub progress: u64,

    /// Details about a deployment's specific status.
    pub status_reason: Option<StatusReason>,

    /// Time of deployment creation in epoch milliseconds.
    pub created: u64,

    /// Time of last status or progress change in epoch milliseconds.
    pub modified: u64,
}

impl Deployment {
    pub fn new(name: &str, kind: Kind, config: serde_json::Value) -> Self {
        Deployment {
            id: 0,
            name: name.into(),
            kind,
            config,
            status: Status::Pending,
            progress: 0,
            status_reason: None,
            created: epoch_milli(),
            modified: epoch_milli(),
        }
    }
}

impl TryFrom<storage::deployments::Deployment> for Deployment {
    type Error = anyhow::Error;

    fn try_from(value: storage::deployments::Deployment) -> Result<Self> {
        let id = value.id.try_into().with_context(|| {
            format!(
                "Could not parse field 'id' from storage value '{}'",
                value.id
            )
        })?;

        let kind = Kind::from_str(&value.kind).with_context(|| {
            format!(
                "Could not parse field 'kind' from storage value '{}'",
                value.kind
            )
        })?;

        let config = serde_json::from_str(&value.config).with_context(|| {
            format!(
                "Could not parse field 'config' from storage value '{}'",
                value.config
            )
        })?;

        let status = Status::from_str(&value.status).with_context(|| {
            format!(
                "Could not parse field 'status' from storage value '{}'",
                value.status
            )
        })?;

        let progress = value.progress.try_into().with_context(|| {
            format!(
                "Could not parse field 'progress' from storage value '{}'",
                value.progress
            )
        })?;

        let status_reason = serde_json::from_str(&value.status_reason).with_context(|| {
            format!(
                "Could not parse field 'status_reason' from storage value '{}'",
                value.status_reason
            )
        })?;

        let created = value.created.parse::<u64>().with_context(|| {
            format!(
                "Could not parse field 'created' from storage value '{}'",
                value.created
            )
        })?;

        let modified = value.modified.parse::<u64>().with_context(|| {
            format!(
                "Could not parse field 'modified' from storage value '{}'",
                value.modified
            )
        })?;

        Ok(Deployment {
            id,
            name: value.name,
            kind,
            config,
            status,
            progress,
            status_reason,
            created,
            modified,
        })
    }
}

impl TryFrom<Deployment> for storage::deployments::Deployment {
    type Error = anyhow::Error;

    fn try_from(value: Deployment) -> Result<Self> {
        let id = value.id.try_into().with_context(|| {
            format!(
                "Could not parse field 'id' to storage value '{}'",
                value.id
            )
        })?;

        let config = serde_json::to_string(&value.config).with_context(|| {
            format!(
                "Could not parse field 'config' to storage value '{:#?}'",
                value.config
            )
        })?;

        let status_reason = serde_json::to_string(&value.status_reason).with_context(|| {
            format!(
                "Could not parse field 'status_reason' to storage value '{:#?}'",
                value.status_reason
            )
        })?;

        Ok(Self {
            id,
            name: value.name,
            kind: value.kind.to_string(),
            config,
            status: value.status.to_string(),
            progress: value.progress as i64,
            status_reason,
            created: value.created.to_string(),
            modified: value.modified.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DeploymentPathArgs {
    /// The unique identifier for the target deployment.
    pub deployment_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ListDeploymentsResponse {
    /// A list of all deployments.
    pub deployments: Vec<Deployment>,
}

/// List all deployments.
#[endpoint(
    method = GET,
    path = "/api/deployments",
    tags = ["Deployments"],
)]
pub async fn list_deployments(
    rqctx: RequestContext<Arc<ApiState>>,
) -> Result<HttpResponseOk<ListDeploymentsResponse>, HttpError> {
    let api_state = rqctx.context();

    let mut conn = match api_state.storage.read_conn().await {
        Ok(conn) => conn,
        Err(e) => {
            return Err(http_error!(
                "Could not open connection to database",
                rqctx.request_id,
                Some(e)
            ));
        }
    };

    let storage_deployments = match storage::deployments::list(&mut conn).await {
        Ok(deployments) => deployments,
        Err(e) => {
            return Err(http_error!(
                "Could not get objects from database",
                rqctx.request_id,
                Some(e)
            ));
        }
    };

    let mut deployments: Vec<Deployment> = vec![];

    for storage_deployment in storage_deployments {
        let deployment = Deployment::try_from(storage_deployment).map_err(|e| {
            http_error!(
                "Could not parse object from database",
                rqctx.request_id,
                Some(e)
            )
        })?;

        deployments.push(deployment);
    }

    let resp = ListDeploymentsResponse { deployments };
    Ok(HttpResponseOk(resp))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct GetDeploymentResponse {
    /// The target deployment.
    pub deployment: Deployment,
}

/// Get api deployment by id.
#[endpoint(
    method = GET,
    path = "/api/deployments/{deployment_id}",
    tags = ["Deployments"],
)]
pub async fn get_deployment(
    rqctx: RequestContext<Arc<ApiState>>,
    path_params: Path<DeploymentPathArgs>,
) -> Result<HttpResponseOk<GetDeploymentResponse>, HttpError> {
    let api_state = rqctx.context();
    let path = path_params.into_inner();

    let mut conn = match api_state.storage.read_conn().await {
        Ok(conn) => conn,
        Err(e) => {
            return Err(http_error!(
                "Could not open connection to database",
                rqctx.request_id,
                Some(e)
            ));
        }
    };

    let storage_deployment =
        match storage::deployments::get(&mut conn, path.deployment_id as i64).await {
            Ok(deployment) => deployment,
            Err(e) => match e {
                storage::StorageError::NotFound => {
                    return Err(HttpError::for_not_found(
                        None,
                        "Deployment entry for id given does not exist".into(),
                    ));
                }
                _ => {
                    return Err(http_error!(
                        "Could not get object from database",
                        rqctx.request_id,
                        Some(e)
                    ));
                }
            },
        };

    let deployment = Deployment::try_from(storage_deployment).map_err(|e| {
        http_error!(
            "Could not parse object from database",
            rqctx.request_id,
            Some(e)
        )
    })?;

    let resp = GetDeploymentResponse { deployment };
    Ok(HttpResponseOk(resp))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CreateDeploymentRequest {
    /// Humanized name for the deployment.
    pub name: String,

    /// Which provisioning plan to run; one of 'local' or 'cloud'.
    pub kind: String,

    /// Opaque configuration blob handed through to the provisioning plan unmodified.
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CreateDeploymentResponse {
    /// Information about the deployment created.
    pub deployment: Deployment,
}

/// Create a new deployment.
///
/// The deployment is created in the pending state and provisioning starts in the background;
/// poll the deployment or follow the event stream to watch progress.
#[endpoint(
    method = POST,
    path = "/api/deployments",
    tags = ["Deployments"],
)]
pub async fn create_deployment(
    rqctx: RequestContext<Arc<ApiState>>,
    body: TypedBody<CreateDeploymentRequest>,
) -> Result<HttpResponseCreated<CreateDeploymentResponse>, HttpError> {
    let api_state = rqctx.context();
    let body = body.into_inner();

    if body.name.is_empty() {
        return Err(HttpError::for_bad_request(
            None,
            "'name' cannot be empty".into(),
        ));
    }

    // An unrecognized kind is rejected here, before any record exists, so a bad request never
    // leaves a half-created deployment behind.
    let kind = Kind::from_str(&body.kind).map_err(|_| {
        HttpError::for_bad_request(
            None,
            format!(
                "unrecognized provisioning kind '{}'; must be one of ['local', 'cloud']",
                body.kind
            ),
        )
    })?;

    let mut conn = match api_state.storage.write_conn().await {
        Ok(conn) => conn,
        Err(e) => {
            return Err(http_error!(
                "Could not open connection to database",
                rqctx.request_id,
                Some(e)
            ));
        }
    };

    let mut new_deployment = Deployment::new(&body.name, kind, body.config);

    let new_deployment_storage = new_deployment.clone().try_into().map_err(|e| {
        http_error!(
            "Could not parse object into database value",
            rqctx.request_id,
            Some::<anyhow::Error>(e)
        )
    })?;

    let id = match storage::deployments::insert(&mut conn, &new_deployment_storage).await {
        Ok(id) => id,
        Err(e) => {
            return Err(http_error!(
                "Could not insert object into database",
                rqctx.request_id,
                Some(e)
            ));
        }
    };

    new_deployment.id = id as u64;

    api_state
        .event_bus
        .clone()
        .publish(event_utils::Kind::CreatedDeployment {
            deployment_id: new_deployment.id,
        });

    // The provisioner runs detached from the request; the caller observes progress through
    // the deployment record or the event stream.
    let provisioner =
        provision::Provisioner::new(rqctx.context().clone(), new_deployment.clone());
    tokio::spawn(provisioner.execute());

    let resp = CreateDeploymentResponse {
        deployment: new_deployment,
    };

    Ok(HttpResponseCreated(resp))
}

/// Delete api deployment by id.
///
/// Deployments can be deleted at any status; a provisioner still attached to the deployment
/// observes the missing record on its next write and aborts.
#[endpoint(
    method = DELETE,
    path = "/api/deployments/{deployment_id}",
    tags = ["Deployments"],
)]
pub async fn delete_deployment(
    rqctx: RequestContext<Arc<ApiState>>,
    path_params: Path<DeploymentPathArgs>,
) -> Result<HttpResponseDeleted, HttpError> {
    let api_state = rqctx.context();
    let path = path_params.into_inner();

    let mut conn = match api_state.storage.write_conn().await {
        Ok(conn) => conn,
        Err(e) => {
            return Err(http_error!(
                "Could not open connection to database",
                rqctx.request_id,
                Some(e)
            ));
        }
    };

    if let Err(e) = storage::deployments::delete(&mut conn, path.deployment_id as i64).await {
        match e {
            storage::StorageError::NotFound => {
                return Err(HttpError::for_not_found(
                    None,
                    "Deployment entry for id given does not exist".into(),
                ));
            }
            _ => {
                return Err(http_error!(
                    "Could not delete object from database",
                    rqctx.request_id,
                    Some(e)
                ));
            }
        }
    };

    api_state
        .event_bus
        .clone()
        .publish(event_utils::Kind::DeletedDeployment {
            deployment_id: path.deployment_id,
        });

    Ok(HttpResponseDeleted())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn deployment_round_trips_through_storage() {
        let deployment = Deployment {
            id: 12,
            name: "forward site alpha".to_string(),
            kind: Kind::Cloud,
            config: serde_json::json!({"enable_reverse_proxy": true}),
            status: Status::InProgress,
            progress: 57,
            status_reason: None,
            created: 1712000000000,
            modified: 1712000000500,
        };

        let storage_deployment: storage::deployments::Deployment =
            deployment.clone().try_into().unwrap();

        assert_eq!(storage_deployment.kind, "cloud");
        assert_eq!(storage_deployment.status, "in_progress");

        let round_tripped = Deployment::try_from(storage_deployment).unwrap();
        assert_eq!(round_tripped, deployment);
    }

    #[test]
    fn status_reason_round_trips_through_storage() {
        let mut deployment = Deployment::new("bravo", Kind::Local, serde_json::json!({}));
        deployment.status = Status::Failed;
        deployment.status_reason = Some(StatusReason {
            reason: StatusReasonType::StepFailed,
            description: "step 'start_services' failed".to_string(),
        });

        let storage_deployment: storage::deployments::Deployment =
            deployment.clone().try_into().unwrap();
        let round_tripped = Deployment::try_from(storage_deployment).unwrap();

        assert_eq!(round_tripped.status_reason, deployment.status_reason);
    }

    #[test]
    fn kind_rejects_unknown_values() {
        assert!(Kind::from_str("local").is_ok());
        assert!(Kind::from_str("CLOUD").is_ok());
        assert!(Kind::from_str("hybrid").is_err());
    }
}
