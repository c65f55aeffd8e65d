use crate::{
    api::{epoch_milli, event_utils, ApiState},
    http_error, storage,
};
use anyhow::{Context, Result};
use dropshot::{
    endpoint, HttpError, HttpResponseCreated, HttpResponseOk, Query, RequestContext, TypedBody,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One point-in-time sample of the deployed server's resource usage, pushed in by whatever
/// agent is watching the host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct ServerMetrics {
    /// Unique identifier for the sample, assigned by storage at creation.
    pub id: u64,

    /// CPU usage percentage.
    pub cpu_usage: u64,

    /// Memory usage percentage.
    pub memory_usage: u64,

    /// Disk usage percentage.
    pub disk_usage: u64,

    /// Bytes received since the last sample.
    pub network_in: u64,

    /// Bytes sent since the last sample.
    pub network_out: u64,

    /// Number of currently connected clients.
    pub active_connections: u64,

    /// Time the sample was recorded in epoch milliseconds.
    pub recorded: u64,
}

impl TryFrom<storage::server_metrics::ServerMetrics> for ServerMetrics {
    type Error = anyhow::Error;

    fn try_from(value: storage::server_metrics::ServerMetrics) -> Result<Self> {
        let recorded = value.recorded.parse::<u64>().with_context(|| {
            format!(
                "Could not parse field 'recorded' from storage value '{}'",
                value.recorded
            )
        })?;

        Ok(ServerMetrics {
            id: value.id.try_into()?,
            cpu_usage: value.cpu_usage.try_into()?,
            memory_usage: value.memory_usage.try_into()?,
            disk_usage: value.disk_usage.try_into()?,
            network_in: value.network_in.try_into()?,
            network_out: value.network_out.try_into()?,
            active_connections: value.active_connections.try_into()?,
            recorded,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RecordMetricsRequest {
    /// CPU usage percentage.
    pub cpu_usage: u64,

    /// Memory usage percentage.
    pub memory_usage: u64,

    /// Disk usage percentage.
    pub disk_usage: u64,

    /// Bytes received since the last sample.
    pub network_in: u64,

    /// Bytes sent since the last sample.
    pub network_out: u64,

    /// Number of currently connected clients.
    pub active_connections: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RecordMetricsResponse {
    /// Information about the sample recorded.
    pub metrics: ServerMetrics,
}

/// Record a new server metrics sample.
#[endpoint(
    method = POST,
    path = "/api/metrics",
    tags = ["Server metrics"],
)]
pub async fn record_metrics(
    rqctx: RequestContext<Arc<ApiState>>,
    body: TypedBody<RecordMetricsRequest>,
) -> Result<HttpResponseCreated<RecordMetricsResponse>, HttpError> {
    let api_state = rqctx.context();
    let body = body.into_inner();

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

    let recorded = epoch_milli();

    let new_metrics_storage = storage::server_metrics::ServerMetrics {
        id: 0,
        cpu_usage: body.cpu_usage as i64,
        memory_usage: body.memory_usage as i64,
        disk_usage: body.disk_usage as i64,
        network_in: body.network_in as i64,
        network_out: body.network_out as i64,
        active_connections: body.active_connections as i64,
        recorded: recorded.to_string(),
    };

    let id = match storage::server_metrics::insert(&mut conn, &new_metrics_storage).await {
        Ok(id) => id,
        Err(e) => {
            return Err(http_error!(
                "Could not insert object into database",
                rqctx.request_id,
                Some(e)
            ));
        }
    };

    let metrics = ServerMetrics {
        id: id as u64,
        cpu_usage: body.cpu_usage,
        memory_usage: body.memory_usage,
        disk_usage: body.disk_usage,
        network_in: body.network_in,
        network_out: body.network_out,
        active_connections: body.active_connections,
        recorded,
    };

    api_state
        .event_bus
        .clone()
        .publish(event_utils::Kind::RecordedServerMetrics {
            metrics_id: metrics.id,
        });

    Ok(HttpResponseCreated(RecordMetricsResponse { metrics }))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ListMetricsQueryArgs {
    /// Maximum number of samples to return, newest first. Capped server side.
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ListMetricsResponse {
    /// Metric samples, newest first.
    pub metrics: Vec<ServerMetrics>,
}

/// List recorded server metrics, newest first.
#[endpoint(
    method = GET,
    path = "/api/metrics",
    tags = ["Server metrics"],
)]
pub async fn list_metrics(
    rqctx: RequestContext<Arc<ApiState>>,
    query_params: Query<ListMetricsQueryArgs>,
) -> Result<HttpResponseOk<ListMetricsResponse>, HttpError> {
    let api_state = rqctx.context();
    let query = query_params.into_inner();

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

    let storage_metrics =
        match storage::server_metrics::list(&mut conn, query.limit.unwrap_or(0) as i64).await {
            Ok(metrics) => metrics,
            Err(e) => {
                return Err(http_error!(
                    "Could not get objects from database",
                    rqctx.request_id,
                    Some(e)
                ));
            }
        };

    let mut metrics: Vec<ServerMetrics> = vec![];

    for storage_sample in storage_metrics {
        let sample = ServerMetrics::try_from(storage_sample).map_err(|e| {
            http_error!(
                "Could not parse object from database",
                rqctx.request_id,
                Some(e)
            )
        })?;

        metrics.push(sample);
    }

    let resp = ListMetricsResponse { metrics };
    Ok(HttpResponseOk(resp))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct GetLatestMetricsResponse {
    /// The most recently recorded sample.
    pub metrics: ServerMetrics,
}

/// Get the most recently recorded server metrics sample.
#[endpoint(
    method = GET,
    path = "/api/metrics/latest",
    tags = ["Server metrics"],
)]
pub async fn get_latest_metrics(
    rqctx: RequestContext<Arc<ApiState>>,
) -> Result<HttpResponseOk<GetLatestMetricsResponse>, HttpError> {
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

    let storage_metrics = match storage::server_metrics::get_latest(&mut conn).await {
        Ok(metrics) => metrics,
        Err(e) => match e {
            storage::StorageError::NotFound => {
                return Err(HttpError::for_not_found(
                    None,
                    "No metrics samples have been recorded yet".into(),
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

    let metrics = ServerMetrics::try_from(storage_metrics).map_err(|e| {
        http_error!(
            "Could not parse object from database",
            rqctx.request_id,
            Some(e)
        )
    })?;

    let resp = GetLatestMetricsResponse { metrics };
    Ok(HttpResponseOk(resp))
}
