use crate::{
    api::{epoch_milli, event_utils, ApiState},
    http_error, storage,
};
use anyhow::{Context, Result};
use dropshot::{
    endpoint, HttpError, HttpResponseCreated, HttpResponseDeleted, HttpResponseOk, Path,
    RequestContext, TypedBody,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A point of interest is a named map location with an optional free-form annotation blob
/// attached. Coordinates are carried as strings exactly as clients report them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct PointOfInterest {
    /// Unique identifier for the point of interest, assigned by storage at creation.
    pub id: u64,

    /// Humanized name for the location.
    pub name: String,

    /// Short description of what is there.
    pub description: String,

    /// Free-form grouping label, e.g. 'logistics' or 'hazard'.
    pub category: String,

    /// Latitude as reported by the client.
    pub latitude: String,

    /// Longitude as reported by the client.
    pub longitude: String,

    /// Opaque annotation blob stored alongside the location.
    pub annotations: serde_json::Value,

    /// Time of creation in epoch milliseconds.
    pub created: u64,

    /// Time of last change in epoch milliseconds.
    pub modified: u64,
}

impl PointOfInterest {
    pub fn new(
        name: &str,
        description: &str,
        category: &str,
        latitude: &str,
        longitude: &str,
        annotations: serde_json::Value,
    ) -> Self {
        PointOfInterest {
            id: 0,
            name: name.into(),
            description: description.into(),
            category: category.into(),
            latitude: latitude.into(),
            longitude: longitude.into(),
            annotations,
            created: epoch_milli(),
            modified: epoch_milli(),
        }
    }
}

impl TryFrom<storage::pois::PointOfInterest> for PointOfInterest {
    type Error = anyhow::Error;

    fn try_from(value: storage::pois::PointOfInterest) -> Result<Self> {
        let id = value.id.try_into().with_context(|| {
            format!(
                "Could not parse field 'id' from storage value '{}'",
                value.id
            )
        })?;

        let annotations = serde_json::from_str(&value.annotations).with_context(|| {
            format!(
                "Could not parse field 'annotations' from storage value '{}'",
                value.annotations
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

        Ok(PointOfInterest {
            id,
            name: value.name,
            description: value.description,
            category: value.category,
            latitude: value.latitude,
            longitude: value.longitude,
            annotations,
            created,
            modified,
        })
    }
}

impl TryFrom<PointOfInterest> for storage::pois::PointOfInterest {
    type Error = anyhow::Error;

    fn try_from(value: PointOfInterest) -> Result<Self> {
        let id = value.id.try_into().with_context(|| {
            format!(
                "Could not parse field 'id' to storage value '{}'",
                value.id
            )
        })?;

        let annotations = serde_json::to_string(&value.annotations).with_context(|| {
            format!(
                "Could not parse field 'annotations' to storage value '{:#?}'",
                value.annotations
            )
        })?;

        Ok(Self {
            id,
            name: value.name,
            description: value.description,
            category: value.category,
            latitude: value.latitude,
            longitude: value.longitude,
            annotations,
            created: value.created.to_string(),
            modified: value.modified.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PoiPathArgs {
    /// The unique identifier for the target point of interest.
    pub poi_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ListPoisResponse {
    /// A list of all points of interest.
    pub pois: Vec<PointOfInterest>,
}

/// List all points of interest.
#[endpoint(
    method = GET,
    path = "/api/pois",
    tags = ["Points of interest"],
)]
pub async fn list_pois(
    rqctx: RequestContext<Arc<ApiState>>,
) -> Result<HttpResponseOk<ListPoisResponse>, HttpError> {
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

    let storage_pois = match storage::pois::list(&mut conn).await {
        Ok(pois) => pois,
        Err(e) => {
            return Err(http_error!(
                "Could not get objects from database",
                rqctx.request_id,
                Some(e)
            ));
        }
    };

    let mut pois: Vec<PointOfInterest> = vec![];

    for storage_poi in storage_pois {
        let poi = PointOfInterest::try_from(storage_poi).map_err(|e| {
            http_error!(
                "Could not parse object from database",
                rqctx.request_id,
                Some(e)
            )
        })?;

        pois.push(poi);
    }

    let resp = ListPoisResponse { pois };
    Ok(HttpResponseOk(resp))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct GetPoiResponse {
    /// The target point of interest.
    pub poi: PointOfInterest,
}

/// Get api point of interest by id.
#[endpoint(
    method = GET,
    path = "/api/pois/{poi_id}",
    tags = ["Points of interest"],
)]
pub async fn get_poi(
    rqctx: RequestContext<Arc<ApiState>>,
    path_params: Path<PoiPathArgs>,
) -> Result<HttpResponseOk<GetPoiResponse>, HttpError> {
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

    let storage_poi = match storage::pois::get(&mut conn, path.poi_id as i64).await {
        Ok(poi) => poi,
        Err(e) => match e {
            storage::StorageError::NotFound => {
                return Err(HttpError::for_not_found(
                    None,
                    "Point of interest entry for id given does not exist".into(),
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

    let poi = PointOfInterest::try_from(storage_poi).map_err(|e| {
        http_error!(
            "Could not parse object from database",
            rqctx.request_id,
            Some(e)
        )
    })?;

    let resp = GetPoiResponse { poi };
    Ok(HttpResponseOk(resp))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CreatePoiRequest {
    /// Humanized name for the location.
    pub name: String,

    /// Short description of what is there.
    pub description: Option<String>,

    /// Free-form grouping label, e.g. 'logistics' or 'hazard'.
    pub category: Option<String>,

    /// Latitude as reported by the client.
    pub latitude: String,

    /// Longitude as reported by the client.
    pub longitude: String,

    /// Opaque annotation blob stored alongside the location.
    pub annotations: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CreatePoiResponse {
    /// Information about the point of interest created.
    pub poi: PointOfInterest,
}

/// Create a new point of interest.
#[endpoint(
    method = POST,
    path = "/api/pois",
    tags = ["Points of interest"],
)]
pub async fn create_poi(
    rqctx: RequestContext<Arc<ApiState>>,
    body: TypedBody<CreatePoiRequest>,
) -> Result<HttpResponseCreated<CreatePoiResponse>, HttpError> {
    let api_state = rqctx.context();
    let body = body.into_inner();

    if body.name.is_empty() {
        return Err(HttpError::for_bad_request(
            None,
            "'name' cannot be empty".into(),
        ));
    }

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

    let mut new_poi = PointOfInterest::new(
        &body.name,
        &body.description.unwrap_or_default(),
        &body.category.unwrap_or_default(),
        &body.latitude,
        &body.longitude,
        body.annotations.unwrap_or(serde_json::json!({})),
    );

    let new_poi_storage = new_poi.clone().try_into().map_err(|e| {
        http_error!(
            "Could not parse object into database value",
            rqctx.request_id,
            Some::<anyhow::Error>(e)
        )
    })?;

    let id = match storage::pois::insert(&mut conn, &new_poi_storage).await {
        Ok(id) => id,
        Err(e) => {
            return Err(http_error!(
                "Could not insert object into database",
                rqctx.request_id,
                Some(e)
            ));
        }
    };

    new_poi.id = id as u64;

    api_state
        .event_bus
        .clone()
        .publish(event_utils::Kind::CreatedPointOfInterest { poi_id: new_poi.id });

    let resp = CreatePoiResponse { poi: new_poi };

    Ok(HttpResponseCreated(resp))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct UpdatePoiRequest {
    /// Humanized name for the location.
    pub name: Option<String>,

    /// Short description of what is there.
    pub description: Option<String>,

    /// Free-form grouping label, e.g. 'logistics' or 'hazard'.
    pub category: Option<String>,

    /// Latitude as reported by the client.
    pub latitude: Option<String>,

    /// Longitude as reported by the client.
    pub longitude: Option<String>,

    /// Opaque annotation blob stored alongside the location.
    pub annotations: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct UpdatePoiResponse {
    /// Information about the point of interest updated.
    pub poi: PointOfInterest,
}

/// Update a point of interest's details.
#[endpoint(
    method = PATCH,
    path = "/api/pois/{poi_id}",
    tags = ["Points of interest"],
)]
pub async fn update_poi(
    rqctx: RequestContext<Arc<ApiState>>,
    path_params: Path<PoiPathArgs>,
    body: TypedBody<UpdatePoiRequest>,
) -> Result<HttpResponseOk<UpdatePoiResponse>, HttpError> {
    let api_state = rqctx.context();
    let path = path_params.into_inner();
    let body = body.into_inner();

    let annotations = match body.annotations {
        Some(value) => Some(serde_json::to_string(&value).map_err(|e| {
            http_error!(
                "Could not parse object into database value",
                rqctx.request_id,
                Some(e)
            )
        })?),
        None => None,
    };

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

    let updatable_fields = storage::pois::UpdatableFields {
        name: body.name,
        description: body.description,
        category: body.category,
        latitude: body.latitude,
        longitude: body.longitude,
        annotations,
        modified: Some(epoch_milli().to_string()),
    };

    if let Err(e) = storage::pois::update(&mut conn, path.poi_id as i64, updatable_fields).await {
        match e {
            storage::StorageError::NotFound => {
                return Err(HttpError::for_not_found(
                    None,
                    "Point of interest entry for id given does not exist".into(),
                ));
            }
            _ => {
                return Err(http_error!(
                    "Could not update object in database",
                    rqctx.request_id,
                    Some(e)
                ));
            }
        }
    };

    let storage_poi = match storage::pois::get(&mut conn, path.poi_id as i64).await {
        Ok(poi) => poi,
        Err(e) => {
            return Err(http_error!(
                "Could not get object from database",
                rqctx.request_id,
                Some(e)
            ));
        }
    };

    let poi = PointOfInterest::try_from(storage_poi).map_err(|e| {
        http_error!(
            "Could not parse object from database",
            rqctx.request_id,
            Some(e)
        )
    })?;

    api_state
        .event_bus
        .clone()
        .publish(event_utils::Kind::UpdatedPointOfInterest {
            poi_id: path.poi_id,
        });

    let resp = UpdatePoiResponse { poi };

    Ok(HttpResponseOk(resp))
}

/// Delete api point of interest by id.
#[endpoint(
    method = DELETE,
    path = "/api/pois/{poi_id}",
    tags = ["Points of interest"],
)]
pub async fn delete_poi(
    rqctx: RequestContext<Arc<ApiState>>,
    path_params: Path<PoiPathArgs>,
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

    if let Err(e) = storage::pois::delete(&mut conn, path.poi_id as i64).await {
        match e {
            storage::StorageError::NotFound => {
                return Err(HttpError::for_not_found(
                    None,
                    "Point of interest entry for id given does not exist".into(),
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
        .publish(event_utils::Kind::DeletedPointOfInterest {
            poi_id: path.poi_id,
        });

    Ok(HttpResponseDeleted())
}
