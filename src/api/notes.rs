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

/// A note is a small piece of free-form operational text, optionally shared with everyone
/// connected to the same waypost instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct Note {
    /// Unique identifier for the note, assigned by storage at creation.
    pub id: u64,

    /// Short title for the note.
    pub title: String,

    /// The note body.
    pub content: String,

    /// Who wrote the note.
    pub author: String,

    /// Whether the note is visible to other operators.
    pub shared: bool,

    /// Time of note creation in epoch milliseconds.
    pub created: u64,

    /// Time of last change in epoch milliseconds.
    pub modified: u64,
}

impl Note {
    pub fn new(title: &str, content: &str, author: &str, shared: bool) -> Self {
        Note {
            id: 0,
            title: title.into(),
            content: content.into(),
            author: author.into(),
            shared,
            created: epoch_milli(),
            modified: epoch_milli(),
        }
    }
}

impl TryFrom<storage::notes::Note> for Note {
    type Error = anyhow::Error;

    fn try_from(value: storage::notes::Note) -> Result<Self> {
        let id = value.id.try_into().with_context(|| {
            format!(
                "Could not parse field 'id' from storage value '{}'",
                value.id
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

        Ok(Note {
            id,
            title: value.title,
            content: value.content,
            author: value.author,
            shared: value.shared,
            created,
            modified,
        })
    }
}

impl TryFrom<Note> for storage::notes::Note {
    type Error = anyhow::Error;

    fn try_from(value: Note) -> Result<Self> {
        let id = value.id.try_into().with_context(|| {
            format!(
                "Could not parse field 'id' to storage value '{}'",
                value.id
            )
        })?;

        Ok(Self {
            id,
            title: value.title,
            content: value.content,
            author: value.author,
            shared: value.shared,
            created: value.created.to_string(),
            modified: value.modified.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct NotePathArgs {
    /// The unique identifier for the target note.
    pub note_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ListNotesResponse {
    /// A list of all notes.
    pub notes: Vec<Note>,
}

/// List all notes.
#[endpoint(
    method = GET,
    path = "/api/notes",
    tags = ["Notes"],
)]
pub async fn list_notes(
    rqctx: RequestContext<Arc<ApiState>>,
) -> Result<HttpResponseOk<ListNotesResponse>, HttpError> {
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

    let storage_notes = match storage::notes::list(&mut conn).await {
        Ok(notes) => notes,
        Err(e) => {
            return Err(http_error!(
                "Could not get objects from database",
                rqctx.request_id,
                Some(e)
            ));
        }
    };

    let mut notes: Vec<Note> = vec![];

    for storage_note in storage_notes {
        let note = Note::try_from(storage_note).map_err(|e| {
            http_error!(
                "Could not parse object from database",
                rqctx.request_id,
                Some(e)
            )
        })?;

        notes.push(note);
    }

    let resp = ListNotesResponse { notes };
    Ok(HttpResponseOk(resp))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct GetNoteResponse {
    /// The target note.
    pub note: Note,
}

/// Get api note by id.
#[endpoint(
    method = GET,
    path = "/api/notes/{note_id}",
    tags = ["Notes"],
)]
pub async fn get_note(
    rqctx: RequestContext<Arc<ApiState>>,
    path_params: Path<NotePathArgs>,
) -> Result<HttpResponseOk<GetNoteResponse>, HttpError> {
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

    let storage_note = match storage::notes::get(&mut conn, path.note_id as i64).await {
        Ok(note) => note,
        Err(e) => match e {
            storage::StorageError::NotFound => {
                return Err(HttpError::for_not_found(
                    None,
                    "Note entry for id given does not exist".into(),
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

    let note = Note::try_from(storage_note).map_err(|e| {
        http_error!(
            "Could not parse object from database",
            rqctx.request_id,
            Some(e)
        )
    })?;

    let resp = GetNoteResponse { note };
    Ok(HttpResponseOk(resp))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CreateNoteRequest {
    /// Short title for the note.
    pub title: String,

    /// The note body.
    pub content: String,

    /// Who wrote the note.
    pub author: String,

    /// Whether the note is visible to other operators. Defaults to true.
    pub shared: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CreateNoteResponse {
    /// Information about the note created.
    pub note: Note,
}

/// Create a new note.
#[endpoint(
    method = POST,
    path = "/api/notes",
    tags = ["Notes"],
)]
pub async fn create_note(
    rqctx: RequestContext<Arc<ApiState>>,
    body: TypedBody<CreateNoteRequest>,
) -> Result<HttpResponseCreated<CreateNoteResponse>, HttpError> {
    let api_state = rqctx.context();
    let body = body.into_inner();

    if body.title.is_empty() {
        return Err(HttpError::for_bad_request(
            None,
            "'title' cannot be empty".into(),
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

    let mut new_note = Note::new(
        &body.title,
        &body.content,
        &body.author,
        body.shared.unwrap_or(true),
    );

    let new_note_storage = new_note.clone().try_into().map_err(|e| {
        http_error!(
            "Could not parse object into database value",
            rqctx.request_id,
            Some::<anyhow::Error>(e)
        )
    })?;

    let id = match storage::notes::insert(&mut conn, &new_note_storage).await {
        Ok(id) => id,
        Err(e) => {
            return Err(http_error!(
                "Could not insert object into database",
                rqctx.request_id,
                Some(e)
            ));
        }
    };

    new_note.id = id as u64;

    api_state
        .event_bus
        .clone()
        .publish(event_utils::Kind::CreatedNote {
            note_id: new_note.id,
        });

    let resp = CreateNoteResponse { note: new_note };

    Ok(HttpResponseCreated(resp))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct UpdateNoteRequest {
    /// Short title for the note.
    pub title: Option<String>,

    /// The note body.
    pub content: Option<String>,

    /// Who wrote the note.
    pub author: Option<String>,

    /// Whether the note is visible to other operators.
    pub shared: Option<bool>,
}

impl From<UpdateNoteRequest> for storage::notes::UpdatableFields {
    fn from(value: UpdateNoteRequest) -> Self {
        Self {
            title: value.title,
            content: value.content,
            author: value.author,
            shared: value.shared,
            modified: Some(epoch_milli().to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct UpdateNoteResponse {
    /// Information about the note updated.
    pub note: Note,
}

/// Update a note's details.
#[endpoint(
    method = PATCH,
    path = "/api/notes/{note_id}",
    tags = ["Notes"],
)]
pub async fn update_note(
    rqctx: RequestContext<Arc<ApiState>>,
    path_params: Path<NotePathArgs>,
    body: TypedBody<UpdateNoteRequest>,
) -> Result<HttpResponseOk<UpdateNoteResponse>, HttpError> {
    let api_state = rqctx.context();
    let path = path_params.into_inner();
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

    let updatable_fields = storage::notes::UpdatableFields::from(body);

    if let Err(e) = storage::notes::update(&mut conn, path.note_id as i64, updatable_fields).await {
        match e {
            storage::StorageError::NotFound => {
                return Err(HttpError::for_not_found(
                    None,
                    "Note entry for id given does not exist".into(),
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

    let storage_note = match storage::notes::get(&mut conn, path.note_id as i64).await {
        Ok(note) => note,
        Err(e) => {
            return Err(http_error!(
                "Could not get object from database",
                rqctx.request_id,
                Some(e)
            ));
        }
    };

    let note = Note::try_from(storage_note).map_err(|e| {
        http_error!(
            "Could not parse object from database",
            rqctx.request_id,
            Some(e)
        )
    })?;

    api_state
        .event_bus
        .clone()
        .publish(event_utils::Kind::UpdatedNote {
            note_id: path.note_id,
        });

    let resp = UpdateNoteResponse { note };

    Ok(HttpResponseOk(resp))
}

/// Delete api note by id.
#[endpoint(
    method = DELETE,
    path = "/api/notes/{note_id}",
    tags = ["Notes"],
)]
pub async fn delete_note(
    rqctx: RequestContext<Arc<ApiState>>,
    path_params: Path<NotePathArgs>,
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

    if let Err(e) = storage::notes::delete(&mut conn, path.note_id as i64).await {
        match e {
            storage::StorageError::NotFound => {
                return Err(HttpError::for_not_found(
                    None,
                    "Note entry for id given does not exist".into(),
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
        .publish(event_utils::Kind::DeletedNote {
            note_id: path.note_id,
        });

    Ok(HttpResponseDeleted())
}
