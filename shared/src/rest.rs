//! [`RemoteService`] over the backend's REST interface.
//!
//! Creates are sent as upserts on the `client_token` column, which carries the
//! operation's local id, so replaying a create after a crash returns the row the
//! first attempt inserted instead of a second one.
//!
//! Image uploads first push the file the shell saved to the storage endpoint,
//! under a path derived from the same token, and then insert the row pointing
//! at the stored object.

use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{debug, instrument, warn};

use crate::model::{EntityKind, EntityRef, ImageUploadDraft, OperationKind, RemoteId};
use crate::remote::{RemoteAck, RemoteError, RemoteService, RemoteWrite};

pub const CLIENT_TOKEN_COLUMN: &str = "client_token";
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct RestConfig {
    pub base_url: String,
    pub api_key: String,
    pub access_token: Option<String>,
    /// Storage bucket image files are uploaded to.
    pub image_bucket: String,
}

pub struct RestRemote {
    client: reqwest::Client,
    config: RestConfig,
}

/// Column a dependent row uses to point at its parent.
fn parent_column(kind: EntityKind) -> Option<&'static str> {
    match kind {
        EntityKind::HiveAction | EntityKind::HiveTransaction => Some("colmeia_id"),
        EntityKind::ImageUpload => Some("entity_id"),
        EntityKind::Hive | EntityKind::Profile => None,
    }
}

/// Row body for a write: the payload plus the idempotency token and resolved parent.
pub fn build_body(write: &RemoteWrite) -> Value {
    let op = &write.operation;
    let mut body = match &op.payload {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".into(), other.clone());
            map
        }
    };

    if op.operation_kind == OperationKind::Create {
        body.insert(
            CLIENT_TOKEN_COLUMN.into(),
            Value::String(write.idempotency_token().to_string()),
        );
    }
    if let (Some(column), Some(parent)) = (parent_column(op.entity_kind), &write.parent) {
        body.insert(column.into(), Value::String(parent.to_string()));
    }

    Value::Object(body)
}

fn target_of(write: &RemoteWrite) -> Result<RemoteId, RemoteError> {
    write
        .target
        .clone()
        .or_else(|| match &write.operation.target {
            Some(EntityRef::Remote(id)) => Some(id.clone()),
            _ => None,
        })
        .ok_or_else(|| RemoteError::Rejected {
            code: "MISSING_TARGET".into(),
            message: format!(
                "{} {:?} has no resolved target",
                write.operation.entity_kind, write.operation.operation_kind
            ),
        })
}

fn invalid_payload(e: &serde_json::Error) -> RemoteError {
    RemoteError::Rejected {
        code: "INVALID_PAYLOAD".into(),
        message: e.to_string(),
    }
}

/// Server id of the record an image belongs to.
fn image_owner(write: &RemoteWrite, draft: &ImageUploadDraft) -> Result<RemoteId, RemoteError> {
    match (&draft.entity, &write.parent) {
        (EntityRef::Remote(id), _) => Ok(id.clone()),
        (EntityRef::Local(_), Some(parent)) => Ok(parent.clone()),
        (EntityRef::Local(local), None) => Err(RemoteError::Rejected {
            code: "MISSING_PARENT".into(),
            message: format!("{local} has no server id"),
        }),
    }
}

fn extension(content_type: &str) -> &'static str {
    match content_type {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        "image/heic" => "heic",
        _ => "bin",
    }
}

/// Object path for an upload. Replays reuse it, so the upload is an overwrite.
pub fn image_object_path(
    write: &RemoteWrite,
    draft: &ImageUploadDraft,
) -> Result<String, RemoteError> {
    let owner = image_owner(write, draft)?;
    Ok(format!(
        "{owner}/{}.{}",
        write.idempotency_token(),
        extension(&draft.content_type)
    ))
}

/// Row for the `imagens` table: the stored object's path, never the device path.
pub fn image_row_body(
    write: &RemoteWrite,
    draft: &ImageUploadDraft,
    object_path: &str,
) -> Result<Value, RemoteError> {
    let mut body = match build_body(write) {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    body.remove("local_uri");
    body.remove("entity");
    body.insert(
        "entity_id".into(),
        Value::String(image_owner(write, draft)?.to_string()),
    );
    body.insert("storage_path".into(), Value::String(object_path.into()));
    Ok(Value::Object(body))
}

/// Reads the file behind a `file://` uri or plain path.
pub async fn read_image(local_uri: &str) -> Result<Vec<u8>, RemoteError> {
    let path = local_uri.strip_prefix("file://").unwrap_or(local_uri);
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(RemoteError::Rejected {
            code: "FILE_MISSING".into(),
            message: format!("{path} no longer exists"),
        }),
        Err(e) => Err(RemoteError::Network(format!("could not read {path}: {e}"))),
    }
}

fn id_from_row(row: &Value) -> Option<RemoteId> {
    match row.get("id")? {
        Value::String(s) => RemoteId::new(s.clone()).ok(),
        Value::Number(n) => RemoteId::new(n.to_string()).ok(),
        _ => None,
    }
}

impl RestRemote {
    pub fn new(config: RestConfig) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| RemoteError::Network(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn table_url(&self, kind: EntityKind) -> String {
        format!(
            "{}/rest/v1/{}",
            self.config.base_url.trim_end_matches('/'),
            kind.table()
        )
    }

    fn object_url(&self, object_path: &str) -> String {
        format!(
            "{}/storage/v1/object/{}/{object_path}",
            self.config.base_url.trim_end_matches('/'),
            self.config.image_bucket
        )
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let token = self
            .config
            .access_token
            .as_deref()
            .unwrap_or(&self.config.api_key);
        request
            .header("apikey", &self.config.api_key)
            .bearer_auth(token)
    }

    async fn send_checked(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, RemoteError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| RemoteError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "backend refused write");
            return Err(RemoteError::from_status(status.as_u16(), message));
        }
        Ok(response)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Vec<Value>, RemoteError> {
        let response = self.send_checked(request).await?;
        if response.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(Vec::new());
        }
        response
            .json::<Vec<Value>>()
            .await
            .map_err(|e| RemoteError::Network(format!("unreadable response: {e}")))
    }
}

impl RestRemote {
    /// Upserts a row on the idempotency token and returns its id.
    async fn upsert(&self, kind: EntityKind, body: &Value) -> Result<RemoteId, RemoteError> {
        let request = self
            .client
            .post(self.table_url(kind))
            .query(&[("on_conflict", CLIENT_TOKEN_COLUMN)])
            .header("Prefer", "resolution=merge-duplicates,return=representation")
            .json(body);
        let rows = self.send(request).await?;
        rows.first()
            .and_then(id_from_row)
            .ok_or_else(|| RemoteError::Network("create returned no row id".into()))
    }

    async fn upload_image(&self, write: &RemoteWrite) -> Result<RemoteId, RemoteError> {
        let draft: ImageUploadDraft =
            serde_json::from_value(write.operation.payload.clone()).map_err(|e| invalid_payload(&e))?;
        let object_path = image_object_path(write, &draft)?;
        let bytes = read_image(&draft.local_uri).await?;
        debug!(%object_path, size = bytes.len(), "uploading image");

        let request = self
            .client
            .post(self.object_url(&object_path))
            .header("Content-Type", &draft.content_type)
            .header("x-upsert", "true")
            .body(bytes);
        self.send_checked(request).await?;

        let body = image_row_body(write, &draft, &object_path)?;
        self.upsert(EntityKind::ImageUpload, &body).await
    }
}

#[async_trait::async_trait]
impl RemoteService for RestRemote {
    #[instrument(skip(self, write), fields(kind = %write.operation.entity_kind, token = %write.idempotency_token()))]
    async fn apply(&self, write: &RemoteWrite) -> Result<RemoteAck, RemoteError> {
        let op = &write.operation;
        let url = self.table_url(op.entity_kind);
        let body = build_body(write);

        match op.operation_kind {
            OperationKind::Create => {
                let remote_id = if op.entity_kind == EntityKind::ImageUpload {
                    self.upload_image(write).await?
                } else {
                    self.upsert(op.entity_kind, &body).await?
                };
                debug!(remote_id = %remote_id, "create applied");
                Ok(RemoteAck {
                    remote_id,
                    replayed: false,
                })
            }
            OperationKind::Update => {
                let target = target_of(write)?;
                let request = self
                    .client
                    .patch(&url)
                    .query(&[("id", format!("eq.{target}"))])
                    .header("Prefer", "return=minimal")
                    .json(&body);
                self.send(request).await?;
                Ok(RemoteAck {
                    remote_id: target,
                    replayed: false,
                })
            }
            OperationKind::Delete => {
                let target = target_of(write)?;
                let request = self
                    .client
                    .delete(&url)
                    .query(&[("id", format!("eq.{target}"))]);
                self.send(request).await?;
                Ok(RemoteAck {
                    remote_id: target,
                    replayed: false,
                })
            }
        }
    }
}
