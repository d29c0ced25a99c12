//! PostgREST (Supabase) backed store over a `(user_id, embedding)` table.

use super::RecordStore;
use crate::embedding::EnrolledEmbedding;
use crate::error::StoreError;
use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct RestStore {
    client: reqwest::Client,
    endpoint: String,
    key: String,
}

#[derive(Debug, Serialize)]
struct NewRow<'a> {
    user_id: &'a str,
    embedding: &'a [f32],
}

#[derive(Debug, Deserialize)]
struct Row {
    user_id: Value,
    embedding: EmbeddingColumn,
}

/// `float[]` columns come back as arrays, `vector`/text columns as the
/// rendered text `"[0.1, 0.2]"`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EmbeddingColumn {
    Array(Vec<f32>),
    Text(String),
}

/// Insert responses are either the bare inserted rows or a client-library
/// style `{ data, error }` envelope.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InsertResponse {
    Rows(Vec<Row>),
    Envelope {
        #[serde(default)]
        data: Option<Vec<Row>>,
        #[serde(default)]
        error: Option<Value>,
    },
}

impl RestStore {
    pub fn new(base_url: String, key: String, table: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        let endpoint = format!("{}/rest/v1/{}", base_url.trim_end_matches('/'), table);
        Ok(Self {
            client,
            endpoint,
            key,
        })
    }

    fn request(&self, method: reqwest::Method) -> reqwest::RequestBuilder {
        let req = self.client.request(method, &self.endpoint);
        if self.key.is_empty() {
            req
        } else {
            req.header("apikey", &self.key).bearer_auth(&self.key)
        }
    }
}

#[async_trait]
impl RecordStore for RestStore {
    async fn list(&self) -> Result<Vec<EnrolledEmbedding>, StoreError> {
        let read_err = |e: String| StoreError::ReadFailed(e);
        let resp = self
            .request(reqwest::Method::GET)
            .query(&[("select", "user_id,embedding")])
            .send()
            .await
            .map_err(|e| read_err(e.to_string()))?;
        let status = resp.status();
        let body = resp.text().await.map_err(|e| read_err(e.to_string()))?;
        if !status.is_success() {
            return Err(read_err(format!("{status}: {body}")));
        }
        parse_rows(&body)
    }

    async fn insert(&self, record: EnrolledEmbedding) -> Result<EnrolledEmbedding, StoreError> {
        let write_err = |e: String| StoreError::WriteFailed(e);
        let row = NewRow {
            user_id: &record.user_id,
            embedding: &record.vector,
        };
        let resp = self
            .request(reqwest::Method::POST)
            .header("Prefer", "return=representation")
            .json(&row)
            .send()
            .await
            .map_err(|e| write_err(e.to_string()))?;
        let status = resp.status();
        let body = resp.text().await.map_err(|e| write_err(e.to_string()))?;
        if !status.is_success() {
            return Err(write_err(format!("{status}: {body}")));
        }
        debug!("insert response: {body}");
        parse_insert(&body)
    }
}

fn row_to_record(row: Row) -> Result<EnrolledEmbedding, String> {
    let user_id = match row.user_id {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        other => return Err(format!("unexpected user_id {other}")),
    };
    let vector = match row.embedding {
        EmbeddingColumn::Array(v) => v,
        EmbeddingColumn::Text(text) => serde_json::from_str(&text)
            .map_err(|e| format!("embedding for {user_id}: {e}"))?,
    };
    Ok(EnrolledEmbedding { user_id, vector })
}

fn parse_rows(body: &str) -> Result<Vec<EnrolledEmbedding>, StoreError> {
    let rows: Vec<Row> =
        serde_json::from_str(body).map_err(|e| StoreError::ReadFailed(e.to_string()))?;
    rows.into_iter()
        .map(row_to_record)
        .collect::<Result<_, _>>()
        .map_err(StoreError::ReadFailed)
}

fn parse_insert(body: &str) -> Result<EnrolledEmbedding, StoreError> {
    let parsed: InsertResponse =
        serde_json::from_str(body).map_err(|e| StoreError::WriteFailed(e.to_string()))?;
    let rows = match parsed {
        InsertResponse::Rows(rows) => rows,
        InsertResponse::Envelope {
            error: Some(err), ..
        } if !err.is_null() => return Err(StoreError::WriteFailed(err.to_string())),
        InsertResponse::Envelope { data, .. } => data.unwrap_or_default(),
    };
    let row = rows
        .into_iter()
        .next()
        .ok_or_else(|| StoreError::WriteFailed("no rows inserted".to_string()))?;
    row_to_record(row).map_err(StoreError::WriteFailed)
}
