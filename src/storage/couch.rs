//! HTTP document store backend.
//!
//! Speaks the CouchDB-style REST dialect: `HEAD`/`PUT` on a store path,
//! `_changes` feeds, `_rev`-guarded document writes, `revs_info` revision
//! listings and `attachments=true` document fetches. Revision copies are
//! stream-through: the fetch response body is piped into the write request
//! without being buffered.

use super::{
    ChangeBatch, ChangeEntry, Dataset, DatasetMetadata, DocumentStore,
    WriteOutcome,
};
use crate::config::{Credentials, ServiceConfig};
use crate::error::{Error, Result};
use crate::sequence::SeqToken;
use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

#[derive(Debug, Deserialize)]
struct ViewResponse {
    #[serde(default)]
    rows: Vec<ViewRow>,
}

#[derive(Debug, Deserialize)]
struct ViewRow {
    id: String,
    #[serde(default)]
    value: Option<DatasetMetadata>,
}

#[derive(Debug, Deserialize)]
struct ChangesResponse {
    #[serde(default)]
    results: Vec<ChangeEntry>,
    #[serde(default)]
    last_seq: Option<SeqToken>,
}

#[derive(Debug, Deserialize)]
struct WriteResponse {
    rev: String,
}

#[derive(Debug, Deserialize)]
struct RevsInfoResponse {
    #[serde(rename = "_revs_info", default)]
    revs_info: Vec<RevInfo>,
}

#[derive(Debug, Deserialize)]
struct RevInfo {
    rev: String,
    status: String,
}

/// Document store reached over HTTP.
#[derive(Clone)]
pub struct CouchStore {
    client: Client,
    root: Url,
    catalog_db: String,
    catalog_view: String,
    credentials: Option<Credentials>,
}

impl CouchStore {
    /// Build a client from service configuration
    pub fn new(config: &ServiceConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();

        if let Some(vhost) = &config.store.vhost {
            let value = HeaderValue::from_str(vhost)
                .map_err(|e| Error::config(format!("Invalid vhost '{}': {}", vhost, e)))?;
            headers.insert(header::HOST, value);
        }
        headers.insert(
            header::USER_AGENT,
            HeaderValue::from_static(concat!("revvault/", env!("CARGO_PKG_VERSION"))),
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            client,
            root: config.root_url()?,
            catalog_db: config.catalog.database.clone(),
            catalog_view: config.catalog.view.clone(),
            credentials: config.get_credentials(),
        })
    }

    /// URL of a store, optionally followed by a document id and more segments.
    pub fn url(&self, store: &str, doc_id: Option<&str>, rest: &[&str]) -> Result<Url> {
        let mut url = self.root.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| Error::config(format!("{} cannot be a base URL", self.root)))?;
            segments.pop_if_empty().push(store);
            if let Some(id) = doc_id {
                segments.extend(doc_segments(id));
            }
            segments.extend(rest);
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.credentials {
            Some(c) => builder.basic_auth(&c.username, Some(&c.password)),
            None => builder,
        }
    }

    /// PUT a JSON document; an existing document counts as success.
    pub async fn put_json(&self, store: &str, doc_id: &str, body: &Value) -> Result<()> {
        let url = self.url(store, Some(doc_id), &[])?;
        let response = self.request(Method::PUT, url).json(body).send().await?;
        if response.status() == StatusCode::CONFLICT {
            debug!("{}/{} already present", store, doc_id);
            return Ok(());
        }
        expect_success(response).await?;
        Ok(())
    }
}

/// Design and local documents keep their prefix as a separate path segment.
fn doc_segments(id: &str) -> Vec<&str> {
    for prefix in ["_design/", "_local/"] {
        if let Some(name) = id.strip_prefix(prefix) {
            return vec![&prefix[..prefix.len() - 1], name];
        }
    }
    vec![id]
}

async fn expect_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();
    Err(Error::Status { status, url, body })
}

#[async_trait]
impl DocumentStore for CouchStore {
    async fn list_datasets(&self) -> Result<Vec<Dataset>> {
        let view: Vec<&str> = self.catalog_view.split('/').filter(|s| !s.is_empty()).collect();
        let url = self.url(&self.catalog_db, None, &view)?;
        let response = expect_success(self.request(Method::GET, url).send().await?).await?;
        let view: ViewResponse = response.json().await?;
        Ok(view
            .rows
            .into_iter()
            .map(|row| Dataset::new(row.id, row.value.unwrap_or_default()))
            .collect())
    }

    async fn read_metadata(&self, dataset_id: &str) -> Result<DatasetMetadata> {
        let url = self.url(&self.catalog_db, Some(dataset_id), &[])?;
        let response = expect_success(self.request(Method::GET, url).send().await?).await?;
        Ok(response.json().await?)
    }

    async fn write_metadata(&self, dataset_id: &str, metadata: &DatasetMetadata) -> Result<String> {
        let url = self.url(&self.catalog_db, Some(dataset_id), &[])?;
        let response = self.request(Method::PUT, url).json(metadata).send().await?;
        if response.status() == StatusCode::CONFLICT {
            return Err(Error::Conflict(dataset_id.to_string()));
        }
        let written: WriteResponse = expect_success(response).await?.json().await?;
        Ok(written.rev)
    }

    async fn store_exists(&self, store: &str) -> Result<bool> {
        let url = self.url(store, None, &[])?;
        let response = self.request(Method::HEAD, url).send().await?;
        trace!("probe {} -> {}", store, response.status());
        Ok(response.status().is_success())
    }

    async fn create_store(&self, store: &str) -> Result<()> {
        let url = self.url(store, None, &[])?;
        let response = self.request(Method::PUT, url).send().await?;
        if response.status() == StatusCode::PRECONDITION_FAILED {
            debug!("store {} already exists", store);
            return Ok(());
        }
        expect_success(response).await?;
        Ok(())
    }

    async fn changes_since(
        &self,
        store: &str,
        since: &SeqToken,
        limit: Option<usize>,
    ) -> Result<ChangeBatch> {
        let mut url = self.url(store, None, &["_changes"])?;
        url.query_pairs_mut().append_pair("since", since.as_str());
        if let Some(limit) = limit {
            url.query_pairs_mut().append_pair("limit", &limit.to_string());
        }
        let response = expect_success(self.request(Method::GET, url).send().await?).await?;
        let changes: ChangesResponse = response.json().await?;
        Ok(ChangeBatch {
            entries: changes.results,
            last_seq: changes.last_seq,
        })
    }

    async fn list_revisions(&self, store: &str, doc_id: &str) -> Result<Vec<String>> {
        let mut url = self.url(store, Some(doc_id), &[])?;
        url.query_pairs_mut().append_pair("revs_info", "true");
        let response = expect_success(self.request(Method::GET, url).send().await?).await?;
        let info: RevsInfoResponse = response.json().await?;
        Ok(info
            .revs_info
            .into_iter()
            .filter(|r| r.status == "available")
            .map(|r| r.rev)
            .collect())
    }

    async fn copy_revision(
        &self,
        source: &str,
        doc_id: &str,
        rev: &str,
        target: &str,
        target_key: &str,
    ) -> Result<WriteOutcome> {
        let mut from = self.url(source, Some(doc_id), &[])?;
        from.query_pairs_mut()
            .append_pair("rev", rev)
            .append_pair("attachments", "true")
            .append_pair("revs", "true");

        let fetched = self
            .request(Method::GET, from)
            .header(header::ACCEPT, "application/json")
            .send()
            .await?;
        let fetched = expect_success(fetched).await?;
        let content_type = fetched.headers().get(header::CONTENT_TYPE).cloned();

        let transferred = Arc::new(AtomicU64::new(0));
        let counter = transferred.clone();
        let body = fetched.bytes_stream().inspect_ok(move |chunk: &Bytes| {
            counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        });

        let mut to = self.url(target, Some(target_key), &[])?;
        to.query_pairs_mut().append_pair("new_edits", "false");
        let mut write = self
            .request(Method::PUT, to)
            .body(reqwest::Body::wrap_stream(body));
        if let Some(content_type) = content_type {
            write = write.header(header::CONTENT_TYPE, content_type);
        }

        let response = write.send().await?;
        if response.status() == StatusCode::CONFLICT {
            return Ok(WriteOutcome::AlreadyPresent);
        }
        expect_success(response).await?;
        trace!(
            "streamed {} bytes {}/{} -> {}/{}",
            transferred.load(Ordering::Relaxed),
            source,
            doc_id,
            target,
            target_key
        );
        Ok(WriteOutcome::Created)
    }
}
