use std::future::Future;
use std::time::Duration;

use pgmeili_core::{Document, DocumentId};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Response, StatusCode, Url};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::error::{IndexError, IndexResult};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Operations the pipeline needs from a search index.
pub trait SearchIndex: Send + Sync {
    /// Add or replace whole documents.
    fn add_documents(
        &self,
        index: &str,
        primary_key: &str,
        docs: &[Document],
    ) -> impl Future<Output = IndexResult<TaskInfo>> + Send;

    /// Merge fields into stored documents, leaving absent fields alone.
    fn merge_documents(
        &self,
        index: &str,
        primary_key: &str,
        docs: &[Document],
    ) -> impl Future<Output = IndexResult<TaskInfo>> + Send;

    /// Delete one document by primary key.
    fn delete_document(
        &self,
        index: &str,
        id: &DocumentId,
    ) -> impl Future<Output = IndexResult<TaskInfo>> + Send;

    /// Index metadata, or `None` when the index does not exist.
    fn get_index(&self, index: &str) -> impl Future<Output = IndexResult<Option<IndexInfo>>> + Send;

    fn create_index(
        &self,
        index: &str,
        primary_key: &str,
    ) -> impl Future<Output = IndexResult<TaskInfo>> + Send;

    fn update_primary_key(
        &self,
        index: &str,
        primary_key: &str,
    ) -> impl Future<Output = IndexResult<TaskInfo>> + Send;

    /// Whether the index holds at least one document.
    fn has_documents(&self, index: &str) -> impl Future<Output = IndexResult<bool>> + Send;
}

/// Enqueued task returned by every write.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
    pub task_uid: u64,
    #[serde(default)]
    pub index_uid: Option<String>,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexInfo {
    pub uid: String,
    #[serde(default)]
    pub primary_key: Option<String>,
}

#[derive(Deserialize)]
struct DocumentsPage {
    #[serde(default)]
    results: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    message: String,
    #[serde(default)]
    code: Option<String>,
}

/// Meilisearch client configuration.
#[derive(Debug, Clone)]
pub struct MeiliConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl MeiliConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set the API key sent as a bearer token. Empty keys are ignored.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        let api_key = api_key.into();
        self.api_key = (!api_key.is_empty()).then_some(api_key);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// HTTP client for the Meilisearch REST API.
#[derive(Clone)]
pub struct MeiliClient {
    http: Client,
    base_url: Url,
}

impl MeiliClient {
    pub fn new(config: MeiliConfig) -> IndexResult<Self> {
        let base_url = Url::parse(&config.url)
            .map_err(|e| IndexError::InvalidConfig(format!("url {}: {}", config.url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(IndexError::InvalidConfig(format!("url {}", config.url)));
        }

        let mut builder = Client::builder().timeout(config.timeout);
        if let Some(key) = &config.api_key {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", key))
                .map_err(|_| IndexError::InvalidConfig("api key is not a valid header".into()))?;
            value.set_sensitive(true);

            let mut headers = HeaderMap::new();
            headers.insert(AUTHORIZATION, value);
            builder = builder.default_headers(headers);
        }

        Ok(Self {
            http: builder.build()?,
            base_url,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, segments: &[&str]) -> IndexResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| IndexError::InvalidConfig(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn documents_url(&self, index: &str, primary_key: &str) -> IndexResult<Url> {
        let mut url = self.url(&["indexes", index, "documents"])?;
        url.query_pairs_mut().append_pair("primaryKey", primary_key);
        Ok(url)
    }

    async fn task(response: Response) -> IndexResult<TaskInfo> {
        let task = check(response).await?.json::<TaskInfo>().await?;
        debug!(task = task.task_uid, index = ?task.index_uid, status = %task.status, "Enqueued task");
        Ok(task)
    }
}

/// Turn a non-2xx response into an error carrying the API message.
async fn check(response: Response) -> IndexResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(IndexError::RateLimited);
    }

    let body = response.text().await.unwrap_or_default();
    let (message, code) = match serde_json::from_str::<ApiErrorBody>(&body) {
        Ok(err) => (err.message, err.code),
        Err(_) => (body, None),
    };
    Err(IndexError::Api {
        status: status.as_u16(),
        code,
        message,
    })
}

impl SearchIndex for MeiliClient {
    async fn add_documents(
        &self,
        index: &str,
        primary_key: &str,
        docs: &[Document],
    ) -> IndexResult<TaskInfo> {
        let url = self.documents_url(index, primary_key)?;
        Self::task(self.http.post(url).json(docs).send().await?).await
    }

    async fn merge_documents(
        &self,
        index: &str,
        primary_key: &str,
        docs: &[Document],
    ) -> IndexResult<TaskInfo> {
        let url = self.documents_url(index, primary_key)?;
        Self::task(self.http.put(url).json(docs).send().await?).await
    }

    async fn delete_document(&self, index: &str, id: &DocumentId) -> IndexResult<TaskInfo> {
        let id = id.to_string();
        let url = self.url(&["indexes", index, "documents", &id])?;
        Self::task(self.http.delete(url).send().await?).await
    }

    async fn get_index(&self, index: &str) -> IndexResult<Option<IndexInfo>> {
        let url = self.url(&["indexes", index])?;
        let response = self.http.get(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(check(response).await?.json::<IndexInfo>().await?))
    }

    async fn create_index(&self, index: &str, primary_key: &str) -> IndexResult<TaskInfo> {
        let url = self.url(&["indexes"])?;
        let body = json!({ "uid": index, "primaryKey": primary_key });
        Self::task(self.http.post(url).json(&body).send().await?).await
    }

    async fn update_primary_key(&self, index: &str, primary_key: &str) -> IndexResult<TaskInfo> {
        let url = self.url(&["indexes", index])?;
        let body = json!({ "primaryKey": primary_key });
        Self::task(self.http.patch(url).json(&body).send().await?).await
    }

    async fn has_documents(&self, index: &str) -> IndexResult<bool> {
        let mut url = self.url(&["indexes", index, "documents"])?;
        url.query_pairs_mut().append_pair("limit", "1");
        let response = self.http.get(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        let page = check(response).await?.json::<DocumentsPage>().await?;
        Ok(!page.results.is_empty())
    }
}
