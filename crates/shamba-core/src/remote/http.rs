use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::{RemoteCollection, RemoteError, RemoteResult};
use crate::error::{Error, Result};
use crate::isolation::RequestScope;
use crate::models::{ListFilters, RecordId, SyncRecord};
use crate::util::{compact_text, is_http_url, normalize_text_option};

/// JSON-over-HTTP remote serving every collection under
/// `{base}/v1/{collection}`.
#[derive(Clone)]
pub struct HttpRemote {
    base_url: String,
    client: reqwest::Client,
}

impl HttpRemote {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let base_url = normalize_base_url(base_url.into())?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| Error::Config(format!("failed to build HTTP client: {error}")))?;
        Ok(Self { base_url, client })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn collection_url(&self, collection: &str, id: Option<&RecordId>) -> String {
        match id {
            Some(id) => format!(
                "{}/v1/{collection}/{}",
                self.base_url,
                urlencoding::encode(id.as_str())
            ),
            None => format!("{}/v1/{collection}", self.base_url),
        }
    }

    fn request(
        &self,
        method: Method,
        url: &str,
        scope: &RequestScope,
        filters: Option<&ListFilters>,
    ) -> RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{url}?{}", scope_query(scope, filters)))
            .header("Accept", "application/json");
        for (name, value) in scope.headers() {
            builder = builder.header(name, value);
        }
        builder
    }
}

#[async_trait]
impl<R: SyncRecord> RemoteCollection<R> for HttpRemote {
    async fn list(&self, scope: &RequestScope, filters: &ListFilters) -> RemoteResult<Vec<R>> {
        let url = self.collection_url(R::COLLECTION, None);
        let response = self
            .request(Method::GET, &url, scope, Some(filters))
            .send()
            .await?;
        let payload: ListPayload<R> = read_json(response, R::COLLECTION).await?;
        Ok(payload.into_records())
    }

    async fn get(&self, scope: &RequestScope, id: &RecordId) -> RemoteResult<Option<R>> {
        let url = self.collection_url(R::COLLECTION, Some(id));
        let response = self.request(Method::GET, &url, scope, None).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        read_json(response, id.as_str()).await.map(Some)
    }

    async fn create(&self, scope: &RequestScope, record: &R) -> RemoteResult<R> {
        let url = self.collection_url(R::COLLECTION, None);
        let response = self
            .request(Method::POST, &url, scope, None)
            .json(record)
            .send()
            .await?;
        read_json(response, record.id().as_str()).await
    }

    async fn update(
        &self,
        scope: &RequestScope,
        id: &RecordId,
        patch: &R::Patch,
    ) -> RemoteResult<R> {
        let url = self.collection_url(R::COLLECTION, Some(id));
        let response = self
            .request(Method::PATCH, &url, scope, None)
            .json(patch)
            .send()
            .await?;
        read_json(response, id.as_str()).await
    }

    async fn delete(&self, scope: &RequestScope, id: &RecordId) -> RemoteResult<()> {
        let url = self.collection_url(R::COLLECTION, Some(id));
        let response = self
            .request(Method::DELETE, &url, scope, None)
            .send()
            .await?;
        ensure_success(response, id.as_str()).await.map(|_| ())
    }
}

/// List responses are accepted either bare or wrapped in `{"data": [...]}`
#[derive(Deserialize)]
#[serde(untagged, bound = "R: DeserializeOwned")]
enum ListPayload<R> {
    Bare(Vec<R>),
    Wrapped { data: Vec<R> },
}

impl<R> ListPayload<R> {
    fn into_records(self) -> Vec<R> {
        match self {
            Self::Bare(records) | Self::Wrapped { data: records } => records,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

async fn read_json<T: DeserializeOwned>(response: Response, subject: &str) -> RemoteResult<T> {
    let response = ensure_success(response, subject).await?;
    response
        .json::<T>()
        .await
        .map_err(|error| RemoteError::InvalidPayload(error.to_string()))
}

async fn ensure_success(response: Response, subject: &str) -> RemoteResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(RemoteError::NotFound(subject.to_string()));
    }
    let body = response.text().await.unwrap_or_default();
    Err(RemoteError::Status {
        status: status.as_u16(),
        message: parse_api_error(status, &body),
    })
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return format!("{} ({})", compact_text(&message), status.as_u16());
        }
    }

    let trimmed = compact_text(body);
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{trimmed} ({})", status.as_u16())
    }
}

fn scope_query(scope: &RequestScope, filters: Option<&ListFilters>) -> String {
    let mut pairs = vec![
        format!("tenant_id={}", urlencoding::encode(scope.tenant_id.as_str())),
        format!("owner_id={}", urlencoding::encode(scope.owner_id.as_str())),
    ];
    if let Some(filters) = filters {
        pairs.extend(filters.iter().map(|(field, value)| {
            format!("{}={}", urlencoding::encode(field), urlencoding::encode(value))
        }));
    }
    pairs.join("&")
}

fn normalize_base_url(raw: String) -> Result<String> {
    let base_url = normalize_text_option(Some(raw))
        .ok_or_else(|| Error::Config("API base URL must not be empty".to_string()))?;
    if is_http_url(&base_url) {
        Ok(base_url.trim_end_matches('/').to_string())
    } else {
        Err(Error::Config(
            "API base URL must include http:// or https://".to_string(),
        ))
    }
}
