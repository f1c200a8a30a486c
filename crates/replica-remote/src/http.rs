//! HTTP implementation of [`RemoteDataSource`].
//!
//! Routes, relative to the base URL:
//!
//! | operation        | request                                   |
//! |------------------|-------------------------------------------|
//! | `fetch_one`      | `GET {ns}/{collection}/{id}`              |
//! | `fetch_many`     | `GET {ns}/{collection}?ids=1,2`           |
//! | `fetch_by_query` | `POST {ns}/{collection}/query`            |
//! | `insert`         | `POST {ns}/{collection}`                  |
//! | `update`         | `PATCH {ns}/{collection}/{id}`            |
//! | `delete`         | `DELETE {ns}/{collection}/{id}`           |

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use replica_cache::{CollectionPath, QueryDescriptor, Record, RecordId, RemoteDataSource, RemoteError};

/// Attempts per request: the initial one plus three retries.
const MAX_ATTEMPTS: u32 = 4;

/// Error body returned by the server.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    message: String,
}

/// A failed attempt and whether another one may succeed.
struct Failure {
    error: RemoteError,
    retryable: bool,
}

/// Remote data source speaking JSON over HTTP.
pub struct HttpDataSource {
    http: Client,
    base_url: Url,
    token: Option<String>,
}

impl HttpDataSource {
    /// Create a data source rooted at `base_url`.
    pub fn new(base_url: &str) -> Result<Self, RemoteError> {
        let base_url = Url::parse(base_url).map_err(|e| {
            RemoteError::Transport(format!("invalid base url {}: {}", base_url, e))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(RemoteError::Transport(format!(
                "base url {} cannot take a path",
                base_url
            )));
        }

        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| RemoteError::Transport(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url,
            token: None,
        })
    }

    /// Send `token` as a bearer token with every request.
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    fn url(&self, collection: &CollectionPath, tail: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        // Checked in `new`
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .push(&collection.namespace)
                .push(&collection.name)
                .extend(tail);
        }
        url
    }

    /// Send a request, retrying transient failures with backoff.
    async fn send(
        &self,
        operation: &'static str,
        collection: &CollectionPath,
        id: Option<&RecordId>,
        build: impl Fn() -> RequestBuilder + Send + Sync,
    ) -> Result<Response, RemoteError> {
        let mut last_error = None;
        for attempt in 0..MAX_ATTEMPTS {
            let mut request = build();
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }

            let failure = match request.send().await {
                Ok(response) => match Self::check(response, collection, id).await {
                    Ok(response) => return Ok(response),
                    Err(failure) => failure,
                },
                Err(e) => Failure {
                    error: RemoteError::Transport(e.to_string()),
                    retryable: true,
                },
            };

            if !failure.retryable || attempt + 1 == MAX_ATTEMPTS {
                return Err(failure.error);
            }
            let backoff_ms = 500 * (1 << attempt); // 500ms, 1s, 2s
            warn!(
                attempt = attempt + 1,
                backoff_ms,
                error = %failure.error,
                "transient error in {}, retrying",
                operation
            );
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            last_error = Some(failure.error);
        }

        Err(last_error.unwrap_or_else(|| RemoteError::InvalidResponse("retry exhausted".into())))
    }

    /// Turn an unsuccessful status into a typed error.
    async fn check(
        response: Response,
        collection: &CollectionPath,
        id: Option<&RecordId>,
    ) -> Result<Response, Failure> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok());
            return Err(Failure {
                error: RemoteError::RateLimited { retry_after_secs },
                retryable: false,
            });
        }

        if status == StatusCode::NOT_FOUND {
            return Err(Failure {
                error: RemoteError::NotFound {
                    collection: collection.to_string(),
                    id: id.map(ToString::to_string).unwrap_or_default(),
                },
                retryable: false,
            });
        }

        let retryable = status.is_server_error();
        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => {
                return Err(Failure {
                    error: RemoteError::InvalidResponse(format!(
                        "request failed ({}): failed to read response: {}",
                        status, e
                    )),
                    retryable,
                });
            }
        };

        let error = match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => RemoteError::Query {
                code: body.error,
                message: body.message,
            },
            Err(_) => RemoteError::InvalidResponse(format!("request failed ({}): {}", status, text)),
        };
        Err(Failure { error, retryable })
    }
}

async fn decode_record(response: Response) -> Result<Record, RemoteError> {
    let value: Value = response
        .json()
        .await
        .map_err(|e| RemoteError::InvalidResponse(format!("undecodable record: {}", e)))?;
    Record::try_from(value).map_err(|e| RemoteError::InvalidResponse(e.to_string()))
}

async fn decode_records(response: Response) -> Result<Vec<Record>, RemoteError> {
    let values: Vec<Value> = response
        .json()
        .await
        .map_err(|e| RemoteError::InvalidResponse(format!("undecodable record list: {}", e)))?;
    values
        .into_iter()
        .map(|value| {
            Record::try_from(value).map_err(|e| RemoteError::InvalidResponse(e.to_string()))
        })
        .collect()
}

#[async_trait]
impl RemoteDataSource for HttpDataSource {
    async fn fetch_one(
        &self,
        collection: &CollectionPath,
        id: &RecordId,
    ) -> Result<Option<Record>, RemoteError> {
        let key = id.to_string();
        let url = self.url(collection, &[key.as_str()]);
        debug!(collection = %collection, id = %id, "fetching record");

        match self
            .send("fetch_one", collection, Some(id), || self.http.get(url.clone()))
            .await
        {
            Ok(response) => decode_record(response).await.map(Some),
            Err(RemoteError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn fetch_many(
        &self,
        collection: &CollectionPath,
        ids: &[RecordId],
    ) -> Result<Vec<Record>, RemoteError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let joined = ids
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let url = self.url(collection, &[]);
        debug!(collection = %collection, count = ids.len(), "fetching records by id");

        let response = self
            .send("fetch_many", collection, None, || {
                self.http.get(url.clone()).query(&[("ids", &joined)])
            })
            .await?;
        decode_records(response).await
    }

    async fn fetch_by_query(
        &self,
        collection: &CollectionPath,
        query: &QueryDescriptor,
    ) -> Result<Vec<Record>, RemoteError> {
        let url = self.url(collection, &["query"]);
        debug!(collection = %collection, filters = query.filters.len(), "running query");

        let response = self
            .send("fetch_by_query", collection, None, || {
                self.http.post(url.clone()).json(query)
            })
            .await?;
        decode_records(response).await
    }

    async fn insert(
        &self,
        collection: &CollectionPath,
        fields: Map<String, Value>,
    ) -> Result<Record, RemoteError> {
        let url = self.url(collection, &[]);
        debug!(collection = %collection, "inserting record");

        let response = self
            .send("insert", collection, None, || {
                self.http.post(url.clone()).json(&fields)
            })
            .await?;
        decode_record(response).await
    }

    async fn update(
        &self,
        collection: &CollectionPath,
        id: &RecordId,
        fields: Map<String, Value>,
    ) -> Result<Record, RemoteError> {
        let key = id.to_string();
        let url = self.url(collection, &[key.as_str()]);
        debug!(collection = %collection, id = %id, "updating record");

        let response = self
            .send("update", collection, Some(id), || {
                self.http.patch(url.clone()).json(&fields)
            })
            .await?;
        decode_record(response).await
    }

    async fn delete(&self, collection: &CollectionPath, id: &RecordId) -> Result<(), RemoteError> {
        let key = id.to_string();
        let url = self.url(collection, &[key.as_str()]);
        debug!(collection = %collection, id = %id, "deleting record");

        self.send("delete", collection, Some(id), || self.http.delete(url.clone()))
            .await?;
        Ok(())
    }
}
