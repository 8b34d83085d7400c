//! API client for communicating with the vocabulary REST API.
//!
//! Every request goes through `ApiClient::execute`, which attaches the
//! bearer token on the way out and classifies the outcome on the way back.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::{header, Client, Method, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::Config;
use crate::models::{AuthResponse, LoginRequest, RegisterRequest, Vocabulary, VocabularyPage, VocabularyRequest};

use super::endpoints;
use super::ApiError;

// ============================================================================
// Constants
// ============================================================================

/// Initial backoff delay in milliseconds for rate limiting.
/// 1 second is polite to the server while not making users wait too long.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Page size used when the caller does not pick one
pub const DEFAULT_PAGE_SIZE: u32 = 20;

// ============================================================================
// Session capabilities
// ============================================================================

/// Supplies the bearer token for outbound requests.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// The token to attach, if any. An error here never fails the request;
    /// the client logs it and proceeds unauthenticated.
    async fn bearer_token(&self) -> Result<Option<String>>;
}

/// Told when the server rejects the held credential (HTTP 401 or 403).
#[async_trait]
pub trait InvalidationNotifier: Send + Sync {
    async fn session_invalidated(&self);
}

/// Success bodies arrive either bare or wrapped in `{"data": ...}`.
#[derive(Deserialize)]
#[serde(untagged)]
enum Envelope<T> {
    Wrapped { data: T },
    Bare(T),
}

impl<T> Envelope<T> {
    fn into_inner(self) -> T {
        match self {
            Envelope::Wrapped { data } => data,
            Envelope::Bare(inner) => inner,
        }
    }
}

/// One outbound call before credentials are attached.
#[derive(Debug)]
struct RequestEnvelope {
    method: Method,
    path: String,
    query: Vec<(&'static str, String)>,
    body: Option<serde_json::Value>,
}

impl RequestEnvelope {
    fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    fn query(mut self, key: &'static str, value: impl ToString) -> Self {
        self.query.push((key, value.to_string()));
        self
    }

    /// A body that cannot be serialized is a client-side construction failure.
    fn json<B: Serialize + ?Sized>(mut self, body: &B) -> Result<Self, ApiError> {
        let value = serde_json::to_value(body).map_err(|e| {
            warn!(path = %self.path, error = %e, "Failed to serialize request body");
            ApiError::Unexpected
        })?;
        self.body = Some(value);
        Ok(self)
    }
}

/// API client for the vocabulary server.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    credentials: Option<Arc<dyn CredentialProvider>>,
    notifier: Option<Arc<dyn InvalidationNotifier>>,
    max_retries: u32,
    initial_backoff: Duration,
}

impl ApiClient {
    /// Create a client using the base URL, timeout and retry settings from `config`.
    pub fn new(config: &Config) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            credentials: None,
            notifier: None,
            max_retries: config.max_rate_limit_retries,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        })
    }

    /// Attach a session capability pair. Without one, requests go out
    /// unauthenticated and 401/403 responses have no side effects.
    pub fn with_session<S>(mut self, session: Arc<S>) -> Self
    where
        S: CredentialProvider + InvalidationNotifier + 'static,
    {
        self.credentials = Some(session.clone() as Arc<dyn CredentialProvider>);
        self.notifier = Some(session as Arc<dyn InvalidationNotifier>);
        self
    }

    /// Override the delay before the first rate-limit retry. Doubles on each retry.
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Read the current token. Storage failures degrade to "no token".
    async fn bearer_token(&self) -> Option<String> {
        let provider = self.credentials.as_ref()?;
        match provider.bearer_token().await {
            Ok(Some(token)) if !token.is_empty() => Some(token),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "Failed to read token from storage, sending unauthenticated");
                None
            }
        }
    }

    /// Send the request, retrying on 429, and return the response if its
    /// status is a success. Any other outcome is classified here and only here.
    async fn execute(&self, request: &RequestEnvelope) -> Result<reqwest::Response, ApiError> {
        let url = self.url(&request.path);
        let mut retries = 0;
        let mut backoff = self.initial_backoff;

        loop {
            let mut builder = self
                .client
                .request(request.method.clone(), &url)
                .header(header::CONTENT_TYPE, "application/json");
            if !request.query.is_empty() {
                builder = builder.query(&request.query);
            }
            if let Some(ref body) = request.body {
                builder = builder.json(body);
            }
            match self.bearer_token().await {
                Some(token) => {
                    builder = builder.bearer_auth(token);
                    debug!("Token attached to request");
                }
                None => debug!("No token found in storage"),
            }

            debug!(method = %request.method, url = %url, "Sending request");
            let response = match builder.send().await {
                Ok(response) => response,
                Err(e) => {
                    let err = ApiError::from_transport(&e);
                    warn!(method = %request.method, url = %url, error = %e, "Request failed without a response");
                    return Err(err);
                }
            };

            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }

            if status == StatusCode::TOO_MANY_REQUESTS && retries < self.max_retries {
                retries += 1;
                warn!(url = %url, retry = retries, backoff_ms = backoff.as_millis() as u64, "Rate limited, backing off");
                tokio::time::sleep(backoff).await;
                backoff *= 2; // Exponential backoff
                continue;
            }

            return Err(self.reject(response).await);
        }
    }

    /// Classify an error response, ending the session on 401/403.
    async fn reject(&self, response: reqwest::Response) -> ApiError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let err = ApiError::from_status(status, &body);

        if err.is_session_ending() {
            warn!(status = status.as_u16(), "Server rejected credential, invalidating session");
            if let Some(ref notifier) = self.notifier {
                notifier.session_invalidated().await;
            }
        } else {
            debug!(status = status.as_u16(), message = %err, "Request rejected");
        }
        err
    }

    async fn parse<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiError> {
        let url = response.url().to_string();
        let text = response.text().await.map_err(|e| {
            warn!(url = %url, error = %e, "Failed to read response body");
            ApiError::from_transport(&e)
        })?;
        serde_json::from_str::<Envelope<T>>(&text)
            .map(Envelope::into_inner)
            .map_err(|e| {
                warn!(url = %url, error = %e, "Failed to parse JSON response");
                ApiError::Unexpected
            })
    }

    async fn call<T: DeserializeOwned>(&self, request: RequestEnvelope) -> Result<T, ApiError> {
        let response = self.execute(&request).await?;
        Self::parse(response).await
    }

    // ===== Authentication =====

    pub async fn login(&self, credentials: &LoginRequest) -> Result<AuthResponse, ApiError> {
        let request = RequestEnvelope::new(Method::POST, endpoints::LOGIN).json(credentials)?;
        self.call(request).await
    }

    pub async fn register(&self, data: &RegisterRequest) -> Result<AuthResponse, ApiError> {
        let request = RequestEnvelope::new(Method::POST, endpoints::REGISTER).json(data)?;
        self.call(request).await
    }

    // ===== Vocabulary =====

    /// Fetch one page of vocabulary, zero-based.
    pub async fn fetch_vocabulary(&self, page: u32, size: u32) -> Result<VocabularyPage, ApiError> {
        let request = RequestEnvelope::new(Method::GET, endpoints::VOCABULARY)
            .query("page", page)
            .query("size", size);
        self.call(request).await
    }

    pub async fn fetch_vocabulary_item(&self, id: i64) -> Result<Vocabulary, ApiError> {
        let request = RequestEnvelope::new(Method::GET, endpoints::vocabulary_item_path(id));
        self.call(request).await
    }

    pub async fn create_vocabulary(&self, data: &VocabularyRequest) -> Result<Vocabulary, ApiError> {
        let request = RequestEnvelope::new(Method::POST, endpoints::VOCABULARY).json(data)?;
        self.call(request).await
    }

    pub async fn update_vocabulary(&self, id: i64, data: &VocabularyRequest) -> Result<Vocabulary, ApiError> {
        let request =
            RequestEnvelope::new(Method::PUT, endpoints::vocabulary_item_path(id)).json(data)?;
        self.call(request).await
    }

    pub async fn delete_vocabulary(&self, id: i64) -> Result<(), ApiError> {
        let request = RequestEnvelope::new(Method::DELETE, endpoints::vocabulary_item_path(id));
        self.execute(&request).await?;
        Ok(())
    }
}
