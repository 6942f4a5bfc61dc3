//! Session client for the grievance desk REST API.
//!
//! Every authenticated call goes through `SessionClient`. It owns interceptor
//! logic only and knows nothing about individual endpoints.

use std::sync::Arc;

use anyhow::Result;
use futures::FutureExt;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::auth::CredentialStore;
use crate::config::ClientConfig;

use super::refresh::{RefreshCoordinator, RefreshOutcome, RefreshRole, RefreshState};
use super::request::{default_headers, intercept_request, ApiRequest, MultipartForm, RequestBody, RetryState};
use super::shapes::{self, AuthPayload};
use super::ApiError;

/// Shown to the user when the session cannot be renewed.
const SESSION_EXPIRED_MESSAGE: &str = "Your session has expired. Please log in again.";

/// API client with bearer auth and transparent token refresh.
/// Clone is cheap - clones share the connection pool, credential store and
/// refresh coordinator.
#[derive(Clone)]
pub struct SessionClient {
    inner: Arc<Inner>,
    refresh: Arc<RefreshCoordinator>,
}

/// Transport state the refresh future captures. Must not reference the
/// coordinator, which owns that future through its ticket.
struct Inner {
    http: Client,
    config: ClientConfig,
    store: CredentialStore,
    defaults: HeaderMap,
}

impl SessionClient {
    pub fn new(config: ClientConfig, store: CredentialStore) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .cookie_store(config.with_credentials)
            .build()?;

        Ok(Self {
            inner: Arc::new(Inner {
                http,
                config,
                store,
                defaults: default_headers(),
            }),
            refresh: Arc::new(RefreshCoordinator::new()),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &CredentialStore {
        &self.inner.store
    }

    pub fn refresh_state(&self) -> RefreshState {
        self.refresh.state()
    }

    /// Refresh calls this client has issued.
    pub fn refresh_count(&self) -> u64 {
        self.refresh.refresh_count()
    }

    // ===== Request pipeline =====

    /// Send `request` and return the JSON payload of the success response
    /// (`Value::Null` for an empty body).
    ///
    /// A 401 on a non-auth route triggers at most one refresh-and-retry.
    pub async fn send(&self, request: ApiRequest) -> Result<Value, ApiError> {
        let mut retry = RetryState::default();
        let mut token = self.inner.store.access_token();

        loop {
            let response = self.inner.dispatch(&request, token.as_deref()).await?;
            let status = response.status();

            if status.is_success() {
                return read_payload(response).await;
            }

            let body = error_body(response).await;
            let error = ApiError::from_response(status, &body);

            if self.inner.config.is_auth_route(&request.path) {
                debug!(path = %request.path, status = %status, "Auth route failed, not refreshing");
                return Err(error);
            }

            if status != StatusCode::UNAUTHORIZED || retry.attempted {
                if retry.attempted {
                    warn!(path = %request.path, "Unauthorized again after token refresh");
                }
                return Err(error);
            }

            retry.attempted = true;
            token = Some(self.refresh_access_token().await?);
            debug!(path = %request.path, "Retrying request with refreshed token");
        }
    }

    /// Send `request` and deserialize the success payload into `T`.
    pub async fn send_as<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, ApiError> {
        let payload = self.send(request).await?;
        serde_json::from_value(payload)
            .map_err(|e| ApiError::invalid_response(StatusCode::OK, e))
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send_as(ApiRequest::get(path)).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let request = ApiRequest::post(path).json(body).map_err(ApiError::invalid_request)?;
        self.send_as(request).await
    }

    pub async fn put<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let request = ApiRequest::put(path).json(body).map_err(ApiError::invalid_request)?;
        self.send_as(request).await
    }

    pub async fn patch<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let request = ApiRequest::patch(path).json(body).map_err(ApiError::invalid_request)?;
        self.send_as(request).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send_as(ApiRequest::delete(path)).await
    }

    /// POST a multipart form with the upload timeout.
    pub async fn upload<T: DeserializeOwned>(
        &self,
        path: &str,
        form: MultipartForm,
    ) -> Result<T, ApiError> {
        self.send_as(ApiRequest::post(path).multipart(form)).await
    }

    // ===== Refresh =====

    /// Obtain a new access token, joining a refresh already in flight.
    async fn refresh_access_token(&self) -> RefreshOutcome {
        let inner = Arc::clone(&self.inner);
        let (role, outcome) = self
            .refresh
            .join_or_start(move || run_refresh(inner).boxed());

        if role == RefreshRole::Waiter {
            debug!("Waiting for in-flight token refresh");
        }
        outcome.await
    }
}

/// Body of the single refresh call. Runs exactly once per ticket, so the
/// credential writes and the forced-logout broadcast happen once no matter
/// how many requests are waiting.
async fn run_refresh(inner: Arc<Inner>) -> RefreshOutcome {
    match inner.request_new_tokens().await {
        Ok(body) => {
            let payload = AuthPayload::extract(&body);
            let Some(access_token) = payload.access_token else {
                return Err(inner.expire_session("refresh response carried no access token"));
            };
            if !inner.store.set_access_token(Some(&access_token)) {
                warn!("Could not persist refreshed access token");
            }
            if let Some(ref refresh_token) = payload.refresh_token {
                inner.store.set_refresh_token(Some(refresh_token));
            }
            if let Some(user) = shapes::user_value(&body) {
                inner.store.merge_user_json(user);
            }
            debug!(rotated = payload.refresh_token.is_some(), "Access token refreshed");
            Ok(access_token)
        }
        Err(e) => Err(inner.expire_session(&e.to_string())),
    }
}

impl Inner {
    /// Request interceptor plus transport. Transport failures come back as
    /// `NETWORK_ERROR`; any HTTP status is returned as a response.
    async fn dispatch(&self, request: &ApiRequest, token: Option<&str>) -> Result<Response, ApiError> {
        let headers = intercept_request(&self.defaults, request, token)
            .map_err(ApiError::invalid_request)?;
        let url = self.config.url_for(&request.path);
        let timeout = request.timeout.unwrap_or(if request.body.is_multipart() {
            self.config.upload_timeout
        } else {
            self.config.timeout
        });

        let mut builder = self
            .http
            .request(request.method.clone(), &url)
            .headers(headers)
            .timeout(timeout);

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }

        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => {
                let bytes = serde_json::to_vec(value).map_err(ApiError::invalid_request)?;
                builder.body(bytes)
            }
            RequestBody::Multipart(form) => {
                builder.multipart(form.to_form().map_err(ApiError::invalid_request)?)
            }
        };

        debug!(method = %request.method, url = %url, authorized = token.is_some(), "Sending request");

        builder.send().await.map_err(|e| {
            warn!(method = %request.method, url = %url, error = %e, "Request failed without response");
            ApiError::from_transport(&e)
        })
    }

    /// Call the refresh endpoint. Only a 2xx body comes back as `Ok`.
    async fn request_new_tokens(&self) -> Result<Value, ApiError> {
        let mut request = ApiRequest::post(self.config.refresh_path.clone());

        if let Some(refresh_token) = self.store.refresh_token() {
            let name = reqwest::header::HeaderName::from_bytes(self.config.refresh_token_header.as_bytes())
                .map_err(ApiError::invalid_request)?;
            let value = HeaderValue::from_str(&refresh_token).map_err(ApiError::invalid_request)?;
            request = request.header(name, value);
        }

        let response = self.dispatch(&request, None).await?;
        let status = response.status();
        if !status.is_success() {
            let body = error_body(response).await;
            return Err(ApiError::from_response(status, &body));
        }

        read_payload(response).await
    }

    /// Irrecoverable refresh failure: drop every credential, tell the rest
    /// of the application, and hand back the error all joiners receive.
    fn expire_session(&self, reason: &str) -> ApiError {
        warn!(%reason, "Token refresh failed, ending session");
        self.store.clear_all();
        self.store.notify_session_expired(reason);
        ApiError::token_expired(SESSION_EXPIRED_MESSAGE)
    }
}

/// Body of an error response. A body that cannot be read is logged and
/// treated as empty, so the error falls back to the generic message.
async fn error_body(response: Response) -> String {
    let status = response.status();
    match response.text().await {
        Ok(body) => body,
        Err(e) => {
            warn!(status = %status, error = %e, "Failed to read error response body");
            String::new()
        }
    }
}

/// Success body as JSON. Empty bodies become `Null`, non-JSON text is
/// returned as a string.
async fn read_payload(response: Response) -> Result<Value, ApiError> {
    let status = response.status();
    let bytes = response.bytes().await.map_err(|e| ApiError::from_transport(&e))?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    match serde_json::from_slice(&bytes) {
        Ok(value) => Ok(value),
        Err(_) => match std::str::from_utf8(&bytes) {
            Ok(text) => Ok(Value::String(text.to_string())),
            Err(e) => Err(ApiError::invalid_response(status, e)),
        },
    }
}
