//! Authenticated REST client for the grievance desk backend.
//!
//! This module provides the `SessionClient`, the single path through which
//! callers talk to the API. It attaches bearer tokens from the credential
//! store, refreshes an expired access token at most once per expiry (all
//! concurrent 401s share one refresh call), retries the original request,
//! and turns every failure into a normalized `ApiError`.

pub mod auth;
pub mod client;
pub mod error;
pub mod refresh;
pub mod request;
pub mod shapes;

pub use auth::AuthApi;
pub use client::SessionClient;
pub use error::{ApiError, ErrorCode};
pub use refresh::{RefreshCoordinator, RefreshRole, RefreshState};
pub use reqwest::Method;
pub use request::{ApiRequest, FormPart, MultipartForm, RequestBody, RetryState};
