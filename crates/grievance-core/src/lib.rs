//! Client core for the campus grievance desk.
//!
//! - `api`: session client with bearer auth, single-flight token refresh,
//!   error normalization, and the login/register/logout flows
//! - `auth`: credential store, storage engines, session state
//! - `config`: persisted configuration and resolved client settings

pub mod api;
pub mod auth;
pub mod config;

pub use api::{ApiError, ApiRequest, AuthApi, ErrorCode, MultipartForm, SessionClient};
pub use auth::{AuthEvent, CredentialChange, CredentialStore, SessionState, UserProfile};
pub use config::{ClientConfig, Config};
