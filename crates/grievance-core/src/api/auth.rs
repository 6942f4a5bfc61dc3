//! Login, registration, logout and profile bookkeeping.
//!
//! These flows sit on top of [`SessionClient`] and write their results into
//! the credential store with the same response-shape matchers the refresh
//! path uses.

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::auth::UserProfile;

use super::request::ApiRequest;
use super::shapes::{self, AuthPayload};
use super::{ApiError, SessionClient};

const LOGIN_PATH: &str = "/auth/login";
const REGISTER_PATH: &str = "/auth/register";
const LOGOUT_PATH: &str = "/auth/logout";

pub struct AuthApi {
    client: SessionClient,
}

impl AuthApi {
    pub fn new(client: SessionClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &SessionClient {
        &self.client
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<Option<UserProfile>, ApiError> {
        let request = ApiRequest::post(LOGIN_PATH)
            .json_value(json!({ "email": email, "password": password }));
        let body = self.client.send(request).await?;
        let user = self.establish_session(&body)?;
        info!(email, "Logged in");
        Ok(user)
    }

    /// Register a new account. The backend signs the account in directly.
    pub async fn register<B: Serialize + ?Sized>(&self, details: &B) -> Result<Option<UserProfile>, ApiError> {
        let request = ApiRequest::post(REGISTER_PATH)
            .json(details)
            .map_err(ApiError::invalid_request)?;
        let body = self.client.send(request).await?;
        let user = self.establish_session(&body)?;
        info!("Registered and logged in");
        Ok(user)
    }

    /// Tell the server, then drop local credentials and broadcast the
    /// logout regardless of the outcome. The server's error, if any, is
    /// still returned.
    pub async fn logout(&self) -> Result<(), ApiError> {
        let result = self.client.send(ApiRequest::post(LOGOUT_PATH)).await;
        let store = self.client.store();
        store.clear_all();
        store.notify_logged_out();
        match result {
            Ok(_) => {
                info!("Logged out");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Logout call failed, local credentials cleared anyway");
                Err(e)
            }
        }
    }

    /// Send a profile update (JSON or multipart) and merge the returned user
    /// into the cached profile.
    pub async fn update_profile(&self, request: ApiRequest) -> Result<Option<UserProfile>, ApiError> {
        let body = self.client.send(request).await?;
        Ok(self.apply_profile_update(&body))
    }

    /// Merge the user object found in `body` (if any) into the cached
    /// profile and return the merged result.
    pub fn apply_profile_update(&self, body: &Value) -> Option<UserProfile> {
        let store = self.client.store();
        let raw = shapes::user_value(body)?;
        if !store.merge_user_json(raw) {
            return None;
        }
        store.user()
    }

    fn establish_session(&self, body: &Value) -> Result<Option<UserProfile>, ApiError> {
        let payload = AuthPayload::extract(body);
        let Some(ref access_token) = payload.access_token else {
            return Err(ApiError::invalid_response(
                reqwest::StatusCode::OK,
                "no access token in auth response",
            ));
        };

        let store = self.client.store();
        // A different account may have been cached before; never merge into it
        store.set_user(None);
        store.set_access_token(Some(access_token));
        store.set_refresh_token(payload.refresh_token.as_deref());
        if let Some(raw) = shapes::user_value(body) {
            store.merge_user_json(raw);
        }
        Ok(store.user().or(payload.user))
    }
}
