//! Accepted response shapes for auth payloads.
//!
//! The backend wraps tokens and users in a few different envelopes depending
//! on the endpoint. Each list below is tried in order and the first matcher
//! that yields a value wins.

use serde_json::Value;

use crate::auth::credentials::is_well_formed_token;
use crate::auth::UserProfile;

/// Key path into a response body.
type Shape = &'static [&'static str];

const ACCESS_TOKEN_SHAPES: &[Shape] = &[
    &["accessToken"],
    &["token"],
    &["access_token"],
    &["data", "accessToken"],
    &["data", "token"],
    &["data", "access_token"],
];

const REFRESH_TOKEN_SHAPES: &[Shape] = &[
    &["refreshToken"],
    &["refresh_token"],
    &["data", "refreshToken"],
    &["data", "refresh_token"],
];

const USER_SHAPES: &[Shape] = &[&["user"], &["data", "user"]];

/// Access token from `accessToken`, `token`, `access_token`, or the same
/// keys under `data`. Values that cannot go into a header are skipped.
pub fn access_token(body: &Value) -> Option<String> {
    first_token(ACCESS_TOKEN_SHAPES, body)
}

/// Rotated refresh token, if the server issued one.
pub fn refresh_token(body: &Value) -> Option<String> {
    first_token(REFRESH_TOKEN_SHAPES, body)
}

/// Raw user object from `user` or `data.user`.
pub fn user_value(body: &Value) -> Option<&Value> {
    USER_SHAPES
        .iter()
        .find_map(|path| value_at(body, path).filter(|v| v.is_object()))
}

/// Typed view of [`user_value`].
pub fn user(body: &Value) -> Option<UserProfile> {
    serde_json::from_value(user_value(body)?.clone()).ok()
}

/// Tokens and user extracted from a login, register or refresh response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuthPayload {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub user: Option<UserProfile>,
}

impl AuthPayload {
    pub fn extract(body: &Value) -> Self {
        Self {
            access_token: access_token(body),
            refresh_token: refresh_token(body),
            user: user(body),
        }
    }
}

fn first_token(shapes: &[Shape], body: &Value) -> Option<String> {
    shapes
        .iter()
        .find_map(|path| string_at(body, path).filter(|t| is_well_formed_token(t)))
}

fn value_at<'a>(body: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(body, |current, key| current.get(key))
}

fn string_at(body: &Value, path: &[&str]) -> Option<String> {
    value_at(body, path)?
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
