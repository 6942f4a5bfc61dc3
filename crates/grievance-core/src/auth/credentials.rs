use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::storage::{MemoryStorage, StorageBackend};
use super::user::{merge_shallow, UserProfile};

const ACCESS_TOKEN_KEY: &str = "accessToken";
const REFRESH_TOKEN_KEY: &str = "refreshToken";
const USER_KEY: &str = "user";

/// Buffer size for the auth event channel.
/// Subscribers that fall further behind than this see a `Lagged` gap.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Which credential changed, and how.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialChange {
    AccessTokenSet,
    AccessTokenCleared,
    RefreshTokenSet,
    RefreshTokenCleared,
    UserSet,
    UserCleared,
}

/// Process-wide auth notification.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthEvent {
    /// A credential was written or removed.
    Changed(CredentialChange),
    /// The session was forcibly ended (refresh failed). The credentials
    /// have already been cleared when this fires.
    SessionExpired { at: DateTime<Utc>, reason: String },
    /// The user signed out. Credentials are already cleared.
    LoggedOut { at: DateTime<Utc> },
}

/// Receiving end of the auth event channel. Dropping it unsubscribes.
pub struct AuthSubscription {
    rx: broadcast::Receiver<AuthEvent>,
}

impl AuthSubscription {
    /// Wait for the next event. Returns `None` once the store is gone.
    pub async fn recv(&mut self) -> Option<AuthEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Auth event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next already-delivered event, without waiting.
    pub fn try_recv(&mut self) -> Option<AuthEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

/// Access token, refresh token and cached user, persisted through a
/// [`StorageBackend`], plus the auth event channel.
///
/// Storage failures never reach callers: reads degrade to `None` and writes
/// to a no-op returning `false`, so a broken engine looks like a logged-out
/// session. Clone is cheap and clones share storage and subscribers.
#[derive(Clone)]
pub struct CredentialStore {
    storage: Arc<dyn StorageBackend>,
    events: broadcast::Sender<AuthEvent>,
}

impl CredentialStore {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { storage, events }
    }

    /// Store backed by process memory only.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStorage::new()))
    }

    pub fn subscribe(&self) -> AuthSubscription {
        AuthSubscription {
            rx: self.events.subscribe(),
        }
    }

    // ===== Access token =====

    pub fn access_token(&self) -> Option<String> {
        self.read_token(ACCESS_TOKEN_KEY)
    }

    /// `None` clears. A malformed token is rejected and `false` returned.
    pub fn set_access_token(&self, token: Option<&str>) -> bool {
        self.write_token(
            ACCESS_TOKEN_KEY,
            token,
            CredentialChange::AccessTokenSet,
            CredentialChange::AccessTokenCleared,
        )
    }

    // ===== Refresh token =====

    pub fn refresh_token(&self) -> Option<String> {
        self.read_token(REFRESH_TOKEN_KEY)
    }

    pub fn set_refresh_token(&self, token: Option<&str>) -> bool {
        self.write_token(
            REFRESH_TOKEN_KEY,
            token,
            CredentialChange::RefreshTokenSet,
            CredentialChange::RefreshTokenCleared,
        )
    }

    // ===== User =====

    pub fn user(&self) -> Option<UserProfile> {
        let raw = self.read_user_map()?;
        match serde_json::from_value(Value::Object(raw)) {
            Ok(user) => Some(user),
            Err(e) => {
                warn!(error = %e, "Stored user is corrupt, treating as absent");
                None
            }
        }
    }

    /// `None` clears. `Some` merges into the stored user so fields missing
    /// from a partial update are kept.
    pub fn set_user(&self, user: Option<&UserProfile>) -> bool {
        match user {
            None => self.remove(USER_KEY, CredentialChange::UserCleared),
            Some(user) => match serde_json::to_value(user) {
                Ok(value) => self.merge_user_json(&value),
                Err(e) => {
                    warn!(error = %e, "Failed to serialize user");
                    false
                }
            },
        }
    }

    /// Merge a raw user object from a server response. Non-objects are
    /// rejected. Explicit `null`s in `patch` overwrite stored values.
    pub fn merge_user_json(&self, patch: &Value) -> bool {
        let Some(patch) = patch.as_object() else {
            warn!("Rejected non-object user payload");
            return false;
        };

        let mut merged = self.read_user_map().unwrap_or_default();
        merge_shallow(&mut merged, patch);

        let serialized = match serde_json::to_string(&merged) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "Failed to serialize merged user");
                return false;
            }
        };
        self.write(USER_KEY, &serialized, CredentialChange::UserSet)
    }

    // ===== Lifecycle =====

    /// Remove both tokens and the user. Each removal emits its own event.
    pub fn clear_all(&self) {
        self.set_access_token(None);
        self.set_refresh_token(None);
        self.set_user(None);
    }

    pub fn is_authenticated(&self) -> bool {
        self.access_token().is_some()
    }

    /// Broadcast the global forced-logout signal.
    pub fn notify_session_expired(&self, reason: impl Into<String>) {
        self.emit(AuthEvent::SessionExpired {
            at: Utc::now(),
            reason: reason.into(),
        });
    }

    /// Broadcast the user-initiated logout signal.
    pub fn notify_logged_out(&self) {
        self.emit(AuthEvent::LoggedOut { at: Utc::now() });
    }

    // ===== Internals =====

    fn read_token(&self, key: &str) -> Option<String> {
        let value = self.read(key)?;
        if is_well_formed_token(&value) {
            Some(value)
        } else {
            warn!(key, "Stored token is corrupt, treating as absent");
            None
        }
    }

    fn write_token(
        &self,
        key: &str,
        token: Option<&str>,
        set: CredentialChange,
        cleared: CredentialChange,
    ) -> bool {
        match token {
            None => self.remove(key, cleared),
            Some(token) if is_well_formed_token(token) => self.write(key, token, set),
            Some(_) => {
                warn!(key, "Rejected malformed token");
                false
            }
        }
    }

    fn read_user_map(&self) -> Option<Map<String, Value>> {
        let raw = self.read(USER_KEY)?;
        match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(map)) => Some(map),
            Ok(_) | Err(_) => {
                warn!("Stored user is not a JSON object, treating as absent");
                None
            }
        }
    }

    fn read(&self, key: &str) -> Option<String> {
        match self.storage.get(key) {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "Credential storage read failed");
                None
            }
        }
    }

    fn write(&self, key: &str, value: &str, change: CredentialChange) -> bool {
        match self.storage.set(key, value) {
            Ok(()) => {
                debug!(key, ?change, "Credential stored");
                self.emit(AuthEvent::Changed(change));
                true
            }
            Err(e) => {
                warn!(key, error = %e, "Credential storage write failed");
                false
            }
        }
    }

    fn remove(&self, key: &str, change: CredentialChange) -> bool {
        match self.storage.remove(key) {
            Ok(()) => {
                debug!(key, ?change, "Credential removed");
                self.emit(AuthEvent::Changed(change));
                true
            }
            Err(e) => {
                warn!(key, error = %e, "Credential storage remove failed");
                false
            }
        }
    }

    fn emit(&self, event: AuthEvent) {
        // Err only means nobody is subscribed
        let _ = self.events.send(event);
    }
}

/// A token must be usable verbatim in an `Authorization` header.
pub(crate) fn is_well_formed_token(token: &str) -> bool {
    !token.is_empty()
        && token != "null"
        && token != "undefined"
        && token.chars().all(|c| c.is_ascii_graphic())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store_with_backend() -> (CredentialStore, Arc<MemoryStorage>) {
        let backend = Arc::new(MemoryStorage::new());
        (CredentialStore::new(backend.clone()), backend)
    }

    fn drain(sub: &mut AuthSubscription) -> Vec<AuthEvent> {
        std::iter::from_fn(|| sub.try_recv()).collect()
    }

    #[test]
    fn test_access_token_set_get_clear() {
        let store = CredentialStore::in_memory();
        assert_eq!(store.access_token(), None);
        assert!(store.set_access_token(Some("abc.def.ghi")));
        assert_eq!(store.access_token().as_deref(), Some("abc.def.ghi"));
        assert!(store.is_authenticated());
        assert!(store.set_access_token(None));
        assert_eq!(store.access_token(), None);
    }

    #[test]
    fn test_malformed_token_rejected() {
        let store = CredentialStore::in_memory();
        store.set_access_token(Some("good"));
        let mut sub = store.subscribe();

        assert!(!store.set_access_token(Some("")));
        assert!(!store.set_access_token(Some("has space")));
        assert!(!store.set_access_token(Some("undefined")));
        assert!(!store.set_refresh_token(Some("line\nbreak")));

        assert_eq!(store.access_token().as_deref(), Some("good"));
        assert!(drain(&mut sub).is_empty());
    }

    #[test]
    fn test_corrupt_stored_values_read_as_none() {
        let (store, backend) = store_with_backend();
        backend.insert_raw(ACCESS_TOKEN_KEY, "null");
        backend.insert_raw(REFRESH_TOKEN_KEY, "two words");
        backend.insert_raw(USER_KEY, "{not json");
        assert_eq!(store.access_token(), None);
        assert_eq!(store.refresh_token(), None);
        assert_eq!(store.user(), None);

        backend.insert_raw(USER_KEY, "[1,2,3]");
        assert_eq!(store.user(), None);
    }

    #[test]
    fn test_events_tagged_with_mutation_kind() {
        let store = CredentialStore::in_memory();
        let mut sub = store.subscribe();

        store.set_access_token(Some("a"));
        store.set_refresh_token(Some("r"));
        store.set_access_token(None);

        assert_eq!(
            drain(&mut sub),
            vec![
                AuthEvent::Changed(CredentialChange::AccessTokenSet),
                AuthEvent::Changed(CredentialChange::RefreshTokenSet),
                AuthEvent::Changed(CredentialChange::AccessTokenCleared),
            ]
        );
    }

    #[test]
    fn test_dropped_subscription_does_not_block_writes() {
        let store = CredentialStore::in_memory();
        let sub = store.subscribe();
        drop(sub);
        assert!(store.set_access_token(Some("a")));
    }

    #[test]
    fn test_partial_user_update_is_merged() {
        let store = CredentialStore::in_memory();
        let full = UserProfile {
            id: Some("u1".into()),
            name: Some("Grace Hopper".into()),
            email: Some("grace@campus.edu".into()),
            role: Some("student".into()),
            avatar: Some("/avatars/old.png".into()),
            ..Default::default()
        };
        assert!(store.set_user(Some(&full)));

        let patch = UserProfile {
            avatar: Some("/avatars/new.png".into()),
            ..Default::default()
        };
        assert!(store.set_user(Some(&patch)));

        let stored = store.user().expect("user stored");
        assert_eq!(stored.name.as_deref(), Some("Grace Hopper"));
        assert_eq!(stored.email.as_deref(), Some("grace@campus.edu"));
        assert_eq!(stored.role.as_deref(), Some("student"));
        assert_eq!(stored.avatar.as_deref(), Some("/avatars/new.png"));
    }

    #[test]
    fn test_merge_user_json_rejects_non_object() {
        let store = CredentialStore::in_memory();
        assert!(!store.merge_user_json(&json!("grace")));
        assert!(!store.merge_user_json(&Value::Null));
        assert!(store.merge_user_json(&json!({"name": "Grace", "coverImage": "/c.png"})));
        assert!(store.merge_user_json(&json!({"coverImage": null})));

        let stored = store.user().expect("user stored");
        assert_eq!(stored.name.as_deref(), Some("Grace"));
        assert_eq!(stored.cover_image, None);
    }

    #[test]
    fn test_clear_all_when_empty() {
        let store = CredentialStore::in_memory();
        store.clear_all();
        store.clear_all();
        assert_eq!(store.access_token(), None);
        assert_eq!(store.refresh_token(), None);
        assert_eq!(store.user(), None);
    }

    #[test]
    fn test_clear_all_emits_each_kind() {
        let store = CredentialStore::in_memory();
        store.set_access_token(Some("a"));
        store.set_refresh_token(Some("r"));
        store.merge_user_json(&json!({"name": "Grace"}));
        let mut sub = store.subscribe();

        store.clear_all();

        let events = drain(&mut sub);
        assert!(events.contains(&AuthEvent::Changed(CredentialChange::AccessTokenCleared)));
        assert!(events.contains(&AuthEvent::Changed(CredentialChange::RefreshTokenCleared)));
        assert!(events.contains(&AuthEvent::Changed(CredentialChange::UserCleared)));
        assert!(!store.is_authenticated());
    }

    #[test]
    fn test_unavailable_storage_degrades() {
        let (store, backend) = store_with_backend();
        store.set_access_token(Some("a"));
        backend.set_unavailable(true);
        let mut sub = store.subscribe();

        assert_eq!(store.access_token(), None);
        assert!(!store.set_access_token(Some("b")));
        assert!(!store.merge_user_json(&json!({"name": "Grace"})));
        store.clear_all();
        assert!(drain(&mut sub).is_empty());

        backend.set_unavailable(false);
        assert_eq!(store.access_token().as_deref(), Some("a"));
    }

    #[test]
    fn test_session_expired_broadcast() {
        let store = CredentialStore::in_memory();
        let mut first = store.subscribe();
        let mut second = store.clone().subscribe();

        store.notify_session_expired("refresh rejected");

        for sub in [&mut first, &mut second] {
            match sub.try_recv() {
                Some(AuthEvent::SessionExpired { reason, .. }) => {
                    assert_eq!(reason, "refresh rejected")
                }
                other => panic!("expected SessionExpired, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_logged_out_broadcast() {
        let store = CredentialStore::in_memory();
        let mut sub = store.subscribe();

        store.notify_logged_out();

        assert!(matches!(sub.try_recv(), Some(AuthEvent::LoggedOut { .. })));
        assert_eq!(sub.try_recv(), None);
    }
}
