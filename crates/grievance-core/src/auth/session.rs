use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::credentials::{AuthEvent, CredentialStore};
use super::user::UserProfile;

/// What the rest of the application needs to know about the session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    pub user: Option<UserProfile>,
    pub is_authenticated: bool,
    /// Set when the session was forcibly ended; cleared by the next login.
    pub expired_at: Option<DateTime<Utc>>,
    pub expired_reason: Option<String>,
}

impl SessionSnapshot {
    fn from_store(store: &CredentialStore) -> Self {
        Self {
            user: store.user(),
            is_authenticated: store.is_authenticated(),
            expired_at: None,
            expired_reason: None,
        }
    }

    /// True when the front end should show the "session expired" notice.
    pub fn needs_login_notice(&self) -> bool {
        !self.is_authenticated && self.expired_at.is_some()
    }
}

/// Session state kept in sync with the credential store.
///
/// A background task listens for credential changes and the forced-logout
/// signal and republishes a [`SessionSnapshot`]. The task stops when this
/// value is dropped.
pub struct SessionState {
    rx: watch::Receiver<SessionSnapshot>,
    task: JoinHandle<()>,
}

impl SessionState {
    /// Start watching `store`. Must be called inside a tokio runtime.
    pub fn spawn(store: CredentialStore) -> Self {
        let mut events = store.subscribe();
        let (tx, rx) = watch::channel(SessionSnapshot::from_store(&store));

        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let mut next = SessionSnapshot::from_store(&store);
                match event {
                    AuthEvent::SessionExpired { at, reason } => {
                        info!(%reason, "Session expired, login required");
                        next.expired_at = Some(at);
                        next.expired_reason = Some(reason);
                    }
                    AuthEvent::LoggedOut { .. } => {
                        // A deliberate logout is not an expiry
                        debug!("Session ended by logout");
                    }
                    AuthEvent::Changed(change) => {
                        debug!(?change, "Session state refreshed");
                        if !next.is_authenticated {
                            // Keep the expiry notice until someone logs in again
                            let current = tx.borrow();
                            next.expired_at = current.expired_at;
                            next.expired_reason = current.expired_reason.clone();
                        }
                    }
                }
                if tx.send(next).is_err() {
                    break;
                }
            }
        });

        Self { rx, task }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.rx.borrow().clone()
    }

    /// Receiver that is notified on every snapshot change.
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.rx.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.rx.borrow().is_authenticated
    }

    pub fn user(&self) -> Option<UserProfile> {
        self.rx.borrow().user.clone()
    }
}

impl Drop for SessionState {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    async fn wait_for(
        rx: &mut watch::Receiver<SessionSnapshot>,
        pred: impl Fn(&SessionSnapshot) -> bool,
    ) -> SessionSnapshot {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if pred(&rx.borrow_and_update()) {
                    return rx.borrow().clone();
                }
                rx.changed().await.expect("session task alive");
            }
        })
        .await
        .expect("snapshot condition reached in time")
    }

    #[tokio::test]
    async fn test_initial_snapshot_reflects_store() {
        let store = CredentialStore::in_memory();
        store.set_access_token(Some("tok"));
        store.merge_user_json(&json!({"name": "Grace"}));

        let state = SessionState::spawn(store);
        assert!(state.is_authenticated());
        assert_eq!(state.user().and_then(|u| u.name).as_deref(), Some("Grace"));
    }

    #[tokio::test]
    async fn test_tracks_login_and_forced_logout() {
        let store = CredentialStore::in_memory();
        let state = SessionState::spawn(store.clone());
        let mut rx = state.watch();
        assert!(!state.is_authenticated());

        store.set_access_token(Some("tok"));
        wait_for(&mut rx, |s| s.is_authenticated).await;

        store.clear_all();
        store.notify_session_expired("refresh failed");
        let snap = wait_for(&mut rx, |s| s.expired_at.is_some()).await;
        assert!(!snap.is_authenticated);
        assert!(snap.needs_login_notice());
        assert_eq!(snap.expired_reason.as_deref(), Some("refresh failed"));

        // Logging back in clears the notice
        store.set_access_token(Some("fresh"));
        let snap = wait_for(&mut rx, |s| s.is_authenticated).await;
        assert_eq!(snap.expired_at, None);
        assert!(!snap.needs_login_notice());
    }

    #[tokio::test]
    async fn test_logout_drops_expiry_notice() {
        let store = CredentialStore::in_memory();
        let state = SessionState::spawn(store.clone());
        let mut rx = state.watch();

        store.notify_session_expired("refresh failed");
        wait_for(&mut rx, |s| s.needs_login_notice()).await;

        store.clear_all();
        store.notify_logged_out();
        let snap = wait_for(&mut rx, |s| s.expired_at.is_none()).await;
        assert!(!snap.is_authenticated);
        assert!(!snap.needs_login_notice());
    }
}
