//! Credential persistence and session state.
//!
//! This module provides:
//! - `CredentialStore`: access token, refresh token and cached user, with a
//!   process-wide auth event channel
//! - `StorageBackend` engines: JSON file, OS keychain, in-memory
//! - `SessionState`: snapshot of the current user and auth flags, kept in
//!   sync with the store and the forced-logout signal

pub mod credentials;
pub mod session;
pub mod storage;
pub mod user;

pub use credentials::{AuthEvent, AuthSubscription, CredentialChange, CredentialStore};
pub use session::{SessionSnapshot, SessionState};
pub use storage::{FileStorage, KeyringStorage, MemoryStorage, StorageBackend};
pub use user::{Role, UserProfile};
