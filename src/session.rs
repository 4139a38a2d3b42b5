//! Session store
//!
//! Owns the current credential, the signed-in user's profile, and the
//! session lifetime. Every scheduled poll is tied to the lifetime token, so
//! ending a session (logout, or the server refusing the credential) stops all
//! background activity for it.

use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::NutritionApi;
use crate::cache::SnapshotCache;
use crate::error::{ClientError, Result};
use crate::model::{RegisterRequest, UserProfile};

/// Storage key the credential is persisted under
pub const CREDENTIAL_KEY: &str = "jinu_token";

/// Persistence for the session credential
pub trait CredentialStore: Send + Sync {
    fn load(&self) -> Result<Option<String>>;
    fn save(&self, credential: &str) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

/// JSON key/value file holding the credential under [`CREDENTIAL_KEY`]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn storage_error(&self, e: impl fmt::Display) -> ClientError {
        ClientError::Storage(format!("{}: {}", self.path.display(), e))
    }

    fn read_map(&self) -> Result<Map<String, Value>> {
        if !self.path.exists() {
            return Ok(Map::new());
        }
        let content = std::fs::read_to_string(&self.path).map_err(|e| self.storage_error(e))?;
        if content.trim().is_empty() {
            return Ok(Map::new());
        }
        serde_json::from_str(&content).map_err(|e| self.storage_error(e))
    }

    fn write_map(&self, map: &Map<String, Value>) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| self.storage_error(e))?;
        }
        let content = serde_json::to_string_pretty(map).map_err(|e| self.storage_error(e))?;
        std::fs::write(&self.path, content).map_err(|e| self.storage_error(e))
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> Result<Option<String>> {
        Ok(self
            .read_map()?
            .get(CREDENTIAL_KEY)
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())
            .map(str::to_string))
    }

    fn save(&self, credential: &str) -> Result<()> {
        let mut map = self.read_map().unwrap_or_default();
        map.insert(CREDENTIAL_KEY.to_string(), Value::String(credential.to_string()));
        self.write_map(&map)
    }

    fn clear(&self) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        let mut map = self.read_map().unwrap_or_default();
        map.remove(CREDENTIAL_KEY);
        self.write_map(&map)
    }
}

/// In-memory credential store
#[derive(Default)]
pub struct MemoryCredentialStore {
    credential: parking_lot::Mutex<Option<String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credential(credential: impl Into<String>) -> Self {
        Self {
            credential: parking_lot::Mutex::new(Some(credential.into())),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self) -> Result<Option<String>> {
        Ok(self.credential.lock().clone())
    }

    fn save(&self, credential: &str) -> Result<()> {
        *self.credential.lock() = Some(credential.to_string());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.credential.lock() = None;
        Ok(())
    }
}

/// Handle to one authenticated session.
///
/// Cheap to clone. The lifetime token is cancelled when the session ends.
#[derive(Clone)]
pub struct Session {
    id: u64,
    credential: Arc<str>,
    lifetime: CancellationToken,
}

impl Session {
    pub(crate) fn new(id: u64, credential: impl Into<Arc<str>>) -> Self {
        Self {
            id,
            credential: credential.into(),
            lifetime: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn credential(&self) -> &str {
        &self.credential
    }

    pub fn lifetime(&self) -> &CancellationToken {
        &self.lifetime
    }

    pub fn is_active(&self) -> bool {
        !self.lifetime.is_cancelled()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("credential", &"<redacted>")
            .field("active", &self.is_active())
            .finish()
    }
}

#[derive(Default)]
struct SessionState {
    session: Option<Session>,
    profile: Option<UserProfile>,
}

pub struct SessionStore {
    api: Arc<dyn NutritionApi>,
    store: Arc<dyn CredentialStore>,
    cache: Arc<SnapshotCache>,
    state: RwLock<SessionState>,
    next_id: AtomicU64,
}

impl SessionStore {
    pub fn new(
        api: Arc<dyn NutritionApi>,
        store: Arc<dyn CredentialStore>,
        cache: Arc<SnapshotCache>,
    ) -> Self {
        Self {
            api,
            store,
            cache,
            state: RwLock::new(SessionState::default()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn current(&self) -> Option<Session> {
        self.state.read().session.clone()
    }

    /// The current session, or [`ClientError::NotAuthenticated`].
    pub fn require(&self) -> Result<Session> {
        self.current().ok_or(ClientError::NotAuthenticated)
    }

    pub fn profile(&self) -> Option<UserProfile> {
        self.state.read().profile.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.read().session.is_some()
    }

    /// Exchange email and password for a credential, persist it and load the
    /// profile.
    pub async fn login(&self, email: &str, password: &str) -> Result<Session> {
        let email = email.trim();
        if email.is_empty() || password.is_empty() {
            return Err(ClientError::Validation(
                "Email and password are required".to_string(),
            ));
        }

        let response = self.api.login(email, password).await?;
        if let Err(e) = self.store.save(&response.access_token) {
            warn!(error = %e, "Failed to persist credential; the session will not survive a restart");
        }

        let session = self.install(response.access_token);
        info!(session = session.id(), "Logged in");

        match self.reload_profile(&session).await {
            Ok(_) => Ok(session),
            Err(e) if e.is_auth() => Err(e),
            Err(e) => {
                warn!(error = %e, "Failed to load profile after login");
                Ok(session)
            }
        }
    }

    /// Create an account. No session is created; the email must be verified
    /// before the first login.
    pub async fn register(&self, request: &RegisterRequest) -> Result<()> {
        if request.email.trim().is_empty()
            || request.password.is_empty()
            || request.name.trim().is_empty()
        {
            return Err(ClientError::Validation(
                "Email, password and name are required".to_string(),
            ));
        }
        self.api.register(request).await?;
        info!(email = %request.email, "Registered; awaiting email verification");
        Ok(())
    }

    pub async fn verify_email(&self, token: &str) -> Result<()> {
        let token = token.trim();
        if token.is_empty() {
            return Err(ClientError::Validation(
                "Verification token is required".to_string(),
            ));
        }
        self.api.verify_email(token).await
    }

    /// Rehydrate the persisted credential and validate it against the
    /// backend. A refused credential is cleared; an unreachable backend keeps
    /// the session so polling can pick up once it is back.
    pub async fn restore(&self) -> Option<Session> {
        let credential = match self.store.load() {
            Ok(Some(credential)) => credential,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "Failed to read stored credential");
                return None;
            }
        };

        let session = self.install(credential);
        match self.reload_profile(&session).await {
            Ok(profile) => {
                info!(session = session.id(), email = %profile.email, "Restored session");
                Some(session)
            }
            Err(e) if e.is_auth() => None,
            Err(e) => {
                warn!(error = %e, "Could not validate stored credential; keeping it");
                Some(session)
            }
        }
    }

    /// Fetch `/users/me` for the session and store the result if the session
    /// is still current.
    pub async fn reload_profile(&self, session: &Session) -> Result<UserProfile> {
        let profile = self.check(session, self.api.me(session.credential()).await)?;

        let mut state = self.state.write();
        if state.session.as_ref().map(Session::id) == Some(session.id()) {
            state.profile = Some(profile.clone());
        }
        Ok(profile)
    }

    /// End the current session. Never fails.
    pub fn logout(&self) {
        if let Some(session) = self.take() {
            info!(session = session.id(), "Logged out");
        }
        self.forget();
    }

    /// Pass a result through, ending `session` if the server refused its
    /// credential.
    pub fn check<T>(&self, session: &Session, result: Result<T>) -> Result<T> {
        result.map_err(|e| self.fail(session, e))
    }

    /// Same as [`SessionStore::check`] for an error already in hand.
    pub fn fail(&self, session: &Session, err: ClientError) -> ClientError {
        if err.is_auth() {
            self.expire(session, &err);
        }
        err
    }

    fn expire(&self, session: &Session, reason: &ClientError) {
        session.lifetime().cancel();

        let ended = {
            let mut state = self.state.write();
            if state.session.as_ref().map(Session::id) == Some(session.id()) {
                state.profile = None;
                state.session.take()
            } else {
                None
            }
        };

        if ended.is_some() {
            warn!(session = session.id(), reason = %reason, "Credential rejected; ending session");
            self.forget();
        } else {
            debug!(session = session.id(), "Rejected credential belongs to an ended session");
        }
    }

    fn install(&self, credential: String) -> Session {
        let session = Session::new(self.next_id.fetch_add(1, Ordering::Relaxed), credential);
        let previous = {
            let mut state = self.state.write();
            state.profile = None;
            state.session.replace(session.clone())
        };
        if let Some(previous) = previous {
            previous.lifetime().cancel();
            self.cache.clear();
        }
        session
    }

    fn take(&self) -> Option<Session> {
        let session = {
            let mut state = self.state.write();
            state.profile = None;
            state.session.take()
        };
        if let Some(session) = &session {
            session.lifetime().cancel();
        }
        session
    }

    fn forget(&self) {
        if let Err(e) = self.store.clear() {
            warn!(error = %e, "Failed to clear stored credential");
        }
        self.cache.clear();
    }
}
