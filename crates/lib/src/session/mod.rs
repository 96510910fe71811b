//! Session state: the active credential and its lifecycle.
//!
//! A [`SessionState`] is created explicitly and passed to whatever needs authentication.
//! It holds at most one [`Credential`], mirrors it into a [`CredentialStore`], and gates
//! every authenticated call: until [`SessionState::initialize`] has finished, and whenever
//! no credential is active, [`SessionState::credential`] fails with `Unauthenticated`.

mod store;

pub use store::{CredentialStore, FileCredentialStore, MemoryCredentialStore, StoredState, Theme};

use crate::api::{ApiClient, ApiError, AuthResponse, UserInfo};
use async_trait::async_trait;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Bearer token plus the identity it represents.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub name: String,
    pub doctor_id: Option<String>,
    pub email: Option<String>,
}

impl Credential {
    pub fn new(token: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            name: name.into(),
            doctor_id: None,
            email: None,
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("name", &self.name)
            .field("doctor_id", &self.doctor_id)
            .field("email", &self.email)
            .finish()
    }
}

/// Backend calls the session holder depends on. Implemented by [`ApiClient`].
#[async_trait]
pub trait AuthApi: Send + Sync {
    async fn login(&self, email: &str, password: &str) -> Result<AuthResponse, ApiError>;
    async fn register(
        &self,
        email: &str,
        password: &str,
        name: &str,
    ) -> Result<AuthResponse, ApiError>;
    async fn google_auth(&self, id_token: &str) -> Result<AuthResponse, ApiError>;
    async fn me(&self, credential: &Credential) -> Result<UserInfo, ApiError>;
    async fn refresh(&self, credential: &Credential) -> Result<AuthResponse, ApiError>;
}

#[async_trait]
impl AuthApi for ApiClient {
    async fn login(&self, email: &str, password: &str) -> Result<AuthResponse, ApiError> {
        ApiClient::login(self, email, password).await
    }

    async fn register(
        &self,
        email: &str,
        password: &str,
        name: &str,
    ) -> Result<AuthResponse, ApiError> {
        ApiClient::register(self, email, password, name).await
    }

    async fn google_auth(&self, id_token: &str) -> Result<AuthResponse, ApiError> {
        ApiClient::google_auth(self, id_token).await
    }

    async fn me(&self, credential: &Credential) -> Result<UserInfo, ApiError> {
        ApiClient::me(self, credential).await
    }

    async fn refresh(&self, credential: &Credential) -> Result<AuthResponse, ApiError> {
        ApiClient::refresh(self, credential).await
    }
}

#[derive(Default)]
struct SessionInner {
    credential: Option<Credential>,
    user: Option<UserInfo>,
    ready: bool,
}

/// Holder of the current credential. Clones share state.
#[derive(Clone)]
pub struct SessionState {
    auth: Arc<dyn AuthApi>,
    store: Arc<dyn CredentialStore>,
    inner: Arc<RwLock<SessionInner>>,
}

impl SessionState {
    pub fn new(auth: Arc<dyn AuthApi>, store: Arc<dyn CredentialStore>) -> Self {
        Self {
            auth,
            store,
            inner: Arc::new(RwLock::new(SessionInner::default())),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, SessionInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, SessionInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Persisted client state (theme preference lives here too).
    pub fn store(&self) -> &dyn CredentialStore {
        self.store.as_ref()
    }

    /// Restore a persisted credential and validate it against GET /auth/me.
    /// Any failure clears the persisted credential and leaves the session signed out.
    /// Returns whether a credential is active afterwards.
    pub async fn initialize(&self) -> bool {
        let stored = self.store.load();
        let Some(token) = stored.token.filter(|t| !t.trim().is_empty()) else {
            log::debug!("no persisted credential");
            self.write().ready = true;
            return self.is_authenticated();
        };
        let candidate = Credential::new(token, stored.name.unwrap_or_default());
        match self.auth.me(&candidate).await {
            Ok(user) => {
                let mut g = self.write();
                if g.credential.is_none() {
                    let name = if user.name.is_empty() {
                        candidate.name.clone()
                    } else {
                        user.name.clone()
                    };
                    g.credential = Some(Credential {
                        name,
                        doctor_id: Some(user.doctor_id.clone()),
                        email: Some(user.email.clone()).filter(|e| !e.is_empty()),
                        ..candidate
                    });
                    g.user = Some(user);
                    log::info!("restored persisted credential");
                }
                g.ready = true;
            }
            Err(e) => {
                log::info!("persisted credential rejected, clearing: {}", e);
                let mut g = self.write();
                if g.credential.is_none() {
                    if let Err(e) = self.store.clear() {
                        log::warn!("clearing persisted credential failed: {}", e);
                    }
                }
                g.ready = true;
            }
        }
        self.is_authenticated()
    }

    /// True once `initialize` has finished (or a sign-in established a credential).
    pub fn is_ready(&self) -> bool {
        self.read().ready
    }

    pub fn is_authenticated(&self) -> bool {
        let g = self.read();
        g.ready && g.credential.is_some()
    }

    /// The active credential, captured by value.
    pub fn credential(&self) -> Result<Credential, ApiError> {
        let g = self.read();
        if !g.ready {
            return Err(ApiError::Unauthenticated);
        }
        g.credential.clone().ok_or(ApiError::Unauthenticated)
    }

    /// Identity of the signed-in doctor, if known.
    pub fn user(&self) -> Option<UserInfo> {
        self.read().user.clone()
    }

    /// POST /auth/login. Backend errors are returned unchanged.
    pub async fn login(&self, email: &str, password: &str) -> Result<Credential, ApiError> {
        let res = self.auth.login(email, password).await?;
        Ok(self.establish(res, Some(email)))
    }

    /// POST /auth/register. An empty or missing name defaults to the local part of the email.
    pub async fn register(
        &self,
        email: &str,
        password: &str,
        name: Option<&str>,
    ) -> Result<Credential, ApiError> {
        let name = name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| email.split('@').next().unwrap_or(email));
        let res = self.auth.register(email, password, name).await?;
        Ok(self.establish(res, Some(email)))
    }

    /// POST /auth/google with a Google ID token.
    pub async fn login_google(&self, id_token: &str) -> Result<Credential, ApiError> {
        let res = self.auth.google_auth(id_token).await?;
        Ok(self.establish(res, None))
    }

    fn establish(&self, res: AuthResponse, email: Option<&str>) -> Credential {
        let credential = Credential {
            token: res.token,
            name: res.name.unwrap_or_default(),
            doctor_id: res.doctor_id,
            email: res.email.or_else(|| email.map(str::to_string)),
        };
        let user = credential.doctor_id.as_ref().map(|id| UserInfo {
            doctor_id: id.clone(),
            name: credential.name.clone(),
            email: credential.email.clone().unwrap_or_default(),
            avatar_url: None,
            specialty: None,
            phone: None,
        });
        let mut g = self.write();
        if let Err(e) = self.store.save(&credential.token, &credential.name) {
            log::warn!("persisting credential failed: {}", e);
        }
        g.credential = Some(credential.clone());
        g.user = user;
        g.ready = true;
        log::info!("signed in as {}", credential.name);
        credential
    }

    /// Drop the credential from memory and storage. Safe to call when signed out.
    pub fn logout(&self) {
        self.sign_out(None);
    }

    /// Clear the credential from memory and storage. With `only_token`, nothing happens
    /// unless that token is still the active one. Returns whether anything was cleared.
    fn sign_out(&self, only_token: Option<&str>) -> bool {
        let mut g = self.write();
        if let Some(token) = only_token {
            if g.credential.as_ref().map(|c| c.token.as_str()) != Some(token) {
                return false;
            }
        }
        g.user = None;
        let had = g.credential.take().is_some();
        if let Err(e) = self.store.clear() {
            log::warn!("clearing persisted credential failed: {}", e);
        }
        if had {
            log::info!("signed out");
        }
        true
    }

    /// Exchange the current token for a renewed one. On failure the session is signed out.
    pub async fn refresh(&self) -> Result<(), ApiError> {
        let current = self.credential()?;
        match self.auth.refresh(&current).await {
            Ok(res) => {
                let mut g = self.write();
                match g.credential.as_mut() {
                    Some(c) if c.token == current.token => {
                        c.token = res.token;
                        if let Err(e) = self.store.save(&c.token, &c.name) {
                            log::warn!("persisting refreshed credential failed: {}", e);
                        }
                        log::debug!("token refreshed");
                    }
                    _ => log::debug!("credential changed during refresh; discarding renewed token"),
                }
                Ok(())
            }
            Err(e) => {
                if self.sign_out(Some(&current.token)) {
                    log::warn!("token refresh failed, signed out: {}", e);
                } else {
                    log::debug!("credential changed during failed refresh; keeping it");
                }
                Err(e)
            }
        }
    }

    /// Refresh every `interval` while signed in. Ticks while signed out are skipped.
    /// Abort the handle to stop.
    pub fn spawn_refresh_loop(&self, interval: Duration) -> JoinHandle<()> {
        let session = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !session.is_authenticated() {
                    continue;
                }
                let _ = session.refresh().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fake backend: accepts token "valid" (and anything it issued), counts calls.
    #[derive(Default)]
    struct FakeAuth {
        calls: AtomicUsize,
        refresh_fails: bool,
        /// When set, refresh waits for a notification before answering.
        refresh_gate: Option<Arc<tokio::sync::Notify>>,
    }

    fn rejected(body: &str) -> ApiError {
        ApiError::Backend {
            status: StatusCode::UNAUTHORIZED,
            body: body.to_string(),
        }
    }

    fn issued(token: &str, name: &str) -> AuthResponse {
        AuthResponse {
            token: token.to_string(),
            name: Some(name.to_string()),
            doctor_id: Some("doc-1".to_string()),
            email: None,
        }
    }

    #[async_trait]
    impl AuthApi for FakeAuth {
        async fn login(&self, email: &str, password: &str) -> Result<AuthResponse, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if password == "secret" {
                Ok(issued("tok-login", email))
            } else {
                Err(rejected("Invalid credentials"))
            }
        }

        async fn register(
            &self,
            _email: &str,
            _password: &str,
            name: &str,
        ) -> Result<AuthResponse, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(issued("tok-register", name))
        }

        async fn google_auth(&self, _id_token: &str) -> Result<AuthResponse, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(rejected("Invalid Google token"))
        }

        async fn me(&self, credential: &Credential) -> Result<UserInfo, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if credential.token == "valid" {
                Ok(UserInfo {
                    doctor_id: "doc-1".to_string(),
                    name: "Dr. House".to_string(),
                    email: "house@ppth.org".to_string(),
                    avatar_url: None,
                    specialty: None,
                    phone: None,
                })
            } else {
                Err(rejected("Invalid token"))
            }
        }

        async fn refresh(&self, credential: &Credential) -> Result<AuthResponse, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.refresh_gate {
                gate.notified().await;
            }
            if self.refresh_fails {
                Err(rejected("Invalid token"))
            } else {
                Ok(issued(&format!("{}+r", credential.token), &credential.name))
            }
        }
    }

    fn session_with(auth: FakeAuth, store: MemoryCredentialStore) -> (SessionState, Arc<FakeAuth>, Arc<MemoryCredentialStore>) {
        let auth = Arc::new(auth);
        let store = Arc::new(store);
        let session = SessionState::new(auth.clone(), store.clone());
        (session, auth, store)
    }

    #[tokio::test]
    async fn credential_is_gated_until_initialized() {
        let (session, _, _) =
            session_with(FakeAuth::default(), MemoryCredentialStore::with_token("valid", "x"));
        assert!(!session.is_ready());
        assert!(matches!(session.credential(), Err(ApiError::Unauthenticated)));
        assert!(session.initialize().await);
        let c = session.credential().unwrap();
        assert_eq!(c.token, "valid");
        assert_eq!(c.name, "Dr. House");
        assert_eq!(c.doctor_id.as_deref(), Some("doc-1"));
        assert_eq!(session.user().unwrap().email, "house@ppth.org");
    }

    #[tokio::test]
    async fn rejected_persisted_token_is_cleared() {
        let (session, _, store) =
            session_with(FakeAuth::default(), MemoryCredentialStore::with_token("stale", "x"));
        assert!(!session.initialize().await);
        assert!(session.is_ready());
        assert_eq!(store.load().token, None);
        assert!(matches!(session.credential(), Err(ApiError::Unauthenticated)));
    }

    #[tokio::test]
    async fn initialize_without_stored_token_makes_no_request() {
        let (session, auth, _) = session_with(FakeAuth::default(), MemoryCredentialStore::new());
        assert!(!session.initialize().await);
        assert_eq!(auth.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn login_persists_and_failure_propagates_backend_text() {
        let (session, _, store) = session_with(FakeAuth::default(), MemoryCredentialStore::new());
        let err = session.login("a@b.c", "wrong").await.unwrap_err();
        assert_eq!(err.to_string(), "Invalid credentials");
        assert!(!session.is_authenticated());

        let c = session.login("a@b.c", "secret").await.unwrap();
        assert_eq!(c.email.as_deref(), Some("a@b.c"));
        assert_eq!(store.load().token.as_deref(), Some("tok-login"));
        assert_eq!(session.credential().unwrap().token, "tok-login");
    }

    #[tokio::test]
    async fn register_defaults_name_to_email_local_part() {
        let (session, _, store) = session_with(FakeAuth::default(), MemoryCredentialStore::new());
        let c = session.register("quinn@clinic.org", "pw", Some("  ")).await.unwrap();
        assert_eq!(c.name, "quinn");
        assert_eq!(store.load().name.as_deref(), Some("quinn"));
    }

    #[tokio::test]
    async fn google_failure_leaves_session_signed_out() {
        let (session, _, _) = session_with(FakeAuth::default(), MemoryCredentialStore::new());
        session.initialize().await;
        assert!(session.login_google("bogus").await.is_err());
        assert!(!session.is_authenticated());
    }

    #[tokio::test]
    async fn logout_is_idempotent() {
        let (session, _, store) = session_with(FakeAuth::default(), MemoryCredentialStore::new());
        session.login("a@b.c", "secret").await.unwrap();
        session.logout();
        let once = (session.is_authenticated(), store.load());
        session.logout();
        let twice = (session.is_authenticated(), store.load());
        assert_eq!(once, twice);
        assert!(!twice.0);
        assert_eq!(twice.1.token, None);
    }

    #[tokio::test]
    async fn refresh_without_credential_makes_no_request() {
        let (session, auth, _) = session_with(FakeAuth::default(), MemoryCredentialStore::new());
        session.initialize().await;
        assert!(matches!(session.refresh().await, Err(ApiError::Unauthenticated)));
        assert_eq!(auth.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn refresh_replaces_token() {
        let (session, _, store) = session_with(FakeAuth::default(), MemoryCredentialStore::new());
        session.login("a@b.c", "secret").await.unwrap();
        session.refresh().await.unwrap();
        assert_eq!(session.credential().unwrap().token, "tok-login+r");
        assert_eq!(store.load().token.as_deref(), Some("tok-login+r"));
    }

    #[tokio::test]
    async fn failed_refresh_logs_out() {
        let auth = FakeAuth {
            refresh_fails: true,
            ..Default::default()
        };
        let (session, _, store) = session_with(auth, MemoryCredentialStore::new());
        session.login("a@b.c", "secret").await.unwrap();
        assert!(session.refresh().await.is_err());
        assert!(!session.is_authenticated());
        assert_eq!(store.load().token, None);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_credential_established_meanwhile() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let auth = FakeAuth {
            refresh_fails: true,
            refresh_gate: Some(gate.clone()),
            ..Default::default()
        };
        let (session, auth, store) = session_with(auth, MemoryCredentialStore::new());
        session.login("a@b.c", "secret").await.unwrap();

        let in_flight = session.clone();
        let pending = tokio::spawn(async move { in_flight.refresh().await });
        while auth.calls.load(Ordering::SeqCst) < 2 {
            tokio::task::yield_now().await;
        }
        session.register("b@b.c", "pw", None).await.unwrap();
        gate.notify_one();

        assert!(pending.await.unwrap().is_err());
        assert_eq!(session.credential().unwrap().token, "tok-register");
        assert_eq!(store.load().token.as_deref(), Some("tok-register"));
    }

    #[tokio::test]
    async fn refresh_loop_renews_while_signed_in() {
        let (session, _, _) = session_with(FakeAuth::default(), MemoryCredentialStore::new());
        session.login("a@b.c", "secret").await.unwrap();
        let handle = session.spawn_refresh_loop(Duration::from_millis(20));
        let mut renewed = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if session.credential().unwrap().token.starts_with("tok-login+r") {
                renewed = true;
                break;
            }
        }
        handle.abort();
        assert!(renewed, "refresh loop never renewed the token");
    }

    #[test]
    fn debug_output_redacts_token() {
        let c = Credential::new("super-secret", "Ann");
        let s = format!("{:?}", c);
        assert!(!s.contains("super-secret"));
        assert!(s.contains("Ann"));
    }
}
