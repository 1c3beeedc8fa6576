//! Session Manager service

use std::sync::{Arc, Weak};

use log::{debug, error, info, warn};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;

use crate::api::HttpSessionBackend;
use crate::backend::SessionBackend;
use crate::config::{RegistrationMode, SessionConfig};
use crate::error::{Result, SessionError};
use crate::events::SessionEvent;
use crate::models::{LoginOutcome, RegisterOutcome, Session, UserProfile};
use crate::storage::{FileTokenStore, TokenStore};
use crate::utils::http_utils::mask_token;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Session Manager - owns the authentication token and the cached user profile.
///
/// Cloning is cheap; clones share the same session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    backend: Arc<dyn SessionBackend>,
    store: Arc<dyn TokenStore>,
    registration_mode: RegistrationMode,
    state: watch::Sender<Session>,
    /// Serializes "persist, then publish" so the store and the in-memory state change in the same order
    writer: Mutex<()>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionManager {
    /// Create an unauthenticated SessionManager; call [`initialize`](Self::initialize) to restore a persisted token.
    pub fn new(
        backend: Arc<dyn SessionBackend>,
        store: Arc<dyn TokenStore>,
        registration_mode: RegistrationMode,
    ) -> Self {
        let (state, _) = watch::channel(Session::default());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                backend,
                store,
                registration_mode,
                state,
                writer: Mutex::new(()),
                events,
            }),
        }
    }

    /// Wire the REST backend and file token store described by `config`.
    pub fn from_config(config: SessionConfig) -> Result<Self> {
        let store = FileTokenStore::new(config.data_dir());
        let registration_mode = config.registration_mode;
        let backend = HttpSessionBackend::new(config)?;
        Ok(Self::new(Arc::new(backend), Arc::new(store), registration_mode))
    }

    /// Snapshot of the current session
    pub fn session(&self) -> Session {
        self.inner.state.borrow().clone()
    }

    pub fn token(&self) -> Option<String> {
        self.inner.state.borrow().token.clone()
    }

    pub fn current_user(&self) -> Option<UserProfile> {
        self.inner.state.borrow().current_user.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.state.borrow().is_authenticated()
    }

    pub fn registration_mode(&self) -> RegistrationMode {
        self.inner.registration_mode
    }

    /// Observe session state; the receiver always yields whole snapshots.
    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.inner.state.subscribe()
    }

    /// Stream of state transitions, for logging or UI routing.
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Restore a persisted token and schedule a profile refresh for it.
    ///
    /// Returns the handle of the scheduled refresh, or `None` when nothing was restored.
    pub async fn initialize(&self) -> Option<JoinHandle<()>> {
        let token = match self.inner.store.load_token().await {
            Ok(token) => token,
            Err(e) => {
                error!("Failed to read persisted token, starting signed out: {}", e);
                None
            }
        }?;

        {
            let _guard = self.inner.writer.lock().await;
            let restored = self.inner.state.send_if_modified(|session| {
                if session.active_token().is_some() {
                    return false;
                }
                session.token = Some(token.clone());
                true
            });
            if !restored {
                debug!("Session already active, skipping token restore");
                return None;
            }
        }

        info!("Restored session token {}", mask_token(&token));
        self.inner.emit(SessionEvent::Restored);
        Some(self.spawn_refresh(token))
    }

    /// Authenticate with email and password.
    pub async fn login(&self, email: &str, password: &str) -> Result<LoginOutcome> {
        let response = self
            .inner
            .backend
            .login(email, password)
            .await
            .inspect_err(|e| warn!("Login failed: {}", e))?;
        let token = non_empty_token(response.token)?;

        self.inner.install_token(&token, false).await;
        info!("Logged in as {}", response.user.username);
        self.inner.emit(SessionEvent::LoggedIn {
            username: response.user.username.clone(),
        });
        self.spawn_refresh(token.clone());

        Ok(LoginOutcome {
            token,
            user: response.user,
        })
    }

    /// Create an account. The username is sent lowercased.
    pub async fn register(
        &self,
        email: &str,
        password: &str,
        fullname: &str,
        username: &str,
    ) -> Result<RegisterOutcome> {
        let username = username.to_lowercase();
        let response = self
            .inner
            .backend
            .register(email, password, fullname, &username)
            .await
            .inspect_err(|e| warn!("Registration failed: {}", e))?;
        let token = non_empty_token(response.token)?;

        let authenticated = match self.inner.registration_mode {
            RegistrationMode::Immediate => {
                self.inner.install_token(&token, true).await;
                true
            }
            RegistrationMode::DeferredUntilProfileImage => {
                self.inner.hold_pending_token(&token).await;
                false
            }
        };

        info!("Registered {} (authenticated: {})", username, authenticated);
        self.inner
            .emit(SessionEvent::Registered { authenticated });
        if authenticated {
            self.spawn_refresh(token.clone());
        }
        Ok(RegisterOutcome {
            token,
            authenticated,
        })
    }

    /// Complete onboarding: promotes a pending token, or just clears the
    /// just-registered flag when the token is already final.
    pub async fn finish_onboarding(&self) -> Result<()> {
        if let Some(token) = self.inner.promote_pending_token(None).await {
            self.inner.emit(SessionEvent::OnboardingFinished);
            self.spawn_refresh(token);
            return Ok(());
        }

        {
            let _guard = self.inner.writer.lock().await;
            if self.inner.state.borrow().token.is_none() {
                return Err(SessionError::NoActiveSession);
            }
            self.inner
                .state
                .send_if_modified(|session| std::mem::take(&mut session.just_registered));
        }
        self.inner.emit(SessionEvent::OnboardingFinished);
        Ok(())
    }

    /// Drop a pending token. A finalized token is left alone.
    pub async fn abandon_onboarding(&self) {
        let abandoned = {
            let _guard = self.inner.writer.lock().await;
            self.inner.state.send_if_modified(|session| {
                let changed = session.pending_token.is_some() || session.just_registered;
                session.pending_token = None;
                session.just_registered = false;
                changed
            })
        };
        if abandoned {
            info!("Onboarding abandoned");
            self.inner.emit(SessionEvent::OnboardingAbandoned);
        }
    }

    /// Upload a JPEG as the profile image and refresh the profile.
    ///
    /// Requires a finalized or pending token; fails with `NoActiveSession`
    /// without touching the network otherwise. Success ends onboarding for the
    /// token the upload was made with, in either registration mode; if the
    /// session moved on to another token meanwhile, it is left untouched.
    pub async fn upload_profile_image(&self, image: Vec<u8>) -> Result<String> {
        let Some(token) = self.session().active_token().map(str::to_string) else {
            warn!("Profile image upload requested without an active session");
            return Err(SessionError::NoActiveSession);
        };

        let response = self
            .inner
            .backend
            .upload_profile_image(&token, image)
            .await
            .inspect_err(|e| warn!("Profile image upload failed: {}", e))?;

        self.inner.emit(SessionEvent::ProfileImageUploaded {
            url: response.image_url.clone(),
        });

        if let Some(promoted) = self.inner.promote_pending_token(Some(token.as_str())).await {
            self.inner.emit(SessionEvent::OnboardingFinished);
            self.spawn_refresh(promoted);
            return Ok(response.image_url);
        }

        let (current, finished) = {
            let _guard = self.inner.writer.lock().await;
            let mut current = false;
            let finished = self.inner.state.send_if_modified(|session| {
                current = session.token.as_deref() == Some(token.as_str());
                current && std::mem::take(&mut session.just_registered)
            });
            (current, finished)
        };
        if finished {
            self.inner.emit(SessionEvent::OnboardingFinished);
        }
        if current {
            self.spawn_refresh(token);
        } else {
            debug!(
                "Session changed during upload for {}, skipping refresh",
                mask_token(&token)
            );
        }
        Ok(response.image_url)
    }

    /// Fetch the profile for `token` and replace the cached user with it.
    ///
    /// The result is only applied while the session still holds `token`; a
    /// profile fetched for a replaced token is still returned but leaves
    /// `current_user` untouched and emits no `ProfileRefreshed`.
    /// On failure the previous profile is kept.
    pub async fn refresh_profile(&self, token: &str) -> Result<UserProfile> {
        let result = self.inner.backend.fetch_profile(token).await;
        self.inner.apply_profile(token, result).await
    }

    /// Sign out locally and notify the backend on a best-effort basis. Never fails.
    pub async fn logout(&self) {
        let token = {
            let _guard = self.inner.writer.lock().await;
            if let Err(e) = self.inner.store.delete_token().await {
                error!("Failed to remove persisted token: {}", e);
            }
            let mut previous = None;
            self.inner.state.send_modify(|session| {
                previous = session.active_token().map(str::to_string);
                session.clear();
            });
            previous
        };

        info!("Logged out");
        self.inner.emit(SessionEvent::LoggedOut);

        if let Some(token) = token {
            if let Err(e) = self.inner.backend.logout(&token).await {
                warn!("Server-side logout failed, local session already cleared: {}", e);
            }
        }
    }

    fn spawn_refresh(&self, token: String) -> JoinHandle<()> {
        let backend = Arc::clone(&self.inner.backend);
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let result = backend.fetch_profile(&token).await;
            match inner.upgrade() {
                Some(inner) => {
                    let _ = inner.apply_profile(&token, result).await;
                }
                None => debug!("Session dropped before profile refresh completed"),
            }
        })
    }
}

impl Inner {
    fn emit(&self, event: SessionEvent) {
        debug!("Session event: {:?}", event);
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    async fn persist(&self, token: &str) {
        if let Err(e) = self.store.save_token(token).await {
            error!("Failed to persist session token: {}", e);
        }
    }

    /// Make `token` the session token. The cached profile is dropped when the identity may have changed.
    async fn install_token(&self, token: &str, just_registered: bool) {
        let _guard = self.writer.lock().await;
        self.persist(token).await;
        self.state.send_modify(|session| {
            if session.token.as_deref() != Some(token) {
                session.current_user = None;
            }
            session.token = Some(token.to_string());
            session.pending_token = None;
            session.just_registered = just_registered;
        });
    }

    async fn hold_pending_token(&self, token: &str) {
        let _guard = self.writer.lock().await;
        if let Err(e) = self.store.delete_token().await {
            error!("Failed to remove persisted token: {}", e);
        }
        self.state.send_modify(|session| {
            session.token = None;
            session.current_user = None;
            session.pending_token = Some(token.to_string());
            session.just_registered = true;
        });
    }

    /// Finalize the pending token, provided it is `expected` when one is given.
    async fn promote_pending_token(&self, expected: Option<&str>) -> Option<String> {
        let _guard = self.writer.lock().await;
        let token = self.state.borrow().pending_token.clone()?;
        if expected.is_some_and(|expected| expected != token) {
            return None;
        }
        self.persist(&token).await;
        self.state.send_modify(|session| {
            session.token = Some(token.clone());
            session.pending_token = None;
            session.current_user = None;
            session.just_registered = false;
        });
        info!("Promoted pending token {}", mask_token(&token));
        Some(token)
    }

    async fn apply_profile(
        &self,
        token: &str,
        result: Result<UserProfile>,
    ) -> Result<UserProfile> {
        let profile = match result {
            Ok(profile) => profile,
            Err(e) => {
                warn!("Profile refresh failed, keeping cached profile: {}", e);
                self.emit(SessionEvent::ProfileRefreshFailed {
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };

        let applied = {
            let _guard = self.writer.lock().await;
            self.state.send_if_modified(|session| {
                if session.token.as_deref() != Some(token) {
                    return false;
                }
                session.current_user = Some(profile.clone());
                true
            })
        };

        if applied {
            debug!("Fetched user: {}", profile.username);
            self.emit(SessionEvent::ProfileRefreshed(profile.clone()));
        } else {
            debug!(
                "Discarding profile for {}: session token changed",
                mask_token(token)
            );
        }
        Ok(profile)
    }
}

fn non_empty_token(token: String) -> Result<String> {
    let token = token.trim();
    if token.is_empty() {
        error!("Backend returned an empty token");
        return Err(SessionError::InvalidPayload("empty token".to_string()));
    }
    Ok(token.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockSessionBackend;
    use crate::models::{LoginResponse, RegisterResponse, UploadResponse, UserSummary};
    use crate::storage::{MemoryTokenStore, MockTokenStore};
    use reqwest::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn profile(id: &str, username: &str) -> UserProfile {
        UserProfile {
            id: id.to_string(),
            username: username.to_string(),
            email: format!("{username}@b.com"),
            profile_image_url: None,
        }
    }

    fn login_response(token: &str) -> LoginResponse {
        LoginResponse {
            token: token.to_string(),
            user: UserSummary {
                id: "u1".to_string(),
                username: "a".to_string(),
                email: None,
            },
        }
    }

    fn manager_with(
        backend: MockSessionBackend,
        store: Arc<MemoryTokenStore>,
        mode: RegistrationMode,
    ) -> SessionManager {
        SessionManager::new(Arc::new(backend), store, mode)
    }

    async fn wait_for_user(manager: &SessionManager) -> UserProfile {
        let mut rx = manager.subscribe();
        let session = tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|session| session.current_user.is_some()),
        )
        .await
        .expect("profile refresh timed out")
        .expect("session dropped")
        .clone();
        session.current_user.expect("current user")
    }

    #[tokio::test]
    async fn test_login_sets_token_and_refreshes_with_it() {
        let mut backend = MockSessionBackend::new();
        backend
            .expect_login()
            .times(1)
            .returning(|_, _| Ok(login_response("T1")));
        backend
            .expect_fetch_profile()
            .withf(|token: &str| token == "T1")
            .times(1)
            .returning(|_| Ok(profile("u1", "a")));
        let store = Arc::new(MemoryTokenStore::new());
        let manager = manager_with(backend, store.clone(), RegistrationMode::Immediate);

        let outcome = manager.login("a@b.com", "pw").await.unwrap();

        assert_eq!(outcome.token, "T1");
        assert_eq!(outcome.user.id, "u1");
        assert_eq!(manager.token().as_deref(), Some("T1"));
        assert!(manager.is_authenticated());
        assert_eq!(store.load_token().await.unwrap().as_deref(), Some("T1"));
        assert_eq!(wait_for_user(&manager).await, profile("u1", "a"));
    }

    #[tokio::test]
    async fn test_login_failure_leaves_state_unchanged() {
        let mut backend = MockSessionBackend::new();
        backend.expect_login().times(1).returning(|_, _| {
            Err(SessionError::InvalidResponse {
                status: StatusCode::UNAUTHORIZED,
                body: "bad credentials".to_string(),
            })
        });
        let store = Arc::new(MemoryTokenStore::new());
        let manager = manager_with(backend, store.clone(), RegistrationMode::Immediate);

        let err = manager.login("a@b.com", "wrong").await.unwrap_err();

        assert!(err.is_transport());
        assert_eq!(manager.session(), Session::default());
        assert_eq!(store.load_token().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_login_rejects_empty_token() {
        let mut backend = MockSessionBackend::new();
        backend
            .expect_login()
            .returning(|_, _| Ok(login_response("  ")));
        let manager = manager_with(
            backend,
            Arc::new(MemoryTokenStore::new()),
            RegistrationMode::Immediate,
        );

        let err = manager.login("a@b.com", "pw").await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidPayload(_)));
        assert!(!manager.is_authenticated());
    }

    #[tokio::test]
    async fn test_register_finalizes_token_immediately() {
        let mut backend = MockSessionBackend::new();
        backend
            .expect_register()
            .withf(|_email: &str, _password: &str, _fullname: &str, username: &str| {
                username == "alice"
            })
            .times(1)
            .returning(|_, _, _, _| {
                Ok(RegisterResponse {
                    token: "T2".to_string(),
                })
            });
        backend
            .expect_fetch_profile()
            .withf(|token: &str| token == "T2")
            .times(1)
            .returning(|_| Ok(profile("u2", "alice")));
        let store = Arc::new(MemoryTokenStore::new());
        let manager = manager_with(backend, store.clone(), RegistrationMode::Immediate);
        let mut events = manager.events();

        let outcome = manager
            .register("alice@b.com", "pw", "Alice Doe", "Alice")
            .await
            .unwrap();

        assert!(outcome.authenticated);
        let session = manager.session();
        assert_eq!(session.token.as_deref(), Some("T2"));
        assert!(session.just_registered);
        assert!(session.pending_token.is_none());
        assert_eq!(store.load_token().await.unwrap().as_deref(), Some("T2"));
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::Registered {
                authenticated: true
            }
        );
        wait_for_user(&manager).await;

        manager.finish_onboarding().await.unwrap();
        assert!(!manager.session().just_registered);
        assert_eq!(manager.token().as_deref(), Some("T2"));
    }

    #[tokio::test]
    async fn test_deferred_registration_promotes_after_upload() {
        let mut backend = MockSessionBackend::new();
        backend.expect_register().returning(|_, _, _, _| {
            Ok(RegisterResponse {
                token: "T3".to_string(),
            })
        });
        backend
            .expect_upload_profile_image()
            .withf(|token: &str, image: &Vec<u8>| token == "T3" && image.len() == 3)
            .times(1)
            .returning(|_, _| {
                Ok(UploadResponse {
                    image_url: "https://cdn.example.com/u3.jpg".to_string(),
                })
            });
        backend
            .expect_fetch_profile()
            .withf(|token: &str| token == "T3")
            .times(1)
            .returning(|_| {
                let mut user = profile("u3", "carol");
                user.profile_image_url = Some("https://cdn.example.com/u3.jpg".to_string());
                Ok(user)
            });
        let store = Arc::new(MemoryTokenStore::new());
        let manager = manager_with(
            backend,
            store.clone(),
            RegistrationMode::DeferredUntilProfileImage,
        );

        let outcome = manager
            .register("carol@b.com", "pw", "Carol", "carol")
            .await
            .unwrap();
        assert!(!outcome.authenticated);
        let session = manager.session();
        assert!(!session.is_authenticated());
        assert_eq!(session.pending_token.as_deref(), Some("T3"));
        assert!(session.just_registered);
        assert_eq!(store.load_token().await.unwrap(), None);

        let url = manager.upload_profile_image(vec![0xFF, 0xD8, 0xFF]).await.unwrap();
        assert_eq!(url, "https://cdn.example.com/u3.jpg");

        let session = manager.session();
        assert_eq!(session.token.as_deref(), Some("T3"));
        assert!(session.pending_token.is_none());
        assert!(!session.just_registered);
        assert_eq!(store.load_token().await.unwrap().as_deref(), Some("T3"));
        assert_eq!(
            wait_for_user(&manager).await.avatar_url(),
            "https://cdn.example.com/u3.jpg"
        );
    }

    #[tokio::test]
    async fn test_abandon_onboarding_discards_pending_token() {
        let mut backend = MockSessionBackend::new();
        backend.expect_register().returning(|_, _, _, _| {
            Ok(RegisterResponse {
                token: "T4".to_string(),
            })
        });
        let manager = manager_with(
            backend,
            Arc::new(MemoryTokenStore::new()),
            RegistrationMode::DeferredUntilProfileImage,
        );

        manager.register("d@b.com", "pw", "Dan", "dan").await.unwrap();
        manager.abandon_onboarding().await;

        assert_eq!(manager.session(), Session::default());
        assert!(matches!(
            manager.finish_onboarding().await,
            Err(SessionError::NoActiveSession)
        ));
    }

    #[tokio::test]
    async fn test_upload_without_session_makes_no_request() {
        // Any backend call would panic on the missing expectation
        let backend = MockSessionBackend::new();
        let manager = manager_with(
            backend,
            Arc::new(MemoryTokenStore::new()),
            RegistrationMode::Immediate,
        );

        let err = manager.upload_profile_image(vec![1, 2, 3]).await.unwrap_err();
        assert!(matches!(err, SessionError::NoActiveSession));
    }

    #[tokio::test]
    async fn test_refresh_failure_keeps_stale_profile() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut backend = MockSessionBackend::new();
        backend
            .expect_login()
            .returning(|_, _| Ok(login_response("T1")));
        backend.expect_fetch_profile().times(2).returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(profile("u1", "a"))
            } else {
                Err(SessionError::Network("connection reset".to_string()))
            }
        });
        let manager = manager_with(
            backend,
            Arc::new(MemoryTokenStore::new()),
            RegistrationMode::Immediate,
        );

        manager.login("a@b.com", "pw").await.unwrap();
        let cached = wait_for_user(&manager).await;
        let mut events = manager.events();

        let err = manager.refresh_profile("T1").await.unwrap_err();

        assert!(matches!(err, SessionError::Network(_)));
        assert_eq!(manager.current_user(), Some(cached));
        assert!(matches!(
            events.recv().await.unwrap(),
            SessionEvent::ProfileRefreshFailed { .. }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_refresh_for_stale_token_is_discarded() {
        let mut backend = MockSessionBackend::new();
        backend
            .expect_fetch_profile()
            .returning(|_| Ok(profile("old", "someone-else")));
        let manager = manager_with(
            backend,
            Arc::new(MemoryTokenStore::new()),
            RegistrationMode::Immediate,
        );

        let mut events = manager.events();

        let fetched = manager.refresh_profile("OLD").await.unwrap();

        assert_eq!(fetched.id, "old");
        assert!(manager.current_user().is_none());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_refresh_replaces_cached_user_wholesale() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut backend = MockSessionBackend::new();
        backend
            .expect_login()
            .returning(|_, _| Ok(login_response("T1")));
        backend
            .expect_fetch_profile()
            .withf(|token: &str| token == "T1")
            .times(2)
            .returning(move |_| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    let mut user = profile("u1", "a");
                    user.profile_image_url = Some("https://cdn.example.com/old.jpg".to_string());
                    Ok(user)
                } else {
                    Ok(profile("u1", "a-renamed"))
                }
            });
        let manager = manager_with(
            backend,
            Arc::new(MemoryTokenStore::new()),
            RegistrationMode::Immediate,
        );

        manager.login("a@b.com", "pw").await.unwrap();
        wait_for_user(&manager).await;
        manager.refresh_profile("T1").await.unwrap();

        // no field of the previous record survives
        assert_eq!(manager.current_user(), Some(profile("u1", "a-renamed")));
    }

    #[tokio::test]
    async fn test_register_failure_leaves_state_and_store_untouched() {
        let mut backend = MockSessionBackend::new();
        backend
            .expect_login()
            .returning(|_, _| Ok(login_response("T1")));
        backend
            .expect_fetch_profile()
            .times(1)
            .returning(|_| Ok(profile("u1", "a")));
        backend.expect_register().times(1).returning(|_, _, _, _| {
            Err(SessionError::InvalidResponse {
                status: StatusCode::CONFLICT,
                body: "exists".to_string(),
            })
        });
        let store = Arc::new(MemoryTokenStore::new());
        let manager = manager_with(backend, store.clone(), RegistrationMode::Immediate);

        manager.login("a@b.com", "pw").await.unwrap();
        wait_for_user(&manager).await;
        let before = manager.session();

        let err = manager
            .register("b@b.com", "pw", "Bea", "bea")
            .await
            .unwrap_err();

        assert!(err.is_transport());
        assert_eq!(manager.session(), before);
        assert_eq!(store.load_token().await.unwrap().as_deref(), Some("T1"));
    }

    #[tokio::test]
    async fn test_upload_failure_leaves_session_unchanged() {
        let mut backend = MockSessionBackend::new();
        backend.expect_register().returning(|_, _, _, _| {
            Ok(RegisterResponse {
                token: "T2".to_string(),
            })
        });
        backend
            .expect_fetch_profile()
            .times(1)
            .returning(|_| Ok(profile("u2", "alice")));
        backend
            .expect_upload_profile_image()
            .times(1)
            .returning(|_, _| Err(SessionError::Network("connection reset".to_string())));
        let store = Arc::new(MemoryTokenStore::new());
        let manager = manager_with(backend, store.clone(), RegistrationMode::Immediate);

        manager
            .register("alice@b.com", "pw", "Alice", "alice")
            .await
            .unwrap();
        wait_for_user(&manager).await;
        let before = manager.session();

        let err = manager.upload_profile_image(vec![0xFF, 0xD8]).await.unwrap_err();

        assert!(matches!(err, SessionError::Network(_)));
        assert_eq!(manager.session(), before);
        assert!(manager.session().just_registered);
        assert_eq!(store.load_token().await.unwrap().as_deref(), Some("T2"));
    }

    #[tokio::test]
    async fn test_upload_refreshes_with_final_token_and_ends_onboarding() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut backend = MockSessionBackend::new();
        backend.expect_register().returning(|_, _, _, _| {
            Ok(RegisterResponse {
                token: "T2".to_string(),
            })
        });
        backend
            .expect_upload_profile_image()
            .withf(|token: &str, _image: &Vec<u8>| token == "T2")
            .times(1)
            .returning(|_, _| {
                Ok(UploadResponse {
                    image_url: "https://cdn.example.com/u2.jpg".to_string(),
                })
            });
        backend
            .expect_fetch_profile()
            .withf(|token: &str| token == "T2")
            .times(2)
            .returning(move |_| {
                let mut user = profile("u2", "alice");
                if counter.fetch_add(1, Ordering::SeqCst) > 0 {
                    user.profile_image_url = Some("https://cdn.example.com/u2.jpg".to_string());
                }
                Ok(user)
            });
        let manager = manager_with(
            backend,
            Arc::new(MemoryTokenStore::new()),
            RegistrationMode::Immediate,
        );

        manager
            .register("alice@b.com", "pw", "Alice", "alice")
            .await
            .unwrap();
        wait_for_user(&manager).await;
        let mut events = manager.events();

        manager.upload_profile_image(vec![0xFF, 0xD8]).await.unwrap();

        assert!(!manager.session().just_registered);
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::ProfileImageUploaded {
                url: "https://cdn.example.com/u2.jpg".to_string()
            }
        );
        assert_eq!(events.recv().await.unwrap(), SessionEvent::OnboardingFinished);

        let mut rx = manager.subscribe();
        let session = tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|session| {
                session
                    .current_user
                    .as_ref()
                    .is_some_and(|user| user.profile_image_url.is_some())
            }),
        )
        .await
        .expect("profile refresh timed out")
        .expect("session dropped")
        .clone();
        assert_eq!(
            session.current_user.map(|user| user.avatar_url().to_string()),
            Some("https://cdn.example.com/u2.jpg".to_string())
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_logout_while_offline_clears_everything() {
        let mut backend = MockSessionBackend::new();
        backend
            .expect_login()
            .returning(|_, _| Ok(login_response("T1")));
        backend
            .expect_fetch_profile()
            .returning(|_| Ok(profile("u1", "a")));
        backend
            .expect_logout()
            .withf(|token: &str| token == "T1")
            .times(1)
            .returning(|_| Err(SessionError::Network("offline".to_string())));
        let store = Arc::new(MemoryTokenStore::new());
        let manager = manager_with(backend, store.clone(), RegistrationMode::Immediate);

        manager.login("a@b.com", "pw").await.unwrap();
        wait_for_user(&manager).await;
        manager.logout().await;

        let session = manager.session();
        assert!(session.token.is_none());
        assert!(session.current_user.is_none());
        assert!(!session.is_authenticated());
        assert_eq!(store.load_token().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_logout_without_session_skips_backend() {
        let backend = MockSessionBackend::new();
        let manager = manager_with(
            backend,
            Arc::new(MemoryTokenStore::new()),
            RegistrationMode::Immediate,
        );
        let mut events = manager.events();

        manager.logout().await;

        assert_eq!(events.recv().await.unwrap(), SessionEvent::LoggedOut);
        assert!(!manager.is_authenticated());
    }

    #[tokio::test]
    async fn test_initialize_restores_token_and_refreshes_once() {
        let mut backend = MockSessionBackend::new();
        backend
            .expect_fetch_profile()
            .withf(|token: &str| token == "T9")
            .times(1)
            .returning(|_| Ok(profile("u9", "nine")));
        let manager = manager_with(
            backend,
            Arc::new(MemoryTokenStore::with_token("T9")),
            RegistrationMode::Immediate,
        );

        let handle = manager.initialize().await.expect("token restored");
        assert!(manager.is_authenticated());
        handle.await.unwrap();

        assert_eq!(manager.current_user().map(|u| u.id), Some("u9".to_string()));
        // a second initialize does not schedule another refresh
        assert!(manager.initialize().await.is_none());
    }

    #[tokio::test]
    async fn test_initialize_without_token_is_noop() {
        let manager = manager_with(
            MockSessionBackend::new(),
            Arc::new(MemoryTokenStore::new()),
            RegistrationMode::Immediate,
        );
        assert!(manager.initialize().await.is_none());
        assert!(!manager.is_authenticated());
    }

    #[tokio::test]
    async fn test_persistence_failure_does_not_fail_login() {
        let mut store = MockTokenStore::new();
        store
            .expect_save_token()
            .returning(|_| Err(SessionError::Persistence("disk full".to_string())));
        let mut backend = MockSessionBackend::new();
        backend
            .expect_login()
            .returning(|_, _| Ok(login_response("T1")));
        backend
            .expect_fetch_profile()
            .returning(|_| Ok(profile("u1", "a")));
        let manager =
            SessionManager::new(Arc::new(backend), Arc::new(store), RegistrationMode::Immediate);

        manager.login("a@b.com", "pw").await.unwrap();

        assert_eq!(manager.token().as_deref(), Some("T1"));
        wait_for_user(&manager).await;
    }
}
