//! Keyed session cache for the vSphere backend.
//!
//! One authenticated session exists per (server, datacenter, username)
//! triple at a time and is shared by every concurrent reconcile
//! addressing that triple. `get_or_create` is a get-or-create cache,
//! not a pool: a cached healthy session is always reused, a broken one
//! is replaced transparently, and concurrent requests for a key that is
//! still being established share a single login attempt.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use crate::error::VsphereError;

/// Cache key: one live session per triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    /// Backend server hostname
    pub server: String,
    /// Datacenter within the server
    pub datacenter: String,
    /// Login username
    pub username: String,
}

/// Everything needed to establish a session.
#[derive(Debug, Clone)]
pub struct SessionParams {
    /// Backend server hostname
    pub server: String,
    /// Datacenter within the server
    pub datacenter: String,
    /// Login username
    pub username: String,
    /// Login password
    pub password: String,
    /// Expected TLS thumbprint, if pinned
    pub thumbprint: Option<String>,
}

impl SessionParams {
    /// The cache key for these parameters.
    pub fn key(&self) -> SessionKey {
        SessionKey {
            server: self.server.clone(),
            datacenter: self.datacenter.clone(),
            username: self.username.clone(),
        }
    }
}

/// An authenticated handle to the backend.
#[derive(Debug)]
pub struct Session {
    /// Opaque session token returned by the backend
    pub token: String,
    /// Server this session talks to
    pub server: String,
    /// Datacenter this session is scoped to
    pub datacenter: String,
    /// Authenticated username
    pub username: String,
    healthy: AtomicBool,
}

impl Session {
    /// Creates a healthy session with the given token.
    pub fn new(token: String, params: &SessionParams) -> Self {
        Self {
            token,
            server: params.server.clone(),
            datacenter: params.datacenter.clone(),
            username: params.username.clone(),
            healthy: AtomicBool::new(true),
        }
    }

    /// Whether the session is still believed usable.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Marks the session broken so the next `get_or_create` replaces it.
    pub fn mark_broken(&self) {
        self.healthy.store(false, Ordering::Release);
    }
}

/// Performs the actual backend login.
#[async_trait::async_trait]
pub trait Authenticate: Send + Sync {
    /// Establish an authenticated session for the given parameters.
    async fn login(&self, params: &SessionParams) -> Result<Session, VsphereError>;
}

/// Logs in against the vCenter REST session endpoint.
#[derive(Debug, Clone)]
pub struct RestAuthenticator {
    http: reqwest::Client,
}

impl RestAuthenticator {
    /// Creates an authenticator with its own connection pool.
    pub fn new() -> Result<Self, VsphereError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self { http })
    }
}

#[async_trait::async_trait]
impl Authenticate for RestAuthenticator {
    async fn login(&self, params: &SessionParams) -> Result<Session, VsphereError> {
        use base64::Engine as _;

        let url = format!("https://{}/api/session", params.server);
        let basic = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", params.username, params.password));

        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Basic {basic}"))
            .send()
            .await
            .map_err(|e| VsphereError::Unreachable(format!("{}: {e}", params.server)))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(VsphereError::Authentication(format!(
                "invalid credentials for {} on {}",
                params.username, params.server
            )));
        }
        if !response.status().is_success() {
            return Err(VsphereError::Authentication(format!(
                "session endpoint returned {} for {}",
                response.status(),
                params.server
            )));
        }

        let token: String = response.json().await?;
        info!(server = %params.server, username = %params.username, "established backend session");
        Ok(Session::new(token, params))
    }
}

/// Process-wide session cache, created at startup and injected into the
/// reconcilers.
pub struct SessionManager {
    authenticator: Arc<dyn Authenticate>,
    sessions: Mutex<HashMap<SessionKey, Arc<OnceCell<Arc<Session>>>>>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager").finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Creates an empty cache backed by the given authenticator.
    pub fn new(authenticator: Arc<dyn Authenticate>) -> Self {
        Self {
            authenticator,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the live session for the key, logging in at most once per
    /// key no matter how many callers arrive concurrently.
    pub async fn get_or_create(
        &self,
        params: SessionParams,
    ) -> Result<Arc<Session>, VsphereError> {
        let key = params.key();

        let cell = {
            let mut sessions = self.sessions.lock().await;
            if let Some(cell) = sessions.get(&key) {
                match cell.get() {
                    Some(session) if session.is_healthy() => {
                        debug!(server = %key.server, username = %key.username, "reusing cached session");
                        return Ok(Arc::clone(session));
                    }
                    Some(_) => {
                        warn!(server = %key.server, username = %key.username, "cached session broken, replacing");
                        sessions.remove(&key);
                    }
                    // Login in flight; share it.
                    None => {}
                }
            }
            Arc::clone(
                sessions
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(OnceCell::new())),
            )
        };

        let result = cell
            .get_or_try_init(|| async {
                self.authenticator.login(&params).await.map(Arc::new)
            })
            .await;

        match result {
            Ok(session) => Ok(Arc::clone(session)),
            Err(e) => {
                // Evict the failed attempt so the next caller retries.
                let mut sessions = self.sessions.lock().await;
                if let Some(existing) = sessions.get(&key) {
                    if Arc::ptr_eq(existing, &cell) && existing.get().is_none() {
                        sessions.remove(&key);
                    }
                }
                Err(e)
            }
        }
    }

    /// Number of cached keys, for tests and introspection.
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Whether the cache is empty.
    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingAuthenticator {
        logins: AtomicUsize,
        fail_first: AtomicBool,
    }

    impl CountingAuthenticator {
        fn new() -> Self {
            Self {
                logins: AtomicUsize::new(0),
                fail_first: AtomicBool::new(false),
            }
        }

        fn failing_once() -> Self {
            Self {
                logins: AtomicUsize::new(0),
                fail_first: AtomicBool::new(true),
            }
        }

        fn login_count(&self) -> usize {
            self.logins.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl Authenticate for CountingAuthenticator {
        async fn login(&self, params: &SessionParams) -> Result<Session, VsphereError> {
            let n = self.logins.fetch_add(1, Ordering::SeqCst);
            // Let concurrent callers pile up on the in-flight cell.
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            if n == 0 && self.fail_first.swap(false, Ordering::SeqCst) {
                return Err(VsphereError::Authentication("first attempt fails".into()));
            }
            Ok(Session::new(format!("token-{n}"), params))
        }
    }

    fn params(server: &str) -> SessionParams {
        SessionParams {
            server: server.to_string(),
            datacenter: "dc0".to_string(),
            username: "admin".to_string(),
            password: "secret".to_string(),
            thumbprint: None,
        }
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_login() {
        let auth = Arc::new(CountingAuthenticator::new());
        let manager = Arc::new(SessionManager::new(auth.clone()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let m = Arc::clone(&manager);
            handles.push(tokio::spawn(
                async move { m.get_or_create(params("vc1")).await },
            ));
        }

        let mut tokens = Vec::new();
        for h in handles {
            tokens.push(h.await.unwrap().unwrap().token.clone());
        }

        assert_eq!(auth.login_count(), 1);
        assert!(tokens.iter().all(|t| t == &tokens[0]));
    }

    #[tokio::test]
    async fn distinct_keys_get_distinct_sessions() {
        let auth = Arc::new(CountingAuthenticator::new());
        let manager = SessionManager::new(auth.clone());

        let a = manager.get_or_create(params("vc1")).await.unwrap();
        let b = manager.get_or_create(params("vc2")).await.unwrap();

        assert_eq!(auth.login_count(), 2);
        assert_ne!(a.token, b.token);
        assert_eq!(manager.len().await, 2);
    }

    #[tokio::test]
    async fn failed_login_is_retried_on_next_call() {
        let auth = Arc::new(CountingAuthenticator::failing_once());
        let manager = SessionManager::new(auth.clone());

        assert!(manager.get_or_create(params("vc1")).await.is_err());
        assert!(manager.is_empty().await);

        let session = manager.get_or_create(params("vc1")).await.unwrap();
        assert_eq!(auth.login_count(), 2);
        assert!(session.is_healthy());
    }

    #[tokio::test]
    async fn broken_session_is_replaced() {
        let auth = Arc::new(CountingAuthenticator::new());
        let manager = SessionManager::new(auth.clone());

        let first = manager.get_or_create(params("vc1")).await.unwrap();
        first.mark_broken();

        let second = manager.get_or_create(params("vc1")).await.unwrap();
        assert_eq!(auth.login_count(), 2);
        assert_ne!(first.token, second.token);
        assert!(second.is_healthy());
    }
}
