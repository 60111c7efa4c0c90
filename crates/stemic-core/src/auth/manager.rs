//! Session lifecycle: startup verification, login/logout, single-flight
//! refresh, and the forced-logout path.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::claims::{decode, Claims, Role};
use super::error::{RefreshError, SessionError};
use super::monitor::ExpiryMonitor;
use super::store::{ProfileCache, TokenStore, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, USER_PROFILE_KEY};
use super::RefreshEndpoint;
use crate::config::{DEFAULT_CHECK_INTERVAL_SECS, DEFAULT_REFRESH_THRESHOLD_SECS};
use crate::notify::{LogNotifier, Navigator, NoopNavigator, Notifier, SESSION_EXPIRED_MESSAGE};

type SharedRefresh = Shared<BoxFuture<'static, Result<Claims, RefreshError>>>;

/// Timing knobs for the background expiry check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    /// How often the stored token is inspected while a session is active
    pub check_interval: std::time::Duration,
    /// Remaining lifetime under which a refresh is started
    pub refresh_threshold: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            check_interval: std::time::Duration::from_secs(DEFAULT_CHECK_INTERVAL_SECS),
            refresh_threshold: Duration::seconds(DEFAULT_REFRESH_THRESHOLD_SECS as i64),
        }
    }
}

/// In-memory authentication state, published to subscribers on every change.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionState {
    pub access_token: Option<String>,
    pub claims: Option<Claims>,
    /// True until startup verification has finished. Nothing should render an
    /// authenticated/unauthenticated decision while this is set.
    pub is_initializing: bool,
}

impl SessionState {
    fn initializing() -> Self {
        Self {
            access_token: None,
            claims: None,
            is_initializing: true,
        }
    }

    /// Holds a token whose claims are present and not expired
    pub fn is_authenticated(&self) -> bool {
        self.access_token.is_some() && self.claims.as_ref().is_some_and(|c| !c.is_expired())
    }

    pub fn role(&self) -> Option<Role> {
        self.claims.as_ref().map(|c| c.role)
    }

    fn establish(&mut self, token: String, claims: Claims) {
        self.access_token = Some(token);
        self.claims = Some(claims);
    }

    /// Returns whether there was anything to clear
    fn clear(&mut self) -> bool {
        let had_session = self.access_token.is_some() || self.claims.is_some();
        self.access_token = None;
        self.claims = None;
        had_session
    }
}

// Tokens never reach the logs
impl fmt::Debug for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionState")
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("claims", &self.claims)
            .field("is_initializing", &self.is_initializing)
            .finish()
    }
}

/// Single owner of the client's authentication state.
///
/// Clone is cheap and every clone drives the same session. The background
/// expiry check stops on logout, forced logout, [`SessionManager::dispose`],
/// or when the last clone is dropped.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

pub struct SessionManagerBuilder {
    store: Arc<dyn TokenStore>,
    endpoint: Arc<dyn RefreshEndpoint>,
    notifier: Arc<dyn Notifier>,
    navigator: Arc<dyn Navigator>,
    settings: SessionSettings,
}

impl SessionManagerBuilder {
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn navigator(mut self, navigator: Arc<dyn Navigator>) -> Self {
        self.navigator = navigator;
        self
    }

    pub fn settings(mut self, settings: SessionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> SessionManager {
        let (state, _) = watch::channel(SessionState::initializing());
        SessionManager {
            inner: Arc::new(Inner {
                store: self.store,
                endpoint: self.endpoint,
                notifier: self.notifier,
                navigator: self.navigator,
                settings: self.settings,
                state,
                in_flight: Mutex::new(None),
                monitor: Mutex::new(None),
                write_lock: Mutex::new(()),
                epoch: AtomicU64::new(0),
                initialized: AtomicBool::new(false),
            }),
        }
    }
}

impl SessionManager {
    pub fn builder(
        store: Arc<dyn TokenStore>,
        endpoint: Arc<dyn RefreshEndpoint>,
    ) -> SessionManagerBuilder {
        SessionManagerBuilder {
            store,
            endpoint,
            notifier: Arc::new(LogNotifier),
            navigator: Arc::new(NoopNavigator),
            settings: SessionSettings::default(),
        }
    }

    /// Verify the persisted session once at startup.
    ///
    /// Always ends with `is_initializing == false`. Later calls return the
    /// current state without touching anything.
    pub async fn initialize(&self) -> SessionState {
        if self.inner.initialized.swap(true, Ordering::SeqCst) {
            debug!("Session already initialized");
            return self.state();
        }

        self.inner.verify_stored_session().await;
        self.inner.state.send_modify(|s| s.is_initializing = false);

        let state = self.state();
        info!(
            authenticated = state.is_authenticated(),
            role = ?state.role(),
            "Session initialized"
        );
        state
    }

    /// Adopt a token pair issued by a credential exchange.
    ///
    /// The token is only decoded, never verified. Tokens that cannot be
    /// decoded or are already expired are refused and nothing changes.
    pub fn login(&self, access_token: &str, refresh_token: Option<&str>) -> Result<Claims, SessionError> {
        let claims = decode(access_token).ok_or(SessionError::MalformedToken)?;
        if claims.is_expired() {
            return Err(SessionError::ExpiredToken);
        }

        {
            let _write = self.inner.write_guard();
            let previous = self.inner.stored_pair();
            if let Err(e) = self.inner.write_pair(access_token, refresh_token) {
                error!(error = %e, "Failed to persist session, login refused");
                self.inner.restore_pair(previous);
                return Err(SessionError::Storage(e.to_string()));
            }
            self.inner
                .state
                .send_modify(|s| s.establish(access_token.to_string(), claims.clone()));
        }
        self.inner.ensure_monitor();

        info!(
            role = %claims.role,
            expires_in_minutes = claims.minutes_until_expiry(),
            has_refresh_token = refresh_token.is_some(),
            "Signed in"
        );
        Ok(claims)
    }

    /// Exchange the stored refresh token for a new access token.
    ///
    /// Concurrent callers share one network exchange and all observe its
    /// outcome. Any failure ends the session: storage is cleared, the user is
    /// told the session expired, and the UI is sent to the login entry point.
    /// The exception is [`RefreshError::SessionEnded`]: the session the
    /// refresh belonged to is already gone, and whatever replaced it is left alone.
    pub async fn refresh(&self) -> Result<Claims, RefreshError> {
        let result = self.inner.shared_refresh().await;
        if let Err(ref e) = result {
            self.inner.end_session_after(e);
        }
        result
    }

    /// Clear the session. Calling it again is a no-op.
    pub fn logout(&self) {
        if self.inner.clear_session() {
            info!("Signed out");
        } else {
            debug!("Logout without an active session");
        }
    }

    /// Whether the stored token decodes and will expire within the refresh threshold.
    ///
    /// Missing, malformed and already-expired tokens all answer `false`.
    pub fn check_expiry_soon(&self) -> bool {
        self.inner.check_expiry_soon()
    }

    /// Stop background activity. The session itself is left as is.
    pub fn dispose(&self) {
        self.inner.stop_monitor();
        debug!("Session manager disposed");
    }

    pub fn state(&self) -> SessionState {
        self.inner.state.borrow().clone()
    }

    /// Receive every state change, e.g. to re-render on forced logout
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.state.borrow().is_authenticated()
    }

    pub fn is_initializing(&self) -> bool {
        self.inner.state.borrow().is_initializing
    }

    pub fn claims(&self) -> Option<Claims> {
        self.inner.state.borrow().claims.clone()
    }

    /// Token for the `Authorization` header, only while authenticated
    pub fn bearer_token(&self) -> Option<String> {
        let state = self.inner.state.borrow();
        if state.is_authenticated() {
            state.access_token.clone()
        } else {
            None
        }
    }

    pub fn settings(&self) -> SessionSettings {
        self.inner.settings
    }

    /// Store backing this session, for read access to the profile entries
    pub fn store(&self) -> &dyn TokenStore {
        self.inner.store.as_ref()
    }

    #[cfg(test)]
    fn monitor_running(&self) -> bool {
        lock(&self.inner.monitor).as_ref().is_some_and(|m| m.is_running())
    }
}

pub(crate) struct Inner {
    store: Arc<dyn TokenStore>,
    endpoint: Arc<dyn RefreshEndpoint>,
    notifier: Arc<dyn Notifier>,
    navigator: Arc<dyn Navigator>,
    settings: SessionSettings,
    state: watch::Sender<SessionState>,
    /// In-flight refresh, tagged with the epoch it was started in
    in_flight: Mutex<Option<(u64, SharedRefresh)>>,
    monitor: Mutex<Option<ExpiryMonitor>>,
    /// Serializes every write to the token keys
    write_lock: Mutex<()>,
    /// Bumped whenever the session is cleared, so a refresh that started
    /// before a logout cannot resurrect it.
    epoch: AtomicU64,
    initialized: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    fn write_guard(&self) -> MutexGuard<'_, ()> {
        lock(&self.write_lock)
    }

    async fn verify_stored_session(self: &Arc<Self>) {
        let token = match self.store.get(ACCESS_TOKEN_KEY) {
            Ok(Some(token)) => token,
            Ok(None) => {
                debug!("No stored access token");
                return;
            }
            Err(e) => {
                error!(error = %e, "Failed to read session store");
                return;
            }
        };

        let Some(claims) = decode(&token) else {
            warn!("Stored access token is malformed, clearing session");
            self.clear_session();
            return;
        };

        if claims.is_expired() {
            info!("Stored access token expired, attempting refresh");
            if let Err(e) = self.shared_refresh().await {
                self.end_session_after(&e);
            }
            return;
        }

        {
            let _write = self.write_guard();
            self.state.send_modify(|s| s.establish(token, claims));
        }
        self.ensure_monitor();
    }

    /// Join the in-flight refresh of the current session, or start one
    async fn shared_refresh(self: &Arc<Self>) -> Result<Claims, RefreshError> {
        let flight = {
            let mut slot = lock(&self.in_flight);
            let epoch = self.epoch.load(Ordering::SeqCst);
            match slot.as_ref() {
                Some((started, flight)) if *started == epoch => {
                    debug!("Joining in-flight token refresh");
                    flight.clone()
                }
                _ => {
                    let inner = Arc::clone(self);
                    let flight = async move {
                        let result = inner.exchange_refresh_token(epoch).await;
                        let mut slot = lock(&inner.in_flight);
                        if slot.as_ref().is_some_and(|(started, _)| *started == epoch) {
                            slot.take();
                        }
                        result
                    }
                    .boxed()
                    .shared();
                    *slot = Some((epoch, flight.clone()));
                    flight
                }
            }
        };
        flight.await
    }

    async fn exchange_refresh_token(self: &Arc<Self>, started_epoch: u64) -> Result<Claims, RefreshError> {

        let refresh_token = match self.store.get(REFRESH_TOKEN_KEY) {
            Ok(Some(token)) if !token.is_empty() => token,
            Ok(_) => return Err(RefreshError::MissingRefreshToken),
            Err(e) => return Err(RefreshError::Storage(e.to_string())),
        };

        debug!("Requesting new access token");
        let pair = self.endpoint.refresh(&refresh_token).await.map_err(|e| {
            warn!(error = %e, "Token refresh request failed");
            RefreshError::from(e)
        })?;

        let claims = decode(&pair.access_token).ok_or(RefreshError::MalformedToken)?;
        if claims.is_expired() {
            return Err(RefreshError::ExpiredToken);
        }

        {
            let _write = self.write_guard();
            if self.epoch.load(Ordering::SeqCst) != started_epoch {
                debug!("Session ended during refresh, discarding new token");
                return Err(RefreshError::SessionEnded);
            }

            self.store
                .set(ACCESS_TOKEN_KEY, &pair.access_token)
                .map_err(|e| RefreshError::Storage(e.to_string()))?;
            if let Some(ref rotated) = pair.refresh_token {
                self.store
                    .set(REFRESH_TOKEN_KEY, rotated)
                    .map_err(|e| RefreshError::Storage(e.to_string()))?;
            }
            if let Some(ref user) = pair.user {
                if let Err(e) = ProfileCache::new(self.store.as_ref()).save(user) {
                    warn!(error = %e, "Failed to cache user profile");
                }
            }
            let token = pair.access_token;
            let new_claims = claims.clone();
            self.state.send_modify(move |s| s.establish(token, new_claims));
        }
        self.ensure_monitor();

        info!(
            expires_in_minutes = claims.minutes_until_expiry(),
            rotated = pair.refresh_token.is_some(),
            "Access token refreshed"
        );
        Ok(claims)
    }

    /// One tick of the background loop. Returns whether the loop should keep running.
    pub(crate) async fn run_expiry_check(self: &Arc<Self>) -> bool {
        let token = match self.store.get(ACCESS_TOKEN_KEY) {
            Ok(Some(token)) => token,
            Ok(None) => {
                debug!("No stored access token, ending expiry check");
                return false;
            }
            Err(e) => {
                warn!(error = %e, "Failed to read session store during expiry check");
                return true;
            }
        };

        let Some(claims) = decode(&token) else {
            warn!("Stored access token is malformed, clearing session");
            self.clear_session();
            return false;
        };

        let now = Utc::now();
        if claims.is_expired_at(now) {
            warn!("Access token expired before a background refresh, refreshing now");
            return match self.shared_refresh().await {
                Ok(_) => true,
                Err(e) => {
                    self.end_session_after(&e);
                    false
                }
            };
        }

        if !claims.expires_soon_at(now, self.settings.refresh_threshold) {
            return true;
        }

        info!(
            seconds_left = claims.time_until_expiry_at(now).num_seconds(),
            "Access token expiring soon, refreshing"
        );
        match self.shared_refresh().await {
            Ok(_) => true,
            Err(e) if e.is_transient() => {
                warn!(error = %e, "Background refresh failed, retrying on next check");
                true
            }
            Err(e) => {
                self.end_session_after(&e);
                false
            }
        }
    }

    fn check_expiry_soon(&self) -> bool {
        let token = match self.store.get(ACCESS_TOKEN_KEY) {
            Ok(Some(token)) => token,
            Ok(None) => return false,
            Err(e) => {
                warn!(error = %e, "Failed to read session store");
                return false;
            }
        };
        decode(&token)
            .map(|c| c.expires_soon_at(Utc::now(), self.settings.refresh_threshold))
            .unwrap_or(false)
    }

    /// Apply a failed refresh to the session it was started for.
    fn end_session_after(&self, failure: &RefreshError) {
        if *failure == RefreshError::SessionEnded {
            debug!("Refresh outlived its session, nothing to end");
            return;
        }
        self.force_logout(failure);
    }

    /// System-initiated logout. The user is told and redirected once, by
    /// whichever caller actually ended the session.
    fn force_logout(&self, reason: &RefreshError) {
        if !self.clear_session() {
            debug!(reason = %reason, "Session already ended");
            return;
        }

        warn!(reason = %reason, "Session expired, forcing logout");
        if let Err(e) = self.notifier.notify(SESSION_EXPIRED_MESSAGE) {
            warn!(error = %e, "Failed to show session expired notice");
        }
        self.navigator.redirect_to_login();
    }

    /// Remove the session from storage and memory and stop the expiry check.
    /// Returns whether a session (stored or in memory) existed.
    fn clear_session(&self) -> bool {
        let had_session = {
            let _write = self.write_guard();
            self.epoch.fetch_add(1, Ordering::SeqCst);
            // a refresh of the old session must never be joined by the next one
            lock(&self.in_flight).take();

            let stored = matches!(self.store.get(ACCESS_TOKEN_KEY), Ok(Some(_)));
            for key in [ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, USER_PROFILE_KEY] {
                if let Err(e) = self.store.remove(key) {
                    error!(error = %e, key, "Failed to clear session store entry");
                }
            }

            let mut in_memory = false;
            self.state.send_if_modified(|s| {
                in_memory = s.clear();
                in_memory
            });
            stored || in_memory
        };
        self.stop_monitor();
        had_session
    }

    fn stored_pair(&self) -> (Option<String>, Option<String>) {
        (
            self.store.get(ACCESS_TOKEN_KEY).ok().flatten(),
            self.store.get(REFRESH_TOKEN_KEY).ok().flatten(),
        )
    }

    fn write_pair(&self, access_token: &str, refresh_token: Option<&str>) -> anyhow::Result<()> {
        self.store.set(ACCESS_TOKEN_KEY, access_token)?;
        match refresh_token {
            Some(refresh) => self.store.set(REFRESH_TOKEN_KEY, refresh),
            None => self.store.remove(REFRESH_TOKEN_KEY),
        }
    }

    /// Best-effort undo of a partially written token pair
    fn restore_pair(&self, (access, refresh): (Option<String>, Option<String>)) {
        for (key, value) in [(ACCESS_TOKEN_KEY, access), (REFRESH_TOKEN_KEY, refresh)] {
            let result = match value {
                Some(ref value) => self.store.set(key, value),
                None => self.store.remove(key),
            };
            if let Err(e) = result {
                error!(error = %e, key, "Failed to restore session store entry");
            }
        }
    }

    fn ensure_monitor(self: &Arc<Self>) {
        let mut slot = lock(&self.monitor);
        if slot.as_ref().is_some_and(|m| m.is_running()) {
            return;
        }
        if let Some(finished) = slot.take() {
            finished.stop();
        }
        *slot = ExpiryMonitor::spawn(Arc::downgrade(self), self.settings.check_interval);
    }

    fn stop_monitor(&self) {
        if let Some(monitor) = lock(&self.monitor).take() {
            monitor.stop();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            monitor.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use chrono::DateTime;

    use crate::api::ApiError;
    use crate::auth::claims::tests::token_expiring_at;
    use crate::auth::store::MemoryTokenStore;
    use crate::models::TokenPair;

    #[derive(Clone)]
    enum Reply {
        Token(TokenPair),
        Unauthorized,
        ServerDown,
    }

    struct FakeEndpoint {
        calls: AtomicUsize,
        reply: Mutex<Reply>,
        seen: Mutex<Vec<String>>,
    }

    impl FakeEndpoint {
        fn new(reply: Reply) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                reply: Mutex::new(reply),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn issuing(access_token: &str) -> Arc<Self> {
            Self::new(Reply::Token(TokenPair {
                access_token: access_token.to_string(),
                refresh_token: None,
                user: None,
            }))
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RefreshEndpoint for FakeEndpoint {
        async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            lock(&self.seen).push(refresh_token.to_string());
            let reply = lock(&self.reply).clone();
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            match reply {
                Reply::Token(pair) => Ok(pair),
                Reply::Unauthorized => Err(ApiError::Unauthorized),
                Reply::ServerDown => Err(ApiError::ServerError("bad gateway".to_string())),
            }
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        messages: Mutex<Vec<String>>,
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, message: &str) -> anyhow::Result<()> {
            lock(&self.messages).push(message.to_string());
            Ok(())
        }
    }

    struct FailingNotifier;

    impl Notifier for FailingNotifier {
        fn notify(&self, _message: &str) -> anyhow::Result<()> {
            anyhow::bail!("no display attached")
        }
    }

    #[derive(Default)]
    struct RecordingNavigator {
        redirects: AtomicUsize,
    }

    impl Navigator for RecordingNavigator {
        fn redirect_to_login(&self) {
            self.redirects.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        store: Arc<MemoryTokenStore>,
        endpoint: Arc<FakeEndpoint>,
        notifier: Arc<RecordingNotifier>,
        navigator: Arc<RecordingNavigator>,
        manager: SessionManager,
    }

    impl Harness {
        fn new(endpoint: Arc<FakeEndpoint>) -> Self {
            Self::with_store(Arc::new(MemoryTokenStore::new()), endpoint)
        }

        fn with_store(store: Arc<MemoryTokenStore>, endpoint: Arc<FakeEndpoint>) -> Self {
            let notifier = Arc::new(RecordingNotifier::default());
            let navigator = Arc::new(RecordingNavigator::default());
            let manager = SessionManager::builder(store.clone(), endpoint.clone())
                .notifier(notifier.clone())
                .navigator(navigator.clone())
                .build();
            Self {
                store,
                endpoint,
                notifier,
                navigator,
                manager,
            }
        }

        fn seed(&self, access_token: &str, refresh_token: Option<&str>) {
            self.store.set(ACCESS_TOKEN_KEY, access_token).unwrap();
            if let Some(refresh) = refresh_token {
                self.store.set(REFRESH_TOKEN_KEY, refresh).unwrap();
            }
        }

        fn stored(&self, key: &str) -> Option<String> {
            self.store.get(key).unwrap()
        }

        fn redirects(&self) -> usize {
            self.navigator.redirects.load(Ordering::SeqCst)
        }

        fn notices(&self) -> Vec<String> {
            lock(&self.notifier.messages).clone()
        }
    }

    /// Memory store whose writes fail for the listed keys, or for every key
    /// when the list is empty
    struct FailingStore {
        inner: MemoryTokenStore,
        failing: Vec<&'static str>,
    }

    impl FailingStore {
        fn new(failing: Vec<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                inner: MemoryTokenStore::new(),
                failing,
            })
        }
    }

    impl TokenStore for FailingStore {
        fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
            if self.failing.is_empty() || self.failing.contains(&key) {
                anyhow::bail!("disk full");
            }
            self.inner.set(key, value)
        }

        fn remove(&self, key: &str) -> anyhow::Result<()> {
            self.inner.remove(key)
        }
    }

    fn in_minutes(minutes: i64) -> DateTime<Utc> {
        Utc::now() + Duration::minutes(minutes)
    }

    fn in_seconds(seconds: i64) -> DateTime<Utc> {
        Utc::now() + Duration::seconds(seconds)
    }

    fn fresh_token() -> String {
        token_expiring_at(in_minutes(60), "organizer")
    }

    #[tokio::test]
    async fn test_initialize_without_token() {
        let h = Harness::new(FakeEndpoint::issuing(&fresh_token()));
        assert!(h.manager.is_initializing());

        let state = h.manager.initialize().await;

        assert!(!state.is_initializing);
        assert!(!state.is_authenticated());
        assert_eq!(h.endpoint.calls(), 0);
        assert_eq!(h.redirects(), 0);
    }

    #[tokio::test]
    async fn test_initialize_with_valid_token() {
        let h = Harness::new(FakeEndpoint::issuing(&fresh_token()));
        let token = token_expiring_at(in_minutes(30), "admin");
        h.seed(&token, Some("ref-1"));

        let state = h.manager.initialize().await;

        assert!(state.is_authenticated());
        assert_eq!(state.claims, decode(&token));
        assert_eq!(state.role(), Some(Role::Admin));
        assert_eq!(h.manager.bearer_token(), Some(token));
        assert_eq!(h.endpoint.calls(), 0);
        assert!(h.manager.monitor_running());
    }

    #[tokio::test]
    async fn test_initialize_expired_token_refresh_succeeds() {
        let new_token = fresh_token();
        let h = Harness::new(FakeEndpoint::issuing(&new_token));
        h.seed(&token_expiring_at(in_seconds(-1), "user"), Some("ref-1"));

        let state = h.manager.initialize().await;

        assert!(state.is_authenticated());
        assert!(!state.is_initializing);
        assert_eq!(h.stored(ACCESS_TOKEN_KEY), Some(new_token.clone()));
        assert_eq!(state.access_token, Some(new_token));
        assert_eq!(h.endpoint.calls(), 1);
        assert_eq!(lock(&h.endpoint.seen).as_slice(), ["ref-1".to_string()]);
        assert_eq!(h.redirects(), 0);
        assert!(h.notices().is_empty());
    }

    #[tokio::test]
    async fn test_initialize_expired_token_refresh_fails() {
        let h = Harness::new(FakeEndpoint::new(Reply::Unauthorized));
        h.seed(&token_expiring_at(in_seconds(-1), "user"), Some("ref-1"));
        h.store.set(USER_PROFILE_KEY, r#"{"id":"1","email":"a@b.c"}"#).unwrap();

        let state = h.manager.initialize().await;

        assert!(!state.is_authenticated());
        assert!(!state.is_initializing);
        assert_eq!(h.stored(ACCESS_TOKEN_KEY), None);
        assert_eq!(h.stored(REFRESH_TOKEN_KEY), None);
        assert_eq!(h.stored(USER_PROFILE_KEY), None);
        assert_eq!(h.endpoint.calls(), 1);
        assert_eq!(h.redirects(), 1);
        assert_eq!(h.notices(), vec![SESSION_EXPIRED_MESSAGE.to_string()]);
    }

    #[tokio::test]
    async fn test_initialize_expired_token_without_refresh_token() {
        let h = Harness::new(FakeEndpoint::issuing(&fresh_token()));
        h.seed(&token_expiring_at(in_minutes(-10), "user"), None);

        let state = h.manager.initialize().await;

        assert!(!state.is_authenticated());
        assert_eq!(h.endpoint.calls(), 0);
        assert_eq!(h.stored(ACCESS_TOKEN_KEY), None);
        assert_eq!(h.redirects(), 1);
    }

    #[tokio::test]
    async fn test_initialize_malformed_token() {
        let h = Harness::new(FakeEndpoint::issuing(&fresh_token()));
        h.seed("not-a-jwt", Some("ref-1"));

        let state = h.manager.initialize().await;

        assert!(!state.is_authenticated());
        assert!(!state.is_initializing);
        assert_eq!(h.endpoint.calls(), 0);
        assert_eq!(h.stored(ACCESS_TOKEN_KEY), None);
        assert_eq!(h.stored(REFRESH_TOKEN_KEY), None);
        // malformed tokens are cleared quietly
        assert_eq!(h.redirects(), 0);
        assert!(h.notices().is_empty());
    }

    #[tokio::test]
    async fn test_initialize_runs_once() {
        let h = Harness::new(FakeEndpoint::issuing(&fresh_token()));
        h.manager.initialize().await;

        h.seed(&token_expiring_at(in_seconds(-1), "user"), Some("ref-1"));
        let state = h.manager.initialize().await;

        assert!(!state.is_initializing);
        assert!(!state.is_authenticated());
        assert_eq!(h.endpoint.calls(), 0);
    }

    #[tokio::test]
    async fn test_logout_then_reload_is_unauthenticated() {
        let store = Arc::new(MemoryTokenStore::new());
        let first = Harness::with_store(store.clone(), FakeEndpoint::issuing(&fresh_token()));
        first.manager.login(&fresh_token(), Some("ref-1")).unwrap();
        assert!(first.manager.is_authenticated());

        first.manager.logout();
        assert!(!first.manager.is_authenticated());
        assert!(!first.manager.monitor_running());

        let reloaded = Harness::with_store(store, FakeEndpoint::issuing(&fresh_token()));
        let state = reloaded.manager.initialize().await;
        assert!(!state.is_authenticated());
        assert_eq!(reloaded.endpoint.calls(), 0);
    }

    #[tokio::test]
    async fn test_login_persists_tokens() {
        let h = Harness::new(FakeEndpoint::issuing(&fresh_token()));
        let token = token_expiring_at(in_minutes(15), "user");

        let claims = h.manager.login(&token, Some("ref-1")).unwrap();

        assert_eq!(claims.role, Role::EndUser);
        assert!(h.manager.is_authenticated());
        assert_eq!(h.manager.claims(), Some(claims));
        assert_eq!(h.stored(ACCESS_TOKEN_KEY), Some(token));
        assert_eq!(h.stored(REFRESH_TOKEN_KEY).as_deref(), Some("ref-1"));
    }

    #[tokio::test]
    async fn test_login_without_refresh_token_drops_stale_one() {
        let h = Harness::new(FakeEndpoint::issuing(&fresh_token()));
        h.seed(&fresh_token(), Some("stale"));

        h.manager.login(&fresh_token(), None).unwrap();

        assert_eq!(h.stored(REFRESH_TOKEN_KEY), None);
    }

    #[tokio::test]
    async fn test_login_rejects_bad_tokens() {
        let h = Harness::new(FakeEndpoint::issuing(&fresh_token()));

        assert_eq!(
            h.manager.login("not-a-jwt", Some("ref-1")),
            Err(SessionError::MalformedToken)
        );
        assert_eq!(
            h.manager.login(&token_expiring_at(in_minutes(-1), "user"), None),
            Err(SessionError::ExpiredToken)
        );
        assert!(!h.manager.is_authenticated());
        assert_eq!(h.stored(ACCESS_TOKEN_KEY), None);
        assert_eq!(h.stored(REFRESH_TOKEN_KEY), None);
    }

    #[tokio::test]
    async fn test_login_refused_when_store_fails() {
        let store = FailingStore::new(Vec::new());
        let manager = SessionManager::builder(store.clone(), FakeEndpoint::issuing(&fresh_token())).build();

        let result = manager.login(&fresh_token(), Some("ref-1"));

        assert!(matches!(result, Err(SessionError::Storage(_))));
        assert!(!manager.is_authenticated());
        assert!(!manager.check_expiry_soon());
        assert!(!manager.monitor_running());
        assert_eq!(store.get(ACCESS_TOKEN_KEY).unwrap(), None);
    }

    #[tokio::test]
    async fn test_login_rolls_back_partial_write() {
        let store = FailingStore::new(vec![REFRESH_TOKEN_KEY]);
        store.inner.set(ACCESS_TOKEN_KEY, "previous-token").unwrap();
        let manager = SessionManager::builder(store.clone(), FakeEndpoint::issuing(&fresh_token())).build();

        let result = manager.login(&fresh_token(), Some("ref-1"));

        assert!(matches!(result, Err(SessionError::Storage(_))));
        assert!(!manager.is_authenticated());
        assert_eq!(store.get(ACCESS_TOKEN_KEY).unwrap().as_deref(), Some("previous-token"));
        assert_eq!(store.get(REFRESH_TOKEN_KEY).unwrap(), None);
    }

    #[tokio::test]
    async fn test_logout_is_idempotent() {
        let h = Harness::new(FakeEndpoint::issuing(&fresh_token()));
        h.manager.logout();
        h.manager.login(&fresh_token(), Some("ref-1")).unwrap();

        h.manager.logout();
        h.manager.logout();

        assert!(!h.manager.is_authenticated());
        assert_eq!(h.stored(ACCESS_TOKEN_KEY), None);
        assert_eq!(h.redirects(), 0);
        assert!(h.notices().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_refresh_single_exchange() {
        let new_token = fresh_token();
        let h = Harness::new(FakeEndpoint::issuing(&new_token));
        h.manager.login(&token_expiring_at(in_minutes(2), "user"), Some("ref-1")).unwrap();

        let (a, b) = tokio::join!(h.manager.refresh(), h.manager.refresh());

        assert_eq!(h.endpoint.calls(), 1);
        assert!(a.is_ok());
        assert_eq!(a, b);
        assert_eq!(h.stored(ACCESS_TOKEN_KEY), Some(new_token));

        // a later refresh is a new exchange
        h.manager.refresh().await.unwrap();
        assert_eq!(h.endpoint.calls(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_refresh_failure_redirects_once() {
        let h = Harness::new(FakeEndpoint::new(Reply::Unauthorized));
        h.manager.login(&fresh_token(), Some("ref-1")).unwrap();

        let (a, b, c) = tokio::join!(h.manager.refresh(), h.manager.refresh(), h.manager.refresh());

        assert_eq!(h.endpoint.calls(), 1);
        assert!(matches!(a, Err(RefreshError::Rejected(_))));
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert!(!h.manager.is_authenticated());
        assert_eq!(h.redirects(), 1);
        assert_eq!(h.notices().len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_without_refresh_token_forces_logout() {
        let h = Harness::new(FakeEndpoint::issuing(&fresh_token()));
        h.manager.login(&fresh_token(), None).unwrap();

        let result = h.manager.refresh().await;

        assert_eq!(result, Err(RefreshError::MissingRefreshToken));
        assert_eq!(h.endpoint.calls(), 0);
        assert!(!h.manager.is_authenticated());
        assert_eq!(h.redirects(), 1);
    }

    #[tokio::test]
    async fn test_refresh_transient_error_still_forces_logout() {
        let h = Harness::new(FakeEndpoint::new(Reply::ServerDown));
        h.manager.login(&fresh_token(), Some("ref-1")).unwrap();

        let result = h.manager.refresh().await;

        assert!(matches!(result, Err(RefreshError::Unavailable(_))));
        assert!(!h.manager.is_authenticated());
        assert_eq!(h.stored(REFRESH_TOKEN_KEY), None);
        assert_eq!(h.redirects(), 1);
    }

    #[tokio::test]
    async fn test_refresh_rejects_malformed_new_token() {
        let h = Harness::new(FakeEndpoint::issuing("garbage"));
        h.manager.login(&fresh_token(), Some("ref-1")).unwrap();

        assert_eq!(h.manager.refresh().await, Err(RefreshError::MalformedToken));
        assert!(!h.manager.is_authenticated());
    }

    #[tokio::test]
    async fn test_refresh_stores_rotated_token_and_profile() {
        let new_token = fresh_token();
        let endpoint = FakeEndpoint::new(Reply::Token(TokenPair {
            access_token: new_token.clone(),
            refresh_token: Some("ref-2".to_string()),
            user: Some(crate::models::UserProfile {
                id: "65f0c2".into(),
                email: "ana@stemic.org".into(),
                name: None,
                role: Some(Role::Organizer),
            }),
        }));
        let h = Harness::new(endpoint);
        h.manager.login(&fresh_token(), Some("ref-1")).unwrap();

        let claims = h.manager.refresh().await.unwrap();

        assert_eq!(Some(claims), decode(&new_token));
        assert_eq!(h.stored(REFRESH_TOKEN_KEY).as_deref(), Some("ref-2"));
        let profile = ProfileCache::new(h.store.as_ref()).load().unwrap();
        assert_eq!(profile.map(|p| p.email), Some("ana@stemic.org".to_string()));
    }

    #[tokio::test]
    async fn test_logout_during_refresh_wins() {
        let h = Harness::new(FakeEndpoint::issuing(&fresh_token()));
        h.manager.login(&fresh_token(), Some("ref-1")).unwrap();

        let manager = h.manager.clone();
        let (result, _) = tokio::join!(h.manager.refresh(), async move {
            tokio::task::yield_now().await;
            manager.logout();
        });

        assert_eq!(result, Err(RefreshError::SessionEnded));
        assert!(!h.manager.is_authenticated());
        assert_eq!(h.stored(ACCESS_TOKEN_KEY), None);
        // user asked to leave, nothing to announce
        assert_eq!(h.redirects(), 0);
    }

    #[tokio::test]
    async fn test_refresh_finishing_after_relogin_leaves_new_session() {
        let h = Harness::new(FakeEndpoint::issuing(&fresh_token()));
        h.manager.login(&fresh_token(), Some("ref-old")).unwrap();

        let manager = h.manager.clone();
        let (stale, _) = tokio::join!(h.manager.refresh(), async move {
            tokio::task::yield_now().await;
            manager.logout();
            manager.login(&fresh_token(), Some("ref-new")).unwrap();
        });

        assert_eq!(stale, Err(RefreshError::SessionEnded));
        assert!(h.manager.is_authenticated());
        assert_eq!(h.stored(REFRESH_TOKEN_KEY).as_deref(), Some("ref-new"));
        assert_eq!(h.redirects(), 0);
        assert!(h.notices().is_empty());
        assert_eq!(*lock(&h.endpoint.seen), vec!["ref-old".to_string()]);
    }

    #[tokio::test]
    async fn test_refresh_after_relogin_uses_new_refresh_token() {
        let new_token = fresh_token();
        let h = Harness::new(FakeEndpoint::issuing(&new_token));
        h.manager.login(&fresh_token(), Some("ref-old")).unwrap();

        let manager = h.manager.clone();
        let (stale, current) = tokio::join!(h.manager.refresh(), async move {
            tokio::task::yield_now().await;
            manager.logout();
            manager.login(&fresh_token(), Some("ref-new")).unwrap();
            manager.refresh().await
        });

        assert_eq!(stale, Err(RefreshError::SessionEnded));
        assert_eq!(current, Ok(decode(&new_token).unwrap()));
        assert!(h.manager.is_authenticated());
        assert_eq!(h.redirects(), 0);
        assert_eq!(
            *lock(&h.endpoint.seen),
            vec!["ref-old".to_string(), "ref-new".to_string()]
        );
    }

    #[tokio::test]
    async fn test_abandoned_refresh_is_not_rejoined() {
        let h = Harness::new(FakeEndpoint::issuing(&fresh_token()));
        h.manager.login(&fresh_token(), Some("ref-old")).unwrap();

        let manager = h.manager.clone();
        let task = tokio::spawn(async move { manager.refresh().await });
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        task.abort();
        let _ = task.await;

        h.manager.logout();
        h.manager.login(&fresh_token(), Some("ref-new")).unwrap();

        assert!(h.manager.refresh().await.is_ok());
        assert!(h.manager.is_authenticated());
        assert_eq!(h.redirects(), 0);
        assert_eq!(
            *lock(&h.endpoint.seen),
            vec!["ref-old".to_string(), "ref-new".to_string()]
        );
    }

    #[tokio::test]
    async fn test_notifier_failure_is_not_fatal() {
        let navigator = Arc::new(RecordingNavigator::default());
        let manager = SessionManager::builder(
            Arc::new(MemoryTokenStore::new()),
            FakeEndpoint::new(Reply::Unauthorized),
        )
        .notifier(Arc::new(FailingNotifier))
        .navigator(navigator.clone())
        .build();
        manager.login(&fresh_token(), Some("ref-1")).unwrap();

        assert!(manager.refresh().await.is_err());
        assert_eq!(navigator.redirects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_check_expiry_soon() {
        let h = Harness::new(FakeEndpoint::issuing(&fresh_token()));
        assert!(!h.manager.check_expiry_soon());

        h.seed("not-a-jwt", None);
        assert!(!h.manager.check_expiry_soon());

        h.seed(&token_expiring_at(in_minutes(2), "user"), None);
        assert!(h.manager.check_expiry_soon());

        h.seed(&token_expiring_at(in_minutes(10), "user"), None);
        assert!(!h.manager.check_expiry_soon());

        h.seed(&token_expiring_at(in_seconds(-1), "user"), None);
        assert!(!h.manager.check_expiry_soon());
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let h = Harness::new(FakeEndpoint::issuing(&fresh_token()));
        let mut rx = h.manager.subscribe();

        h.manager.initialize().await;
        rx.changed().await.unwrap();
        assert!(!rx.borrow_and_update().is_initializing);

        h.manager.login(&fresh_token(), None).unwrap();
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().is_authenticated());

        h.manager.logout();
        rx.changed().await.unwrap();
        assert!(!rx.borrow_and_update().is_authenticated());
    }

    #[test]
    fn test_state_debug_redacts_token() {
        let mut state = SessionState::initializing();
        state.access_token = Some("secret-token".to_string());
        let printed = format!("{:?}", state);
        assert!(!printed.contains("secret-token"));
        assert!(printed.contains("<redacted>"));
    }

    #[test]
    fn test_login_outside_runtime_skips_monitor() {
        let h = Harness::new(FakeEndpoint::issuing(&fresh_token()));
        h.manager.login(&fresh_token(), Some("ref-1")).unwrap();
        assert!(h.manager.is_authenticated());
        assert!(!h.manager.monitor_running());
    }

    // ===== Background expiry check =====

    #[tokio::test(start_paused = true)]
    async fn test_background_refresh_before_expiry() {
        let new_token = fresh_token();
        let h = Harness::new(FakeEndpoint::issuing(&new_token));
        h.manager.login(&token_expiring_at(in_minutes(2), "user"), Some("ref-1")).unwrap();

        tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        assert_eq!(h.endpoint.calls(), 0);

        tokio::time::sleep(std::time::Duration::from_secs(31)).await;
        assert_eq!(h.endpoint.calls(), 1);
        assert_eq!(h.stored(ACCESS_TOKEN_KEY), Some(new_token));
        assert!(h.manager.is_authenticated());

        // the new token has an hour left, so later ticks leave it alone
        tokio::time::sleep(std::time::Duration::from_secs(180)).await;
        assert_eq!(h.endpoint.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_leaves_fresh_token_alone() {
        let h = Harness::new(FakeEndpoint::issuing(&fresh_token()));
        h.manager.login(&fresh_token(), Some("ref-1")).unwrap();

        tokio::time::sleep(std::time::Duration::from_secs(300)).await;

        assert_eq!(h.endpoint.calls(), 0);
        assert!(h.manager.monitor_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_transient_failure_is_swallowed() {
        let h = Harness::new(FakeEndpoint::new(Reply::ServerDown));
        h.manager.login(&token_expiring_at(in_minutes(3), "user"), Some("ref-1")).unwrap();

        tokio::time::sleep(std::time::Duration::from_secs(125)).await;

        // two ticks, two attempts, session intact
        assert_eq!(h.endpoint.calls(), 2);
        assert!(h.manager.is_authenticated());
        assert_eq!(h.stored(REFRESH_TOKEN_KEY).as_deref(), Some("ref-1"));
        assert_eq!(h.redirects(), 0);
        assert!(h.notices().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_rejection_forces_logout() {
        let h = Harness::new(FakeEndpoint::new(Reply::Unauthorized));
        h.manager.login(&token_expiring_at(in_minutes(3), "user"), Some("ref-1")).unwrap();

        tokio::time::sleep(std::time::Duration::from_secs(61)).await;

        assert_eq!(h.endpoint.calls(), 1);
        assert!(!h.manager.is_authenticated());
        assert_eq!(h.stored(ACCESS_TOKEN_KEY), None);
        assert_eq!(h.redirects(), 1);

        tokio::time::sleep(std::time::Duration::from_secs(120)).await;
        assert_eq!(h.endpoint.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_refresh_stopped_mid_flight() {
        let h = Harness::new(FakeEndpoint::issuing(&fresh_token()));
        h.manager.login(&token_expiring_at(in_minutes(2), "user"), Some("ref-old")).unwrap();

        // first tick has started an exchange that is still waiting on the server
        tokio::time::sleep(std::time::Duration::from_millis(60_005)).await;
        assert_eq!(h.endpoint.calls(), 1);

        h.manager.logout();
        h.manager.login(&fresh_token(), Some("ref-new")).unwrap();

        assert!(h.manager.refresh().await.is_ok());
        assert!(h.manager.is_authenticated());
        assert_eq!(h.stored(REFRESH_TOKEN_KEY).as_deref(), Some("ref-new"));
        assert_eq!(h.redirects(), 0);
        assert_eq!(
            *lock(&h.endpoint.seen),
            vec!["ref-old".to_string(), "ref-new".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_stops_background_check() {
        let h = Harness::new(FakeEndpoint::issuing(&fresh_token()));
        h.manager.login(&token_expiring_at(in_minutes(2), "user"), Some("ref-1")).unwrap();
        h.manager.logout();

        tokio::time::sleep(std::time::Duration::from_secs(120)).await;

        assert_eq!(h.endpoint.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_stops_background_check() {
        let h = Harness::new(FakeEndpoint::issuing(&fresh_token()));
        h.manager.login(&token_expiring_at(in_minutes(2), "user"), Some("ref-1")).unwrap();
        h.manager.dispose();

        tokio::time::sleep(std::time::Duration::from_secs(120)).await;

        assert_eq!(h.endpoint.calls(), 0);
        assert!(h.manager.is_authenticated());
        assert!(!h.manager.monitor_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_manager_stops_background_check() {
        let endpoint = FakeEndpoint::issuing(&fresh_token());
        let h = Harness::new(endpoint.clone());
        h.manager.login(&token_expiring_at(in_minutes(2), "user"), Some("ref-1")).unwrap();
        drop(h);

        tokio::time::sleep(std::time::Duration::from_secs(120)).await;

        assert_eq!(endpoint.calls(), 0);
    }
}
