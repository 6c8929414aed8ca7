//! Session tokens and the single-flight refresh protocol.
//!
//! Any number of callers that hit a 401 collapse onto one refresh call. The first
//! caller becomes the leader and performs it; everyone else waits on the same
//! `watch` channel and resumes with the shared outcome, success or failure.
//!
//! Only an explicit 401 from the refresh endpoint ends the session. Timeouts and
//! other failures leave the tokens in place.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::capabilities::{
    load_json, store_json, Clock, KeyNamespace, KvError, KvKey, KvStore,
};
use crate::event::{EventBus, PipelineEvent};

const TOKENS_KEY: &str = "tokens";
pub const DEFAULT_REFRESH_TIMEOUT_MS: u64 = 30_000;

#[derive(Clone)]
pub struct AuthTokens {
    pub access_token: SecretString,
    pub refresh_token: SecretString,
}

impl AuthTokens {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: SecretString::new(access_token.into()),
            refresh_token: SecretString::new(refresh_token.into()),
        }
    }
}

impl std::fmt::Debug for AuthTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AuthTokens([REDACTED])")
    }
}

/// Token pair as the server sends it and as it is persisted.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

impl From<TokenPair> for AuthTokens {
    fn from(pair: TokenPair) -> Self {
        Self::new(pair.access_token, pair.refresh_token)
    }
}

impl From<&AuthTokens> for TokenPair {
    fn from(tokens: &AuthTokens) -> Self {
        Self {
            access_token: tokens.access_token.expose_secret().clone(),
            refresh_token: tokens.refresh_token.expose_secret().clone(),
        }
    }
}

/// How a refresh attempt failed, as reported by a [`TokenRefresher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshFailure {
    /// The refresh endpoint answered 401.
    Unauthorized,
    /// No usable answer: timeout, network failure, 5xx, malformed body.
    Indeterminate(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("session rejected by the refresh endpoint")]
    Invalid,

    #[error("token refresh did not complete: {0}")]
    Indeterminate(String),

    #[error("no refresh token available")]
    MissingRefreshToken,

    #[error("session storage error: {0}")]
    Storage(#[from] KvError),
}

/// Calls the refresh endpoint.
#[async_trait::async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &SecretString) -> Result<AuthTokens, RefreshFailure>;
}

/// Told when the session has been force-ended so local state can be reset.
#[async_trait::async_trait]
pub trait SessionObserver: Send + Sync {
    async fn on_session_expired(&self);
}

/// The bearer token a request was sent with, tagged by the generation it belongs to.
#[derive(Clone, Debug)]
pub struct AccessSnapshot {
    pub token: Option<SecretString>,
    pub generation: u64,
}

type RefreshOutcome = Result<u64, AuthError>;

#[derive(Default)]
struct SessionState {
    tokens: Option<AuthTokens>,
    generation: u64,
}

pub struct AuthSession {
    store: Arc<dyn KvStore>,
    key: KvKey,
    clock: Arc<dyn Clock>,
    events: EventBus,
    refresh_timeout: Duration,
    state: RwLock<SessionState>,
    inflight: Mutex<Option<watch::Receiver<Option<RefreshOutcome>>>>,
    observers: RwLock<Vec<Arc<dyn SessionObserver>>>,
}

enum Role {
    Leader(watch::Sender<Option<RefreshOutcome>>),
    Waiter(watch::Receiver<Option<RefreshOutcome>>),
    Stale(u64),
}

/// Frees the in-flight slot even if the leader's future is dropped mid-refresh.
struct InflightSlot<'a>(&'a AuthSession);

impl Drop for InflightSlot<'_> {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.0.inflight.lock() {
            *slot = None;
        }
    }
}

impl AuthSession {
    /// Load any persisted session.
    pub async fn restore(
        store: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        events: EventBus,
        refresh_timeout: Duration,
    ) -> Result<Self, AuthError> {
        let key = KvKey::new(KeyNamespace::Session, TOKENS_KEY)?;
        let (pair, _) = load_json::<TokenPair>(store.as_ref(), &key).await?;
        let tokens = pair.map(AuthTokens::from);
        if tokens.is_some() {
            info!("restored persisted session");
        }
        Ok(Self {
            store,
            key,
            clock,
            events,
            refresh_timeout,
            state: RwLock::new(SessionState {
                tokens,
                generation: 0,
            }),
            inflight: Mutex::new(None),
            observers: RwLock::new(Vec::new()),
        })
    }

    pub fn add_observer(&self, observer: Arc<dyn SessionObserver>) {
        if let Ok(mut observers) = self.observers.write() {
            observers.push(observer);
        }
    }

    pub fn snapshot(&self) -> AccessSnapshot {
        match self.state.read() {
            Ok(state) => AccessSnapshot {
                token: state.tokens.as_ref().map(|t| t.access_token.clone()),
                generation: state.generation,
            },
            Err(_) => AccessSnapshot {
                token: None,
                generation: 0,
            },
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.snapshot().token.is_some()
    }

    pub fn generation(&self) -> u64 {
        self.snapshot().generation
    }

    /// Install a fresh token pair (sign-in or refresh).
    pub async fn install(&self, tokens: AuthTokens) -> Result<u64, AuthError> {
        let pair = TokenPair::from(&tokens);
        let generation = {
            let mut state = self
                .state
                .write()
                .map_err(|_| AuthError::Indeterminate("session state poisoned".into()))?;
            state.tokens = Some(tokens);
            state.generation += 1;
            state.generation
        };
        self.persist(Some(&pair)).await?;
        Ok(generation)
    }

    /// End the session locally. The offline queue is left alone.
    pub async fn logout(&self) {
        if let Ok(mut state) = self.state.write() {
            state.tokens = None;
            state.generation += 1;
        }
        if let Err(e) = self.persist(None).await {
            error!(error = %e, "failed to erase persisted session");
        }

        let observers = self
            .observers
            .read()
            .map(|o| o.clone())
            .unwrap_or_default();
        for observer in observers {
            observer.on_session_expired().await;
        }
        self.events.emit(PipelineEvent::SessionExpired);
        info!("session ended");
    }

    /// Run (or join) the single in-flight refresh.
    ///
    /// `observed_generation` is the generation of the token the failed request carried.
    /// If the session has moved on since, the caller just retries with the current token.
    #[instrument(skip(self, refresher))]
    pub async fn refresh(
        &self,
        observed_generation: u64,
        refresher: &dyn TokenRefresher,
    ) -> Result<u64, AuthError> {
        match self.claim(observed_generation)? {
            Role::Stale(generation) => Ok(generation),
            Role::Waiter(mut rx) => {
                let outcome = rx
                    .wait_for(Option::is_some)
                    .await
                    .map(|outcome| outcome.clone());
                match outcome {
                    Ok(Some(outcome)) => outcome,
                    _ => Err(AuthError::Indeterminate("refresh abandoned".into())),
                }
            }
            Role::Leader(tx) => {
                let _slot = InflightSlot(self);
                let outcome = self.lead_refresh(refresher).await;
                tx.send_replace(Some(outcome.clone()));
                outcome
            }
        }
    }

    fn claim(&self, observed_generation: u64) -> Result<Role, AuthError> {
        let mut slot = self
            .inflight
            .lock()
            .map_err(|_| AuthError::Indeterminate("refresh state poisoned".into()))?;

        let current = self.generation();
        if current != observed_generation {
            return Ok(Role::Stale(current));
        }
        if let Some(rx) = slot.as_ref() {
            return Ok(Role::Waiter(rx.clone()));
        }
        let (tx, rx) = watch::channel(None);
        *slot = Some(rx);
        Ok(Role::Leader(tx))
    }

    async fn lead_refresh(&self, refresher: &dyn TokenRefresher) -> RefreshOutcome {
        let refresh_token = self
            .state
            .read()
            .ok()
            .and_then(|s| s.tokens.as_ref().map(|t| t.refresh_token.clone()));
        let Some(refresh_token) = refresh_token else {
            warn!("401 without a refresh token");
            return Err(AuthError::MissingRefreshToken);
        };

        let result = match tokio::time::timeout(
            self.refresh_timeout,
            refresher.refresh(&refresh_token),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(RefreshFailure::Indeterminate(format!(
                "refresh timed out after {}ms",
                self.refresh_timeout.as_millis()
            ))),
        };

        match result {
            Ok(tokens) => {
                let generation = match self.install(tokens).await {
                    Ok(generation) => generation,
                    // Tokens are live in memory; a failed write only costs a re-login after restart.
                    Err(AuthError::Storage(e)) => {
                        error!(error = %e, "failed to persist refreshed tokens");
                        self.generation()
                    }
                    Err(e) => return Err(e),
                };
                self.events.emit(PipelineEvent::TokensRefreshed);
                info!(generation, "tokens refreshed");
                Ok(generation)
            }
            Err(RefreshFailure::Unauthorized) => {
                warn!("refresh token rejected, logging out");
                self.logout().await;
                Err(AuthError::Invalid)
            }
            Err(RefreshFailure::Indeterminate(reason)) => {
                warn!(%reason, "token refresh failed, session preserved");
                Err(AuthError::Indeterminate(reason))
            }
        }
    }

    async fn persist(&self, pair: Option<&TokenPair>) -> Result<(), AuthError> {
        let mut last = KvError::VersionMismatch {
            expected: 0,
            found: 0,
        };
        for _ in 0..3 {
            let version = match self.store.get(&self.key).await? {
                Some(value) => value.version(),
                None if pair.is_none() => return Ok(()),
                None => 0,
            };
            let result = match pair {
                Some(pair) => {
                    store_json(self.store.as_ref(), &self.key, version, pair, self.clock.now())
                        .await
                        .map(|_| ())
                }
                None => self.store.delete(&self.key).await.map(|_| ()),
            };
            match result {
                Err(e @ KvError::VersionMismatch { .. }) => last = e,
                other => return other.map_err(AuthError::from),
            }
        }
        Err(last.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{MemoryKvStore, SystemClock};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeRefresher {
        calls: AtomicUsize,
        delay: Duration,
        result: Result<(&'static str, &'static str), RefreshFailure>,
    }

    impl FakeRefresher {
        fn new(delay_ms: u64, result: Result<(&'static str, &'static str), RefreshFailure>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay: Duration::from_millis(delay_ms),
                result,
            }
        }
    }

    #[async_trait::async_trait]
    impl TokenRefresher for FakeRefresher {
        async fn refresh(&self, refresh_token: &SecretString) -> Result<AuthTokens, RefreshFailure> {
            assert_eq!(refresh_token.expose_secret(), "refresh-0");
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.result
                .clone()
                .map(|(access, refresh)| AuthTokens::new(access, refresh))
        }
    }

    #[derive(Default)]
    struct CountingObserver(AtomicUsize);

    #[async_trait::async_trait]
    impl SessionObserver for CountingObserver {
        async fn on_session_expired(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn signed_in(timeout_ms: u64) -> (Arc<AuthSession>, Arc<MemoryKvStore>, EventBus) {
        let store = Arc::new(MemoryKvStore::new());
        let events = EventBus::default();
        let session = AuthSession::restore(
            store.clone(),
            Arc::new(SystemClock),
            events.clone(),
            Duration::from_millis(timeout_ms),
        )
        .await
        .unwrap();
        session
            .install(AuthTokens::new("access-0", "refresh-0"))
            .await
            .unwrap();
        (Arc::new(session), store, events)
    }

    fn access(session: &AuthSession) -> Option<String> {
        session.snapshot().token.map(|t| t.expose_secret().clone())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_refreshes_share_one_call() {
        let (session, _, _) = signed_in(5_000).await;
        let refresher = Arc::new(FakeRefresher::new(100, Ok(("access-1", "refresh-1"))));
        let observed = session.generation();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let session = session.clone();
                let refresher = refresher.clone();
                tokio::spawn(async move { session.refresh(observed, refresher.as_ref()).await })
            })
            .collect();

        let mut generations = Vec::new();
        for handle in handles {
            generations.push(handle.await.unwrap().unwrap());
        }
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        assert!(generations.iter().all(|g| *g == observed + 1));
        assert_eq!(access(&session).as_deref(), Some("access-1"));
    }

    #[tokio::test]
    async fn stale_generation_skips_refresh() {
        let (session, _, _) = signed_in(5_000).await;
        let refresher = FakeRefresher::new(0, Ok(("access-1", "refresh-1")));
        let stale = session.generation() - 1;
        assert_eq!(
            session.refresh(stale, &refresher).await.unwrap(),
            session.generation()
        );
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn indeterminate_failure_preserves_session() {
        let (session, store, events) = signed_in(5_000).await;
        let mut rx = events.subscribe();
        let refresher = FakeRefresher::new(0, Err(RefreshFailure::Indeterminate("503".into())));

        let err = session
            .refresh(session.generation(), &refresher)
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::Indeterminate("503".into()));
        assert_eq!(access(&session).as_deref(), Some("access-0"));
        assert!(rx.try_recv().is_err());
        assert!(!store.is_empty());
    }

    #[tokio::test]
    async fn hung_refresh_times_out_without_logout() {
        let (session, _, _) = signed_in(50).await;
        let refresher = FakeRefresher::new(10_000, Ok(("never", "never")));
        let err = session
            .refresh(session.generation(), &refresher)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Indeterminate(_)));
        assert!(session.is_authenticated());

        // The slot is free again: the next 401 can lead a new refresh.
        let quick = FakeRefresher::new(0, Ok(("access-2", "refresh-2")));
        session.refresh(session.generation(), &quick).await.unwrap();
        assert_eq!(access(&session).as_deref(), Some("access-2"));
    }

    #[tokio::test]
    async fn unauthorized_refresh_logs_out() {
        let (session, store, events) = signed_in(5_000).await;
        let observer = Arc::new(CountingObserver::default());
        session.add_observer(observer.clone());
        let mut rx = events.subscribe();
        let refresher = FakeRefresher::new(0, Err(RefreshFailure::Unauthorized));

        let err = session
            .refresh(session.generation(), &refresher)
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::Invalid);
        assert!(!session.is_authenticated());
        assert_eq!(observer.0.load(Ordering::SeqCst), 1);
        assert_eq!(rx.recv().await.unwrap(), PipelineEvent::SessionExpired);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn waiters_resume_on_failure_too() {
        let (session, _, _) = signed_in(5_000).await;
        let refresher = Arc::new(FakeRefresher::new(
            100,
            Err(RefreshFailure::Indeterminate("offline".into())),
        ));
        let observed = session.generation();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let session = session.clone();
                let refresher = refresher.clone();
                tokio::spawn(async move { session.refresh(observed, refresher.as_ref()).await })
            })
            .collect();
        for handle in handles {
            assert!(matches!(
                handle.await.unwrap(),
                Err(AuthError::Indeterminate(_))
            ));
        }
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn session_survives_restore() {
        let (_, store, _) = signed_in(5_000).await;
        let restored = AuthSession::restore(
            store,
            Arc::new(SystemClock),
            EventBus::default(),
            Duration::from_secs(30),
        )
        .await
        .unwrap();
        assert_eq!(access(&restored).as_deref(), Some("access-0"));
    }

    #[test]
    fn tokens_debug_is_redacted() {
        let tokens = AuthTokens::new("secret-a", "secret-r");
        assert!(!format!("{tokens:?}").contains("secret"));
    }
}
