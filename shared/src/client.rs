//! Composition root: builds and wires every part of the pipeline.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::auth::{AuthError, AuthSession, AuthTokens};
use crate::capabilities::{
    Clock, ConnectivityMonitor, ConnectivityProbe, HttpConnectivityProbe, HttpError, HttpTransport,
    KvError, KvStore,
};
use crate::config::{ClientConfig, ConfigError, StorageBackend};
use crate::event::{EventBus, PipelineEvent};
use crate::gateway::{ApiRequest, GatewayError, HttpTokenRefresher, Outcome, RequestGateway};
use crate::model::ExpensePage;
use crate::offline_store::StoreError;
use crate::outbox::{Outbox, OutboxError};
use crate::reconcile::{Ledger, LocalCacheReconciler, ReconcileError};
use crate::sync::{spawn_worker, DrainReport, SyncEngine, SyncError, SyncTrigger};
use crate::updates::UpdateService;

pub const EXPENSE_LIST_PATH: &str = "/expense/get-expense/";
const SQLITE_FILE: &str = "expense-sync.db";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Queue(#[from] OutboxError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Cache(#[from] ReconcileError),

    #[error(transparent)]
    Storage(#[from] KvError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("http error: {0}")]
    Http(#[from] HttpError),

    #[error("request was queued offline; no data to read")]
    Offline,
}

/// Host-provided collaborators.
pub struct ClientParts {
    pub transport: Arc<dyn HttpTransport>,
    pub store: Arc<dyn KvStore>,
    pub clock: Arc<dyn Clock>,
    /// Defaults to an HTTP probe of `probe_url` if configured, else the connectivity monitor.
    pub probe: Option<Arc<dyn ConnectivityProbe>>,
}

pub struct OfflineClient {
    gateway: Arc<RequestGateway>,
    session: Arc<AuthSession>,
    outbox: Arc<Outbox>,
    reconciler: Arc<LocalCacheReconciler>,
    engine: Arc<SyncEngine>,
    updates: UpdateService,
    monitor: ConnectivityMonitor,
    trigger: SyncTrigger,
    events: EventBus,
}

impl OfflineClient {
    pub async fn assemble(config: ClientConfig, parts: ClientParts) -> Result<Self, ClientError> {
        config.sync.validate()?;
        let ClientParts {
            transport,
            store,
            clock,
            probe,
        } = parts;

        let events = EventBus::default();
        let monitor = ConnectivityMonitor::default();
        let trigger = SyncTrigger::default();

        let session = Arc::new(
            AuthSession::restore(
                store.clone(),
                clock.clone(),
                events.clone(),
                config.sync.refresh_timeout(),
            )
            .await?,
        );
        let reconciler = Arc::new(LocalCacheReconciler::load(store.clone(), clock.clone()).await?);
        session.add_observer(reconciler.clone());

        let outbox = Arc::new(Outbox::new(store, clock.clone(), config.sync.outbox())?);
        let refresher = Arc::new(HttpTokenRefresher::new(
            transport.clone(),
            &config.base_url,
            config.headers.clone(),
            config.sync.refresh_timeout(),
        )?);
        let gateway = Arc::new(RequestGateway::new(
            transport.clone(),
            config.base_url.clone(),
            config.headers.clone(),
            session.clone(),
            refresher,
            outbox.clone(),
            trigger.clone(),
            events.clone(),
            config.sync.request_timeout(),
        ));
        let probe: Arc<dyn ConnectivityProbe> = match (probe, &config.probe_url) {
            (Some(probe), _) => probe,
            (None, Some(url)) => Arc::new(HttpConnectivityProbe::new(
                transport.clone(),
                url.clone(),
                config.sync.probe_timeout(),
            )),
            (None, None) => Arc::new(monitor.clone()),
        };
        let engine = Arc::new(SyncEngine::new(
            gateway.clone(),
            outbox.clone(),
            reconciler.clone(),
            probe,
            clock,
            config.sync.backoff(),
            events.clone(),
        ));
        let updates = UpdateService::new(gateway.clone());

        info!(base_url = %config.base_url.as_str(), "offline client ready");
        Ok(Self {
            gateway,
            session,
            outbox,
            reconciler,
            engine,
            updates,
            monitor,
            trigger,
            events,
        })
    }

    /// Build with the `reqwest` transport and a file store under `data_dir`
    /// (in-memory when no directory is configured).
    #[cfg(feature = "reqwest-transport")]
    pub async fn open(config: ClientConfig) -> Result<Self, ClientError> {
        use crate::capabilities::{MemoryKvStore, ReqwestTransport, SystemClock};
        use crate::offline_store::FileKvStore;

        let store: Arc<dyn KvStore> = match (&config.data_dir, config.storage) {
            (Some(dir), StorageBackend::File) => Arc::new(FileKvStore::open(dir)?),
            #[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
            (Some(dir), StorageBackend::Sqlite) => {
                std::fs::create_dir_all(dir).map_err(StoreError::from)?;
                Arc::new(crate::sqlite_store::SqliteKvStore::open(dir.join(SQLITE_FILE))?)
            }
            #[cfg(not(all(feature = "sqlite", not(target_arch = "wasm32"))))]
            (Some(_), StorageBackend::Sqlite) => {
                return Err(ConfigError::InvalidValue {
                    key: "EXPENSE_STORE",
                    value: "sqlite".to_owned(),
                    reason: "built without the sqlite feature".to_owned(),
                }
                .into());
            }
            (None, _) => {
                warn!("no data directory configured, queue will not survive restarts");
                Arc::new(MemoryKvStore::new())
            }
        };
        let parts = ClientParts {
            transport: Arc::new(ReqwestTransport::new()),
            store,
            clock: Arc::new(SystemClock),
            probe: None,
        };
        Self::assemble(config, parts).await
    }

    /// Start the background sync worker. Must be called inside a tokio runtime.
    pub fn start(&self) -> JoinHandle<()> {
        spawn_worker(self.engine.clone(), self.trigger.clone(), &self.monitor)
    }

    pub async fn sign_in(&self, tokens: AuthTokens) -> Result<(), ClientError> {
        self.session.install(tokens).await?;
        self.trigger.notify();
        Ok(())
    }

    /// Local sign-out. Queued mutations stay queued.
    pub async fn sign_out(&self) {
        self.session.logout().await;
    }

    pub fn is_signed_in(&self) -> bool {
        self.session.is_authenticated()
    }

    pub async fn execute(&self, request: ApiRequest) -> Result<Outcome, ClientError> {
        Ok(self.gateway.execute(request).await?)
    }

    /// Host connectivity callback. A transition to online wakes the sync worker.
    pub fn set_online(&self, online: bool) {
        if self.monitor.set_online(online) {
            info!("connectivity restored");
        }
    }

    /// Fetch the first page of expenses, fold it into the cache, then flush the queue.
    pub async fn refresh_expenses(&self, limit: u32) -> Result<Ledger, ClientError> {
        let path = format!("{EXPENSE_LIST_PATH}?offset=0&limit={limit}");
        let Outcome::Success(response) = self.gateway.execute(ApiRequest::get(path)).await? else {
            return Err(ClientError::Offline);
        };
        let page: ExpensePage = response.json()?;
        let ledger = self
            .reconciler
            .absorb(page.expenses, page.total_balance)
            .await?;

        if let Err(e) = self.engine.foreground_refresh().await {
            warn!(error = %e, "flush after refresh failed");
        }
        Ok(ledger)
    }

    pub async fn foreground_refresh(&self) -> Result<DrainReport, ClientError> {
        Ok(self.engine.foreground_refresh().await?)
    }

    pub async fn has_pending_user_mutations(&self) -> Result<bool, ClientError> {
        Ok(self.outbox.has_pending_user_mutations().await?)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    pub fn cache(&self) -> &Arc<LocalCacheReconciler> {
        &self.reconciler
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    pub fn updates(&self) -> &UpdateService {
        &self.updates
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }
}
