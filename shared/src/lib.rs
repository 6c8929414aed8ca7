// lib.rs - Offline-first mutation pipeline for the expense client

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

pub mod auth;
pub mod capabilities;
pub mod client;
pub mod config;
pub mod event;
pub mod gateway;
pub mod logging;
pub mod model;
pub mod offline_store;
pub mod outbox;
pub mod reconcile;
pub mod retry;
#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
pub mod sqlite_store;
pub mod sync;
pub mod updates;

use serde::{Deserialize, Serialize};

pub use auth::{AuthError, AuthSession, AuthTokens, RefreshFailure, SessionObserver, TokenRefresher};
pub use client::{ClientError, ClientParts, OfflineClient};
pub use config::{ClientConfig, ConfigError, SyncConfig};
pub use event::{DropReason, EventBus, PipelineEvent};
pub use gateway::{ApiRequest, ClientHeaders, GatewayError, OfflineAck, Outcome, RequestGateway};
pub use model::{CachedExpense, ClientId, EntryKind, ExpenseKey, ExpenseRecord, ServerId, UnixTimeMs, UserId};
pub use outbox::{Correlation, EntityKind, MutationAction, Outbox, QueuedRequest, RequestId};
pub use reconcile::{Ledger, LocalCache, LocalCacheReconciler};
pub use retry::BackoffPolicy;
pub use sync::{DrainReport, SyncEngine, SyncTrigger};
pub use updates::{UpdateService, UpdateStatus, UpdateType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Transient,
    Permanent,
    Fatal,
}

/// Failure taxonomy shared by every layer of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// No response at all.
    NetworkUnreachable,
    /// 5xx, 408 or 429.
    ServerTransient,
    /// Any other 4xx.
    ServerFatal,
    /// 401 on a regular endpoint; handled by a refresh.
    AuthExpired,
    /// The refresh token itself was rejected.
    AuthInvalid,
    /// A queued request ran out of retries or aged out.
    QueueExhausted,
    Storage,
    InvalidRequest,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::NetworkUnreachable => "NETWORK_UNREACHABLE",
            Self::ServerTransient => "SERVER_TRANSIENT",
            Self::ServerFatal => "SERVER_FATAL",
            Self::AuthExpired => "AUTH_EXPIRED",
            Self::AuthInvalid => "AUTH_INVALID",
            Self::QueueExhausted => "QUEUE_EXHAUSTED",
            Self::Storage => "STORAGE_ERROR",
            Self::InvalidRequest => "INVALID_REQUEST",
        }
    }

    #[must_use]
    pub const fn default_severity(self) -> ErrorSeverity {
        match self {
            Self::NetworkUnreachable | Self::ServerTransient | Self::AuthExpired | Self::Storage => {
                ErrorSeverity::Transient
            }
            Self::ServerFatal | Self::QueueExhausted | Self::InvalidRequest => {
                ErrorSeverity::Permanent
            }
            Self::AuthInvalid => ErrorSeverity::Fatal,
        }
    }

    /// Whether a queued mutation failing this way should be tried again later.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::NetworkUnreachable | Self::ServerTransient | Self::AuthExpired | Self::Storage
        )
    }

    /// Mutations that fail this way are queued and reported as accepted offline.
    #[must_use]
    pub const fn is_absorbed_for_mutations(self) -> bool {
        matches!(self, Self::NetworkUnreachable | Self::ServerTransient)
    }
}
