use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info};

use crate::capabilities::HttpError;
use crate::gateway::{ApiRequest, GatewayError, Outcome, RequestGateway};

pub const UPDATE_CHECK_PATH: &str = "/update/check";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateType {
    #[serde(rename = "OTA")]
    Ota,
    #[serde(rename = "APK")]
    Apk,
    PlayStore,
    #[default]
    #[serde(rename = "none", other)]
    None,
}

/// Answer of the update check endpoint.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateStatus {
    pub update_available: bool,
    pub force_update: bool,
    pub update_type: UpdateType,
    pub latest_app_version: Option<String>,
    pub apk_url: Option<String>,
    pub play_store_url: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("update check failed: {0}")]
    Request(#[from] GatewayError),

    #[error("update check response is malformed: {0}")]
    Decode(#[from] HttpError),
}

/// Polls the backend for app updates, independently of the mutation pipeline.
pub struct UpdateService {
    gateway: Arc<RequestGateway>,
    status: watch::Sender<UpdateStatus>,
}

impl UpdateService {
    pub fn new(gateway: Arc<RequestGateway>) -> Self {
        let (status, _) = watch::channel(UpdateStatus::default());
        Self { gateway, status }
    }

    pub fn subscribe(&self) -> watch::Receiver<UpdateStatus> {
        self.status.subscribe()
    }

    pub fn current(&self) -> UpdateStatus {
        self.status.borrow().clone()
    }

    /// Check once and publish the result. Failures are logged, never returned.
    pub async fn check_for_updates(&self) -> Option<UpdateStatus> {
        match self.fetch().await {
            Ok(status) if status.update_available => {
                info!(update_type = ?status.update_type, force = status.force_update, "update available");
                self.status.send_replace(status.clone());
                Some(status)
            }
            Ok(_) => {
                info!("no updates available");
                None
            }
            Err(e) => {
                error!(error = %e, "error checking for updates");
                None
            }
        }
    }

    async fn fetch(&self) -> Result<UpdateStatus, UpdateError> {
        match self.gateway.execute(ApiRequest::get(UPDATE_CHECK_PATH)).await? {
            Outcome::Success(response) => Ok(response.json()?),
            // GETs are never queued.
            Outcome::QueuedOffline(_) => Ok(UpdateStatus::default()),
        }
    }
}
