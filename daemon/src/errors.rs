use thiserror::Error;

use crate::{
    dbus_service::DBusServiceError, discovery::InitError,
    pm_watcher::PmWatcherError,
};

// The main daemon error type. Per-operation failures (OpError) are
// handled where they happen and never bubble up here
#[derive(Debug, Error)]
pub enum DgpudError {
    #[error(transparent)]
    Init(#[from] InitError),
    #[error(transparent)]
    DBusService(#[from] DBusServiceError),
    #[error(transparent)]
    PmWatcher(#[from] PmWatcherError),
}
