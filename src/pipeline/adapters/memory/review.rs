//! In-memory review notification store.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::pipeline::{
    domain::{ReviewNotification, TaskKey},
    ports::{ReviewNotificationStore, StoreError, StoreResult},
};

/// Thread-safe in-memory review notification store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryReviewNotificationStore {
    notifications: Arc<RwLock<HashMap<TaskKey, ReviewNotification>>>,
}

impl InMemoryReviewNotificationStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReviewNotificationStore for InMemoryReviewNotificationStore {
    async fn find_notification(&self, key: &TaskKey) -> StoreResult<Option<ReviewNotification>> {
        let notifications = self
            .notifications
            .read()
            .map_err(|err| StoreError::persistence(std::io::Error::other(err.to_string())))?;
        Ok(notifications.get(key).cloned())
    }

    async fn save_notification(&self, notification: &ReviewNotification) -> StoreResult<()> {
        let mut notifications = self
            .notifications
            .write()
            .map_err(|err| StoreError::persistence(std::io::Error::other(err.to_string())))?;
        notifications.insert(notification.key().clone(), notification.clone());
        Ok(())
    }
}
