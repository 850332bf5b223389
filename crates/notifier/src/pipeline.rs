//! Create-and-dispatch entry point.

use std::sync::Arc;

use beacon_common::error::AppError;
use beacon_engine::notifications::{CreateNotificationParams, NotificationService};

use crate::dispatcher::{DispatchSummary, Dispatcher};

pub struct NotificationPipeline {
    notifications: Arc<NotificationService>,
    dispatcher: Dispatcher,
}

impl NotificationPipeline {
    pub fn new(notifications: Arc<NotificationService>, dispatcher: Dispatcher) -> Self {
        Self {
            notifications,
            dispatcher,
        }
    }

    /// Validate and store the record, then fan it out.
    ///
    /// Invalid parameters are rejected before any attempt exists.
    pub async fn create_and_dispatch(
        &self,
        params: &CreateNotificationParams,
    ) -> Result<DispatchSummary, AppError> {
        let record = self.notifications.create(params).await?;
        self.dispatcher.dispatch(&record).await
    }
}
