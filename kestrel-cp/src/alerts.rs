//! Alert recording and fan-out.

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info};
use uuid::Uuid;

use kestrel_store::{AlertRepo, Repository};
use kestrel_types::{Alert, AlertSeverity, Result};

use crate::bus::{Event, EventBus};
use crate::SharedRepository;

/// Raises operator-visible alerts: persisted, published on the bus.
pub struct AlertService {
    repo: SharedRepository,
    bus: Arc<EventBus>,
}

impl AlertService {
    pub fn new(repo: SharedRepository, bus: Arc<EventBus>) -> Self {
        Self { repo, bus }
    }

    pub async fn raise(
        &self,
        severity: AlertSeverity,
        resource_type: &str,
        resource_id: &str,
        message: &str,
    ) -> Result<Alert> {
        let alert = Alert {
            id: Uuid::new_v4().to_string(),
            severity,
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
            message: message.to_string(),
            resolved: false,
            resolved_at: None,
            created_at: Utc::now(),
        };
        self.repo.alerts().create(&alert).await?;
        info!(
            severity = ?severity,
            resource = %resource_id,
            message = message,
            "alert raised"
        );
        self.bus.publish(Event::alert(&alert));
        Ok(alert)
    }

    /// Raise that must not fail the surrounding reconciler: failures are
    /// logged and swallowed.
    pub async fn raise_best_effort(
        &self,
        severity: AlertSeverity,
        resource_type: &str,
        resource_id: &str,
        message: &str,
    ) {
        if let Err(e) = self
            .raise(severity, resource_type, resource_id, message)
            .await
        {
            error!(resource = %resource_id, error = %e, "failed to record alert");
        }
    }

    pub async fn resolve(&self, alert_id: &str) -> Result<()> {
        self.repo.alerts().resolve(alert_id, Utc::now()).await
    }
}
