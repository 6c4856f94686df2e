use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::warn;

/// Aggregated liveness for the long-running tasks of a service.
///
/// Each task registers a component and must report healthy more often than
/// its deadline, otherwise the component counts as stalled and the probe
/// fails. The process is healthy only while every registered component is.
/// Liveness and readiness are different questions: give each probe its own
/// registry instead of sharing one.
#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<BTreeMap<String, ComponentStatus>>>,
    sender: mpsc::Sender<HealthReport>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentStatus {
    /// Set at registration, before the first report.
    Starting,
    /// Healthy as long as the deadline is in the future.
    HealthyUntil(OffsetDateTime),
    /// The component reported a failure it cannot recover from.
    Unhealthy,
}

impl ComponentStatus {
    fn describe(&self, now: OffsetDateTime) -> &'static str {
        match self {
            ComponentStatus::Starting => "starting",
            ComponentStatus::HealthyUntil(until) if *until > now => "healthy",
            ComponentStatus::HealthyUntil(_) => "stalled",
            ComponentStatus::Unhealthy => "unhealthy",
        }
    }

    fn is_healthy(&self, now: OffsetDateTime) -> bool {
        matches!(self, ComponentStatus::HealthyUntil(until) if *until > now)
    }
}

struct HealthReport {
    component: String,
    status: ComponentStatus,
}

/// Handed to a component so it can feed the registry. Cheap to clone.
#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    sender: mpsc::Sender<HealthReport>,
}

impl HealthHandle {
    /// Report healthy for another deadline window. Must be called more
    /// frequently than the deadline passed at registration.
    pub async fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            OffsetDateTime::now_utc() + self.deadline,
        ))
        .await;
    }

    pub async fn report_status(&self, status: ComponentStatus) {
        let report = HealthReport {
            component: self.component.clone(),
            status,
        };
        if self.sender.send(report).await.is_err() {
            warn!(component = self.component, "health registry went away");
        }
    }
}

/// Snapshot of the registry, servable as an axum response body.
#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub components: BTreeMap<String, &'static str>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let code = if self.healthy {
            StatusCode::OK
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (code, Json(self)).into_response()
    }
}

impl HealthRegistry {
    /// Must be called from within a tokio runtime: reports are drained by
    /// a background task.
    pub fn new(name: &str) -> Self {
        let (sender, mut receiver) = mpsc::channel::<HealthReport>(16);
        let registry = Self {
            name: name.to_owned(),
            components: Default::default(),
            sender,
        };

        let components = registry.components.clone();
        tokio::spawn(async move {
            while let Some(report) = receiver.recv().await {
                match components.write() {
                    Ok(mut map) => {
                        map.insert(report.component, report.status);
                    }
                    Err(_) => warn!("poisoned health registry lock"),
                }
            }
        });

        registry
    }

    /// Registers a component and returns the handle it should report
    /// through. The component counts against the probe immediately, in the
    /// Starting state.
    pub async fn register(&self, component: &str, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component: component.to_owned(),
            deadline,
            sender: self.sender.clone(),
        };
        handle.report_status(ComponentStatus::Starting).await;
        handle
    }

    /// Aggregate status of all registered components. Usable directly as an
    /// axum handler return value.
    pub fn get_status(&self) -> HealthStatus {
        let now = OffsetDateTime::now_utc();
        let components = match self.components.read() {
            Ok(map) => map,
            Err(_) => {
                warn!(registry = self.name, "poisoned health registry lock");
                return HealthStatus {
                    healthy: false,
                    components: BTreeMap::new(),
                };
            }
        };

        // An empty registry is not healthy: nothing has registered yet.
        let healthy =
            !components.is_empty() && components.values().all(|status| status.is_healthy(now));
        let components = components
            .iter()
            .map(|(name, status)| (name.clone(), status.describe(now)))
            .collect();

        let status = HealthStatus {
            healthy,
            components,
        };
        if !status.healthy {
            warn!(registry = self.name, status = ?status.components, "health check failed");
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn assert_or_retry<F>(check: F)
    where
        F: Fn() -> bool,
    {
        let deadline = OffsetDateTime::now_utc() + Duration::from_secs(5);
        while !check() && OffsetDateTime::now_utc() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(check());
    }

    #[tokio::test]
    async fn empty_registry_is_unhealthy() {
        let registry = HealthRegistry::new("liveness");
        assert!(!registry.get_status().healthy);
    }

    #[tokio::test]
    async fn component_lifecycle() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("loop", Duration::from_secs(30)).await;

        // Starting components hold the probe down.
        assert_or_retry(|| registry.get_status().components.len() == 1).await;
        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(status.components.get("loop"), Some(&"starting"));

        handle.report_healthy().await;
        assert_or_retry(|| registry.get_status().healthy).await;
        assert_eq!(registry.get_status().components.get("loop"), Some(&"healthy"));

        handle.report_status(ComponentStatus::Unhealthy).await;
        assert_or_retry(|| !registry.get_status().healthy).await;
    }

    #[tokio::test]
    async fn stalled_component_fails_the_probe() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("loop", Duration::from_secs(30)).await;

        handle.report_healthy().await;
        assert_or_retry(|| registry.get_status().healthy).await;

        // A deadline in the past reads as stalled.
        handle
            .report_status(ComponentStatus::HealthyUntil(
                OffsetDateTime::now_utc() - Duration::from_secs(1),
            ))
            .await;
        assert_or_retry(|| !registry.get_status().healthy).await;
        assert_eq!(registry.get_status().components.get("loop"), Some(&"stalled"));
    }

    #[tokio::test]
    async fn all_components_must_report() {
        let registry = HealthRegistry::new("liveness");
        let first = registry.register("ingestion", Duration::from_secs(30)).await;
        let second = registry.register("workers", Duration::from_secs(30)).await;
        assert_or_retry(|| registry.get_status().components.len() == 2).await;

        first.report_healthy().await;
        assert_or_retry(|| {
            registry.get_status().components.get("ingestion") == Some(&"healthy")
        })
        .await;
        assert!(!registry.get_status().healthy);

        second.report_healthy().await;
        assert_or_retry(|| registry.get_status().healthy).await;
    }

    #[tokio::test]
    async fn status_as_response() {
        let unhealthy = HealthStatus {
            healthy: false,
            components: BTreeMap::new(),
        }
        .into_response();
        assert_eq!(unhealthy.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let healthy = HealthStatus {
            healthy: true,
            components: BTreeMap::new(),
        }
        .into_response();
        assert_eq!(healthy.status(), StatusCode::OK);
    }
}
