use std::collections::HashMap;
use std::ops::Add;
use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use time::Duration;

/// Health reporting for the asynchronous loops of a service.
///
/// Each loop registers a component and must report healthy more often than
/// its deadline. The process is healthy only while every registered
/// component has a fresh healthy report; a loop that stalls past its
/// deadline fails the check even though it never reported unhealthy.

#[derive(Default, Debug)]
pub struct HealthStatus {
    /// The overall status: true if all components are healthy
    pub healthy: bool,
    /// Current status of each registered component, for display
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{:?}", self);
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Automatically set when a component is newly registered
    Starting,
    /// Recently reported healthy, will need to report again before the date
    HealthyUntil(time::OffsetDateTime),
    /// Reported unhealthy
    Unhealthy,
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            components: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a new component. The returned handle must report healthy
    /// more frequently than `deadline`.
    pub fn register(&self, component: String, deadline: Duration) -> HealthHandle {
        self.components
            .write()
            .expect("health registry lock poisoned")
            .insert(component.clone(), ComponentStatus::Starting);

        HealthHandle {
            component,
            deadline,
            components: self.components.clone(),
        }
    }

    pub fn get_status(&self) -> HealthStatus {
        let components = self
            .components
            .read()
            .expect("health registry lock poisoned")
            .clone();
        let now = time::OffsetDateTime::now_utc();

        let healthy = !components.is_empty()
            && components.values().all(|status| match status {
                ComponentStatus::HealthyUntil(until) => *until > now,
                _ => false,
            });

        if !healthy {
            tracing::warn!("{} health check failed: {:?}", self.name, components);
        }

        HealthStatus { healthy, components }
    }
}

impl HealthHandle {
    /// Report healthy. Must be called more frequently than the configured
    /// deadline.
    pub fn report_healthy(&self) {
        let until = time::OffsetDateTime::now_utc().add(self.deadline);
        self.components
            .write()
            .expect("health registry lock poisoned")
            .insert(
                self.component.clone(),
                ComponentStatus::HealthyUntil(until),
            );
    }

    pub fn report_unhealthy(&self) {
        self.components
            .write()
            .expect("health registry lock poisoned")
            .insert(self.component.clone(), ComponentStatus::Unhealthy);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starting_component_is_not_healthy() {
        let registry = HealthRegistry::new("liveness");
        let _handle = registry.register("consumer".to_owned(), Duration::seconds(30));

        assert!(!registry.get_status().healthy);
    }

    #[test]
    fn test_reported_component_is_healthy_until_deadline() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("consumer".to_owned(), Duration::seconds(30));

        handle.report_healthy();
        assert!(registry.get_status().healthy);

        handle.report_unhealthy();
        assert!(!registry.get_status().healthy);
    }

    #[test]
    fn test_one_stalled_component_fails_the_process() {
        let registry = HealthRegistry::new("liveness");
        let consumer = registry.register("consumer".to_owned(), Duration::seconds(30));
        let stalled = registry.register("etl".to_owned(), Duration::seconds(-1));

        consumer.report_healthy();
        stalled.report_healthy(); // deadline already in the past

        assert!(!registry.get_status().healthy);
    }
}
