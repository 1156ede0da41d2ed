//! Route lifecycle reporting and health checks.
//!
//! A [`RouteError`] records the last error raised while changing a route's
//! lifecycle (for example a repository failing its startup validation). It is
//! not about errors raised while routing individual messages.

use std::fmt;
use std::sync::Arc;

/// Lifecycle phase in which an error happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Starting
    Start,
    /// Stopping
    Stop,
    /// Suspending
    Suspend,
    /// Resuming
    Resume,
    /// Shutting down
    Shutdown,
    /// Being removed
    Remove,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Suspend => "suspend",
            Self::Resume => "resume",
            Self::Shutdown => "shutdown",
            Self::Remove => "remove",
        };
        f.write_str(name)
    }
}

/// The last error raised while changing a route's lifecycle.
#[derive(Debug, Clone)]
pub struct RouteError {
    phase: Phase,
    exception: Arc<dyn std::error::Error + Send + Sync>,
    unhealthy: bool,
}

impl RouteError {
    /// Create a route error.
    #[must_use]
    pub fn new(
        phase: Phase,
        exception: impl std::error::Error + Send + Sync + 'static,
        unhealthy: bool,
    ) -> Self {
        Self {
            phase,
            exception: Arc::new(exception),
            unhealthy,
        }
    }

    /// Phase in which the error happened.
    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// The error itself.
    #[must_use]
    pub fn exception(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        self.exception.as_ref()
    }

    /// Whether the route is regarded as unhealthy.
    #[must_use]
    pub const fn is_unhealthy(&self) -> bool {
        self.unhealthy
    }
}

impl fmt::Display for RouteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.phase, self.exception)
    }
}

/// Receives lifecycle errors on behalf of an external health-check subsystem.
pub trait RouteLifecycleReporter: Send + Sync {
    /// Report an error for the named component.
    fn report(&self, component: &str, error: RouteError);
}

/// Reporter that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLifecycleReporter;

impl RouteLifecycleReporter for TracingLifecycleReporter {
    fn report(&self, component: &str, error: RouteError) {
        if error.is_unhealthy() {
            tracing::error!(component, phase = %error.phase(), error = %error.exception(), "Route lifecycle error");
        } else {
            tracing::warn!(component, phase = %error.phase(), error = %error.exception(), "Route lifecycle error");
        }
    }
}

/// Health check status levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthStatus {
    /// Component is fully operational
    Healthy,

    /// Component is operational but experiencing issues
    Degraded,

    /// Component is not operational
    Unhealthy,
}

impl HealthStatus {
    /// Check if status is healthy
    #[must_use]
    pub const fn is_healthy(self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// Check if status is degraded
    #[must_use]
    pub const fn is_degraded(self) -> bool {
        matches!(self, Self::Degraded)
    }

    /// Check if status is unhealthy
    #[must_use]
    pub const fn is_unhealthy(self) -> bool {
        matches!(self, Self::Unhealthy)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Health check result for a component
#[derive(Debug, Clone)]
pub struct HealthCheck {
    /// Name of the component being checked
    pub component: String,

    /// Current health status
    pub status: HealthStatus,

    /// Optional message providing details
    pub message: Option<String>,

    /// Optional metadata (e.g., key counts)
    pub metadata: Vec<(String, String)>,
}

impl HealthCheck {
    /// Create a healthy check result
    #[must_use]
    pub fn healthy(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Healthy,
            message: None,
            metadata: Vec::new(),
        }
    }

    /// Create a degraded check result
    #[must_use]
    pub fn degraded(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Degraded,
            message: Some(message.into()),
            metadata: Vec::new(),
        }
    }

    /// Create an unhealthy check result
    #[must_use]
    pub fn unhealthy(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
            metadata: Vec::new(),
        }
    }

    /// Add metadata to the health check
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.push((key.into(), value.into()));
        self
    }

    /// Look up a metadata value
    #[must_use]
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("bad interval")]
    struct BadInterval;

    #[test]
    fn route_error_accessors() {
        let error = RouteError::new(Phase::Start, BadInterval, true);
        assert_eq!(error.phase(), Phase::Start);
        assert!(error.is_unhealthy());
        assert_eq!(error.exception().to_string(), "bad interval");
        assert_eq!(error.to_string(), "start failed: bad interval");
    }

    #[test]
    fn health_metadata_lookup() {
        let check = HealthCheck::degraded("repo", "slow").with_metadata("tracked_keys", "4");
        assert!(check.status.is_degraded());
        assert_eq!(check.metadata_value("tracked_keys"), Some("4"));
        assert_eq!(check.metadata_value("missing"), None);
    }
}
