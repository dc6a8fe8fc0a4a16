//! Readiness signal for components that can run degraded.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// How ready a component is to serve traffic.
///
/// Ordered from best to worst, so the readiness of a group is its maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Readiness {
    /// Fully operational.
    Ready,
    /// Serving, but from a fallback path.
    Degraded,
    /// Cannot serve.
    Unavailable,
}

impl Readiness {
    /// Lowercase wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Unavailable => "unavailable",
        }
    }

    /// Whether traffic should still be routed here.
    pub fn is_serving(self) -> bool {
        self != Self::Unavailable
    }

    /// Worst of several readiness values. An empty set is ready.
    pub fn combine(values: impl IntoIterator<Item = Self>) -> Self {
        values.into_iter().max().unwrap_or(Self::Ready)
    }
}

/// A component that reports its own readiness.
#[async_trait]
pub trait ReadinessCheck: Send + Sync {
    /// Component name used in health output.
    fn name(&self) -> &str;

    /// Current readiness. Must not fail.
    async fn readiness(&self) -> Readiness;
}
