//! Readiness of the shared database pool.

use async_trait::async_trait;
use bastion_session::{Readiness, ReadinessCheck};
use sqlx::PgPool;
use tracing::warn;

/// Reports the database as ready when a trivial query succeeds.
///
/// An unreachable database degrades the instance rather than taking it out
/// of rotation: delivery workers stall on the durable queue, and sessions are
/// served from the in-memory fallback until the primary recovers.
#[derive(Debug, Clone)]
pub struct DatabaseCheck {
    pool: PgPool,
}

impl DatabaseCheck {
    /// Checks `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReadinessCheck for DatabaseCheck {
    fn name(&self) -> &str {
        "database"
    }

    async fn readiness(&self) -> Readiness {
        match sqlx::query("SELECT 1").execute(&self.pool).await {
            Ok(_) => Readiness::Ready,
            Err(error) => {
                warn!(error = %error, "database readiness probe failed");
                Readiness::Degraded
            },
        }
    }
}
