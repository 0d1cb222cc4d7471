use deadpool_postgres::{Config as DeadpoolConfig, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Timeouts};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_postgres::NoTls;

use crate::config::ExecutorConfig;
use crate::error::AppError;

/// Size and timeouts applied to every pool the manager creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_size: usize,
    /// Bound on waiting for, opening, and recycling a connection.
    pub timeout: Duration,
}

impl PoolSettings {
    /// One connection per concurrent fetch; a checkout never outlives one attempt's budget.
    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self {
            max_size: config.max_parallelism.max(1),
            timeout: config.operation_timeout(),
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: 16,
            timeout: Duration::from_secs(30),
        }
    }
}

/// One deadpool per relational connection URL, shared by every source that points at it.
pub struct ConnectionPoolManager {
    pools: Arc<RwLock<HashMap<String, Pool>>>,
    settings: PoolSettings,
}

impl ConnectionPoolManager {
    pub fn new() -> Self {
        Self::with_settings(PoolSettings::default())
    }

    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self::with_settings(PoolSettings::from_config(config))
    }

    pub fn with_settings(settings: PoolSettings) -> Self {
        Self {
            pools: Arc::new(RwLock::new(HashMap::new())),
            settings,
        }
    }

    pub fn settings(&self) -> PoolSettings {
        self.settings
    }

    /// Get or create the pool for `connection_url`. Safe to call concurrently.
    pub async fn get_or_create_pool(&self, connection_url: &str) -> Result<Pool, AppError> {
        {
            let pools = self.pools.read().await;
            if let Some(pool) = pools.get(connection_url) {
                return Ok(pool.clone());
            }
        }

        let mut pools = self.pools.write().await;

        // Created by another task while we waited for the write lock
        if let Some(pool) = pools.get(connection_url) {
            return Ok(pool.clone());
        }

        let masked = mask_credentials(connection_url);
        tracing::info!(
            url = %masked,
            max_size = self.settings.max_size,
            timeout_ms = self.settings.timeout.as_millis() as u64,
            "creating connection pool"
        );

        let mut cfg = DeadpoolConfig::new();
        cfg.url = Some(connection_url.to_string());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        let mut pool_cfg = PoolConfig::new(self.settings.max_size);
        pool_cfg.timeouts = Timeouts {
            wait: Some(self.settings.timeout),
            create: Some(self.settings.timeout),
            recycle: Some(self.settings.timeout),
        };
        cfg.pool = Some(pool_cfg);

        let pool = cfg
            .create_pool(Some(deadpool_postgres::Runtime::Tokio1), NoTls)
            .map_err(|e| {
                tracing::error!(url = %masked, error = %e, "failed to create connection pool");
                AppError::Connection(format!("Failed to create connection pool: {}", e))
            })?;

        pools.insert(connection_url.to_string(), pool.clone());
        Ok(pool)
    }

    pub async fn remove_pool(&self, connection_url: &str) -> bool {
        let mut pools = self.pools.write().await;
        let removed = pools.remove(connection_url).is_some();
        if removed {
            tracing::info!(url = %mask_credentials(connection_url), "removed connection pool");
        }
        removed
    }

    pub async fn pool_count(&self) -> usize {
        self.pools.read().await.len()
    }
}

impl Default for ConnectionPoolManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Mask credentials in a connection URL for safe logging
pub fn mask_credentials(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(parsed) => {
            let mut masked = parsed.clone();
            if parsed.password().is_some() {
                let _ = masked.set_password(Some("***"));
            }
            masked.to_string()
        }
        Err(_) => "[invalid-url]".to_string(),
    }
}
