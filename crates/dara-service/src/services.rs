//! Provides the Dara services and a way to initialize them.
//!
//! [`Services::new`] creates the cache store, the [`Coordinator`] on top of it and, if enabled, the
//! worker [`TaskPool`] according to the provided [`Config`]. The services are handed to their
//! consumers explicitly, there are no global registries.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::caching::CacheStore;
use crate::config::Config;
use crate::coordination::Coordinator;
use crate::logging;
use crate::metrics::{self, MetricsSink, StatsdSink};
use crate::pool::{TaskPool, Value};

/// How long [`Services::shutdown`] waits for the remaining pool tasks.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Initializes sentry, logging and metrics for a process.
///
/// The returned guard flushes pending sentry events when dropped.
///
/// # Safety
///
/// This must be called in a single-threaded context, see [`logging::init_logging`].
pub unsafe fn init_observability(config: &Config) -> Result<sentry::ClientInitGuard> {
    let sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: Forwarded to the caller.
    unsafe { logging::init_logging(config) };

    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();
        if let Some(tag) = config.metrics.hostname_tag.clone() {
            let hostname = hostname::get().ok().and_then(|s| s.into_string().ok());
            if let Some(hostname) = hostname {
                tags.insert(tag, hostname);
            }
        }
        metrics::configure_statsd(&config.metrics.prefix, statsd.as_str(), tags)
            .context("failed to configure metrics")?;
    }

    Ok(sentry)
}

/// The services of a Dara process.
#[derive(Debug, Clone)]
pub struct Services {
    pub store: Arc<CacheStore<Value>>,
    pub coordinator: Arc<Coordinator>,
    /// The worker pool, if enabled in the configuration.
    pub pool: Option<TaskPool>,
}

impl Services {
    pub fn new(config: &Config) -> Result<Self> {
        Self::with_metrics(config, Arc::new(StatsdSink))
    }

    /// Creates the services, publishing store metrics to `metrics`.
    pub fn with_metrics(config: &Config, metrics: Arc<dyn MetricsSink>) -> Result<Self> {
        let store = Arc::new(CacheStore::new(metrics));
        let coordinator = Arc::new(Coordinator::new(Arc::clone(&store)));

        let pool = if config.pool.enabled {
            std::fs::create_dir_all(&config.pool.shm_dir).with_context(|| {
                format!(
                    "failed to create shared memory directory {}",
                    config.pool.shm_dir.display()
                )
            })?;
            Some(TaskPool::new(config.pool.clone()))
        } else {
            None
        };

        Ok(Self {
            store,
            coordinator,
            pool,
        })
    }

    /// Starts the worker pool, if any.
    pub async fn start(&self) -> Result<()> {
        if let Some(pool) = &self.pool {
            pool.start().await.context("failed to start the task pool")?;
        }
        Ok(())
    }

    /// Waits for the pool's remaining tasks and stops it, then drops all cached values.
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(pool) = &self.pool {
            pool.join(Some(SHUTDOWN_TIMEOUT))
                .await
                .context("failed to stop the task pool")?;
        }
        self.store.clear();
        Ok(())
    }
}
