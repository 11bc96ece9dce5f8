//! Wires stores, handlers and jobs into a running worker

use std::sync::Arc;

use anyhow::{Context, Result};
use jobguard_durable::callback::{
    CallbackTaskRegistry, HandlerRegistry, HttpCallbackHandler, PendingRunSweeper, TaskFunction,
};
use jobguard_durable::coordination::{
    CoordinationStore, InMemoryCoordinationStore, RedisCoordinationStore,
};
use jobguard_durable::job::{
    AlertSink, Job, JobRunner, JobRunnerConfig, JobScheduler, TracingAlertSink, WebhookAlertSink,
};
use jobguard_durable::lock::DistributedMutex;
use jobguard_durable::persistence::{
    migrate, CallbackStore, InMemoryCallbackStore, PostgresCallbackStore,
};
use jobguard_durable::reliability::SlidingWindowRateLimiter;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::config::WorkerConfig;

/// Handler registry built from configured endpoints
///
/// Every task function of an API is delivered to that API's endpoint.
pub fn build_handlers(config: &WorkerConfig) -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new();
    for (api, endpoint) in &config.callback_endpoints {
        let mut handler = HttpCallbackHandler::new(endpoint.url.clone());
        if let Some((header, value)) = &endpoint.api_key {
            handler = handler.with_api_key(header.clone(), value.clone());
        }
        let handler = Arc::new(handler);
        for function in TaskFunction::ALL {
            handlers.register(*api, *function, handler.clone());
        }
        info!(api = %api, endpoint = %endpoint.url, "registered callback endpoint");
    }
    handlers
}

/// A configured worker process
pub struct Worker {
    config: WorkerConfig,
    scheduler: JobScheduler,
    registry: CallbackTaskRegistry,
}

impl Worker {
    /// Connect the stores and register the built-in jobs
    pub async fn build(config: WorkerConfig) -> Result<Self> {
        let coordination = connect_coordination(&config).await?;
        let callbacks = connect_callbacks(&config).await?;
        Self::with_stores(config, coordination, callbacks)
    }

    /// Build on top of already connected stores
    pub fn with_stores(
        config: WorkerConfig,
        coordination: Arc<dyn CoordinationStore>,
        callbacks: Arc<dyn CallbackStore>,
    ) -> Result<Self> {
        let alerts: Arc<dyn AlertSink> = match &config.alert_webhook_url {
            Some(url) => Arc::new(WebhookAlertSink::new(url.clone())),
            None => Arc::new(TracingAlertSink),
        };

        let runner = Arc::new(
            JobRunner::new(DistributedMutex::new(coordination.clone()), alerts)
                .with_config(JobRunnerConfig::default().with_lock_ttl(config.job_lock_ttl)),
        );

        let handlers = Arc::new(build_handlers(&config));
        let limiter =
            SlidingWindowRateLimiter::new(coordination.clone()).with_default_policy(config.rate_limit);

        let registry =
            CallbackTaskRegistry::new(callbacks.clone(), handlers.clone(), limiter.clone());
        let sweeper = PendingRunSweeper::new(callbacks, handlers, limiter, coordination);

        let mut scheduler = JobScheduler::new(runner);
        scheduler
            .register(Arc::new(sweeper), config.sweep_interval)
            .context("Failed to register sweeper job")?;

        Ok(Self {
            config,
            scheduler,
            registry,
        })
    }

    /// Add an application job
    pub fn register_job(
        &mut self,
        job: Arc<dyn Job>,
        period: std::time::Duration,
    ) -> Result<()> {
        self.scheduler
            .register(job, period)
            .context("Failed to register job")
    }

    /// Entry point for application code invoking callbacks
    pub fn registry(&self) -> &CallbackTaskRegistry {
        &self.registry
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &JobScheduler {
        &self.scheduler
    }

    /// Clear stale locks if configured, then start the job timers
    pub async fn start(&mut self) -> Result<()> {
        if self.config.clear_locks_on_startup {
            let cleared = self
                .scheduler
                .clear_stale_locks()
                .await
                .context("Failed to clear stale job locks")?;
            info!(cleared, "cleared job locks on startup");
        }

        info!(worker_id = %self.config.worker_id, "starting job scheduler");
        self.scheduler.start();
        Ok(())
    }

    /// Stop the timers and wait for running jobs
    pub async fn shutdown(&mut self) {
        self.scheduler.shutdown().await;
    }
}

async fn connect_coordination(config: &WorkerConfig) -> Result<Arc<dyn CoordinationStore>> {
    match &config.redis_url {
        Some(url) => {
            let store = RedisCoordinationStore::connect(url)
                .await
                .context("Failed to connect to Redis")?;
            info!("connected to coordination store");
            Ok(Arc::new(store))
        }
        None => {
            warn!("REDIS_URL not set, using in-memory coordination (single process only)");
            Ok(Arc::new(InMemoryCoordinationStore::new()))
        }
    }
}

async fn connect_callbacks(config: &WorkerConfig) -> Result<Arc<dyn CallbackStore>> {
    match &config.database_url {
        Some(url) => {
            let pool = PgPool::connect(url)
                .await
                .context("Failed to connect to PostgreSQL")?;
            if config.run_migrations {
                migrate(&pool).await.context("Failed to run migrations")?;
                info!("migrations applied");
            }
            Ok(Arc::new(PostgresCallbackStore::new(pool)))
        }
        None => {
            warn!("DATABASE_URL not set, callback runs are kept in memory");
            Ok(Arc::new(InMemoryCallbackStore::new()))
        }
    }
}
