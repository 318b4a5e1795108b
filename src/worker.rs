//! A complete worker: queue consumer, sandbox pool, executors, and status
//! reporting wired together from a [`WorkerConfig`].

use std::sync::Arc;

use anyhow::{Result, anyhow};
use tokio::{sync::watch, task::JoinHandle};
use tracing::info;
use uuid::Uuid;

use crate::backends::{CoreBackend, WorkerStatusBackend};
use crate::config::WorkerConfig;
use crate::dispatcher::{Dispatcher, DispatcherStats};
use crate::executors::{
    ExecutorRegistry, FlowRunExecutor, ResumeExecutor, TriggerPollExecutor, WebhookExecutor,
};
use crate::jobs::JobType;
use crate::network::PublicIpCache;
use crate::queue::JobQueue;
use crate::runs::FlowRunService;
use crate::sandbox::SandboxPool;
use crate::status::{DispatcherStatsSource, spawn_status_reporter};

/// Registers the executor for every job type.
pub fn default_executors(
    pool: Arc<SandboxPool>,
    runs: Arc<FlowRunService>,
    http: reqwest::Client,
) -> ExecutorRegistry {
    let webhook = Arc::new(WebhookExecutor::new(http));
    ExecutorRegistry::new()
        .with(JobType::FlowRun, Arc::new(FlowRunExecutor::new(Arc::clone(&pool))))
        .with(
            JobType::TriggerPoll,
            Arc::new(TriggerPollExecutor::new(pool, Arc::clone(&runs))),
        )
        .with(JobType::OutgoingWebhook, webhook.clone())
        .with(JobType::EventDestination, webhook)
        .with(JobType::DelayedResume, Arc::new(ResumeExecutor::new(runs)))
}

pub struct Worker {
    worker_id: Uuid,
    runs: Arc<FlowRunService>,
    pool: Arc<SandboxPool>,
    dispatcher: Dispatcher,
    status_shutdown_tx: watch::Sender<bool>,
    status_handle: JoinHandle<()>,
}

impl Worker {
    /// Starts consuming `queue`. Runs and job outcomes go to `backend`.
    pub fn start<B>(config: &WorkerConfig, queue: Arc<dyn JobQueue>, backend: Arc<B>) -> Self
    where
        B: CoreBackend + WorkerStatusBackend + 'static,
    {
        let worker_id = Uuid::new_v4();
        let http = reqwest::Client::new();
        let public_ip = match &config.public_ip_url {
            Some(url) => PublicIpCache::with_http(http.clone(), url.clone()),
            None => PublicIpCache::disabled(),
        };

        let core: Arc<dyn CoreBackend> = backend.clone();
        let runs = Arc::new(FlowRunService::new(
            core,
            Arc::clone(&queue),
            config.job_timeouts(),
        ));
        let pool = Arc::new(SandboxPool::new(
            config.sandbox_config(),
            config.sandbox_limits(),
            config.max_executions,
        ));
        let executors = default_executors(Arc::clone(&pool), Arc::clone(&runs), http);
        let dispatcher = Dispatcher::start(
            config.dispatcher_config(),
            queue,
            executors,
            Arc::clone(&runs),
        );

        let (status_shutdown_tx, status_shutdown_rx) = watch::channel(false);
        let status_backend: Arc<dyn WorkerStatusBackend> = backend;
        let status_handle = spawn_status_reporter(
            worker_id,
            status_backend,
            DispatcherStatsSource {
                concurrency: config.concurrency,
                dispatcher: dispatcher.stats(),
                pool: Arc::clone(&pool),
            },
            public_ip,
            config.status_interval,
            status_shutdown_rx,
        );

        info!(
            %worker_id,
            concurrency = config.concurrency,
            engine = %config.engine_path.display(),
            "worker started"
        );

        Self {
            worker_id,
            runs,
            pool,
            dispatcher,
            status_shutdown_tx,
            status_handle,
        }
    }

    pub fn id(&self) -> Uuid {
        self.worker_id
    }

    /// Entry point for starting, resuming, and delivering work.
    pub fn runs(&self) -> Arc<FlowRunService> {
        Arc::clone(&self.runs)
    }

    pub fn pool(&self) -> Arc<SandboxPool> {
        Arc::clone(&self.pool)
    }

    pub fn dispatcher_stats(&self) -> Arc<DispatcherStats> {
        self.dispatcher.stats()
    }

    /// Drains in-flight jobs, stops status reporting, and destroys idle sandboxes.
    pub async fn shutdown(self) -> Result<()> {
        info!(worker_id = %self.worker_id, "worker shutting down");
        self.dispatcher.shutdown().await?;
        let _ = self.status_shutdown_tx.send(true);
        self.status_handle
            .await
            .map_err(|err| anyhow!("status reporter panicked: {err}"))?;
        self.pool.shutdown().await;
        Ok(())
    }
}
