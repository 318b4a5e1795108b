//! In-memory backend for tests and local runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use super::base::{
    BackendError, BackendResult, CoreBackend, FlowRunRecord, JobReport, PausedRun, RunReport,
    WorkerStatusBackend, WorkerStatusUpdate,
};
use crate::flow::{FlowRun, FlowRunStatus};

/// Backend that stores runs and reports in memory.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    runs: Arc<Mutex<HashMap<Uuid, FlowRunRecord>>>,
    run_reports: Arc<Mutex<Vec<RunReport>>>,
    paused_runs: Arc<Mutex<Vec<PausedRun>>>,
    job_reports: Arc<Mutex<Vec<JobReport>>>,
    worker_status_updates: Arc<Mutex<Vec<WorkerStatusUpdate>>>,
    failing_job_reports: Arc<AtomicUsize>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run(&self, run_id: Uuid) -> Option<FlowRunRecord> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner).get(&run_id).cloned()
    }

    pub fn run_reports(&self) -> Vec<RunReport> {
        self.run_reports.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn paused_runs(&self) -> Vec<PausedRun> {
        self.paused_runs.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn job_reports(&self) -> Vec<JobReport> {
        self.job_reports.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn worker_status_updates(&self) -> Vec<WorkerStatusUpdate> {
        self.worker_status_updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Makes the next `count` calls to `save_job_finished` fail.
    pub fn fail_job_reports(&self, count: usize) {
        self.failing_job_reports.store(count, Ordering::SeqCst);
    }

    fn with_running_run<T>(
        &self,
        run_id: Uuid,
        apply: impl FnOnce(&mut FlowRunRecord) -> BackendResult<T>,
    ) -> BackendResult<T> {
        let mut runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        let record = runs
            .get_mut(&run_id)
            .ok_or(BackendError::RunNotFound(run_id))?;
        if record.run.status != FlowRunStatus::Running {
            return Err(BackendError::Conflict {
                run_id,
                expected: FlowRunStatus::Running,
                actual: record.run.status,
            });
        }
        apply(record)
    }
}

#[async_trait]
impl CoreBackend for MemoryBackend {
    async fn create_run(&self, record: FlowRunRecord) -> BackendResult<()> {
        let mut runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        if runs.contains_key(&record.run.id) {
            return Err(BackendError::Message(format!(
                "flow run {} already exists",
                record.run.id
            )));
        }
        runs.insert(record.run.id, record);
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> BackendResult<FlowRunRecord> {
        self.run(run_id).ok_or(BackendError::RunNotFound(run_id))
    }

    async fn update_run_status(
        &self,
        run_id: Uuid,
        expected: FlowRunStatus,
        next: FlowRunStatus,
    ) -> BackendResult<FlowRun> {
        let mut runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        let record = runs
            .get_mut(&run_id)
            .ok_or(BackendError::RunNotFound(run_id))?;
        if record.run.status != expected {
            return Err(BackendError::Conflict {
                run_id,
                expected,
                actual: record.run.status,
            });
        }
        record.run.transition(next)?;
        Ok(record.run.clone())
    }

    async fn save_run_finished(&self, report: &RunReport) -> BackendResult<()> {
        self.with_running_run(report.run_id, |record| {
            record.run.transition(report.status)?;
            record.run.failed_step = report.failed_step.clone();
            record.run.tags = report.execution_state.tags.iter().cloned().collect();
            record.state = report.execution_state.clone();
            Ok(())
        })?;
        debug!(run_id = %report.run_id, status = report.status.as_str(), "run finished");
        self.run_reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(report.clone());
        Ok(())
    }

    async fn save_run_paused(&self, paused: &PausedRun) -> BackendResult<()> {
        self.with_running_run(paused.run_id, |record| {
            record.run.transition(FlowRunStatus::Paused)?;
            record.run.pause_metadata = Some(paused.pause_metadata.clone());
            record.state = paused.execution_state.clone();
            Ok(())
        })?;
        self.paused_runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(paused.clone());
        Ok(())
    }

    async fn save_job_finished(&self, report: &JobReport) -> BackendResult<()> {
        let failing = self
            .failing_job_reports
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(BackendError::Message("job report store unavailable".to_string()));
        }
        self.job_reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(report.clone());
        Ok(())
    }
}

#[async_trait]
impl WorkerStatusBackend for MemoryBackend {
    async fn upsert_worker_status(&self, status: &WorkerStatusUpdate) -> BackendResult<()> {
        let mut updates = self
            .worker_status_updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        updates.retain(|existing| existing.worker_id != status.worker_id);
        updates.push(status.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ExecutionState;
    use crate::flow::{FlowGraph, PauseMetadata, RunEnvironment, TriggerKind, TriggerNode};

    fn record() -> FlowRunRecord {
        let flow = FlowGraph::new(
            TriggerNode {
                name: "trigger".to_string(),
                kind: TriggerKind::Webhook,
            },
            Vec::new(),
        );
        FlowRunRecord {
            run: FlowRun::new(&flow, RunEnvironment::Production),
            flow,
            state: ExecutionState::default(),
        }
    }

    #[tokio::test]
    async fn status_update_is_compare_and_set() {
        let backend = MemoryBackend::new();
        let record = record();
        let run_id = record.run.id;
        backend.create_run(record).await.unwrap();

        backend
            .save_run_paused(&PausedRun {
                run_id,
                execution_state: ExecutionState::default(),
                pause_metadata: PauseMetadata::Webhook {
                    request_id: "req".to_string(),
                    response: None,
                },
                duration_ms: 1,
            })
            .await
            .unwrap();

        backend
            .update_run_status(run_id, FlowRunStatus::Paused, FlowRunStatus::Running)
            .await
            .unwrap();
        let second = backend
            .update_run_status(run_id, FlowRunStatus::Paused, FlowRunStatus::Running)
            .await;
        assert!(matches!(
            second,
            Err(BackendError::Conflict {
                actual: FlowRunStatus::Running,
                ..
            })
        ));
        assert!(backend.run(run_id).unwrap().run.pause_metadata.is_none());
    }

    #[tokio::test]
    async fn finished_runs_cannot_be_finished_again() {
        let backend = MemoryBackend::new();
        let record = record();
        let run_id = record.run.id;
        backend.create_run(record).await.unwrap();

        let report = RunReport {
            run_id,
            status: FlowRunStatus::Succeeded,
            execution_state: ExecutionState::default(),
            duration_ms: 3,
            error_message: None,
            failure_reason: None,
            failed_step: None,
            response: None,
        };
        backend.save_run_finished(&report).await.unwrap();
        assert!(backend.save_run_finished(&report).await.is_err());
        assert_eq!(backend.run_reports().len(), 1);
        assert!(backend.run(run_id).unwrap().run.finished_at.is_some());
    }

    #[tokio::test]
    async fn unknown_runs_are_reported() {
        let backend = MemoryBackend::new();
        assert!(matches!(
            backend.get_run(Uuid::nil()).await,
            Err(BackendError::RunNotFound(_))
        ));
    }
}
