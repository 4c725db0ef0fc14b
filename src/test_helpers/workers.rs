//! Task worker with scripted behavior for executor tests

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, WorkerError};
use crate::logging::TaskLogger;
use crate::models::{TaskKind, WorkerKey};
use crate::tasks::TaskWorker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Succeed,
    Fail,
    Panic,
    /// `run` returns only once the worker is stopped or rolled back
    BlockUntilStopped,
}

pub struct ScriptedWorker {
    key: WorkerKey,
    logger: TaskLogger,
    behavior: Behavior,
    calls: Mutex<Vec<&'static str>>,
    last_error: Mutex<Option<String>>,
    cancel: CancellationToken,
    started: Notify,
}

impl ScriptedWorker {
    pub fn new(task_id: impl Into<String>, event_id: impl Into<String>, behavior: Behavior) -> Arc<Self> {
        let key = WorkerKey::new(task_id, event_id);
        Arc::new(Self {
            logger: TaskLogger::new(&key.event_id),
            key,
            behavior,
            calls: Mutex::new(Vec::new()),
            last_error: Mutex::new(None),
            cancel: CancellationToken::new(),
            started: Notify::new(),
        })
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub fn logger_released(&self) -> bool {
        self.logger.is_released()
    }

    /// Resolves once `run` has been entered
    pub async fn wait_started(&self) {
        self.started.notified().await;
    }

    fn record(&self, call: &'static str) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl TaskWorker for ScriptedWorker {
    fn key(&self) -> &WorkerKey {
        &self.key
    }

    fn kind(&self) -> TaskKind {
        TaskKind::Start
    }

    fn logger(&self) -> &TaskLogger {
        &self.logger
    }

    async fn before_run(&self) -> Result<()> {
        self.record("before_run");
        Ok(())
    }

    async fn run(&self) -> Result<()> {
        self.record("run");
        self.started.notify_one();
        match self.behavior {
            Behavior::Succeed => Ok(()),
            Behavior::Fail => Err(WorkerError::Unsupported("scripted failure".to_string())),
            Behavior::Panic => panic!("scripted panic"),
            Behavior::BlockUntilStopped => {
                self.cancel.cancelled().await;
                Ok(())
            }
        }
    }

    async fn run_success(&self) {
        self.record("run_success");
    }

    async fn run_error(&self, err: &WorkerError) {
        self.record("run_error");
        *self.last_error.lock() = Some(err.to_string());
    }

    async fn after_run(&self) {
        self.record("after_run");
        self.logger.release();
    }

    async fn stop(&self) -> Result<()> {
        self.record("stop");
        self.cancel.cancel();
        Ok(())
    }

    async fn roll_back(&self) {
        self.record("roll_back");
        self.cancel.cancel();
    }
}
