//! # Structured Logging Module
//!
//! Environment-aware structured logging to console and a JSON log file, plus
//! the per-task event logger that tags every line with the task's event id.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Lines kept per task logger
const TASK_LOG_CAPACITY: usize = 512;

/// Initialize structured logging with environment-specific configuration
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let log_level = get_log_level(&environment);

        let console_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_level(true)
            .with_ansi(true)
            .with_filter(EnvFilter::new(log_level.clone()));

        // File output is best effort; console logging still works without a log directory
        let log_dir = PathBuf::from("log");
        let file_layer = match fs::create_dir_all(&log_dir) {
            Ok(()) => {
                let pid = process::id();
                let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
                let file_appender = tracing_appender::rolling::never(
                    &log_dir,
                    format!("{environment}.{pid}.{timestamp}.log"),
                );
                let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
                // Keep the writer alive for the life of the process
                std::mem::forget(guard);

                Some(
                    fmt::layer()
                        .with_writer(file_writer)
                        .with_target(true)
                        .with_thread_ids(true)
                        .with_level(true)
                        .with_ansi(false)
                        .json()
                        .with_filter(EnvFilter::new(log_level)),
                )
            }
            Err(_) => None,
        };

        let subscriber = tracing_subscriber::registry()
            .with(console_layer)
            .with(file_layer);

        if subscriber.try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
        }

        tracing::info!(
            pid = process::id(),
            environment = %environment,
            "🔧 STRUCTURED LOGGING: Initialized"
        );
    });
}

/// Get current environment from environment variables
fn get_environment() -> String {
    std::env::var("WORKER_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

/// Get log level based on environment, unless RUST_LOG says otherwise
fn get_log_level(environment: &str) -> String {
    if let Ok(filter) = std::env::var("RUST_LOG") {
        return filter;
    }
    match environment {
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}

/// Log structured data for task lifecycle operations
pub fn log_task_operation(
    operation: &str,
    task_id: &str,
    event_id: &str,
    service_id: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        task_id = %task_id,
        event_id = %event_id,
        service_id = service_id,
        status = %status,
        details = details,
        "📋 TASK_OPERATION"
    );
}

/// Log structured data for orchestrator calls
pub fn log_workload_operation(
    operation: &str,
    kind: &str,
    name: &str,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        kind = %kind,
        name = %name,
        status = %status,
        details = details,
        "☸️ WORKLOAD_OPERATION"
    );
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Error,
}

/// One line written through a [`TaskLogger`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskLogLine {
    pub level: LogLevel,
    pub message: String,
    pub step: String,
    pub status: String,
    pub time: DateTime<Utc>,
}

/// Event logger bound to one task's event id.
///
/// Lines go to `tracing` with `event_id`, `step` and `status` fields and are
/// kept in a bounded buffer until the logger is released.
#[derive(Debug, Clone)]
pub struct TaskLogger {
    event_id: String,
    lines: Arc<Mutex<VecDeque<TaskLogLine>>>,
    released: Arc<AtomicBool>,
}

impl TaskLogger {
    pub fn new(event_id: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(16))),
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn info(&self, message: &str, step: &str, status: &str) {
        tracing::info!(event_id = %self.event_id, step = %step, status = %status, "{message}");
        self.push(LogLevel::Info, message, step, status);
    }

    pub fn error(&self, message: &str, step: &str, status: &str) {
        tracing::error!(event_id = %self.event_id, step = %step, status = %status, "{message}");
        self.push(LogLevel::Error, message, step, status);
    }

    fn push(&self, level: LogLevel, message: &str, step: &str, status: &str) {
        if self.released.load(Ordering::Acquire) {
            return;
        }
        let mut lines = self.lines.lock();
        if lines.len() == TASK_LOG_CAPACITY {
            lines.pop_front();
        }
        lines.push_back(TaskLogLine {
            level,
            message: message.to_string(),
            step: step.to_string(),
            status: status.to_string(),
            time: Utc::now(),
        });
    }

    /// Snapshot of the buffered lines
    pub fn lines(&self) -> Vec<TaskLogLine> {
        self.lines.lock().iter().cloned().collect()
    }

    /// Close the logger; later lines still reach `tracing` but are not buffered
    pub fn release(&self) {
        self.released.store(true, Ordering::Release);
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}
