use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// A background failure captured by the error sink.
#[derive(Debug, Clone)]
pub struct TaskFailure {
    pub task: String,
    pub message: String,
    pub at: chrono::DateTime<chrono::Utc>,
}

struct Registered {
    name: String,
    handle: JoinHandle<()>,
}

/// Registry for every background loop in the process.
///
/// Nothing is spawned fire-and-forget: each task is registered with a name,
/// shares the root cancellation token, and reports failures into the error
/// sink so they stay observable. `close` cancels and awaits everything.
pub struct TaskRegistry {
    cancel: CancellationToken,
    tasks: Mutex<Vec<Registered>>,
    failures: Arc<Mutex<Vec<TaskFailure>>>,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            failures: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Spawn a named interval loop. `op` runs every `period`; an `Err` is
    /// recorded in the error sink and the loop keeps going.
    pub fn spawn_interval<F, Fut>(&self, name: &str, period: Duration, op: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), String>> + Send,
    {
        let cancel = self.cancel.clone();
        let failures = self.failures.clone();
        let task_name = name.to_string();
        let loop_name = task_name.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(message) = op().await {
                            warn!(task = %loop_name, %message, "background task error");
                            failures.lock().unwrap().push(TaskFailure {
                                task: loop_name.clone(),
                                message,
                                at: chrono::Utc::now(),
                            });
                        }
                    }
                    _ = cancel.cancelled() => {
                        info!(task = %loop_name, "background task shutting down");
                        break;
                    }
                }
            }
        });

        self.tasks.lock().unwrap().push(Registered {
            name: task_name,
            handle,
        });
    }

    /// Names of every registered task.
    pub fn task_names(&self) -> Vec<String> {
        self.tasks
            .lock()
            .unwrap()
            .iter()
            .map(|t| t.name.clone())
            .collect()
    }

    /// Failures captured so far (most recent last).
    pub fn failures(&self) -> Vec<TaskFailure> {
        self.failures.lock().unwrap().clone()
    }

    /// Cancel every task and await completion. Idempotent.
    pub async fn close(&self) {
        self.cancel.cancel();
        let tasks: Vec<Registered> = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in tasks {
            if let Err(e) = task.handle.await {
                if !e.is_cancelled() {
                    warn!(task = %task.name, error = %e, "background task join failed");
                }
            }
        }
    }
}
