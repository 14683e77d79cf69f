//! Minimal DAG executor for ordered, cancellable task pipelines.
//!
//! A [`Graph`] collects tasks whose dependencies may only reference
//! previously added tasks, which makes cycles impossible by construction.
//! [`Graph::compile`] produces a [`Flow`] that runs tasks in dependency
//! order: a task starts strictly after all of its dependencies have
//! returned, tasks whose dependencies are satisfied run concurrently, and
//! a failed task does not stop its dependents. The flow's result is an
//! aggregate of all task failures.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Result, WatchdogError};

/// Identifier of a task within its graph.
pub type TaskId = usize;

/// A task function. The token passed at run time must reach every await
/// point inside the task.
pub type TaskFn = Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// A named unit of work with dependencies on earlier tasks.
pub struct Task {
    /// Human-readable name used in error aggregation and logs
    pub name: String,
    /// The work itself
    pub f: TaskFn,
    /// Tasks that must have returned before this one starts
    pub dependencies: Vec<TaskId>,
}

/// Append-only collection of tasks.
pub struct Graph {
    name: String,
    tasks: Vec<Task>,
}

impl Graph {
    /// Create an empty graph with a name used for logging.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tasks: Vec::new(),
        }
    }

    /// Add a task and return its id. Dependencies referencing ids not yet
    /// added are rejected, which rules out cycles.
    pub fn add(&mut self, task: Task) -> TaskId {
        let id = self.tasks.len();
        debug_assert!(
            task.dependencies.iter().all(|dep| *dep < id),
            "task dependencies must reference earlier tasks"
        );
        self.tasks.push(task);
        id
    }

    /// Produce a runnable flow.
    pub fn compile(self) -> Flow {
        Flow {
            name: self.name,
            tasks: self.tasks,
        }
    }
}

/// A compiled, runnable task graph.
pub struct Flow {
    name: String,
    tasks: Vec<Task>,
}

impl Flow {
    /// Name given to the graph at construction.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of tasks in the flow.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the flow holds no tasks.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Run all tasks under `token`.
    ///
    /// Once the token is cancelled no further tasks start; tasks already
    /// running observe cancellation through their own token handling.
    /// Failures are collected and returned as one aggregate
    /// [`WatchdogError::Flow`] after every runnable task has returned.
    pub async fn run(&self, token: &CancellationToken) -> Result<()> {
        let total = self.tasks.len();
        let mut done: Vec<bool> = vec![false; total];
        let mut started: Vec<bool> = vec![false; total];
        let mut failures: Vec<String> = Vec::new();
        let mut in_flight = FuturesUnordered::new();

        debug!(flow = %self.name, tasks = total, "running flow");

        loop {
            if !token.is_cancelled() {
                for (id, task) in self.tasks.iter().enumerate() {
                    if started[id] || !task.dependencies.iter().all(|dep| done[*dep]) {
                        continue;
                    }
                    started[id] = true;
                    let fut = (task.f)(token.clone());
                    in_flight.push(async move { (id, fut.await) });
                }
            }
            match in_flight.next().await {
                Some((id, result)) => {
                    done[id] = true;
                    if let Err(err) = result {
                        failures.push(format!("task \"{}\" failed: {}", self.tasks[id].name, err));
                    }
                }
                None => break,
            }
        }

        let unstarted: Vec<&str> = self
            .tasks
            .iter()
            .enumerate()
            .filter(|(id, _)| !started[*id])
            .map(|(_, task)| task.name.as_str())
            .collect();
        if !unstarted.is_empty() {
            failures.push(format!(
                "flow cancelled before tasks [{}] could start",
                unstarted.join(", ")
            ));
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(WatchdogError::Flow(format!(
                "flow \"{}\": {}",
                self.name,
                failures.join("; ")
            )))
        }
    }
}

/// Combine task functions into one that starts them all and waits for all,
/// aggregating their errors.
pub fn parallel(fns: Vec<TaskFn>) -> TaskFn {
    Arc::new(move |token: CancellationToken| {
        let fns = fns.clone();
        Box::pin(async move {
            let results =
                futures::future::join_all(fns.iter().map(|f| f(token.clone()))).await;
            let errors: Vec<String> = results
                .into_iter()
                .filter_map(|r| r.err().map(|e| e.to_string()))
                .collect();
            if errors.is_empty() {
                Ok(())
            } else {
                Err(WatchdogError::Flow(errors.join("; ")))
            }
        })
    })
}

/// Convenience for building dependency lists from optional predecessors.
pub fn task_ids(ids: impl IntoIterator<Item = Option<TaskId>>) -> Vec<TaskId> {
    let unique: HashSet<TaskId> = ids.into_iter().flatten().collect();
    let mut out: Vec<TaskId> = unique.into_iter().collect();
    out.sort_unstable();
    out
}
