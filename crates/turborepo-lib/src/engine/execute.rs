use std::sync::{Arc, Mutex};

use futures::{stream::FuturesUnordered, StreamExt};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, trace};
use turborepo_graph_utils::Walker;

use super::{Engine, TaskNode};
use crate::run::task_id::TaskId;

pub struct Message<T, U> {
    pub info: T,
    pub callback: oneshot::Sender<U>,
}

impl<T, U> Message<T, U> {
    pub fn new(info: T) -> (Self, oneshot::Receiver<U>) {
        let (callback, receiver) = oneshot::channel();
        (Self { info, callback }, receiver)
    }
}

type VisitorData = TaskId<'static>;
type VisitorResult = Result<(), StopExecution>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionOptions {
    parallel: bool,
    concurrency: usize,
}

impl ExecutionOptions {
    pub fn new(parallel: bool, concurrency: usize) -> Self {
        Self {
            parallel,
            concurrency,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("semaphore closed before all tasks finished")]
    Semaphore(#[from] tokio::sync::AcquireError),
    #[error("engine visitor closed its channel before the walk finished")]
    Visitor,
}

impl From<mpsc::error::SendError<Message<VisitorData, VisitorResult>>> for ExecuteError {
    fn from(_: mpsc::error::SendError<Message<VisitorData, VisitorResult>>) -> Self {
        ExecuteError::Visitor
    }
}

/// Sentinel a visitor returns to stop scheduling new tasks. Tasks that are
/// already running are unaffected; they drain normally.
#[derive(Debug, Clone, Copy)]
pub struct StopExecution;

impl Engine {
    /// Walks the task graph leaves-first, sending each ready task id to the
    /// visitor. At most `concurrency` tasks are in flight at once unless
    /// `parallel` erases the limit along with the edges.
    ///
    /// Error handling belongs to the visitor; the only control it has over
    /// the walk is the `StopExecution` sentinel, which cancels scheduling
    /// of anything not yet started.
    pub async fn execute(
        self: Arc<Self>,
        options: ExecutionOptions,
        visitor: mpsc::Sender<Message<VisitorData, VisitorResult>>,
    ) -> Result<(), ExecuteError> {
        let ExecutionOptions {
            parallel,
            concurrency,
        } = options;
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut in_flight: FuturesUnordered<tokio::task::JoinHandle<Result<(), ExecuteError>>> =
            FuturesUnordered::new();

        let (walker, mut nodes) = Walker::new(&self.task_graph).walk();
        let walker = Arc::new(Mutex::new(walker));

        while let Some((node_id, done)) = nodes.recv().await {
            let visitor = visitor.clone();
            let semaphore = semaphore.clone();
            let walker = walker.clone();
            let engine = self.clone();

            in_flight.push(tokio::spawn(async move {
                let TaskNode::Task(task_id) = engine
                    .task_graph
                    .node_weight(node_id)
                    .expect("walker yields nodes from the graph")
                else {
                    // The virtual root has no work attached.
                    done.send(()).ok();
                    return Ok(());
                };

                let _permit = if parallel {
                    None
                } else {
                    Some(semaphore.acquire().await?)
                };

                let (message, result) = Message::new(task_id.clone());
                visitor.send(message).await?;

                let response = result.await.unwrap_or_else(|_| {
                    // A dropped callback means the visitor considers the
                    // task finished.
                    trace!("visitor dropped callback sender without a result");
                    Ok(())
                });
                if let Err(StopExecution) = response {
                    if walker
                        .lock()
                        .expect("walker mutex poisoned")
                        .cancel()
                        .is_err()
                    {
                        debug!("unable to cancel graph walk");
                    }
                }
                done.send(()).ok();
                Ok(())
            }));
        }

        while let Some(joined) = in_flight.next().await {
            joined.expect("task graph worker panicked")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Arc};

    use super::*;
    use crate::{engine::Building, turbo_json::TaskDefinition};

    fn two_task_engine() -> Engine {
        // web#build depends on util#build
        let mut engine: Engine<Building> = Engine::new();
        let web = TaskId::new("web", "build").into_owned();
        let util = TaskId::new("util", "build").into_owned();
        for task in [&web, &util] {
            engine.get_index(task);
            engine.add_definition(task.clone(), Arc::new(TaskDefinition::default()));
        }
        engine.connect(&web, &util);
        engine.connect_to_root(&util);
        engine.seal()
    }

    #[tokio::test]
    async fn test_tasks_observe_dependency_completion() {
        let engine = Arc::new(two_task_engine());
        let (tx, mut rx) = mpsc::channel(1);
        let execution =
            tokio::spawn(engine.clone().execute(ExecutionOptions::new(false, 2), tx));

        let mut order = Vec::new();
        while let Some(message) = rx.recv().await {
            order.push(message.info.clone());
            message.callback.send(Ok(())).unwrap();
        }
        execution.await.unwrap().unwrap();

        assert_eq!(
            order,
            vec![
                TaskId::new("util", "build").into_owned(),
                TaskId::new("web", "build").into_owned(),
            ]
        );
    }

    #[tokio::test]
    async fn test_stop_execution_prevents_dependents() {
        let engine = Arc::new(two_task_engine());
        let (tx, mut rx) = mpsc::channel(1);
        let execution =
            tokio::spawn(engine.clone().execute(ExecutionOptions::new(false, 2), tx));

        let mut seen = HashSet::new();
        while let Some(message) = rx.recv().await {
            seen.insert(message.info.clone());
            message.callback.send(Err(StopExecution)).unwrap();
        }
        execution.await.unwrap().unwrap();

        assert!(seen.contains(&TaskId::new("util", "build").into_owned()));
        assert!(!seen.contains(&TaskId::new("web", "build").into_owned()));
    }
}
