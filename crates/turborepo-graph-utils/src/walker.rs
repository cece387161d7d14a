//! Dependency-ordered DAG walk.
//!
//! The walker emits a node only after every node it points at has been
//! marked complete, so for an edge X -> Y ("X depends on Y"), Y is always
//! emitted, processed, and completed before X is emitted. The caller
//! receives `(node, done)` pairs on a channel and signals completion
//! through the `done` oneshot; dropping `done` counts as completion so a
//! panicking consumer cannot wedge the walk.

use std::{
    collections::{HashMap, VecDeque},
    hash::Hash,
    marker::PhantomData,
};

use futures::{stream::FuturesUnordered, StreamExt};
use petgraph::{
    visit::{IntoNeighborsDirected, IntoNodeIdentifiers},
    Direction,
};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::trace;

pub type WalkMessage<N> = (N, oneshot::Sender<()>);

pub struct Start;
pub struct Walking;

pub struct Walker<N, S> {
    cancel: watch::Sender<bool>,
    node_events: Option<mpsc::Receiver<WalkMessage<N>>>,
    coordinator: Option<JoinHandle<()>>,
    marker: PhantomData<S>,
}

// All petgraph node id types are Copy + Eq, so these bounds cost nothing.
impl<N: Eq + Hash + Copy + Send + 'static> Walker<N, Start> {
    /// Builds a walker for the given DAG. The graph must not change
    /// afterwards; the walker snapshots its topology here.
    pub fn new<G: IntoNodeIdentifiers<NodeId = N> + IntoNeighborsDirected>(graph: G) -> Self {
        let mut remaining_deps: HashMap<N, usize> = HashMap::new();
        let mut dependents: HashMap<N, Vec<N>> = HashMap::new();
        let mut ready = VecDeque::new();

        for node in graph.node_identifiers() {
            let dep_count = graph.neighbors_directed(node, Direction::Outgoing).count();
            remaining_deps.insert(node, dep_count);
            if dep_count == 0 {
                ready.push_back(node);
            }
            for dep in graph.neighbors_directed(node, Direction::Outgoing) {
                dependents.entry(dep).or_default().push(node);
            }
        }

        let (cancel, cancel_rx) = watch::channel(false);
        // Every node is emitted at most once, so a buffer the size of the
        // graph means emission never blocks. The channel requires a nonzero
        // capacity even for an empty graph.
        let (node_tx, node_rx) = mpsc::channel(remaining_deps.len().max(1));

        let coordinator = tokio::spawn(coordinate(
            remaining_deps,
            dependents,
            ready,
            node_tx,
            cancel_rx,
        ));

        Self {
            cancel,
            node_events: Some(node_rx),
            coordinator: Some(coordinator),
            marker: PhantomData,
        }
    }

    /// Starts the walk, returning the handle used for cancellation and the
    /// channel of ready nodes.
    pub fn walk(mut self) -> (Walker<N, Walking>, mpsc::Receiver<WalkMessage<N>>) {
        let node_events = self
            .node_events
            .take()
            .expect("walker can only be started once");
        (
            Walker {
                cancel: self.cancel,
                node_events: None,
                coordinator: self.coordinator.take(),
                marker: PhantomData,
            },
            node_events,
        )
    }
}

impl<N> Walker<N, Walking> {
    /// Stops emitting new nodes. Nodes already handed to the consumer are
    /// unaffected; the walk drains once their callbacks resolve.
    pub fn cancel(&mut self) -> Result<(), watch::error::SendError<bool>> {
        self.cancel.send(true)
    }

    /// Waits for the coordinator to drain. Used after cancellation or
    /// channel closure to ensure nothing is left running.
    pub async fn wait(mut self) -> Result<(), tokio::task::JoinError> {
        if let Some(coordinator) = self.coordinator.take() {
            coordinator.await?;
        }
        Ok(())
    }
}

async fn coordinate<N: Eq + Hash + Copy + Send + 'static>(
    mut remaining_deps: HashMap<N, usize>,
    dependents: HashMap<N, Vec<N>>,
    mut ready: VecDeque<N>,
    node_tx: mpsc::Sender<WalkMessage<N>>,
    mut cancel_rx: watch::Receiver<bool>,
) {
    let mut in_flight = FuturesUnordered::new();
    let mut cancelled = false;

    loop {
        while !cancelled {
            let Some(node) = ready.pop_front() else {
                break;
            };
            let (done_tx, done_rx) = oneshot::channel();
            if node_tx.send((node, done_tx)).await.is_err() {
                // The consumer hung up without cancelling; treat it the
                // same way.
                trace!("walk receiver dropped before the walk finished");
                cancelled = true;
                break;
            }
            in_flight.push(async move {
                // Dropping the callback without sending counts as done.
                done_rx.await.ok();
                node
            });
        }

        if in_flight.is_empty() {
            break;
        }

        let finished = if cancelled {
            in_flight.next().await
        } else {
            tokio::select! {
                // When cancellation and a completion race, take the
                // cancellation so no extra node gets emitted.
                biased;
                _ = cancel_rx.changed() => {
                    cancelled = true;
                    continue;
                }
                finished = in_flight.next() => finished,
            }
        };

        if let Some(node) = finished {
            for &dependent in dependents.get(&node).map(Vec::as_slice).unwrap_or_default() {
                let count = remaining_deps
                    .get_mut(&dependent)
                    .expect("all nodes have a dependency count");
                *count -= 1;
                if *count == 0 {
                    ready.push_back(dependent);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use petgraph::Graph;

    use super::*;

    #[tokio::test]
    async fn test_linear_ordering() {
        // a -> b -> c: c must be emitted first, a last.
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        g.add_edge(a, b, ());
        g.add_edge(b, c, ());

        let (walker, mut nodes) = Walker::new(&g).walk();
        let mut visited = Vec::new();
        while let Some((index, done)) = nodes.recv().await {
            visited.push(index);
            done.send(()).unwrap();
        }
        walker.wait().await.unwrap();
        assert_eq!(visited, vec![c, b, a]);
    }

    #[tokio::test]
    async fn test_cancel_stops_new_emissions() {
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        g.add_edge(a, b, ());
        g.add_edge(b, c, ());

        let (mut walker, mut nodes) = Walker::new(&g).walk();
        let mut visited = Vec::new();
        while let Some((index, done)) = nodes.recv().await {
            walker.cancel().unwrap();
            visited.push(index);
            done.send(()).unwrap();
        }
        walker.wait().await.unwrap();
        assert_eq!(visited, vec![c]);
    }

    #[tokio::test]
    async fn test_independent_branches_proceed() {
        // a depends on b and d; b -> c, d -> e. Holding e's callback must
        // not stop the b branch.
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        let d = g.add_node("d");
        let e = g.add_node("e");
        g.add_edge(a, b, ());
        g.add_edge(a, d, ());
        g.add_edge(b, c, ());
        g.add_edge(d, e, ());

        let (walker, mut nodes) = Walker::new(&g).walk();
        let visited = Arc::new(Mutex::new(Vec::new()));
        let (b_done_tx, b_done_rx) = oneshot::channel::<()>();
        let mut b_done_tx = Some(b_done_tx);
        let mut b_done_rx = Some(b_done_rx);

        while let Some((index, done)) = nodes.recv().await {
            if index == e {
                // Hold e until b completes.
                let wait_for_b = b_done_rx.take().unwrap();
                let visited = visited.clone();
                tokio::spawn(async move {
                    wait_for_b.await.unwrap();
                    visited.lock().unwrap().push(index);
                    done.send(()).unwrap();
                });
            } else {
                visited.lock().unwrap().push(index);
                done.send(()).unwrap();
                if index == b {
                    b_done_tx.take().unwrap().send(()).unwrap();
                }
            }
        }
        walker.wait().await.unwrap();
        assert_eq!(visited.lock().unwrap().as_slice(), &[c, b, e, d, a]);
    }

    #[tokio::test]
    async fn test_dropped_callback_counts_as_done() {
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        g.add_edge(a, b, ());

        let (walker, mut nodes) = Walker::new(&g).walk();
        let mut visited = Vec::new();
        while let Some((index, done)) = nodes.recv().await {
            visited.push(index);
            drop(done);
        }
        walker.wait().await.unwrap();
        assert_eq!(visited, vec![b, a]);
    }
}
