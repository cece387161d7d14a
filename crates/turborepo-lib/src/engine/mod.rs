//! The task graph engine: expansion of the pipeline into a concrete task
//! DAG, validation, and bounded-concurrency execution.

mod builder;
mod execute;

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
};

pub use builder::{EngineBuilder, Error as BuilderError};
pub use execute::{ExecuteError, ExecutionOptions, Message, StopExecution};
use itertools::Itertools;
use petgraph::Graph;

use crate::{run::task_id::TaskId, turbo_json::TaskDefinition};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskNode {
    Root,
    Task(TaskId<'static>),
}

impl From<TaskId<'static>> for TaskNode {
    fn from(value: TaskId<'static>) -> Self {
        Self::Task(value)
    }
}

impl fmt::Display for TaskNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskNode::Root => f.write_str("___ROOT___"),
            TaskNode::Task(task_id) => task_id.fmt(f),
        }
    }
}

#[derive(Debug, Default)]
pub struct Building;
#[derive(Debug, Default)]
pub struct Built;

/// The sealed task graph. `Building` permits mutation; execution only
/// exists on `Built`.
#[derive(Debug)]
pub struct Engine<S = Built> {
    marker: std::marker::PhantomData<S>,
    task_graph: Graph<TaskNode, ()>,
    root_index: petgraph::graph::NodeIndex,
    task_lookup: HashMap<TaskId<'static>, petgraph::graph::NodeIndex>,
    task_definitions: HashMap<TaskId<'static>, Arc<TaskDefinition>>,
}

impl Engine<Building> {
    pub fn new() -> Self {
        let mut task_graph = Graph::default();
        let root_index = task_graph.add_node(TaskNode::Root);
        Self {
            marker: std::marker::PhantomData,
            task_graph,
            root_index,
            task_lookup: HashMap::default(),
            task_definitions: HashMap::default(),
        }
    }

    pub fn get_index(&mut self, task_id: &TaskId<'static>) -> petgraph::graph::NodeIndex {
        self.task_lookup.get(task_id).copied().unwrap_or_else(|| {
            let index = self.task_graph.add_node(TaskNode::Task(task_id.clone()));
            self.task_lookup.insert(task_id.clone(), index);
            index
        })
    }

    pub fn connect(&mut self, from: &TaskId<'static>, to: &TaskId<'static>) {
        let source = self.get_index(from);
        let target = self.get_index(to);
        self.task_graph.update_edge(source, target, ());
    }

    pub fn connect_to_root(&mut self, task_id: &TaskId<'static>) {
        let source = self.get_index(task_id);
        self.task_graph.update_edge(source, self.root_index, ());
    }

    pub fn add_definition(&mut self, task_id: TaskId<'static>, definition: Arc<TaskDefinition>) {
        self.task_definitions.insert(task_id, definition);
    }

    pub fn has_task(&self, task_id: &TaskId) -> bool {
        self.task_lookup.contains_key(task_id)
    }

    // Seals the graph; no mutation after this point.
    pub fn seal(self) -> Engine<Built> {
        let Engine {
            task_graph,
            root_index,
            task_lookup,
            task_definitions,
            ..
        } = self;
        Engine {
            marker: std::marker::PhantomData,
            task_graph,
            root_index,
            task_lookup,
            task_definitions,
        }
    }
}

impl Default for Engine<Building> {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine<Built> {
    pub fn tasks(&self) -> impl Iterator<Item = &TaskNode> {
        self.task_graph.node_weights()
    }

    pub fn task_ids(&self) -> impl Iterator<Item = &TaskId<'static>> {
        self.task_lookup.keys()
    }

    pub fn task_definition<'a>(&'a self, task_id: &TaskId<'a>) -> Option<&'a Arc<TaskDefinition>> {
        self.task_definitions.get(task_id)
    }

    pub fn task_definitions(&self) -> &HashMap<TaskId<'static>, Arc<TaskDefinition>> {
        &self.task_definitions
    }

    pub fn len(&self) -> usize {
        self.task_lookup.len()
    }

    pub fn is_empty(&self) -> bool {
        self.task_lookup.is_empty()
    }

    /// The tasks that must finish before `task_id` starts.
    pub fn dependencies(&self, task_id: &TaskId) -> Option<HashSet<&TaskNode>> {
        self.neighbors(task_id, petgraph::Direction::Outgoing)
    }

    /// The tasks that wait on `task_id`.
    pub fn dependents(&self, task_id: &TaskId) -> Option<HashSet<&TaskNode>> {
        self.neighbors(task_id, petgraph::Direction::Incoming)
    }

    fn neighbors(
        &self,
        task_id: &TaskId,
        direction: petgraph::Direction,
    ) -> Option<HashSet<&TaskNode>> {
        let index = self.task_lookup.get(task_id)?;
        Some(
            self.task_graph
                .neighbors_directed(*index, direction)
                .map(|index| {
                    self.task_graph
                        .node_weight(index)
                        .expect("index from iterating the graph")
                })
                .collect(),
        )
    }

    /// Every task that is transitively upstream of a failing task; used to
    /// mark skips in short-circuit mode.
    pub fn transitive_dependents(&self, task_id: &TaskId<'static>) -> HashSet<&TaskNode> {
        let Some(index) = self.task_lookup.get(task_id) else {
            return HashSet::new();
        };
        turborepo_graph_utils::transitive_closure(
            &self.task_graph,
            Some(*index),
            petgraph::Direction::Incoming,
        )
        .into_iter()
        .filter(|node| !matches!(node, TaskNode::Task(id) if id == task_id))
        .collect()
    }

    /// Graph invariants beyond shape: a persistent task can never be
    /// depended on, and the pool must keep at least one slot for
    /// non-persistent work.
    pub fn validate(&self, concurrency: u32) -> Result<(), Vec<ValidateError>> {
        let mut errors = Vec::new();
        let mut persistent_count: u32 = 0;

        for (task_id, index) in &self.task_lookup {
            let is_persistent = self
                .task_definitions
                .get(task_id)
                .map_or(false, |definition| definition.persistent);
            if is_persistent {
                persistent_count += 1;
            }

            for dep_index in self
                .task_graph
                .neighbors_directed(*index, petgraph::Direction::Outgoing)
            {
                let TaskNode::Task(dep_id) = self
                    .task_graph
                    .node_weight(dep_index)
                    .expect("index from iterating the graph")
                else {
                    continue;
                };
                let Some(dep_definition) = self.task_definitions.get(dep_id) else {
                    errors.push(ValidateError::MissingTask {
                        task_id: dep_id.to_string(),
                    });
                    continue;
                };
                if dep_definition.persistent {
                    errors.push(ValidateError::DependencyOnPersistentTask {
                        persistent_task: dep_id.to_string(),
                        dependant: task_id.to_string(),
                    });
                }
            }
        }

        if persistent_count >= concurrency {
            errors.push(ValidateError::PersistentTasksExceedConcurrency {
                persistent_count,
                concurrency,
            });
        }

        if let Err(cycle) = turborepo_graph_utils::validate_graph(&self.task_graph) {
            errors.push(ValidateError::InvalidTaskGraph(cycle));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            errors.sort_by_key(|e| e.to_string());
            Err(errors)
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ValidateError {
    #[error("cannot find task definition for {task_id}")]
    MissingTask { task_id: String },
    #[error("\"{persistent_task}\" is a persistent task, \"{dependant}\" cannot depend on it")]
    DependencyOnPersistentTask {
        persistent_task: String,
        dependant: String,
    },
    #[error(
        "you have {persistent_count} persistent tasks but `turbo` is configured for concurrency \
         of {concurrency}. Set --concurrency to at least {}",
        persistent_count + 1
    )]
    PersistentTasksExceedConcurrency {
        persistent_count: u32,
        concurrency: u32,
    },
    #[error(transparent)]
    InvalidTaskGraph(turborepo_graph_utils::Error),
}

pub fn format_validation_errors(errors: &[ValidateError]) -> String {
    errors.iter().map(|e| e.to_string()).sorted().join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_with(
        definitions: Vec<(TaskId<'static>, TaskDefinition)>,
        edges: Vec<(TaskId<'static>, TaskId<'static>)>,
    ) -> Engine {
        let mut engine = Engine::new();
        for (task_id, definition) in definitions {
            engine.get_index(&task_id);
            engine.add_definition(task_id, Arc::new(definition));
        }
        for (from, to) in edges {
            engine.connect(&from, &to);
        }
        engine.seal()
    }

    fn persistent() -> TaskDefinition {
        TaskDefinition {
            persistent: true,
            cache: false,
            ..TaskDefinition::default()
        }
    }

    #[test]
    fn test_dependency_on_persistent_task_is_rejected() {
        let dev = TaskId::new("web", "dev").into_owned();
        let build = TaskId::new("web", "build").into_owned();
        let engine = engine_with(
            vec![
                (dev.clone(), persistent()),
                (build.clone(), TaskDefinition::default()),
            ],
            vec![(build, dev)],
        );

        let errors = engine.validate(10).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidateError::DependencyOnPersistentTask { .. })));
    }

    #[test]
    fn test_persistent_tasks_must_fit_in_the_pool() {
        let engine = engine_with(
            vec![
                (TaskId::new("web", "dev").into_owned(), persistent()),
                (TaskId::new("docs", "dev").into_owned(), persistent()),
            ],
            vec![],
        );

        assert!(engine.validate(2).is_err());
        assert!(engine.validate(3).is_ok());
    }

    #[test]
    fn test_cycles_are_reported() {
        let a = TaskId::new("web", "build").into_owned();
        let b = TaskId::new("docs", "build").into_owned();
        let engine = engine_with(
            vec![
                (a.clone(), TaskDefinition::default()),
                (b.clone(), TaskDefinition::default()),
            ],
            vec![(a.clone(), b.clone()), (b, a)],
        );

        let errors = engine.validate(10).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidateError::InvalidTaskGraph(_))));
    }

    #[test]
    fn test_transitive_dependents() {
        let a = TaskId::new("a", "build").into_owned();
        let b = TaskId::new("b", "build").into_owned();
        let c = TaskId::new("c", "build").into_owned();
        // a depends on b, b depends on c
        let engine = engine_with(
            vec![
                (a.clone(), TaskDefinition::default()),
                (b.clone(), TaskDefinition::default()),
                (c.clone(), TaskDefinition::default()),
            ],
            vec![(a.clone(), b.clone()), (b.clone(), c.clone())],
        );

        let dependents = engine.transitive_dependents(&c);
        assert_eq!(dependents.len(), 2);
        assert!(dependents.contains(&TaskNode::Task(a)));
        assert!(dependents.contains(&TaskNode::Task(b)));
    }
}
