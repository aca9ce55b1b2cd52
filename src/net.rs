//! Task graph ("net").
//!
//! A net is a directed acyclic graph of named task nodes. Each node owns one
//! or more successor path lists indexed `0..k`; an outgoing edge weighted `i`
//! points at the head of path list `i`, and a path without an edge is empty
//! (traversal ends there). The tail of a path list continues through the
//! head node's own default path.
//!
//! Nets are only built through [`NetBuilder`], which rejects unknown node
//! references, edges on paths a node does not declare, duplicate edges and
//! cycles, so a cursor over a built net always terminates.

use crate::error::{EngineError, Result};
use crate::task::{Task, TaskId, TaskKind};
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

/// A task together with its identity and branching arity
pub struct NetNode {
    id: TaskId,
    task: Rc<dyn Task>,
    paths: usize,
}

impl NetNode {
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn task(&self) -> &Rc<dyn Task> {
        &self.task
    }

    pub fn kind(&self) -> TaskKind {
        self.task.kind()
    }

    /// Number of successor path lists, including empty ones
    pub fn path_count(&self) -> usize {
        self.paths
    }
}

impl fmt::Debug for NetNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetNode")
            .field("id", &self.id)
            .field("kind", &self.kind())
            .field("paths", &self.paths)
            .finish()
    }
}

pub struct Net {
    graph: DiGraph<NetNode, usize>,
    index: HashMap<TaskId, NodeIndex>,
    entry: Option<NodeIndex>,
}

impl Net {
    pub fn builder() -> NetBuilder {
        NetBuilder::default()
    }

    /// A net without tasks; a cursor over it is immediately exhausted
    pub fn empty() -> Self {
        Self {
            graph: DiGraph::new(),
            index: HashMap::new(),
            entry: None,
        }
    }

    /// Chain tasks in order, each on the previous task's default path
    pub fn linear<I, S>(tasks: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, Rc<dyn Task>)>,
        S: Into<TaskId>,
    {
        let mut builder = Net::builder();
        let mut previous: Option<TaskId> = None;
        for (id, task) in tasks {
            let id = id.into();
            builder = builder.task(id.clone(), task);
            if let Some(prev) = previous.take() {
                builder = builder.then(prev, id.clone());
            }
            previous = Some(id);
        }
        builder.build()
    }

    pub fn entry(&self) -> Option<NodeIndex> {
        self.entry
    }

    /// Node at `index`; indices come from this net's cursor or `find`
    pub fn node(&self, index: NodeIndex) -> &NetNode {
        &self.graph[index]
    }

    pub fn find(&self, id: &TaskId) -> Option<NodeIndex> {
        self.index.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Head of path list `path` of the node at `index`.
    ///
    /// `Ok(None)` means the path list is empty. A path the node does not
    /// declare is a configuration error.
    pub fn successor(&self, index: NodeIndex, path: usize) -> Result<Option<NodeIndex>> {
        let node = &self.graph[index];
        if path >= node.paths {
            return Err(EngineError::PathOutOfRange {
                task: node.id.clone(),
                index: path,
                available: node.paths,
            });
        }
        Ok(self
            .graph
            .edges(index)
            .find(|edge| *edge.weight() == path)
            .map(|edge| edge.target()))
    }
}

impl fmt::Debug for Net {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Net")
            .field("nodes", &self.graph.node_weights().collect::<Vec<_>>())
            .field("entry", &self.entry.map(|i| &self.graph[i].id))
            .finish()
    }
}

/// Incremental construction of a [`Net`], validated by [`NetBuilder::build`].
#[derive(Default)]
pub struct NetBuilder {
    nodes: Vec<(TaskId, Rc<dyn Task>)>,
    paths: HashMap<TaskId, usize>,
    edges: Vec<(TaskId, usize, TaskId)>,
    entry: Option<TaskId>,
}

impl NetBuilder {
    /// Add a node with a single path list
    pub fn task(mut self, id: impl Into<TaskId>, task: Rc<dyn Task>) -> Self {
        self.nodes.push((id.into(), task));
        self
    }

    /// Declare how many path lists a node has (at least one)
    pub fn branches(mut self, id: impl Into<TaskId>, count: usize) -> Self {
        self.paths.insert(id.into(), count);
        self
    }

    /// Point path list `path` of `from` at `to`
    pub fn edge(mut self, from: impl Into<TaskId>, path: usize, to: impl Into<TaskId>) -> Self {
        self.edges.push((from.into(), path, to.into()));
        self
    }

    /// Point the default path of `from` at `to`
    pub fn then(self, from: impl Into<TaskId>, to: impl Into<TaskId>) -> Self {
        self.edge(from, 0, to)
    }

    /// Start traversal at `id` instead of the first added node
    pub fn entry(mut self, id: impl Into<TaskId>) -> Self {
        self.entry = Some(id.into());
        self
    }

    pub fn build(self) -> Result<Net> {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();

        for (id, task) in self.nodes {
            if index.contains_key(&id) {
                return Err(EngineError::graph(format!("duplicate task '{}'", id)));
            }
            let paths = self.paths.get(&id).copied().unwrap_or(1);
            if paths == 0 {
                return Err(EngineError::graph(format!(
                    "task '{}' must have at least one path list",
                    id
                )));
            }
            let node = graph.add_node(NetNode {
                id: id.clone(),
                task,
                paths,
            });
            index.insert(id, node);
        }

        if let Some(unknown) = self.paths.keys().find(|id| !index.contains_key(*id)) {
            return Err(EngineError::graph(format!(
                "branches declared for unknown task '{}'",
                unknown
            )));
        }

        for (from, path, to) in self.edges {
            let from_index = *index
                .get(&from)
                .ok_or_else(|| EngineError::graph(format!("unknown task '{}'", from)))?;
            let to_index = *index
                .get(&to)
                .ok_or_else(|| EngineError::graph(format!("unknown task '{}'", to)))?;

            let available = graph[from_index].paths;
            if path >= available {
                return Err(EngineError::PathOutOfRange {
                    task: from,
                    index: path,
                    available,
                });
            }
            if graph.edges(from_index).any(|edge| *edge.weight() == path) {
                return Err(EngineError::graph(format!(
                    "path {} of task '{}' already has a successor",
                    path, from
                )));
            }
            graph.add_edge(from_index, to_index, path);
        }

        if is_cyclic_directed(&graph) {
            return Err(EngineError::graph("task graph contains a cycle"));
        }

        let entry = match self.entry {
            Some(id) => Some(
                *index
                    .get(&id)
                    .ok_or_else(|| EngineError::graph(format!("unknown entry task '{}'", id)))?,
            ),
            None => graph.node_indices().next(),
        };

        Ok(Net {
            graph,
            index,
            entry,
        })
    }
}
