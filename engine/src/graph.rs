// graph.rs — Named calculation nodes
//
// A `Graph` maps names to `CalcNode`s and resolves every identifier a formula
// reads: graph nodes first, then the host's external resolver, otherwise
// `undefined`.
//
// Preconditions: single-threaded use.
// Postconditions: node resolvers hold only a `Weak` reference to the graph,
//   so dropping the graph drops every node.
// Failure modes: compile errors from `new`/`update` are returned; nothing is
//   inserted or replaced on failure.
// Side effects: `update` and `remove` run a batch that refreshes observed
//   dependents.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;
use tracing::debug;

use crate::error::Result;
use crate::flow::{Observer, Subscription};
use crate::node::{self, CalcNode, NodeState, ResolvedRef};
use crate::value::Value;

type External = Rc<dyn Fn(&str) -> Option<Value>>;

struct GraphInner {
    nodes: RefCell<IndexMap<String, Rc<CalcNode>>>,
    external: External,
}

/// A set of named formulas that may refer to each other and to external
/// values.
#[derive(Clone)]
pub struct Graph {
    inner: Rc<GraphInner>,
}

impl Graph {
    /// Compile every formula. Fails on the first formula that does not
    /// compile.
    pub fn new<K, V>(
        formulas: impl IntoIterator<Item = (K, V)>,
        external: impl Fn(&str) -> Option<Value> + 'static,
    ) -> Result<Graph>
    where
        K: Into<String>,
        V: AsRef<str>,
    {
        let graph = Graph::with_external(external);
        for (name, formula) in formulas {
            let name = name.into();
            let node = graph.compile(&name, formula.as_ref())?;
            graph.inner.nodes.borrow_mut().insert(name, node);
        }
        debug!(nodes = graph.len(), "graph built");
        Ok(graph)
    }

    /// An empty graph resolving unknown names through `external`.
    pub fn with_external(external: impl Fn(&str) -> Option<Value> + 'static) -> Graph {
        Graph {
            inner: Rc::new(GraphInner {
                nodes: RefCell::new(IndexMap::new()),
                external: Rc::new(external),
            }),
        }
    }

    fn compile(&self, name: &str, formula: &str) -> Result<Rc<CalcNode>> {
        let graph: Weak<GraphInner> = Rc::downgrade(&self.inner);
        CalcNode::new(name, formula, move |name| {
            let graph = graph.upgrade()?;
            let node = graph.nodes.borrow().get(name).cloned();
            match node {
                Some(node) => Some(ResolvedRef::Node(node)),
                None => (graph.external)(name).map(ResolvedRef::Value),
            }
        })
    }

    pub fn node(&self, name: &str) -> Option<Rc<CalcNode>> {
        self.inner.nodes.borrow().get(name).cloned()
    }

    /// Last published value of `name`.
    pub fn get(&self, name: &str) -> Option<Value> {
        self.node(name)?.get()
    }

    pub fn state(&self, name: &str) -> Option<NodeState> {
        Some(self.node(name)?.state())
    }

    /// Replace the formula of `name`, or add a node under a new name.
    pub fn update(&self, name: &str, formula: &str) -> Result<()> {
        if let Some(node) = self.node(name) {
            return node.update(formula);
        }
        let node = self.compile(name, formula)?;
        self.inner.nodes.borrow_mut().insert(name.to_string(), node);
        debug!(node = name, "node added");
        self.invalidate_dependents(name);
        Ok(())
    }

    /// Remove `name`; formulas that read it see `undefined` from now on.
    pub fn remove(&self, name: &str) -> Option<Rc<CalcNode>> {
        let removed = self.inner.nodes.borrow_mut().shift_remove(name)?;
        debug!(node = name, "node removed");
        self.invalidate_dependents(name);
        Some(removed)
    }

    fn invalidate_dependents(&self, name: &str) {
        let dependents: Vec<Rc<CalcNode>> = self
            .inner
            .nodes
            .borrow()
            .values()
            .filter(|node| node.deps().contains(name))
            .cloned()
            .collect();
        node::batch(|| {
            for dependent in &dependents {
                dependent.invalidate();
            }
        });
    }

    /// `None` when `name` is not a node of this graph.
    pub fn subscribe(&self, name: &str, observer: Observer) -> Option<Subscription> {
        Some(self.node(name)?.subscribe(observer))
    }

    pub fn names(&self) -> Vec<String> {
        self.inner.nodes.borrow().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.nodes.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
