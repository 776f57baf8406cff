// id.rs — Stable identifiers for compiled nodes
//
// Generated code refers to compiled nodes as `nodes[id]`. Ids are interned
// lazily: a node receives the next id the first time generated text mentions
// it, so ids follow the order in which code generation reaches nodes.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;

/// Stable identifier of a compiled node within one compilation unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Interns arena indices into `NodeId`s in first-reference order.
#[derive(Debug, Default)]
pub struct IdTable {
    ids: RefCell<HashMap<usize, NodeId>>,
    order: RefCell<Vec<usize>>,
}

impl IdTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The id of arena node `index`, allocating one on first use.
    pub fn intern(&self, index: usize) -> NodeId {
        if let Some(id) = self.ids.borrow().get(&index) {
            return *id;
        }
        let mut order = self.order.borrow_mut();
        let id = NodeId(order.len() as u32);
        order.push(index);
        self.ids.borrow_mut().insert(index, id);
        id
    }

    /// Arena index behind an allocated id.
    pub fn resolve(&self, id: NodeId) -> Option<usize> {
        self.order.borrow().get(id.0 as usize).copied()
    }

    pub fn get(&self, index: usize) -> Option<NodeId> {
        self.ids.borrow().get(&index).copied()
    }

    pub fn len(&self) -> usize {
        self.order.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
