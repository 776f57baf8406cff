// node.rs — Calculation nodes and the reactive batch scheduler
//
// A `CalcNode` owns one compiled formula and publishes its state to
// subscribers. Nodes track the nodes they read while computing and are
// marked when one of them publishes; a batch refreshes the marked nodes that
// have subscribers after the outermost mutation returns, pulling their
// sources first, so every node recomputes at most once per batch.
//
// Preconditions: single-threaded use; nodes reference each other only through
//   `Weak` pointers and name lookups.
// Postconditions: subscribers observe every distinct published state once;
//   after the last unsubscribe a node holds no live source or flow
//   subscriptions.
// Failure modes: compile errors are returned from `new`/`update`; runtime
//   failures (cycles, evaluation and settlement errors) become the node's
//   error state.
// Side effects: subscriber callbacks run synchronously inside batches.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::fmt;
use std::rc::{Rc, Weak};

use tracing::{debug, trace, warn};

use crate::analyze::Compilation;
use crate::error::Result;
use crate::evaluator::Resolver;
use crate::flow::{self, Observer, Pending, Subscription};
use crate::value::{ErrorKind, Outcome, Throw, Value};

// ── Batches ──

#[derive(Default)]
struct Scheduler {
    depth: usize,
    queue: VecDeque<Weak<CalcNode>>,
}

type Frame = Vec<(Weak<CalcNode>, u64)>;

thread_local! {
    static SCHEDULER: RefCell<Scheduler> = RefCell::new(Scheduler::default());
    static FRAMES: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
    static TOKEN: Cell<u64> = const { Cell::new(0) };
}

/// Run `f` as one batch. Nodes marked during the batch are refreshed once
/// when the outermost batch ends.
pub fn batch<R>(f: impl FnOnce() -> R) -> R {
    SCHEDULER.with(|s| s.borrow_mut().depth += 1);
    let result = f();
    if SCHEDULER.with(|s| s.borrow().depth) == 1 {
        flush();
    }
    SCHEDULER.with(|s| s.borrow_mut().depth -= 1);
    result
}

fn flush() {
    while let Some(next) = SCHEDULER.with(|s| s.borrow_mut().queue.pop_front()) {
        if let Some(node) = next.upgrade() {
            if node.is_active() {
                node.refresh();
            }
        }
    }
}

fn schedule(node: &CalcNode) {
    SCHEDULER.with(|s| s.borrow_mut().queue.push_back(node.this.clone()));
}

pub(crate) fn next_token() -> u64 {
    TOKEN.with(|t| {
        let next = t.get() + 1;
        t.set(next);
        next
    })
}

fn computing() -> bool {
    FRAMES.with(|f| !f.borrow().is_empty())
}

/// Record `node` as a source of the computation in progress.
fn track(node: &Rc<CalcNode>) {
    FRAMES.with(|frames| {
        if let Some(top) = frames.borrow_mut().last_mut() {
            if !top.iter().any(|(w, _)| w.as_ptr() == Rc::as_ptr(node)) {
                top.push((Rc::downgrade(node), node.version.get()));
            }
        }
    });
}

// ── Node ──

/// What a name resolves to from a node's point of view.
pub enum ResolvedRef {
    Value(Value),
    Node(Rc<CalcNode>),
}

#[derive(Clone, Debug, Default)]
pub enum NodeState {
    /// Never computed.
    #[default]
    Unknown,
    /// Waiting on an asynchronous input. The pending value settles with the
    /// node's next value or error.
    Stale(Pending),
    Value(Value),
    Error(Value),
}

impl NodeState {
    fn repeats(&self, next: &NodeState) -> bool {
        match (self, next) {
            (NodeState::Value(a), NodeState::Value(b)) => a.same_value(b),
            (NodeState::Error(a), NodeState::Error(b)) => a == b,
            (NodeState::Stale(_), NodeState::Stale(_)) => true,
            _ => false,
        }
    }

    fn deliver(&self, observer: &Observer) {
        match self {
            NodeState::Unknown => {}
            NodeState::Stale(pending) => observer.stale(pending.clone()),
            NodeState::Value(value) => observer.value(value.clone()),
            NodeState::Error(error) => observer.error(error.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Freshness {
    Clean,
    /// A source published; recompute only if a source version moved.
    Check,
    Dirty,
}

type Resolve = Rc<dyn Fn(&str) -> Option<ResolvedRef>>;

/// State of one static cycle search.
struct Cycle {
    token: u64,
    path: Vec<String>,
    visited: Vec<Rc<CalcNode>>,
}

pub struct CalcNode {
    name: String,
    this: Weak<CalcNode>,
    formula: RefCell<String>,
    unit: RefCell<Rc<Compilation>>,
    resolve: Resolve,
    state: RefCell<NodeState>,
    version: Cell<u64>,
    freshness: Cell<Freshness>,
    sources: RefCell<Vec<(Weak<CalcNode>, u64)>>,
    observers: RefCell<Vec<Weak<CalcNode>>>,
    subscribers: RefCell<Vec<(u64, Observer)>>,
    /// Flattening of an asynchronous result, or a wait on a pending throw.
    outcome: RefCell<Option<Subscription>>,
    computing: Cell<bool>,
    /// Set while the node compares its sources' versions.
    checking: Cell<bool>,
    mark: Cell<u64>,
}

impl CalcNode {
    /// Compile `formula`. Nothing is evaluated until the node is subscribed.
    pub fn new(
        name: impl Into<String>,
        formula: &str,
        resolve: impl Fn(&str) -> Option<ResolvedRef> + 'static,
    ) -> Result<Rc<CalcNode>> {
        let unit = Compilation::new(formula)?;
        Ok(Rc::new_cyclic(|this| CalcNode {
            name: name.into(),
            this: this.clone(),
            formula: RefCell::new(formula.to_string()),
            unit: RefCell::new(unit),
            resolve: Rc::new(resolve),
            state: RefCell::new(NodeState::Unknown),
            version: Cell::new(0),
            freshness: Cell::new(Freshness::Dirty),
            sources: RefCell::new(Vec::new()),
            observers: RefCell::new(Vec::new()),
            subscribers: RefCell::new(Vec::new()),
            outcome: RefCell::new(None),
            computing: Cell::new(false),
            checking: Cell::new(false),
            mark: Cell::new(0),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn formula(&self) -> String {
        self.formula.borrow().clone()
    }

    pub fn compilation(&self) -> Rc<Compilation> {
        self.unit.borrow().clone()
    }

    pub fn state(&self) -> NodeState {
        self.state.borrow().clone()
    }

    pub fn deps(&self) -> BTreeSet<String> {
        self.unit.borrow().deps().clone()
    }

    /// Generated text of the current compilation.
    pub fn signature(&self) -> String {
        self.unit.borrow().generated()
    }

    /// Bumped on every published state.
    pub fn version(&self) -> u64 {
        self.version.get()
    }

    /// Replace the formula. Compile errors leave the node untouched.
    pub fn update(&self, formula: &str) -> Result<()> {
        let unit = Compilation::new(formula)?;
        *self.unit.borrow_mut() = unit;
        *self.formula.borrow_mut() = formula.to_string();
        debug!(node = %self.name, formula, "formula updated");
        batch(|| self.invalidate());
        Ok(())
    }

    /// Force a recomputation on the next refresh.
    pub fn invalidate(&self) {
        self.freshness.set(Freshness::Dirty);
        if !self.subscribers.borrow().is_empty() {
            schedule(self);
        }
        for observer in self.observer_nodes() {
            observer.mark_check();
        }
    }

    /// The last published value. Reading an unobserved node outside of a
    /// computation does not compute it.
    pub fn get(&self) -> Option<Value> {
        if self.is_active() {
            self.refresh();
        } else if !computing() {
            warn!(node = %self.name, "reading an unobserved node returns its last published value");
        }
        match &*self.state.borrow() {
            NodeState::Value(value) => Some(value.clone()),
            _ => None,
        }
    }

    pub fn subscribe(&self, observer: Observer) -> Subscription {
        let id = next_token();
        batch(|| {
            self.refresh();
            self.subscribers.borrow_mut().push((id, observer.clone()));
            let state = self.state.borrow().clone();
            state.deliver(&observer);
        });
        let node = self.this.clone();
        Subscription::new(move || {
            if let Some(node) = node.upgrade() {
                node.unsubscribe(id);
            }
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.borrow().len()
    }

    fn unsubscribe(&self, id: u64) {
        self.subscribers.borrow_mut().retain(|(sid, _)| *sid != id);
        if !self.is_active() {
            self.deactivate();
        }
    }

    // ── Activity ──

    /// Subscribed, or read by a node that is.
    pub fn is_active(&self) -> bool {
        self.reachable(&mut HashSet::new())
    }

    fn reachable(&self, visited: &mut HashSet<*const CalcNode>) -> bool {
        if !visited.insert(self as *const CalcNode) {
            return false;
        }
        if !self.subscribers.borrow().is_empty() {
            return true;
        }
        self.observer_nodes().iter().any(|o| o.reachable(visited))
    }

    fn deactivate(&self) {
        trace!(node = %self.name, "deactivated");
        let outcome = self.outcome.borrow_mut().take();
        drop(outcome);
        self.freshness.set(Freshness::Dirty);
        let sources = std::mem::take(&mut *self.sources.borrow_mut());
        for (source, _) in sources {
            if let Some(source) = source.upgrade() {
                source.remove_observer(&self.this);
                if !source.is_active() {
                    source.deactivate();
                }
            }
        }
    }

    fn observer_nodes(&self) -> Vec<Rc<CalcNode>> {
        self.observers.borrow().iter().filter_map(Weak::upgrade).collect()
    }

    fn add_observer(&self, observer: &Weak<CalcNode>) {
        let mut observers = self.observers.borrow_mut();
        if !observers.iter().any(|o| Weak::ptr_eq(o, observer)) {
            observers.push(observer.clone());
        }
    }

    fn remove_observer(&self, observer: &Weak<CalcNode>) {
        self.observers
            .borrow_mut()
            .retain(|o| !Weak::ptr_eq(o, observer) && o.strong_count() > 0);
    }

    /// Replace the recorded sources, unlinking and deactivating the ones no
    /// longer read.
    fn relink(&self, sources: Vec<(Weak<CalcNode>, u64)>) {
        let current: Vec<Rc<CalcNode>> = sources.iter().filter_map(|(s, _)| s.upgrade()).collect();
        for source in &current {
            source.add_observer(&self.this);
        }
        let previous = std::mem::replace(&mut *self.sources.borrow_mut(), sources);
        for (source, _) in previous {
            let Some(source) = source.upgrade() else {
                continue;
            };
            if current.iter().any(|c| Rc::ptr_eq(c, &source)) {
                continue;
            }
            source.remove_observer(&self.this);
            if !source.is_active() {
                source.deactivate();
            }
        }
    }

    // ── Refresh ──

    fn mark_check(&self) {
        if self.freshness.get() != Freshness::Clean || self.computing.get() {
            return;
        }
        self.freshness.set(Freshness::Check);
        if !self.subscribers.borrow().is_empty() {
            schedule(self);
        }
        for observer in self.observer_nodes() {
            observer.mark_check();
        }
    }

    /// Bring the node up to date, recomputing only if its formula changed or
    /// a source published since the last computation.
    pub(crate) fn refresh(&self) {
        if self.checking.get() {
            return;
        }
        match self.freshness.get() {
            Freshness::Clean => return,
            Freshness::Check => {
                self.checking.set(true);
                let changed = self.sources_changed();
                self.checking.set(false);
                if !changed {
                    self.freshness.set(Freshness::Clean);
                    return;
                }
            }
            Freshness::Dirty => {}
        }
        self.recompute();
    }

    fn sources_changed(&self) -> bool {
        let sources = self.sources.borrow().clone();
        sources.iter().any(|(source, seen)| match source.upgrade() {
            // Sources that lead back here (a cycle) count as changed.
            Some(source) if source.checking.get() => true,
            Some(source) => {
                source.refresh();
                source.version.get() != *seen
            }
            None => true,
        })
    }

    fn recompute(&self) {
        self.freshness.set(Freshness::Clean);
        let unit = self.compilation();
        debug!(node = %self.name, "recomputing");

        if let Err(cycle) = self.check_cycles(&unit) {
            // Watch every node on the static walk so that fixing any formula
            // along the cycle reaches this node.
            let links = cycle
                .visited
                .iter()
                .map(|node| (Rc::downgrade(node), node.version.get()))
                .collect();
            self.relink(links);
            let outcome = self.outcome.borrow_mut().take();
            drop(outcome);
            let message = format!("Circular dependency detected: {}", cycle.path.join(" -> "));
            self.publish(NodeState::Error(Value::error(ErrorKind::CircularDependency, message)));
            return;
        }

        FRAMES.with(|f| f.borrow_mut().push(Vec::new()));
        self.computing.set(true);
        let outcome = unit.evaluate(self.resolver());
        self.computing.set(false);
        let sources = FRAMES.with(|f| f.borrow_mut().pop()).unwrap_or_default();
        self.relink(sources);
        self.settle(outcome);
    }

    fn resolver(&self) -> Resolver {
        let node = self.this.clone();
        Rc::new(move |name: &str| match node.upgrade() {
            Some(node) => node.read(name),
            None => Ok(Value::Undefined),
        })
    }

    /// Dynamic resolution of `name` during a computation.
    fn read(&self, name: &str) -> Outcome {
        match (self.resolve)(name) {
            None => Ok(Value::Undefined),
            Some(ResolvedRef::Value(value)) => Ok(value),
            Some(ResolvedRef::Node(node)) => {
                if node.computing.get() {
                    return Err(Throw::error(
                        ErrorKind::CircularDependency,
                        format!("Circular dependency detected: {} -> {}", self.name, node.name),
                    ));
                }
                node.refresh();
                self.record_source(&node);
                let state = node.state.borrow().clone();
                match state {
                    NodeState::Unknown => Ok(Value::Undefined),
                    NodeState::Value(value) => Ok(value),
                    NodeState::Error(error) => Err(Throw::Error(error)),
                    NodeState::Stale(pending) => Err(Throw::Stale(pending)),
                }
            }
        }
    }

    /// Record `source` as read. Reads made by an asynchronous continuation
    /// after the computation returned link the source directly.
    fn record_source(&self, source: &Rc<CalcNode>) {
        if self.computing.get() {
            track(source);
            return;
        }
        let version = source.version.get();
        {
            let mut sources = self.sources.borrow_mut();
            match sources.iter_mut().find(|(s, _)| s.as_ptr() == Rc::as_ptr(source)) {
                Some(entry) => entry.1 = version,
                None => sources.push((Rc::downgrade(source), version)),
            }
        }
        source.add_observer(&self.this);
        trace!(node = %self.name, source = %source.name, "linked by a continuation");
    }

    /// Walk static dependencies looking for a path back to this node.
    fn check_cycles(&self, unit: &Compilation) -> std::result::Result<(), Cycle> {
        let mut walk = Cycle {
            token: next_token(),
            path: vec![self.name.clone()],
            visited: Vec::new(),
        };
        for dep in unit.deps() {
            if self.reaches(&self.resolve, dep, &mut walk) {
                return Err(walk);
            }
        }
        Ok(())
    }

    fn reaches(&self, resolve: &Resolve, name: &str, walk: &mut Cycle) -> bool {
        let Some(ResolvedRef::Node(node)) = resolve(name) else {
            return false;
        };
        walk.path.push(node.name.clone());
        if std::ptr::eq(Rc::as_ptr(&node), self) {
            return true;
        }
        if node.mark.get() != walk.token {
            node.mark.set(walk.token);
            walk.visited.push(node.clone());
            for dep in &node.deps() {
                if self.reaches(&node.resolve, dep, walk) {
                    return true;
                }
            }
        }
        walk.path.pop();
        false
    }

    // ── Publishing ──

    fn settle(&self, outcome: Outcome) {
        let previous = self.outcome.borrow_mut().take();
        drop(previous);
        match outcome {
            Ok(value) if value.is_async() => {
                let emitted = Rc::new(Cell::new(false));
                let subscription = flow::pull(value, self.flow_observer(&emitted));
                if !emitted.get() {
                    self.publish(NodeState::Stale(Pending::new()));
                }
                *self.outcome.borrow_mut() = Some(subscription);
            }
            Ok(value) => self.publish(NodeState::Value(value)),
            Err(Throw::Error(error)) => self.publish(NodeState::Error(error)),
            Err(Throw::Stale(pending)) => {
                self.publish(NodeState::Stale(pending.clone()));
                let node = self.this.clone();
                let wait = pending.on_settle(move |_| {
                    if let Some(node) = node.upgrade() {
                        node.invalidate();
                    }
                });
                *self.outcome.borrow_mut() = Some(wait);
            }
        }
    }

    fn flow_observer(&self, emitted: &Rc<Cell<bool>>) -> Observer {
        let (on_value, on_error, on_stale) = (self.this.clone(), self.this.clone(), self.this.clone());
        let (value_seen, error_seen, stale_seen) = (emitted.clone(), emitted.clone(), emitted.clone());
        Observer::new(move |value| {
            value_seen.set(true);
            if let Some(node) = on_value.upgrade() {
                node.publish(NodeState::Value(value));
            }
        })
        .on_error(move |error| {
            error_seen.set(true);
            if let Some(node) = on_error.upgrade() {
                node.publish(NodeState::Error(error));
            }
        })
        .on_stale(move |pending| {
            stale_seen.set(true);
            if let Some(node) = on_stale.upgrade() {
                node.publish(NodeState::Stale(pending));
            }
        })
    }

    fn publish(&self, next: NodeState) {
        if self.state.borrow().repeats(&next) {
            return;
        }
        // A stale node hands out its own pending value, settled by the next
        // value or error it publishes.
        let next = match next {
            NodeState::Stale(_) => NodeState::Stale(Pending::new()),
            other => other,
        };
        let previous = std::mem::replace(&mut *self.state.borrow_mut(), next.clone());
        self.version.set(self.version.get() + 1);
        debug!(node = %self.name, version = self.version.get(), state = ?next, "published");
        batch(|| {
            for observer in self.observer_nodes() {
                observer.mark_check();
            }
            let subscribers: Vec<Observer> =
                self.subscribers.borrow().iter().map(|(_, o)| o.clone()).collect();
            for subscriber in &subscribers {
                next.deliver(subscriber);
            }
            if let NodeState::Stale(waiting) = previous {
                match &next {
                    NodeState::Value(value) => waiting.resolve(value.clone()),
                    NodeState::Error(error) => waiting.reject(error.clone()),
                    _ => {}
                }
            }
        });
    }
}

impl fmt::Debug for CalcNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CalcNode")
            .field("name", &self.name)
            .field("formula", &*self.formula.borrow())
            .field("state", &*self.state.borrow())
            .finish()
    }
}
