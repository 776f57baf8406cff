// Graph-level behavior: dependency tracking, glitch-free batches, cycle
// detection, error propagation and subscription teardown.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use calcgraph::value::arg;
use calcgraph::{Graph, NodeState, Observer, Pending, Subscription, Value, Writable};

// ── Test helpers ────────────────────────────────────────────────────────────

#[derive(Default)]
struct Log {
    events: RefCell<Vec<String>>,
}

impl Log {
    fn observer(self: &Rc<Self>) -> Observer {
        let (values, errors, stale) = (self.clone(), self.clone(), self.clone());
        Observer::new(move |v| values.push(v.to_display()))
            .on_error(move |e| errors.push(format!("error {}", e)))
            .on_stale(move |_| stale.push("stale".to_string()))
    }

    fn push(&self, event: String) {
        self.events.borrow_mut().push(event);
    }

    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.events.borrow_mut())
    }
}

fn watch(graph: &Graph, name: &str) -> (Rc<Log>, Subscription) {
    let log = Rc::new(Log::default());
    let sub = graph.subscribe(name, log.observer()).unwrap();
    (log, sub)
}

fn graph(formulas: &[(&str, &str)]) -> Graph {
    Graph::new(formulas.iter().copied(), |_| None).unwrap()
}

fn graph_with(formulas: &[(&str, &str)], externals: Vec<(&'static str, Value)>) -> Graph {
    Graph::new(formulas.iter().copied(), move |name| {
        externals.iter().find(|(n, _)| *n == name).map(|(_, v)| v.clone())
    })
    .unwrap()
}

// ── Propagation ─────────────────────────────────────────────────────────────

#[test]
fn updates_propagate_to_subscribers() {
    let g = graph(&[("a", "1"), ("b", "a + 1"), ("c", "b * 10")]);
    let (log, _sub) = watch(&g, "c");
    assert_eq!(log.take(), ["20"]);

    g.update("a", "4").unwrap();
    assert_eq!(log.take(), ["50"]);
    assert_eq!(g.get("b"), Some(Value::from(5)));
}

#[test]
fn diamond_recomputes_once_per_update() {
    let runs = Rc::new(Cell::new(0));
    let counter = runs.clone();
    let tick = Value::native("tick", move |args| {
        counter.set(counter.get() + 1);
        Ok(arg(args, 0))
    });
    let g = Graph::new(
        [("a", "1"), ("left", "a * 2"), ("right", "a * 3"), ("sum", "tick(left + right)")],
        move |name| (name == "tick").then(|| tick.clone()),
    )
    .unwrap();
    let (log, _sub) = watch(&g, "sum");
    assert_eq!(log.take(), ["5"]);
    assert_eq!(runs.get(), 1);

    g.update("a", "2").unwrap();
    assert_eq!(log.take(), ["10"]);
    assert_eq!(runs.get(), 2);
}

#[test]
fn unchanged_values_are_not_redelivered() {
    let g = graph(&[("a", "1"), ("parity", "a % 2")]);
    let (log, _sub) = watch(&g, "parity");
    g.update("a", "3").unwrap();
    g.update("a", "5").unwrap();
    assert_eq!(log.take(), ["1"]);
}

#[test]
fn unknown_names_are_undefined() {
    let g = graph(&[("a", "typeof nothing")]);
    let (log, _sub) = watch(&g, "a");
    assert_eq!(log.take(), ["undefined"]);
}

#[test]
fn dependencies_follow_the_taken_branch() {
    let g = graph(&[("flag", "true"), ("x", "1"), ("y", "2"), ("pick", "flag ? x : y")]);
    let (log, _sub) = watch(&g, "pick");
    assert!(g.node("x").unwrap().is_active());
    assert!(!g.node("y").unwrap().is_active());

    g.update("flag", "false").unwrap();
    assert_eq!(log.take(), ["1", "2"]);
    assert!(!g.node("x").unwrap().is_active());
    assert!(g.node("y").unwrap().is_active());
}

// ── Cycles and errors ───────────────────────────────────────────────────────

#[test]
fn self_reference_is_a_cycle() {
    let g = graph(&[("a", "a + 1")]);
    let (log, _sub) = watch(&g, "a");
    assert_eq!(
        log.take(),
        ["error CircularDependencyError: Circular dependency detected: a -> a"]
    );
}

#[test]
fn cycle_error_clears_when_broken() {
    let g = graph(&[("a", "b"), ("b", "c"), ("c", "a * 2")]);
    let (log, _sub) = watch(&g, "a");
    assert_eq!(
        log.take(),
        ["error CircularDependencyError: Circular dependency detected: a -> b -> c -> a"]
    );
    let Some(NodeState::Error(_)) = g.state("a") else {
        panic!("expected an error state");
    };

    g.update("c", "21").unwrap();
    assert_eq!(log.take(), ["21"]);
}

#[test]
fn cycle_through_an_update_recovers() {
    let g = graph(&[("a", "5"), ("b", "a + 6")]);
    let (log, _sub) = watch(&g, "b");
    assert_eq!(log.take(), ["11"]);

    g.update("a", "b").unwrap();
    let events = log.take();
    assert_eq!(events.len(), 1);
    assert!(
        events[0].starts_with("error CircularDependencyError: Circular dependency detected:"),
        "{events:?}"
    );

    g.update("a", "42").unwrap();
    assert_eq!(log.take(), ["48"]);
}

#[test]
fn evaluation_errors_keep_the_subscription() {
    let g = graph(&[("r", "({})"), ("out", "r.map(i => i + 1)")]);
    let (log, _sub) = watch(&g, "out");
    assert_eq!(log.take(), ["error TypeError: r.map is not a function"]);

    g.update("r", "[1, 2]").unwrap();
    assert_eq!(log.take(), ["2,3"]);
}

#[test]
fn errors_propagate_to_dependents() {
    let g = graph(&[("a", "throw('boom')"), ("b", "a + 1")]);
    let (log, _sub) = watch(&g, "b");
    assert_eq!(log.take(), ["error boom"]);
}

#[test]
fn compile_errors_are_returned_synchronously() {
    let g = graph(&[("a", "1")]);
    let err = g.update("a", "x => ").unwrap_err();
    assert!(!err.diagnostics().is_empty());
    let err = g.update("a", "(class) => 1").unwrap_err();
    assert_eq!(err.to_string(), "Cannot use a reserved word class as a parameter name");
    let err = g.update("a", "try()").unwrap_err();
    assert_eq!(err.to_string(), "try requires at least one argument");
    assert_eq!(g.node("a").unwrap().formula(), "1");
}

// ── Subscriptions ───────────────────────────────────────────────────────────

#[test]
fn unsubscribe_stops_callbacks_and_releases_sources() {
    let input = Writable::new(1);
    let source = input.clone();
    let g = Graph::new([("double", "input * 2")], move |name| {
        (name == "input").then(|| Value::from(&source))
    })
    .unwrap();
    let (log, sub) = watch(&g, "double");
    assert_eq!(log.take(), ["2"]);
    assert_eq!(input.subscriber_count(), 1);

    input.set(5);
    assert_eq!(log.take(), ["10"]);

    sub.unsubscribe();
    assert_eq!(input.subscriber_count(), 0);
    input.set(7);
    assert!(log.take().is_empty());
}

#[test]
fn subscribers_share_one_computation() {
    let runs = Rc::new(Cell::new(0));
    let counter = runs.clone();
    let tick = Value::native("tick", move |_| {
        counter.set(counter.get() + 1);
        Ok(Value::from(1))
    });
    let g = Graph::new([("shared", "tick()")], move |name| {
        (name == "tick").then(|| tick.clone())
    })
    .unwrap();
    let (first, _a) = watch(&g, "shared");
    let (second, _b) = watch(&g, "shared");
    assert_eq!(first.take(), ["1"]);
    assert_eq!(second.take(), ["1"]);
    assert_eq!(runs.get(), 1);
}

#[test]
fn unobserved_reads_return_the_last_value() {
    let g = graph(&[("a", "40 + 2")]);
    assert_eq!(g.get("a"), None);

    let (_log, sub) = watch(&g, "a");
    assert_eq!(g.get("a"), Some(Value::from(42)));
    drop(sub);

    g.update("a", "0").unwrap();
    assert_eq!(g.get("a"), Some(Value::from(42)));
}

#[test]
fn removed_nodes_read_as_undefined() {
    let g = graph(&[("a", "1"), ("b", "a ?? 'gone'")]);
    let (log, _sub) = watch(&g, "b");
    g.remove("a");
    assert_eq!(log.take(), ["1", "gone"]);
    assert_eq!(g.names(), ["b"]);
}

// ── Asynchronous continuations ──────────────────────────────────────────────

#[test]
fn continuations_track_the_nodes_they_read() {
    let p = Pending::new();
    let g = graph_with(
        &[("b", "10"), ("out", "(x => x + b)(p)")],
        vec![("p", Value::from(p.clone()))],
    );
    let (log, _sub) = watch(&g, "out");
    assert_eq!(log.take(), ["stale"]);

    p.resolve(1);
    assert_eq!(log.take(), ["11"]);

    g.update("b", "20").unwrap();
    assert_eq!(log.take(), ["21"]);
}

#[test]
fn continuations_wait_for_stale_nodes() {
    let (p, q) = (Pending::new(), Pending::new());
    let g = graph_with(
        &[("b", "q"), ("out", "(x => x + b)(p)")],
        vec![("p", Value::from(p.clone())), ("q", Value::from(q.clone()))],
    );
    let (log, _sub) = watch(&g, "out");
    assert_eq!(log.take(), ["stale"]);

    p.resolve(1);
    assert!(log.take().is_empty());

    q.resolve(5);
    assert_eq!(log.take(), ["6"]);
}
