// Asynchronous operands inside formulas: writable stores, pending values,
// stale propagation between nodes, and the flow operators used directly.

use std::cell::RefCell;
use std::rc::Rc;

use calcgraph::flow::{self, compose, pull};
use calcgraph::value::Outcome;
use calcgraph::{Graph, Observer, Pending, Subscription, Value, Writable};

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

/// One-formula graph over named external values.
fn single(formula: &str, externals: Vec<(&'static str, Value)>) -> (Graph, Rc<Log>, Subscription) {
    let graph = Graph::new([("out", formula)], move |name| {
        externals.iter().find(|(n, _)| *n == name).map(|(_, v)| v.clone())
    })
    .unwrap();
    let log = Rc::new(Log::default());
    let sub = graph.subscribe("out", log.observer()).unwrap();
    (graph, log, sub)
}

// ── Writable stores ─────────────────────────────────────────────────────────

#[test]
fn store_operands_follow_every_write() {
    let w = Writable::new(1);
    let (graph, log, _sub) = single("w * 2", vec![("w", Value::from(&w))]);
    assert_eq!(log.take(), ["2"]);

    w.set(5);
    w.set(6);
    assert_eq!(log.take(), ["10", "12"]);
    assert_eq!(graph.get("out"), Some(Value::from(12)));
}

#[test]
fn repeated_store_operands_subscribe_once() {
    let w = Writable::new(3);
    let (_graph, log, _sub) = single("w * w", vec![("w", Value::from(&w))]);
    assert_eq!(log.take(), ["9"]);
    assert_eq!(w.subscriber_count(), 1);

    w.set(4);
    assert_eq!(log.take(), ["16"]);
}

#[test]
fn two_stores_combine_latest() {
    let a = Writable::new(1);
    let b = Writable::new(10);
    let (_graph, log, _sub) = single(
        "a * 10 + b",
        vec![("a", Value::from(&a)), ("b", Value::from(&b))],
    );
    assert_eq!(log.take(), ["20"]);

    b.set(100);
    a.set(2);
    assert_eq!(log.take(), ["110", "120"]);
}

// ── Pending values ──────────────────────────────────────────────────────────

#[test]
fn pending_operands_are_stale_until_resolved() {
    let p = Pending::new();
    let (_graph, log, _sub) = single("p + 1", vec![("p", Value::from(p.clone()))]);
    assert_eq!(log.take(), ["stale"]);

    p.resolve(41);
    assert_eq!(log.take(), ["42"]);
}

#[test]
fn rejected_operands_become_errors() {
    let p = Pending::new();
    let (graph, log, _sub) = single("p * 2", vec![("p", Value::from(p.clone()))]);
    p.reject(Value::from("offline"));
    assert_eq!(log.take(), ["stale", "error offline"]);
    assert_eq!(graph.get("out"), None);
}

#[test]
fn staleness_propagates_between_nodes() {
    let p = Pending::new();
    let source = Value::from(p.clone());
    let graph = Graph::new([("a", "p"), ("b", "a + 1")], move |name| {
        (name == "p").then(|| source.clone())
    })
    .unwrap();
    let log = Rc::new(Log::default());
    let _sub = graph.subscribe("b", log.observer()).unwrap();
    assert_eq!(log.take(), ["stale"]);

    p.resolve(1);
    assert_eq!(log.take(), ["2"]);
    assert_eq!(graph.get("a"), Some(Value::from(1)));
}

#[test]
fn member_access_on_a_pending_object() {
    let p = Pending::new();
    let (_graph, log, _sub) = single("p.x * 10", vec![("p", Value::from(p.clone()))]);
    p.resolve(Value::object([("x", Value::from(4))]));
    assert_eq!(log.take(), ["stale", "40"]);
}

#[test]
fn method_calls_on_a_pending_array() {
    let p = Pending::new();
    let (_graph, log, _sub) = single("p.map(x => x * 2)", vec![("p", Value::from(p.clone()))]);
    p.resolve(Value::array(vec![1.into(), 2.into()]));
    assert_eq!(log.take(), ["stale", "2,4"]);
}

#[test]
fn spreading_a_pending_array() {
    let p = Pending::resolved(Value::array(vec![1.into(), 2.into()]));
    let (_graph, log, _sub) = single("[...p, 3].length", vec![("p", Value::from(p))]);
    assert_eq!(log.take(), ["3"]);
}

#[test]
fn unsubscribing_drops_pending_continuations() {
    let p = Pending::new();
    let (_graph, log, sub) = single("p + 1", vec![("p", Value::from(p.clone()))]);
    drop(sub);
    p.resolve(1);
    assert_eq!(log.take(), ["stale"]);
}

// ── Flow operators ──────────────────────────────────────────────────────────

#[test]
fn pull_follows_nested_pending_values() {
    let outer = Pending::new();
    let inner = Pending::new();
    let log = Rc::new(Log::default());
    let _sub = pull(Value::from(outer.clone()), log.observer());

    outer.resolve(inner.clone());
    inner.resolve("done");
    assert_eq!(log.take(), ["stale", "stale", "done"]);
}

#[test]
fn pull_switches_to_the_latest_inner_value() {
    let w = Writable::new(Value::Undefined);
    let first = Pending::new();
    let log = Rc::new(Log::default());
    let _sub = pull(Value::from(&w), log.observer());
    assert_eq!(log.take(), ["undefined"]);

    w.set(first.clone());
    w.set(7);
    first.resolve(1);
    assert_eq!(log.take(), ["stale", "7"]);
}

#[test]
fn compose_waits_for_every_operand() {
    let a = Pending::new();
    let b = Writable::new(2);
    let sum = compose(
        vec![Value::from(a.clone()), Value::from(&b), Value::from(100)],
        Rc::new(|values: &[Value]| -> Outcome {
            Ok(Value::from(values.iter().map(Value::to_number).sum::<f64>()))
        }),
    );
    let log = Rc::new(Log::default());
    let sub = pull(sum, log.observer());
    assert_eq!(log.take(), ["stale"]);

    a.resolve(1);
    b.set(3);
    assert_eq!(log.take(), ["103", "104"]);

    sub.unsubscribe();
    assert_eq!(b.subscriber_count(), 0);
}

#[test]
fn flatten_emits_concrete_values() {
    let w = Writable::new(Pending::resolved(5));
    let flat = flow::flatten(Rc::new(Relay(Value::from(&w))));
    let log = Rc::new(Log::default());
    let _sub = pull(flat, log.observer());
    assert_eq!(log.take(), ["5"]);
}

/// A subscribable relaying a store.
struct Relay(Value);

impl calcgraph::Subscribable for Relay {
    fn subscribe(&self, observer: Observer) -> Subscription {
        pull(self.0.clone(), observer)
    }
}
