// flow.rs — Async flow adapter
//
// Pending values, push-subscribables and the operators that make them behave
// like plain values inside formulas: `pull` (flatten to concrete emissions),
// `compose` (re-run an operation over the latest operand values) and the
// `try` / `await` guards.
//
// Preconditions: single-threaded use (`Rc`/`RefCell`).
// Postconditions: every `Subscription` tears down all inner subscriptions it
//   created, synchronously, when unsubscribed or dropped.
// Failure modes: errors are emitted through `Observer::error`, never panics.
// Side effects: settlement and store writes run continuations synchronously,
//   each inside its own reactive batch.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use tracing::trace;

use crate::node;
use crate::value::{Function, Outcome, Throw, Value};

// ── Observer and Subscription ──

/// Callbacks receiving a flow's emissions.
#[derive(Clone)]
pub struct Observer {
    on_value: Rc<dyn Fn(Value)>,
    on_error: Rc<dyn Fn(Value)>,
    on_stale: Rc<dyn Fn(Pending)>,
}

impl Observer {
    /// Observe values only; errors and stale signals are ignored.
    pub fn new(on_value: impl Fn(Value) + 'static) -> Self {
        Self {
            on_value: Rc::new(on_value),
            on_error: Rc::new(|_| {}),
            on_stale: Rc::new(|_| {}),
        }
    }

    pub fn on_error(mut self, on_error: impl Fn(Value) + 'static) -> Self {
        self.on_error = Rc::new(on_error);
        self
    }

    pub fn on_stale(mut self, on_stale: impl Fn(Pending) + 'static) -> Self {
        self.on_stale = Rc::new(on_stale);
        self
    }

    pub fn value(&self, value: Value) {
        (self.on_value)(value)
    }

    pub fn error(&self, error: Value) {
        (self.on_error)(error)
    }

    pub fn stale(&self, pending: Pending) {
        (self.on_stale)(pending)
    }

    /// Same error and stale handling, different value handling.
    fn with_value(&self, on_value: impl Fn(Value) + 'static) -> Self {
        Self {
            on_value: Rc::new(on_value),
            ..self.clone()
        }
    }
}

/// Cancels a subscription when unsubscribed or dropped.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce()>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A subscription with nothing to tear down.
    pub fn empty() -> Self {
        Self { cancel: None }
    }

    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Holds at most one inner subscription; replacing it tears down the old
/// one first, and nothing is kept once the slot is closed.
#[derive(Default)]
pub(crate) struct SerialSlot {
    closed: Cell<bool>,
    current: RefCell<Option<Subscription>>,
}

impl SerialSlot {
    pub(crate) fn clear(&self) {
        let old = self.current.borrow_mut().take();
        drop(old);
    }

    pub(crate) fn set(&self, subscription: Subscription) {
        if self.closed.get() {
            return;
        }
        let old = self.current.borrow_mut().replace(subscription);
        drop(old);
    }

    pub(crate) fn close(&self) {
        self.closed.set(true);
        self.clear();
    }
}

/// A push source of values.
pub trait Subscribable {
    fn subscribe(&self, observer: Observer) -> Subscription;
}

// ── Pending ──

type Settlement = Result<Value, Value>;

struct Waiter {
    id: u64,
    active: Cell<bool>,
    callback: Box<dyn Fn(Settlement)>,
}

#[derive(Default)]
struct PendingInner {
    settled: RefCell<Option<Settlement>>,
    waiters: RefCell<Vec<Rc<Waiter>>>,
    next_id: Cell<u64>,
}

/// A value that is not known yet; settles exactly once.
#[derive(Clone, Default)]
pub struct Pending(Rc<PendingInner>);

impl Pending {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolved(value: impl Into<Value>) -> Self {
        let pending = Self::new();
        pending.resolve(value);
        pending
    }

    pub fn rejected(error: impl Into<Value>) -> Self {
        let pending = Self::new();
        pending.reject(error);
        pending
    }

    pub fn resolve(&self, value: impl Into<Value>) {
        self.settle(Ok(value.into()));
    }

    pub fn reject(&self, error: impl Into<Value>) {
        self.settle(Err(error.into()));
    }

    pub fn is_settled(&self) -> bool {
        self.0.settled.borrow().is_some()
    }

    pub fn settlement(&self) -> Option<Result<Value, Value>> {
        self.0.settled.borrow().clone()
    }

    pub fn ptr_eq(&self, other: &Pending) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn addr(&self) -> *const () {
        Rc::as_ptr(&self.0) as *const ()
    }

    fn settle(&self, settlement: Settlement) {
        if self.is_settled() {
            trace!("ignoring second settlement of a pending value");
            return;
        }
        *self.0.settled.borrow_mut() = Some(settlement.clone());
        let waiters = std::mem::take(&mut *self.0.waiters.borrow_mut());
        node::batch(|| {
            for waiter in waiters {
                if waiter.active.get() {
                    (waiter.callback)(settlement.clone());
                }
            }
        });
    }

    /// Run `callback` once on settlement, immediately if already settled.
    pub fn on_settle(&self, callback: impl Fn(Settlement) + 'static) -> Subscription {
        if let Some(settlement) = self.settlement() {
            callback(settlement);
            return Subscription::empty();
        }
        let id = self.0.next_id.get();
        self.0.next_id.set(id + 1);
        let waiter = Rc::new(Waiter {
            id,
            active: Cell::new(true),
            callback: Box::new(callback),
        });
        self.0.waiters.borrow_mut().push(waiter.clone());
        let inner = Rc::downgrade(&self.0);
        Subscription::new(move || {
            waiter.active.set(false);
            if let Some(inner) = inner.upgrade() {
                inner.waiters.borrow_mut().retain(|w| w.id != id);
            }
        })
    }
}

impl fmt::Debug for Pending {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pending")
            .field("settled", &self.settlement())
            .finish()
    }
}

// ── Flattening ──

/// Subscribe to `value`, following pending values and subscribables until
/// concrete values arrive. Concrete values are emitted synchronously.
pub fn pull(value: Value, observer: Observer) -> Subscription {
    match value {
        Value::Pending(pending) => {
            let inner = Rc::new(SerialSlot::default());
            let slot = inner.clone();
            let continuation = observer.clone();
            let settle = pending.on_settle(move |settlement| match settlement {
                Ok(value) => slot.set(pull(value, continuation.clone())),
                Err(error) => continuation.error(error),
            });
            if !pending.is_settled() {
                observer.stale(pending);
            }
            Subscription::new(move || {
                drop(settle);
                inner.close();
            })
        }
        Value::Stream(source) => {
            let inner = Rc::new(SerialSlot::default());
            let slot = inner.clone();
            let target = observer.clone();
            let (on_error, on_stale) = (inner.clone(), inner.clone());
            let (error_target, stale_target) = (observer.clone(), observer.clone());
            // Any outer emission retires the current inner source.
            let outer = source.subscribe(
                observer
                    .with_value(move |value| {
                        slot.clear();
                        slot.set(pull(value, target.clone()));
                    })
                    .on_error(move |error| {
                        on_error.clear();
                        error_target.error(error);
                    })
                    .on_stale(move |pending| {
                        on_stale.clear();
                        stale_target.stale(pending);
                    }),
            );
            Subscription::new(move || {
                drop(outer);
                inner.close();
            })
        }
        concrete => {
            observer.value(concrete);
            Subscription::empty()
        }
    }
}

/// A subscribable whose emissions are flattened through `pull`.
pub struct Flattened(Value);

impl Subscribable for Flattened {
    fn subscribe(&self, observer: Observer) -> Subscription {
        pull(self.0.clone(), observer)
    }
}

pub fn flatten(source: Rc<dyn Subscribable>) -> Value {
    Value::Stream(Rc::new(Flattened(Value::Stream(source))))
}

// ── Composition ──

pub type Operation = Rc<dyn Fn(&[Value]) -> Outcome>;

/// Apply `op` to operands of which some are asynchronous. The result is a
/// subscribable that re-runs `op` whenever every operand has a fresh value.
pub fn compose(operands: Vec<Value>, op: Operation) -> Value {
    Value::Stream(Rc::new(Composed { operands, op }))
}

struct Composed {
    operands: Vec<Value>,
    op: Operation,
}

#[derive(Clone)]
enum SlotState {
    Waiting,
    Stale,
    Ready(Value),
    Failed,
}

struct Composition {
    operands: Vec<Value>,
    /// Operand index to source index, for asynchronous operands.
    routes: Vec<Option<usize>>,
    slots: RefCell<Vec<SlotState>>,
    op: Operation,
    observer: Observer,
    started: Cell<bool>,
    /// Flattening of the last result, or a wait on a pending it raised.
    inner: SerialSlot,
    this: Weak<Composition>,
}

impl Composition {
    fn update(&self, source: usize, state: SlotState) {
        self.slots.borrow_mut()[source] = state;
        self.recompute();
    }

    fn recompute(&self) {
        if !self.started.get() {
            return;
        }
        let values: Option<Vec<Value>> = {
            let slots = self.slots.borrow();
            self.operands
                .iter()
                .zip(&self.routes)
                .map(|(operand, route)| match route {
                    None => Some(operand.clone()),
                    Some(i) => match &slots[*i] {
                        SlotState::Ready(value) => Some(value.clone()),
                        _ => None,
                    },
                })
                .collect()
        };
        let Some(values) = values else {
            return;
        };
        self.inner.clear();
        match (self.op)(&values) {
            Ok(value) => self.inner.set(pull(value, self.observer.clone())),
            Err(Throw::Error(error)) => self.observer.error(error),
            Err(Throw::Stale(pending)) => {
                self.observer.stale(pending.clone());
                if !pending.is_settled() {
                    let this = self.this.clone();
                    self.inner.set(pending.on_settle(move |_| {
                        if let Some(composition) = this.upgrade() {
                            composition.recompute();
                        }
                    }));
                }
            }
        }
    }
}

impl Subscribable for Composed {
    fn subscribe(&self, observer: Observer) -> Subscription {
        let mut sources: Vec<Value> = Vec::new();
        let routes = self
            .operands
            .iter()
            .map(|operand| {
                let id = operand.async_identity()?;
                let index = sources
                    .iter()
                    .position(|s| s.async_identity() == Some(id))
                    .unwrap_or_else(|| {
                        sources.push(operand.clone());
                        sources.len() - 1
                    });
                Some(index)
            })
            .collect();

        let state = Rc::new_cyclic(|this| Composition {
            operands: self.operands.clone(),
            routes,
            slots: RefCell::new(vec![SlotState::Waiting; sources.len()]),
            op: self.op.clone(),
            observer: observer.clone(),
            started: Cell::new(false),
            inner: SerialSlot::default(),
            this: this.clone(),
        });

        let subscriptions: Vec<Subscription> = sources
            .into_iter()
            .enumerate()
            .map(|(index, source)| {
                let on_value = Rc::downgrade(&state);
                let on_error = Rc::downgrade(&state);
                let on_stale = Rc::downgrade(&state);
                pull(
                    source,
                    Observer::new(move |value| {
                        if let Some(state) = on_value.upgrade() {
                            state.update(index, SlotState::Ready(value));
                        }
                    })
                    .on_error(move |error| {
                        if let Some(state) = on_error.upgrade() {
                            state.slots.borrow_mut()[index] = SlotState::Failed;
                            state.observer.error(error);
                        }
                    })
                    .on_stale(move |pending| {
                        if let Some(state) = on_stale.upgrade() {
                            state.slots.borrow_mut()[index] = SlotState::Stale;
                            state.inner.clear();
                            state.observer.stale(pending);
                        }
                    }),
                )
            })
            .collect();

        state.started.set(true);
        state.recompute();

        Subscription::new(move || {
            drop(subscriptions);
            state.inner.close();
        })
    }
}

// ── try / await ──

#[derive(Clone, Copy, PartialEq, Eq)]
enum Guard {
    Try,
    Await,
}

/// An asynchronous value observed through `try` or `await`.
struct Guarded {
    source: Value,
    handler: Option<Function>,
    guard: Guard,
}

impl Guarded {
    fn handle(&self, argument: Value, observer: &Observer, sub: &SerialSlot) {
        let Some(handler) = &self.handler else {
            observer.value(Value::Undefined);
            return;
        };
        match handler.call(&Value::Undefined, &[argument]) {
            Ok(value) => sub.set(pull(value, observer.clone())),
            Err(Throw::Error(error)) => observer.error(error),
            Err(Throw::Stale(pending)) => observer.stale(pending),
        }
    }
}

impl Subscribable for Guarded {
    fn subscribe(&self, observer: Observer) -> Subscription {
        let guarded = Rc::new(Guarded {
            source: self.source.clone(),
            handler: self.handler.clone(),
            guard: self.guard,
        });
        let handled = Rc::new(SerialSlot::default());
        let mut watched = observer.with_value({
            let observer = observer.clone();
            let handled = handled.clone();
            move |value| {
                handled.clear();
                observer.value(value)
            }
        });
        match self.guard {
            Guard::Try => {
                let (guarded, handled, observer) = (guarded.clone(), handled.clone(), observer.clone());
                watched = watched.on_error(move |error| guarded.handle(error, &observer, &handled));
            }
            Guard::Await => {
                let (guarded, handled, observer) = (guarded.clone(), handled.clone(), observer.clone());
                watched = watched.on_stale(move |pending| {
                    guarded.handle(Value::Pending(pending), &observer, &handled)
                });
            }
        }
        let source = pull(guarded.source.clone(), watched);
        Subscription::new(move || {
            drop(source);
            handled.close();
        })
    }
}

/// `try(expr, onError?)`: intercept thrown errors and rejected pending
/// values; staleness passes through.
pub fn try_catch(attempt: Outcome, handler: Option<Function>) -> Outcome {
    match attempt {
        Ok(value) if value.is_async() => Ok(Value::Stream(Rc::new(Guarded {
            source: value,
            handler,
            guard: Guard::Try,
        }))),
        Ok(value) => Ok(value),
        Err(Throw::Error(error)) => match handler {
            Some(handler) => handler.call(&Value::Undefined, &[error]),
            None => Ok(Value::Undefined),
        },
        Err(stale @ Throw::Stale(_)) => Err(stale),
    }
}

/// `await(expr, onStale?)`: substitute a value while `expr` is pending;
/// errors pass through.
pub fn await_stale(attempt: Outcome, handler: Option<Function>) -> Outcome {
    let source = match attempt {
        Ok(value) => value,
        Err(Throw::Stale(pending)) => Value::Pending(pending),
        Err(error) => return Err(error),
    };
    if !source.is_async() {
        return Ok(source);
    }
    Ok(Value::Stream(Rc::new(Guarded {
        source,
        handler,
        guard: Guard::Await,
    })))
}

// ── Writable ──

type Observers = Rc<RefCell<Vec<(u64, Observer)>>>;

struct WritableInner {
    value: RefCell<Value>,
    observers: Observers,
    next_id: Cell<u64>,
}

/// A host-side cell that pushes every new value to its subscribers.
#[derive(Clone)]
pub struct Writable(Rc<WritableInner>);

impl Writable {
    pub fn new(value: impl Into<Value>) -> Self {
        Self(Rc::new(WritableInner {
            value: RefCell::new(value.into()),
            observers: Observers::default(),
            next_id: Cell::new(0),
        }))
    }

    pub fn get(&self) -> Value {
        self.0.value.borrow().clone()
    }

    pub fn set(&self, value: impl Into<Value>) {
        let value = value.into();
        *self.0.value.borrow_mut() = value.clone();
        let observers: Vec<(u64, Observer)> = self.0.observers.borrow().clone();
        node::batch(|| {
            for (id, observer) in observers {
                // skip observers removed by an earlier notification
                let live = self.0.observers.borrow().iter().any(|(i, _)| *i == id);
                if live {
                    observer.value(value.clone());
                }
            }
        });
    }

    pub fn update(&self, f: impl FnOnce(&Value) -> Value) {
        let next = f(&self.get());
        self.set(next);
    }

    pub fn subscriber_count(&self) -> usize {
        self.0.observers.borrow().len()
    }
}

impl Subscribable for WritableInner {
    fn subscribe(&self, observer: Observer) -> Subscription {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.observers.borrow_mut().push((id, observer.clone()));
        let current = self.value.borrow().clone();
        observer.value(current);
        let observers = Rc::downgrade(&self.observers);
        Subscription::new(move || {
            if let Some(observers) = observers.upgrade() {
                observers.borrow_mut().retain(|(i, _)| *i != id);
            }
        })
    }
}

impl From<Writable> for Value {
    fn from(writable: Writable) -> Self {
        Value::Stream(writable.0)
    }
}

impl From<&Writable> for Value {
    fn from(writable: &Writable) -> Self {
        Value::Stream(writable.0.clone())
    }
}
