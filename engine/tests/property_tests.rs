// Property-based tests for compiler invariants.
//
// Generated arithmetic formulas over a fixed pool of free names:
// 1. Evaluation agrees with the same arithmetic done natively
// 2. Dependencies are exactly the free names used
// 3. A first run commits every hook: re-evaluation is stable and no
//    generic node is left in the generated text
// 4. Renaming with an identity map reproduces the source
// 5. Renaming with a permutation of the names, against a resolver remapped
//    the same way, evaluates to the same value
//
// Uses proptest with explicit configuration to prevent CI flakiness.

use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

use calcgraph::{Compilation, Value};
use proptest::prelude::*;

// ── Formula generator ───────────────────────────────────────────────────────

const NAMES: [(&str, f64); 5] = [
    ("alpha", 3.0),
    ("beta", -2.0),
    ("gamma", 0.5),
    ("delta", 10.0),
    ("eps", 7.0),
];

#[derive(Debug, Clone)]
enum Arith {
    Num(u32),
    Var(usize),
    Neg(Box<Arith>),
    Bin(char, Box<Arith>, Box<Arith>),
}

impl Arith {
    fn source(&self) -> String {
        match self {
            Arith::Num(n) => n.to_string(),
            Arith::Var(i) => NAMES[*i].0.to_string(),
            Arith::Neg(inner) => format!("-({})", inner.source()),
            Arith::Bin(op, lhs, rhs) => format!("({} {} {})", lhs.source(), op, rhs.source()),
        }
    }

    fn value(&self) -> f64 {
        match self {
            Arith::Num(n) => f64::from(*n),
            Arith::Var(i) => NAMES[*i].1,
            Arith::Neg(inner) => -inner.value(),
            Arith::Bin(op, lhs, rhs) => {
                let (a, b) = (lhs.value(), rhs.value());
                match op {
                    '+' => a + b,
                    '-' => a - b,
                    _ => a * b,
                }
            }
        }
    }

    fn names(&self, out: &mut BTreeSet<String>) {
        match self {
            Arith::Num(_) => {}
            Arith::Var(i) => {
                out.insert(NAMES[*i].0.to_string());
            }
            Arith::Neg(inner) => inner.names(out),
            Arith::Bin(_, lhs, rhs) => {
                lhs.names(out);
                rhs.names(out);
            }
        }
    }
}

fn arb_arith() -> impl Strategy<Value = Arith> {
    let leaf = prop_oneof![
        (0u32..100).prop_map(Arith::Num),
        (0..NAMES.len()).prop_map(Arith::Var),
    ];
    leaf.prop_recursive(4, 32, 2, |inner| {
        prop_oneof![
            inner.clone().prop_map(|e| Arith::Neg(Box::new(e))),
            (prop_oneof![Just('+'), Just('-'), Just('*')], inner.clone(), inner)
                .prop_map(|(op, lhs, rhs)| Arith::Bin(op, Box::new(lhs), Box::new(rhs))),
        ]
    })
}

fn evaluate(unit: &Rc<Compilation>) -> Value {
    unit.evaluate(Rc::new(|name: &str| {
        Ok(NAMES
            .iter()
            .find(|(n, _)| *n == name)
            .map_or(Value::Undefined, |(_, v)| Value::from(*v)))
    }))
    .unwrap()
}

/// `NAMES[i]` is renamed to `NAMES[permutation[i]]`.
fn arb_permutation() -> impl Strategy<Value = Vec<usize>> {
    Just((0..NAMES.len()).collect::<Vec<_>>()).prop_shuffle()
}

// ── Properties ──────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 200,
        max_shrink_iters: 200,
        .. ProptestConfig::default()
    })]

    #[test]
    fn evaluation_matches_native_arithmetic(expr in arb_arith()) {
        let source = expr.source();
        let unit = Compilation::new(&source).unwrap();
        prop_assert_eq!(evaluate(&unit), Value::from(expr.value()), "formula: {}", source);
    }

    #[test]
    fn dependencies_are_the_free_names(expr in arb_arith()) {
        let unit = Compilation::new(&expr.source()).unwrap();
        let mut expected = BTreeSet::new();
        expr.names(&mut expected);
        prop_assert_eq!(unit.deps(), &expected);
    }

    #[test]
    fn first_run_commits_every_hook(expr in arb_arith()) {
        let unit = Compilation::new(&expr.source()).unwrap();
        let first = evaluate(&unit);
        let generated = unit.generated();
        prop_assert!(!generated.contains("specialize("), "generic node left in {}", generated);
        prop_assert!(!generated.contains("dispatch("), "slow node in {}", generated);
        prop_assert_eq!(evaluate(&unit), first);
    }

    #[test]
    fn identity_rename_reproduces_the_source(expr in arb_arith()) {
        let source = expr.source();
        let identity: HashMap<String, String> = NAMES
            .iter()
            .map(|(n, _)| (n.to_string(), n.to_string()))
            .collect();
        prop_assert_eq!(Compilation::new(&source).unwrap().renamed(&identity), source);
    }

    #[test]
    fn renaming_with_a_remapped_resolver_preserves_values(
        expr in arb_arith(),
        permutation in arb_permutation(),
    ) {
        let source = expr.source();
        let renames: HashMap<String, String> = permutation
            .iter()
            .enumerate()
            .map(|(from, to)| (NAMES[from].0.to_string(), NAMES[*to].0.to_string()))
            .collect();
        let renamed = Compilation::new(&source).unwrap().renamed(&renames);

        // the renamed name reads the value the original name had
        let remapped: HashMap<String, f64> = permutation
            .iter()
            .enumerate()
            .map(|(from, to)| (NAMES[*to].0.to_string(), NAMES[from].1))
            .collect();
        let value = Compilation::new(&renamed)
            .unwrap()
            .evaluate(Rc::new(move |name: &str| {
                Ok(remapped.get(name).map_or(Value::Undefined, |v| Value::from(*v)))
            }))
            .unwrap();

        let original = Compilation::new(&source).unwrap();
        prop_assert_eq!(value, evaluate(&original), "renamed: {}", renamed);
    }
}
