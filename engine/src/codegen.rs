// codegen.rs — Generated text for compiled formulas
//
// Renders the current compiled form of a formula by span splicing: each
// node's text is its source slice with every child's slice replaced by the
// child's fragment. Free identifiers become `ext("name")`, nested owners
// become `nodes[id].evaluator({ns})` and hooked nodes render according to
// their specialization state.
//
// Preconditions: `unit` was produced by `Compilation::new`.
// Postconditions: a `Fast` or unhooked subtree renders as its source text
//   with only free identifiers and nested owners substituted.
// Failure modes: none.
// Side effects: interns node ids in first-reference order.

use std::collections::HashMap;

use crate::analyze::{Binding, Compilation, ElemSlot, NodeKind, PropSlot, Specialization};
use crate::ast::Span;

/// Generated text of node `index`. `as_root` renders an owner's own body
/// instead of a reference to its evaluator.
pub fn generate(unit: &Compilation, index: usize, as_root: bool) -> String {
    let fragment = Generator { unit }.node(index, as_root);
    if unit.node(index).is_constructor_target {
        format!("({fragment})")
    } else {
        fragment
    }
}

/// Formula text with external identifiers renamed per `renames`. Names bound
/// by arrows, globals and unlisted externals are left alone.
pub fn rename(unit: &Compilation, renames: &HashMap<String, String>) -> String {
    let root = unit.node(unit.root()).span;
    let parts = (0..unit.len()).filter_map(|i| {
        let node = unit.node(i);
        let NodeKind::Identifier {
            name,
            binding: Binding::External,
            shorthand,
        } = &node.kind
        else {
            return None;
        };
        let renamed = renames.get(name)?;
        let text = if *shorthand {
            format!("{name}:{renamed}")
        } else {
            renamed.clone()
        };
        Some((node.span, text))
    });
    splice(unit.source(), root, parts)
}

struct Generator<'a> {
    unit: &'a Compilation,
}

impl Generator<'_> {
    fn node(&self, index: usize, as_root: bool) -> String {
        let node = self.unit.node(index);
        if node.is_owner() && !as_root {
            let id = self.unit.id(index);
            let names: Vec<&str> = node.namespace.iter().map(String::as_str).collect();
            return format!("nodes[{id}].evaluator({{{}}})", names.join(","));
        }

        if let NodeKind::Identifier {
            name,
            binding,
            shorthand,
        } = &node.kind
        {
            let fragment = match binding {
                Binding::External => format!("ext({name:?})"),
                Binding::Arguments(names) => format!("({{{}}})", names.join(",")),
                _ => return name.clone(),
            };
            return if *shorthand {
                format!("{name}:{fragment}")
            } else {
                fragment
            };
        }

        let method = match node.specialization() {
            Some(Specialization::Generic) => "specialize",
            Some(Specialization::Slow) => "dispatch",
            Some(Specialization::Fast) | None => return self.spliced(index),
        };
        let id = self.unit.id(index);
        format!("nodes[{id}].{method}({})", self.operands(index).join(","))
    }

    fn child(&self, index: usize) -> String {
        generate(self.unit, index, false)
    }

    /// Source text of `index` with children substituted.
    fn spliced(&self, index: usize) -> String {
        let node = self.unit.node(index);
        let parts = node
            .children
            .iter()
            .map(|&c| (self.unit.node(c).span, self.child(c)));
        splice(self.unit.source(), node.span, parts)
    }

    /// Operand fragments of a hooked node, in evaluation order.
    fn operands(&self, index: usize) -> Vec<String> {
        let node = self.unit.node(index);
        let children = &node.children;
        match &node.kind {
            NodeKind::Member { property, .. } => self.member(index, property),
            NodeKind::Call { spreads, .. } => {
                let callee = children[0];
                let mut operands = match &self.unit.node(callee).kind {
                    NodeKind::Member { property, .. }
                        if self.unit.node(callee).is_member_call_target =>
                    {
                        self.member(callee, property)
                    }
                    _ => vec![self.child(callee)],
                };
                operands.extend(self.arguments(&children[1..], spreads));
                operands
            }
            NodeKind::New { spreads } => {
                let mut operands = vec![self.child(children[0])];
                operands.extend(self.arguments(&children[1..], spreads));
                operands
            }
            NodeKind::Array(slots) => {
                let spreads: Vec<bool> = slots
                    .iter()
                    .filter(|s| !matches!(s, ElemSlot::Hole))
                    .map(|s| matches!(s, ElemSlot::Spread))
                    .collect();
                self.arguments(children, &spreads)
            }
            NodeKind::Object(slots) => {
                let mut operands = Vec::with_capacity(children.len());
                let mut next = children.iter();
                for slot in slots {
                    match slot {
                        PropSlot::Computed => {
                            operands.extend(next.by_ref().take(2).map(|&c| self.child(c)));
                        }
                        PropSlot::Spread => {
                            operands.extend(next.next().map(|&c| format!("...{}", self.child(c))));
                        }
                        _ => operands.extend(next.next().map(|&c| self.child(c))),
                    }
                }
                operands
            }
            _ => children.iter().map(|&c| self.child(c)).collect(),
        }
    }

    fn member(&self, index: usize, property: &Option<String>) -> Vec<String> {
        let children = &self.unit.node(index).children;
        let key = match property {
            Some(name) => format!("{name:?}"),
            None => self.child(children[1]),
        };
        vec![self.child(children[0]), key]
    }

    fn arguments(&self, args: &[usize], spreads: &[bool]) -> Vec<String> {
        args.iter()
            .zip(spreads.iter().chain(std::iter::repeat(&false)))
            .map(|(&a, &spread)| {
                let fragment = self.child(a);
                if spread {
                    format!("...{fragment}")
                } else {
                    fragment
                }
            })
            .collect()
    }
}

/// `span` of `source` with each `(part, text)` replacing its sub-span. Parts
/// must be disjoint; they are applied in source order.
fn splice(source: &str, span: Span, parts: impl IntoIterator<Item = (Span, String)>) -> String {
    let mut parts: Vec<(Span, String)> = parts.into_iter().collect();
    parts.sort_by_key(|(part, _)| part.start);
    let mut out = String::with_capacity(span.end - span.start);
    let mut cursor = span.start;
    for (part, text) in parts {
        if part.start < cursor {
            continue;
        }
        out.push_str(&source[cursor..part.start]);
        out.push_str(&text);
        cursor = part.end;
    }
    out.push_str(&source[cursor..span.end]);
    out
}
