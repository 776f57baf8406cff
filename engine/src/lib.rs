// calcgraph — reactive formula graph
//
// Library root. Front end (lexer, parser, ast, diag), progressive compiler
// (analyze, codegen, evaluator, id), runtime values (value, overload,
// builtins, flow) and the reactive layer (node, graph, sheet).

pub mod analyze;
pub mod ast;
pub mod builtins;
pub mod codegen;
pub mod diag;
pub mod error;
pub mod evaluator;
pub mod flow;
pub mod graph;
pub mod id;
pub mod lexer;
pub mod node;
pub mod overload;
pub mod parser;
pub mod sheet;
pub mod value;

pub use analyze::Compilation;
pub use error::{Error, Result};
pub use flow::{Observer, Pending, Subscribable, Subscription, Writable};
pub use graph::Graph;
pub use node::{CalcNode, NodeState, ResolvedRef};
pub use value::{ErrorKind, Throw, Value};
