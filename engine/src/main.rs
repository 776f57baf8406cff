use clap::Parser;
use std::path::PathBuf;
use std::rc::Rc;

use calcgraph::flow::{Observer, Subscription};
use calcgraph::graph::Graph;
use calcgraph::node::NodeState;
use calcgraph::sheet::{Sheet, SheetError};
use calcgraph::value::Value;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum EmitStage {
    Values,
    Deps,
    Ast,
    Compiled,
    Json,
}

#[derive(Parser, Debug)]
#[command(
    name = "calc",
    version,
    about = "Evaluates a sheet of reactive formulas"
)]
struct Cli {
    /// Input sheet (.json)
    sheet: PathBuf,

    /// Output stage
    #[arg(long, value_enum, default_value_t = EmitStage::Values)]
    emit: EmitStage,

    /// Print every state the named node publishes
    #[arg(long)]
    watch_name: Option<String>,

    /// Log compiler and graph activity to stderr
    #[arg(long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "calcgraph=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // ── Load sheet ──
    let sheet = match Sheet::load(&cli.sheet) {
        Ok(sheet) => sheet,
        Err(e) => {
            eprintln!("calc: error: {}", e);
            std::process::exit(2);
        }
    };
    tracing::debug!(
        formulas = sheet.formulas.len(),
        constants = sheet.constants.len(),
        "loaded sheet"
    );

    if cli.emit == EmitStage::Ast {
        for (name, formula) in &sheet.formulas {
            let parsed = calcgraph::parser::parse(formula);
            for diag in &parsed.diagnostics {
                eprintln!("calc: {}", diag.render(name, formula));
            }
            match parsed.expr {
                Some(expr) => println!("{} = {:#?}", name, expr),
                None => std::process::exit(1),
            }
        }
        return;
    }

    // ── Compile ──
    let graph = match sheet.build() {
        Ok(graph) => graph,
        Err(SheetError::Formula { name, source }) => {
            let formula = sheet.formulas.get(&name).map(String::as_str).unwrap_or_default();
            for diag in source.diagnostics() {
                eprintln!("calc: {}", diag.render(&name, formula));
            }
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("calc: error: {}", e);
            std::process::exit(1);
        }
    };

    if cli.emit == EmitStage::Deps {
        for name in graph.names() {
            let deps = graph.node(&name).map(|n| n.deps()).unwrap_or_default();
            let deps: Vec<&str> = deps.iter().map(String::as_str).collect();
            println!("{}: {}", name, deps.join(", "));
        }
        return;
    }

    // ── Evaluate ──
    let _watch = cli.watch_name.as_deref().map(|name| watch(&graph, name));
    let subscriptions: Vec<Subscription> = graph
        .names()
        .iter()
        .filter_map(|name| graph.subscribe(name, Observer::new(|_| {})))
        .collect();

    match cli.emit {
        EmitStage::Compiled => {
            for name in graph.names() {
                if let Some(node) = graph.node(&name) {
                    println!("{} = {}", name, node.signature());
                }
            }
        }
        EmitStage::Json => {
            let values: serde_json::Map<String, serde_json::Value> = graph
                .names()
                .into_iter()
                .map(|name| {
                    let json = match graph.state(&name).unwrap_or_default() {
                        NodeState::Value(value) => value.to_json(),
                        NodeState::Error(error) => serde_json::json!({ "error": error.to_display() }),
                        NodeState::Stale(_) | NodeState::Unknown => serde_json::Value::Null,
                    };
                    (name, json)
                })
                .collect();
            match serde_json::to_string_pretty(&values) {
                Ok(text) => println!("{}", text),
                Err(e) => {
                    eprintln!("calc: error: {}", e);
                    std::process::exit(1);
                }
            }
        }
        _ => {
            for name in graph.names() {
                println!("{} = {}", name, describe(&graph.state(&name).unwrap_or_default()));
            }
        }
    }

    let failed = graph
        .names()
        .iter()
        .any(|name| matches!(graph.state(name), Some(NodeState::Error(_))));
    drop(subscriptions);
    if failed {
        std::process::exit(1);
    }
}

fn describe(state: &NodeState) -> String {
    match state {
        NodeState::Unknown => "<unknown>".to_string(),
        NodeState::Stale(_) => "<pending>".to_string(),
        NodeState::Value(Value::Str(s)) => format!("{:?}", &**s),
        NodeState::Value(value) => value.to_display(),
        NodeState::Error(error) => format!("<{}>", error.to_display()),
    }
}

fn watch(graph: &Graph, name: &str) -> Subscription {
    let label: Rc<str> = Rc::from(name);
    let (on_value, on_error, on_stale) = (label.clone(), label.clone(), label);
    let observer = Observer::new(move |v| println!("watch {} = {}", on_value, describe(&NodeState::Value(v))))
        .on_error(move |e| println!("watch {} = {}", on_error, describe(&NodeState::Error(e))))
        .on_stale(move |_| println!("watch {} = <pending>", on_stale));
    match graph.subscribe(name, observer) {
        Some(subscription) => subscription,
        None => {
            eprintln!("calc: error: no formula named `{}`", name);
            std::process::exit(2);
        }
    }
}
