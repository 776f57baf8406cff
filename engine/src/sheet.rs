// sheet.rs — JSON sheet files
//
// A sheet names formulas and constant inputs:
//
//     { "formulas": { "total": "price * qty" }, "constants": { "price": 3 } }
//
// Constants are converted to values once and served to the graph as its
// external resolver.

use std::path::Path;
use std::rc::Rc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error;
use crate::graph::Graph;
use crate::value::Value;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Sheet {
    #[serde(default)]
    pub formulas: IndexMap<String, String>,
    #[serde(default)]
    pub constants: IndexMap<String, serde_json::Value>,
}

#[derive(Debug, Error)]
pub enum SheetError {
    #[error("{}: {source}", .path.display())]
    Io {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    #[error("invalid sheet: {0}")]
    Json(#[from] serde_json::Error),
    #[error("formula `{name}`: {source}")]
    Formula { name: String, source: error::Error },
}

impl Sheet {
    pub fn load(path: &Path) -> Result<Sheet, SheetError> {
        let text = std::fs::read_to_string(path).map_err(|source| SheetError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Sheet, SheetError> {
        Ok(serde_json::from_str(text)?)
    }

    /// A graph over the sheet's formulas with its constants as externals.
    pub fn build(&self) -> Result<Graph, SheetError> {
        let constants: Rc<IndexMap<String, Value>> = Rc::new(
            self.constants
                .iter()
                .map(|(name, json)| (name.clone(), Value::from_json(json)))
                .collect(),
        );
        let graph = Graph::with_external(move |name| constants.get(name).cloned());
        for (name, formula) in &self.formulas {
            graph.update(name, formula).map_err(|source| SheetError::Formula {
                name: name.clone(),
                source,
            })?;
        }
        Ok(graph)
    }
}
