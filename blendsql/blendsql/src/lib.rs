//! # blendsql
//!
//! Execution engine for BlendSQL, a hybrid query language that augments
//! standard SQL with *ingredient* calls — opaque, externally-computed
//! functions (typically backed by language models) inlined into SQL
//! expressions:
//!
//! ```text
//! SELECT name FROM w WHERE {{LLMMap('is a fruit?', 'w::item')}} = TRUE
//! ```
//!
//! You probably want to start with the [blend] function.
//!
//! ```ascii
//!        BlendSQL text
//!
//!   (preprocess) │            aliases {{A()}} for each invocation
//!               ▼
//!          SQL + aliases
//!               │
//!       (parse) │            sqlparser AST, SQLite dialect
//!               ▼
//!        per-subquery SCM    abstracted selects, alias bookkeeping
//!               │
//!    (dispatch) │            MAP → QA → JOIN, source order
//!               ▼
//!        rewritten pure SQL
//!               │
//!     (execute) ▼
//!            Smoothie
//! ```
//!
//! The core never interprets ingredient bodies: implementations are supplied
//! by the caller through the [Ingredient] trait, and model backends hide
//! behind the opaque [Blender] handle.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexSet;

pub mod db;
mod error;
pub mod ingredient;
mod kitchen;
mod orchestrator;
mod smoothie;
pub mod sqlast;
mod subquery;
pub mod utils;

pub use db::{Backend, SqliteBackend, Table, Value};
pub use error::Error;
pub use ingredient::{
    program_fingerprint, Blender, Ingredient, IngredientCall, IngredientOutput, IngredientType,
};
pub use kitchen::Kitchen;
pub use smoothie::{Smoothie, SmoothieMeta};
pub use subquery::SubqueryContextManager;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Knobs for one [blend] call.
#[derive(Debug, Clone)]
pub struct BlendOptions {
    /// Keyword-argument overrides applied to every ingredient call,
    /// last-writer-wins over kwargs written in the query.
    pub blender_args: Option<HashMap<String, String>>,

    /// Infer the output format of a MAP call from its predicate context.
    /// In `{{LLMMap('convert to date', 'w::listing date')}} <= '1960-12-31'`
    /// the example output `1960-12-31` is handed to the ingredient.
    ///
    /// Defaults to false.
    pub infer_map_constraints: bool,

    /// Optional mapping from table name to a table title, for datasets where
    /// relevant context lives in the title.
    pub table_to_title: Option<HashMap<String, String>>,

    /// Silence errors from the final pure-SQL execution, returning an empty
    /// result instead.
    ///
    /// Defaults to true.
    pub silence_db_exec_errors: bool,
}

impl Default for BlendOptions {
    fn default() -> Self {
        BlendOptions {
            blender_args: None,
            infer_map_constraints: false,
            table_to_title: None,
            silence_db_exec_errors: true,
        }
    }
}

impl BlendOptions {
    pub fn with_blender_args(mut self, blender_args: HashMap<String, String>) -> Self {
        self.blender_args = Some(blender_args);
        self
    }

    pub fn with_infer_map_constraints(mut self, infer: bool) -> Self {
        self.infer_map_constraints = infer;
        self
    }

    pub fn with_table_to_title(mut self, table_to_title: HashMap<String, String>) -> Self {
        self.table_to_title = Some(table_to_title);
        self
    }

    pub fn with_silence_db_exec_errors(mut self, silence: bool) -> Self {
        self.silence_db_exec_errors = silence;
        self
    }
}

/// Executes a BlendSQL query against `db`, resolving every ingredient call
/// through the registered `ingredients`, and returns the result table with
/// execution metadata.
///
/// Temp tables created along the way — including by recursive calls for
/// nested subqueries — are dropped before this returns, on success and on
/// error alike.
pub fn blend(
    query: &str,
    db: &dyn Backend,
    blender: Option<&dyn Blender>,
    ingredients: &[Arc<dyn Ingredient>],
    options: &BlendOptions,
) -> Result<Smoothie> {
    let ctx = orchestrator::BlendContext {
        db,
        blender,
        ingredients,
        options,
    };
    let mut cleanup_tables: IndexSet<String> = IndexSet::new();
    let result = orchestrator::blend_inner(query, &ctx, &mut cleanup_tables, 0);
    for table in &cleanup_tables {
        if let Err(error) = db.drop_table(table) {
            log::warn!("failed to drop temp table `{table}`: {error}");
        }
    }
    result
}
