//! The ingredient contract: the uniform invocation interface between the
//! orchestrator and externally-computed functions.
//!
//! Ingredient *implementations* live outside the core. The orchestrator only
//! knows the closed set of behavioral variants in [`IngredientType`], the
//! [`Ingredient`] trait, and the typed [`IngredientOutput`] payloads.

use std::any::Any;
use std::collections::{HashMap, HashSet};

use enum_as_inner::EnumAsInner;
use indexmap::IndexMap;

use crate::db::{Backend, Table};
use crate::utils::{get_temp_session_table, get_temp_subquery_table};
use crate::Result;

/// The closed set of ingredient variants. Dispatch is a match on this tag.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display, strum_macros::EnumString,
)]
#[strum(serialize_all = "UPPERCASE")]
pub enum IngredientType {
    /// Row-wise column generator: column → column.
    Map,
    /// Table/value → scalar aggregator.
    Qa,
    /// Row-alignment predicate: two columns → join table.
    Join,
    /// Raw-string emitter. Never dispatched on its own tier; only a
    /// return-type variant.
    String,
}

/// Opaque handle to a model backend. The core only reads reporting metadata;
/// ingredient implementations downcast to their concrete model type.
pub trait Blender {
    fn prompts(&self) -> Vec<String>;
    fn num_prompt_tokens(&self) -> usize;
    fn as_any(&self) -> &dyn Any;
}

/// Everything an ingredient invocation gets to see.
pub struct IngredientCall<'a> {
    /// Positional arguments, in source order.
    pub args: Vec<String>,
    /// Keyword arguments after `blender_args` overrides.
    pub kwargs: IndexMap<String, String>,
    /// For QA: a context table materialized from a subquery argument.
    pub context: Option<Table>,
    /// For MAP: output examples inferred from surrounding predicates.
    pub example_outputs: Option<Vec<String>>,
    pub table_to_title: Option<&'a HashMap<String, String>>,
    pub blender: Option<&'a dyn Blender>,
    pub db: &'a dyn Backend,
    pub session_id: &'a str,
    pub subquery_idx: usize,
    /// Alias → base table for the subquery being evaluated.
    pub aliases_to_tablenames: &'a IndexMap<String, String>,
    /// Columns added by MAP calls earlier in this subquery.
    pub prev_subquery_map_columns: &'a HashSet<String>,
}

impl IngredientCall<'_> {
    /// Scratch table carrying MAP outputs for `tablename` in this session.
    pub fn temp_session_table(&self, tablename: &str) -> String {
        get_temp_session_table(self.session_id, tablename)
    }

    /// Scratch table holding the abstracted select of `tablename` for the
    /// subquery being evaluated.
    pub fn temp_subquery_table(&self, tablename: &str) -> String {
        get_temp_subquery_table(self.session_id, self.subquery_idx, tablename)
    }

    /// Resolves an alias to its base table, passing unknown names through.
    pub fn resolve_tablename<'s>(&'s self, name: &'s str) -> &'s str {
        self.aliases_to_tablenames
            .get(name)
            .map(|s| s.as_str())
            .unwrap_or(name)
    }
}

/// Typed payloads by ingredient variant.
#[derive(Debug, Clone, EnumAsInner)]
pub enum IngredientOutput {
    /// A new column for `tablename`, row-aligned with its current contents.
    /// `table` must carry `source_col` and `new_col`.
    Map {
        new_col: String,
        tablename: String,
        source_col: String,
        table: Table,
    },
    /// A scalar SQL literal, substituted verbatim for the invocation.
    Scalar(String),
    /// A join clause replacing the `JOIN … ON …` that contained the
    /// invocation. `temp_join_table` is dropped at cleanup.
    Join {
        left_table: String,
        right_table: String,
        join_clause: String,
        temp_join_table: String,
    },
}

pub trait Ingredient {
    /// Uppercase registry name.
    fn name(&self) -> &str;

    fn ingredient_type(&self) -> IngredientType;

    fn run(&self, call: &IngredientCall) -> Result<IngredientOutput>;

    /// How many values this ingredient has passed to its model, for
    /// reporting.
    fn num_values_passed(&self) -> usize {
        0
    }

    /// Stable identifier for caching; defaults to the registry name.
    fn descriptor_id(&self) -> &str {
        self.name()
    }
}

impl std::fmt::Debug for dyn Ingredient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ingredient").field("name", &self.name()).finish()
    }
}

/// Cache key for model-side result caches: the ingredient's stable
/// descriptor id plus a serialized fingerprint of its inputs. Two calls with
/// the same key are interchangeable.
pub fn program_fingerprint(
    descriptor_id: &str,
    args: &[String],
    kwargs: &IndexMap<String, String>,
) -> String {
    serde_json::to_string(&(descriptor_id, args, kwargs))
        .expect("strings always serialize")
}
