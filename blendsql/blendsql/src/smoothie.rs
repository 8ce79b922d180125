//! The result envelope returned by [`crate::blend`].

use serde::Serialize;

use crate::db::Table;

/// Result table plus execution metadata.
#[derive(Debug, Clone)]
pub struct Smoothie {
    pub table: Table,
    pub meta: SmoothieMeta,
}

#[derive(Debug, Clone, Serialize)]
pub struct SmoothieMeta {
    pub process_time_seconds: f64,
    /// Values handed to ingredients, summed across recursive calls.
    pub num_values_passed: usize,
    pub num_prompt_tokens: usize,
    pub prompts: Vec<String>,
    /// `(source value, mapped value)` pairs per MAP call, for debugging.
    pub example_map_outputs: Vec<Vec<(String, String)>>,
    /// Registered ingredient names.
    pub ingredients: Vec<String>,
    /// The query as normalized at parse time, placeholders recovered.
    pub query: String,
    pub db_identifier: String,
    pub contains_ingredient: bool,
}
