//! The main blending routine: parse, walk subqueries bottom-up, evaluate
//! ingredients in priority order, merge their outputs, rewrite, execute.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use blendsql_parser::{preprocess, scan, ParsedIngredient, Preprocessed};
use indexmap::{IndexMap, IndexSet};
use sqlparser::ast::Query;

use crate::db::{quote_ident, value_to_text, Backend, Table};
use crate::ingredient::{Blender, Ingredient, IngredientCall, IngredientOutput, IngredientType};
use crate::kitchen::Kitchen;
use crate::smoothie::{Smoothie, SmoothieMeta};
use crate::sqlast::{self, transforms, SubqueryInfo};
use crate::subquery::SubqueryContextManager;
use crate::utils::{
    alias_letters, get_temp_session_table, get_temp_subquery_table, get_tablename_colname,
    new_session_id, sub_tablename,
};
use crate::{BlendOptions, Error, Result};

pub(crate) struct BlendContext<'a> {
    pub db: &'a dyn Backend,
    pub blender: Option<&'a dyn Blender>,
    pub ingredients: &'a [Arc<dyn Ingredient>],
    pub options: &'a BlendOptions,
}

struct DispatchMatch {
    start: usize,
    end: usize,
    alias: String,
    parsed: ParsedIngredient,
    ingredient: Arc<dyn Ingredient>,
}

/// The recursive core of [`crate::blend`]. `cleanup_tables` is shared with
/// every recursive descendant and drained only by the outermost caller.
pub(crate) fn blend_inner(
    query: &str,
    ctx: &BlendContext,
    cleanup_tables: &mut IndexSet<String>,
    prev_passed_values: usize,
) -> Result<Smoothie> {
    let started = Instant::now();
    let mut example_map_outputs: Vec<Vec<(String, String)>> = Vec::new();
    let mut naive_execution = false;

    let session_id = new_session_id(ctx.db)?;
    let mut kitchen = Kitchen::new(ctx.db, &session_id);
    kitchen.register(ctx.ingredients.iter().cloned())?;

    let Preprocessed {
        query,
        alias_to_parsed,
    } = preprocess(query);
    let mut query = query;

    let mut root: Query = match sqlast::parse_statement(&query) {
        Ok(statement) => sqlast::require_query(statement)?,
        Err(_) => {
            query = autowrap_query(&query, &kitchen, &alias_to_parsed)?;
            sqlast::require_query(sqlast::parse_statement(&query)?)?
        }
    };
    if !sqlast::query_contains_select(&root) {
        query = autowrap_query(&sqlast::print_query(&root), &kitchen, &alias_to_parsed)?;
        root = sqlast::require_query(sqlast::parse_statement(&query)?)?;
    }
    let original_query = sqlast::print_query(&root);
    query = original_query.clone();

    // No ingredient calls: plain SQL, straight to the backend.
    if kitchen.is_empty() || scan(&query).is_empty() {
        let table = ctx
            .db
            .execute_query(&query, ctx.options.silence_db_exec_errors)?;
        return Ok(Smoothie {
            table,
            meta: SmoothieMeta {
                process_time_seconds: started.elapsed().as_secs_f64(),
                num_values_passed: prev_passed_values,
                num_prompt_tokens: ctx.blender.map_or(0, |b| b.num_prompt_tokens()),
                prompts: ctx.blender.map_or_else(Vec::new, |b| b.prompts()),
                example_map_outputs,
                ingredients: kitchen.names(),
                query: original_query,
                db_identifier: ctx.db.identifier(),
                contains_ingredient: false,
            },
        });
    }

    let mut function_call_to_res: IndexMap<String, String> = IndexMap::new();
    let mut session_modified_tables: IndexSet<String> = IndexSet::new();
    let mut all_alias_to_tablename: IndexMap<String, String> = IndexMap::new();
    let mut sentinel_uuids: Vec<String> = Vec::new();
    let mut prev_passed = prev_passed_values;
    // Once any lower subquery has evaluated an ingredient, the current one is
    // ineligible for abstraction.
    let mut prev_subquery_has_ingredient = false;

    let subqueries = sqlast::collect_subqueries(&root);
    for (subquery_idx, info) in subqueries.into_iter().rev().enumerate() {
        let Some(subquery_node) = prepare_subquery_node(&info) else {
            continue;
        };
        let mut executed_subquery_ingredients: IndexSet<String> = IndexSet::new();
        let mut prev_subquery_map_columns: HashSet<String> = HashSet::new();
        let cte_binding = info
            .cte_alias
            .clone()
            .map(|alias| (alias, info.text.clone()));
        let mut scm =
            SubqueryContextManager::new(subquery_node, prev_subquery_has_ingredient, cte_binding);

        for (tablename, abstracted_query) in scm.abstracted_table_selects() {
            if let Some(aliased_subquery) = scm.pop_alias_subquery(&tablename) {
                // The alias has to exist as a real table before anything can
                // select from it, so flush the subquery through a recursive
                // blend first.
                set_subquery_to_alias(
                    &aliased_subquery,
                    &tablename,
                    &mut root,
                    &mut query,
                    ctx,
                    cleanup_tables,
                    &alias_to_parsed,
                    &mut prev_passed,
                    &sentinel_uuids,
                )?;
            }
            if naive_execution {
                continue;
            }
            if let Some(abstracted_query) = abstracted_query {
                let temp_table = get_temp_subquery_table(&session_id, subquery_idx, &tablename);
                log::debug!("executing `{abstracted_query}` into `{temp_table}`");
                match ctx.db.execute_query(&abstracted_query, false) {
                    Ok(table) => {
                        ctx.db.materialize(&temp_table, &table)?;
                        cleanup_tables.insert(temp_table);
                    }
                    Err(error) => {
                        log::debug!("abstracted select failed ({error}), falling back to naive execution");
                        naive_execution = true;
                    }
                }
            }
        }
        for (aliasname, aliased_subquery) in scm.drain_alias_subqueries() {
            set_subquery_to_alias(
                &aliased_subquery,
                &aliasname,
                &mut root,
                &mut query,
                ctx,
                cleanup_tables,
                &alias_to_parsed,
                &mut prev_passed,
                &sentinel_uuids,
            )?;
        }
        if prev_subquery_has_ingredient {
            scm.collapse_materialized_subqueries();
        }

        let subquery_str = scm.sql();
        // MAP outputs accumulate per base table; only once the whole
        // subquery is done do they merge into the session table.
        let mut tablename_to_map_out: IndexMap<String, Vec<Table>> = IndexMap::new();
        for dispatch in sorted_grammar_matches(&subquery_str, &alias_to_parsed, &kitchen)? {
            prev_subquery_has_ingredient = true;
            if executed_subquery_ingredients.contains(&dispatch.alias) {
                continue;
            }
            executed_subquery_ingredients.insert(dispatch.alias.clone());

            let mut args = dispatch.parsed.args.clone();
            let mut kwargs: IndexMap<String, String> =
                dispatch.parsed.kwargs.iter().cloned().collect();
            if let Some(overrides) = &ctx.options.blender_args {
                for (key, value) in overrides {
                    if kwargs.contains_key(key) {
                        log::debug!("overriding passed arg for '{key}'");
                    }
                    kwargs.insert(key.clone(), value.clone());
                }
            }

            let mut example_outputs = None;
            let mut context_table = None;
            match dispatch.ingredient.ingredient_type() {
                IngredientType::Map => {
                    if ctx.options.infer_map_constraints && !kwargs.contains_key("example_outputs")
                    {
                        let inferred = scm.infer_map_constraints(dispatch.start, dispatch.end);
                        if !inferred.is_empty() {
                            example_outputs = Some(inferred);
                        }
                    }
                }
                IngredientType::Qa => {
                    let context_arg = kwargs
                        .get("context")
                        .cloned()
                        .or_else(|| args.get(1).cloned())
                        .or_else(|| args.first().cloned())
                        .unwrap_or_default();
                    let upper = context_arg.trim_start().to_uppercase();
                    if upper.starts_with("SELECT") || upper.starts_with("WITH") {
                        // The context is itself a query: materialize it
                        // through a recursive blend and hand over the table.
                        let raw = disambiguate(&context_arg, &alias_to_parsed);
                        let smoothie = blend_inner(&raw, ctx, cleanup_tables, prev_passed)?;
                        prev_passed = smoothie.meta.num_values_passed;
                        context_table = Some(smoothie.table);
                        args.truncate(1);
                        kwargs.shift_remove("context");
                    }
                }
                _ => {}
            }

            // The kitchen carries the backend handle and session id into
            // every ingredient invocation.
            let call = IngredientCall {
                args,
                kwargs,
                context: context_table,
                example_outputs,
                table_to_title: ctx.options.table_to_title.as_ref(),
                blender: ctx.blender,
                db: kitchen.db(),
                session_id: kitchen.session_id(),
                subquery_idx,
                aliases_to_tablenames: scm.alias_to_tablename(),
                prev_subquery_map_columns: &prev_subquery_map_columns,
            };
            let output = dispatch.ingredient.run(&call)?;
            drop(call);

            match (dispatch.ingredient.ingredient_type(), output) {
                (
                    IngredientType::Map,
                    IngredientOutput::Map {
                        new_col,
                        tablename,
                        source_col,
                        table,
                    },
                ) => {
                    prev_subquery_map_columns.insert(new_col.clone());
                    example_map_outputs.push(map_examples(&table, &source_col, &new_col));
                    function_call_to_res.insert(
                        dispatch.alias.clone(),
                        format!("{}.{}", quote_ident(&tablename), quote_ident(&new_col)),
                    );
                    tablename_to_map_out
                        .entry(tablename.clone())
                        .or_default()
                        .push(table);
                    session_modified_tables.insert(tablename);
                }
                (IngredientType::Qa | IngredientType::String, IngredientOutput::Scalar(value)) => {
                    function_call_to_res.insert(dispatch.alias.clone(), value);
                }
                (
                    IngredientType::Join,
                    IngredientOutput::Join {
                        left_table,
                        right_table,
                        join_clause,
                        temp_join_table,
                    },
                ) => {
                    log::debug!("joined `{left_table}` to `{right_table}`");
                    cleanup_tables.insert(temp_join_table);
                    let letters = alias_letters(&dispatch.alias);
                    let in_join =
                        transforms::count_ingredients_in_containing_join(&mut root, &letters);
                    if in_join > 1 {
                        // Other ingredients still live in this ON clause;
                        // keep them behind a sentinel projection.
                        let sentinel = uuid::Uuid::new_v4().to_string();
                        transforms::replace_join_with_ingredient_multiple(
                            &mut root, &letters, &sentinel,
                        )?;
                        sentinel_uuids.push(sentinel);
                        transforms::prune_true_where(&mut root);
                    } else {
                        transforms::replace_join_with_ingredient_single(&mut root, &letters)?;
                    }
                    query = sync_query(&root, &sentinel_uuids);
                    function_call_to_res.insert(dispatch.alias.clone(), join_clause);
                }
                (ingredient_type, output) => {
                    return Err(Error::invariant(format!(
                        "{ingredient_type} ingredient `{}` returned a mismatched {} output",
                        dispatch.parsed.function_name,
                        output_kind(&output),
                    )));
                }
            }
            if naive_execution {
                break;
            }
        }

        for (tablename, map_outputs) in tablename_to_map_out {
            merge_map_outputs(
                ctx.db,
                &session_id,
                &tablename,
                &map_outputs,
                cleanup_tables,
            )?;
        }
        for (alias, tablename) in scm.alias_to_tablename() {
            all_alias_to_tablename.insert(alias.clone(), tablename.clone());
        }
    }

    // Resolve every placeholder to its value, then point modified tables
    // (and their aliases) at the session temp tables.
    for (alias, resolved) in &function_call_to_res {
        query = query.replace(alias.as_str(), resolved);
    }
    for tablename in &session_modified_tables {
        let temp = quote_ident(&get_temp_session_table(&session_id, tablename));
        query = sub_tablename(tablename, &temp, &query);
    }
    for (alias, tablename) in &all_alias_to_tablename {
        if session_modified_tables.contains(tablename) {
            let temp = quote_ident(&get_temp_session_table(&session_id, tablename));
            query = sub_tablename(alias, &temp, &query);
        }
    }
    log::debug!("final query:\n{query}");

    let table = ctx
        .db
        .execute_query(&query, ctx.options.silence_db_exec_errors)?;
    Ok(Smoothie {
        table,
        meta: SmoothieMeta {
            process_time_seconds: started.elapsed().as_secs_f64(),
            num_values_passed: kitchen.num_values_passed() + prev_passed,
            num_prompt_tokens: ctx.blender.map_or(0, |b| b.num_prompt_tokens()),
            prompts: ctx.blender.map_or_else(Vec::new, |b| b.prompts()),
            example_map_outputs,
            ingredients: kitchen.names(),
            query: original_query,
            db_identifier: ctx.db.identifier(),
            contains_ingredient: true,
        },
    })
}

/// Rewrites syntax the SQL parser cannot take as-is: a bare QA invocation is
/// wrapped in `SELECT CASE …`, and a JOIN invocation without a join target
/// gets its left table (from `left_on`) spliced in front of `ON`.
fn autowrap_query(
    query: &str,
    kitchen: &Kitchen,
    alias_to_parsed: &IndexMap<String, ParsedIngredient>,
) -> Result<String> {
    let mut query = query.to_string();
    let aliases: Vec<String> = scan(&query)
        .iter()
        .rev()
        .map(|m| query[m.start..m.end].to_string())
        .collect();
    for alias in aliases {
        let Some(parsed) = alias_to_parsed.get(&alias) else {
            continue;
        };
        let ingredient = kitchen.get(&parsed.function_name)?;
        match ingredient.ingredient_type() {
            IngredientType::Qa => {
                if !query.trim_start().to_lowercase().starts_with("select") {
                    query = query.replace(
                        &alias,
                        &format!("SELECT CASE WHEN FALSE THEN FALSE WHEN TRUE THEN {alias} END"),
                    );
                }
            }
            IngredientType::Join => {
                if let Some(left_on) = parsed.kwarg("left_on") {
                    let (left_table, _) = get_tablename_colname(left_on)?;
                    query = query.replace(&alias, &format!("{} ON {alias}", quote_ident(&left_table)));
                }
            }
            _ => {}
        }
    }
    Ok(query)
}

/// Restores raw ingredient text in place of aliases, for handing a query
/// fragment to a recursive blend.
fn disambiguate(query: &str, alias_to_parsed: &IndexMap<String, ParsedIngredient>) -> String {
    let mut query = query.to_string();
    for (alias, parsed) in alias_to_parsed {
        query = query.replace(alias.as_str(), &parsed.raw);
    }
    query
}

/// Prints the root with sentinel projections stripped back out.
fn sync_query(root: &Query, sentinel_uuids: &[String]) -> String {
    let mut query = sqlast::print_query(root);
    for sentinel in sentinel_uuids {
        query = query.replace(&format!("SELECT \"{sentinel}\", "), "");
    }
    query
}

/// Re-parses one collected subquery for local analysis, stripping CTEs. A
/// non-SELECT subquery is rebuilt over its parent SELECT's single table;
/// with several parent tables there is nothing sound to build, so the
/// subquery is skipped.
fn prepare_subquery_node(info: &SubqueryInfo) -> Option<Query> {
    let text = if info.is_select {
        info.text.clone()
    } else {
        match info.parent_tables.as_slice() {
            [table] => format!("SELECT * FROM {} WHERE ({})", quote_ident(table), info.text),
            _ => {
                log::debug!(
                    "subquery without SELECT and {} parent tables; skipping optimization",
                    info.parent_tables.len()
                );
                return None;
            }
        }
    };
    match sqlast::parse_query(&text) {
        Ok(mut node) => {
            transforms::remove_ctes(&mut node);
            Some(node)
        }
        Err(error) => {
            log::debug!("could not analyze subquery `{text}` ({error}); skipping");
            None
        }
    }
}

/// Grammar matches of one subquery in dispatch order: MAP first, then QA,
/// then JOIN; source order within a tier. Matches left over after the three
/// tiers (STRING ingredients) are never dispatched.
fn sorted_grammar_matches(
    query: &str,
    alias_to_parsed: &IndexMap<String, ParsedIngredient>,
    kitchen: &Kitchen,
) -> Result<Vec<DispatchMatch>> {
    let mut pending = scan(query);
    let mut out = Vec::new();
    for tier in [IngredientType::Map, IngredientType::Qa, IngredientType::Join] {
        let mut rest = Vec::new();
        for m in pending {
            let alias = query[m.start..m.end].to_string();
            let parsed = alias_to_parsed
                .get(&alias)
                .cloned()
                .unwrap_or_else(|| m.parsed.clone());
            let ingredient = kitchen.get(&parsed.function_name)?.clone();
            if ingredient.ingredient_type() == tier {
                out.push(DispatchMatch {
                    start: m.start,
                    end: m.end,
                    alias,
                    parsed,
                    ingredient,
                });
            } else {
                rest.push(m);
            }
        }
        pending = rest;
    }
    for m in pending {
        log::debug!(
            "ingredient `{}` is not dispatchable on any tier; leaving in place",
            &query[m.start..m.end]
        );
    }
    Ok(out)
}

/// Runs an aliased subquery through a recursive blend, writes the result
/// under the alias, and collapses the alias binding in the root query.
#[allow(clippy::too_many_arguments)]
fn set_subquery_to_alias(
    subquery_text: &str,
    aliasname: &str,
    root: &mut Query,
    query: &mut String,
    ctx: &BlendContext,
    cleanup_tables: &mut IndexSet<String>,
    alias_to_parsed: &IndexMap<String, ParsedIngredient>,
    prev_passed: &mut usize,
    sentinel_uuids: &[String],
) -> Result<()> {
    let raw = disambiguate(subquery_text, alias_to_parsed);
    log::debug!("executing `{raw}` and setting to `{aliasname}`");
    let smoothie = blend_inner(&raw, ctx, cleanup_tables, *prev_passed)?;
    *prev_passed = smoothie.meta.num_values_passed;
    ctx.db.materialize(aliasname, &smoothie.table)?;
    cleanup_tables.insert(aliasname.to_string());
    transforms::replace_subquery_with_alias(root, aliasname, subquery_text)?;
    transforms::prune_with(root);
    *query = sync_query(root, sentinel_uuids);
    Ok(())
}

/// `(source value, mapped value)` pairs for rows the map actually filled.
fn map_examples(table: &Table, source_col: &str, new_col: &str) -> Vec<(String, String)> {
    let (Some(source), Some(new)) = (table.column(source_col), table.column(new_col)) else {
        return Vec::new();
    };
    source
        .iter()
        .zip(new)
        .filter(|(_, v)| !matches!(v, crate::db::Value::Null))
        .map(|(s, v)| (value_to_text(s), value_to_text(v)))
        .collect()
}

/// Folds one subquery's MAP outputs into the session temp table for
/// `tablename`: column-concatenate, coalesce columns from earlier merges,
/// then left-merge on row index.
fn merge_map_outputs(
    db: &dyn Backend,
    session_id: &str,
    tablename: &str,
    map_outputs: &[Table],
    cleanup_tables: &mut IndexSet<String>,
) -> Result<()> {
    if map_outputs.is_empty() {
        return Ok(());
    }
    let original = db.execute_query(&format!("SELECT * FROM {}", quote_ident(tablename)), false)?;
    let session_table = get_temp_session_table(session_id, tablename);
    let mut base = if db.has_table(&session_table)? {
        db.execute_query(&format!("SELECT * FROM {}", quote_ident(&session_table)), false)?
    } else {
        original.clone()
    };
    let previously_added: Vec<String> = base
        .columns()
        .iter()
        .filter(|c| !original.has_column(c))
        .cloned()
        .collect();

    let mut merged_out = Table::concat_columns(map_outputs)?;
    if merged_out.len() != base.len() {
        return Err(Error::invariant(format!(
            "map output carries {} rows for `{tablename}` with {} rows",
            merged_out.len(),
            base.len()
        )));
    }
    // A column written by an earlier subquery may come back from this one
    // with gaps; the earlier values win where the new ones are null.
    for column in &previously_added {
        if merged_out.has_column(column) && base.has_column(column) {
            merged_out.fill_nulls_from(column, &base)?;
            base.remove_column(column);
        }
    }
    merged_out.retain_columns(|c| !base.has_column(c));
    let merged = base.hstack(&merged_out)?;
    db.materialize(&session_table, &merged)?;
    cleanup_tables.insert(session_table);
    Ok(())
}

fn output_kind(output: &IngredientOutput) -> &'static str {
    match output {
        IngredientOutput::Map { .. } => "map",
        IngredientOutput::Scalar(_) => "scalar",
        IngredientOutput::Join { .. } => "join",
    }
}
