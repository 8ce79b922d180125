//! The ingredient registry for one query.

use std::collections::HashSet;
use std::sync::Arc;

use crate::db::Backend;
use crate::ingredient::Ingredient;
use crate::{Error, Result};

/// A collection of ingredients bound to one backend and session. Lives for
/// the duration of a single top-level query.
pub struct Kitchen<'a> {
    db: &'a dyn Backend,
    session_id: String,
    ingredients: Vec<Arc<dyn Ingredient>>,
    names: HashSet<String>,
}

impl<'a> Kitchen<'a> {
    pub fn new(db: &'a dyn Backend, session_id: &str) -> Self {
        Kitchen {
            db,
            session_id: session_id.to_string(),
            ingredients: Vec::new(),
            names: HashSet::new(),
        }
    }

    /// Registers ingredients, asserting case-insensitive name uniqueness.
    pub fn register<I>(&mut self, ingredients: I) -> Result<()>
    where
        I: IntoIterator<Item = Arc<dyn Ingredient>>,
    {
        for ingredient in ingredients {
            let name = ingredient.name().to_uppercase();
            if !self.names.insert(name.clone()) {
                return Err(Error::DuplicateIngredient(name));
            }
            self.ingredients.push(ingredient);
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&Arc<dyn Ingredient>> {
        let wanted = name.to_uppercase();
        self.ingredients
            .iter()
            .find(|i| i.name().to_uppercase() == wanted)
            .ok_or(Error::UnknownIngredient(wanted))
    }

    pub fn is_empty(&self) -> bool {
        self.ingredients.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.ingredients
            .iter()
            .map(|i| i.name().to_uppercase())
            .collect()
    }

    /// Sum of per-ingredient value counters, for result metadata.
    pub fn num_values_passed(&self) -> usize {
        self.ingredients.iter().map(|i| i.num_values_passed()).sum()
    }

    pub fn db(&self) -> &'a dyn Backend {
        self.db
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}
