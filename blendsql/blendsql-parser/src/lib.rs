//! # blendsql-parser
//!
//! Grammar and preprocessor for the BlendSQL hybrid query language: the
//! `{{NAME(args, k=v, …)}}` ingredient syntax embedded in otherwise standard
//! SQL.
//!
//! The [grammar] module recognizes ingredient invocations in SQL text and
//! parses them into [`ParsedIngredient`] records with byte offsets. The
//! [preprocess] module substitutes a short placeholder alias for every unique
//! invocation, producing text the downstream SQL parser can carry opaquely.

pub mod grammar;
pub mod preprocess;

pub use grammar::{scan, IngredientMatch, ParsedIngredient};
pub use preprocess::{preprocess, AliasGenerator, Preprocessed};
