//! Recognizer for ingredient invocations embedded in SQL text.
//!
//! An invocation looks like `{{NAME('arg', …, key=value, …)}}`: an identifier,
//! a parenthesized argument list of positional string arguments followed by
//! keyword arguments, all wrapped in double braces. Positional arguments may
//! themselves be parenthesized SQL subqueries, so parentheses are balanced
//! inside arguments — but not inside string literals.

use chumsky::{error::Cheap, prelude::*};
use serde::Serialize;

/// One ingredient invocation, parsed out of SQL text.
///
/// `raw` is the verbatim source substring; it is the identity of the
/// invocation (the same raw text appearing twice shares one placeholder).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedIngredient {
    /// Uppercased ingredient name.
    pub function_name: String,
    /// Positional arguments, unquoted.
    pub args: Vec<String>,
    /// Keyword arguments in source order, values unquoted.
    pub kwargs: Vec<(String, String)>,
    /// The original source substring, preserved verbatim.
    pub raw: String,
}

impl ParsedIngredient {
    pub fn kwarg(&self, key: &str) -> Option<&str> {
        self.kwargs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// A grammar match with byte offsets into the scanned text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngredientMatch {
    pub start: usize,
    pub end: usize,
    pub parsed: ParsedIngredient,
}

#[derive(Debug, Clone)]
enum Arg {
    Positional(String),
    Keyword(String, String),
}

fn ident_part() -> impl Parser<char, String, Error = Cheap<char>> + Clone {
    filter(|c: &char| c.is_alphabetic() || *c == '_')
        .chain(filter(|c: &char| c.is_alphanumeric() || *c == '_').repeated())
        .collect()
}

/// A quoted string, kept verbatim including its quotes. Doubled quotes stand
/// for a literal quote character, as in SQL.
fn quoted_chunk(quote: char) -> impl Parser<char, Vec<char>, Error = Cheap<char>> + Clone {
    let escaped = just(quote).chain(just(quote));
    let body = escaped
        .or(none_of(quote).map(|c| vec![c]))
        .repeated()
        .flatten();
    just(quote).map(|c| vec![c]).chain::<char, _, _>(body).chain(just(quote))
}

/// A single argument value: everything up to a top-level `,` or `)`, with
/// parentheses balanced and string literals passed over opaquely.
fn value_chunk() -> impl Parser<char, String, Error = Cheap<char>> {
    let quoted = quoted_chunk('\'').or(quoted_chunk('"'));

    // Inside parentheses commas are plain content.
    let nested = recursive(|nested| {
        let parens = just('(')
            .map(|c| vec![c])
            .chain::<char, _, _>(nested.repeated().flatten())
            .chain(just(')'));
        choice((
            quoted.clone(),
            parens,
            none_of("()'\"").repeated().at_least(1),
        ))
    });

    let parens = just('(')
        .map(|c| vec![c])
        .chain::<char, _, _>(nested.repeated().flatten())
        .chain(just(')'));

    choice((
        quoted,
        parens,
        none_of("(),'\"").repeated().at_least(1),
    ))
    .repeated()
    .at_least(1)
    .flatten()
    .collect::<String>()
    .map(|s| s.trim().to_string())
}

/// Parses one full invocation starting at the beginning of the input, and
/// reports how many characters it consumed.
fn ingredient_call() -> impl Parser<char, ((String, Vec<Arg>), usize), Error = Cheap<char>> {
    let kwarg = ident_part()
        .then_ignore(just('=').padded())
        .then(value_chunk())
        .map(|(k, v)| Arg::Keyword(k, v));
    let positional = value_chunk().map(Arg::Positional);
    let arg = kwarg.or(positional).padded();

    just('{')
        .then(just('{'))
        .ignore_then(ident_part().padded())
        .then(
            arg.separated_by(just(','))
                .delimited_by(just('('), just(')')),
        )
        .then_ignore(text::whitespace())
        .then_ignore(just('}').then(just('}')))
        .map_with_span(|out, span: std::ops::Range<usize>| (out, span.end))
}

/// Translates a char count into a byte offset within `s`.
fn char_to_byte(s: &str, chars: usize) -> usize {
    s.char_indices().nth(chars).map_or(s.len(), |(i, _)| i)
}

/// Strips one layer of matching quotes, collapsing doubled quotes. Values
/// that are not a single quoted literal come back unchanged.
fn unquote(value: &str) -> String {
    for quote in ['\'', '"'] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            let doubled: String = [quote, quote].iter().collect();
            let collapsed = value[1..value.len() - 1].replace(&doubled, "\u{0}");
            if !collapsed.contains(quote) {
                return collapsed.replace('\u{0}', &quote.to_string());
            }
        }
    }
    value.to_string()
}

/// Finds all ingredient invocations in `text`, left to right, non-overlapping.
///
/// The raw substring between each match's offsets is preserved verbatim;
/// text that superficially resembles an invocation but does not parse is
/// skipped over without an error.
pub fn scan(text: &str) -> Vec<IngredientMatch> {
    let parser = ingredient_call();
    let mut matches = Vec::new();
    let mut at = 0;
    while let Some(found) = text[at..].find("{{") {
        let start = at + found;
        match parser.parse(&text[start..]) {
            Ok(((name, args), consumed)) => {
                let end = start + char_to_byte(&text[start..], consumed);
                let raw = text[start..end].to_string();
                let mut positional = Vec::new();
                let mut kwargs = Vec::new();
                for arg in args {
                    match arg {
                        Arg::Positional(v) => positional.push(unquote(&v)),
                        Arg::Keyword(k, v) => kwargs.push((k, unquote(&v))),
                    }
                }
                matches.push(IngredientMatch {
                    start,
                    end,
                    parsed: ParsedIngredient {
                        function_name: name.to_uppercase(),
                        args: positional,
                        kwargs,
                        raw,
                    },
                });
                at = end;
            }
            Err(_) => at = start + 2,
        }
    }
    matches
}
