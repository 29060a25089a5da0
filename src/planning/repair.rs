//! Recoverable JSON parsing
//!
//! LLMs routinely emit almost-JSON. Each repair is an independent text
//! transform that returns a new candidate; the parser applies them in order
//! and re-runs the same parse + schema check after each one.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref TRAILING_COMMA: Regex = Regex::new(r",(\s*[}\]])").unwrap();
    static ref BARE_KEY: Regex = Regex::new(r#"([{,]\s*)([A-Za-z_][A-Za-z0-9_\-]*)(\s*:)"#).unwrap();
}

/// A single named repair
pub struct Repair {
    pub name: &'static str,
    pub apply: fn(&str) -> String,
}

/// Repairs in the order they are tried. Comments go first so a trailing
/// comma hidden behind a comment is visible to the next pass.
pub const REPAIRS: &[Repair] = &[
    Repair {
        name: "strip_comments",
        apply: strip_comments,
    },
    Repair {
        name: "strip_trailing_commas",
        apply: strip_trailing_commas,
    },
    Repair {
        name: "quote_bare_keys",
        apply: quote_bare_keys,
    },
    Repair {
        name: "single_to_double_quotes",
        apply: single_to_double_quotes,
    },
];

/// Remove `//` line comments and `/* */` block comments outside of strings
pub fn strip_comments(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut in_string: Option<char> = None;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if let Some(quote) = in_string {
            out.push(c);
            if c == '\\' && i + 1 < chars.len() {
                out.push(chars[i + 1]);
                i += 2;
                continue;
            }
            if c == quote {
                in_string = None;
            }
            i += 1;
            continue;
        }

        match (c, chars.get(i + 1)) {
            ('"', _) | ('\'', _) => {
                in_string = Some(c);
                out.push(c);
                i += 1;
            }
            ('/', Some('/')) => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            ('/', Some('*')) => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    i += 1;
                }
                // skip the closing "*/" (or run off the end of an unterminated comment)
                i = (i + 2).min(chars.len());
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    out
}

/// A run of input text: either structure, or one quoted string including its
/// quotes. An unterminated string runs to the end of the input.
enum Span<'a> {
    Code(&'a str),
    Quoted(char, &'a str),
}

fn spans(input: &str) -> Vec<Span<'_>> {
    let mut spans = Vec::new();
    let mut start = 0;
    let mut chars = input.char_indices();

    while let Some((i, c)) = chars.next() {
        if c != '"' && c != '\'' {
            continue;
        }
        if i > start {
            spans.push(Span::Code(&input[start..i]));
        }
        let mut end = input.len();
        while let Some((j, d)) = chars.next() {
            if d == '\\' {
                chars.next();
            } else if d == c {
                end = j + 1;
                break;
            }
        }
        spans.push(Span::Quoted(c, &input[i..end]));
        start = end;
    }

    if start < input.len() {
        spans.push(Span::Code(&input[start..]));
    }
    spans
}

/// Rewrite only the structural text, leaving string contents untouched
fn map_code(input: &str, f: impl Fn(&str) -> String) -> String {
    spans(input)
        .into_iter()
        .map(|span| match span {
            Span::Code(text) => f(text),
            Span::Quoted(_, text) => text.to_string(),
        })
        .collect()
}

pub fn strip_trailing_commas(input: &str) -> String {
    map_code(input, |code| TRAILING_COMMA.replace_all(code, "$1").into_owned())
}

pub fn quote_bare_keys(input: &str) -> String {
    map_code(input, |code| BARE_KEY.replace_all(code, r#"$1"$2"$3"#).into_owned())
}

pub fn single_to_double_quotes(input: &str) -> String {
    spans(input)
        .into_iter()
        .map(|span| match span {
            Span::Quoted('\'', text) if text.len() >= 2 && text.ends_with('\'') => {
                let inner = text[1..text.len() - 1]
                    .replace("\\'", "'")
                    .replace('"', "\\\"");
                format!("\"{}\"", inner)
            }
            Span::Code(text) | Span::Quoted(_, text) => text.to_string(),
        })
        .collect()
}
