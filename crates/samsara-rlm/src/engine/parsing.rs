//! Planner-reply parsing: code-block extraction and bare final markers.

use std::sync::OnceLock;

use regex::Regex;

fn repl_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```repl[ \t]*\n(.*?)\n```").unwrap())
}

fn final_var_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?ms)^\s*FINAL_VAR\((.*?)\)").unwrap())
}

fn final_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?ms)^\s*FINAL\((.*)\)\s*$").unwrap())
}

fn ident_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap())
}

/// Keywords of the sandbox language; never variable names.
const KEYWORDS: &[&str] = &["True", "False", "None"];

/// Extract the contents of ```repl fenced blocks, in order. No other fence
/// kinds count.
pub fn extract_code_blocks(text: &str) -> Vec<String> {
    repl_block_re()
        .captures_iter(text)
        .map(|c| c[1].to_string())
        .collect()
}

/// A bare final marker found in planner text outside code blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BareFinal {
    /// Use the text as the answer verbatim.
    Literal(String),
    /// Look the identifier up in the sandbox and answer with its printed
    /// value.
    Var(String),
}

fn is_plain_identifier(text: &str) -> bool {
    ident_re().is_match(text) && !KEYWORDS.contains(&text)
}

/// Find a bare `FINAL(...)` or `FINAL_VAR(...)` in a planner reply.
///
/// Code blocks are stripped first (markers inside them belong to the
/// executor). `FINAL_VAR` only yields a variable reference when its
/// argument is a single non-keyword identifier; anything else falls back
/// to a literal. `FINAL` matches greedily so nested parentheses survive,
/// and a bare identifier argument is resolved as a variable, not returned
/// as the literal string.
pub fn find_final_answer(text: &str) -> Option<BareFinal> {
    let stripped = repl_block_re().replace_all(text, "");

    if let Some(captures) = final_var_re().captures(&stripped) {
        let inner = captures[1]
            .trim()
            .trim_matches('"')
            .trim_matches('\'')
            .to_string();
        if is_plain_identifier(&inner) {
            return Some(BareFinal::Var(inner));
        }
        return Some(BareFinal::Literal(inner));
    }

    if let Some(captures) = final_re().captures(&stripped) {
        let inner = captures[1].trim().to_string();
        if is_plain_identifier(&inner) {
            return Some(BareFinal::Var(inner));
        }
        return Some(BareFinal::Literal(inner));
    }

    None
}
