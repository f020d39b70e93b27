//! Guest value model.
//!
//! The sandbox language has a small set of typed values. Booleans print as
//! `True`/`False` and lists print with repr'd elements so output reads the
//! way the planner-facing prompt documents it.

use std::collections::BTreeMap;

/// Builtin functions seeded into the guest namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Print,
    Len,
    Str,
    Callable,
    Join,
    Chunk,
    Head,
    Count,
    Find,
    Contains,
    FindInContext,
    LlmQuery,
    LlmQueryBatched,
    Final,
    FinalVar,
    ShowVars,
}

impl Builtin {
    pub fn name(&self) -> &'static str {
        match self {
            Builtin::Print => "print",
            Builtin::Len => "len",
            Builtin::Str => "str",
            Builtin::Callable => "callable",
            Builtin::Join => "join",
            Builtin::Chunk => "chunk",
            Builtin::Head => "head",
            Builtin::Count => "count",
            Builtin::Find => "find",
            Builtin::Contains => "contains",
            Builtin::FindInContext => "find_in_context",
            Builtin::LlmQuery => "llm_query",
            Builtin::LlmQueryBatched => "llm_query_batched",
            Builtin::Final => "FINAL",
            Builtin::FinalVar => "FINAL_VAR",
            Builtin::ShowVars => "SHOW_VARS",
        }
    }

    pub fn all() -> &'static [Builtin] {
        &[
            Builtin::Print,
            Builtin::Len,
            Builtin::Str,
            Builtin::Callable,
            Builtin::Join,
            Builtin::Chunk,
            Builtin::Head,
            Builtin::Count,
            Builtin::Find,
            Builtin::Contains,
            Builtin::FindInContext,
            Builtin::LlmQuery,
            Builtin::LlmQueryBatched,
            Builtin::Final,
            Builtin::FinalVar,
            Builtin::ShowVars,
        ]
    }
}

/// A typed guest value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Int(i64),
    Bool(bool),
    List(Vec<Value>),
    None,
    Builtin(Builtin),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Str(_) => "str",
            Value::Int(_) => "int",
            Value::Bool(_) => "bool",
            Value::List(_) => "list",
            Value::None => "NoneType",
            Value::Builtin(_) => "builtin",
        }
    }

    /// The printed form: what `print` and `str()` produce.
    pub fn str_form(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            Value::Int(n) => n.to_string(),
            Value::Bool(true) => "True".to_string(),
            Value::Bool(false) => "False".to_string(),
            Value::List(items) => {
                let inner: Vec<String> = items.iter().map(|v| v.repr()).collect();
                format!("[{}]", inner.join(", "))
            }
            Value::None => "None".to_string(),
            Value::Builtin(b) => format!("<builtin {}>", b.name()),
        }
    }

    /// The quoted form used inside list displays.
    pub fn repr(&self) -> String {
        match self {
            Value::Str(s) => {
                let escaped = s.replace('\\', "\\\\").replace('\'', "\\'");
                format!("'{escaped}'")
            }
            other => other.str_form(),
        }
    }

    pub fn is_callable(&self) -> bool {
        matches!(self, Value::Builtin(_))
    }
}

/// The persistent named-bindings mapping for one sandbox.
pub type Namespace = BTreeMap<String, Value>;

/// Seed (or re-seed) the builtin bindings.
pub fn register_builtins(ns: &mut Namespace) {
    for builtin in Builtin::all() {
        ns.insert(builtin.name().to_string(), Value::Builtin(*builtin));
    }
}

/// Whether a binding is user-visible: neither private nor a builtin.
///
/// `context` counts as a builtin binding even though it is data.
pub fn is_user_var(name: &str, value: &Value) -> bool {
    !name.starts_with('_') && name != "context" && !matches!(value, Value::Builtin(_))
}

/// User-visible bindings with their type names, sorted by name.
pub fn list_user_vars(ns: &Namespace) -> BTreeMap<String, String> {
    ns.iter()
        .filter(|(name, value)| is_user_var(name, value))
        .map(|(name, value)| (name.clone(), value.type_name().to_string()))
        .collect()
}

/// Human-readable listing of user bindings for `SHOW_VARS()`.
pub fn show_vars(ns: &Namespace) -> String {
    let vars = list_user_vars(ns);
    if vars.is_empty() {
        return "No variables created yet. Use ```repl``` blocks to create variables.".to_string();
    }
    let entries: Vec<String> = vars
        .iter()
        .map(|(name, type_name)| format!("'{name}': '{type_name}'"))
        .collect();
    format!("Available variables: {{{}}}", entries.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bool_prints_python_style() {
        assert_eq!(Value::Bool(true).str_form(), "True");
        assert_eq!(Value::Bool(false).str_form(), "False");
    }

    #[test]
    fn test_list_prints_with_reprs() {
        let list = Value::List(vec![
            Value::Str("a".to_string()),
            Value::Int(2),
            Value::Bool(false),
        ]);
        assert_eq!(list.str_form(), "['a', 2, False]");
    }

    #[test]
    fn test_repr_escapes_quotes() {
        let v = Value::Str("it's".to_string());
        assert_eq!(v.repr(), "'it\\'s'");
    }

    #[test]
    fn test_register_builtins_inserts_all() {
        let mut ns = Namespace::new();
        register_builtins(&mut ns);
        assert!(matches!(ns.get("FINAL"), Some(Value::Builtin(Builtin::Final))));
        assert!(matches!(
            ns.get("llm_query_batched"),
            Some(Value::Builtin(Builtin::LlmQueryBatched))
        ));
        assert_eq!(ns.len(), Builtin::all().len());
    }

    #[test]
    fn test_list_user_vars_excludes_builtins_and_private() {
        let mut ns = Namespace::new();
        register_builtins(&mut ns);
        ns.insert("context".to_string(), Value::List(vec![]));
        ns.insert("_hidden".to_string(), Value::Int(1));
        ns.insert("answer".to_string(), Value::Str("x".to_string()));

        let vars = list_user_vars(&ns);
        assert_eq!(vars.len(), 1);
        assert_eq!(vars.get("answer").unwrap(), "str");
    }

    #[test]
    fn test_show_vars_empty_hint() {
        let mut ns = Namespace::new();
        register_builtins(&mut ns);
        assert!(show_vars(&ns).contains("No variables created yet"));
    }

    #[test]
    fn test_show_vars_lists_types() {
        let mut ns = Namespace::new();
        register_builtins(&mut ns);
        ns.insert("x".to_string(), Value::Int(42));
        ns.insert("name".to_string(), Value::Str("hi".to_string()));

        let listing = show_vars(&ns);
        assert!(listing.contains("'x': 'int'"));
        assert!(listing.contains("'name': 'str'"));
    }
}
