//! Prompt templates: validated loader plus the message-formatting helpers.
//!
//! A fixed set of named templates drives every planner-facing message. Each
//! template declares its required placeholders; loading fails loudly on a
//! missing template, a missing placeholder, or an undeclared one. `{{` and
//! `}}` escape to literal braces so templates can show brace-bearing
//! examples.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use crate::error::{Result, RlmError};

/// Delimiters framing raw document payloads inside prompts.
pub const UNTRUSTED_OPEN: &str = "<untrusted_document_content>";
pub const UNTRUSTED_CLOSE: &str = "</untrusted_document_content>";

struct TemplateSpec {
    name: &'static str,
    required: bool,
    placeholders: &'static [&'static str],
    default: &'static str,
}

const TEMPLATES: &[TemplateSpec] = &[
    TemplateSpec {
        name: "system.md",
        required: true,
        placeholders: &[],
        default: include_str!("../prompts/system.md"),
    },
    TemplateSpec {
        name: "context_metadata.md",
        required: true,
        placeholders: &["context_type", "context_total_length", "context_lengths"],
        default: include_str!("../prompts/context_metadata.md"),
    },
    TemplateSpec {
        name: "iteration_zero.md",
        required: true,
        placeholders: &["question"],
        default: include_str!("../prompts/iteration_zero.md"),
    },
    TemplateSpec {
        name: "iteration_continue.md",
        required: true,
        placeholders: &["question"],
        default: include_str!("../prompts/iteration_continue.md"),
    },
    TemplateSpec {
        name: "subcall.md",
        required: true,
        placeholders: &["instruction", "content"],
        default: include_str!("../prompts/subcall.md"),
    },
    TemplateSpec {
        name: "code_required.md",
        required: true,
        placeholders: &[],
        default: include_str!("../prompts/code_required.md"),
    },
    TemplateSpec {
        name: "verify_adversarial.md",
        required: false,
        placeholders: &["findings", "documents"],
        default: include_str!("../prompts/verify_adversarial.md"),
    },
    TemplateSpec {
        name: "verify_code.md",
        required: false,
        placeholders: &["previous_results", "findings", "documents"],
        default: include_str!("../prompts/verify_code.md"),
    },
];

/// Collect the placeholder names a template uses, honoring `{{ }}` escapes.
fn scan_placeholders(name: &str, template: &str) -> Result<HashSet<String>> {
    let mut found = HashSet::new();
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' => {
                if chars.peek() == Some(&'{') {
                    chars.next();
                    continue;
                }
                let mut ident = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) if c.is_ascii_alphanumeric() || c == '_' => ident.push(c),
                        _ => {
                            return Err(RlmError::Prompt(format!(
                                "{name}: malformed placeholder near '{{{ident}'"
                            )));
                        }
                    }
                }
                found.insert(ident);
            }
            '}' => {
                if chars.peek() == Some(&'}') {
                    chars.next();
                } else {
                    return Err(RlmError::Prompt(format!("{name}: unmatched '}}'")));
                }
            }
            _ => {}
        }
    }
    Ok(found)
}

/// Substitute named parameters, unescaping `{{`/`}}` to literal braces.
fn render_template(
    name: &str,
    template: &str,
    params: &HashMap<&str, String>,
) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' => {
                if chars.peek() == Some(&'{') {
                    chars.next();
                    out.push('{');
                    continue;
                }
                let mut ident = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => ident.push(c),
                        None => {
                            return Err(RlmError::Prompt(format!(
                                "{name}: unterminated placeholder"
                            )));
                        }
                    }
                }
                match params.get(ident.as_str()) {
                    Some(value) => out.push_str(value),
                    None => {
                        return Err(RlmError::Prompt(format!(
                            "{name}: no value for placeholder '{{{ident}}}'"
                        )));
                    }
                }
            }
            '}' => {
                if chars.peek() == Some(&'}') {
                    chars.next();
                }
                out.push('}');
            }
            c => out.push(c),
        }
    }
    Ok(out)
}

/// Loads and renders the engine's prompt templates.
#[derive(Debug)]
pub struct PromptLoader {
    templates: HashMap<&'static str, String>,
}

impl PromptLoader {
    /// Load the crate's embedded default templates.
    pub fn embedded() -> Self {
        let templates = TEMPLATES
            .iter()
            .map(|spec| (spec.name, spec.default.to_string()))
            .collect();
        // The embedded set is validated by tests; a panic here would be a
        // packaging bug, not a runtime condition.
        let loader = Self { templates };
        debug_assert!(loader.validate().is_ok());
        loader
    }

    /// Load templates from a directory, validating names and placeholders.
    ///
    /// Required templates must all exist; the verify templates are
    /// optional and simply absent when their files are missing.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(RlmError::Prompt(format!(
                "Prompts directory not found: {}",
                dir.display()
            )));
        }

        let mut templates = HashMap::new();
        for spec in TEMPLATES {
            let path = dir.join(spec.name);
            match std::fs::read_to_string(&path) {
                Ok(content) => {
                    templates.insert(spec.name, content);
                }
                Err(_) if !spec.required => {}
                Err(_) => {
                    return Err(RlmError::Prompt(format!(
                        "Required prompt file not found: {}",
                        path.display()
                    )));
                }
            }
        }

        let loader = Self { templates };
        loader.validate()?;
        Ok(loader)
    }

    /// Check every loaded template against its declared placeholder set.
    fn validate(&self) -> Result<()> {
        for spec in TEMPLATES {
            let Some(template) = self.templates.get(spec.name) else {
                continue;
            };
            let found = scan_placeholders(spec.name, template)?;
            let declared: HashSet<String> =
                spec.placeholders.iter().map(|p| p.to_string()).collect();
            for missing in declared.difference(&found) {
                return Err(RlmError::Prompt(format!(
                    "{}: missing required placeholder '{{{missing}}}'",
                    spec.name
                )));
            }
            for extra in found.difference(&declared) {
                return Err(RlmError::Prompt(format!(
                    "{}: undeclared placeholder '{{{extra}}}'",
                    spec.name
                )));
            }
        }
        Ok(())
    }

    /// The raw (unrendered) text of a template, if loaded.
    pub fn raw_template(&self, name: &str) -> Option<&str> {
        self.templates.get(name).map(|s| s.as_str())
    }

    fn render(&self, name: &'static str, params: &[(&'static str, String)]) -> Result<String> {
        let template = self
            .templates
            .get(name)
            .ok_or_else(|| RlmError::Prompt(format!("Template not loaded: {name}")))?;
        let params: HashMap<&str, String> = params.iter().cloned().collect();
        render_template(name, template, &params)
    }

    pub fn render_system_prompt(&self) -> Result<String> {
        self.render("system.md", &[])
    }

    pub fn render_context_metadata(
        &self,
        context_type: &str,
        context_total_length: usize,
        context_lengths: &str,
    ) -> Result<String> {
        self.render(
            "context_metadata.md",
            &[
                ("context_type", context_type.to_string()),
                ("context_total_length", context_total_length.to_string()),
                ("context_lengths", context_lengths.to_string()),
            ],
        )
    }

    pub fn render_iteration_zero(&self, question: &str) -> Result<String> {
        self.render("iteration_zero.md", &[("question", question.to_string())])
    }

    pub fn render_iteration_continue(&self, question: &str) -> Result<String> {
        self.render(
            "iteration_continue.md",
            &[("question", question.to_string())],
        )
    }

    pub fn render_subcall_prompt(&self, instruction: &str, content: &str) -> Result<String> {
        self.render(
            "subcall.md",
            &[
                ("instruction", instruction.to_string()),
                ("content", content.to_string()),
            ],
        )
    }

    pub fn render_code_required(&self) -> Result<String> {
        self.render("code_required.md", &[])
    }

    pub fn render_verify_adversarial(&self, findings: &str, documents: &str) -> Result<String> {
        self.render(
            "verify_adversarial.md",
            &[
                ("findings", findings.to_string()),
                ("documents", documents.to_string()),
            ],
        )
    }

    pub fn render_verify_code(
        &self,
        previous_results: &str,
        findings: &str,
        documents: &str,
    ) -> Result<String> {
        self.render(
            "verify_code.md",
            &[
                ("previous_results", previous_results.to_string()),
                ("findings", findings.to_string()),
                ("documents", documents.to_string()),
            ],
        )
    }
}

impl Default for PromptLoader {
    fn default() -> Self {
        Self::embedded()
    }
}

// ---------------------------------------------------------------------------
// Message formatting helpers
// ---------------------------------------------------------------------------

/// Wrap raw payload in the untrusted-content delimiters. Never truncates.
pub fn wrap_subcall_content(content: &str) -> String {
    format!("{UNTRUSTED_OPEN}\n{content}\n{UNTRUSTED_CLOSE}")
}

pub(crate) fn format_thousands(n: usize) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Truncate one code block's output to the configured cap.
///
/// The marker names both the cap and the original size and points the
/// planner at sub-LLM queries: the cap is a forcing function, not a
/// convenience.
pub fn truncate_code_output(output: &str, max_chars: usize) -> String {
    let total = output.chars().count();
    if total <= max_chars {
        return output.to_string();
    }
    let kept: String = output.chars().take(max_chars).collect();
    format!(
        "{kept}\n[output truncated to {} of {} chars - use llm_query() to analyze content beyond this limit]",
        format_thousands(max_chars),
        format_thousands(total),
    )
}

/// Build the synthetic user message echoing an executed code block.
pub fn format_code_echo(
    code: &str,
    output: &str,
    vars: Option<&BTreeMap<String, String>>,
    boundary: Option<&str>,
) -> String {
    let body = match boundary {
        Some(boundary) => format!("{boundary}_BEGIN\n{output}\n{boundary}_END"),
        None => output.to_string(),
    };
    let mut echo = format!("Code executed:\n```python\n{code}\n```\n\nREPL output:\n{body}");
    if let Some(vars) = vars {
        let entries: Vec<String> = vars
            .iter()
            .map(|(name, type_name)| format!("'{name}': '{type_name}'"))
            .collect();
        echo.push_str(&format!("\n\nREPL variables: {{{}}}", entries.join(", ")));
    }
    echo
}
