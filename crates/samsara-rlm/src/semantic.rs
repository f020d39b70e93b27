//! Semantic verification of final answers.
//!
//! Two LLM layers re-read the cited documents against the answer: layer 1
//! is adversarial review and always runs; layer 2 adds code-specific checks
//! and only runs when the corpus is classified as code. The engine drives
//! the layers; this module holds the data model and the pure helpers.

use serde::{Deserialize, Serialize};

use crate::error::{Result, RlmError};

/// Corpus classification driving layer-2 selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Code,
    General,
}

/// Per-finding confidence record parsed from a verification reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindingVerification {
    pub finding_id: String,
    pub original_claim: String,
    pub confidence: String,
    pub reason: String,
    pub evidence_classification: String,
    #[serde(default)]
    pub flags: Vec<String>,
}

/// Result of a semantic verification run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticVerificationReport {
    pub findings: Vec<FindingVerification>,
    pub content_kind: ContentKind,
}

impl SemanticVerificationReport {
    /// Findings with high or medium confidence.
    pub fn high_confidence(&self) -> Vec<&FindingVerification> {
        self.findings
            .iter()
            .filter(|f| f.confidence == "high" || f.confidence == "medium")
            .collect()
    }

    /// Findings with low confidence only.
    pub fn low_confidence(&self) -> Vec<&FindingVerification> {
        self.findings
            .iter()
            .filter(|f| f.confidence == "low")
            .collect()
    }
}

/// Recognized source-code extensions (lowercased).
const CODE_EXTENSIONS: &[&str] = &[
    "py", "pl", "pm", "t", "js", "jsx", "ts", "tsx", "rs", "go", "java", "c", "cc", "cpp", "h",
    "hpp", "rb", "php", "cs", "swift", "kt", "scala", "sh", "bash", "lua", "hs", "ml", "ex",
    "exs", "erl", "clj", "r", "sql",
];

fn is_code_name(name: &str) -> bool {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => {
            CODE_EXTENSIONS.contains(&ext.to_lowercase().as_str())
        }
        _ => false,
    }
}

/// Classify a corpus by its document names.
///
/// `Code` requires a strict majority of recognized source extensions;
/// extensionless names never count.
pub fn detect_content_kind(doc_names: &[String]) -> ContentKind {
    if doc_names.is_empty() {
        return ContentKind::General;
    }
    let code_count = doc_names.iter().filter(|n| is_code_name(n)).count();
    if code_count * 2 > doc_names.len() {
        ContentKind::Code
    } else {
        ContentKind::General
    }
}

/// Gather the documents whose names the answer mentions.
///
/// Returns `None` when no document is cited; verification is skipped in
/// that case rather than re-reading the whole corpus.
pub fn gather_cited_documents(
    answer: &str,
    documents: &[String],
    doc_names: &[String],
) -> Option<String> {
    let mut sections = Vec::new();
    for (name, doc) in doc_names.iter().zip(documents.iter()) {
        if !name.is_empty() && answer.contains(name.as_str()) {
            sections.push(format!("### {name}\n{doc}"));
        }
    }
    if sections.is_empty() {
        None
    } else {
        Some(sections.join("\n\n"))
    }
}

#[derive(Debug, Deserialize)]
struct FindingsEnvelope {
    #[serde(default)]
    findings: Vec<FindingVerification>,
}

/// Parse a verification reply into finding records.
///
/// Tolerates markdown fences and prose around the JSON object; a reply
/// with no parseable object is a serialization error the engine records as
/// an error step.
pub fn parse_verification_response(content: &str) -> Result<Vec<FindingVerification>> {
    let trimmed = content.trim();

    if let Ok(envelope) = serde_json::from_str::<FindingsEnvelope>(trimmed) {
        return Ok(envelope.findings);
    }

    let start = trimmed.find('{');
    let end = trimmed.rfind('}');
    if let (Some(start), Some(end)) = (start, end) {
        if start < end {
            let candidate = &trimmed[start..=end];
            let envelope: FindingsEnvelope = serde_json::from_str(candidate).map_err(|e| {
                RlmError::Serialization(format!("malformed verification reply: {e}"))
            })?;
            return Ok(envelope.findings);
        }
    }
    Err(RlmError::Serialization(
        "verification reply contained no JSON object".to_string(),
    ))
}
