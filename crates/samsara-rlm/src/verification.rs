//! Mechanical citation verification.
//!
//! After a final answer, the engine can run a verification snippet in the
//! still-warm sandbox and parse its stdout into a structured result. The
//! verifier is a capability trait injected by the host; the default
//! implementation probes double-quoted spans from the answer against the
//! bound documents. Verification never alters the answer.

use serde::{Deserialize, Serialize};

use crate::error::{Result, RlmError};

/// One checked citation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    /// Index of the document the quote was found in, or -1.
    pub doc_id: i64,
    pub found: bool,
}

/// Outcome of a citation-verification pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub citations: Vec<Citation>,
    pub quotes: Vec<String>,
}

impl VerificationResult {
    pub fn all_valid(&self) -> bool {
        self.citations.iter().all(|c| c.found)
    }
}

/// A prepared verification run: the snippet to execute plus the quotes it
/// probes, in probe order.
#[derive(Debug, Clone)]
pub struct VerificationPlan {
    pub code: String,
    pub quotes: Vec<String>,
}

/// Capability trait for citation verification.
pub trait CitationVerifier: Send + Sync {
    /// Build the sandbox snippet for an answer. `None` means there is
    /// nothing worth verifying.
    fn plan(&self, answer: &str) -> Option<VerificationPlan>;

    /// Parse the snippet's stdout back into a structured result.
    fn parse_output(&self, plan: &VerificationPlan, stdout: &str) -> Result<VerificationResult>;
}

/// Minimum quote length worth probing; shorter spans match everywhere.
const MIN_QUOTE_CHARS: usize = 12;

/// Default verifier: probes double-quoted spans from the answer with
/// `find_in_context`, one probe per line of output.
#[derive(Debug, Default, Clone)]
pub struct QuoteCitationVerifier;

impl QuoteCitationVerifier {
    pub fn new() -> Self {
        Self
    }

    fn extract_quotes(answer: &str) -> Vec<String> {
        let mut quotes = Vec::new();
        let mut rest = answer;
        while let Some(open) = rest.find('"') {
            let after = &rest[open + 1..];
            let Some(close) = after.find('"') else { break };
            let quote = &after[..close];
            if quote.chars().count() >= MIN_QUOTE_CHARS && !quote.contains('\n') {
                quotes.push(quote.to_string());
            }
            rest = &after[close + 1..];
        }
        quotes
    }

    fn escape(quote: &str) -> String {
        quote.replace('\\', "\\\\").replace('"', "\\\"")
    }
}

impl CitationVerifier for QuoteCitationVerifier {
    fn plan(&self, answer: &str) -> Option<VerificationPlan> {
        let quotes = Self::extract_quotes(answer);
        if quotes.is_empty() {
            return None;
        }
        let code = quotes
            .iter()
            .map(|q| format!("print(find_in_context(\"{}\"))", Self::escape(q)))
            .collect::<Vec<_>>()
            .join("\n");
        Some(VerificationPlan { code, quotes })
    }

    fn parse_output(&self, plan: &VerificationPlan, stdout: &str) -> Result<VerificationResult> {
        let indices: Vec<i64> = stdout
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                line.trim()
                    .parse::<i64>()
                    .map_err(|_| RlmError::Serialization(format!("bad probe line: {line:?}")))
            })
            .collect::<Result<_>>()?;
        if indices.len() != plan.quotes.len() {
            return Err(RlmError::Serialization(format!(
                "expected {} probe lines, got {}",
                plan.quotes.len(),
                indices.len()
            )));
        }
        Ok(VerificationResult {
            citations: indices
                .iter()
                .map(|&doc_id| Citation {
                    doc_id,
                    found: doc_id >= 0,
                })
                .collect(),
            quotes: plan.quotes.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_quotes_skips_short_spans() {
        let quotes = QuoteCitationVerifier::extract_quotes(
            "The text says \"a short bit\" and also \"this span is long enough to probe\".",
        );
        assert_eq!(quotes, vec!["this span is long enough to probe"]);
    }

    #[test]
    fn test_plan_none_without_quotes() {
        let verifier = QuoteCitationVerifier::new();
        assert!(verifier.plan("No quoted spans here.").is_none());
    }

    #[test]
    fn test_plan_builds_one_probe_per_quote() {
        let verifier = QuoteCitationVerifier::new();
        let plan = verifier
            .plan("It claims \"the first long quoted span\" and \"the second long quoted span\".")
            .unwrap();
        assert_eq!(plan.quotes.len(), 2);
        assert_eq!(plan.code.lines().count(), 2);
        assert!(plan.code.contains("find_in_context(\"the first long quoted span\")"));
    }

    #[test]
    fn test_plan_escapes_backslashes() {
        let verifier = QuoteCitationVerifier::new();
        let plan = verifier.plan("Quote: \"path\\to\\some\\file here\"").unwrap();
        assert!(plan.code.contains("path\\\\to\\\\some\\\\file"));
    }

    #[test]
    fn test_parse_output_pairs_quotes_with_indices() {
        let verifier = QuoteCitationVerifier::new();
        let plan = VerificationPlan {
            code: String::new(),
            quotes: vec!["quote one is long".to_string(), "quote two is long".to_string()],
        };
        let result = verifier.parse_output(&plan, "0\n-1\n").unwrap();
        assert_eq!(result.citations.len(), 2);
        assert_eq!(result.citations[0], Citation { doc_id: 0, found: true });
        assert_eq!(result.citations[1], Citation { doc_id: -1, found: false });
        assert!(!result.all_valid());
    }

    #[test]
    fn test_parse_output_rejects_garbage() {
        let verifier = QuoteCitationVerifier::new();
        let plan = VerificationPlan {
            code: String::new(),
            quotes: vec!["a quote that is long".to_string()],
        };
        assert!(verifier.parse_output(&plan, "not a number\n").is_err());
        assert!(verifier.parse_output(&plan, "0\n1\n").is_err());
    }

    #[test]
    fn test_all_valid() {
        let result = VerificationResult {
            citations: vec![Citation { doc_id: 0, found: true }],
            quotes: vec!["q".to_string()],
        };
        assert!(result.all_valid());
    }
}
