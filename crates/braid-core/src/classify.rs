//! Session classification: mapping free-text sessions to strands.
//!
//! The real classifier is an external collaborator; the engine talks to
//! it through the [`Classifier`] trait and keeps an audit trail of its
//! decisions in `classification-log.json`. The built-in
//! [`KeywordClassifier`] matches strand keywords and names.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use braid_store::Data;

/// Confidence at or above which a classification is trusted outright.
pub const CONFIDENCE_THRESHOLD: f32 = 0.8;

const AUDIT_LOG_FILE: &str = "classification-log.json";

/// A classifier verdict.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    pub strand_id: Option<String>,
    pub confidence: f32,
}

impl Classification {
    pub fn none() -> Self {
        Self {
            strand_id: None,
            confidence: 0.0,
        }
    }

    pub fn is_confident(&self) -> bool {
        self.strand_id.is_some() && self.confidence >= CONFIDENCE_THRESHOLD
    }
}

/// The free-text session classifier interface.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, data: &Data, text: &str) -> Classification;
}

/// Default classifier: a strand keyword match is a strong signal, a
/// strand name match a weak one.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeywordClassifier;

#[async_trait]
impl Classifier for KeywordClassifier {
    async fn classify(&self, data: &Data, text: &str) -> Classification {
        let haystack = text.to_lowercase();
        let mut best = Classification::none();

        for strand in &data.strands {
            let keyword_hit = strand
                .keywords
                .iter()
                .any(|k| !k.is_empty() && haystack.contains(&k.to_lowercase()));
            let confidence = if keyword_hit {
                0.9
            } else if !strand.name.is_empty() && haystack.contains(&strand.name.to_lowercase()) {
                0.6
            } else {
                continue;
            };
            if confidence > best.confidence {
                best = Classification {
                    strand_id: Some(strand.id.clone()),
                    confidence,
                };
            }
        }

        best
    }
}

/// One audit entry in `classification-log.json` (newline-delimited).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub timestamp: i64,
    pub session_key: String,
    pub strand_id: Option<String>,
    pub confidence: f32,
}

/// Append a classification decision to the audit log. Best-effort.
pub fn append_audit(data_dir: &Path, entry: &AuditEntry) {
    use std::io::Write;
    let path = data_dir.join(AUDIT_LOG_FILE);
    let mut line = match serde_json::to_vec(entry) {
        Ok(line) => line,
        Err(_) => return,
    };
    line.push(b'\n');
    let result = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .and_then(|mut f| f.write_all(&line));
    if let Err(e) = result {
        tracing::warn!(path = %path.display(), error = %e, "failed to append classification audit");
    }
}
