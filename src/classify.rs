//! Intent classification for incoming mentions
//!
//! A cheap keyword heuristic runs first; the external classifier (an API
//! call behind the [`Classifier`] trait) is only consulted when the
//! heuristic is not confident enough. Heuristic ties break by fixed
//! category priority: fact-check precedes summary.

use crate::error::KaikuError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// What the author wants from the bot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    FactCheck,
    Summary,
    Unknown,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::FactCheck => "fact_check",
            Intent::Summary => "summary",
            Intent::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a classification came from
///
/// The router's conservative default only ever fires on the
/// `Classifier` path — see `Router::route`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationSource {
    Heuristic,
    Classifier,
    /// The external classifier call itself failed
    ClassifierError,
}

/// A classification result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub intent: Intent,
    pub confidence: f32,
    pub reason: String,
    pub source: ClassificationSource,
}

/// External classifier collaborator
///
/// Implementations wrap an AI API call; prompt construction and response
/// parsing live there, not in the core.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, content: &str) -> Result<Classification, KaikuError>;
}

const FACT_CHECK_KEYWORDS: &[&str] = &[
    "fact check",
    "fact-check",
    "factcheck",
    "is this true",
    "is that true",
    "verify this",
    "source?",
    "citation needed",
    "debunk",
];

const SUMMARY_KEYWORDS: &[&str] = &[
    "summarize",
    "summarise",
    "summary",
    "tl;dr",
    "tldr",
    "recap",
    "what's this about",
    "whats this about",
    "explain this thread",
];

/// Keyword-match heuristic classifier
///
/// Confidence grows with the number of matched phrases and saturates
/// below 1.0; zero matches yield `Unknown` at confidence 0.0.
pub struct KeywordClassifier;

impl KeywordClassifier {
    /// Classify by keyword match; synchronous and infallible
    pub fn classify(content: &str) -> Classification {
        let text = content.to_lowercase();
        let fact_hits = count_hits(&text, FACT_CHECK_KEYWORDS);
        let summary_hits = count_hits(&text, SUMMARY_KEYWORDS);

        // Tie-break by fixed priority: fact-check over summary.
        let (intent, hits) = if fact_hits >= summary_hits && fact_hits > 0 {
            (Intent::FactCheck, fact_hits)
        } else if summary_hits > 0 {
            (Intent::Summary, summary_hits)
        } else {
            return Classification {
                intent: Intent::Unknown,
                confidence: 0.0,
                reason: "no keyword matches".to_string(),
                source: ClassificationSource::Heuristic,
            };
        };

        let confidence = (0.6 + 0.15 * (hits as f32 - 1.0)).min(0.95);
        Classification {
            intent,
            confidence,
            reason: format!("{hits} keyword match(es)"),
            source: ClassificationSource::Heuristic,
        }
    }
}

fn count_hits(text: &str, keywords: &[&str]) -> usize {
    keywords.iter().filter(|k| text.contains(*k)).count()
}
