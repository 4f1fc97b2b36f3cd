//! Retrieval seam for a medical knowledge base.
//!
//! The runtime only consumes ranked snippets; building and storing the index
//! is the implementor's business.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One ranked search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeHit {
    pub content: String,
    /// Similarity score; higher is more relevant.
    pub score: f32,
    /// Source category, e.g. `"guideline"`, `"drug"`, `"condition"`.
    #[serde(rename = "type")]
    pub kind: String,
}

#[async_trait]
pub trait KnowledgeBase: Send + Sync {
    /// Up to `top_k` hits for `query`, best first.
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<KnowledgeHit>>;
}

/// In-memory keyword matcher.  Scores each entry by the fraction of query
/// words it contains; handy for tests and offline demos.
#[derive(Debug, Clone, Default)]
pub struct StaticKnowledgeBase {
    entries: Vec<(String, String)>,
}

impl StaticKnowledgeBase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(mut self, kind: impl Into<String>, content: impl Into<String>) -> Self {
        self.entries.push((kind.into(), content.into()));
        self
    }
}

#[async_trait]
impl KnowledgeBase for StaticKnowledgeBase {
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<KnowledgeHit>> {
        let query = crate::classifier::normalize(query);
        let words: Vec<&str> = query
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.chars().count() > 3)
            .collect();
        if words.is_empty() {
            return Ok(Vec::new());
        }

        let mut hits: Vec<KnowledgeHit> = self
            .entries
            .iter()
            .filter_map(|(kind, content)| {
                let haystack = crate::classifier::normalize(content);
                let matched = words.iter().filter(|w| haystack.contains(**w)).count();
                (matched > 0).then(|| KnowledgeHit {
                    content: content.clone(),
                    score: matched as f32 / words.len() as f32,
                    kind: kind.clone(),
                })
            })
            .collect();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(top_k);
        Ok(hits)
    }
}
