//! Hybrid (vector + keyword) document retrieval.
//!
//! Candidates come from the normalized-vector index (2×top_k of them),
//! get a hybrid score of weighted vector similarity and keyword density,
//! then pass through a similarity floor and word-set Jaccard duplicate
//! suppression before the top_k cut. When the embedding provider is down
//! and only query text is available, ranking degrades to keyword density
//! over the whole store rather than failing.

pub mod index;
pub mod keyword;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, warn};

use crate::model::{DocumentChunk, RetrievalResult};
use crate::providers::{CancelToken, EmbeddingProvider, ProviderError};
use index::{ChunkIndex, MetadataFilter, Quantization};
use keyword::{jaccard_similarity, keyword_score, normalize_scores};

/// Retrieval weights and thresholds. Empirically fixed; override rather
/// than re-derive.
#[derive(Debug, Clone)]
pub struct RetrieverConfig {
    pub vector_weight: f32,
    pub keyword_weight: f32,
    /// Raw-similarity floor for candidates.
    pub similarity_threshold: f32,
    /// Jaccard similarity at or above this marks a duplicate.
    pub dedup_threshold: f32,
    /// Candidate pool size as a multiple of top_k.
    pub candidate_factor: usize,
    pub embed_timeout: Duration,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            vector_weight: 0.6,
            keyword_weight: 0.4,
            similarity_threshold: 0.1,
            dedup_threshold: 0.8,
            candidate_factor: 2,
            embed_timeout: crate::providers::DEFAULT_EMBED_TIMEOUT,
        }
    }
}

/// Important-terms list for the shipped traffic deployment.
pub fn default_important_terms() -> Vec<String> {
    [
        "signal", "intersection", "district", "timing", "pedestrian", "crosswalk",
        "maintenance", "detector", "corridor", "volume", "speed", "safety",
        "retiming", "phase",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Query input: raw text (embedded on demand) or a precomputed embedding.
#[derive(Debug, Clone)]
pub enum SearchInput<'a> {
    Text(&'a str),
    Embedding(Vec<f32>),
}

pub struct HybridRetriever {
    index: ChunkIndex,
    embedder: Arc<dyn EmbeddingProvider>,
    important_terms: Vec<String>,
    cfg: RetrieverConfig,
}

impl HybridRetriever {
    pub fn new(
        index: ChunkIndex,
        embedder: Arc<dyn EmbeddingProvider>,
        important_terms: Vec<String>,
        cfg: RetrieverConfig,
    ) -> Self {
        Self {
            index,
            embedder,
            important_terms,
            cfg,
        }
    }

    /// Build an in-memory retriever from ingested chunks (f32, normalized).
    pub fn from_chunks(
        chunks: Vec<DocumentChunk>,
        embedder: Arc<dyn EmbeddingProvider>,
        important_terms: Vec<String>,
        cfg: RetrieverConfig,
    ) -> Result<Self> {
        let index = ChunkIndex::build(chunks, Quantization::F32, true)?;
        Ok(Self::new(index, embedder, important_terms, cfg))
    }

    pub fn save(&self, dir: &std::path::Path) -> Result<()> {
        self.index.save(dir)
    }

    pub fn load(
        dir: &std::path::Path,
        embedder: Arc<dyn EmbeddingProvider>,
        important_terms: Vec<String>,
        cfg: RetrieverConfig,
    ) -> Result<Self> {
        let index = ChunkIndex::load(dir)?;
        Ok(Self::new(index, embedder, important_terms, cfg))
    }

    pub fn chunk_count(&self) -> usize {
        self.index.len()
    }

    /// Rank chunks for a query. Never more than `top_k` results, never two
    /// results with near-identical content.
    pub fn search(
        &self,
        input: SearchInput<'_>,
        top_k: usize,
        filter: Option<&MetadataFilter>,
        cancel: &CancelToken,
    ) -> Result<Vec<RetrievalResult>> {
        if top_k == 0 || self.index.is_empty() {
            return Ok(Vec::new());
        }
        if cancel.is_cancelled() {
            // Partial work is discarded, not cached.
            return Ok(Vec::new());
        }

        let query = match input {
            SearchInput::Embedding(mut v) => {
                index::l2_normalize(&mut v);
                v
            }
            SearchInput::Text(text) => {
                match self.embedder.embed(text, self.cfg.embed_timeout, cancel) {
                    Ok(mut v) => {
                        index::l2_normalize(&mut v);
                        v
                    }
                    Err(ProviderError::Cancelled) => return Ok(Vec::new()),
                    Err(err) => {
                        warn!(error = %err, "embedding unavailable; keyword-only retrieval");
                        return Ok(self.keyword_only(text, top_k, filter));
                    }
                }
            }
        };

        let candidate_count = top_k.saturating_mul(self.cfg.candidate_factor.max(1));
        let hits = self.index.search_top_k(&query, candidate_count, filter)?;
        if cancel.is_cancelled() {
            return Ok(Vec::new());
        }

        // Hybrid score: weighted normalized similarity + keyword density.
        let similarities: Vec<f32> = hits.iter().map(|h| h.similarity).collect();
        let normalized = normalize_scores(&similarities);
        let mut scored: Vec<(index::IndexHit, f32)> = hits
            .into_iter()
            .zip(normalized)
            .map(|(hit, norm)| {
                let chunk = self.index.chunk(hit.row).expect("hit row in range");
                let kw = keyword_score(&chunk.content, &self.important_terms);
                let hybrid = self.cfg.vector_weight * norm + self.cfg.keyword_weight * kw;
                (hit, hybrid)
            })
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.row.cmp(&b.0.row)));

        let accepted = self.dedup_pass(
            scored
                .into_iter()
                .filter(|(hit, _)| hit.similarity >= self.cfg.similarity_threshold)
                .map(|(hit, score)| {
                    let chunk = Arc::clone(self.index.chunk(hit.row).expect("hit row in range"));
                    RetrievalResult { chunk, score }
                }),
            top_k,
        );
        debug!(results = accepted.len(), top_k, "search_done");
        Ok(accepted)
    }

    /// Degraded path: rank every (filtered) chunk by keyword density only.
    fn keyword_only(
        &self,
        text: &str,
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Vec<RetrievalResult> {
        // The question's own words count as important terms here, so the
        // scan still tracks the query rather than the global term list.
        let mut terms = self.important_terms.clone();
        terms.extend(
            text.to_lowercase()
                .split(|c: char| !c.is_alphanumeric())
                .filter(|w| w.len() > 3)
                .map(str::to_string),
        );

        let mut scored: Vec<RetrievalResult> = (0..self.index.len())
            .filter_map(|row| self.index.chunk(row))
            .filter(|chunk| filter.map_or(true, |f| f.matches(chunk)))
            .map(|chunk| RetrievalResult {
                chunk: Arc::clone(chunk),
                score: keyword_score(&chunk.content, &terms),
            })
            .filter(|r| r.score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.chunk.id.cmp(&b.chunk.id)));
        self.dedup_pass(scored.into_iter(), top_k)
    }

    /// Accept in score order; a candidate must stay below the duplicate
    /// threshold against every already-accepted result (the higher-scored
    /// member of a duplicate pair survives).
    fn dedup_pass(
        &self,
        ordered: impl Iterator<Item = RetrievalResult>,
        top_k: usize,
    ) -> Vec<RetrievalResult> {
        let mut accepted: Vec<RetrievalResult> = Vec::with_capacity(top_k);
        for candidate in ordered {
            if accepted.len() >= top_k {
                break;
            }
            let duplicate = accepted.iter().any(|kept| {
                jaccard_similarity(&kept.chunk.content, &candidate.chunk.content)
                    >= self.cfg.dedup_threshold
            });
            if !duplicate {
                accepted.push(candidate);
            }
        }
        accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::NullProvider;
    use std::collections::BTreeMap;

    struct FixedEmbedder(Vec<f32>);

    impl EmbeddingProvider for FixedEmbedder {
        fn embed(
            &self,
            _text: &str,
            _timeout: Duration,
            cancel: &CancelToken,
        ) -> Result<Vec<f32>, ProviderError> {
            cancel.check()?;
            Ok(self.0.clone())
        }
    }

    fn chunk(id: &str, content: &str, embedding: Vec<f32>) -> DocumentChunk {
        DocumentChunk {
            id: id.into(),
            content: content.into(),
            embedding,
            metadata: BTreeMap::new(),
        }
    }

    fn retriever(chunks: Vec<DocumentChunk>) -> HybridRetriever {
        HybridRetriever::from_chunks(
            chunks,
            Arc::new(NullProvider),
            default_important_terms(),
            RetrieverConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn returns_at_most_top_k() {
        let chunks = (0..10)
            .map(|i| {
                chunk(
                    &format!("c{i}"),
                    &format!("unique content number {i} about corridor {i}"),
                    vec![1.0, i as f32 * 0.1, 0.3],
                )
            })
            .collect();
        let r = retriever(chunks);
        let results = r
            .search(
                SearchInput::Embedding(vec![1.0, 0.2, 0.3]),
                4,
                None,
                &CancelToken::new(),
            )
            .unwrap();
        assert!(results.len() <= 4);
        // Sorted descending.
        for pair in results.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[test]
    fn near_duplicates_are_suppressed() {
        // Rows 3 and 7 share almost identical content; 3 scores higher.
        let mut chunks = Vec::new();
        for i in 0..10 {
            let (content, embedding) = if i == 3 {
                (
                    "the signal timing plan for the riverside corridor was updated during march"
                        .to_string(),
                    vec![1.0, 0.0, 0.0],
                )
            } else if i == 7 {
                (
                    "the signal timing plan for the riverside corridor was updated during april"
                        .to_string(),
                    vec![0.95, 0.1, 0.0],
                )
            } else {
                (
                    format!("chunk {i} discusses topic {i} alone xyz{i}"),
                    vec![0.2, 0.8, i as f32 * 0.05],
                )
            };
            chunks.push(chunk(&format!("c{i}"), &content, embedding));
        }
        let r = retriever(chunks);
        let results = r
            .search(
                SearchInput::Embedding(vec![1.0, 0.0, 0.0]),
                5,
                None,
                &CancelToken::new(),
            )
            .unwrap();
        let ids: Vec<&str> = results.iter().map(|r| r.chunk.id.as_str()).collect();
        assert!(ids.contains(&"c3"));
        assert!(!ids.contains(&"c7"));
        // No surviving pair is near-identical.
        for (i, a) in results.iter().enumerate() {
            for b in &results[i + 1..] {
                assert!(jaccard_similarity(&a.chunk.content, &b.chunk.content) < 0.8);
            }
        }
    }

    #[test]
    fn text_query_uses_the_embedding_provider() {
        let chunks = vec![
            chunk("a", "corridor study", vec![1.0, 0.0]),
            chunk("b", "district report", vec![0.0, 1.0]),
        ];
        let r = HybridRetriever::from_chunks(
            chunks,
            Arc::new(FixedEmbedder(vec![1.0, 0.0])),
            default_important_terms(),
            RetrieverConfig::default(),
        )
        .unwrap();
        let results = r
            .search(SearchInput::Text("anything"), 1, None, &CancelToken::new())
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk.id, "a");
    }

    #[test]
    fn provider_outage_degrades_to_keyword_ranking() {
        let chunks = vec![
            chunk("a", "signal retiming policy for the downtown corridor", vec![1.0, 0.0]),
            chunk("b", "unrelated lunch menu options", vec![0.0, 1.0]),
        ];
        let r = retriever(chunks);
        let results = r
            .search(
                SearchInput::Text("signal retiming policy"),
                2,
                None,
                &CancelToken::new(),
            )
            .unwrap();
        assert!(!results.is_empty());
        assert_eq!(results[0].chunk.id, "a");
    }

    #[test]
    fn cancelled_search_returns_empty() {
        let chunks = vec![chunk("a", "anything", vec![1.0, 0.0])];
        let r = retriever(chunks);
        let cancel = CancelToken::new();
        cancel.cancel();
        let results = r
            .search(SearchInput::Text("anything"), 3, None, &cancel)
            .unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn metadata_filter_restricts_results() {
        let mut a = chunk("a", "riverside corridor study", vec![1.0, 0.0]);
        a.metadata.insert("district".into(), "riverside".into());
        let mut b = chunk("b", "northgate corridor study report", vec![1.0, 0.0]);
        b.metadata.insert("district".into(), "northgate".into());

        let r = retriever(vec![a, b]);
        let mut filter = MetadataFilter::default();
        filter.equals.insert("district".into(), "northgate".into());
        let results = r
            .search(
                SearchInput::Embedding(vec![1.0, 0.0]),
                5,
                Some(&filter),
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk.id, "b");
    }

    #[test]
    fn similarity_floor_drops_weak_candidates() {
        let chunks = vec![
            chunk("strong", "corridor report", vec![1.0, 0.0]),
            chunk("weak", "orthogonal content entirely", vec![0.0, 1.0]),
        ];
        let r = retriever(chunks);
        let results = r
            .search(
                SearchInput::Embedding(vec![1.0, 0.0]),
                5,
                None,
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk.id, "strong");
    }
}
