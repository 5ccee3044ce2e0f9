//! Application configuration.
//!
//! Defaults → optional TOML file → `CROSSWAY_*` environment overrides, in
//! that order. The tuning sections carry the empirically fixed weights and
//! thresholds as named values; they are overridable but ship with the
//! canonical numbers.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::providers::GenerationOptions;
use crate::retrieval::RetrieverConfig;
use crate::router::RouterConfig;
use crate::sqlgen::GeneratorConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterTuning {
    pub min_confidence: f32,
    pub greeting_threshold: f32,
    pub structured_threshold: f32,
    pub document_threshold: f32,
}

impl Default for RouterTuning {
    fn default() -> Self {
        let d = RouterConfig::default();
        Self {
            min_confidence: d.min_confidence,
            greeting_threshold: d.greeting_threshold,
            structured_threshold: d.structured_threshold,
            document_threshold: d.document_threshold,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrieverTuning {
    pub vector_weight: f32,
    pub keyword_weight: f32,
    pub similarity_threshold: f32,
    pub dedup_threshold: f32,
}

impl Default for RetrieverTuning {
    fn default() -> Self {
        let d = RetrieverConfig::default();
        Self {
            vector_weight: d.vector_weight,
            keyword_weight: d.keyword_weight,
            similarity_threshold: d.similarity_threshold,
            dedup_threshold: d.dedup_threshold,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorTuning {
    pub fast_path_threshold: f32,
    pub max_llm_attempts: u32,
    pub cache_ttl_secs: u64,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for GeneratorTuning {
    fn default() -> Self {
        let d = GeneratorConfig::default();
        Self {
            fast_path_threshold: d.fast_path_threshold,
            max_llm_attempts: d.max_llm_attempts,
            cache_ttl_secs: d.cache_ttl.as_secs(),
            temperature: d.generation.temperature,
            max_tokens: d.generation.max_tokens,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// SQLite database with the business records.
    pub db_path: Option<PathBuf>,
    /// Directory holding the persisted retrieval index.
    pub index_dir: Option<PathBuf>,
    /// Base URL of the embedding endpoint; unset means keyword fallbacks.
    pub embed_endpoint: Option<String>,
    /// Base URL of the generation endpoint; unset means rule-based only.
    pub generate_endpoint: Option<String>,
    /// Expected embedding dimension, when known.
    pub embed_dimension: Option<usize>,
    /// Result count for document search.
    pub top_k: Option<usize>,
    pub router: RouterTuning,
    pub retriever: RetrieverTuning,
    pub generator: GeneratorTuning,
}

impl AppConfig {
    /// Load from a TOML file when given, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("read config file {path:?}"))?;
                toml::from_str(&raw).with_context(|| format!("parse config file {path:?}"))?
            }
            None => Self::default(),
        };
        cfg.apply_env();
        Ok(cfg)
    }

    /// `CROSSWAY_*` environment variables override file values.
    pub fn apply_env(&mut self) {
        if let Ok(v) = dotenvy::var("CROSSWAY_DB") {
            self.db_path = Some(PathBuf::from(v));
        }
        if let Ok(v) = dotenvy::var("CROSSWAY_INDEX_DIR") {
            self.index_dir = Some(PathBuf::from(v));
        }
        if let Ok(v) = dotenvy::var("CROSSWAY_EMBED_ENDPOINT") {
            self.embed_endpoint = Some(v);
        }
        if let Ok(v) = dotenvy::var("CROSSWAY_GENERATE_ENDPOINT") {
            self.generate_endpoint = Some(v);
        }
        if let Ok(v) = dotenvy::var("CROSSWAY_TOP_K") {
            if let Ok(k) = v.parse() {
                self.top_k = Some(k);
            }
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| default_data_dir().join("records.db"))
    }

    pub fn index_dir(&self) -> PathBuf {
        self.index_dir
            .clone()
            .unwrap_or_else(|| default_data_dir().join("doc_index"))
    }

    pub fn top_k(&self) -> usize {
        self.top_k.unwrap_or(5).max(1)
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            min_confidence: self.router.min_confidence,
            greeting_threshold: self.router.greeting_threshold,
            structured_threshold: self.router.structured_threshold,
            document_threshold: self.router.document_threshold,
            ..RouterConfig::default()
        }
    }

    pub fn retriever_config(&self) -> RetrieverConfig {
        RetrieverConfig {
            vector_weight: self.retriever.vector_weight,
            keyword_weight: self.retriever.keyword_weight,
            similarity_threshold: self.retriever.similarity_threshold,
            dedup_threshold: self.retriever.dedup_threshold,
            ..RetrieverConfig::default()
        }
    }

    pub fn generator_config(&self) -> GeneratorConfig {
        GeneratorConfig {
            fast_path_threshold: self.generator.fast_path_threshold,
            max_llm_attempts: self.generator.max_llm_attempts,
            cache_ttl: Duration::from_secs(self.generator.cache_ttl_secs),
            generation: GenerationOptions {
                temperature: self.generator.temperature,
                max_tokens: self.generator.max_tokens,
                ..GenerationOptions::default()
            },
        }
    }
}

pub fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("io", "crossway", "crossway")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".crossway"))
}
