pub mod cache;
pub mod config;
pub mod model;
pub mod pipeline;
pub mod providers;
pub mod retrieval;
pub mod router;
pub mod schema;
pub mod slots;
pub mod sqlgen;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use tracing::warn;

use cache::ResultCache;
use config::AppConfig;
use pipeline::{AnswerOutcome, Pipeline};
use providers::{CancelToken, EmbeddingProvider, GenerationProvider, HttpEmbedder, HttpGenerator, NullProvider};
use retrieval::{default_important_terms, HybridRetriever};
use router::{default_reference_bank, Router};
use schema::SchemaRegistry;
use slots::patterns::EnglishCues;
use slots::SlotExtractor;
use sqlgen::executor::SqliteExecutor;
use sqlgen::{default_examples, QueryGenerator};

/// Command-line interface.
#[derive(Parser, Debug)]
#[command(
    name = "crossway",
    version,
    about = "Hybrid natural-language question answering over traffic records and documents"
)]
pub struct Cli {
    /// Path to a TOML config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Answer a single question
    Ask {
        /// The question, as free text
        question: Vec<String>,

        /// Override the records database path
        #[arg(long)]
        db: Option<PathBuf>,

        /// Override the document index directory
        #[arg(long)]
        index_dir: Option<PathBuf>,

        /// Number of document results
        #[arg(long)]
        top_k: Option<usize>,
    },
    /// Generate SQL for each line of a question file, in parallel
    Batch {
        /// File with one question per line
        file: PathBuf,
    },
    /// Print query-cache statistics as JSON
    Stats,
    /// Generate shell completions to stdout
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Generate man page to stdout
    Man,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let mut cfg = AppConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Ask {
            question,
            db,
            index_dir,
            top_k,
        } => {
            if let Some(db) = db {
                cfg.db_path = Some(db);
            }
            if let Some(dir) = index_dir {
                cfg.index_dir = Some(dir);
            }
            if let Some(k) = top_k {
                cfg.top_k = Some(k);
            }
            let question = question.join(" ");
            if question.trim().is_empty() {
                anyhow::bail!("empty question");
            }
            let pipeline = build_pipeline(&cfg)?;
            let outcome = pipeline.answer(&question, &CancelToken::new());
            println!("{}", render_outcome(&outcome));
            Ok(())
        }
        Commands::Batch { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("read question file {file:?}"))?;
            let questions: Vec<String> = raw
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect();
            let pipeline = build_pipeline(&cfg)?;
            let queries = pipeline.generate_batch(&questions, &CancelToken::new());
            for (question, query) in questions.iter().zip(&queries) {
                println!(
                    "{}\t{}\t{}",
                    question,
                    if query.validated { "ok" } else { "unvalidated" },
                    query.text
                );
            }
            Ok(())
        }
        Commands::Stats => {
            let pipeline = build_pipeline(&cfg)?;
            let stats = pipeline.generator().cache_stats();
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "crossway", &mut std::io::stdout());
            Ok(())
        }
        Commands::Man => {
            let cmd = Cli::command();
            let man = clap_mangen::Man::new(cmd);
            let mut out = std::io::stdout();
            man.render(&mut out)?;
            Ok(())
        }
    }
}

/// Wire the service object from configuration. Providers degrade to
/// [`NullProvider`] when no endpoint is configured; a missing index starts
/// an empty document store.
pub fn build_pipeline(cfg: &AppConfig) -> Result<Pipeline> {
    let embedder: Arc<dyn EmbeddingProvider> = match &cfg.embed_endpoint {
        Some(url) => Arc::new(HttpEmbedder::new(url.clone(), cfg.embed_dimension)),
        None => Arc::new(NullProvider),
    };
    let llm: Arc<dyn GenerationProvider> = match &cfg.generate_endpoint {
        Some(url) => Arc::new(HttpGenerator::new(url.clone())),
        None => Arc::new(NullProvider),
    };

    let schema = Arc::new(SchemaRegistry::default_traffic());
    let cues = Arc::new(EnglishCues);

    let router = Router::new(
        Arc::clone(&embedder),
        cues.clone(),
        default_reference_bank(),
        cfg.router_config(),
    );

    let generator = QueryGenerator::new(
        SlotExtractor::new(Arc::clone(&schema), cues),
        schema,
        llm,
        Arc::new(SqliteExecutor::new(cfg.db_path())),
        Arc::new(ResultCache::default()),
        default_examples(),
        cfg.generator_config(),
    );

    let index_dir = cfg.index_dir();
    let retriever = if index_dir.join(retrieval::index::MANIFEST_FILE).is_file() {
        HybridRetriever::load(
            &index_dir,
            Arc::clone(&embedder),
            default_important_terms(),
            cfg.retriever_config(),
        )?
    } else {
        warn!(?index_dir, "no persisted document index; starting empty");
        HybridRetriever::from_chunks(
            Vec::new(),
            embedder,
            default_important_terms(),
            cfg.retriever_config(),
        )?
    };

    Ok(Pipeline::new(router, generator, retriever, cfg.top_k()))
}

/// Map each outcome to a user-facing message, exactly once.
pub fn render_outcome(outcome: &AnswerOutcome) -> String {
    match outcome {
        AnswerOutcome::Greeting { reply, .. } => (*reply).to_string(),
        AnswerOutcome::Structured {
            query, execution, ..
        } => {
            let mut out = format!("sql: {}\n", query.text);
            match execution {
                Some(Ok(result)) => {
                    out.push_str(&serde_json::to_string_pretty(result).unwrap_or_default());
                }
                Some(Err(err)) => {
                    out.push_str(&format!("execution failed: {err}"));
                }
                None => {
                    let reason = query.error.as_deref().unwrap_or("unvalidated query");
                    out.push_str(&format!("not executed: {reason}"));
                }
            }
            out
        }
        AnswerOutcome::Documents { results, .. } => {
            if results.is_empty() {
                return "no matching documents".to_string();
            }
            results
                .iter()
                .map(|r| format!("[{:.3}] {}: {}", r.score, r.chunk.id, r.chunk.content))
                .collect::<Vec<_>>()
                .join("\n")
        }
        AnswerOutcome::Unclear { decision } => format!(
            "could not classify the question (confidence {:.2}); try rephrasing",
            decision.confidence
        ),
    }
}
