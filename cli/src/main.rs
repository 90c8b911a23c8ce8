use std::env;
use std::fs;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tkl_ai::embeddings::ollama_embed::OllamaEmbedder;
use tkl_ai::extract::run_extraction;
use tkl_ai::index::{build_embeddings, EmbeddingConfig};
use tkl_ai::llm::ollama_llm::OllamaLlm;
use tkl_ai::llm::{Llm, DEFAULT_LLM_MODEL};
use tkl_ai::ollama::OllamaClient;
use tkl_ai::retrieve::{self, AskOptions, RetrievalMode, RetrieveConfig};
use tkl_core::cards::export_cards;
use tkl_core::chunking::{build_chunks, ChunkingConfig};
use tkl_core::db;
use tkl_core::domain::IngestWarning;
use tkl_core::error::AppError;
use tkl_core::ingest::{
    ingest_transcript_csv, ingest_transcript_text, preview_transcript_text, TranscriptMeta,
};
use tkl_core::normalize::parse_published_at;
use tkl_core::report;
use tkl_core::store::RowConflict;

const DEFAULT_DB: &str = "tkl.db";

#[derive(Parser, Debug)]
#[command(name = "tkl", version, about = "Technology knowledge library over podcast transcripts")]
struct Cli {
    /// SQLite database path (defaults to `TKL_DB_PATH` or `tkl.db`).
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Ingest a transcript file as one episode (safe to re-run).
    Ingest {
        /// Transcript file: speaker lines, or CSV with `--csv`.
        file: PathBuf,
        /// Stable source identifier; defaults to the file name.
        #[arg(long)]
        source_id: Option<String>,
        /// Episode title; defaults to the file stem.
        #[arg(long)]
        title: Option<String>,
        /// Show or feed name.
        #[arg(long)]
        show: Option<String>,
        /// Publication date, RFC3339 or YYYY-MM-DD.
        #[arg(long)]
        published: Option<String>,
        /// Source URL; enables per-segment timestamp links.
        #[arg(long)]
        url: Option<String>,
        /// Parse as CSV (speaker,start_secs,end_secs,text).
        #[arg(long)]
        csv: bool,
        /// Parse and report without writing anything.
        #[arg(long)]
        dry_run: bool,
        /// Skip knowledge extraction after storing segments.
        #[arg(long)]
        no_extract: bool,
    },
    /// Print a markdown report for one episode, or the library overview.
    Report {
        /// Episode id; omit for the library overview.
        episode: Option<i64>,
    },
    /// Answer a question from the library, with citations.
    Ask {
        question: String,
        /// Restrict evidence to one episode.
        #[arg(long)]
        episode: Option<i64>,
        /// Number of evidence items to cite.
        #[arg(long, default_value_t = retrieve::DEFAULT_K)]
        k: usize,
        /// `fast` (extractive) or `thorough` (model synthesis).
        #[arg(long, default_value = "fast")]
        mode: String,
        /// Print ranked candidates with score components.
        #[arg(long)]
        debug: bool,
    },
    /// Rank stored segments, chunks, assertions and cards against a query.
    Search {
        query: String,
        /// Restrict to one episode.
        #[arg(long)]
        episode: Option<i64>,
        /// Number of results.
        #[arg(long, default_value_t = retrieve::DEFAULT_K)]
        k: usize,
    },
    /// Build retrieval chunks (and embeddings) for an episode.
    BuildChunks {
        episode: i64,
        /// Token budget per chunk.
        #[arg(long, default_value_t = 800)]
        max_tokens: usize,
        /// Build chunks only; leave the embedding index untouched.
        #[arg(long)]
        skip_embeddings: bool,
    },
    /// Write one markdown file per tech card.
    ExportCards {
        /// Output directory.
        #[arg(long, default_value = "cards")]
        dir: PathBuf,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn main() {
    init_tracing();
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        match &e.details {
            Some(d) => eprintln!("error[{}]: {} ({d})", e.code, e.message),
            None => eprintln!("error[{}]: {}", e.code, e.message),
        }
        std::process::exit(1);
    }
}

fn db_path(cli_db: Option<PathBuf>) -> PathBuf {
    cli_db.unwrap_or_else(|| {
        env::var("TKL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_DB))
    })
}

fn llm_model() -> String {
    env::var("TKL_LLM_MODEL").unwrap_or_else(|_| DEFAULT_LLM_MODEL.to_string())
}

fn print_warnings(warnings: &[IngestWarning]) {
    for w in warnings {
        match &w.details {
            Some(d) => eprintln!("warning[{}]: {} ({d})", w.code, w.message),
            None => eprintln!("warning[{}]: {}", w.code, w.message),
        }
    }
}

fn print_conflicts(conflicts: &[RowConflict]) {
    for c in conflicts {
        eprintln!("conflict: {} '{}': {}", c.subject, c.name, c.reason);
    }
}

fn run(cli: Cli) -> Result<(), AppError> {
    let path = db_path(cli.db);
    let mut conn = db::open(&path)?;
    db::migrate(&mut conn)?;

    match cli.command {
        Commands::Ingest {
            file,
            source_id,
            title,
            show,
            published,
            url,
            csv,
            dry_run,
            no_extract,
        } => {
            let raw = fs::read_to_string(&file).map_err(|e| {
                AppError::new("INGEST_READ_FAILED", "Failed to read transcript file")
                    .with_details(format!("path={}; err={}", file.display(), e))
            })?;

            if dry_run {
                if csv {
                    return Err(AppError::new(
                        "INGEST_DRY_RUN_UNSUPPORTED",
                        "Dry run supports line transcripts only",
                    ));
                }
                let preview = preview_transcript_text(&raw)?;
                println!("format:   {}", preview.detected_format);
                println!("segments: {}", preview.segments);
                if !preview.speakers.is_empty() {
                    println!("speakers: {}", preview.speakers.join(", "));
                }
                print_warnings(&preview.warnings);
                return Ok(());
            }

            let published_at = match published.as_deref() {
                Some(raw_date) => match parse_published_at(raw_date) {
                    Some(ts) => Some(ts),
                    None => {
                        return Err(AppError::new(
                            "INGEST_BAD_DATE",
                            "Unrecognized publication date; use RFC3339 or YYYY-MM-DD",
                        )
                        .with_details(raw_date.to_string()))
                    }
                },
                None => None,
            };

            let source_id = source_id.unwrap_or_else(|| {
                file.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| file.display().to_string())
            });
            let title = title.unwrap_or_else(|| {
                file.file_stem()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| source_id.clone())
            });

            let meta = TranscriptMeta {
                source_id,
                title,
                show,
                published_at,
                url,
            };

            let summary = if csv {
                ingest_transcript_csv(&conn, &meta, &raw)?
            } else {
                ingest_transcript_text(&conn, &meta, &raw)?
            };

            println!(
                "episode {} ({}): {} segment(s) inserted, {} reused ({})",
                summary.episode_id,
                if summary.episode_created { "new" } else { "existing" },
                summary.segments_inserted,
                summary.segments_reused,
                summary.detected_format
            );
            print_warnings(&summary.warnings);

            if no_extract {
                return Ok(());
            }

            let client = OllamaClient::from_env()?;
            if let Err(e) = client.health_check() {
                eprintln!(
                    "warning[{}]: Ollama is not reachable; skipping extraction (re-run later or pass --no-extract)",
                    e.code
                );
                return Ok(());
            }
            let llm = OllamaLlm::new(client);
            let outcome = run_extraction(&conn, &llm, &llm_model(), summary.episode_id)?;
            println!(
                "extraction: {} topic(s), {} entity(ies) created, {} updated, {} assertion(s) inserted, {} deduped, {} card(s)",
                outcome.applied.topics_upserted,
                outcome.applied.entities_created,
                outcome.applied.entities_updated,
                outcome.applied.assertions_inserted,
                outcome.applied.assertions_deduped,
                outcome.cards_synthesized,
            );
            print_conflicts(&outcome.applied.conflicts);
            print_warnings(&outcome.applied.warnings);
            print_warnings(&outcome.warnings);
        }

        Commands::Report { episode } => {
            let text = match episode {
                Some(id) => report::generate_episode_report(&conn, id)?,
                None => report::library_overview(&conn)?,
            };
            println!("{text}");
        }

        Commands::Ask {
            question,
            episode,
            k,
            mode,
            debug,
        } => {
            let mode = match mode.as_str() {
                "fast" => RetrievalMode::Fast,
                "thorough" => RetrievalMode::Thorough,
                other => {
                    return Err(AppError::new(
                        "RETRIEVE_MODE_INVALID",
                        "Unknown retrieval mode; use fast or thorough",
                    )
                    .with_details(other.to_string()))
                }
            };

            let client = OllamaClient::from_env()?;
            let embedder = OllamaEmbedder::new(client.clone());
            let llm = OllamaLlm::new(client);
            let cfg = RetrieveConfig {
                k,
                embedding: EmbeddingConfig::from_env(),
                ..RetrieveConfig::default()
            };
            let opts = AskOptions {
                episode_id: episode,
                mode,
                llm_model: llm_model(),
                debug,
            };

            let resp = retrieve::ask(
                &conn,
                &embedder,
                Some(&llm as &dyn Llm),
                &cfg,
                &question,
                &opts,
            )?;

            if resp.fallback_lexical {
                eprintln!("warning: no embedding scoring available; ranked by keyword overlap");
            }
            println!("{}", resp.answer.trim_end());
            if !resp.citations.is_empty() {
                println!();
                println!("Sources:");
                for (i, c) in resp.citations.iter().enumerate() {
                    let mut line = format!("[{}] {}", i + 1, c.episode_title);
                    if let Some(speaker) = &c.speaker {
                        line.push_str(&format!(", {speaker}"));
                    }
                    if let Some(ts) = &c.timestamp {
                        line.push_str(&format!(" at {ts}"));
                    }
                    line.push_str(&format!(" (segment {})", c.segment_id));
                    println!("{line}");
                    println!("    \"{}\"", c.quote);
                    if let Some(link) = &c.link {
                        println!("    {link}");
                    }
                }
            }
            if let Some(candidates) = &resp.debug {
                let dump = serde_json::to_string_pretty(candidates).map_err(|e| {
                    AppError::new("RETRIEVE_DEBUG_FAILED", "Failed to render debug candidates")
                        .with_details(e.to_string())
                })?;
                eprintln!("{dump}");
            }
        }

        Commands::Search { query, episode, k } => {
            let client = OllamaClient::from_env()?;
            let embedder = OllamaEmbedder::new(client);
            let cfg = RetrieveConfig {
                k,
                embedding: EmbeddingConfig::from_env(),
                ..RetrieveConfig::default()
            };

            let resp = retrieve::search(&conn, &embedder, &cfg, &query, episode)?;
            if resp.fallback_lexical {
                eprintln!("warning: no embedding scoring available; ranked by keyword overlap");
            }
            if resp.hits.is_empty() {
                println!("no results");
            }
            for (i, hit) in resp.hits.iter().enumerate() {
                println!(
                    "{}. [{} {}] score {:.3} (similarity {:.3})",
                    i + 1,
                    hit.kind.as_str(),
                    hit.object_id,
                    hit.score,
                    hit.similarity
                );
                println!("   {}", hit.snippet);
                let c = &hit.citation;
                let mut line = format!("   {} segment {}", c.episode_title, c.segment_id);
                if let Some(ts) = &c.timestamp {
                    line.push_str(&format!(" at {ts}"));
                }
                println!("{line}");
            }
        }

        Commands::BuildChunks {
            episode,
            max_tokens,
            skip_embeddings,
        } => {
            let cfg = ChunkingConfig {
                max_tokens,
                ..ChunkingConfig::default()
            };
            let summary = build_chunks(&conn, episode, &cfg)?;
            println!(
                "chunks: {} planned, {} inserted, {} reused",
                summary.planned, summary.inserted, summary.reused
            );
            print_warnings(&summary.warnings);

            if skip_embeddings {
                return Ok(());
            }

            let client = OllamaClient::from_env()?;
            if let Err(e) = client.health_check() {
                eprintln!(
                    "warning[{}]: Ollama is not reachable; skipping embeddings (re-run later or pass --skip-embeddings)",
                    e.code
                );
                return Ok(());
            }
            let embedder = OllamaEmbedder::new(client);
            let built = build_embeddings(&conn, &embedder, &EmbeddingConfig::from_env(), Some(episode))?;
            println!(
                "embeddings: {} embedded, {} already present, {} failed",
                built.embedded, built.skipped_existing, built.failed
            );
            print_warnings(&built.warnings);
        }

        Commands::ExportCards { dir } => {
            let summary = export_cards(&conn, &dir)?;
            println!("wrote {} card(s) to {}", summary.written, dir.display());
            print_warnings(&summary.warnings);
        }
    }

    Ok(())
}
