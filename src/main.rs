//! # kb-ingest CLI (`kbi`)
//!
//! The `kbi` binary drives the ingestion pipeline: knowledge-base
//! lifecycle, incremental ingest, and per-KB statistics.
//!
//! ## Usage
//!
//! ```bash
//! kbi --config ./config/kbi.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kbi kb create <id>` | Create a knowledge base |
//! | `kbi kb delete <id>` | Delete a knowledge base and its index |
//! | `kbi kb rename <from> <to>` | Rename a knowledge base |
//! | `kbi kb list` | List knowledge bases |
//! | `kbi ingest --kb <id> <paths...>` | Ingest files incrementally |
//! | `kbi stats --kb <id>` | Show per-KB index statistics |
//!
//! ## Examples
//!
//! ```bash
//! kbi kb create docs
//! kbi ingest --kb docs ./manuals/*.pdf ./notes/*.md
//! kbi ingest --kb docs --force-reindex ./manuals/*.pdf
//! kbi stats --kb docs
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use kb_ingest::config::load_config;
use kb_ingest::embedding::create_embedder;
use kb_ingest::ingest::{run_ingest, Capabilities, IngestOptions, RunSummary};
use kb_ingest::kb;
use kb_ingest::models::FileStatus;
use kb_ingest::ocr::TesseractFactory;
use kb_ingest::progress::ProgressMode;
use kb_ingest::stats::run_stats;

/// kb-ingest CLI — an incremental, content-addressed document ingestion
/// pipeline for knowledge bases.
#[derive(Parser)]
#[command(
    name = "kbi",
    about = "kb-ingest — incremental document ingestion for knowledge bases",
    version,
    long_about = "kb-ingest routes PDFs, Office documents, text, and images through \
    extraction (with batch OCR fallback), chunks and embeds the text, and maintains a \
    content-addressed per-KB index so only changed files are re-ingested."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/kbi.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Knowledge-base lifecycle commands.
    #[command(subcommand)]
    Kb(KbCommands),

    /// Ingest files into a knowledge base.
    ///
    /// Classifies the inputs against the KB's stored content hashes and
    /// processes only new and modified files. PDFs whose direct text
    /// extraction comes up empty are routed through batch OCR.
    Ingest {
        /// Target knowledge base id.
        #[arg(long)]
        kb: String,

        /// Files to ingest.
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Re-ingest everything regardless of stored hashes.
        #[arg(long)]
        force_reindex: bool,

        /// Skip direct PDF text extraction and always OCR.
        #[arg(long)]
        force_ocr: bool,

        /// Progress output: auto, off, human, or json.
        #[arg(long, default_value = "auto")]
        progress: String,
    },

    /// Show index statistics for a knowledge base.
    Stats {
        /// Target knowledge base id.
        #[arg(long)]
        kb: String,
    },
}

#[derive(Subcommand)]
enum KbCommands {
    /// Create a knowledge base.
    Create { id: String },
    /// Delete a knowledge base and everything in it.
    Delete { id: String },
    /// Rename a knowledge base.
    Rename { from: String, to: String },
    /// List knowledge bases.
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Kb(command) => match command {
            KbCommands::Create { id } => {
                let dir = kb::create_kb(&config.kb.base_dir, &id)?;
                println!("created {} at {}", id, dir.display());
            }
            KbCommands::Delete { id } => {
                kb::delete_kb(&config.kb.base_dir, &id)?;
                println!("deleted {}", id);
            }
            KbCommands::Rename { from, to } => {
                kb::rename_kb(&config.kb.base_dir, &from, &to)?;
                println!("renamed {} -> {}", from, to);
            }
            KbCommands::List => {
                for name in kb::list_kbs(&config.kb.base_dir)? {
                    println!("{}", name);
                }
            }
        },
        Commands::Ingest {
            kb,
            paths,
            force_reindex,
            force_ocr,
            progress,
        } => {
            let mode = match progress.as_str() {
                "auto" => ProgressMode::default_for_tty(),
                "off" => ProgressMode::Off,
                "human" => ProgressMode::Human,
                "json" => ProgressMode::Json,
                other => anyhow::bail!("Unknown progress mode: {}", other),
            };

            let embedder = create_embedder(&config.embedding)?;
            let caps = Capabilities {
                embedder,
                ocr_factory: Arc::new(TesseractFactory),
            };
            let options = IngestOptions {
                force_reindex,
                force_ocr,
            };

            let paths: Vec<PathBuf> = paths
                .into_iter()
                .map(|p| std::fs::canonicalize(&p).unwrap_or(p))
                .collect();

            let reporter = mode.reporter();
            let summary =
                run_ingest(&config, &kb, &paths, &options, caps, reporter.as_ref()).await?;
            print_summary(&summary);
        }
        Commands::Stats { kb } => {
            run_stats(&config, &kb).await?;
        }
    }

    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!("ingest {}", summary.kb_id);
    println!("  files:       {}", summary.files.len());
    println!("  ingested:    {}", summary.count(FileStatus::Ingested));
    println!("  unchanged:   {}", summary.count(FileStatus::Unchanged));
    println!("  removed:     {}", summary.count(FileStatus::Removed));
    println!("  empty:       {}", summary.count(FileStatus::Empty));
    println!("  failed:      {}", summary.count(FileStatus::Failed));
    println!("  chunks:      {}", summary.pipeline.stored);
    if summary.ocr.pages_processed > 0 {
        println!(
            "  ocr pages:   {} ({:.1} pages/s, {} failure(s))",
            summary.ocr.pages_processed,
            summary.ocr.pages_per_second(),
            summary.ocr.failures
        );
    }
    println!("  duration:    {:.1}s", summary.duration_secs);

    let failures: Vec<_> = summary
        .files
        .iter()
        .filter(|f| f.status == FileStatus::Failed)
        .collect();
    if !failures.is_empty() {
        println!();
        println!("  failures:");
        for outcome in failures {
            println!(
                "    {}  {}  {}",
                outcome.path.display(),
                outcome.error.map(|k| k.as_str()).unwrap_or("ERROR"),
                outcome.reason.as_deref().unwrap_or("")
            );
        }
    }
    println!("ok");
}
