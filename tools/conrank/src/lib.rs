//! # conrank CLI
//!
//! Command-line trainer and evaluator for content-based knowledge graph
//! completion. The model scores (head, relation, tail) triples from entity
//! descriptions and titles; evaluation ranks each test query's true tails
//! against the relation's full candidate pool with the filtered-rank
//! protocol and writes a per-relation metrics report.
//!
//! ## Commands
//!
//! - `train`: run the training loop over a dataset directory, writing
//!   step-stamped checkpoints
//! - `evaluate`: restore the latest checkpoint, rank every test relation,
//!   and write the metrics CSV
//!
//! ## Quick start
//!
//! ```bash
//! # Train with periodic checkpoints
//! conrank train --data data/fb15k --checkpoints ckpt/
//!
//! # Evaluate the latest checkpoint and write the report
//! conrank evaluate --data data/fb15k --checkpoints ckpt/ --output report.csv
//! ```
//!
//! Log verbosity follows `--verbose`/`--quiet`, or the `CONRANK_LOG` env
//! var (`tracing` filter syntax) when neither is given.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

pub mod commands;

/// conrank CLI application
#[derive(Parser)]
#[command(name = "conrank")]
#[command(about = "Content-based knowledge graph completion")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress all but error logging
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Train the model and write periodic checkpoints
    Train {
        /// Dataset directory
        #[arg(long)]
        data: PathBuf,
        /// Checkpoint directory
        #[arg(long)]
        checkpoints: PathBuf,
        /// Stop after this many optimizer steps
        #[arg(long)]
        steps: Option<u64>,
        /// Number of passes over the training triples
        #[arg(long, default_value = "50")]
        epochs: usize,
        /// Triples per optimizer step
        #[arg(long, default_value = "200")]
        batch_size: usize,
        /// Learning rate
        #[arg(long, default_value = "1e-4")]
        lr: f64,
        /// Description width in tokens
        #[arg(long, default_value = "256")]
        content_width: usize,
        /// Title width in tokens
        #[arg(long, default_value = "16")]
        title_width: usize,
    },
    /// Evaluate the latest checkpoint and write the metrics report
    Evaluate {
        /// Dataset directory
        #[arg(long)]
        data: PathBuf,
        /// Checkpoint directory
        #[arg(long)]
        checkpoints: PathBuf,
        /// Metrics CSV output path
        #[arg(long)]
        output: PathBuf,
        /// Description width in tokens
        #[arg(long, default_value = "256")]
        content_width: usize,
        /// Title width in tokens
        #[arg(long, default_value = "16")]
        title_width: usize,
        /// Seed for the random-baseline ranks
        #[arg(long)]
        seed: Option<u64>,
    },
}

/// Run the CLI
pub async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    init_logging(cli.verbose, cli.quiet);

    match cli.command {
        Commands::Train {
            data,
            checkpoints,
            steps,
            epochs,
            batch_size,
            lr,
            content_width,
            title_width,
        } => {
            commands::train::run(
                data,
                checkpoints,
                steps,
                epochs,
                batch_size,
                lr,
                content_width,
                title_width,
            )
            .await
        }
        Commands::Evaluate {
            data,
            checkpoints,
            output,
            content_width,
            title_width,
            seed,
        } => commands::evaluate::run(data, checkpoints, output, content_width, title_width, seed).await,
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else if quiet {
        EnvFilter::new("error")
    } else {
        EnvFilter::try_from_env("CONRANK_LOG").unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).try_init().ok();
}
