// ─────────────────────────────────────────────────────────────────────
// VE Calibration Kernel — Command Line
// (C) 1998-2026 Miroslav Sotek. All rights reserved.
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
#![deny(unsafe_code)]
//! `vecal`: analyze dyno logs, apply or roll back VE corrections, and
//! verify run manifests. Logs go to stderr; results go to stdout.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::EnvFilter;

use vecal_apply::{apply, rollback, ApplyRequest, RollbackRequest};
use vecal_artifacts::{parse_timestamp, sha256_file, verify_manifest};
use vecal_core::{run_analysis, AnalyzeOptions, RunSummary};
use vecal_types::{CalibrationConfig, VecalError, VecalResult};

#[derive(Debug, Parser)]
#[command(name = "vecal", version)]
#[command(about = "Deterministic VE table calibration from dyno logs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Ingest a dyno log and write a correction run directory.
    Analyze(AnalyzeArgs),
    /// Apply a correction grid to a base VE table.
    Apply(ApplyArgs),
    /// Reverse a previous apply using its metadata.
    Rollback(RollbackArgs),
    /// Recompute every hash listed in a run manifest.
    VerifyManifest {
        /// Path to manifest.json.
        manifest: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Print SHA-256 digests of files.
    Hash {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

/// Config file plus per-run overrides shared by analyze and apply.
#[derive(Debug, Args)]
struct ConfigArgs {
    /// JSON calibration config; missing fields take defaults.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Clamp limit in percent (correction clamp for analyze, apply clamp for apply).
    #[arg(long)]
    clamp: Option<f64>,
}

#[derive(Debug, Args)]
struct AnalyzeArgs {
    /// Dyno log (CSV/TSV/semicolon delimited).
    #[arg(long)]
    input: PathBuf,
    /// Parent directory for run directories.
    #[arg(long, default_value = "runs")]
    out_dir: PathBuf,
    #[command(flatten)]
    config: ConfigArgs,
    /// Kernel smoothing pass count.
    #[arg(long)]
    passes: Option<u32>,
    /// Fixed run timestamp (RFC 3339) for reproducible reruns.
    #[arg(long)]
    created_at: Option<String>,
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct ApplyArgs {
    /// Base VE table.
    #[arg(long)]
    base: PathBuf,
    /// Correction grid (signed percent).
    #[arg(long)]
    correction: PathBuf,
    /// Path of the new VE table; must differ from both inputs.
    #[arg(long)]
    output: PathBuf,
    /// Metadata path; defaults to `<output>.apply.json`.
    #[arg(long)]
    metadata: Option<PathBuf>,
    /// Directory that must contain the output table and metadata.
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,
    #[command(flatten)]
    config: ConfigArgs,
    /// Fixed apply timestamp (RFC 3339).
    #[arg(long)]
    created_at: Option<String>,
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct RollbackArgs {
    /// Table produced by the apply being reversed.
    #[arg(long)]
    current: PathBuf,
    /// Apply metadata written alongside it.
    #[arg(long)]
    metadata: PathBuf,
    /// Path of the restored table.
    #[arg(long)]
    output: PathBuf,
    /// Directory that must contain the restored table.
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    json: bool,
}

fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();
    match run(cli.command) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("vecal: error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // The tracing-log bridge is installed by init, so library `log` records
    // reach this subscriber.
    if let Err(err) = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
    {
        eprintln!("vecal: logging not initialised: {err}");
    }
}

fn run(command: Command) -> VecalResult<ExitCode> {
    match command {
        Command::Analyze(args) => run_analyze(args),
        Command::Apply(args) => run_apply(args),
        Command::Rollback(args) => run_rollback(args),
        Command::VerifyManifest { manifest, json } => run_verify(&manifest, json),
        Command::Hash { files } => {
            for file in files {
                println!("{}  {}", sha256_file(&file)?, file.display());
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

// ── Config ──────────────────────────────────────────────────────────

fn load_config(args: &ConfigArgs) -> VecalResult<CalibrationConfig> {
    let config = match &args.config {
        Some(path) => {
            log::info!("config: {}", path.display());
            CalibrationConfig::from_path(path)?
        }
        None => CalibrationConfig::default(),
    };
    Ok(config)
}

fn parse_created_at(text: Option<&str>) -> VecalResult<Option<DateTime<Utc>>> {
    text.map(parse_timestamp).transpose()
}

fn print_json(value: &serde_json::Value) -> VecalResult<()> {
    let text =
        serde_json::to_string_pretty(value).map_err(|e| VecalError::Serialization(e.to_string()))?;
    println!("{text}");
    Ok(())
}

// ── Commands ────────────────────────────────────────────────────────

fn run_analyze(args: AnalyzeArgs) -> VecalResult<ExitCode> {
    let mut config = load_config(&args.config)?;
    if let Some(clamp) = args.config.clamp {
        config.correction_clamp_pct = clamp;
    }
    if let Some(passes) = args.passes {
        config.smoothing.passes = passes;
    }
    config.validate()?;

    let options = AnalyzeOptions {
        input: args.input,
        out_dir: args.out_dir,
        created_at: parse_created_at(args.created_at.as_deref())?,
        dry_run: args.dry_run,
    };
    let summary = run_analysis(&options, &config)?;

    if args.json {
        let value =
            serde_json::to_value(&summary).map_err(|e| VecalError::Serialization(e.to_string()))?;
        print_json(&value)?;
    } else {
        print_summary(&summary);
    }
    Ok(ExitCode::SUCCESS)
}

fn print_summary(summary: &RunSummary) {
    let mode = if summary.dry_run { " (dry run)" } else { "" };
    println!("run {}{mode}", summary.run_id);
    println!("  status:    {:?}: {}", summary.status, summary.message);
    println!("  dialect:   {}", summary.dialect);
    println!(
        "  rows:      {} read, {} accepted",
        summary.rows_read, summary.records_accepted
    );
    println!(
        "  bins:      {}/{} populated",
        summary.bins_populated, summary.bins_total
    );
    println!(
        "  clamped:   {}   anomalies: {}",
        summary.clamped_cells, summary.anomalies
    );
    if let Some(dir) = &summary.run_dir {
        println!("  run dir:   {}", dir.display());
    }
    for output in &summary.outputs {
        println!("  {:<22} {}", output.name, output.sha256);
    }
}

fn run_apply(args: ApplyArgs) -> VecalResult<ExitCode> {
    let config = load_config(&args.config)?;
    let clamp_limit_pct = args.config.clamp.unwrap_or(config.apply_clamp_pct);
    let request = ApplyRequest {
        base_table: args.base,
        correction_grid: args.correction,
        output_table: args.output,
        metadata_path: args.metadata,
        out_dir: args.out_dir,
        clamp_limit_pct,
        applied_at: parse_created_at(args.created_at.as_deref())?,
        dry_run: args.dry_run,
    };
    let outcome = apply(&request)?;

    if args.json {
        print_json(&json!({
            "dry_run": outcome.dry_run,
            "output_table": outcome.output_table,
            "metadata_path": outcome.metadata_path,
            "cells_changed": outcome.cells_changed,
            "max_abs_delta": outcome.max_abs_delta,
            "transitions": outcome.transitions,
            "metadata": outcome.metadata,
        }))?;
    } else {
        let mode = if outcome.dry_run { " (dry run)" } else { "" };
        println!("apply{mode}: {}", outcome.output_table.display());
        println!("  cells changed: {}", outcome.cells_changed);
        println!("  max |delta|:   {:.4}", outcome.max_abs_delta);
        println!(
            "  clamped:       {} at ±{}%",
            outcome.clamped_cells().len(),
            clamp_limit_pct
        );
        println!("  sha256:        {}", outcome.metadata.output_table_sha256);
        if !outcome.dry_run {
            println!("  metadata:      {}", outcome.metadata_path.display());
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn run_rollback(args: RollbackArgs) -> VecalResult<ExitCode> {
    let request = RollbackRequest {
        current_table: args.current,
        metadata_path: args.metadata,
        output_table: args.output,
        out_dir: args.out_dir,
        dry_run: args.dry_run,
    };
    let outcome = rollback(&request)?;

    if args.json {
        print_json(&json!({
            "dry_run": outcome.dry_run,
            "output_table": outcome.output_table,
            "restored_sha256": outcome.restored_sha256,
            "matches_base": outcome.matches_base,
            "cells_restored": outcome.cells_restored,
            "transitions": outcome.transitions,
        }))?;
    } else {
        let mode = if outcome.dry_run { " (dry run)" } else { "" };
        println!("rollback{mode}: {}", outcome.output_table.display());
        println!("  cells restored: {}", outcome.cells_restored);
        println!("  sha256:         {}", outcome.restored_sha256);
        println!("  matches base:   {}", outcome.matches_base);
    }
    Ok(ExitCode::SUCCESS)
}

fn run_verify(manifest: &Path, as_json: bool) -> VecalResult<ExitCode> {
    let report = verify_manifest(manifest)?;
    if as_json {
        let value =
            serde_json::to_value(&report).map_err(|e| VecalError::Serialization(e.to_string()))?;
        print_json(&value)?;
    } else {
        println!(
            "manifest {}: {} artifacts checked, {} issues",
            report.run_id,
            report.checked,
            report.issues.len()
        );
        for issue in &report.issues {
            println!("  {} ({}): {}", issue.name, issue.path, issue.message);
        }
    }
    if report.is_clean() {
        Ok(ExitCode::SUCCESS)
    } else {
        log::error!("manifest verification failed: {}", manifest.display());
        Ok(ExitCode::FAILURE)
    }
}
