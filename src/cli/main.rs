use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};

use exif_stamp::config::{self, WriteMode};
use exif_stamp::item::{FieldValues, ItemOutcome, MetadataUpdateItem, WriteReport};
use exif_stamp::service::MetadataService;

#[derive(Parser, Debug)]
#[command(
    name = "exif-stamp",
    version,
    about = "Write culling results (ratings, picks, labels, scores, captions) through one persistent exiftool session"
)]
struct Cli {
    /// Image files for --reset or --show
    #[arg(value_name = "PATH")]
    paths: Vec<PathBuf>,

    /// Path to config file (default: config.json next to binary)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Initialize a default config.json and exit
    #[arg(long)]
    init: bool,

    /// Persist the write mode for Sony ARW files (embedded, inplace, sidecar, auto) and exit
    #[arg(long = "set-mode", value_name = "MODE")]
    set_mode: Option<WriteMode>,

    /// JSON array of update items to apply
    #[arg(long, value_name = "FILE")]
    items: Option<PathBuf>,

    /// Clear every field this tool writes from the given files
    #[arg(long)]
    reset: bool,

    /// Display the fields this tool writes, embedded and in sidecars
    #[arg(long)]
    show: bool,

    /// Override the ARW write mode for this run only
    #[arg(long, value_name = "MODE")]
    mode: Option<WriteMode>,

    /// Output results as JSON
    #[arg(long)]
    json: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    // Handle --init
    if cli.init {
        let config = config::Config::default();
        let path = cli.config.as_deref();
        config.save(path)?;
        let save_path = match path {
            Some(p) => p.to_path_buf(),
            None => config::Config::config_path()?,
        };
        println!("Default config written to {}", save_path.display());
        return Ok(());
    }

    // Handle --set-mode
    if let Some(mode) = cli.set_mode {
        let mut config = config::Config::load(cli.config.as_deref())?;
        config.write.fragile_write_mode = mode;
        config.save(cli.config.as_deref())?;
        println!("ARW write mode set to {mode}");
        return Ok(());
    }

    let actions = [cli.items.is_some(), cli.reset, cli.show]
        .iter()
        .filter(|set| **set)
        .count();
    if actions != 1 {
        anyhow::bail!("Specify exactly one of --items FILE, --reset or --show. Use --help for usage.");
    }
    if (cli.reset || cli.show) && cli.paths.is_empty() {
        anyhow::bail!("No input files specified. Use --help for usage.");
    }

    let config = config::Config::load(cli.config.as_deref())?;
    let service = MetadataService::new(&config)
        .await
        .context("Failed to start exiftool")?;
    if let Some(mode) = cli.mode {
        service.set_write_mode(mode);
    }

    let outcome = run(&cli, &service).await;
    service.shutdown().await;
    outcome
}

async fn run(cli: &Cli, service: &MetadataService) -> Result<()> {
    // Handle --show
    if cli.show {
        let mut shown = Vec::new();
        for path in &cli.paths {
            let embedded = service.read_embedded(path).await;
            let sidecar = service.sidecar().read(path);
            if cli.json {
                shown.push(serde_json::json!({
                    "path": path.display().to_string(),
                    "embedded": embedded.as_ref().ok(),
                    "sidecar": sidecar.as_ref().ok().and_then(Option::as_ref),
                    "error": embedded.as_ref().err().map(ToString::to_string),
                }));
            } else {
                print_fields(path, embedded, sidecar);
            }
        }
        if cli.json {
            println!("{}", serde_json::to_string_pretty(&shown)?);
        }
        return Ok(());
    }

    let report = if let Some(ref items_path) = cli.items {
        let contents = std::fs::read_to_string(items_path)
            .with_context(|| format!("Failed to read {}", items_path.display()))?;
        let items: Vec<MetadataUpdateItem> =
            serde_json::from_str(&contents).context("Failed to parse update items")?;
        log::info!("Applying {} update item(s)", items.len());
        service.write_batch(&items).await
    } else {
        log::info!("Resetting {} file(s)", cli.paths.len());
        service.reset(&cli.paths).await
    };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    log::info!(
        "Done: {} succeeded, {} failed out of {} files",
        report.result.success,
        report.result.failed,
        report.result.total()
    );
    if report.result.failed > 0 {
        anyhow::bail!("{} file(s) failed", report.result.failed);
    }
    Ok(())
}

// ANSI color codes
const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const DIM: &str = "\x1b[2m";
const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";

/// Max width for the value column before wrapping.
const VAL_WIDTH: usize = 46;
/// Indent for continuation lines (tag column width + " : " = 25 chars + 2 leading spaces).
const INDENT: &str = "                           ";

/// Print one line per item with its outcome.
fn print_report(report: &WriteReport) {
    println!();
    for item in &report.items {
        let (color, text) = match &item.outcome {
            ItemOutcome::Embedded => (GREEN, "embedded".to_string()),
            ItemOutcome::Committed => (GREEN, "verified, committed".to_string()),
            ItemOutcome::Sidecar(path) => (GREEN, format!("sidecar {}", path.display())),
            ItemOutcome::Unchanged => (DIM, "unchanged".to_string()),
            ItemOutcome::Failed(reason) => (RED, format!("failed: {reason}")),
        };
        println!("  {color}{}{RESET} : {text}", item.path.display());
    }
    println!();
}

/// Print embedded and sidecar fields for one file.
fn print_fields(
    path: &Path,
    embedded: exif_stamp::Result<FieldValues>,
    sidecar: exif_stamp::Result<Option<FieldValues>>,
) {
    println!();
    println!("{BOLD}File:{RESET} {}", path.display());
    println!("{DIM}{}{RESET}", "═".repeat(72));

    println!("  {BOLD}Embedded{RESET}");
    println!("  {DIM}{}{RESET}", "─".repeat(70));
    match embedded {
        Ok(fields) if fields.is_empty() => println!("  {DIM}(none){RESET}"),
        Ok(fields) => print_values(&fields),
        Err(e) => println!("  {RED}{e}{RESET}"),
    }
    println!();

    println!("  {BOLD}Sidecar{RESET}");
    println!("  {DIM}{}{RESET}", "─".repeat(70));
    match sidecar {
        Ok(Some(fields)) if fields.is_empty() => println!("  {DIM}(no owned fields){RESET}"),
        Ok(Some(fields)) => print_values(&fields),
        Ok(None) => println!("  {DIM}(no sidecar){RESET}"),
        Err(e) => println!("  {RED}{e}{RESET}"),
    }
    println!();
}

fn print_values(fields: &FieldValues) {
    for (field, value) in fields {
        print_row(field.json_key(), value);
    }
}

/// Print a single row in the field table.
fn print_row(tag: &str, val: &str) {
    let tag_col = format!("{:<22}", tag);
    let lines = wrap_text(val, VAL_WIDTH);
    for (i, line) in lines.iter().enumerate() {
        if i == 0 {
            println!("  {tag_col} : {line}");
        } else {
            println!("  {INDENT}{line}");
        }
    }
}

/// Wrap text at word boundaries to fit within max_width.
fn wrap_text(s: &str, max_width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current_line = String::new();

    for word in s.split_whitespace() {
        if current_line.is_empty() {
            current_line = word.to_string();
        } else if current_line.len() + 1 + word.len() <= max_width {
            current_line.push(' ');
            current_line.push_str(word);
        } else {
            lines.push(current_line);
            current_line = word.to_string();
        }
    }

    if !current_line.is_empty() {
        lines.push(current_line);
    }

    if lines.is_empty() {
        lines.push(s.to_string());
    }

    lines
}
