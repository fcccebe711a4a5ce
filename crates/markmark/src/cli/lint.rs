//
// cli/lint.rs
//
// `markmark lint <path> [--json]`: index every document under a folder,
// wait for indexing to settle and report unresolved links
//

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::broadcast;
use url::Url;

use crate::config::Config;
use crate::events::Event;
use crate::markmark::Markmark;
use crate::types::LintReport;

/// Parsed arguments for the `lint` subcommand.
#[derive(Debug)]
pub struct LintArgs {
    pub path: PathBuf,
    pub json: bool,
}

/// Parse `lint` arguments from the remaining CLI args.
pub fn parse_args(args: &mut impl Iterator<Item = String>) -> Result<LintArgs, String> {
    let mut path: Option<PathBuf> = None;
    let mut json = false;

    for arg in args {
        match arg.as_str() {
            "--json" => json = true,
            other if other.starts_with('-') => {
                return Err(format!("Unknown flag: '{}'", other));
            }
            _ => {
                if path.is_some() {
                    return Err("Multiple paths provided; expected exactly one".to_string());
                }
                path = Some(PathBuf::from(arg));
            }
        }
    }

    let path = path.ok_or_else(|| "Missing required <path> argument".to_string())?;
    Ok(LintArgs { path, json })
}

/// Index `args.path` as a single root and lint it.
pub async fn run_lint(args: &LintArgs, config: Config) -> anyhow::Result<Vec<LintReport>> {
    let root = std::fs::canonicalize(&args.path)
        .with_context(|| format!("cannot open {}", args.path.display()))?;
    if !root.is_dir() {
        anyhow::bail!("{} is not a directory", root.display());
    }
    let root_uri = Url::from_directory_path(&root)
        .map_err(|_| anyhow::anyhow!("cannot convert {} to a uri", root.display()))?;

    let engine = Markmark::with_config(config);
    let mut stream = engine.subscribe();
    engine.add_root(&root_uri);
    engine.init(false).await;
    engine.settled().await;

    // lints published while the scan was still running are stale
    loop {
        match stream.try_recv() {
            Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }

    let wait = engine.config().debounce() * 2;
    let reports = match tokio::time::timeout(wait, next_lint(&mut stream)).await {
        Ok(Some(reports)) => reports.to_vec(),
        _ => engine.lint(),
    };
    engine.close();

    log::info!(
        "lint :: {} findings in {} documents",
        reports.iter().map(|r| r.results.len()).sum::<usize>(),
        reports.len()
    );
    Ok(reports)
}

async fn next_lint(stream: &mut broadcast::Receiver<Event>) -> Option<Arc<Vec<LintReport>>> {
    loop {
        match stream.recv().await {
            Ok(Event::LinterLint(reports)) => return Some(reports),
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

/// One `path:line:column: severity: message` line per finding, paths
/// relative to `root` where possible.
pub fn format_results(reports: &[LintReport], root: &Path) -> Vec<String> {
    let mut lines = Vec::new();
    for report in reports {
        let path = report
            .uri
            .to_file_path()
            .map(|path| {
                path.strip_prefix(root)
                    .map(Path::to_path_buf)
                    .unwrap_or(path)
            })
            .map(|path| path.display().to_string())
            .unwrap_or_else(|_| report.uri.to_string());

        for result in &report.results {
            lines.push(format!(
                "{}:{}:{}: {}: {}",
                path, result.position.start.line, result.position.start.column, result.severity, result.message
            ));
        }
    }
    lines
}

pub fn print_results(reports: &[LintReport], root: &Path) {
    for line in format_results(reports, root) {
        println!("{}", line);
    }
}

pub fn print_results_json(reports: &[LintReport]) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(reports)?);
    Ok(())
}
