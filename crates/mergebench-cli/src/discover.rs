use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

use anyhow::{Context as _, Result, bail};
use clap::Args;
use mergebench::config::MergebenchConfig;
use mergebench::discovery::{Discovery, GitCliProvider, Ledger, read_repo_list};
use mergebench::model::RepoSlug;

#[derive(Args)]
pub struct DiscoverArgs {
    /// CSV file with a `repository` column of owner/name values
    #[arg(long, required_unless_present = "repo")]
    repos: Option<PathBuf>,

    /// A single repository (owner/name); may be repeated
    #[arg(long, value_name = "OWNER/NAME")]
    repo: Vec<RepoSlug>,

    /// Directory for ledger files, overriding `[discovery] ledger_dir`
    #[arg(long)]
    ledger_dir: Option<PathBuf>,
}

pub fn run(config: &MergebenchConfig, args: &DiscoverArgs, cancel: &AtomicBool) -> Result<()> {
    let mut repos = args.repo.clone();
    if let Some(path) = &args.repos {
        repos.extend(read_repo_list(path).with_context(|| format!("reading {}", path.display()))?);
    }
    if repos.is_empty() {
        bail!("no repositories to discover");
    }

    let ledger_dir = args.ledger_dir.clone().unwrap_or_else(|| config.discovery.ledger_dir.clone());
    std::fs::create_dir_all(&ledger_dir).with_context(|| format!("creating {}", ledger_dir.display()))?;
    let provider = GitCliProvider::new(&config.discovery.repos_dir, config.discovery.clone_url_template.clone());
    let report = Discovery::new(Ledger::new(ledger_dir), &provider).run(&repos, cancel);

    println!(
        "Discovery {}: {} processed, {} skipped (ledger exists), {} failed, {} candidates written.",
        if report.cancelled { "interrupted" } else { "complete" },
        report.processed,
        report.skipped,
        report.failed,
        report.candidates
    );
    if report.cancelled {
        bail!("interrupted");
    }
    Ok(())
}
