use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use cohort_psm::{StudyConfig, execute};
use log::{error, info};
use rayon::prelude::*;

/// Propensity score matching of treated and control cohorts
#[derive(Parser)]
#[command(name = "cohort-psm")]
#[command(version)]
#[command(about = "Match treated subjects to controls on the propensity score")]
struct Cli {
    /// Study configuration (JSON); repeat to run several cohorts
    #[arg(short, long = "config", required = true)]
    configs: Vec<PathBuf>,

    /// Worker threads for running cohorts side by side (default: CPU count)
    #[arg(short, long)]
    threads: Option<usize>,

    /// Hide the matching progress bar
    #[arg(long)]
    no_progress: bool,
}

fn run_cohort(path: &Path, no_progress: bool) -> anyhow::Result<()> {
    let mut study = StudyConfig::from_json_file(path)
        .with_context(|| format!("loading config {}", path.display()))?;
    if no_progress {
        study.matching.show_progress = false;
    }

    let result = execute(&study)
        .with_context(|| format!("matching cohort {}", study.cohort_name))?;

    info!(
        "{}: {} pairs from {} treated subjects ({:.1}%)",
        study.cohort_name,
        result.pairs.len(),
        result.treated_count,
        100.0 * result.match_rate()
    );
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let threads = cli.threads.unwrap_or_else(num_cpus::get).max(1);

    let pool = match rayon::ThreadPoolBuilder::new().num_threads(threads).build() {
        Ok(pool) => pool,
        Err(e) => {
            error!("Failed to start thread pool: {e}");
            return ExitCode::FAILURE;
        }
    };

    let outcomes: Vec<anyhow::Result<()>> = pool.install(|| {
        cli.configs
            .par_iter()
            .map(|path| run_cohort(path, cli.no_progress))
            .collect()
    });

    let failures = outcomes
        .iter()
        .filter_map(|outcome| outcome.as_ref().err())
        .inspect(|e| error!("{e:#}"))
        .count();

    if failures > 0 {
        error!("{failures} of {} cohorts failed", cli.configs.len());
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
