mod catalog;
mod cli;
mod errors;
mod manifest;
mod metadata_cache;
mod process;
mod rules;
mod runtime_checker;
mod special_checker;
mod submodule;

use anyhow::{Context, Result};
use clap::Parser;

use cli::Args;
use manifest::Manifest;
use special_checker::SpecialChecker;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = match args.verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new().filter_level(log_level).init();

    let mut manifest = Manifest::load(&args.manifest)
        .with_context(|| format!("failed to load manifest {}", args.manifest.display()))?;

    let module_paths: Vec<String> = args
        .modules
        .iter()
        .map(|p| p.display().to_string())
        .collect();

    let mut checker = SpecialChecker::new(&args.remote_name, &args.remote_url);
    checker
        .check(&manifest, true, &args.manifest, &module_paths)
        .await
        .context("fatal error while checking for updates")?;

    checker.print_outdated();

    for error in checker.get_errors() {
        log::warn!("{error}");
    }

    if !args.dry_run {
        let (changes, warnings) = checker
            .update(&mut manifest, &args.manifest)
            .await
            .context("failed to apply updates")?;
        for change in &changes {
            println!("{change}");
        }
        for warning in &warnings {
            log::warn!("{warning}");
        }
    }

    Ok(())
}
