use std::fs::OpenOptions;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use anyhow::{Result, bail};
use clap::Parser;
use colored::Colorize;
use indicatif::HumanCount;
use log::{LevelFilter, debug, error, info, warn};
use simplelog::{ColorChoice, CombinedLogger, ConfigBuilder, SharedLogger, TermLogger, TerminalMode, WriteLogger};

use media_index::cli::{Cli, Command};
use media_index::utils::format_human_elapsed;
use media_index::{
    Config, DuplicateResolver, FallbackPolicy, HashCache, MatchEngine, MatchError, MatchMode,
    MatchRequest, MediaCategory, SurvivorPolicy, print_results,
};

fn init_logging(cli: &Cli, log_file: Option<&Path>) {
    let level = if cli.verbose { LevelFilter::Debug } else { LevelFilter::Info };
    let term_level = if cli.quiet { LevelFilter::Warn } else { level };

    let mut builder = ConfigBuilder::new();
    let _ = builder.set_time_offset_to_local();
    builder
        .set_target_level(LevelFilter::Off)
        .set_thread_level(LevelFilter::Off);
    let log_config = builder.build();

    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        term_level,
        log_config.clone(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )];
    if let Some(path) = log_file {
        let opened = path
            .parent()
            .map(std::fs::create_dir_all)
            .transpose()
            .and_then(|_| OpenOptions::new().create(true).append(true).open(path));
        match opened {
            Ok(file) => loggers.push(WriteLogger::new(level, log_config, file)),
            Err(e) => eprintln!("Cannot open log file '{}': {}", path.display(), e),
        }
    }
    let _ = CombinedLogger::init(loggers);
}

fn build_cache(config: &Config, categories: &[&MediaCategory], interrupt: &Arc<AtomicBool>) -> Result<bool> {
    for category in categories {
        info!("Updating cache for '{}'", category.label);
        let cache = HashCache::from_config(config, category).with_interrupt(interrupt.clone());
        let report = cache.build(&category.extension_set())?;
        println!(
            "{} {}: {} directories, {} files scanned, {} new hashes, {} failed ({})",
            "✔".green(),
            category.label.bold(),
            report.directories,
            HumanCount(report.files_scanned as u64),
            HumanCount(report.new_hashes as u64),
            report.failed,
            format_human_elapsed(report.elapsed)
        );
        if report.interrupted {
            bail!("interrupted");
        }
    }
    Ok(true)
}

fn check_cache(config: &Config, categories: &[&MediaCategory], interrupt: &Arc<AtomicBool>) -> Result<bool> {
    let mut all_fresh = true;
    for category in categories {
        let cache = HashCache::from_config(config, category).with_interrupt(interrupt.clone());
        println!("{}", format!("[{}]", category.label).bold());
        for (dir, state) in cache.check()? {
            let label = if state.is_fresh() {
                state.to_string().green()
            } else {
                all_fresh = false;
                state.to_string().yellow()
            };
            println!("  {} {}", label, dir.display());
        }
        if cache.interrupted() {
            bail!("interrupted");
        }
    }
    if !all_fresh {
        println!("{}", "Some caches are outdated, run build-cache".yellow());
    }
    Ok(all_fresh)
}

fn find_missing(
    config: &Config,
    categories: &[&MediaCategory],
    mode: MatchMode,
    policy: FallbackPolicy,
    interrupt: &Arc<AtomicBool>,
) -> Result<bool> {
    let mut ok = true;
    for category in categories {
        if category.sources.is_empty() {
            warn!("No sources configured for '{}', skipping", category.label);
            continue;
        }
        let cache = HashCache::from_config(config, category).with_interrupt(interrupt.clone());
        let extensions = category.extension_set();
        let request = MatchRequest {
            label: &category.label,
            sources: &category.sources,
            extensions: &extensions,
            mode,
            policy,
            missing_list: &category.missing_list,
        };
        match MatchEngine::new(&cache).find_missing(&request) {
            Ok(report) => {
                let count = HumanCount(report.records.len() as u64).to_string();
                let count = if report.records.is_empty() { count.green() } else { count.yellow() };
                println!(
                    "{}: {} of {} source files missing (mode {}) -> {}",
                    category.label.bold(),
                    count,
                    HumanCount(report.source_files as u64),
                    report.mode_used,
                    category.missing_list.display()
                );
            }
            Err(MatchError::Interrupted) => bail!("interrupted"),
            Err(e) => {
                error!("{}: {}", category.label, e);
                ok = false;
            }
        }
    }
    Ok(ok)
}

fn dedup(
    config: &Config,
    categories: &[&MediaCategory],
    dry_run: bool,
    survivor: SurvivorPolicy,
    interrupt: &Arc<AtomicBool>,
) -> Result<bool> {
    for category in categories {
        if !category.destination.is_dir() {
            bail!("Destination directory does not exist: '{}'", category.destination.display());
        }
        let cache = HashCache::from_config(config, category).with_interrupt(interrupt.clone());
        let report = DuplicateResolver::new(&cache)
            .with_policy(survivor)
            .dry_run(dry_run)
            .resolve();
        report.write(&config.duplicate_report_for(category))?;
        print_results(&report, &category.destination);
        if report.interrupted {
            bail!("interrupted");
        }
    }
    Ok(true)
}

fn run(cli: &Cli, config: &Config, interrupt: &Arc<AtomicBool>) -> Result<bool> {
    let categories = config.select(cli.command.category())?;
    match &cli.command {
        Command::BuildCache { .. } => build_cache(config, &categories, interrupt),
        Command::CheckCache { .. } => check_cache(config, &categories, interrupt),
        Command::FindMissing { mode, on_stale, .. } => {
            find_missing(config, &categories, (*mode).into(), (*on_stale).into(), interrupt)
        }
        Command::Dedup { dry_run, survivor, .. } => {
            dedup(config, &categories, *dry_run, (*survivor).into(), interrupt)
        }
    }
}

fn main() -> ExitCode {
    let start_time = Instant::now();
    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            init_logging(&cli, None);
            error!("{:#}", e);
            return ExitCode::FAILURE;
        }
    };
    let log_file = config.logs_dir.join(format!("{}.log", cli.command.log_name()));
    init_logging(&cli, Some(&log_file));

    info!("Starting media-index v{}", env!("CARGO_PKG_VERSION"));
    debug!("Command line arguments: {:?}", cli);

    let interrupt = Arc::new(AtomicBool::new(false));
    let flag = interrupt.clone();
    // First Ctrl+C asks the running pass to stop; a second one exits at once.
    let handler = move || {
        if flag.swap(true, Ordering::SeqCst) {
            std::process::exit(130);
        }
        eprintln!("Stopping after the current file, press Ctrl+C again to abort");
    };
    if let Err(e) = ctrlc::set_handler(handler) {
        warn!("Failed to install Ctrl+C handler: {}", e);
    }

    let outcome = run(&cli, &config, &interrupt);
    info!("Finished in {}", format_human_elapsed(start_time.elapsed()));
    match outcome {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
