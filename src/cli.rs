use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::config::DEFAULT_CONFIG_FILE;
use crate::duplicates::SurvivorPolicy;
use crate::matcher::{FallbackPolicy, MatchMode};

#[derive(Parser, Debug)]
#[command(name = "media-index")]
#[command(about = "Incremental content-hash index for media trees")]
#[command(version)]
pub struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only print warnings and errors to the terminal
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Hash new or changed files in each destination and update its caches
    BuildCache {
        /// Only process this category
        #[arg(long)]
        category: Option<String>,
    },
    /// Report whether each destination directory's cache is fresh
    CheckCache {
        #[arg(long)]
        category: Option<String>,
    },
    /// List source files that are absent from the destination
    FindMissing {
        #[arg(long)]
        category: Option<String>,

        /// Matching strategy
        #[arg(long, value_enum, default_value_t = ModeArg::Name)]
        mode: ModeArg,

        /// What to do when hash mode meets a stale cache
        #[arg(long, value_enum, default_value_t = OnStaleArg::Abort)]
        on_stale: OnStaleArg,
    },
    /// Delete all but one file per content hash in each destination
    Dedup {
        #[arg(long)]
        category: Option<String>,

        /// Show what would be deleted without deleting
        #[arg(long)]
        dry_run: bool,

        /// Which file of a duplicate group to keep
        #[arg(long, value_enum, default_value_t = SurvivorArg::Oldest)]
        survivor: SurvivorArg,
    },
}

impl Command {
    /// Stem of the log file this command appends to.
    pub fn log_name(&self) -> &'static str {
        match self {
            Command::BuildCache { .. } => "cache_builder",
            Command::CheckCache { .. } => "check_cache",
            Command::FindMissing { .. } => "find_missing",
            Command::Dedup { .. } => "remove_duplicates",
        }
    }

    pub fn category(&self) -> Option<&str> {
        match self {
            Command::BuildCache { category }
            | Command::CheckCache { category }
            | Command::FindMissing { category, .. }
            | Command::Dedup { category, .. } => category.as_deref(),
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModeArg {
    /// Name and size only
    Name,
    /// Name and size, falling back to content hash
    Hash,
}

impl From<ModeArg> for MatchMode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Name => MatchMode::Name,
            ModeArg::Hash => MatchMode::NameThenHash,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnStaleArg {
    Abort,
    Downgrade,
}

impl From<OnStaleArg> for FallbackPolicy {
    fn from(arg: OnStaleArg) -> Self {
        match arg {
            OnStaleArg::Abort => FallbackPolicy::AbortOnStale,
            OnStaleArg::Downgrade => FallbackPolicy::DowngradeToNameOnly,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SurvivorArg {
    /// Earliest modification time
    Oldest,
    /// Smallest path
    Path,
}

impl From<SurvivorArg> for SurvivorPolicy {
    fn from(arg: SurvivorArg) -> Self {
        match arg {
            SurvivorArg::Oldest => SurvivorPolicy::OldestModified,
            SurvivorArg::Path => SurvivorPolicy::SmallestPath,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_find_missing_flags() {
        let cli = Cli::try_parse_from([
            "media-index",
            "--config",
            "cfg.toml",
            "find-missing",
            "--category",
            "foto",
            "--mode",
            "hash",
            "--on-stale",
            "downgrade",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("cfg.toml"));
        assert_eq!(cli.command.category(), Some("foto"));
        match cli.command {
            Command::FindMissing { mode, on_stale, .. } => {
                assert_eq!(MatchMode::from(mode), MatchMode::NameThenHash);
                assert_eq!(FallbackPolicy::from(on_stale), FallbackPolicy::DowngradeToNameOnly);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn dedup_defaults() {
        let cli = Cli::try_parse_from(["media-index", "dedup"]).unwrap();
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_FILE));
        assert_eq!(cli.command.log_name(), "remove_duplicates");
        match cli.command {
            Command::Dedup { dry_run, survivor, .. } => {
                assert!(!dry_run);
                assert_eq!(SurvivorPolicy::from(survivor), SurvivorPolicy::OldestModified);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn verbose_and_quiet_conflict() {
        assert!(Cli::try_parse_from(["media-index", "-v", "-q", "check-cache"]).is_err());
    }
}
