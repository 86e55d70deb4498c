use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use colored::Colorize;
use indicatif::HumanCount;
use log::{debug, info, warn};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::cache::{HashCache, RecordedFile};
use crate::utils::write_atomic;

/// Deletes one redundant copy.
pub trait FileRemover {
    fn remove(&self, path: &Path) -> io::Result<()>;
}

/// Removes files from the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsRemover;

impl FileRemover for FsRemover {
    fn remove(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }
}

/// Which member of a hash bucket is kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SurvivorPolicy {
    /// Earliest recorded modification time; ties go to the smallest path.
    #[default]
    OldestModified,
    /// Lexicographically smallest path.
    SmallestPath,
}

impl SurvivorPolicy {
    fn compare(self, a: &BucketMember, b: &BucketMember) -> Ordering {
        match self {
            SurvivorPolicy::OldestModified => a.mtime.total_cmp(&b.mtime).then_with(|| a.path.cmp(&b.path)),
            SurvivorPolicy::SmallestPath => a.path.cmp(&b.path),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BucketMember {
    pub path: PathBuf,
    pub mtime: f64,
}

/// `digest -> files recorded with that digest that still exist`.
pub type HashBuckets = BTreeMap<String, Vec<BucketMember>>;

/// Groups recorded files by digest, dropping paths that no longer exist.
pub fn bucket_by_digest(recorded: Vec<RecordedFile>) -> HashBuckets {
    let mut buckets = HashBuckets::new();
    let mut seen = HashSet::new();
    for file in recorded {
        if file.entry.hash.is_empty() || !file.path.is_file() {
            debug!("Skipping '{}': not on disk", file.path.display());
            continue;
        }
        if !seen.insert(file.path.clone()) {
            continue;
        }
        buckets.entry(file.entry.hash).or_default().push(BucketMember {
            path: file.path,
            mtime: file.entry.mtime,
        });
    }
    buckets
}

/// Buckets with more than one member.
pub fn find_duplicates(mut buckets: HashBuckets) -> HashBuckets {
    buckets.retain(|_, group| group.len() > 1);
    buckets
}

#[derive(Debug, Clone)]
pub struct GroupOutcome {
    pub digest: String,
    pub survivor: PathBuf,
    pub removed: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
}

impl GroupOutcome {
    pub fn survivor_name(&self) -> String {
        self.survivor
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.survivor.display().to_string())
    }
}

#[derive(Debug, Clone, Default)]
pub struct DuplicateReport {
    /// Only buckets where at least one file was (or would be) removed.
    pub groups: Vec<GroupOutcome>,
    pub files_recorded: usize,
    pub files_present: usize,
    pub unique_hashes: usize,
    pub total_removed: usize,
    pub total_failed: usize,
    pub dry_run: bool,
    /// Set when the interrupt flag stopped the pass before every bucket was handled.
    pub interrupted: bool,
}

/// Collapses each digest bucket of a destination tree to a single survivor.
///
/// Reads every cache under the cache root whatever its freshness; each
/// recorded path is checked on disk before it is considered.
pub struct DuplicateResolver<'a> {
    cache: &'a HashCache,
    policy: SurvivorPolicy,
    dry_run: bool,
    remover: &'a dyn FileRemover,
}

impl<'a> DuplicateResolver<'a> {
    pub fn new(cache: &'a HashCache) -> Self {
        Self {
            cache,
            policy: SurvivorPolicy::default(),
            dry_run: false,
            remover: &FsRemover,
        }
    }

    /// Deletes redundant copies through `remover` instead of the filesystem.
    pub fn with_remover(mut self, remover: &'a dyn FileRemover) -> Self {
        self.remover = remover;
        self
    }

    pub fn with_policy(mut self, policy: SurvivorPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Report what would be removed without deleting anything.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Keeps one file per content digest and deletes the others.
    ///
    /// Entries come from every cache under the cache root, fresh or not, and
    /// only files still on disk take part. Within each bucket the survivor is
    /// the first member under the [`SurvivorPolicy`]. A failed deletion is
    /// logged, counted in [`DuplicateReport::total_failed`] and skipped; it
    /// never ends the pass and never counts as removed. Only buckets where at
    /// least one file was (or, in dry run, would be) removed appear in
    /// [`DuplicateReport::groups`].
    ///
    /// The cache's interrupt flag is checked before each bucket. Once it is
    /// raised no further file is deleted and the report comes back with
    /// [`DuplicateReport::interrupted`] set, covering the buckets already done.
    pub fn resolve(&self) -> DuplicateReport {
        let recorded = self.cache.recorded_files();
        let files_recorded = recorded.len();
        let buckets = bucket_by_digest(recorded);
        let files_present = buckets.values().map(Vec::len).sum();
        let unique_hashes = buckets.len();

        info!("Total files in cache: {}", HumanCount(files_recorded as u64));
        info!("Files present for analysis: {}", HumanCount(files_present as u64));
        info!("Unique hashes: {}", HumanCount(unique_hashes as u64));

        let mut report = DuplicateReport {
            files_recorded,
            files_present,
            unique_hashes,
            dry_run: self.dry_run,
            ..Default::default()
        };

        for (digest, mut members) in find_duplicates(buckets) {
            if self.cache.interrupted() {
                warn!("Deduplication interrupted; remaining hash groups left untouched");
                report.interrupted = true;
                break;
            }
            members.sort_by(|a, b| self.policy.compare(a, b));
            let mut members = members.into_iter();
            let Some(survivor) = members.next() else {
                continue;
            };

            let mut outcome = GroupOutcome {
                digest,
                survivor: survivor.path,
                removed: Vec::new(),
                failed: Vec::new(),
            };
            for member in members {
                if self.dry_run {
                    info!("Would remove '{}'", member.path.display());
                    outcome.removed.push(member.path);
                    continue;
                }
                match self.remover.remove(&member.path) {
                    Ok(()) => {
                        debug!("Removed '{}'", member.path.display());
                        outcome.removed.push(member.path);
                    }
                    Err(e) => {
                        warn!("Unable to delete '{}': {}", member.path.display(), e);
                        outcome.failed.push(member.path);
                    }
                }
            }

            report.total_failed += outcome.failed.len();
            if !outcome.removed.is_empty() {
                report.total_removed += outcome.removed.len();
                report.groups.push(outcome);
            }
        }

        let verb = if self.dry_run { "to remove" } else { "removed" };
        info!("Duplicates {}: {}", verb, HumanCount(report.total_removed as u64));
        info!("Hash groups with duplicates: {}", HumanCount(report.groups.len() as u64));
        report
    }
}

impl DuplicateReport {
    pub fn groups_with_duplicates(&self) -> usize {
        self.groups.len()
    }

    /// `survivorName | removedCount` per group, then the totals.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for group in &self.groups {
            let _ = writeln!(out, "{} | {}", group.survivor_name(), group.removed.len());
        }
        let generated = OffsetDateTime::now_local()
            .unwrap_or_else(|_| OffsetDateTime::now_utc())
            .format(&Rfc3339)
            .unwrap_or_default();
        let verb = if self.dry_run { "would be removed" } else { "removed" };
        let _ = writeln!(out);
        let _ = writeln!(out, "Duplicates {}: {}", verb, self.total_removed);
        let _ = writeln!(out, "Hash groups with duplicates: {}", self.groups.len());
        let _ = writeln!(out, "Generated: {}", generated);
        let _ = writeln!(out, "{}", "=".repeat(54));
        out
    }

    /// Writes [`DuplicateReport::render`] atomically to `path`.
    pub fn write(&self, path: &Path) -> Result<()> {
        write_atomic(path, self.render().as_bytes())
            .with_context(|| format!("Failed to write duplicate report: '{}'", path.display()))?;
        info!("Report saved to: '{}'", path.display());
        Ok(())
    }
}

pub fn print_results(report: &DuplicateReport, base_path: &Path) {
    if report.groups.is_empty() {
        println!("{}", "No duplicate files found!".green());
        return;
    }
    let verb = if report.dry_run { "would be removed" } else { "removed" };
    println!(
        "{}",
        format!(
            "{} duplicate files {} across {} hash groups",
            HumanCount(report.total_removed as u64),
            verb,
            HumanCount(report.groups.len() as u64)
        )
        .yellow()
    );
    for group in &report.groups {
        let relative = group.survivor.strip_prefix(base_path).unwrap_or(&group.survivor);
        println!("  {} {}", "keep".green(), relative.display());
        for removed in &group.removed {
            let relative = removed.strip_prefix(base_path).unwrap_or(removed);
            println!("  {} {}", "drop".red(), relative.display());
        }
    }
    if report.total_failed > 0 {
        println!(
            "{}",
            format!("{} files could not be deleted", report.total_failed).red()
        );
    }
    if report.interrupted {
        println!("{}", "Interrupted; remaining hash groups were not processed".yellow());
    }
}
