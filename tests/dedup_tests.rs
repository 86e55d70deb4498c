mod common;

use std::collections::HashSet;
use std::fs;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use common::{FailingRemover, Fixture, photos, set_mtime};
use media_index::{DuplicateResolver, SurvivorPolicy};

#[test]
fn identical_pair_loses_exactly_one_file() {
    let fx = Fixture::new();
    let x = fx.write("output/x.jpg", b"same bytes");
    let y = fx.write("output/y.jpg", b"same bytes");
    fx.write("output/z.jpg", b"different");
    let cache = fx.cache();
    cache.build(&photos()).unwrap();

    let report = DuplicateResolver::new(&cache).resolve();
    assert_eq!(report.files_recorded, 3);
    assert_eq!(report.unique_hashes, 2);
    assert_eq!(report.total_removed, 1);
    assert_eq!(report.groups_with_duplicates(), 1);
    assert_eq!(report.groups[0].removed.len(), 1);
    assert_eq!(x.exists() as u8 + y.exists() as u8, 1);
    assert!(fx.dest().join("z.jpg").exists());
}

#[test]
fn oldest_recorded_file_survives() {
    let fx = Fixture::new();
    let newer = fx.write("output/a_newer.jpg", b"dup");
    let older = fx.write("output/2019/b_older.jpg", b"dup");
    set_mtime(&newer, 1_700_000_000);
    set_mtime(&older, 1_500_000_000);
    let cache = fx.cache();
    cache.build(&photos()).unwrap();

    let report = DuplicateResolver::new(&cache).resolve();
    assert_eq!(report.groups[0].survivor, older);
    assert_eq!(report.groups[0].survivor_name(), "b_older.jpg");
    assert!(older.exists());
    assert!(!newer.exists());
}

#[test]
fn smallest_path_policy_keeps_first_path() {
    let fx = Fixture::new();
    let first = fx.write("output/2019/a.jpg", b"dup");
    let second = fx.write("output/b.jpg", b"dup");
    set_mtime(&first, 1_700_000_000);
    set_mtime(&second, 1_500_000_000);
    let cache = fx.cache();
    cache.build(&photos()).unwrap();

    let report = DuplicateResolver::new(&cache)
        .with_policy(SurvivorPolicy::SmallestPath)
        .resolve();
    assert_eq!(report.groups[0].survivor, first);
    assert!(!second.exists());
}

#[test]
fn dry_run_deletes_nothing() {
    let fx = Fixture::new();
    let a = fx.write("output/a.jpg", b"dup");
    let b = fx.write("output/b.jpg", b"dup");
    let c = fx.write("output/c.jpg", b"dup");
    let cache = fx.cache();
    cache.build(&photos()).unwrap();

    let report = DuplicateResolver::new(&cache).dry_run(true).resolve();
    assert!(report.dry_run);
    assert_eq!(report.total_removed, 2);
    assert!(a.exists() && b.exists() && c.exists());
    assert!(report.render().contains("Duplicates would be removed: 2"));
}

#[test]
fn stale_caches_are_still_trusted_and_vanished_paths_ignored() {
    let fx = Fixture::new();
    let a = fx.write("output/a.jpg", b"dup");
    let b = fx.write("output/b.jpg", b"dup");
    let c = fx.write("output/c.jpg", b"dup");
    let cache = fx.cache();
    cache.build(&photos()).unwrap();

    fs::remove_file(&c).unwrap();
    set_mtime(&fx.dest(), 1_400_000_000);
    assert!(!cache.state_of(&fx.dest()).is_fresh());

    let report = DuplicateResolver::new(&cache).resolve();
    assert_eq!(report.files_recorded, 3);
    assert_eq!(report.files_present, 2);
    assert_eq!(report.total_removed, 1);
    assert_eq!(a.exists() as u8 + b.exists() as u8, 1);
}

#[test]
fn every_digest_has_one_survivor_after_dedup() {
    let fx = Fixture::new();
    let contents: [&[u8]; 6] = [b"one", b"two", b"one", b"three", b"two", b"one"];
    for (i, content) in contents.iter().enumerate() {
        let dir = if i % 2 == 0 { "output" } else { "output/sub" };
        fx.write(&format!("{dir}/file{i}.jpg"), content);
    }
    let cache = fx.cache();
    cache.build(&photos()).unwrap();

    let report = DuplicateResolver::new(&cache).resolve();
    assert_eq!(report.total_removed, 3);
    assert_eq!(report.groups_with_duplicates(), 2);

    cache.build(&photos()).unwrap();
    let mut seen = HashSet::new();
    for recorded in cache.recorded_files() {
        assert!(recorded.path.exists());
        assert!(seen.insert(recorded.entry.hash), "digest survived twice");
    }
    assert_eq!(seen.len(), 3);
}

#[test]
fn report_file_lists_survivors_and_totals() {
    let fx = Fixture::new();
    fx.write("output/keep.jpg", b"dup");
    fx.write("output/lose.jpg", b"dup");
    let cache = fx.cache();
    cache.build(&photos()).unwrap();

    let report = DuplicateResolver::new(&cache)
        .with_policy(SurvivorPolicy::SmallestPath)
        .resolve();
    let path = fx.root.path().join("logs").join("duplicates.txt");
    report.write(&path).unwrap();

    let content = fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines[0], "keep.jpg | 1");
    assert!(lines.contains(&"Duplicates removed: 1"));
    assert!(lines.contains(&"Hash groups with duplicates: 1"));
}

#[test]
fn no_duplicates_means_empty_report() {
    let fx = Fixture::new();
    fx.write("output/a.jpg", b"a");
    fx.write("output/b.jpg", b"b");
    let cache = fx.cache();
    cache.build(&photos()).unwrap();

    let report = DuplicateResolver::new(&cache).resolve();
    assert!(report.groups.is_empty());
    assert_eq!(report.total_removed, 0);
    assert!(fx.dest().join("a.jpg").exists() && fx.dest().join("b.jpg").exists());
}

#[test]
fn failed_deletion_is_counted_apart_and_does_not_stop_the_pass() {
    let fx = Fixture::new();
    // bucket one: survivor plus a deletable and a locked copy
    let keep = fx.write("output/a_keep.jpg", b"first");
    let gone = fx.write("output/b_copy.jpg", b"first");
    let locked = fx.write("output/c_locked.jpg", b"first");
    // bucket two: the only redundant copy cannot be deleted
    let keep_two = fx.write("output/d_keep.jpg", b"second");
    let locked_two = fx.write("output/e_locked.jpg", b"second");
    let cache = fx.cache();
    cache.build(&photos()).unwrap();

    let remover = FailingRemover { needle: "locked" };
    let report = DuplicateResolver::new(&cache)
        .with_policy(SurvivorPolicy::SmallestPath)
        .with_remover(&remover)
        .resolve();

    assert_eq!(report.total_removed, 1);
    assert_eq!(report.total_failed, 2);
    assert_eq!(report.groups_with_duplicates(), 1);
    assert_eq!(report.groups[0].survivor, keep);
    assert_eq!(report.groups[0].removed, vec![gone.clone()]);
    assert_eq!(report.groups[0].failed, vec![locked.clone()]);
    assert!(keep.exists() && locked.exists() && !gone.exists());
    assert!(keep_two.exists() && locked_two.exists());

    let text = report.render();
    assert!(text.starts_with("a_keep.jpg | 1\n"));
    assert!(!text.contains("d_keep.jpg"));
    assert!(text.contains("Duplicates removed: 1"));
}

#[test]
fn raised_interrupt_deletes_nothing() {
    let fx = Fixture::new();
    let a = fx.write("output/a.jpg", b"dup");
    let b = fx.write("output/b.jpg", b"dup");
    fx.cache().build(&photos()).unwrap();

    let cache = fx.cache().with_interrupt(Arc::new(AtomicBool::new(true)));
    let report = DuplicateResolver::new(&cache).resolve();
    assert!(report.interrupted);
    assert_eq!(report.total_removed, 0);
    assert!(report.groups.is_empty());
    assert!(a.exists() && b.exists());
}
