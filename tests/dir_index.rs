//! End-to-end tests of the directory index over real region files

use dirindex::error::Result;
use dirindex::{DeleteOutcome, DirIndex, FlushMode, IndexConfig, PutOutcome};
use std::collections::BTreeMap;
use std::sync::Arc;

fn test_config() -> IndexConfig {
    IndexConfig {
        region_size: 32 * 1024 * 1024,
        first_level_capacity: 64,
        promotion_threshold: 4,
        second_level_initial_capacity: 2,
        resize_load_factor: 1.0,
        background_threads: 2,
        flush_mode: FlushMode::Fence,
    }
}

#[test]
fn test_single_bucket_thousand_directories() -> Result<()> {
    let dir = tempfile::tempdir().unwrap();
    let config = IndexConfig {
        first_level_capacity: 1,
        ..test_config()
    };
    let index = DirIndex::open(dir.path().join("one.pm"), config)?;

    for i in 0..1000u64 {
        assert_eq!(index.put(i, format!("{:08X}", i), i)?, PutOutcome::Inserted);
    }
    for i in 0..1000u64 {
        assert_eq!(index.get(i, format!("{:08X}", i))?, Some(i));
    }
    index.wait_for_background();

    for i in [0u64, 1, 499, 998, 999] {
        let entries: Vec<_> = index.iter(i)?.collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, format!("{:08X}", i).into_bytes());
        assert_eq!(entries[0].child, i);
    }
    assert!(index.stats().subtables > 0);
    assert!(index.verify()?.is_clean());
    Ok(())
}

#[test]
fn test_update_and_delete_scenarios() -> Result<()> {
    let dir = tempfile::tempdir().unwrap();
    let index = DirIndex::open(dir.path().join("ops.pm"), test_config())?;

    assert_eq!(index.put(5, "a", 100)?, PutOutcome::Inserted);
    assert_eq!(index.put(5, "a", 200)?, PutOutcome::Updated);
    assert_eq!(index.get(5, "a")?, Some(200));

    assert_eq!(index.put(7, "x", 1)?, PutOutcome::Inserted);
    assert_eq!(index.delete(7, "x")?, DeleteOutcome::Deleted);
    assert_eq!(index.get(7, "x")?, None);
    assert_eq!(index.delete(7, "x")?, DeleteOutcome::NotFound);
    assert_eq!(index.delete(7, "x")?, DeleteOutcome::NotFound);
    Ok(())
}

#[test]
fn test_matches_model_across_promotion_and_resize() -> Result<()> {
    let dir = tempfile::tempdir().unwrap();
    let index = DirIndex::open(dir.path().join("model.pm"), test_config())?;
    let mut model: BTreeMap<(u64, String), u64> = BTreeMap::new();

    // Ids sharing first-level bucket 3 force promotion and resizes.
    for i in 0..3000u64 {
        let parent = 3 + 64 * (i % 37);
        let name = format!("entry-{}-{}", i % 911, "z".repeat((i % 23) as usize));
        let outcome = index.put(parent, &name, i)?;
        let existed = model.insert((parent, name), i).is_some();
        assert_eq!(outcome == PutOutcome::Updated, existed);

        if i % 5 == 0 {
            let victim = format!("entry-{}-{}", (i / 5) % 911, "z".repeat(((i / 5) % 23) as usize));
            let removed = model.remove(&(parent, victim.clone())).is_some();
            let outcome = index.delete(parent, &victim)?;
            assert_eq!(outcome == DeleteOutcome::Deleted, removed);
        }
    }
    index.wait_for_background();

    let stats = index.stats();
    assert_eq!(stats.subtables, 1);
    assert_eq!(stats.resizing, 0);

    for ((parent, name), child) in &model {
        assert_eq!(index.get(*parent, name)?, Some(*child));
    }
    for k in 0..37u64 {
        let parent = 3 + 64 * k;
        let mut listed: Vec<(Vec<u8>, u64)> =
            index.iter(parent)?.map(|e| (e.name, e.child)).collect();
        listed.sort();
        let expected: Vec<(Vec<u8>, u64)> = model
            .range((parent, String::new())..(parent + 1, String::new()))
            .map(|((_, name), child)| (name.clone().into_bytes(), *child))
            .collect();
        assert_eq!(listed, expected);
    }

    let report = index.verify()?;
    assert!(report.is_clean(), "{:?}", report.problems);
    assert_eq!(report.entries, model.len());
    Ok(())
}

#[test]
fn test_reopen_keeps_contents() -> Result<()> {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("persist.pm");
    let mut expected = Vec::new();
    {
        let index = DirIndex::open(&path, test_config())?;
        for i in 0..2000u64 {
            let parent = i % 130;
            let name = format!("file{:05}", i);
            index.put(parent, &name, i * 10)?;
            expected.push((parent, name, i * 10));
        }
        for (parent, name, _) in expected.iter().step_by(3) {
            index.delete(*parent, name)?;
        }
        index.close()?;
    }

    let index = DirIndex::open(&path, test_config())?;
    let recovery = index.recovery_report().cloned().unwrap_or_default();
    assert_eq!(recovery.repaired_links, 0);
    assert_eq!(recovery.repaired_counts, 0);
    for (i, (parent, name, child)) in expected.iter().enumerate() {
        let want = if i % 3 == 0 { None } else { Some(*child) };
        assert_eq!(index.get(*parent, name)?, want);
    }
    assert!(index.verify()?.is_clean());

    // Still writable after recovery
    assert_eq!(index.put(1, "after-reopen", 1)?, PutOutcome::Inserted);
    assert_eq!(index.get(1, "after-reopen")?, Some(1));
    Ok(())
}

#[test]
fn test_reopen_ignores_configured_first_level_capacity() -> Result<()> {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fixed.pm");
    {
        let index = DirIndex::open(&path, test_config())?;
        index.put(70, "a", 1)?;
        index.close()?;
    }

    let config = IndexConfig {
        first_level_capacity: 128,
        ..test_config()
    };
    let index = DirIndex::open(&path, config)?;
    assert_eq!(index.stats().first_level_capacity, 64);
    assert_eq!(index.get(70, "a")?, Some(1));
    Ok(())
}

#[test]
fn test_concurrent_disjoint_directories() -> Result<()> {
    let dir = tempfile::tempdir().unwrap();
    let index = Arc::new(DirIndex::open(dir.path().join("mt.pm"), test_config())?);

    std::thread::scope(|s| {
        for t in 0..4u64 {
            let index = Arc::clone(&index);
            s.spawn(move || {
                // Each thread owns the directories congruent to t mod 4.
                for i in 0..600u64 {
                    let parent = t + 4 * (i % 40);
                    let name = format!("t{}-{}", t, i);
                    index.put(parent, &name, i).unwrap();
                    assert_eq!(index.get(parent, &name).unwrap(), Some(i));
                    if i % 4 == 0 {
                        assert_eq!(index.delete(parent, &name).unwrap(), DeleteOutcome::Deleted);
                        assert_eq!(index.get(parent, &name).unwrap(), None);
                    }
                }
            });
        }
    });
    index.wait_for_background();

    for t in 0..4u64 {
        for i in 0..600u64 {
            let want = if i % 4 == 0 { None } else { Some(i) };
            assert_eq!(index.get(t + 4 * (i % 40), format!("t{}-{}", t, i))?, want);
        }
    }
    let report = index.verify()?;
    assert!(report.is_clean(), "{:?}", report.problems);
    assert_eq!(report.entries, 4 * 450);
    Ok(())
}

#[test]
fn test_config_file_drives_open() -> Result<()> {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("dirindex.toml");
    std::fs::write(
        &config_path,
        "region_size = 1048576\nfirst_level_capacity = 8\nflush_mode = \"fence\"\n",
    )
    .unwrap();

    let config = IndexConfig::from_file(&config_path)?;
    let index = DirIndex::open(dir.path().join("cfg.pm"), config)?;
    let stats = index.stats();
    assert_eq!(stats.region_size, 1024 * 1024);
    assert_eq!(stats.first_level_capacity, 8);
    Ok(())
}
