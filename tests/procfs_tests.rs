//! End-to-end tests against a fake process-information root.
//!
//! Each test builds a directory laid out like `/proc`, with `status`, `maps` and `mem` files for
//! a handful of processes, and drives the public API through it.

use std::fs;
use std::path::Path;

use procmem::{
    Aggregator, Error, ProcFs, ReadOptions, ReadPolicy, Sampler, ANONYMOUS_KEY, TOTAL_KEY,
};

const CAT_MAPS: &str = "\
00001000-00002000 r-xp 00000000 08:01 123 /bin/cat
00002000-00003000 r--p 00001000 08:01 123 /bin/cat
00003000-00004000 rw-p 00000000 00:00 0
00004000-00005000 ---p 00000000 00:00 0
00005000-00007000 rw-p 00000000 00:00 0 [heap]
";

fn add_process(
    root: &Path,
    pid: u32,
    name: &str,
    maps: &str,
    mem_len: usize,
) -> anyhow::Result<()> {
    let dir = root.join(pid.to_string());
    fs::create_dir(&dir)?;
    fs::write(
        dir.join("status"),
        format!("Name:\t{}\nUmask:\t0022\nState:\tS (sleeping)\nPid:\t{}\n", name, pid),
    )?;
    fs::write(dir.join("maps"), maps)?;
    let mem: Vec<u8> = (0..mem_len).map(|i| (i >> 12) as u8).collect();
    fs::write(dir.join("mem"), mem)?;
    Ok(())
}

fn fake_proc() -> anyhow::Result<tempfile::TempDir> {
    let root = tempfile::tempdir()?;
    add_process(root.path(), 1, "init", "", 0)?;
    add_process(root.path(), 300, "cat", CAT_MAPS, 0x7000)?;
    add_process(root.path(), 301, "short", CAT_MAPS, 0x3800)?;
    fs::create_dir(root.path().join("sys"))?;
    Ok(root)
}

#[test]
fn test_sample_process_by_name() -> anyhow::Result<()> {
    let root = fake_proc()?;
    let sampler = Sampler::new(ProcFs::new(root.path()));
    let sample = sampler.sample_process("cat")?;

    assert_eq!(sample.get("/bin/cat"), Some(0x2000));
    assert_eq!(sample.get(ANONYMOUS_KEY), Some(0x1000));
    assert_eq!(sample.get("[heap]"), Some(0x2000));
    assert_eq!(sample.get(TOTAL_KEY), Some(0x5000));
    assert_eq!(sample.per_path().count(), 3);
    Ok(())
}

#[test]
fn test_sample_of_empty_listing() -> anyhow::Result<()> {
    let root = fake_proc()?;
    let sample = Sampler::new(ProcFs::new(root.path())).sample_process("init")?;
    assert_eq!(sample.total(), 0);
    assert_eq!(sample.totals().len(), 1);
    Ok(())
}

#[test]
fn test_sampling_twice_gives_same_totals() -> anyhow::Result<()> {
    let root = fake_proc()?;
    let sampler = Sampler::new(ProcFs::new(root.path()));
    let first = sampler.sample_pid(300)?;
    let second = sampler.sample_pid(300)?;
    assert_eq!(first.totals(), second.totals());
    Ok(())
}

#[test]
fn test_unknown_process_is_not_found() -> anyhow::Result<()> {
    let root = fake_proc()?;
    let err = Sampler::new(ProcFs::new(root.path()))
        .sample_process("dog")
        .unwrap_err();
    assert!(err.is_not_found());
    Ok(())
}

#[test]
fn test_missing_maps_is_an_environment_error() -> anyhow::Result<()> {
    let root = fake_proc()?;
    let err = Sampler::new(ProcFs::new(root.path()))
        .sample_pid(999)
        .unwrap_err();
    assert!(matches!(err, Error::Open { .. }));
    assert!(!err.is_not_found());
    Ok(())
}

#[test]
fn test_aggregate_matches_sample() -> anyhow::Result<()> {
    let root = fake_proc()?;
    let procfs = ProcFs::new(root.path());
    let pid = procfs.find_pid("cat")?;
    let agg =
        Aggregator::default().aggregate_files(procfs.maps_path(pid), procfs.mem_path(pid))?;
    let sample = Sampler::new(procfs).sample_pid(pid)?;

    assert_eq!(agg.total(), sample.total());
    for (path, bytes) in sample.per_path() {
        assert_eq!(agg.get(path).map(|o| o.total_size()), Some(bytes), "{}", path);
    }
    let cat = agg.get("/bin/cat").unwrap();
    assert_eq!(cat.chunks()[0].data()[0], 1);
    assert_eq!(cat.chunks()[1].data()[0], 2);
    Ok(())
}

#[test]
fn test_aggregate_with_vanished_regions() -> anyhow::Result<()> {
    let root = fake_proc()?;
    let procfs = ProcFs::new(root.path());

    let strict = Aggregator::default()
        .aggregate_files(procfs.maps_path(301), procfs.mem_path(301))
        .unwrap_err();
    assert!(strict.is_stale());

    let agg = Aggregator::new(ReadOptions {
        policy: ReadPolicy::SkipStale,
        deadline: None,
    })
    .aggregate_files(procfs.maps_path(301), procfs.mem_path(301))?;
    assert_eq!(agg.total(), 0x2000);
    assert_eq!(agg.skipped().len(), 2);
    Ok(())
}

#[test]
fn test_non_utf8_backing_path() -> anyhow::Result<()> {
    let root = fake_proc()?;
    add_process(root.path(), 302, "lib", "", 0x2000)?;
    fs::write(
        root.path().join("302/maps"),
        b"00001000-00002000 r-xp 00000000 08:01 77 /usr/lib/caf\xe9.so\n",
    )?;
    let procfs = ProcFs::new(root.path());

    let sample = Sampler::new(procfs.clone()).sample_process("lib")?;
    assert_eq!(sample.get("/usr/lib/caf\u{fffd}.so"), Some(0x1000));
    assert_eq!(sample.total(), 0x1000);

    let agg =
        Aggregator::default().aggregate_files(procfs.maps_path(302), procfs.mem_path(302))?;
    assert_eq!(
        agg.get("/usr/lib/caf\u{fffd}.so").map(|o| o.total_size()),
        Some(0x1000)
    );
    Ok(())
}
