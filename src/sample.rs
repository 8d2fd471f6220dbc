use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::Result;
use crate::maps::{parse_map_line, read_map_lines, MemoryRegion, Span};
use crate::procfs::ProcFs;

/// The reserved key of a [`MemorySample`] that holds the sum over all backing objects.
pub const TOTAL_KEY: &str = "Total";

/// A point-in-time account of how many readable bytes each backing object of a process maps.
///
/// The value under [`TOTAL_KEY`] always equals the sum of every other value in the sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemorySample {
    sample_time: DateTime<Utc>,
    totals: BTreeMap<String, u64>,
    indeterminate_regions: usize,
}

impl MemorySample {
    /// When the map listing was captured.
    pub fn sample_time(&self) -> DateTime<Utc> {
        self.sample_time
    }

    /// Readable bytes mapped from the given backing path (or [`TOTAL_KEY`]).
    pub fn get(&self, key: &str) -> Option<u64> {
        self.totals.get(key).copied()
    }

    /// Readable bytes across all backing objects.
    pub fn total(&self) -> u64 {
        self.get(TOTAL_KEY).unwrap_or(0)
    }

    /// Per-path totals, ordered by path, without the [`TOTAL_KEY`] entry.
    pub fn per_path(&self) -> impl Iterator<Item = (&str, u64)> + '_ {
        self.totals
            .iter()
            .filter(|(k, _)| k.as_str() != TOTAL_KEY)
            .map(|(k, v)| (k.as_str(), *v))
    }

    /// All totals, [`TOTAL_KEY`] included.
    pub fn totals(&self) -> &BTreeMap<String, u64> {
        &self.totals
    }

    /// Readable regions left out of the totals because their size could not be told.
    pub fn indeterminate_regions(&self) -> usize {
        self.indeterminate_regions
    }
}

/// Account the readable regions among `regions`, without reading any memory.
///
/// Per-path totals and the grand total saturate at `u64::MAX`.
pub fn sample_regions<'a, I>(regions: I, sample_time: DateTime<Utc>) -> MemorySample
where
    I: IntoIterator<Item = &'a MemoryRegion>,
{
    let mut totals: BTreeMap<String, u64> = BTreeMap::new();
    let mut indeterminate_regions = 0;
    for region in regions.into_iter().filter(|r| r.readable()) {
        match region.span() {
            Span::Known(size) => {
                let t = totals.entry(region.key().to_owned()).or_insert(0);
                *t = t.saturating_add(size);
            }
            Span::Indeterminate => {
                debug!(region = %region, "region of indeterminate size left out of the sample");
                indeterminate_regions += 1;
            }
        }
    }
    // Only once every per-path total is final.
    let total = totals.values().fold(0u64, |acc, n| acc.saturating_add(*n));
    totals.insert(TOTAL_KEY.to_owned(), total);

    MemorySample {
        sample_time,
        totals,
        indeterminate_regions,
    }
}

/// Parse raw map-listing lines and account their readable regions, stamping the sample with the
/// current time. Blank lines are ignored.
pub fn sample_lines<I, S>(lines: I) -> Result<MemorySample>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let sample_time = Utc::now();
    Ok(sample_regions(&parse_lines(lines)?, sample_time))
}

fn parse_lines<I, S>(lines: I) -> Result<Vec<MemoryRegion>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    lines
        .into_iter()
        .filter(|line| !line.as_ref().trim().is_empty())
        .map(|line| parse_map_line(line.as_ref()))
        .collect()
}

/// Takes [`MemorySample`]s of processes through their map listings.
#[derive(Debug, Clone, Default)]
pub struct Sampler {
    procfs: ProcFs,
}

impl Sampler {
    /// Construct a new `Sampler` that resolves processes under the given procfs.
    pub fn new(procfs: ProcFs) -> Self {
        Sampler { procfs }
    }

    /// The procfs this sampler resolves processes under.
    pub fn procfs(&self) -> &ProcFs {
        &self.procfs
    }

    /// Sample the map listing at the given path, e.g. `/proc/<PID>/maps`.
    pub fn sample<P: AsRef<Path>>(&self, maps_path: P) -> Result<MemorySample> {
        let sample_time = Utc::now();
        let regions = parse_lines(read_map_lines(&maps_path)?)?;
        let sample = sample_regions(&regions, sample_time);
        info!(
            maps = %maps_path.as_ref().display(),
            total = sample.total(),
            objects = sample.totals.len() - 1,
            "sampled map listing"
        );
        Ok(sample)
    }

    /// Sample the process with the given PID.
    pub fn sample_pid(&self, pid: u32) -> Result<MemorySample> {
        self.sample(self.procfs.maps_path(pid))
    }

    /// Sample the first process whose name is exactly `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProcessNotFound`] if no process carries that name.
    ///
    /// [`Error::ProcessNotFound`]: crate::Error::ProcessNotFound
    pub fn sample_process(&self, name: &str) -> Result<MemorySample> {
        let pid = self.procfs.find_pid(name)?;
        self.sample_pid(pid)
    }
}
