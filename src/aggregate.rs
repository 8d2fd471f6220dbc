use std::collections::BTreeMap;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::image::{MemoryChunk, MemoryImage, ReadOptions, ReadPolicy};
use crate::maps::{read_maps, MemoryRegion};

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// AggregatedObject
//
///////////////////////////////////////////////////////////////////////////////////////////////////

/// All chunks read from regions that share one backing object, in the order they were listed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatedObject {
    path: String,
    chunks: Vec<MemoryChunk>,
}

impl AggregatedObject {
    fn new(path: &str) -> Self {
        AggregatedObject {
            path: path.to_owned(),
            chunks: Vec::new(),
        }
    }

    /// The backing path, or the anonymous marker.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The chunks, in map-listing order.
    pub fn chunks(&self) -> &[MemoryChunk] {
        &self.chunks
    }

    /// The sum of the sizes of all chunks.
    pub fn total_size(&self) -> u64 {
        self.chunks.iter().map(MemoryChunk::size).sum()
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// Aggregation
//
///////////////////////////////////////////////////////////////////////////////////////////////////

/// A readable region that was left out of an [`Aggregation`], along with the reason.
#[derive(Debug)]
pub struct SkippedRegion {
    /// The region that could not be read.
    pub region: MemoryRegion,
    /// Why it could not be read.
    pub error: Error,
}

/// The raw contents of a process's readable memory, grouped by backing object.
#[derive(Debug, Default)]
pub struct Aggregation {
    objects: BTreeMap<String, AggregatedObject>,
    skipped: Vec<SkippedRegion>,
}

impl Aggregation {
    /// All backing objects, keyed (and ordered) by path.
    pub fn objects(&self) -> &BTreeMap<String, AggregatedObject> {
        &self.objects
    }

    /// The object mapped from the given path, if any of its regions was read.
    pub fn get(&self, path: &str) -> Option<&AggregatedObject> {
        self.objects.get(path)
    }

    /// Readable bytes across all backing objects.
    pub fn total(&self) -> u64 {
        self.objects.values().map(AggregatedObject::total_size).sum()
    }

    /// Regions skipped under [`ReadPolicy::SkipStale`].
    pub fn skipped(&self) -> &[SkippedRegion] {
        &self.skipped
    }

    /// Consume the aggregation, returning the objects.
    pub fn into_objects(self) -> BTreeMap<String, AggregatedObject> {
        self.objects
    }

    fn push(&mut self, key: &str, chunk: MemoryChunk) {
        self.objects
            .entry(key.to_owned())
            .or_insert_with(|| AggregatedObject::new(key))
            .chunks
            .push(chunk);
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// Aggregator
//
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Reads the readable regions of a process and groups their bytes by backing object.
#[derive(Debug, Clone, Copy, Default)]
pub struct Aggregator {
    options: ReadOptions,
}

impl Aggregator {
    /// Construct a new `Aggregator` with the given read settings.
    pub fn new(options: ReadOptions) -> Self {
        Aggregator { options }
    }

    /// Read every readable region from `image`, in order, grouping the chunks by backing path.
    /// Regions without the read permission are skipped silently.
    ///
    /// # Errors
    ///
    /// Under [`ReadPolicy::Strict`], the first region that cannot be read aborts the scan.
    /// Under [`ReadPolicy::SkipStale`], only failures that are not [stale][Error::is_stale] do.
    pub fn aggregate<'a, I>(&self, regions: I, image: &MemoryImage) -> Result<Aggregation>
    where
        I: IntoIterator<Item = &'a MemoryRegion>,
    {
        let mut agg = Aggregation::default();
        for region in regions.into_iter().filter(|r| r.readable()) {
            match image.read_region(region) {
                Ok(chunk) => {
                    debug!(key = region.key(), size = chunk.size(), "read region");
                    agg.push(region.key(), chunk);
                }
                Err(e) if self.options.policy == ReadPolicy::SkipStale && e.is_stale() => {
                    warn!(region = %region, error = %e, "skipping region");
                    agg.skipped.push(SkippedRegion {
                        region: region.clone(),
                        error: e,
                    });
                }
                Err(e) => return Err(e),
            }
        }
        Ok(agg)
    }

    /// Parse the map listing at `maps_path`, then read the listed regions through one handle to
    /// the memory image at `mem_path`. The handle is released before returning, whatever the
    /// outcome.
    pub fn aggregate_files<P, Q>(&self, maps_path: P, mem_path: Q) -> Result<Aggregation>
    where
        P: AsRef<Path>,
        Q: AsRef<Path>,
    {
        let regions = read_maps(maps_path)?;
        let image = MemoryImage::open(mem_path)?.with_deadline(self.options.deadline);
        let agg = self.aggregate(&regions, &image)?;
        info!(
            objects = agg.objects.len(),
            total = agg.total(),
            skipped = agg.skipped.len(),
            "aggregated memory image"
        );
        Ok(agg)
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// tests
//
///////////////////////////////////////////////////////////////////////////////////////////////////
