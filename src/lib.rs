//! Per-backing-object accounting of a Linux process's readable memory.
//!
//! The crate parses `/proc/<PID>/maps` into [`MemoryRegion`]s and then either
//!
//! - takes a [`MemorySample`]: the readable bytes mapped from each backing object, plus their sum
//!   under [`TOTAL_KEY`], without touching the process's memory; or
//! - reads the bytes of every readable region through `/proc/<PID>/mem` and groups them by
//!   backing object into an [`Aggregation`].
//!
//! Reading another process's memory requires root or `CAP_SYS_PTRACE`; see [`check_privilege`].
#![doc(html_root_url = "https://docs.rs/procmem/0.1.0")]
#![warn(rust_2018_idioms)]
#![deny(unreachable_pub, rustdoc::broken_intra_doc_links)]

mod address;
mod aggregate;
mod error;
mod image;
mod maps;
mod privilege;
mod procfs;
mod sample;

pub use address::{decode_address, DecodedAddress};
pub use aggregate::{AggregatedObject, Aggregation, Aggregator, SkippedRegion};
pub use error::{Error, Result};
pub use image::{MemoryChunk, MemoryImage, ReadOptions, ReadPolicy};
pub use maps::{
    parse_map_line, parse_maps, read_map_lines, read_maps, Backing, DeviceNumbers, MemoryRegion,
    PagePermissions, Span, ANONYMOUS_KEY,
};
pub use privilege::{check_privilege, is_root};
pub use procfs::ProcFs;
pub use sample::{sample_lines, sample_regions, MemorySample, Sampler, TOTAL_KEY};
