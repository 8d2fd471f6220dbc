//! Prints the backing objects of a process, largest first, after reading the bytes of every
//! readable region from `/proc/<PID>/mem`.
//!
//! Reading another process's memory requires root or `CAP_SYS_PTRACE`.

use procmem::{Aggregator, ProcFs, ReadOptions, ReadPolicy};

/// Retrieve a PID from the command line, in a quick and dirty way.
fn parse_args() -> u32 {
    std::env::args()
        .nth(1)
        .expect("Usage: cargo run --example largest <PID>")
        .parse()
        .expect("<PID> must be a valid integer of a running process")
}

fn main() -> Result<(), procmem::Error> {
    let pid = parse_args();
    let procfs = ProcFs::default();

    // Regions may be unmapped between reading the listing and reading their bytes; skip those.
    let agg = Aggregator::new(ReadOptions {
        policy: ReadPolicy::SkipStale,
        deadline: None,
    })
    .aggregate_files(procfs.maps_path(pid), procfs.mem_path(pid))?;

    let mut objects: Vec<_> = agg.objects().values().collect();
    objects.sort_by_key(|o| std::cmp::Reverse(o.total_size()));
    objects.iter().for_each(|o| {
        eprintln!("{:>12}  {:>4}  {}", o.total_size(), o.chunks().len(), o.path());
    });
    agg.skipped().iter().for_each(|s| {
        eprintln!("-> skipped {}: {}", s.region, s.error);
    });
    eprintln!("\n-> total = {} bytes", agg.total());

    Ok(())
}
