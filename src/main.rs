use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{ArgGroup, Parser, ValueEnum};
use serde_json::json;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use procmem::{
    check_privilege, read_maps, Aggregation, Aggregator, MemorySample, ProcFs, ReadOptions,
    ReadPolicy, Sampler, TOTAL_KEY,
};

/// Exit status when no process matches the requested name.
const EXIT_NOT_FOUND: u8 = 2;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Readable bytes per backing object, from the map listing alone
    Sample,
    /// Read every readable region and group the chunks per backing object
    Chunks,
    /// List the bounds of every readable region
    Regions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(
    name = "procmem",
    version,
    about = "Report how much readable memory of a process belongs to each mapped file",
    group(ArgGroup::new("target").required(true).args(["name", "pid"]))
)]
struct Args {
    /// Name of the process to inspect, as found in the `Name:` field of its status file
    #[arg(short = 'n', long)]
    name: Option<String>,

    /// PID of the process to inspect
    #[arg(short = 'p', long)]
    pid: Option<u32>,

    /// What to report
    #[arg(short = 'm', long, value_enum, default_value = "sample")]
    mode: Mode,

    /// Output format
    #[arg(short = 'f', long, value_enum, default_value = "text")]
    format: Format,

    /// Where procfs is mounted
    #[arg(long, env = "PROCMEM_PROC_ROOT", default_value = ProcFs::DEFAULT_ROOT)]
    proc_root: String,

    /// Abort on the first region that cannot be read, instead of skipping vanished ones
    #[arg(long)]
    strict: bool,

    /// Give up on a single region read after this many milliseconds
    #[arg(long, value_name = "MS")]
    read_timeout_ms: Option<u64>,

    /// Do not require root or CAP_SYS_PTRACE
    #[arg(long)]
    skip_privilege_check: bool,

    /// Log level; RUST_LOG takes precedence when set
    #[arg(long, value_enum, env = "PROCMEM_LOG", default_value = "warn")]
    log_level: LogLevel,
}

fn setup_logging(args: &Args) {
    let level = match args.log_level {
        LogLevel::Off => None,
        LogLevel::Error => Some(Level::ERROR),
        LogLevel::Warn => Some(Level::WARN),
        LogLevel::Info => Some(Level::INFO),
        LogLevel::Debug => Some(Level::DEBUG),
        LogLevel::Trace => Some(Level::TRACE),
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| match level {
        Some(level) => EnvFilter::new(level.as_str()),
        None => EnvFilter::new("off"),
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn resolve_pid(procfs: &ProcFs, args: &Args) -> procmem::Result<u32> {
    match (args.pid, &args.name) {
        (Some(pid), _) => Ok(pid),
        (None, Some(name)) => procfs.find_pid(name),
        (None, None) => unreachable!("clap requires --name or --pid"),
    }
}

fn print_sample(sample: &MemorySample, format: Format) -> anyhow::Result<()> {
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(sample)?),
        Format::Text => {
            for (path, bytes) in sample.per_path() {
                println!("{:<64} {:>16}", path, bytes);
            }
            println!("{:<64} {:>16}", TOTAL_KEY, sample.total());
            if sample.indeterminate_regions() > 0 {
                println!(
                    "({} region(s) of indeterminate size not accounted)",
                    sample.indeterminate_regions()
                );
            }
            println!("sampled at {}", sample.sample_time().to_rfc3339());
        }
    }
    Ok(())
}

fn print_aggregation(agg: &Aggregation, format: Format) -> anyhow::Result<()> {
    match format {
        Format::Json => {
            let mut objects = serde_json::Map::new();
            for (path, obj) in agg.objects() {
                objects.insert(
                    path.clone(),
                    json!({ "chunks": obj.chunks().len(), "bytes": obj.total_size() }),
                );
            }
            let skipped: Vec<_> = agg
                .skipped()
                .iter()
                .map(|s| json!({ "region": s.region.to_string(), "error": s.error.to_string() }))
                .collect();
            let out = json!({ "objects": objects, TOTAL_KEY: agg.total(), "skipped": skipped });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Format::Text => {
            for (path, obj) in agg.objects() {
                println!(
                    "{:<64} {:>6} {:>16}",
                    path,
                    obj.chunks().len(),
                    obj.total_size()
                );
            }
            println!("{:<64} {:>6} {:>16}", TOTAL_KEY, "", agg.total());
            for s in agg.skipped() {
                println!("skipped {}: {}", s.region, s.error);
            }
        }
    }
    Ok(())
}

fn print_regions(procfs: &ProcFs, pid: u32, format: Format) -> anyhow::Result<()> {
    let regions = read_maps(procfs.maps_path(pid))?;
    let readable = regions.iter().filter(|r| r.readable());
    match format {
        Format::Json => {
            let out: Vec<_> = readable
                .map(|r| {
                    json!({
                        "start": r.start().raw(),
                        "end": r.end().raw(),
                        "perms": r.permissions().to_string(),
                        "path": r.key(),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Format::Text => readable.for_each(|r| println!("{} {}", r.start().raw(), r.end().raw())),
    }
    Ok(())
}

fn run(args: &Args) -> anyhow::Result<()> {
    if !args.skip_privilege_check {
        check_privilege().context("cannot inspect other processes' memory")?;
    }
    let procfs = ProcFs::new(&args.proc_root);
    let pid = resolve_pid(&procfs, args)?;
    info!(pid, "inspecting process");

    match args.mode {
        Mode::Sample => {
            let sample = Sampler::new(procfs).sample_pid(pid)?;
            print_sample(&sample, args.format)
        }
        Mode::Chunks => {
            let options = ReadOptions {
                policy: if args.strict {
                    ReadPolicy::Strict
                } else {
                    ReadPolicy::SkipStale
                },
                deadline: args.read_timeout_ms.map(Duration::from_millis),
            };
            let agg = Aggregator::new(options)
                .aggregate_files(procfs.maps_path(pid), procfs.mem_path(pid))?;
            if !agg.skipped().is_empty() {
                warn!(skipped = agg.skipped().len(), "some regions could not be read");
            }
            print_aggregation(&agg, args.format)
        }
        Mode::Regions => print_regions(&procfs, pid, args.format),
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    setup_logging(&args);

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("procmem: {:#}", e);
            match e.downcast_ref::<procmem::Error>() {
                Some(pe) if pe.is_not_found() => ExitCode::from(EXIT_NOT_FOUND),
                _ => ExitCode::FAILURE,
            }
        }
    }
}
