//! # callscope - Console Entry Point
//!
//! Talks to the agent embedded in a profiled process over its command port:
//! - **Control** (`apply`, `restore`, `reset`, `gc`, `monitor`): change what is recorded
//! - **Inspection** (`classes`, `runtime`, `memory`, `threads`): look at the process
//! - **Snapshots** (`snapshot`, `watch`, `export`): fetch call statistics
//!
//! `inspect` and `export --input` work on saved snapshot files without an agent.

// Time conversions lose precision for display
#![allow(clippy::cast_precision_loss)]

use anyhow::{Context, Result};
use callscope::analysis::{analyze_hotspots, render_tree, CallTreeBuilder, HotspotOrder};
use callscope::cli::{Args, Command};
use callscope::domain::ClientError;
use callscope::engine::ReloadProgress;
use callscope::export::SnapshotJsonExporter;
use callscope::remote::{Client, MemoryUsage};
use callscope::snapshot::{self, Snapshot};
use callscope_common::STATUS_ERROR;
use clap::Parser;
use log::{debug, info};
use std::fs::File;
use std::io::{self, BufWriter};
use std::path::Path;
use std::time::{Duration, Instant};

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_UNAVAILABLE: i32 = 69;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn is_unavailable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::TimedOut
    )
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(client) = cause.downcast_ref::<ClientError>() {
            match client {
                ClientError::VersionMismatch { .. } => return EXIT_UNAVAILABLE,
                ClientError::CommandFailed { status, .. } if *status == STATUS_ERROR => {
                    return EXIT_USAGE;
                }
                _ => {}
            }
        }
        if cause.downcast_ref::<io::Error>().is_some_and(is_unavailable) {
            return EXIT_UNAVAILABLE;
        }
    }
    EXIT_ERROR
}

/// Prints reload progress on stderr
struct ConsoleProgress {
    quiet: bool,
    total: usize,
}

impl ReloadProgress for ConsoleProgress {
    fn set_max_value(&mut self, max: usize) {
        self.total = max;
        if !self.quiet {
            eprintln!("probing {max} classes");
        }
    }

    fn set_value(&mut self, value: usize) {
        if !self.quiet {
            eprintln!("  {value}/{}", self.total);
        }
    }
}

fn ms(ns: u64) -> f64 {
    ns as f64 / 1_000_000.0
}

fn bytes(value: i64) -> String {
    if value == MemoryUsage::UNDEFINED {
        "-".to_string()
    } else {
        format!("{:.1} MiB", value as f64 / (1024.0 * 1024.0))
    }
}

fn print_hotspots(snapshot: &Snapshot, order: HotspotOrder, top: usize) {
    let hotspots = analyze_hotspots(snapshot, order);
    println!(
        "{} | {} methods | {:.1}ms total net",
        snapshot.session(),
        snapshot.len(),
        ms(snapshot.total_net_time_ns())
    );
    println!("{:>7} {:>9} {:>12} {:>12}  METHOD", "EXCL %", "HITS", "NET ms", "EXCL ms");
    for h in hotspots.iter().take(top) {
        println!(
            "{:>6.1}% {:>9} {:>12.3} {:>12.3}  {}",
            h.percentage,
            h.hits,
            ms(h.net_time_ns),
            ms(h.exclusive_time_ns),
            h.name
        );
    }
}

/// Rules given inline or as `@FILE`
fn read_rules(arg: &str) -> Result<String> {
    match arg.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .map(|text| text.trim().to_string())
            .with_context(|| format!("Failed to read rules file: {path}")),
        None => Ok(arg.to_string()),
    }
}

fn inspect(file: &Path, order: HotspotOrder, top: usize, tree: bool) -> Result<()> {
    let snapshot = snapshot::file::load(file)
        .with_context(|| format!("Failed to load snapshot: {}", file.display()))?;
    if tree {
        print!("{}", render_tree(&CallTreeBuilder::new(&snapshot).build()));
    } else {
        print_hotspots(&snapshot, order, top);
    }
    Ok(())
}

fn export(snapshot: &Snapshot, output: Option<&Path>, raw: bool) -> Result<()> {
    let exporter = SnapshotJsonExporter::new(snapshot).hotspots(!raw).call_tree(!raw);
    match output {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            exporter.export(BufWriter::new(file)).context("Failed to write JSON export")?;
            info!("Exported {} methods to {}", snapshot.len(), path.display());
        }
        None => exporter.export(io::stdout().lock()).context("Failed to write JSON export")?,
    }
    Ok(())
}

async fn watch(
    client: &mut Client,
    interval: u64,
    order: HotspotOrder,
    top: usize,
    duration: u64,
    quiet: bool,
) -> Result<()> {
    // Setup Ctrl+C handler
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let started = Instant::now();
    let duration_limit = if duration > 0 { Some(Duration::from_secs(duration)) } else { None };
    let mut exit_reason = "interrupted";
    let mut snapshots = 0usize;

    loop {
        let snapshot =
            tokio::task::block_in_place(|| client.snapshot()).context("Failed to take snapshot")?;
        snapshots += 1;
        println!();
        print_hotspots(&snapshot, order, top);

        if let Some(limit) = duration_limit {
            if started.elapsed() >= limit {
                exit_reason = "duration limit reached";
                break;
            }
        }

        tokio::select! {
            () = tokio::time::sleep(Duration::from_secs(interval.max(1))) => {}
            _ = &mut ctrl_c => {
                break;
            }
        }
    }

    if !quiet {
        eprintln!("\n{exit_reason}: {:.1}s, {snapshots} snapshots", started.elapsed().as_secs_f64());
    }
    Ok(())
}

async fn dispatch(client: &mut Client, command: Command, quiet: bool) -> Result<()> {
    match command {
        Command::Snapshot { output } => {
            let snapshot = client.snapshot().context("Failed to take snapshot")?;
            let path = match output {
                Some(path) => path,
                None => std::env::current_dir()?.join(snapshot::file::default_file_name(&snapshot)),
            };
            snapshot::file::save(&snapshot, &path)
                .with_context(|| format!("Failed to save {}", path.display()))?;
            println!("{} methods saved to {}", snapshot.len(), path.display());
        }
        Command::Reset => {
            client.reset_stats()?;
            if !quiet {
                println!("statistics reset");
            }
        }
        Command::Gc => {
            client.gc()?;
            if !quiet {
                println!("terminated threads reclaimed");
            }
        }
        Command::Apply { rules, options } => {
            let rules = read_rules(&rules)?;
            let mut progress = ConsoleProgress { quiet, total: 0 };
            client.apply_rules(&options, &rules, &mut progress).context("Rules not applied")?;
            if !quiet {
                println!("rules applied");
            }
        }
        Command::Restore => {
            let mut progress = ConsoleProgress { quiet, total: 0 };
            client.restore_classes(&mut progress).context("Restore failed")?;
            if !quiet {
                println!("instrumentation removed");
            }
        }
        Command::Classes { instrumented } => {
            for class in client.list_classes()? {
                if instrumented && !class.instrumented {
                    continue;
                }
                println!("[{}] {}", if class.instrumented { 'x' } else { ' ' }, class.name);
            }
        }
        Command::Runtime { env } => {
            let info = client.runtime_info()?;
            println!("name:        {}", info.name);
            println!("runtime:     {}", info.runtime);
            println!("executable:  {}", info.executable);
            println!("working dir: {}", info.working_dir);
            println!("arguments:   {}", info.arguments.join(" "));
            println!("libraries:   {}", info.library_path);
            println!("started:     {} ms since epoch", info.start_time_ms);
            println!("uptime:      {:.1}s", info.uptime_ms as f64 / 1000.0);
            if env {
                for (key, value) in &info.environment {
                    println!("  {key}={value}");
                }
            }
        }
        Command::Memory => {
            let info = client.memory_info()?;
            println!("{:<10} {:>12} {:>12} {:>12} {:>12}", "", "INIT", "USED", "COMMITTED", "MAX");
            for (label, usage) in [("heap", info.heap), ("non-heap", info.non_heap)] {
                println!(
                    "{label:<10} {:>12} {:>12} {:>12} {:>12}",
                    bytes(usage.init),
                    bytes(usage.used),
                    bytes(usage.committed),
                    bytes(usage.max)
                );
            }
        }
        Command::Threads { ids, depth } => {
            for thread in client.thread_info(&ids, depth)? {
                let cpu = if thread.cpu_time_ns < 0 {
                    "-".to_string()
                } else {
                    format!("{:.1}ms", thread.cpu_time_ns as f64 / 1_000_000.0)
                };
                let state = format!("{:?}", thread.state);
                println!("{:>8} {state:<10} cpu {cpu:>10}  {}", thread.id, thread.name);
                for frame in &thread.stack {
                    println!("           at {frame}");
                }
            }
        }
        Command::Monitor { contention, cpu_time } => {
            let (contention, cpu_time) = client.set_thread_monitoring(contention, cpu_time)?;
            println!("contention monitoring supported: {contention}");
            println!("cpu time monitoring supported:   {cpu_time}");
        }
        Command::Watch { interval, by, top, duration } => {
            watch(client, interval, by, top, duration, quiet).await?;
        }
        Command::Export { output, raw, .. } => {
            let snapshot = client.snapshot().context("Failed to take snapshot")?;
            export(&snapshot, output.as_deref(), raw)?;
        }
        Command::Inspect { file, by, top, tree } => inspect(&file, by, top, tree)?,
    }
    Ok(())
}

#[tokio::main]
async fn run() -> Result<()> {
    let args = Args::parse();
    let quiet = args.quiet;

    let command = match args.command {
        Command::Inspect { file, by, top, tree } => return inspect(&file, by, top, tree),
        Command::Export { input: Some(input), output, raw } => {
            let snapshot = snapshot::file::load(&input)
                .with_context(|| format!("Failed to load snapshot: {}", input.display()))?;
            return export(&snapshot, output.as_deref(), raw);
        }
        command => command,
    };

    let mut client = Client::new();
    client
        .connect_timeout(&args.host, args.port, CONNECT_TIMEOUT)
        .with_context(|| format!("Cannot reach agent at {}:{}", args.host, args.port))?;
    if !quiet {
        eprintln!("callscope v{}", env!("CARGO_PKG_VERSION"));
        eprintln!("agent: {}:{}", args.host, args.port);
    }

    let result = dispatch(&mut client, command, quiet).await;
    if client.is_connected() {
        if let Err(e) = client.disconnect() {
            debug!("Disconnect failed: {e}");
        }
    }
    result
}
