//! Process introspection from `/proc/self`
//!
//! Backs the runtime, memory and thread commands. Everything here is best
//! effort: a file that cannot be read yields an undefined value rather than
//! an error, so a restricted `/proc` never breaks the command channel.

use super::payload::{MemoryInfo, MemoryUsage, RuntimeInfo, ThreadInfo, ThreadState};
use crate::engine::ThreadStack;
use callscope_common::AGENT_VERSION;
use std::collections::HashMap;
use std::fs;
use std::time::{SystemTime, UNIX_EPOCH};

fn unix_millis(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

/// Clock ticks per second used by `/proc` time fields
fn clock_ticks_per_second() -> i64 {
    // SAFETY: sysconf only reads a configuration value
    #[allow(unsafe_code)]
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 {
        i64::from(ticks)
    } else {
        100
    }
}

/// Fields of a `stat` line after the parenthesised command name.
///
/// The command may itself contain spaces and parentheses, so split on the
/// last `)`. Index 0 of the result is the state (field 3 in `proc(5)`).
fn stat_fields(stat: &str) -> Option<Vec<&str>> {
    let (_, rest) = stat.rsplit_once(')')?;
    Some(rest.split_whitespace().collect())
}

/// Process start time from `/proc/self/stat` and the boot time in `/proc/stat`
fn process_start_ms() -> Option<i64> {
    let stat = fs::read_to_string("/proc/self/stat").ok()?;
    // starttime is field 22, i.e. index 19 after the state field
    let start_ticks: i64 = stat_fields(&stat)?.get(19)?.parse().ok()?;
    let boot_secs: i64 = fs::read_to_string("/proc/stat")
        .ok()?
        .lines()
        .find_map(|line| line.strip_prefix("btime "))?
        .trim()
        .parse()
        .ok()?;
    Some(boot_secs * 1000 + start_ticks * 1000 / clock_ticks_per_second())
}

/// Collect runtime metadata. `fallback_start` is used when `/proc` does not
/// reveal the process start.
#[must_use]
pub fn runtime_info(fallback_start: SystemTime) -> RuntimeInfo {
    let hostname = fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|h| h.trim().to_string())
        .unwrap_or_else(|_| "localhost".to_string());
    let now_ms = unix_millis(SystemTime::now());
    let start_time_ms = process_start_ms().unwrap_or_else(|| unix_millis(fallback_start));

    RuntimeInfo {
        name: format!("{}@{hostname}", std::process::id()),
        runtime: AGENT_VERSION.to_string(),
        executable: std::env::current_exe()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        working_dir: std::env::current_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        arguments: std::env::args_os().map(|a| a.to_string_lossy().into_owned()).collect(),
        library_path: std::env::var("LD_LIBRARY_PATH").unwrap_or_default(),
        start_time_ms,
        uptime_ms: (now_ms - start_time_ms).max(0),
        environment: std::env::vars_os()
            .map(|(k, v)| (k.to_string_lossy().into_owned(), v.to_string_lossy().into_owned()))
            .collect(),
    }
}

/// `kB` values of `/proc/self/status`, in bytes
fn status_bytes(status: &str) -> HashMap<&str, i64> {
    status
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            let kb: i64 = value.trim().strip_suffix("kB")?.trim().parse().ok()?;
            Some((key, kb * 1024))
        })
        .collect()
}

/// Current resident set size in bytes, if known
#[must_use]
pub fn resident_bytes() -> Option<i64> {
    let status = fs::read_to_string("/proc/self/status").ok()?;
    status_bytes(&status).get("VmRSS").copied()
}

/// Memory usage relative to the resident size seen at agent start.
#[must_use]
pub fn memory_info(baseline_rss: Option<i64>) -> MemoryInfo {
    let status = fs::read_to_string("/proc/self/status").unwrap_or_default();
    let values = status_bytes(&status);
    let get = |key: &str| values.get(key).copied().unwrap_or(MemoryUsage::UNDEFINED);

    let code_and_stack: i64 =
        ["VmStk", "VmExe", "VmLib"].iter().filter_map(|k| values.get(k)).sum();

    MemoryInfo {
        heap: MemoryUsage {
            init: baseline_rss.unwrap_or(MemoryUsage::UNDEFINED),
            used: get("VmRSS"),
            committed: get("VmHWM"),
            max: MemoryUsage::UNDEFINED,
        },
        non_heap: MemoryUsage {
            init: MemoryUsage::UNDEFINED,
            used: code_and_stack,
            committed: code_and_stack,
            max: MemoryUsage::UNDEFINED,
        },
        pending_finalization: 0,
    }
}

fn read_thread(tid: i64, ticks: i64, with_cpu: bool) -> Option<(String, ThreadState, i64)> {
    let base = format!("/proc/self/task/{tid}");
    let stat = fs::read_to_string(format!("{base}/stat")).ok()?;
    let fields = stat_fields(&stat)?;
    let state = fields
        .first()
        .and_then(|s| s.chars().next())
        .map_or(ThreadState::Unknown, ThreadState::from_proc_code);

    let cpu_time_ns = if with_cpu {
        // utime and stime are fields 14 and 15
        let utime: i64 = fields.get(11)?.parse().ok()?;
        let stime: i64 = fields.get(12)?.parse().ok()?;
        (utime + stime) * 1_000_000_000 / ticks
    } else {
        -1
    };

    let name = fs::read_to_string(format!("{base}/comm"))
        .map(|c| c.trim().to_string())
        .unwrap_or_default();
    Some((name, state, cpu_time_ns))
}

/// Describe threads of this process.
///
/// `ids` selects kernel thread ids (empty = all); unknown ids are skipped.
/// Stacks are cut to `max_depth` frames, a negative depth keeps them whole.
#[must_use]
pub fn thread_info(
    ids: &[i64],
    max_depth: i32,
    with_cpu: bool,
    stacks: &HashMap<i64, ThreadStack>,
) -> Vec<ThreadInfo> {
    let mut tids: Vec<i64> = fs::read_dir("/proc/self/task")
        .map(|entries| {
            entries
                .flatten()
                .filter_map(|e| e.file_name().to_string_lossy().parse().ok())
                .collect()
        })
        .unwrap_or_default();
    if !ids.is_empty() {
        tids.retain(|tid| ids.contains(tid));
    }
    tids.sort_unstable();

    let ticks = clock_ticks_per_second();
    let depth = usize::try_from(max_depth).unwrap_or(usize::MAX);

    tids.into_iter()
        .filter_map(|tid| {
            let (name, state, cpu_time_ns) = read_thread(tid, ticks, with_cpu)?;
            let stack = stacks
                .get(&tid)
                .map(|s| s.frames.iter().take(depth).cloned().collect())
                .unwrap_or_default();
            Some(ThreadInfo { id: tid, name, state, cpu_time_ns, stack })
        })
        .collect()
}
