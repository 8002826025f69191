//! Response payloads of the introspection commands
//!
//! Each payload knows how to write itself to and read itself from the
//! command stream. Lists and maps are prefixed with an `i32` count.

use callscope_common::wire::{
    read_bool, read_i32, read_i64, read_utf, write_bool, write_i32, write_i64, write_utf,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::{self, Read, Write};

/// Longest string that fits the `u16` length prefix, cut on a char boundary
fn clip(s: &str) -> &str {
    let max = usize::from(u16::MAX);
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn write_text<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    write_utf(w, clip(s))
}

fn write_len<W: Write>(w: &mut W, len: usize) -> io::Result<()> {
    let len = i32::try_from(len)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "list too long"))?;
    write_i32(w, len)
}

fn read_len<R: Read>(r: &mut R) -> io::Result<usize> {
    let len = read_i32(r)?;
    usize::try_from(len)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, format!("negative length {len}")))
}

fn write_string_list<W: Write>(w: &mut W, items: &[String]) -> io::Result<()> {
    write_len(w, items.len())?;
    items.iter().try_for_each(|s| write_text(w, s))
}

fn read_string_list<R: Read>(r: &mut R) -> io::Result<Vec<String>> {
    let len = read_len(r)?;
    (0..len).map(|_| read_utf(r)).collect()
}

/// A class known to the instrumentation layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassInfo {
    pub name: String,
    pub instrumented: bool,
}

/// Write the `LIST_CLASSES` body: count, then (name, instrumented) pairs.
///
/// # Errors
/// I/O failures.
pub fn write_class_list<W: Write>(w: &mut W, classes: &[ClassInfo]) -> io::Result<()> {
    write_len(w, classes.len())?;
    for class in classes {
        write_text(w, &class.name)?;
        write_bool(w, class.instrumented)?;
    }
    Ok(())
}

/// # Errors
/// I/O failures or a negative count.
pub fn read_class_list<R: Read>(r: &mut R) -> io::Result<Vec<ClassInfo>> {
    let len = read_len(r)?;
    (0..len)
        .map(|_| -> io::Result<ClassInfo> {
            Ok(ClassInfo { name: read_utf(r)?, instrumented: read_bool(r)? })
        })
        .collect()
}

/// Metadata of the profiled process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeInfo {
    /// `pid@hostname`
    pub name: String,
    /// Agent name and version
    pub runtime: String,
    pub executable: String,
    pub working_dir: String,
    pub arguments: Vec<String>,
    pub library_path: String,
    /// Process start, ms since epoch
    pub start_time_ms: i64,
    pub uptime_ms: i64,
    pub environment: BTreeMap<String, String>,
}

impl RuntimeInfo {
    /// # Errors
    /// I/O failures.
    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_text(w, &self.name)?;
        write_text(w, &self.runtime)?;
        write_text(w, &self.executable)?;
        write_text(w, &self.working_dir)?;
        write_string_list(w, &self.arguments)?;
        write_text(w, &self.library_path)?;
        write_i64(w, self.start_time_ms)?;
        write_i64(w, self.uptime_ms)?;
        write_len(w, self.environment.len())?;
        for (key, value) in &self.environment {
            write_text(w, key)?;
            write_text(w, value)?;
        }
        Ok(())
    }

    /// # Errors
    /// I/O failures or malformed data.
    pub fn read<R: Read>(r: &mut R) -> io::Result<Self> {
        let name = read_utf(r)?;
        let runtime = read_utf(r)?;
        let executable = read_utf(r)?;
        let working_dir = read_utf(r)?;
        let arguments = read_string_list(r)?;
        let library_path = read_utf(r)?;
        let start_time_ms = read_i64(r)?;
        let uptime_ms = read_i64(r)?;
        let len = read_len(r)?;
        let environment = (0..len)
            .map(|_| -> io::Result<(String, String)> { Ok((read_utf(r)?, read_utf(r)?)) })
            .collect::<io::Result<BTreeMap<_, _>>>()?;
        Ok(Self {
            name,
            runtime,
            executable,
            working_dir,
            arguments,
            library_path,
            start_time_ms,
            uptime_ms,
            environment,
        })
    }
}

/// One memory pool, in bytes. `-1` marks an undefined value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemoryUsage {
    pub init: i64,
    pub used: i64,
    pub committed: i64,
    pub max: i64,
}

impl MemoryUsage {
    pub const UNDEFINED: i64 = -1;

    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_i64(w, self.init)?;
        write_i64(w, self.used)?;
        write_i64(w, self.committed)?;
        write_i64(w, self.max)
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self> {
        Ok(Self { init: read_i64(r)?, used: read_i64(r)?, committed: read_i64(r)?, max: read_i64(r)? })
    }
}

/// Memory usage of the profiled process.
///
/// `heap` tracks the resident set, `non_heap` the stack and mapped code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemoryInfo {
    pub heap: MemoryUsage,
    pub non_heap: MemoryUsage,
    /// Objects awaiting finalization; always 0 for native processes
    pub pending_finalization: i32,
}

impl MemoryInfo {
    /// # Errors
    /// I/O failures.
    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        self.heap.write(w)?;
        self.non_heap.write(w)?;
        write_i32(w, self.pending_finalization)
    }

    /// # Errors
    /// I/O failures.
    pub fn read<R: Read>(r: &mut R) -> io::Result<Self> {
        Ok(Self {
            heap: MemoryUsage::read(r)?,
            non_heap: MemoryUsage::read(r)?,
            pending_finalization: read_i32(r)?,
        })
    }
}

/// Scheduler state of a thread, from `/proc/<pid>/task/<tid>/stat`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ThreadState {
    Running,
    Sleeping,
    /// Uninterruptible wait, usually I/O
    Blocked,
    Stopped,
    Zombie,
    Idle,
    Unknown,
}

impl ThreadState {
    #[must_use]
    pub fn from_proc_code(code: char) -> Self {
        match code {
            'R' => Self::Running,
            'S' => Self::Sleeping,
            'D' => Self::Blocked,
            'T' | 't' => Self::Stopped,
            'Z' | 'X' => Self::Zombie,
            'I' => Self::Idle,
            _ => Self::Unknown,
        }
    }

    fn code(self) -> i32 {
        match self {
            Self::Running => 0,
            Self::Sleeping => 1,
            Self::Blocked => 2,
            Self::Stopped => 3,
            Self::Zombie => 4,
            Self::Idle => 5,
            Self::Unknown => -1,
        }
    }

    fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Running,
            1 => Self::Sleeping,
            2 => Self::Blocked,
            3 => Self::Stopped,
            4 => Self::Zombie,
            5 => Self::Idle,
            _ => Self::Unknown,
        }
    }
}

/// One thread of the profiled process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadInfo {
    /// Kernel thread id
    pub id: i64,
    pub name: String,
    pub state: ThreadState,
    /// User + system CPU time, `-1` when CPU time monitoring is off
    pub cpu_time_ns: i64,
    /// Open instrumented methods, innermost first
    pub stack: Vec<String>,
}

impl ThreadInfo {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_i64(w, self.id)?;
        write_text(w, &self.name)?;
        write_i32(w, self.state.code())?;
        write_i64(w, self.cpu_time_ns)?;
        write_string_list(w, &self.stack)
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self> {
        Ok(Self {
            id: read_i64(r)?,
            name: read_utf(r)?,
            state: ThreadState::from_code(read_i32(r)?),
            cpu_time_ns: read_i64(r)?,
            stack: read_string_list(r)?,
        })
    }
}

/// # Errors
/// I/O failures.
pub fn write_thread_infos<W: Write>(w: &mut W, threads: &[ThreadInfo]) -> io::Result<()> {
    write_len(w, threads.len())?;
    threads.iter().try_for_each(|t| t.write(w))
}

/// # Errors
/// I/O failures or malformed data.
pub fn read_thread_infos<R: Read>(r: &mut R) -> io::Result<Vec<ThreadInfo>> {
    let len = read_len(r)?;
    (0..len).map(|_| ThreadInfo::read(r)).collect()
}

/// Thread selection sent with `GET_THREAD_INFO`: count, ids, max depth.
///
/// An empty id list selects every thread.
///
/// # Errors
/// I/O failures.
pub fn write_thread_request<W: Write>(w: &mut W, ids: &[i64], max_depth: i32) -> io::Result<()> {
    write_len(w, ids.len())?;
    ids.iter().try_for_each(|&id| write_i64(w, id))?;
    write_i32(w, max_depth)
}
