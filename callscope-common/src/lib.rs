//! # Shared Wire Definitions (Agent ↔ Console)
//!
//! Constants and primitive codecs shared between the in-process profiling
//! agent and the console that talks to it. Both sides must agree on every
//! value in this crate, so it has no dependencies and no behaviour beyond
//! encoding.
//!
//! ## Byte Order
//!
//! Every integer on the wire is big-endian. Strings are a `u16` byte length
//! followed by that many bytes of UTF-8.
//!
//! ## Key Items
//!
//! - [`Command`] - Request codes understood by the agent
//! - [`STATUS_ACK`] / [`STATUS_ERROR`] / [`STATUS_UNKNOWN_COMMAND`] - Response status
//! - [`SNAPSHOT_MAGIC`] - First four bytes of every snapshot stream
//! - [`wire`] - Read/write helpers for the primitive types above

// ============================================================================
// Connection
// ============================================================================

/// Version string written by the agent as soon as a connection is accepted.
///
/// The console refuses to talk to an agent announcing a different string.
pub const AGENT_VERSION: &str = concat!("callscope ", env!("CARGO_PKG_VERSION"));

/// TCP port the agent listens on unless configured otherwise
pub const DEFAULT_PORT: u16 = 7890;

// ============================================================================
// Commands and Status Codes
// ============================================================================

/// Request codes sent by the console as a big-endian `i32`.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Reclaim resources of terminated threads
    Gc = 1,
    /// Take a call-trace snapshot (ack, then snapshot stream)
    Snapshot = 2,
    /// Zero all method statistics
    ResetStats = 3,
    /// Acknowledge and close the connection
    Disconnect = 4,
    /// Install new instrumentation rules and redefine affected classes
    ApplyRules = 5,
    /// List instrumentable classes and whether they are instrumented
    ListClasses = 6,
    /// Runtime metadata (executable, arguments, uptime, environment)
    GetRuntimeInfo = 7,
    /// Memory usage of the profiled process
    GetMemoryInfo = 8,
    /// Per-thread information, including the current instrumented stack
    GetThreadInfo = 9,
    /// Toggle contention / CPU-time monitoring
    SetThreadMonitoring = 10,
}

impl Command {
    /// Numeric code as sent on the wire
    #[must_use]
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl TryFrom<i32> for Command {
    type Error = i32;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        Ok(match code {
            1 => Self::Gc,
            2 => Self::Snapshot,
            3 => Self::ResetStats,
            4 => Self::Disconnect,
            5 => Self::ApplyRules,
            6 => Self::ListClasses,
            7 => Self::GetRuntimeInfo,
            8 => Self::GetMemoryInfo,
            9 => Self::GetThreadInfo,
            10 => Self::SetThreadMonitoring,
            other => return Err(other),
        })
    }
}

/// Command accepted and executed
pub const STATUS_ACK: i32 = 0x00;

/// Command understood but failed on the agent side
pub const STATUS_ERROR: i32 = 0x01;

/// Command code not recognised by the agent
pub const STATUS_UNKNOWN_COMMAND: i32 = 0x02;

/// Terminates the progress stream of an `ApplyRules` response
pub const PROGRESS_END: i32 = -1;

/// Terminates the progress stream of an `ApplyRules` whose reload aborted
pub const PROGRESS_FAILED: i32 = -2;

/// The agent reports `ApplyRules` progress once every this many probed classes
pub const PROGRESS_STRIDE: usize = 50;

// ============================================================================
// Snapshot Format
// ============================================================================

/// Identifies a call-trace snapshot stream. Never changes.
pub const SNAPSHOT_MAGIC: u32 = 0xBABA_CA00;

/// Snapshot protocol version.
///
/// Different versions may share nothing; there is no backwards compatibility.
pub const SNAPSHOT_PROTOCOL_VERSION: u32 = 0x0000_0001;

/// Snapshot holding per-method timing statistics (the only type so far)
pub const SNAPSHOT_TYPE_CALL_TRACE: u32 = 0x0000_0001;

// ============================================================================
// Engine Ceilings
// ============================================================================

/// Maximum number of methods registered within one session.
///
/// The local part of a method id is 16 bits wide.
pub const MAX_METHODS_PER_SESSION: usize = 65_535;

/// Default maximum depth of a per-thread call stack
pub const DEFAULT_MAX_CALL_DEPTH: usize = 1024;

// ============================================================================
// Primitive Codec
// ============================================================================

/// Big-endian read/write helpers over `std::io`.
pub mod wire {
    use std::io::{self, Read, Write};

    pub fn write_u16<W: Write>(w: &mut W, v: u16) -> io::Result<()> {
        w.write_all(&v.to_be_bytes())
    }

    pub fn write_u32<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
        w.write_all(&v.to_be_bytes())
    }

    pub fn write_i32<W: Write>(w: &mut W, v: i32) -> io::Result<()> {
        w.write_all(&v.to_be_bytes())
    }

    pub fn write_u64<W: Write>(w: &mut W, v: u64) -> io::Result<()> {
        w.write_all(&v.to_be_bytes())
    }

    pub fn write_i64<W: Write>(w: &mut W, v: i64) -> io::Result<()> {
        w.write_all(&v.to_be_bytes())
    }

    pub fn write_bool<W: Write>(w: &mut W, v: bool) -> io::Result<()> {
        w.write_all(&[u8::from(v)])
    }

    /// Write a `u16`-length-prefixed UTF-8 string.
    ///
    /// # Errors
    /// `InvalidInput` if the encoded string is longer than 65535 bytes.
    pub fn write_utf<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
        let len = u16::try_from(s.len()).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("string of {} bytes does not fit a u16 length", s.len()),
            )
        })?;
        write_u16(w, len)?;
        w.write_all(s.as_bytes())
    }

    fn read_array<R: Read, const N: usize>(r: &mut R) -> io::Result<[u8; N]> {
        let mut buf = [0u8; N];
        r.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn read_u16<R: Read>(r: &mut R) -> io::Result<u16> {
        read_array(r).map(u16::from_be_bytes)
    }

    pub fn read_u32<R: Read>(r: &mut R) -> io::Result<u32> {
        read_array(r).map(u32::from_be_bytes)
    }

    pub fn read_i32<R: Read>(r: &mut R) -> io::Result<i32> {
        read_array(r).map(i32::from_be_bytes)
    }

    pub fn read_u64<R: Read>(r: &mut R) -> io::Result<u64> {
        read_array(r).map(u64::from_be_bytes)
    }

    pub fn read_i64<R: Read>(r: &mut R) -> io::Result<i64> {
        read_array(r).map(i64::from_be_bytes)
    }

    pub fn read_bool<R: Read>(r: &mut R) -> io::Result<bool> {
        read_array::<R, 1>(r).map(|[b]| b != 0)
    }

    /// Read a `u16`-length-prefixed UTF-8 string.
    ///
    /// # Errors
    /// `InvalidData` if the bytes are not valid UTF-8.
    pub fn read_utf<R: Read>(r: &mut R) -> io::Result<String> {
        let len = read_u16(r)?;
        let mut buf = vec![0u8; usize::from(len)];
        r.read_exact(&mut buf)?;
        String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}
