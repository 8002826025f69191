//! Binary snapshot format
//!
//! ```text
//! u32  magic            0xBABACA00
//! u32  protocol version 1
//! u32  snapshot type    1 (call trace)
//! u32  session id
//! i64  timestamp        ms since epoch
//! u32  method count
//! per method:
//!   u16  local id
//!   utf  name           u16 length + UTF-8
//!   u32  hits
//!   u64  net time ns
//!   u64  self time ns
//!   u32  edge count
//!   per edge:
//!     u16  child local id
//!     u64  time ns
//! ```
//!
//! All integers are big-endian. The stream carries no overall length, the
//! reader consumes exactly what the header announces.

use super::model::{Snapshot, SnapshotEdge, SnapshotMethod};
use crate::domain::{LocalIndex, SessionId, SnapshotError};
use callscope_common::wire::{
    read_i64, read_u16, read_u32, read_u64, read_utf, write_i64, write_u16, write_u32, write_u64,
    write_utf,
};
use callscope_common::{SNAPSHOT_MAGIC, SNAPSHOT_PROTOCOL_VERSION, SNAPSHOT_TYPE_CALL_TRACE};
use std::io::{self, Read, Write};

fn count(len: usize, what: &str) -> io::Result<u32> {
    u32::try_from(len).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("too many {what}: {len}"))
    })
}

/// Encode `snapshot` into `w`.
///
/// # Errors
/// I/O failures, or a method name longer than 65535 bytes.
pub fn write_snapshot<W: Write>(w: &mut W, snapshot: &Snapshot) -> Result<(), SnapshotError> {
    write_u32(w, SNAPSHOT_MAGIC)?;
    write_u32(w, SNAPSHOT_PROTOCOL_VERSION)?;
    write_u32(w, SNAPSHOT_TYPE_CALL_TRACE)?;
    write_u32(w, u32::from(snapshot.session().0))?;
    write_i64(w, snapshot.timestamp_ms())?;
    write_u32(w, count(snapshot.len(), "methods")?)?;

    for method in snapshot.methods() {
        write_u16(w, method.local.0)?;
        write_utf(w, &method.name)?;
        write_u32(w, method.hits)?;
        write_u64(w, method.net_time_ns)?;
        write_u64(w, method.self_time_ns)?;
        write_u32(w, count(method.children.len(), "edges")?)?;
        for edge in &method.children {
            write_u16(w, edge.child.0)?;
            write_u64(w, edge.time_ns)?;
        }
    }
    Ok(())
}

/// Decode one snapshot from `r`, resolving every child edge.
///
/// # Errors
/// Header mismatches, truncated input, invalid UTF-8 or an inconsistent
/// method graph.
pub fn read_snapshot<R: Read>(r: &mut R) -> Result<Snapshot, SnapshotError> {
    let magic = read_u32(r)?;
    if magic != SNAPSHOT_MAGIC {
        return Err(SnapshotError::BadMagic(magic));
    }
    let version = read_u32(r)?;
    if version != SNAPSHOT_PROTOCOL_VERSION {
        return Err(SnapshotError::UnsupportedVersion(version));
    }
    let kind = read_u32(r)?;
    if kind != SNAPSHOT_TYPE_CALL_TRACE {
        return Err(SnapshotError::UnsupportedType(kind));
    }
    let raw_session = read_u32(r)?;
    let session =
        u8::try_from(raw_session).map_err(|_| SnapshotError::InvalidSession(raw_session))?;
    let timestamp_ms = read_i64(r)?;

    let method_count = read_u32(r)?;
    // Cap the preallocation, the count is untrusted
    let mut methods = Vec::with_capacity(method_count.min(4096) as usize);
    for _ in 0..method_count {
        let local = LocalIndex(read_u16(r)?);
        let name = read_utf(r)?;
        let hits = read_u32(r)?;
        let net_time_ns = read_u64(r)?;
        let self_time_ns = read_u64(r)?;
        let edge_count = read_u32(r)?;
        let mut children = Vec::with_capacity(edge_count.min(1024) as usize);
        for _ in 0..edge_count {
            let child = LocalIndex(read_u16(r)?);
            let time_ns = read_u64(r)?;
            children.push(SnapshotEdge { child, time_ns });
        }
        methods.push(SnapshotMethod { local, name, hits, net_time_ns, self_time_ns, children });
    }

    Snapshot::new(SessionId(session), timestamp_ms, methods)
}

/// Encode into a fresh buffer
///
/// # Errors
/// See [`write_snapshot`].
pub fn encode(snapshot: &Snapshot) -> Result<Vec<u8>, SnapshotError> {
    let mut buf = Vec::new();
    write_snapshot(&mut buf, snapshot)?;
    Ok(buf)
}
