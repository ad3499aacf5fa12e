//! Binary encoding of the registry state file.
//!
//! Layout (all integers big-endian):
//! - `u16` format version, `i64` unix timestamp of the save
//! - `u32` record count, then per record:
//!   callback address (`u32` length + text, length 0 if none), `u32` flags,
//!   `u16` port, `u32` job id, `u32` failed node count and per node
//!   (`u32` cpus, `u32` length + name), `u16` pending delay, `u32` pending
//!   job id, `u32` length + pending node name, `u32` replace count,
//!   `u32` extension credit, `u32` owner uid

use crate::StateError;
use crate::record::{EventFlags, FailedNode, FailureRecord};

/// Current state file format version.
pub const STATE_VERSION: u16 = 1;

/// Upper bound on any length-prefixed string, to reject garbage early.
const MAX_STRING_LEN: usize = 64 * 1024;

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn str(&mut self, s: &str) {
        self.u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], StateError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or(StateError::Truncated { offset: self.pos })?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], StateError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u16(&mut self) -> Result<u16, StateError> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, StateError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    fn i64(&mut self) -> Result<i64, StateError> {
        Ok(i64::from_be_bytes(self.array()?))
    }

    fn str(&mut self) -> Result<String, StateError> {
        let offset = self.pos;
        let len = self.u32()? as usize;
        if len > MAX_STRING_LEN {
            return Err(StateError::Corrupt {
                offset,
                reason: format!("string length {} too large", len),
            });
        }
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| StateError::Corrupt {
            offset,
            reason: "string is not UTF-8".to_string(),
        })
    }
}

/// Encode records into a state file image.
pub fn encode(records: &[FailureRecord], timestamp: i64) -> Vec<u8> {
    let mut w = Writer { buf: Vec::new() };
    w.u16(STATE_VERSION);
    w.i64(timestamp);
    w.u32(records.len() as u32);
    for rec in records {
        match rec.callback_addr {
            Some(ip) => w.str(&ip.to_string()),
            None => w.u32(0),
        }
        w.u32(rec.callback_flags.bits());
        w.u16(rec.callback_port);
        w.u32(rec.job_id);
        w.u32(rec.fail_nodes.len() as u32);
        for node in &rec.fail_nodes {
            w.u32(node.cpus);
            w.str(&node.name);
        }
        w.u16(rec.pending_job_delay);
        w.u32(rec.pending_job_id);
        w.str(&rec.pending_node_name);
        w.u32(rec.replace_count);
        w.u32(rec.time_extend_avail);
        w.u32(rec.owner_uid);
    }
    w.buf
}

fn decode_record(r: &mut Reader<'_>) -> Result<FailureRecord, StateError> {
    let addr_offset = r.pos;
    let addr = r.str()?;
    let callback_addr = if addr.is_empty() {
        None
    } else {
        Some(addr.parse().map_err(|_| StateError::Corrupt {
            offset: addr_offset,
            reason: format!("bad callback address {:?}", addr),
        })?)
    };
    let callback_flags = EventFlags::from_bits(r.u32()?);
    let callback_port = r.u16()?;
    let job_id = r.u32()?;

    let node_count = r.u32()? as usize;
    // Each node needs at least 8 bytes, so a huge count is caught by take()
    let mut fail_nodes = Vec::with_capacity(node_count.min(1024));
    for _ in 0..node_count {
        let cpus = r.u32()?;
        let name = r.str()?;
        fail_nodes.push(FailedNode { name, cpus });
    }

    let pending_job_delay = r.u16()?;
    let pending_job_id = r.u32()?;
    let pending_node_name = r.str()?;
    let replace_count = r.u32()?;
    let time_extend_avail = r.u32()?;
    let owner_uid = r.u32()?;

    Ok(FailureRecord {
        job_id,
        owner_uid,
        fail_nodes,
        callback_addr,
        callback_port,
        callback_flags,
        pending_job_id,
        pending_node_name,
        pending_job_delay,
        replace_count,
        time_extend_avail,
    })
}

/// Decode a state file image into its save timestamp and records.
pub fn decode(bytes: &[u8]) -> Result<(i64, Vec<FailureRecord>), StateError> {
    let mut r = Reader { buf: bytes, pos: 0 };
    let version = r.u16()?;
    if version != STATE_VERSION {
        return Err(StateError::Version {
            found: version,
            expected: STATE_VERSION,
        });
    }
    let timestamp = r.i64()?;
    let count = r.u32()? as usize;
    let mut records = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        records.push(decode_record(&mut r)?);
    }
    Ok((timestamp, records))
}
