//! Directory-read buffer (spec.md §4.I): a sequence of whole,
//! length-prefixed directory entries prepared once at open time so that
//! sequential offset-based reads always land on an entry boundary.

use crate::error::{Error, Result};
use crate::proto::DirEntry;

fn encode_entry(e: &DirEntry) -> Vec<u8> {
    let mut body = Vec::new();
    body.push(e.qid.qtype);
    body.extend_from_slice(&e.qid.version.to_le_bytes());
    body.extend_from_slice(&e.qid.path.to_le_bytes());
    body.extend_from_slice(&e.mode.to_le_bytes());
    body.extend_from_slice(&e.atime.to_le_bytes());
    body.extend_from_slice(&e.mtime.to_le_bytes());
    body.extend_from_slice(&e.length.to_le_bytes());
    for field in [&e.name, &e.uid, &e.gid, &e.muid] {
        body.extend_from_slice(&(field.len() as u16).to_le_bytes());
        body.extend_from_slice(field.as_bytes());
    }
    let mut out = Vec::with_capacity(2 + body.len());
    out.extend_from_slice(&(body.len() as u16).to_le_bytes());
    out.extend_from_slice(&body);
    out
}

/// Concatenate entries into one buffer, in order.
pub fn build(entries: &[DirEntry]) -> Vec<u8> {
    let mut buf = Vec::new();
    for e in entries {
        buf.extend_from_slice(&encode_entry(e));
    }
    buf
}

/// Entry boundary offsets within `buf`, including the trailing
/// (end-of-buffer) boundary.
fn boundaries(buf: &[u8]) -> Vec<u64> {
    let mut offsets = vec![0u64];
    let mut pos = 0usize;
    while pos + 2 <= buf.len() {
        let len = u16::from_le_bytes([buf[pos], buf[pos + 1]]) as usize;
        pos += 2 + len;
        offsets.push(pos as u64);
    }
    offsets
}

/// Read as many whole entries as fit in `max_bytes` starting at
/// `offset`. `offset` must be one of the buffer's entry boundaries
/// (including 0 and the end of the buffer); any other value is
/// `InvalidArgument`.
pub fn read_at(buf: &[u8], offset: u64, max_bytes: usize) -> Result<&[u8]> {
    let bounds = boundaries(buf);
    if !bounds.contains(&offset) {
        return Err(Error::InvalidArgument);
    }
    let start = offset as usize;
    if start >= buf.len() {
        return Ok(&[]);
    }
    let mut end = start;
    for &b in &bounds {
        let b = b as usize;
        if b <= start {
            continue;
        }
        if b - start > max_bytes {
            break;
        }
        end = b;
    }
    Ok(&buf[start..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::Qid;

    fn entry(name: &str) -> DirEntry {
        DirEntry {
            qid: Qid { qtype: 0, version: 1, path: 1 },
            mode: 0o644,
            atime: 0,
            mtime: 0,
            length: 0,
            name: name.to_string(),
            uid: "u".to_string(),
            gid: "g".to_string(),
            muid: "u".to_string(),
        }
    }

    #[test]
    fn reads_whole_entries_only() {
        let buf = build(&[entry("a"), entry("bb"), entry("ccc")]);
        let first = read_at(&buf, 0, buf.len()).unwrap();
        assert_eq!(first.len(), buf.len());
    }

    #[test]
    fn misaligned_offset_is_invalid() {
        let buf = build(&[entry("a"), entry("bb")]);
        assert!(matches!(read_at(&buf, 1, 4096), Err(Error::InvalidArgument)));
    }

    #[test]
    fn small_budget_returns_fitting_prefix() {
        let buf = build(&[entry("a"), entry("bb"), entry("ccc")]);
        let first_len = boundaries(&buf)[1] as usize;
        let chunk = read_at(&buf, 0, first_len).unwrap();
        assert_eq!(chunk.len(), first_len);
        let rest = read_at(&buf, first_len as u64, buf.len()).unwrap();
        assert_eq!(rest.len(), buf.len() - first_len);
    }

    #[test]
    fn end_of_buffer_read_is_empty() {
        let buf = build(&[entry("a")]);
        let at_end = read_at(&buf, buf.len() as u64, 4096).unwrap();
        assert!(at_end.is_empty());
    }
}
