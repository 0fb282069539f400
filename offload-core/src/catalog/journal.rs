use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Cursor, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::OffloadRecord;
use crate::error::{OffloadError, Result};

const MAGIC: &[u8; 8] = b"ADVMOLOG";
const VERSION: u8 = 1;
const HEADER_LEN: u64 = MAGIC.len() as u64 + 1;

/// One outcome entry in the offload ledger.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum LedgerRecord {
    Offloaded { id: String, record: OffloadRecord },
    Failed { id: String, message: String, at: i64 },
    Cleared { id: String },
}

/// Append-only, length-delimited CBOR log of offload outcomes.
pub struct Ledger {
    f: File,
    path: PathBuf,
}

fn put_uvarint(out: &mut Vec<u8>, mut x: u64) {
    while x >= 0x80 {
        out.push((x as u8) | 0x80);
        x >>= 7;
    }
    out.push(x as u8);
}

fn get_uvarint<R: Read>(r: &mut R) -> Result<Option<u64>> {
    let mut x: u64 = 0;
    let mut s: u32 = 0;
    for _ in 0..10 {
        let mut b = [0u8; 1];
        match r.read(&mut b) {
            Ok(0) => return Ok(None),
            Ok(_) => {
                let byte = b[0];
                if byte < 0x80 {
                    x |= (byte as u64) << s;
                    return Ok(Some(x));
                }
                x |= ((byte & 0x7f) as u64) << s;
                s += 7;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(std::io::Error::new(ErrorKind::InvalidData, "varint too long").into())
}

/// Decode the frame starting at `pos`. `None` when the bytes there are not a
/// complete, decodable record: the valid prefix of the ledger ends at `pos`.
fn decode_frame(raw: &[u8], pos: usize) -> Option<(LedgerRecord, usize)> {
    let mut cur = Cursor::new(raw.get(pos..)?);
    let len = get_uvarint(&mut cur).ok()??;
    let start = pos + cur.position() as usize;
    let remaining = (raw.len() - start) as u64;
    if len == 0 || len > remaining {
        return None;
    }
    let end = start + len as usize;
    let rec = serde_cbor::from_slice(&raw[start..end]).ok()?;
    Some((rec, end))
}

fn decode_all(raw: &[u8]) -> (Vec<LedgerRecord>, u64) {
    let mut out = Vec::new();
    let mut pos = HEADER_LEN as usize;
    while let Some((rec, next)) = decode_frame(raw, pos) {
        out.push(rec);
        pos = next;
    }
    (out, pos as u64)
}

impl Ledger {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut f = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        if f.metadata()?.len() == 0 {
            f.write_all(MAGIC)?;
            f.write_all(&[VERSION])?;
            f.flush()?;
        } else {
            let mut raw = Vec::new();
            f.read_to_end(&mut raw)?;
            if raw.len() < HEADER_LEN as usize || &raw[..MAGIC.len()] != MAGIC {
                return Err(OffloadError::Catalog(format!(
                    "{} is not an offload ledger",
                    path.display()
                )));
            }
            // Cut a torn or corrupt tail so later appends stay reachable on replay.
            let (_, valid_end) = decode_all(&raw);
            if valid_end < raw.len() as u64 {
                tracing::warn!(
                    ledger = %path.display(),
                    dropped = raw.len() as u64 - valid_end,
                    "truncating unreadable ledger tail"
                );
                f.set_len(valid_end)?;
            }
        }

        f.seek(SeekFrom::End(0))?;
        Ok(Self {
            f,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a single record. Partial tails are ignored on replay.
    pub fn append(&mut self, rec: &LedgerRecord) -> Result<()> {
        let plain = serde_cbor::to_vec(rec)?;
        let mut framed = Vec::with_capacity(plain.len() + 10);
        put_uvarint(&mut framed, plain.len() as u64);
        framed.extend_from_slice(&plain);
        self.f.seek(SeekFrom::End(0))?;
        self.f.write_all(&framed)?;
        self.f.sync_data()?;
        Ok(())
    }

    /// Every complete record after the header, in append order.
    pub fn replay(&mut self) -> Result<Vec<LedgerRecord>> {
        self.f.flush()?;
        self.f.seek(SeekFrom::Start(0))?;
        let mut raw = Vec::new();
        self.f.read_to_end(&mut raw)?;
        let (records, end) = decode_all(&raw);
        if end < raw.len() as u64 {
            tracing::warn!(
                ledger = %self.path.display(),
                skipped = raw.len() as u64 - end,
                "ignoring unreadable ledger tail"
            );
        }
        Ok(records)
    }
}
