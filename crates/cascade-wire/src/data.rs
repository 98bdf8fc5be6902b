//! Triple data files.
//!
//! A data file is a flat run of 24-byte records, each three big-endian
//! `u64` constant ids (subject, predicate, object). There is no header.
//! A `#` in a file name stands for the worker's rank.

use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut};
use tracing::debug;

use crate::ast::ConstId;
use crate::error::WireError;

/// A subject/predicate/object fact.
pub type Triple = [ConstId; 3];

/// Bytes per record.
pub const RECORD_LEN: usize = 24;

/// Placeholder substituted with the rank in file names.
pub const RANK_PLACEHOLDER: char = '#';

/// How a worker reads its share of an input file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shard {
    /// The file name had a placeholder; the whole file belongs to this rank.
    Own(PathBuf),
    /// One file shared by every rank; record `i` belongs to rank `i % size`.
    Strided { path: PathBuf, rank: usize, size: usize },
}

impl Shard {
    pub fn resolve(path: &Path, rank: usize, size: usize) -> Self {
        match substitute_rank(path, rank) {
            Some(own) => Shard::Own(own),
            None => Shard::Strided {
                path: path.to_path_buf(),
                rank,
                size: size.max(1),
            },
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Shard::Own(path) | Shard::Strided { path, .. } => path,
        }
    }

    fn keeps(&self, index: usize) -> bool {
        match self {
            Shard::Own(_) => true,
            Shard::Strided { rank, size, .. } => index % size == *rank,
        }
    }
}

fn substitute_rank(path: &Path, rank: usize) -> Option<PathBuf> {
    let text = path.to_string_lossy();
    text.contains(RANK_PLACEHOLDER)
        .then(|| PathBuf::from(text.replacen(RANK_PLACEHOLDER, &rank.to_string(), 1)))
}

/// The file a rank writes its results to.
///
/// With a placeholder the rank is substituted; otherwise a multi-worker
/// cluster appends `.rank` so workers never share an output file.
pub fn output_path(path: &Path, rank: usize, size: usize) -> PathBuf {
    if let Some(own) = substitute_rank(path, rank) {
        return own;
    }
    if size > 1 {
        let mut name = path.as_os_str().to_owned();
        name.push(format!(".{rank}"));
        return PathBuf::from(name);
    }
    path.to_path_buf()
}

/// Decode an in-memory run of records.
pub fn decode_triples(buf: &[u8]) -> Result<Vec<Triple>, WireError> {
    let partial = buf.len() % RECORD_LEN;
    if partial != 0 {
        return Err(WireError::PartialRecord(partial));
    }
    let mut cursor = buf;
    let mut out = Vec::with_capacity(buf.len() / RECORD_LEN);
    while cursor.has_remaining() {
        out.push([cursor.get_u64(), cursor.get_u64(), cursor.get_u64()]);
    }
    Ok(out)
}

/// Encode triples as records.
pub fn encode_triples<'a>(triples: impl IntoIterator<Item = &'a Triple>) -> Vec<u8> {
    let mut out = Vec::new();
    for triple in triples {
        for id in triple {
            out.put_u64(*id);
        }
    }
    out
}

/// Read this rank's triples from a data file.
pub fn read_triples(shard: &Shard, page_size: usize) -> Result<Vec<Triple>, WireError> {
    let file = File::open(shard.path())?;
    let mut reader = BufReader::with_capacity(page_size.max(RECORD_LEN), file);
    let mut record = [0u8; RECORD_LEN];
    let mut out = Vec::new();
    let mut index = 0usize;

    loop {
        let filled = fill_record(&mut reader, &mut record)?;
        if filled == 0 {
            break;
        }
        if filled < RECORD_LEN {
            return Err(WireError::PartialRecord(filled));
        }
        if shard.keeps(index) {
            let mut cursor = &record[..];
            out.push([cursor.get_u64(), cursor.get_u64(), cursor.get_u64()]);
        }
        index += 1;
    }

    debug!(path = %shard.path().display(), records = index, kept = out.len(), "read data file");
    Ok(out)
}

/// Fill `record` from `reader`, returning how many bytes were read before EOF.
fn fill_record(reader: &mut impl Read, record: &mut [u8; RECORD_LEN]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < RECORD_LEN {
        match reader.read(&mut record[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Write triples to `path`, returning the number of records written.
pub fn write_triples<'a>(
    path: &Path,
    page_size: usize,
    triples: impl IntoIterator<Item = &'a Triple>,
) -> Result<usize, WireError> {
    let file = File::create(path)?;
    let mut writer = BufWriter::with_capacity(page_size.max(RECORD_LEN), file);
    let mut count = 0;
    let mut record = Vec::with_capacity(RECORD_LEN);
    for triple in triples {
        record.clear();
        for id in triple {
            record.put_u64(*id);
        }
        writer.write_all(&record)?;
        count += 1;
    }
    writer.flush()?;
    debug!(path = %path.display(), records = count, "wrote data file");
    Ok(count)
}
