//! Line-aligned chunk planning.
//!
//! Splits a file into [`ChunkRange`]s near a target size so that workers
//! can process them independently. Candidate boundaries sit at multiples
//! of the target size. Each one is pushed forward to the start of the next
//! line, so no chunk ever splits a line. The ranges partition `[0, size)`
//! exactly. A single line longer than the target gives one oversized chunk.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use crate::models::ChunkRange;

/// Default target chunk size: 10 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 10 * 1024 * 1024;

/// Plan chunks for the file at `path`.
pub fn plan_chunks(path: &Path, target: u64) -> io::Result<Vec<ChunkRange>> {
    let file = File::open(path)?;
    let size = file.metadata()?.len();
    plan_chunks_from(file, size, target)
}

/// Plan chunks over any seekable reader of `size` bytes.
pub fn plan_chunks_from<R: Read + Seek>(reader: R, size: u64, target: u64) -> io::Result<Vec<ChunkRange>> {
    if target == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "target chunk size must be > 0",
        ));
    }
    if size == 0 {
        return Ok(Vec::new());
    }
    if size <= target {
        return Ok(vec![ChunkRange {
            index: 0,
            start: 0,
            end: size,
        }]);
    }

    let mut reader = BufReader::new(reader);
    let mut chunks = Vec::new();
    let mut cursor = 0u64;
    let mut candidate = target;

    while candidate < size {
        // An oversized line already swallowed this candidate.
        if candidate > cursor {
            let end = next_line_start(&mut reader, candidate)?;
            if end >= size {
                break;
            }
            chunks.push(ChunkRange {
                index: chunks.len(),
                start: cursor,
                end,
            });
            cursor = end;
        }
        candidate += target;
    }

    chunks.push(ChunkRange {
        index: chunks.len(),
        start: cursor,
        end: size,
    });

    Ok(chunks)
}

/// Smallest offset `p >= at` that starts a line (byte `p - 1` is `\n`), or EOF.
/// A candidate already sitting on a line start stays put rather than moving
/// past the following line; chunks only need to be line-aligned.
fn next_line_start<R: BufRead + Seek>(reader: &mut R, at: u64) -> io::Result<u64> {
    let from = at - 1;
    reader.seek(SeekFrom::Start(from))?;
    let mut pos = from;
    loop {
        let buf = reader.fill_buf()?;
        if buf.is_empty() {
            return Ok(pos);
        }
        if let Some(i) = buf.iter().position(|&b| b == b'\n') {
            return Ok(pos + i as u64 + 1);
        }
        let n = buf.len();
        pos += n as u64;
        reader.consume(n);
    }
}

/// Read exactly the bytes of `range` through a fresh handle.
pub fn read_range(path: &Path, range: &ChunkRange) -> io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(range.start))?;
    let mut buf = Vec::with_capacity(range.len() as usize);
    file.take(range.len()).read_to_end(&mut buf)?;
    if (buf.len() as u64) < range.len() {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("expected {} bytes, read {}", range.len(), buf.len()),
        ));
    }
    Ok(buf)
}
