use crate::error::{SyncError, SyncResult};
use crate::model::RawRecord;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Take};

/// Lazy reader over the complete lines appended after `offset`.
///
/// The end of the file is captured when the tailer opens, so a cycle always
/// terminates even if the writer keeps appending. A trailing line without its
/// newline is left unread: the offset never moves past it until the writer
/// finishes it.
pub struct Tailer {
    path: String,
    reader: BufReader<Take<File>>,
    offset: u64,
    line_no: u64,
    end: u64,
    done: bool,
}

impl Tailer {
    pub fn open(path: &str, offset: u64, line_no: u64) -> SyncResult<Self> {
        let mut file = File::open(path).map_err(|exc| SyncError::from_io(path, exc))?;
        let end = file
            .metadata()
            .map_err(|exc| SyncError::from_io(path, exc))?
            .len();
        let start = offset.min(end);
        file.seek(SeekFrom::Start(start))
            .map_err(|exc| SyncError::from_io(path, exc))?;

        Ok(Self {
            path: path.to_string(),
            reader: BufReader::new(file.take(end - start)),
            offset: start,
            line_no,
            end,
            done: false,
        })
    }

    /// Offset just past the last complete line handed out.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn line_no(&self) -> u64 {
        self.line_no
    }

    /// EOF observed at open.
    pub fn end(&self) -> u64 {
        self.end
    }
}

impl Iterator for Tailer {
    type Item = SyncResult<RawRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let mut buf = Vec::<u8>::new();
            let bytes_read = match self.reader.read_until(b'\n', &mut buf) {
                Ok(n) => n,
                Err(exc) => {
                    self.done = true;
                    return Some(Err(SyncError::from_io(&self.path, exc)));
                }
            };

            if bytes_read == 0 || buf.last() != Some(&b'\n') {
                self.done = true;
                return None;
            }

            let start_offset = self.offset;
            self.offset = self.offset.saturating_add(bytes_read as u64);
            self.line_no = self.line_no.saturating_add(1);

            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
            let text = String::from_utf8_lossy(&buf).into_owned();
            if text.trim().is_empty() {
                continue;
            }

            return Some(Ok(RawRecord {
                source_file: self.path.clone(),
                line_no: self.line_no,
                start_offset,
                end_offset: self.offset,
                text,
            }));
        }

        None
    }
}

/// SHA-256 of the `window` bytes ending at `offset`; empty at offset 0.
pub fn window_fingerprint(path: &str, offset: u64, window: u64) -> SyncResult<String> {
    if offset == 0 {
        return Ok(String::new());
    }

    let start = offset.saturating_sub(window.max(1));
    let mut file = File::open(path).map_err(|exc| SyncError::from_io(path, exc))?;
    file.seek(SeekFrom::Start(start))
        .map_err(|exc| SyncError::from_io(path, exc))?;

    let mut buf = Vec::with_capacity((offset - start) as usize);
    file.take(offset - start)
        .read_to_end(&mut buf)
        .map_err(|exc| SyncError::from_io(path, exc))?;
    if (buf.len() as u64) < offset - start {
        // The file no longer reaches `offset`; nothing can match.
        return Ok(String::from("short"));
    }

    let mut hasher = Sha256::new();
    hasher.update(&buf);
    Ok(format!("{:x}", hasher.finalize()))
}
