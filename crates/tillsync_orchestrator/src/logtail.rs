//! Incremental log reads for the live-log view.
//!
//! Stateless per request: the client passes the offset back on each poll,
//! so any number of readers can follow the same file independently. The
//! file is written by exactly one subprocess through an inherited handle;
//! EOF is not permanent while the job is still running.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use thiserror::Error;

use tillsync_store::{Job, JobStatus};

/// Default read size per poll.
pub const DEFAULT_MAX_BYTES: usize = 65536;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TailError {
    #[error("invalid offset")]
    InvalidOffset,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogChunk {
    /// Lossy UTF-8 text; the log itself is treated as bytes.
    pub text: String,
    pub next_offset: u64,
}

/// One chunk of a job's log. Read errors and a missing file both yield an
/// empty chunk at the same offset so pollers simply retry; only a negative
/// offset is rejected.
pub fn read_chunk(
    log_path: Option<&Path>,
    offset: i64,
    max_bytes: usize,
) -> Result<LogChunk, TailError> {
    if offset < 0 {
        return Err(TailError::InvalidOffset);
    }
    let offset = offset as u64;
    let unchanged = LogChunk {
        text: String::new(),
        next_offset: offset,
    };

    let Some(path) = log_path else {
        return Ok(unchanged);
    };
    if !path.exists() {
        return Ok(unchanged);
    }

    let read = (|| -> std::io::Result<LogChunk> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; max_bytes];
        let mut filled = 0;
        while filled < buffer.len() {
            let n = file.read(&mut buffer[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buffer.truncate(filled);
        Ok(LogChunk {
            text: String::from_utf8_lossy(&buffer).into_owned(),
            next_offset: offset + filled as u64,
        })
    })();

    Ok(read.unwrap_or(unchanged))
}

/// Chunk plus the job's current status, for the polling API.
#[derive(Debug, Clone)]
pub struct JobLogChunk {
    pub text: String,
    pub next_offset: u64,
    pub status: JobStatus,
}

pub fn read_job_chunk(job: &Job, offset: i64, max_bytes: usize) -> Result<JobLogChunk, TailError> {
    let path = job.log_file_path.as_deref().map(Path::new);
    let chunk = read_chunk(path, offset, max_bytes)?;
    Ok(JobLogChunk {
        text: chunk.text,
        next_offset: chunk.next_offset,
        status: job.status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn negative_offset_is_rejected() {
        assert_eq!(
            read_chunk(None, -1, DEFAULT_MAX_BYTES),
            Err(TailError::InvalidOffset)
        );
    }

    #[test]
    fn missing_file_returns_empty_chunk_at_same_offset() {
        let chunk = read_chunk(
            Some(Path::new("/nonexistent/run.log")),
            42,
            DEFAULT_MAX_BYTES,
        )
        .unwrap();
        assert_eq!(chunk.text, "");
        assert_eq!(chunk.next_offset, 42);
    }

    #[test]
    fn incremental_reads_follow_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.log");
        let mut file = File::create(&path).unwrap();
        file.write_all(b"line-one\nline-two\n").unwrap();

        let chunk = read_chunk(Some(&path), 0, DEFAULT_MAX_BYTES).unwrap();
        assert_eq!(chunk.text, "line-one\nline-two\n");
        assert_eq!(chunk.next_offset, 18);

        file.write_all(b"line-three\n").unwrap();
        let chunk = read_chunk(Some(&path), 18, DEFAULT_MAX_BYTES).unwrap();
        assert_eq!(chunk.text, "line-three\n");
        assert_eq!(chunk.next_offset, 29);
    }

    #[test]
    fn max_bytes_bounds_each_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.log");
        std::fs::write(&path, b"abcdefghij").unwrap();

        let chunk = read_chunk(Some(&path), 0, 4).unwrap();
        assert_eq!(chunk.text, "abcd");
        assert_eq!(chunk.next_offset, 4);
        let chunk = read_chunk(Some(&path), 4, 4).unwrap();
        assert_eq!(chunk.text, "efgh");

        // Reading past EOF stays put.
        let chunk = read_chunk(Some(&path), 10, 4).unwrap();
        assert_eq!(chunk.text, "");
        assert_eq!(chunk.next_offset, 10);
    }

    #[test]
    fn non_utf8_bytes_are_lossy_decoded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.log");
        std::fs::write(&path, [0x68, 0x69, 0xFF, 0x0A]).unwrap();
        let chunk = read_chunk(Some(&path), 0, DEFAULT_MAX_BYTES).unwrap();
        assert!(chunk.text.starts_with("hi"));
        assert_eq!(chunk.next_offset, 4);
    }
}
