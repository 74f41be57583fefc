//! Length-prefixed binary framing for the job and index files.
//!
//! Each record is a little-endian `u32` payload length followed by the
//! bincode-encoded payload. A stream ending exactly between frames is clean
//! EOF; a stream ending inside a frame is a format error, so partial writes
//! are always detectable.

use std::io::{Read, Seek, SeekFrom, Write};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::job::{IndexEntry, Job};

/// Upper bound on a single frame payload.
pub const MAX_FRAME_LEN: u32 = 1 << 27; // 128 MiB

#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("frame payload of {len} bytes exceeds the {MAX_FRAME_LEN}-byte limit")]
    Oversized { len: u64 },
    #[error("truncated frame: wanted {wanted} more bytes at end of stream")]
    Truncated { wanted: usize },
    #[error("no frame at offset {0}")]
    NoFrame(u64),
    #[error("malformed frame payload: {0}")]
    Payload(#[from] bincode::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Writes one frame, returning the number of bytes written.
pub fn write_frame<W: Write, T: Serialize>(out: &mut W, value: &T) -> Result<u64, FormatError> {
    let payload = bincode::serialize(value)?;
    if payload.len() as u64 > MAX_FRAME_LEN as u64 {
        return Err(FormatError::Oversized {
            len: payload.len() as u64,
        });
    }
    let len = payload.len() as u32;
    out.write_all(&len.to_le_bytes())?;
    out.write_all(&payload)?;
    Ok(4 + payload.len() as u64)
}

/// Reads one frame. `Ok(None)` means the stream ended cleanly between frames.
pub fn read_frame<R: Read, T: DeserializeOwned>(input: &mut R) -> Result<Option<T>, FormatError> {
    Ok(read_frame_sized(input)?.map(|(value, _)| value))
}

/// Reads one frame along with the number of bytes it occupied on disk.
pub fn read_frame_sized<R: Read, T: DeserializeOwned>(
    input: &mut R,
) -> Result<Option<(T, u64)>, FormatError> {
    let mut len_buf = [0u8; 4];
    if !read_exact_or_eof(input, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(FormatError::Oversized { len: len as u64 });
    }

    let mut payload = vec![0u8; len as usize];
    input.read_exact(&mut payload).map_err(|err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            FormatError::Truncated {
                wanted: len as usize,
            }
        } else {
            FormatError::Io(err)
        }
    })?;

    let value = bincode::deserialize(&payload)?;
    Ok(Some((value, 4 + len as u64)))
}

/// Fills `buf` completely, or returns `false` if the stream was already at
/// EOF. EOF after a partial read is a truncation error.
fn read_exact_or_eof<R: Read>(input: &mut R, buf: &mut [u8]) -> Result<bool, FormatError> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(FormatError::Truncated {
                    wanted: buf.len() - filled,
                });
            }
            Ok(n) => filled += n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
            Err(err) => return Err(FormatError::Io(err)),
        }
    }
    Ok(true)
}

/// Seeks to `offset` and decodes the job frame stored there.
pub fn read_job_at<R: Read + Seek>(input: &mut R, offset: u64) -> Result<Job, FormatError> {
    input.seek(SeekFrom::Start(offset))?;
    read_frame(input)?.ok_or(FormatError::NoFrame(offset))
}

/// Appends job frames, reporting the offset each frame starts at.
pub struct JobWriter<W> {
    out: W,
    offset: u64,
}

impl<W: Write> JobWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out, offset: 0 }
    }

    /// Writes one job frame and returns its starting offset.
    pub fn write(&mut self, job: &Job) -> Result<u64, FormatError> {
        let at = self.offset;
        self.offset += write_frame(&mut self.out, job)?;
        Ok(at)
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Appends index entry frames.
pub struct IndexWriter<W> {
    out: W,
}

impl<W: Write> IndexWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn write(&mut self, entry: &IndexEntry) -> Result<(), FormatError> {
        write_frame(&mut self.out, entry)?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Iterator over the entries of an index file.
pub struct IndexReader<R> {
    input: R,
}

impl<R: Read> IndexReader<R> {
    pub fn new(input: R) -> Self {
        Self { input }
    }
}

impl<R: Read> Iterator for IndexReader<R> {
    type Item = Result<IndexEntry, FormatError>;

    fn next(&mut self) -> Option<Self::Item> {
        read_frame(&mut self.input).transpose()
    }
}

/// Linear scan over a job file, yielding each job with the offset its frame
/// starts at. This is the dispatch fallback when no index file exists.
pub struct JobScan<R> {
    input: R,
    offset: u64,
}

impl<R: Read> JobScan<R> {
    pub fn new(input: R) -> Self {
        Self { input, offset: 0 }
    }
}

impl<R: Read> Iterator for JobScan<R> {
    type Item = Result<(u64, Job), FormatError>;

    fn next(&mut self) -> Option<Self::Item> {
        match read_frame_sized(&mut self.input) {
            Ok(Some((job, consumed))) => {
                let at = self.offset;
                self.offset += consumed;
                Some(Ok((at, job)))
            }
            Ok(None) => None,
            Err(err) => Some(Err(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::job::Task;

    fn job(id: &str, tasks: &[(f64, &str)]) -> Job {
        Job {
            id: id.to_string(),
            tasks: tasks
                .iter()
                .map(|(at, body)| Task {
                    at: *at,
                    request: body.as_bytes().to_vec(),
                })
                .collect(),
        }
    }

    #[test]
    fn job_round_trip() {
        let original = job("10.0.0.1:5432#0", &[(0.0, "SELECT 1"), (0.25, "")]);

        let mut buf = Vec::new();
        write_frame(&mut buf, &original).unwrap();
        let decoded: Job = read_frame(&mut Cursor::new(&buf)).unwrap().unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn index_round_trip() {
        let entry = IndexEntry {
            id: "a#1".to_string(),
            start_time: 12.5,
            offset: 4096,
        };

        let mut buf = Vec::new();
        write_frame(&mut buf, &entry).unwrap();
        let decoded: IndexEntry = read_frame(&mut Cursor::new(&buf)).unwrap().unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn clean_eof_between_frames() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &job("a#0", &[(0.0, "x")])).unwrap();

        let mut cursor = Cursor::new(&buf);
        assert!(read_frame::<_, Job>(&mut cursor).unwrap().is_some());
        assert!(read_frame::<_, Job>(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn eof_mid_frame_is_fatal() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &job("a#0", &[(0.0, "select now()")])).unwrap();
        buf.truncate(buf.len() - 3);

        let err = read_frame::<_, Job>(&mut Cursor::new(&buf)).unwrap_err();
        assert!(matches!(err, FormatError::Truncated { .. }));
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_LEN + 1).to_le_bytes());
        buf.extend_from_slice(&[0u8; 16]);

        let err = read_frame::<_, Job>(&mut Cursor::new(&buf)).unwrap_err();
        assert!(matches!(err, FormatError::Oversized { .. }));
    }

    #[test]
    fn read_job_at_seeks_to_any_frame() {
        let mut writer = JobWriter::new(Cursor::new(Vec::new()));
        let first = job("a#0", &[(0.0, "one")]);
        let second = job("b#1", &[(1.0, "two")]);
        let off_a = writer.write(&first).unwrap();
        let off_b = writer.write(&second).unwrap();
        let mut cursor = writer.into_inner();

        assert_eq!(read_job_at(&mut cursor, off_b).unwrap(), second);
        assert_eq!(read_job_at(&mut cursor, off_a).unwrap(), first);
    }

    #[test]
    fn scan_reports_frame_offsets() {
        let mut writer = JobWriter::new(Cursor::new(Vec::new()));
        let jobs = vec![
            job("a#0", &[(0.0, "one")]),
            job("b#1", &[(1.0, "two")]),
            job("c#2", &[(2.0, "three")]),
        ];
        let offsets: Vec<u64> = jobs.iter().map(|j| writer.write(j).unwrap()).collect();
        let buf = writer.into_inner().into_inner();

        let scanned: Vec<(u64, Job)> = JobScan::new(Cursor::new(&buf))
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(scanned.len(), 3);
        for ((at, scanned_job), (expected_at, expected_job)) in
            scanned.iter().zip(offsets.iter().zip(jobs.iter()))
        {
            assert_eq!(at, expected_at);
            assert_eq!(scanned_job, expected_job);
        }
    }
}
