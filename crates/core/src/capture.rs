//! Parser for captured query traffic.
//!
//! Two stanza forms are accepted and may be mixed in one file:
//!
//! * the sequence-log form: a `time<TAB>id<TAB>source<TAB>state` header, a
//!   free-form body, and a `***…` separator line;
//! * the MySQL slow-log form: `# Time:` / `# Client:` / `# Thread_id:`
//!   comments carrying the metadata, with `# administrator command: Quit;`
//!   marking session end.
//!
//! Lines starting with `--` are comments and are skipped anywhere.

use std::io::BufRead;
use std::sync::LazyLock;

use regex::Regex;

use crate::event::{Event, EventKind};

static HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<time>\d+\.\d+)\t(?P<id>[\d.:]+)\t?(?P<source>\S*)\t(?P<state>\w+)$")
        .expect("header regex must be valid")
});
static BREAK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\*{3,}$").expect("break regex must be valid"));
static COMMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^-{2,}").expect("comment regex must be valid"));
static TIME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^# Time: (\d+ [\d\w:.]+)$").expect("time regex must be valid")
});
static CLIENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^# Client: ([\d.:]+)$").expect("client regex must be valid")
});
static THREAD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"# Thread_id: (\d+)$").expect("thread regex must be valid"));
static ADMIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^# administrator command: (\w+);$").expect("admin regex must be valid")
});

fn is_log_comment(line: &str) -> bool {
    line.starts_with('#')
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("line {line}: malformed stanza header: {text:?}")]
    BadHeader { line: u64, text: String },
    #[error("line {line}: unknown event kind {word:?}")]
    UnknownKind { line: u64, word: String },
    #[error("line {line}: bad slow-log timestamp {text:?}")]
    BadTimestamp { line: u64, text: String },
    #[error("line {line}: stanza has no timestamp")]
    MissingTimestamp { line: u64 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Streaming reader over the stanzas of one capture file.
pub struct CaptureReader<R> {
    input: R,
    pushback: Vec<String>,
    line: u64,
}

impl<R: BufRead> CaptureReader<R> {
    pub fn new(input: R) -> Self {
        Self {
            input,
            pushback: Vec::new(),
            line: 0,
        }
    }

    fn read_line(&mut self) -> Result<Option<String>, CaptureError> {
        if let Some(line) = self.pushback.pop() {
            return Ok(Some(line));
        }
        let mut buf = String::new();
        if self.input.read_line(&mut buf)? == 0 {
            return Ok(None);
        }
        self.line += 1;
        while buf.ends_with('\n') || buf.ends_with('\r') {
            buf.pop();
        }
        Ok(Some(buf))
    }

    fn unread(&mut self, line: String) {
        self.pushback.push(line);
    }

    /// Parses the next stanza. `Ok(None)` at end of file.
    pub fn next_event(&mut self) -> Result<Option<Event>, CaptureError> {
        let mut time: Option<f64> = None;
        let mut id = String::new();
        let mut source = String::new();
        let mut kind = EventKind::QueryStart;
        let mut body = String::new();

        // Seek the stanza header, skipping comments and stray lines. A `#`
        // comment block starts a slow-log stanza instead.
        let mut line = loop {
            let Some(line) = self.read_line()? else {
                return Ok(None);
            };
            if COMMENT_RE.is_match(&line) {
                continue;
            }
            if let Some(caps) = HEADER_RE.captures(&line) {
                time = Some(caps["time"].parse().map_err(|_| CaptureError::BadHeader {
                    line: self.line,
                    text: line.clone(),
                })?);
                id = caps["id"].to_string();
                source = caps["source"].to_string();
                let word = &caps["state"];
                kind = EventKind::parse(word).ok_or_else(|| CaptureError::UnknownKind {
                    line: self.line,
                    word: word.to_string(),
                })?;
                match self.read_line()? {
                    Some(next) => break next,
                    None => return self.finish(time, id, source, kind, body).map(Some),
                }
            }
            if is_log_comment(&line) {
                break line;
            }
        };

        // Slow-log comment block: metadata lives in `#` comments.
        while is_log_comment(&line) {
            if let Some(stamp) = TIME_RE.captures(&line).map(|caps| caps[1].to_string()) {
                if time.is_some() {
                    // A second timestamp means the previous stanza had no
                    // body and this comment already belongs to the next one.
                    self.unread(line);
                    return self.finish(time, id, source, kind, body).map(Some);
                }
                time = Some(self.parse_slowlog_time(&stamp)?);
            }
            if let Some(caps) = CLIENT_RE.captures(&line) {
                id = caps[1].to_string();
            }
            if let Some(caps) = THREAD_RE.captures(&line) {
                id.push(':');
                id.push_str(&caps[1]);
            }
            if let Some(caps) = ADMIN_RE.captures(&line) {
                if &caps[1] == "Quit" {
                    kind = EventKind::End;
                }
            }
            match self.read_line()? {
                Some(next) => line = next,
                None => return Ok(None),
            }
        }

        // Body, up to a `***` separator or the next comment block.
        let mut cur = Some(line);
        loop {
            let Some(current) = cur else { break };
            if COMMENT_RE.is_match(&current) {
                cur = self.read_line()?;
                continue;
            }
            if BREAK_RE.is_match(&current) {
                break;
            }
            if is_log_comment(&current) {
                // A trailing admin command closes this stanza; anything else
                // belongs to the next one.
                let admin = ADMIN_RE.captures(&current).map(|caps| caps[1].to_string());
                match admin {
                    Some(command) => {
                        if command == "Quit" {
                            kind = EventKind::End;
                        }
                    }
                    None => self.unread(current),
                }
                break;
            }
            body.push_str(&current);
            body.push('\n');
            cur = self.read_line()?;
        }

        self.finish(time, id, source, kind, body).map(Some)
    }

    fn finish(
        &self,
        time: Option<f64>,
        session_id: String,
        source: String,
        kind: EventKind,
        body: String,
    ) -> Result<Event, CaptureError> {
        let time = time.ok_or(CaptureError::MissingTimestamp { line: self.line })?;
        Ok(Event {
            time,
            session_id,
            source,
            kind,
            body,
        })
    }

    /// `YYMMDD HH:MM:SS[.usec]` into seconds since the epoch.
    fn parse_slowlog_time(&self, raw: &str) -> Result<f64, CaptureError> {
        let (datetime, subsec) = match raw.split_once('.') {
            Some((datetime, subsec)) => (datetime, Some(subsec)),
            None => (raw, None),
        };
        let parsed = chrono::NaiveDateTime::parse_from_str(datetime, "%y%m%d %H:%M:%S").map_err(
            |_| CaptureError::BadTimestamp {
                line: self.line,
                text: raw.to_string(),
            },
        )?;
        let mut seconds = parsed.and_utc().timestamp() as f64;
        if let Some(subsec) = subsec {
            seconds += format!("0.{subsec}")
                .parse::<f64>()
                .map_err(|_| CaptureError::BadTimestamp {
                    line: self.line,
                    text: raw.to_string(),
                })?;
        }
        Ok(seconds)
    }
}

impl<R: BufRead> Iterator for CaptureReader<R> {
    type Item = Result<Event, CaptureError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_event().transpose()
    }
}
