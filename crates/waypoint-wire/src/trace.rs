//! The replay event trace.
//!
//! ```text
//! # comment
//! M <sp> <target>             main entered
//! C <sp> <target>             call
//! R <sp>                      return
//! B <pc> <instructions> [<next_pc>]
//! X <thread>                  following events belong to <thread>
//! ```
//!
//! Addresses and stack pointers are hex; counts and thread numbers decimal.

use std::io::{self, BufRead};

use waypoint_types::{Pc, ThreadKey};

use crate::{ConfigError, RecordError, parse_dec, parse_hex, parse_pc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceLine {
    Block {
        pc: Pc,
        instructions: u64,
        next_pc: Option<Pc>,
    },
    Call {
        sp: u64,
        target: Pc,
    },
    Return {
        sp: u64,
    },
    MainEntry {
        sp: u64,
        target: Pc,
    },
    Thread(ThreadKey),
}

/// Parses one trace line. Blank lines and comments give `None`.
pub fn parse_trace_line(line: &str) -> Result<Option<TraceLine>, RecordError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let mut tokens = line.split_whitespace();
    let tag = tokens.next().unwrap_or_default();

    let parsed = match tag {
        "B" => TraceLine::Block {
            pc: parse_pc("block pc", tokens.next())?,
            instructions: parse_dec("instruction count", tokens.next())?,
            next_pc: tokens
                .next()
                .map(|token| parse_pc("next pc", Some(token)))
                .transpose()?,
        },
        "C" => TraceLine::Call {
            sp: parse_hex("stack pointer", tokens.next())?,
            target: parse_pc("call target", tokens.next())?,
        },
        "R" => TraceLine::Return {
            sp: parse_hex("stack pointer", tokens.next())?,
        },
        "M" => TraceLine::MainEntry {
            sp: parse_hex("stack pointer", tokens.next())?,
            target: parse_pc("main entry", tokens.next())?,
        },
        "X" => {
            let thread = parse_dec("thread", tokens.next())?;
            let thread = u32::try_from(thread).map_err(|_| RecordError::InvalidNumber {
                field: "thread",
                token: thread.to_string(),
            })?;
            TraceLine::Thread(ThreadKey::new(thread))
        }
        other => return Err(RecordError::UnknownTag(other.to_owned())),
    };

    if let Some(extra) = tokens.next() {
        return Err(RecordError::TrailingToken(extra.to_owned()));
    }
    Ok(Some(parsed))
}

#[derive(Debug)]
pub enum TraceError {
    Io(io::Error),
    Record(ConfigError),
}

impl std::fmt::Display for TraceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "read event trace: {err}"),
            Self::Record(err) => write!(f, "event trace {err}"),
        }
    }
}

impl std::error::Error for TraceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Record(err) => Some(err),
        }
    }
}

/// Streams [`TraceLine`]s out of a reader, one line at a time.
pub struct TraceReader<R> {
    reader: R,
    buf: String,
    line: usize,
}

impl<R: BufRead> TraceReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: String::new(),
            line: 0,
        }
    }

    /// 1-based number of the last line read.
    pub fn line(&self) -> usize {
        self.line
    }
}

impl<R: BufRead> Iterator for TraceReader<R> {
    type Item = Result<TraceLine, TraceError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buf.clear();
            match self.reader.read_line(&mut self.buf) {
                Ok(0) => return None,
                Ok(_) => self.line += 1,
                Err(err) => return Some(Err(TraceError::Io(err))),
            }
            match parse_trace_line(&self.buf) {
                Ok(Some(parsed)) => return Some(Ok(parsed)),
                Ok(None) => continue,
                Err(source) => {
                    return Some(Err(TraceError::Record(ConfigError {
                        line: self.line,
                        source,
                    })));
                }
            }
        }
    }
}
