//! Append-only order log
//!
//! One line per admitted order: `user_id,commodity_id,timestamp\n`. Appends
//! are synchronous and retried until the whole line is written. Nothing is
//! forced to stable storage: a crash can lose whatever the OS had not yet
//! flushed.

use super::types::Order;
use crate::error::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Write-ahead log of admitted orders
#[derive(Debug)]
pub struct Wal<W: Write = File> {
    writer: W,
    path: Option<PathBuf>,
    appended: u64,
    line: Vec<u8>,
}

impl Wal<File> {
    /// Open `path` for appending, creating it if missing
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        info!(path = %path.display(), "WAL opened for append");

        let mut wal = Self::from_writer(file);
        wal.path = Some(path.to_path_buf());
        Ok(wal)
    }
}

impl<W: Write> Wal<W> {
    /// Log into an arbitrary writer
    pub fn from_writer(writer: W) -> Self {
        Self {
            writer,
            path: None,
            appended: 0,
            line: Vec::with_capacity(128),
        }
    }

    /// Backing file, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Records appended through this handle
    pub fn appended(&self) -> u64 {
        self.appended
    }

    /// The underlying writer
    pub fn get_ref(&self) -> &W {
        &self.writer
    }

    /// Append one order record
    pub fn append(&mut self, order: &Order) -> Result<()> {
        self.line.clear();
        writeln!(
            self.line,
            "{},{},{}",
            order.user_id, order.commodity_id, order.timestamp
        )?;

        write_fully(&mut self.writer, &self.line).map_err(Error::Wal)?;
        self.appended += 1;
        Ok(())
    }

    /// Hand buffered bytes to the OS
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush().map_err(Error::Wal)
    }
}

/// Short writes, zero-length writes and interrupted writes are retried
fn write_fully<W: Write>(writer: &mut W, mut buf: &[u8]) -> io::Result<()> {
    let mut retries = 0u32;
    while !buf.is_empty() {
        match writer.write(buf) {
            Ok(0) => retries += 1,
            Ok(n) => buf = &buf[n..],
            Err(e) if matches!(e.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock) => {
                retries += 1
            }
            Err(e) => return Err(e),
        }
    }
    if retries > 0 {
        debug!(retries, "WAL write retried");
    }
    Ok(())
}
