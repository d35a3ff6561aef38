// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Append-only JSON-lines journal with replay and compaction.
//!
//! One line per entry. On open, existing lines are replayed in order; a
//! corrupt trailing line (torn write from a crash) is tolerated and
//! dropped, anything corrupt earlier is an error. Compaction rewrites the
//! live state as a fresh journal and atomically swaps it in.

use replug_core::{Job, JobEvent};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Default rotation threshold (bytes) before a compaction pass is suggested.
pub const DEFAULT_ROTATE_BYTES: u64 = 8 * 1024 * 1024;

/// One journaled mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
pub enum JournalEntry {
    /// Full job snapshot (last one wins on replay)
    Job { job: Job },
    /// Retained event appended to the job's topic
    Event { event: JobEvent },
}

/// Append-only journal file.
pub struct Journal {
    path: PathBuf,
    writer: BufWriter<File>,
    bytes: u64,
    rotate_bytes: u64,
}

impl Journal {
    /// Open (creating if absent) and replay the journal at `dir/journal.log`.
    pub fn open(dir: &Path, rotate_bytes: u64) -> std::io::Result<(Self, Vec<JournalEntry>)> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join("journal.log");

        let mut entries = Vec::new();
        let mut bytes = 0u64;
        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            let mut lines = reader.lines().peekable();
            while let Some(line) = lines.next() {
                let line = line?;
                bytes += line.len() as u64 + 1;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<JournalEntry>(&line) {
                    Ok(entry) => entries.push(entry),
                    Err(e) if lines.peek().is_none() => {
                        // Torn tail from a crash mid-append: drop it.
                        tracing::warn!(%e, "dropping corrupt trailing journal line");
                        bytes -= line.len() as u64 + 1;
                        break;
                    }
                    Err(e) => {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            format!("corrupt journal line: {e}"),
                        ));
                    }
                }
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok((Self { path, writer: BufWriter::new(file), bytes, rotate_bytes }, entries))
    }

    /// Append one entry and flush it to the OS.
    pub fn append(&mut self, entry: &JournalEntry) -> std::io::Result<()> {
        let line = serde_json::to_string(entry)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        self.bytes += line.len() as u64 + 1;
        Ok(())
    }

    /// Whether the file has grown past the rotation threshold.
    pub fn wants_compaction(&self) -> bool {
        self.bytes >= self.rotate_bytes
    }

    /// Rewrite the journal from a snapshot of live entries.
    ///
    /// Writes `journal.log.tmp`, fsyncs, then renames over the live file so
    /// a crash at any point leaves a readable journal behind.
    pub fn compact(
        &mut self,
        entries: impl Iterator<Item = JournalEntry>,
    ) -> std::io::Result<()> {
        let tmp = self.path.with_extension("log.tmp");
        let mut bytes = 0u64;
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            for entry in entries {
                let line = serde_json::to_string(&entry)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
                writer.write_all(line.as_bytes())?;
                writer.write_all(b"\n")?;
                bytes += line.len() as u64 + 1;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;

        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.bytes = bytes;
        tracing::debug!(bytes, "journal compacted");
        Ok(())
    }
}

#[cfg(test)]
#[path = "journal_tests.rs"]
mod tests;
