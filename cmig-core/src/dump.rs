// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Dump identity and cadence arithmetic.
//!
//! A [`Dump`] names one snapshot: its kind, its position in the global
//! sequence and its distance from the last full dump. The canonical name
//! (`p3`, `d4`, `c5`) doubles as the on-disk directory name and the wire
//! identifier, so identity is kind + sequence; the offset is bookkeeping for
//! the cadence and does not survive a round-trip through the name.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DumpError;

/// Kind of snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DumpKind {
    /// Memory delta since the previous dump. Not restorable on its own.
    PreDump,
    /// Complete container state. Restorable; closes the current chain.
    FullDump,
    /// Full dump requested by an operator, outside the cadence.
    Checkpoint,
}

impl DumpKind {
    /// Single-letter directory prefix.
    pub const fn prefix(&self) -> char {
        match self {
            Self::PreDump => 'p',
            Self::FullDump => 'd',
            Self::Checkpoint => 'c',
        }
    }

    pub fn from_prefix(prefix: char) -> Option<Self> {
        match prefix {
            'p' => Some(Self::PreDump),
            'd' => Some(Self::FullDump),
            'c' => Some(Self::Checkpoint),
            _ => None,
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::PreDump => "PreDump",
            Self::FullDump => "FullDump",
            Self::Checkpoint => "Checkpoint",
        }
    }
}

/// One snapshot's kind and sequence position.
#[derive(Debug, Clone, Copy, Eq)]
pub struct Dump {
    kind: DumpKind,
    sequence: u64,
    offset: u64,
}

impl PartialEq for Dump {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.sequence == other.sequence
    }
}

impl std::hash::Hash for Dump {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.sequence.hash(state);
    }
}

impl Dump {
    /// Origin of every derivation chain: pre-dump 0 at offset 0.
    pub const fn first() -> Self {
        Self {
            kind: DumpKind::PreDump,
            sequence: 0,
            offset: 0,
        }
    }

    pub fn kind(&self) -> DumpKind {
        self.kind
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn offset_from_full_dump(&self) -> u64 {
        self.offset
    }

    pub fn is_pre_dump(&self) -> bool {
        self.kind == DumpKind::PreDump
    }

    pub fn is_full_dump(&self) -> bool {
        self.kind == DumpKind::FullDump
    }

    /// Next dump in the cadence: a full dump every `dump_freq`-th derivation,
    /// pre-dumps otherwise.
    pub fn next(&self, dump_freq: u64) -> Self {
        if self.offset < dump_freq.saturating_sub(1) {
            Self {
                kind: DumpKind::PreDump,
                sequence: self.sequence + 1,
                offset: self.offset + 1,
            }
        } else {
            self.next_full_dump()
        }
    }

    pub fn next_pre_dump(&self) -> Self {
        Self {
            kind: DumpKind::PreDump,
            sequence: self.sequence + 1,
            offset: self.offset + 1,
        }
    }

    pub fn next_full_dump(&self) -> Self {
        Self {
            kind: DumpKind::FullDump,
            sequence: self.sequence + 1,
            offset: 0,
        }
    }

    /// First pre-dump of a new chain after a full-dump boundary.
    pub fn next_chain_dump(&self) -> Self {
        Self {
            kind: DumpKind::PreDump,
            sequence: self.sequence + 1,
            offset: 0,
        }
    }

    /// Manually triggered snapshot. Does not move the cadence offset.
    pub fn checkpoint(&self) -> Self {
        Self {
            kind: DumpKind::Checkpoint,
            sequence: self.sequence + 1,
            offset: self.offset,
        }
    }

    /// Same dump with its cadence offset replaced. Used when rebuilding a
    /// chain from names, where the offset is not encoded.
    pub(crate) fn with_offset(mut self, offset: u64) -> Self {
        self.offset = if self.is_full_dump() { 0 } else { offset };
        self
    }

    /// Parse a canonical name back into a dump.
    /// The offset cannot be recovered from the name and is set to 0.
    pub fn from_name(name: &str) -> Result<Self, DumpError> {
        let mut chars = name.chars();
        let prefix = chars.next().ok_or_else(|| DumpError::Parse {
            name: name.to_string(),
            reason: "empty name".to_string(),
        })?;
        let kind = DumpKind::from_prefix(prefix).ok_or_else(|| DumpError::Parse {
            name: name.to_string(),
            reason: format!("unknown kind prefix '{}'", prefix),
        })?;

        let digits = chars.as_str();
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(DumpError::Parse {
                name: name.to_string(),
                reason: "sequence must be a decimal number".to_string(),
            });
        }
        if digits.len() > 1 && digits.starts_with('0') {
            return Err(DumpError::Parse {
                name: name.to_string(),
                reason: "sequence must not be zero-padded".to_string(),
            });
        }
        let sequence = digits.parse::<u64>().map_err(|e| DumpError::Parse {
            name: name.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            kind,
            sequence,
            offset: 0,
        })
    }

    /// Canonical name: kind prefix followed by the sequence number.
    pub fn name(&self) -> String {
        format!("{}{}", self.kind.prefix(), self.sequence)
    }

    /// Reference to this dump from a sibling dump directory.
    pub fn parent_path(&self) -> String {
        format!("../{}", self.name())
    }

    /// Directory of this dump under `dump_root`.
    pub fn path_in(&self, dump_root: &Path) -> PathBuf {
        dump_root.join(self.name())
    }

    /// Find the latest full dump under `dump_root` that a follower can
    /// recover from: the `d`-prefixed directory with the highest sequence.
    pub fn recover(dump_root: &Path) -> Result<Self, DumpError> {
        let entries = std::fs::read_dir(dump_root).map_err(|e| DumpError::Scan {
            dir: dump_root.to_path_buf(),
            source: e,
        })?;

        let mut latest: Option<Dump> = None;
        for entry in entries {
            let entry = entry.map_err(|e| DumpError::Scan {
                dir: dump_root.to_path_buf(),
                source: e,
            })?;
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            match Dump::from_name(&name) {
                Ok(dump) if dump.is_full_dump() => {
                    if latest.map_or(true, |l| dump.sequence > l.sequence) {
                        latest = Some(dump);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::trace!(entry = %name, error = %e, "Skipping non-dump entry");
                }
            }
        }

        let latest = latest.ok_or_else(|| DumpError::NoRecoverableDump {
            dir: dump_root.to_path_buf(),
        })?;
        tracing::debug!(dump = %latest, "Latest recoverable dump determined");
        Ok(latest)
    }
}

impl fmt::Display for Dump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind.prefix(), self.sequence)
    }
}

impl FromStr for Dump {
    type Err = DumpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s)
    }
}
