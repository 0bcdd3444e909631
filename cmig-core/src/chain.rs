// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Incremental dump chain.
//!
//! A chain holds every dump since the last full-dump boundary. Nodes live in
//! an append-only arena; a node's predecessor is referenced by index and the
//! chain is only ever walked from the latest node backward.
//!
//! Replication state is tracked per node and per target. Marking a node
//! synced is monotonic, and the synced nodes of a target always form the
//! oldest part of the chain, so a backward walk can stop at the first synced
//! node it meets.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::dump::Dump;
use crate::error::ChainError;
use crate::target::RemoteTarget;
use crate::transfer::{DumpTransfer, PARENT_LINK};

/// One dump in the chain.
#[derive(Debug, Clone)]
pub struct ChainNode {
    dump: Dump,
    prev: Option<usize>,
    synced_to: Vec<String>,
}

impl ChainNode {
    pub fn dump(&self) -> &Dump {
        &self.dump
    }

    pub fn is_synced_to(&self, target: &RemoteTarget) -> bool {
        let key = target.key();
        self.synced_to.iter().any(|k| *k == key)
    }

    /// Whether at least one replica holds this dump.
    pub fn is_synced(&self) -> bool {
        !self.synced_to.is_empty()
    }

    fn mark_synced(&mut self, key: &str) {
        if !self.synced_to.iter().any(|k| k == key) {
            self.synced_to.push(key.to_string());
        }
    }
}

/// Append-only, backward-traversable sequence of dumps.
#[derive(Debug, Clone, Default)]
pub struct DumpChain {
    nodes: Vec<ChainNode>,
}

impl DumpChain {
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    /// Build a chain from dumps given oldest-first, recomputing each
    /// dump's offset from the last full dump.
    pub fn from_dumps(dumps: impl IntoIterator<Item = Dump>) -> Self {
        let mut chain = Self::new();
        let mut offset = 0u64;
        for (i, dump) in dumps.into_iter().enumerate() {
            if i > 0 {
                offset += 1;
            }
            let dump = dump.with_offset(offset);
            offset = dump.offset_from_full_dump();
            chain.push(dump);
        }
        chain
    }

    /// Append a dump on top of the current latest.
    pub fn push(&mut self, dump: Dump) {
        let prev = self.nodes.len().checked_sub(1);
        self.nodes.push(ChainNode {
            dump,
            prev,
            synced_to: Vec::new(),
        });
    }

    pub fn latest(&self) -> Option<&Dump> {
        self.nodes.last().map(|n| &n.dump)
    }

    pub fn latest_node(&self) -> Option<&ChainNode> {
        self.nodes.last()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes from the latest backward.
    pub fn iter_back(&self) -> ChainIter<'_> {
        ChainIter {
            chain: self,
            cursor: self.nodes.len().checked_sub(1),
        }
    }

    /// Canonical names, latest first.
    pub fn names(&self) -> Vec<String> {
        self.iter_back().map(|n| n.dump.name()).collect()
    }

    /// Canonical names, oldest first.
    pub fn names_oldest_first(&self) -> Vec<String> {
        let mut names = self.names();
        names.reverse();
        names
    }

    /// Replicate every node `target` has not received yet.
    ///
    /// Walks backward from the latest node and stops at the first node
    /// already synced to `target`; the collected nodes are then sent oldest
    /// first. A failed transfer stops the pass and leaves that node and
    /// everything newer unsynced, to be retried by the next call.
    /// Returns the number of dumps transferred.
    pub async fn sync<T: DumpTransfer>(&mut self, transfer: &T, target: &RemoteTarget) -> usize {
        let key = target.key();
        let mut pending = Vec::new();
        let mut cursor = self.nodes.len().checked_sub(1);
        while let Some(i) = cursor {
            let node = &self.nodes[i];
            if node.synced_to.iter().any(|k| *k == key) {
                break;
            }
            pending.push(i);
            cursor = node.prev;
        }

        tracing::debug!(
            replica = %target,
            pending = pending.len(),
            "Syncing chain to target"
        );

        pending.reverse();
        self.transfer_nodes(transfer, target, &key, &pending).await
    }

    /// Replicate every node regardless of earlier bookkeeping.
    /// Used when a new replica joins and must receive the whole chain.
    pub async fn full_transfer<T: DumpTransfer>(
        &mut self,
        transfer: &T,
        target: &RemoteTarget,
    ) -> usize {
        tracing::debug!(
            replica = %target,
            length = self.nodes.len(),
            "Performing full transfer of chain to target"
        );
        let key = target.key();
        let all: Vec<usize> = (0..self.nodes.len()).collect();
        self.transfer_nodes(transfer, target, &key, &all).await
    }

    async fn transfer_nodes<T: DumpTransfer>(
        &mut self,
        transfer: &T,
        target: &RemoteTarget,
        key: &str,
        indices: &[usize],
    ) -> usize {
        let mut sent = 0;
        for &i in indices {
            let dump = self.nodes[i].dump;
            let predecessor = self.nodes[i].prev.map(|p| self.nodes[p].dump);
            match transfer
                .transfer_dump(&dump, predecessor.as_ref(), target)
                .await
            {
                Ok(()) => {
                    self.nodes[i].mark_synced(key);
                    sent += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        dump = %dump,
                        replica = %target,
                        error = %e,
                        "Failed to transfer dump, will retry on next sync"
                    );
                    break;
                }
            }
        }
        sent
    }
}

/// Backward iterator over chain nodes.
pub struct ChainIter<'a> {
    chain: &'a DumpChain,
    cursor: Option<usize>,
}

impl<'a> Iterator for ChainIter<'a> {
    type Item = &'a ChainNode;

    fn next(&mut self) -> Option<Self::Item> {
        let chain: &'a DumpChain = self.chain;
        let node = &chain.nodes[self.cursor?];
        self.cursor = node.prev;
        Some(node)
    }
}

/// Rebuild a chain from disk by following `parent` symlinks from the
/// newest dump directory. Returns dump names oldest first.
pub fn reconstruct(dump_dir: &Path) -> Result<Vec<String>, ChainError> {
    let mut names = vec![dir_name(dump_dir)?];
    let mut seen: HashSet<String> = names.iter().cloned().collect();
    let mut current = dump_dir.to_path_buf();

    loop {
        let link = current.join(PARENT_LINK);
        let meta = match std::fs::symlink_metadata(&link) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
            Err(e) => return Err(ChainError::Unreadable { path: link, source: e }),
        };
        if !meta.file_type().is_symlink() {
            return Err(ChainError::CorruptChain { path: link });
        }

        let points_to = std::fs::read_link(&link).map_err(|e| ChainError::Unreadable {
            path: link.clone(),
            source: e,
        })?;
        let parent_name = points_to
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_owned)
            .ok_or_else(|| ChainError::CorruptChain { path: link.clone() })?;
        Dump::from_name(&parent_name).map_err(|e| ChainError::BadLink {
            path: link.clone(),
            source: e,
        })?;

        let parent_dir = sibling(&current, &parent_name);
        if !parent_dir.is_dir() {
            return Err(ChainError::DanglingLink { path: link });
        }
        if !seen.insert(parent_name.clone()) {
            return Err(ChainError::Cycle { path: link });
        }

        names.push(parent_name);
        current = parent_dir;
    }

    names.reverse();
    tracing::debug!(chain = ?names, "Chain reconstructed from disk");
    Ok(names)
}

fn dir_name(dir: &Path) -> Result<String, ChainError> {
    let name = dir
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_owned)
        .ok_or_else(|| ChainError::CorruptChain {
            path: dir.to_path_buf(),
        })?;
    Dump::from_name(&name).map_err(|e| ChainError::BadLink {
        path: dir.to_path_buf(),
        source: e,
    })?;
    Ok(name)
}

fn sibling(dir: &Path, name: &str) -> PathBuf {
    match dir.parent() {
        Some(root) => root.join(name),
        None => PathBuf::from(name),
    }
}
