// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Choosing the next dump and its parent.

use crate::chain::DumpChain;
use crate::dump::Dump;

/// Next cadence dump and the parent path the engine anchors it on.
///
/// - An open chain continues from its latest dump.
/// - An empty chain after a full dump starts over with no parent.
/// - On a fresh start the first dump follows the virtual origin `p0`.
pub fn next_cadence_dump(
    chain: &DumpChain,
    prev_chain: Option<&DumpChain>,
    dump_freq: u64,
) -> (Dump, Option<String>) {
    if let Some(latest) = chain.latest() {
        return (latest.next(dump_freq), Some(latest.parent_path()));
    }
    match prev_chain.and_then(DumpChain::latest) {
        Some(closed) => (closed.next_chain_dump(), None),
        None => (Dump::first().next(dump_freq), None),
    }
}

/// Pre-dump that opens a migration handoff, chained off the latest dump
/// regardless of where the cadence stands.
pub fn final_pre_dump(chain: &DumpChain, prev_chain: Option<&DumpChain>) -> (Dump, Option<String>) {
    if let Some(latest) = chain.latest() {
        return (latest.next_pre_dump(), Some(latest.parent_path()));
    }
    match prev_chain.and_then(DumpChain::latest) {
        Some(closed) => (closed.next_chain_dump(), None),
        None => (Dump::first().next_pre_dump(), None),
    }
}

/// Base for a manual checkpoint: whatever dump came last.
pub fn checkpoint_base(chain: &DumpChain, prev_chain: Option<&DumpChain>) -> Dump {
    chain
        .latest()
        .or_else(|| prev_chain.and_then(DumpChain::latest))
        .copied()
        .unwrap_or_else(Dump::first)
}
