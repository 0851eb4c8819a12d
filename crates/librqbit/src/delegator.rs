//! Component D: the piece delegator.
//!
//! Owns the in-flight `TransferList` and decides which 16 KiB block a
//! peer should request next, in the seven-step order of `delegate()`.
//!
//! The raw-pointer cycles of the original design (`BlockTransfer` ->
//! `Block` -> `PeerInfo` -> back to the request list holding
//! `BlockTransfer`s) are replaced with an arena + generation-counter
//! pattern: peers hold a [`BlockTransferHandle`] (index + generation)
//! rather than a pointer, and every dereference through
//! [`Delegator::transfer`] fails cleanly once the underlying slot has
//! been recycled.

use librqbit_core::lengths::{Lengths, ValidPieceIndex};
use tracing::{debug, instrument, trace};

use crate::priority_ranges::PriorityRanges;
use crate::type_aliases::{BF, PeerHandle};

/// Generic slot arena with generation counters, so external references
/// (index + generation) can detect use-after-recycle without unsafe code.
struct Arena<T> {
    slots: Vec<Option<(T, u32)>>,
    free: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArenaRef {
    index: u32,
    generation: u32,
}

impl<T> Arena<T> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    fn insert(&mut self, value: T) -> ArenaRef {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            let generation = slot.as_ref().map(|(_, g)| *g + 1).unwrap_or(1);
            *slot = Some((value, generation));
            ArenaRef { index, generation }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Some((value, 0)));
            ArenaRef {
                index,
                generation: 0,
            }
        }
    }

    fn get(&self, r: ArenaRef) -> Option<&T> {
        match self.slots.get(r.index as usize) {
            Some(Some((v, g))) if *g == r.generation => Some(v),
            _ => None,
        }
    }

    fn get_mut(&mut self, r: ArenaRef) -> Option<&mut T> {
        match self.slots.get_mut(r.index as usize) {
            Some(Some((v, g))) if *g == r.generation => Some(v),
            _ => None,
        }
    }

    fn remove(&mut self, r: ArenaRef) -> Option<T> {
        let slot = self.slots.get_mut(r.index as usize)?;
        match slot {
            Some((_, g)) if *g == r.generation => {
                let (v, _) = slot.take().unwrap();
                self.free.push(r.index);
                Some(v)
            }
            _ => None,
        }
    }

    fn iter(&self) -> impl Iterator<Item = (ArenaRef, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            s.as_ref().map(|(v, g)| {
                (
                    ArenaRef {
                        index: i as u32,
                        generation: *g,
                    },
                    v,
                )
            })
        })
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = (ArenaRef, &mut T)> {
        self.slots.iter_mut().enumerate().filter_map(|(i, s)| {
            s.as_mut().map(|(v, g)| {
                (
                    ArenaRef {
                        index: i as u32,
                        generation: *g,
                    },
                    v,
                )
            })
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Queued,
    Transferring,
    Finished,
    Dissimilar,
    Dummy,
    /// Explicitly marked stalled by `stall_initial`/`stall_prolonged`/choke
    /// handling. Distinct from `Queued`, which is also the state a
    /// freshly delegated transfer is created in but has never yet been
    /// downgraded — conflating the two would make every brand-new
    /// transfer invisible to the endgame overlap count.
    Stalled,
}

pub struct BlockTransfer {
    pub peer: PeerHandle,
    pub state: TransferState,
    /// Bytes received so far within the block.
    pub position: u32,
}

/// A handle a peer's request list holds for a transfer it owns. Opaque
/// outside this module except for equality/debug.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockTransferHandle {
    piece_index: ValidPieceIndex,
    block_index: u32,
    transfer: ArenaRef,
}

impl BlockTransferHandle {
    pub const fn piece_index(&self) -> ValidPieceIndex {
        self.piece_index
    }

    pub const fn block_index(&self) -> u32 {
        self.block_index
    }
}

pub struct Block {
    pub offset: u32,
    pub length: u32,
    pub finished: bool,
    transfers: Arena<BlockTransfer>,
}

impl Block {
    fn is_stalled_for(&self, peer: PeerHandle) -> bool {
        self.transfers
            .iter()
            .any(|(_, t)| t.peer == peer && t.state != TransferState::Finished)
    }

    fn has_any_transfer(&self) -> bool {
        self.transfers.iter().next().is_some()
    }

    fn count_non_stalled(&self) -> usize {
        self.transfers
            .iter()
            .filter(|(_, t)| t.state != TransferState::Stalled)
            .count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Normal,
    Stopped,
}

pub struct BlockList {
    pub piece_index: ValidPieceIndex,
    pub priority: Priority,
    pub by_seeder: bool,
    pub blocks: Vec<Block>,
}

impl BlockList {
    fn all_finished(&self) -> bool {
        self.blocks.iter().all(|b| b.finished)
    }
}

/// Callbacks the embedder wires up at construction (piece completion
/// triggers hashing; chunk_disable lets the selector re-offer a piece).
pub trait DelegatorEvents: Send + Sync {
    fn piece_complete(&self, index: ValidPieceIndex);
    fn chunk_disable(&self, index: ValidPieceIndex);
}

/// Supplies a brand-new piece index to start a `BlockList` for, given the
/// candidate priority range and the peer's bitfield. Implemented by the
/// embedder's piece-selection policy (typically backed by
/// `ChunkTracker`); returns `None` if nothing in `range` is available.
pub trait PieceSelector {
    fn select_new(&mut self, range: &PriorityRanges, peer_bitfield: &BF, have: &BF) -> Option<ValidPieceIndex>;
}

pub(crate) const BLOCK_SIZE: u32 = 16 * 1024;

pub struct Delegator {
    lengths: Lengths,
    high_priority: PriorityRanges,
    normal_priority: PriorityRanges,
    blocklists: Vec<BlockList>,
    by_piece: std::collections::HashMap<u32, usize>,
    pub aggressive: bool,
    endgame_max_overlap: usize,
}

impl Delegator {
    pub fn new(lengths: Lengths, high_priority: PriorityRanges, normal_priority: PriorityRanges, config: &crate::engine_config::EngineConfig) -> Self {
        Self {
            lengths,
            high_priority,
            normal_priority,
            blocklists: Vec::new(),
            by_piece: std::collections::HashMap::new(),
            aggressive: config.aggressive_default,
            endgame_max_overlap: config.endgame_max_overlap as usize,
        }
    }

    fn blocklist_for(&self, index: ValidPieceIndex) -> Option<usize> {
        self.by_piece.get(&index.get()).copied()
    }

    fn priority_of(&self, index: ValidPieceIndex) -> Priority {
        if self.high_priority.contains(index.get()) {
            Priority::High
        } else if self.normal_priority.contains(index.get()) {
            Priority::Normal
        } else {
            Priority::Stopped
        }
    }

    fn new_blocklist(&mut self, index: ValidPieceIndex, by_seeder: bool) {
        debug_assert!(
            !self.by_piece.contains_key(&index.get()),
            "bug: creating a BlockList for a piece already in the TransferList"
        );
        let piece_len = self.lengths.piece_length(index);
        let mut blocks = Vec::new();
        let mut offset = 0u32;
        while offset < piece_len {
            let length = (piece_len - offset).min(BLOCK_SIZE);
            blocks.push(Block {
                offset,
                length,
                finished: false,
                transfers: Arena::new(),
            });
            offset += length;
        }
        let priority = self.priority_of(index);
        let pos = self.blocklists.len();
        self.blocklists.push(BlockList {
            piece_index: index,
            priority,
            by_seeder,
            blocks,
        });
        self.by_piece.insert(index.get(), pos);
    }

    fn delegate_from_blocklist(&mut self, list_pos: usize, peer: PeerHandle) -> Option<BlockTransferHandle> {
        let piece_index = self.blocklists[list_pos].piece_index;
        let blocks = &mut self.blocklists[list_pos].blocks;

        // First pass: first block with zero transfers ("fresh").
        for (block_index, block) in blocks.iter_mut().enumerate() {
            if block.finished {
                continue;
            }
            if !block.has_any_transfer() {
                let transfer = block.transfers.insert(BlockTransfer {
                    peer,
                    state: TransferState::Queued,
                    position: 0,
                });
                return Some(BlockTransferHandle {
                    piece_index,
                    block_index: block_index as u32,
                    transfer,
                });
            }
        }

        // Second pass: first stalled block the peer isn't already on.
        for (block_index, block) in blocks.iter_mut().enumerate() {
            if block.finished {
                continue;
            }
            let any_stalled = block
                .transfers
                .iter()
                .any(|(_, t)| t.state == TransferState::Stalled);
            if any_stalled && !block.is_stalled_for(peer) {
                let transfer = block.transfers.insert(BlockTransfer {
                    peer,
                    state: TransferState::Queued,
                    position: 0,
                });
                return Some(BlockTransferHandle {
                    piece_index,
                    block_index: block_index as u32,
                    transfer,
                });
            }
        }

        None
    }

    /// Implements the seven-step allocation order of `delegate()`.
    #[instrument(level = "trace", skip(self, selector, peer_bitfield, have))]
    #[allow(clippy::too_many_arguments)]
    pub fn delegate(
        &mut self,
        peer: PeerHandle,
        peer_bitfield: &BF,
        have: &BF,
        is_seeder: bool,
        affinity: Option<ValidPieceIndex>,
        selector: &mut dyn PieceSelector,
    ) -> Option<BlockTransferHandle> {
        // 1. Affinity.
        if let Some(affinity) = affinity {
            if let Some(pos) = self.blocklist_for(affinity) {
                if let Some(h) = self.delegate_from_blocklist(pos, peer) {
                    trace!(piece = %affinity, "delegate: affinity hit");
                    return Some(h);
                }
            }
        }

        // 2. Seeder fast path.
        if is_seeder {
            let seeder_lists: Vec<usize> = self
                .blocklists
                .iter()
                .enumerate()
                .filter(|(_, b)| b.by_seeder && b.priority != Priority::Stopped)
                .map(|(i, _)| i)
                .collect();
            for pos in seeder_lists {
                if let Some(h) = self.delegate_from_blocklist(pos, peer) {
                    return Some(h);
                }
            }
            if let Some(index) = selector.select_new(&self.high_priority.clone(), peer_bitfield, have) {
                self.new_blocklist(index, true);
                let pos = self.blocklist_for(index).unwrap();
                if let Some(h) = self.delegate_from_blocklist(pos, peer) {
                    return Some(h);
                }
            }
            if let Some(index) = selector.select_new(&self.normal_priority.clone(), peer_bitfield, have) {
                self.new_blocklist(index, true);
                let pos = self.blocklist_for(index).unwrap();
                if let Some(h) = self.delegate_from_blocklist(pos, peer) {
                    return Some(h);
                }
            }
        }

        // 3. High priority scan (existing BlockLists).
        let high_candidates: Vec<usize> = self
            .blocklists
            .iter()
            .enumerate()
            .filter(|(_, b)| {
                b.priority == Priority::High
                    && peer_bitfield
                        .get(b.piece_index.get() as usize)
                        .is_some_and(|b| *b)
            })
            .map(|(i, _)| i)
            .collect();
        for pos in high_candidates {
            if let Some(h) = self.delegate_from_blocklist(pos, peer) {
                return Some(h);
            }
        }

        // 4. New high-priority chunk.
        if let Some(index) = selector.select_new(&self.high_priority.clone(), peer_bitfield, have) {
            self.new_blocklist(index, false);
            let pos = self.blocklist_for(index).unwrap();
            if let Some(h) = self.delegate_from_blocklist(pos, peer) {
                return Some(h);
            }
        }

        // 5. Normal priority scan.
        let normal_candidates: Vec<usize> = self
            .blocklists
            .iter()
            .enumerate()
            .filter(|(_, b)| {
                b.priority == Priority::Normal
                    && peer_bitfield
                        .get(b.piece_index.get() as usize)
                        .is_some_and(|b| *b)
            })
            .map(|(i, _)| i)
            .collect();
        for pos in normal_candidates {
            if let Some(h) = self.delegate_from_blocklist(pos, peer) {
                return Some(h);
            }
        }

        // 6. New normal chunk.
        if let Some(index) = selector.select_new(&self.normal_priority.clone(), peer_bitfield, have) {
            self.new_blocklist(index, false);
            let pos = self.blocklist_for(index).unwrap();
            if let Some(h) = self.delegate_from_blocklist(pos, peer) {
                return Some(h);
            }
        }

        // 7. Endgame / aggressive overlap.
        if self.aggressive {
            let mut best: Option<(usize, usize, usize)> = None; // (list_pos, block_idx, overlap)
            for (list_pos, list) in self.blocklists.iter().enumerate() {
                if list.priority == Priority::Stopped {
                    continue;
                }
                if !peer_bitfield
                    .get(list.piece_index.get() as usize)
                    .is_some_and(|b| *b)
                {
                    continue;
                }
                for (block_idx, block) in list.blocks.iter().enumerate() {
                    if block.finished {
                        continue;
                    }
                    let overlap = block.count_non_stalled();
                    if overlap >= self.endgame_max_overlap {
                        continue;
                    }
                    if best.is_none_or(|(_, _, best_overlap)| overlap < best_overlap) {
                        best = Some((list_pos, block_idx, overlap));
                    }
                }
            }
            if let Some((list_pos, block_idx, _)) = best {
                let piece_index = self.blocklists[list_pos].piece_index;
                let block = &mut self.blocklists[list_pos].blocks[block_idx];
                let transfer = block.transfers.insert(BlockTransfer {
                    peer,
                    state: TransferState::Queued,
                    position: 0,
                });
                return Some(BlockTransferHandle {
                    piece_index,
                    block_index: block_idx as u32,
                    transfer,
                });
            }
        }

        None
    }

    pub fn transfer_mut(&mut self, handle: BlockTransferHandle) -> Option<&mut BlockTransfer> {
        let pos = self.blocklist_for(handle.piece_index)?;
        let block = self.blocklists[pos].blocks.get_mut(handle.block_index as usize)?;
        block.transfers.get_mut(handle.transfer)
    }

    pub fn transfer(&self, handle: BlockTransferHandle) -> Option<&BlockTransfer> {
        let pos = self.blocklist_for(handle.piece_index)?;
        let block = self.blocklists[pos].blocks.get(handle.block_index as usize)?;
        block.transfers.get(handle.transfer)
    }

    /// `(offset, length)` of the block a handle points at, in bytes within
    /// the piece. Used by embedders turning a delegated handle into the
    /// wire-level REQUEST they send the peer.
    pub fn block_info(&self, handle: BlockTransferHandle) -> Option<(u32, u32)> {
        let pos = self.blocklist_for(handle.piece_index)?;
        let block = self.blocklists[pos].blocks.get(handle.block_index as usize)?;
        Some((block.offset, block.length))
    }

    pub fn release_transfer(&mut self, handle: BlockTransferHandle) {
        if let Some(pos) = self.blocklist_for(handle.piece_index) {
            if let Some(block) = self.blocklists[pos].blocks.get_mut(handle.block_index as usize) {
                block.transfers.remove(handle.transfer);
            }
        }
    }

    pub fn set_transferring(&mut self, handle: BlockTransferHandle) {
        let piece_index = handle.piece_index;
        if let Some(t) = self.transfer_mut(handle) {
            t.state = TransferState::Transferring;
        }
        trace!(piece = %piece_index, block = handle.block_index, "block transferring");
    }

    /// `finished(transfer)`: marks the owning block finished; if every
    /// block in the BlockList is now finished, fires `piece_complete`.
    #[instrument(level = "debug", skip(self, events))]
    pub fn finished(&mut self, handle: BlockTransferHandle, events: &dyn DelegatorEvents) -> Result<(), crate::engine_error::EngineError> {
        let pos = self
            .blocklist_for(handle.piece_index)
            .ok_or_else(|| crate::engine_error::EngineError::internal("bug: finished() on unknown piece"))?;
        {
            let block = self.blocklists[pos]
                .blocks
                .get_mut(handle.block_index as usize)
                .ok_or_else(|| crate::engine_error::EngineError::internal("bug: finished() on unknown block"))?;
            if block.finished {
                return Err(crate::engine_error::EngineError::internal(
                    "bug: finished() called twice on the same block",
                ));
            }
            block.finished = true;
        }
        if self.blocklists[pos].all_finished() {
            debug!(piece = %handle.piece_index, "blocklist complete");
            events.piece_complete(handle.piece_index);
        }
        Ok(())
    }

    /// `done(index)`: destroy the BlockList without re-queueing the piece.
    pub fn done(&mut self, index: ValidPieceIndex) {
        if let Some(pos) = self.by_piece.remove(&index.get()) {
            self.blocklists.swap_remove(pos);
            if let Some(moved) = self.blocklists.get(pos) {
                self.by_piece.insert(moved.piece_index.get(), pos);
            }
        }
    }

    /// `redo(index)`: destroy the BlockList and let the selector
    /// re-schedule the piece.
    pub fn redo(&mut self, index: ValidPieceIndex, events: &dyn DelegatorEvents) {
        self.done(index);
        events.chunk_disable(index);
    }

    /// Invalidated affinity check: callers should stop using an affinity
    /// hint for a piece once its hash has failed.
    pub fn has_active_blocklist(&self, index: ValidPieceIndex) -> bool {
        self.by_piece.contains_key(&index.get())
    }

    pub fn set_priorities(&mut self, high: PriorityRanges, normal: PriorityRanges) {
        self.high_priority = high;
        self.normal_priority = normal;
        for list in &mut self.blocklists {
            list.priority = if self.high_priority.contains(list.piece_index.get()) {
                Priority::High
            } else if self.normal_priority.contains(list.piece_index.get()) {
                Priority::Normal
            } else {
                Priority::Stopped
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    struct FixedSelector(Option<u32>);
    impl PieceSelector for FixedSelector {
        fn select_new(&mut self, _range: &PriorityRanges, _peer_bitfield: &BF, _have: &BF) -> Option<ValidPieceIndex> {
            self.0.take().and_then(|i| Lengths::new(16384 * 4, 16384).unwrap().validate_piece_index(i))
        }
    }

    fn peer(port: u16) -> PeerHandle {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn full_bf(n: usize) -> BF {
        BF::repeat(true, n)
    }

    #[test]
    fn delegate_opens_a_new_high_priority_chunk() {
        let lengths = Lengths::new(16384, 16384).unwrap();
        let mut high = PriorityRanges::new();
        high.insert(0..1);
        let mut d = Delegator::new(lengths, high, PriorityRanges::new(), &crate::engine_config::EngineConfig::default());
        let mut selector = FixedSelector(Some(0));
        let bf = full_bf(1);
        let handle = d
            .delegate(peer(1), &bf, &BF::repeat(false, 1), false, None, &mut selector)
            .unwrap();
        assert_eq!(handle.piece_index().get(), 0);
        assert_eq!(handle.block_index(), 0);
    }

    #[test]
    fn finished_fires_piece_complete_when_all_blocks_done() {
        struct Events(std::cell::Cell<bool>);
        impl DelegatorEvents for Events {
            fn piece_complete(&self, _index: ValidPieceIndex) {
                self.0.set(true);
            }
            fn chunk_disable(&self, _index: ValidPieceIndex) {}
        }

        let lengths = Lengths::new(16384, 16384).unwrap();
        let mut d = Delegator::new(lengths, PriorityRanges::new(), PriorityRanges::new(), &crate::engine_config::EngineConfig::default());
        let idx = lengths.validate_piece_index(0).unwrap();
        d.new_blocklist(idx, false);
        let pos = d.blocklist_for(idx).unwrap();
        let handle = d.delegate_from_blocklist(pos, peer(1)).unwrap();

        let events = Events(std::cell::Cell::new(false));
        d.finished(handle, &events).unwrap();
        assert!(events.0.get());
    }

    #[test]
    fn endgame_caps_overlap_at_four() {
        let lengths = Lengths::new(16384, 16384).unwrap();
        let config = crate::engine_config::EngineConfig {
            aggressive_default: true,
            ..Default::default()
        };
        let mut high = PriorityRanges::new();
        high.insert(0..1);
        let mut d = Delegator::new(lengths, high, PriorityRanges::new(), &config);
        let idx = lengths.validate_piece_index(0).unwrap();
        d.new_blocklist(idx, false);
        let bf = full_bf(1);
        let have = BF::repeat(false, 1);
        for i in 0..config.endgame_max_overlap {
            let mut selector = FixedSelector(None);
            assert!(
                d.delegate(peer(i), &bf, &have, false, None, &mut selector)
                    .is_some()
            );
        }
        let mut selector = FixedSelector(None);
        assert!(
            d.delegate(peer(99), &bf, &have, false, None, &mut selector)
                .is_none()
        );
    }
}
