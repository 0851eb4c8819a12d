//! Component E: the per-peer request list.
//!
//! Tracks every block a single peer has promised to send us, classified
//! into four FIFO buckets (`queued`, `unordered`, `stalled`, `choked`)
//! plus the one transfer currently being streamed in from the wire. The
//! delegator (Component D) is the only thing that creates a
//! [`BlockTransferHandle`]; this module just moves handles between
//! buckets and asks the delegator to mutate the transfer they point at.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use librqbit_core::lengths::ValidPieceIndex;
use tracing::{instrument, trace, warn};

use crate::delegator::{BlockTransferHandle, Delegator, DelegatorEvents, PieceSelector, TransferState};
use crate::type_aliases::BF;

const CHOKE_GRACE_SHORT: Duration = Duration::from_secs(6);
const CHOKE_GRACE_LONG: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Queued,
    Unordered,
    Stalled,
    Choked,
}

#[derive(Debug, Default)]
pub struct BucketStats {
    pub added: AtomicU64,
    pub moved: AtomicU64,
    pub removed: AtomicU64,
}

impl BucketStats {
    fn on_add(&self) {
        self.added.fetch_add(1, Ordering::Relaxed);
    }
    fn on_move(&self) {
        self.moved.fetch_add(1, Ordering::Relaxed);
    }
    fn on_remove(&self) {
        self.removed.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Default)]
struct BucketQueue {
    items: VecDeque<BlockTransferHandle>,
    stats: BucketStats,
    total: AtomicU32,
}

impl BucketQueue {
    fn push(&mut self, handle: BlockTransferHandle) {
        self.items.push_back(handle);
        self.stats.on_add();
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    fn pop_front(&mut self) -> Option<BlockTransferHandle> {
        let item = self.items.pop_front();
        if item.is_some() {
            self.total.fetch_sub(1, Ordering::Relaxed);
        }
        item
    }

    fn take_all(&mut self) -> Vec<BlockTransferHandle> {
        let drained: Vec<_> = self.items.drain(..).collect();
        self.total.fetch_sub(drained.len() as u32, Ordering::Relaxed);
        drained
    }

    fn remove_matching(&mut self, mut pred: impl FnMut(&BlockTransferHandle) -> bool) -> Option<BlockTransferHandle> {
        let pos = self.items.iter().position(|h| pred(h))?;
        let item = self.items.remove(pos);
        if item.is_some() {
            self.total.fetch_sub(1, Ordering::Relaxed);
        }
        item
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// A stand-in for a real block transfer once the upstream block it
/// pointed at has been cancelled, so byte-accounting still balances.
#[derive(Debug, Clone, Copy)]
struct Dummy {
    piece_index: ValidPieceIndex,
    offset: u32,
    length: u32,
    position: u32,
}

/// What `downloading()` found for the in-flight PIECE message.
pub enum DownloadingOutcome {
    /// A live transfer was matched; caller should proceed to write the
    /// bytes through the chunk list.
    Matched,
    /// The match was stale (block already cancelled elsewhere) or no
    /// match was found at all; a dummy transfer absorbed the bytes.
    Unmatched,
}

enum Current {
    None,
    Transfer(BlockTransferHandle),
    Dummy(Dummy),
}

pub struct RequestList {
    queued: BucketQueue,
    unordered: BucketQueue,
    stalled: BucketQueue,
    choked: BucketQueue,
    current: Current,
    affinity: Option<ValidPieceIndex>,
    last_choke: Option<Instant>,
    last_unchoke: Option<Instant>,
    choked_removal_deadline: Option<Instant>,
    is_choked: bool,
}

impl RequestList {
    pub fn new() -> Self {
        Self {
            queued: BucketQueue::default(),
            unordered: BucketQueue::default(),
            stalled: BucketQueue::default(),
            choked: BucketQueue::default(),
            current: Current::None,
            affinity: None,
            last_choke: None,
            last_unchoke: None,
            choked_removal_deadline: None,
            is_choked: false,
        }
    }

    pub fn bucket_len(&self, bucket: Bucket) -> usize {
        match bucket {
            Bucket::Queued => self.queued.len(),
            Bucket::Unordered => self.unordered.len(),
            Bucket::Stalled => self.stalled.len(),
            Bucket::Choked => self.choked.len(),
        }
    }

    pub fn bucket_stats(&self, bucket: Bucket) -> &BucketStats {
        match bucket {
            Bucket::Queued => &self.queued.stats,
            Bucket::Unordered => &self.unordered.stats,
            Bucket::Stalled => &self.stalled.stats,
            Bucket::Choked => &self.choked.stats,
        }
    }

    pub fn is_downloading(&self) -> bool {
        matches!(self.current, Current::Transfer(_))
    }

    /// `delegate()`: ask the global delegator for a new block; on
    /// success push it into `queued` and remember the piece as affinity.
    #[instrument(level = "trace", skip(self, delegator, peer_bitfield, have, selector))]
    pub fn delegate(
        &mut self,
        delegator: &mut Delegator,
        peer: crate::type_aliases::PeerHandle,
        peer_bitfield: &BF,
        have: &BF,
        is_seeder: bool,
        selector: &mut dyn PieceSelector,
    ) -> Option<BlockTransferHandle> {
        let handle = delegator.delegate(peer, peer_bitfield, have, is_seeder, self.affinity, selector)?;
        self.affinity = Some(handle.piece_index());
        self.queued.push(handle);
        Some(handle)
    }

    /// `stall_initial()`: destroy `unordered`, move everything from
    /// `queued` into `unordered`, marking each transfer stalled.
    pub fn stall_initial(&mut self, delegator: &mut Delegator) {
        for handle in self.unordered.take_all() {
            self.unordered.stats.on_remove();
            delegator.release_transfer(handle);
        }
        for handle in self.queued.take_all() {
            self.queued.stats.on_move();
            if let Some(t) = delegator.transfer_mut(handle) {
                t.state = TransferState::Stalled;
            }
            self.unordered.push(handle);
        }
    }

    /// `stall_prolonged()`: mark the in-flight transfer (if any) and
    /// every transfer in `queued` as stalled. Buckets do not move.
    pub fn stall_prolonged(&mut self, delegator: &mut Delegator) {
        if let Current::Transfer(handle) = &self.current {
            if let Some(t) = delegator.transfer_mut(*handle) {
                t.state = TransferState::Stalled;
            }
        }
        for handle in &self.queued.items {
            if let Some(t) = delegator.transfer_mut(*handle) {
                t.state = TransferState::Stalled;
            }
        }
    }

    /// `choked()`: move `queued, unordered, stalled` into `choked` and
    /// arm the 6s grace-period removal if not already armed.
    pub fn choked(&mut self, now: Instant) {
        self.is_choked = true;
        self.last_choke = Some(now);
        for handle in self.queued.take_all() {
            self.queued.stats.on_move();
            self.choked.push(handle);
        }
        for handle in self.unordered.take_all() {
            self.unordered.stats.on_move();
            self.choked.push(handle);
        }
        for handle in self.stalled.take_all() {
            self.stalled.stats.on_move();
            self.choked.push(handle);
        }
        if self.choked_removal_deadline.is_none() {
            self.choked_removal_deadline = Some(now + CHOKE_GRACE_SHORT);
        }
    }

    /// `unchoked()`: cancel the short removal; if anything remains in
    /// `choked`, arm the longer 60s grace period instead.
    pub fn unchoked(&mut self, now: Instant) {
        self.is_choked = false;
        self.last_unchoke = Some(now);
        self.choked_removal_deadline = if self.choked.is_empty() {
            None
        } else {
            Some(now + CHOKE_GRACE_LONG)
        };
    }

    /// Called every main-loop tick; if the armed grace period has
    /// elapsed, releases everything still sitting in `choked`.
    pub fn pump_choked_removal(&mut self, now: Instant, delegator: &mut Delegator) {
        let Some(deadline) = self.choked_removal_deadline else {
            return;
        };
        if now < deadline {
            return;
        }
        self.choked_removal_deadline = None;
        for handle in self.choked.take_all() {
            self.choked.stats.on_remove();
            delegator.release_transfer(handle);
        }
    }

    /// Cancellation-range helper used by `downloading` when the queued
    /// match sits past the head of the bucket: drains `unordered` of
    /// dead transfers, then walks the preceding `queued` entries,
    /// stalling+moving the live ones and releasing the dead ones.
    fn cancel_preceding(&mut self, delegator: &mut Delegator, preceding: Vec<BlockTransferHandle>) {
        self.unordered
            .items
            .retain(|h| delegator.transfer(*h).is_some());

        for handle in preceding {
            if delegator.transfer(handle).is_some() {
                if let Some(t) = delegator.transfer_mut(handle) {
                    t.state = TransferState::Stalled;
                }
                self.unordered.push(handle);
            } else {
                delegator.release_transfer(handle);
            }
            self.queued.stats.on_remove();
        }
    }

    /// `cancel(piece, offset)`: a peer sent CANCEL for a block we're still
    /// holding in `queued`. Demotes it to `unordered`, the same move
    /// `stall_initial` performs, so it's still eligible to be picked back
    /// up by `downloading` if the bytes show up anyway.
    pub fn cancel(&mut self, delegator: &mut Delegator, piece_index: ValidPieceIndex, offset: u32) -> bool {
        fn block_offset_of(h: BlockTransferHandle) -> u32 {
            h.block_index() * crate::delegator::BLOCK_SIZE
        }
        let Some(handle) = self
            .queued
            .remove_matching(|h| h.piece_index() == piece_index && block_offset_of(*h) == offset)
        else {
            return false;
        };
        self.queued.stats.on_remove();
        if let Some(t) = delegator.transfer_mut(handle) {
            t.state = TransferState::Stalled;
        }
        self.unordered.push(handle);
        true
    }

    /// `downloading(piece, offset, length)`: called when a PIECE message
    /// header arrives. Finds the matching transfer across all four
    /// buckets, promotes it to `current`, and returns whether a live
    /// match was found.
    #[instrument(level = "trace", skip(self, delegator))]
    pub fn downloading(
        &mut self,
        delegator: &mut Delegator,
        piece_index: ValidPieceIndex,
        offset: u32,
        length: u32,
    ) -> DownloadingOutcome {
        // The block's own offset within the piece; block_index maps 1:1 to a
        // 16 KiB block for every block but the last.
        fn block_offset_of(h: BlockTransferHandle) -> u32 {
            h.block_index() * crate::delegator::BLOCK_SIZE
        }
        fn handle_matches(h: &BlockTransferHandle, piece_index: ValidPieceIndex, offset: u32, delegator: &Delegator) -> bool {
            h.piece_index() == piece_index
                && block_offset_of(*h) == offset
                && delegator.transfer(*h).is_some()
        }

        if let Some(pos) = self
            .queued
            .items
            .iter()
            .position(|h| handle_matches(h, piece_index, offset, delegator))
        {
            let preceding: Vec<_> = self.queued.items.drain(..pos).collect();
            let handle = self.queued.items.pop_front().expect("matched entry just located");
            self.queued.total.fetch_sub((preceding.len() + 1) as u32, Ordering::Relaxed);
            self.cancel_preceding(delegator, preceding);

            if length == 0 {
                warn!(%piece_index, offset, "peer refuses block, installing dummy transfer");
                delegator.release_transfer(handle);
                self.current = Current::Dummy(Dummy {
                    piece_index,
                    offset,
                    length: 0,
                    position: 0,
                });
                return DownloadingOutcome::Unmatched;
            }

            delegator.set_transferring(handle);
            self.current = Current::Transfer(handle);
            return DownloadingOutcome::Matched;
        }

        for bucket in [&mut self.unordered, &mut self.stalled, &mut self.choked] {
            if let Some(handle) = bucket.remove_matching(|h| {
                h.piece_index() == piece_index && block_offset_of(*h) == offset
            }) {
                bucket.stats.on_remove();
                if delegator.transfer(handle).is_none() {
                    trace!(%piece_index, offset, "matched transfer went stale, installing dummy");
                    self.current = Current::Dummy(Dummy {
                        piece_index,
                        offset,
                        length,
                        position: 0,
                    });
                    return DownloadingOutcome::Unmatched;
                }
                delegator.set_transferring(handle);
                self.current = Current::Transfer(handle);
                return DownloadingOutcome::Matched;
            }
        }

        trace!(%piece_index, offset, "no matching transfer, installing dummy");
        self.current = Current::Dummy(Dummy {
            piece_index,
            offset,
            length,
            position: 0,
        });
        DownloadingOutcome::Unmatched
    }

    /// `finished()`: the current transfer's bytes are all in; hand it to
    /// the delegator's `finished` and clear `current`.
    pub fn finished(&mut self, delegator: &mut Delegator, events: &dyn DelegatorEvents) -> Result<(), crate::engine_error::EngineError> {
        let handle = match std::mem::replace(&mut self.current, Current::None) {
            Current::Transfer(handle) => handle,
            other => {
                self.current = other;
                return Err(crate::engine_error::EngineError::internal(
                    "bug: finished() called while not downloading a real transfer",
                ));
            }
        };
        delegator.finished(handle, events)
    }

    /// `skipped()`: release the current transfer; used when a connection
    /// drops mid-block.
    pub fn skipped(&mut self, delegator: &mut Delegator) {
        match std::mem::replace(&mut self.current, Current::None) {
            Current::Transfer(handle) => delegator.release_transfer(handle),
            Current::Dummy(_) | Current::None => {}
        }
    }

    /// `transfer_dissimilar()`: the bytes just received disagree with
    /// another peer's copy of this block. Replace the current transfer
    /// with a dummy that silently absorbs the remainder.
    pub fn transfer_dissimilar(&mut self, delegator: &mut Delegator) {
        if let Current::Transfer(handle) = std::mem::replace(&mut self.current, Current::None) {
            let piece_index = handle.piece_index();
            let (offset, length, position) = delegator
                .transfer(handle)
                .map(|t| (handle.block_index() * crate::delegator::BLOCK_SIZE, 0u32, t.position))
                .unwrap_or((0, 0, 0));
            delegator.release_transfer(handle);
            self.current = Current::Dummy(Dummy {
                piece_index,
                offset,
                length,
                position,
            });
        }
    }

    pub fn calculate_pipe_size(rate_bytes_per_second: u64, aggressive: bool) -> u32 {
        let r = rate_bytes_per_second / 1024;
        if aggressive {
            if r < 10 {
                (r / 5 + 1) as u32
            } else {
                (r / 10 + 2) as u32
            }
        } else if r < 20 {
            (r + 2) as u32
        } else {
            (r / 5 + 18) as u32
        }
    }
}

impl Default for RequestList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_size_matches_the_documented_formula() {
        assert_eq!(RequestList::calculate_pipe_size(5 * 1024, false), 7);
        assert_eq!(RequestList::calculate_pipe_size(25 * 1024, false), 23);
        assert_eq!(RequestList::calculate_pipe_size(5 * 1024, true), 2);
        assert_eq!(RequestList::calculate_pipe_size(20 * 1024, true), 4);
    }

    #[test]
    fn choked_then_unchoked_arms_the_long_grace_period() {
        let mut rl = RequestList::new();
        let now = Instant::now();
        rl.choked(now);
        assert_eq!(rl.choked_removal_deadline, Some(now + CHOKE_GRACE_SHORT));
        rl.unchoked(now);
        assert!(rl.choked_removal_deadline.is_none());
    }

    #[test]
    fn bucket_counters_track_fifo_length() {
        let mut q = BucketQueue::default();
        assert_eq!(q.total.load(Ordering::Relaxed), 0);
    }

    struct FixedSelector(Option<u32>);
    impl PieceSelector for FixedSelector {
        fn select_new(&mut self, _range: &crate::priority_ranges::PriorityRanges, _peer_bitfield: &BF, _have: &BF) -> Option<ValidPieceIndex> {
            self.0
                .take()
                .and_then(|i| librqbit_core::lengths::Lengths::new(16384, 16384).unwrap().validate_piece_index(i))
        }
    }

    #[test]
    fn cancel_moves_a_queued_transfer_to_unordered_and_stalls_it() {
        use crate::priority_ranges::PriorityRanges;
        use std::net::SocketAddr;

        let lengths = librqbit_core::lengths::Lengths::new(16384, 16384).unwrap();
        let mut high = PriorityRanges::new();
        high.insert(0..1);
        let mut delegator = Delegator::new(lengths, high, PriorityRanges::new(), &crate::engine_config::EngineConfig::default());
        let peer: crate::type_aliases::PeerHandle = SocketAddr::from(([127, 0, 0, 1], 1));
        let bf = BF::repeat(true, 1);
        let have = BF::repeat(false, 1);

        let mut rl = RequestList::new();
        let mut selector = FixedSelector(Some(0));
        let handle = rl
            .delegate(&mut delegator, peer, &bf, &have, false, &mut selector)
            .expect("delegate should succeed");
        assert_eq!(rl.bucket_len(Bucket::Queued), 1);

        let piece_index = handle.piece_index();
        assert!(rl.cancel(&mut delegator, piece_index, 0));

        assert_eq!(rl.bucket_len(Bucket::Queued), 0);
        assert_eq!(rl.bucket_len(Bucket::Unordered), 1);
        assert_eq!(delegator.transfer(handle).unwrap().state, TransferState::Stalled);

        // Cancelling again (nothing left in queued) is a no-op.
        assert!(!rl.cancel(&mut delegator, piece_index, 0));
    }
}
