//! `DownloadCore`: the driver that wires the chunk memory region, chunk
//! list, hash pipeline, delegator and per-peer request list together
//! into one download's worth of peer-facing operations: `request_block`,
//! `on_piece`, `on_cancel`, `on_choke`/`on_unchoke`, `completed_bitfield`,
//! and `pump` for draining asynchronous hash results.
//!
//! This is a new, self-contained composition point rather than a rewrite
//! of `torrent_state::live` in place: that handler still drives piece
//! selection through `chunk_tracker`/`inflight_requests` and is left
//! alone (see `DESIGN.md`'s integration-status notes). `DownloadCore` is
//! where the five components actually meet end to end.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use librqbit_core::lengths::{Lengths, ValidPieceIndex};
use parking_lot::Mutex;
use tracing::{instrument, warn};

use crate::chunk_list::{ChunkGetFlags, ChunkList, ChunkListEvents};
use crate::delegator::{Delegator, DelegatorEvents, PieceSelector};
use crate::engine_config::EngineConfig;
use crate::engine_error::EngineError;
use crate::file_info::FileInfo;
use crate::hash_pipeline::{DownloadId, HashJob, HashPipeline};
use crate::mem_region::MemoryChunkRegion;
use crate::priority_ranges::PriorityRanges;
use crate::request_list::RequestList;
use crate::type_aliases::{BF, PeerHandle};

/// Outcome of a finished hash job, handed back from [`DownloadCore::pump`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceOutcome {
    Passed(ValidPieceIndex),
    Failed(ValidPieceIndex),
}

/// Collects the callbacks the delegator and chunk list fire during a call
/// into queues `pump()` drains afterwards, rather than re-entering
/// `DownloadCore` from inside the callback itself.
#[derive(Default)]
struct PendingEvents {
    piece_complete: Mutex<Vec<ValidPieceIndex>>,
    chunk_disable: Mutex<Vec<ValidPieceIndex>>,
    storage_errors: Mutex<Vec<(ValidPieceIndex, String)>>,
}

impl PendingEvents {
    fn take_piece_complete(&self) -> Vec<ValidPieceIndex> {
        std::mem::take(&mut self.piece_complete.lock())
    }
    fn take_chunk_disable(&self) -> Vec<ValidPieceIndex> {
        std::mem::take(&mut self.chunk_disable.lock())
    }
    fn take_storage_errors(&self) -> Vec<(ValidPieceIndex, String)> {
        std::mem::take(&mut self.storage_errors.lock())
    }
}

impl DelegatorEvents for PendingEvents {
    fn piece_complete(&self, index: ValidPieceIndex) {
        self.piece_complete.lock().push(index);
    }
    fn chunk_disable(&self, index: ValidPieceIndex) {
        self.chunk_disable.lock().push(index);
    }
}

impl ChunkListEvents for PendingEvents {
    fn storage_error(&self, index: ValidPieceIndex, error: &EngineError) {
        warn!(piece = %index, %error, "storage error surfaced to DownloadCore");
        self.storage_errors.lock().push((index, error.to_string()));
    }
}

/// Picks the next not-yet-started, not-yet-completed piece the peer has
/// that falls in the requested priority range. Scans linearly; this is a
/// driver, not the production piece-selection policy (`chunk_tracker`
/// does that with proper indexing for the legacy path).
struct NeedSelector<'a> {
    lengths: Lengths,
    started: &'a BF,
}

impl PieceSelector for NeedSelector<'_> {
    fn select_new(&mut self, range: &PriorityRanges, peer_bitfield: &BF, have: &BF) -> Option<ValidPieceIndex> {
        for idx in 0..self.lengths.total_pieces() {
            if !range.contains(idx) {
                continue;
            }
            if have.get(idx as usize).is_some_and(|b| *b) {
                continue;
            }
            if self.started.get(idx as usize).is_some_and(|b| *b) {
                continue;
            }
            if !peer_bitfield.get(idx as usize).is_some_and(|b| *b) {
                continue;
            }
            if let Some(v) = self.lengths.validate_piece_index(idx) {
                return Some(v);
            }
        }
        None
    }
}

/// Owns one torrent's worth of components A-E and exposes the peer-facing
/// operations of §6: `request_block`, `on_piece`, `on_cancel`,
/// `on_choke`/`on_unchoke`, `completed_bitfield`, and `pump` for draining
/// asynchronous hash results into `piece_passed`/`piece_failed` outcomes.
pub struct DownloadCore {
    lengths: Lengths,
    region: Arc<MemoryChunkRegion>,
    chunk_list: ChunkList,
    hash_pipeline: HashPipeline,
    delegator: Delegator,
    events: Arc<PendingEvents>,
    requests: HashMap<PeerHandle, RequestList>,
    peer_bitfields: HashMap<PeerHandle, BF>,
    completed: BF,
    started: BF,
    pending_hash: HashMap<u32, crate::chunk_list::ChunkHandle>,
    expected_hashes: Vec<[u8; 20]>,
    download_id: DownloadId,
}

impl DownloadCore {
    pub fn new(
        lengths: Lengths,
        file_infos: Vec<FileInfo>,
        output_folder: PathBuf,
        expected_hashes: Vec<[u8; 20]>,
        high_priority: PriorityRanges,
        normal_priority: PriorityRanges,
        config: EngineConfig,
        download_id: DownloadId,
    ) -> Result<Self, EngineError> {
        assert_eq!(
            expected_hashes.len(),
            lengths.total_pieces() as usize,
            "bug: one expected hash per piece"
        );
        let region = Arc::new(MemoryChunkRegion::new(
            lengths,
            &file_infos,
            output_folder,
            config.resolved_max_memory_usage(),
            config.try_free_memory_period,
        )?);
        let events = Arc::new(PendingEvents::default());
        let chunk_list = ChunkList::new(region.clone(), file_infos, &lengths, config.clone(), events.clone());
        let hash_pipeline = HashPipeline::new(region.clone());
        let delegator = Delegator::new(lengths, high_priority, normal_priority, &config);
        let total = lengths.total_pieces() as usize;

        Ok(Self {
            lengths,
            region,
            chunk_list,
            hash_pipeline,
            delegator,
            events,
            requests: HashMap::new(),
            peer_bitfields: HashMap::new(),
            completed: BF::repeat(false, total),
            started: BF::repeat(false, total),
            pending_hash: HashMap::new(),
            expected_hashes,
            download_id,
        })
    }

    pub fn region(&self) -> &Arc<MemoryChunkRegion> {
        &self.region
    }

    pub fn completed_bitfield(&self) -> BF {
        self.completed.clone()
    }

    /// Record (or replace) a peer's full bitfield, e.g. on BITFIELD/HAVE.
    pub fn set_peer_bitfield(&mut self, peer: PeerHandle, bitfield: BF) {
        self.peer_bitfields.insert(peer, bitfield);
    }

    /// Record a single HAVE from a peer.
    pub fn peer_have(&mut self, peer: PeerHandle, piece: u32) {
        let Some(index) = self.lengths.validate_piece_index(piece) else {
            return;
        };
        let total = self.lengths.total_pieces() as usize;
        let bf = self
            .peer_bitfields
            .entry(peer)
            .or_insert_with(|| BF::repeat(false, total));
        bf.set(index.get() as usize, true);
    }

    pub fn on_choke(&mut self, peer: PeerHandle, now: Instant) {
        if let Some(rl) = self.requests.get_mut(&peer) {
            rl.choked(now);
        }
    }

    pub fn on_unchoke(&mut self, peer: PeerHandle, now: Instant) {
        if let Some(rl) = self.requests.get_mut(&peer) {
            rl.unchoked(now);
        }
    }

    /// `request_block(peer) -> Option<(piece, offset, length)>`: ask the
    /// delegator for the next block to request from `peer`.
    #[instrument(level = "trace", skip(self))]
    pub fn request_block(&mut self, peer: PeerHandle) -> Option<(u32, u32, u32)> {
        let peer_bf = self.peer_bitfields.get(&peer)?.clone();
        let is_seeder = peer_bf.count_ones() == self.lengths.total_pieces() as usize;
        let have = self.completed.clone();
        let mut selector = NeedSelector {
            lengths: self.lengths,
            started: &self.started,
        };

        let rl = self.requests.entry(peer).or_insert_with(RequestList::new);
        let handle = rl.delegate(&mut self.delegator, peer, &peer_bf, &have, is_seeder, &mut selector)?;
        self.started.set(handle.piece_index().get() as usize, true);
        let (offset, length) = self.delegator.block_info(handle)?;
        Some((handle.piece_index().get(), offset, length))
    }

    /// `on_piece(peer, piece, offset, data)`: a PIECE message arrived.
    /// Routes through `RequestList::downloading`, writes the bytes via the
    /// chunk list on a match, and marks the block finished.
    #[instrument(level = "debug", skip(self, data), fields(piece, offset, len = data.len()))]
    pub fn on_piece(&mut self, peer: PeerHandle, piece: u32, offset: u32, data: &[u8]) -> Result<(), EngineError> {
        let index = self
            .lengths
            .validate_piece_index(piece)
            .ok_or_else(|| EngineError::Communication(format!("PIECE for out-of-range piece {piece}")))?;

        let rl = self.requests.entry(peer).or_insert_with(RequestList::new);
        let outcome = rl.downloading(&mut self.delegator, index, offset, data.len() as u32);

        if matches!(outcome, crate::request_list::DownloadingOutcome::Matched) {
            let now = Instant::now();
            let handle = self
                .chunk_list
                .get(index, ChunkGetFlags { writable: true, ..Default::default() }, now)?;
            let chunk = self
                .chunk_list
                .chunk_of(index)
                .expect("just obtained a handle for this piece");
            chunk.write_at(&self.region, offset, data)?;
            self.chunk_list.release(handle)?;
            rl.finished(&mut self.delegator, self.events.as_ref())?;
        }

        Ok(())
    }

    /// `on_cancel(peer, piece, offset, length)`: locate the matching
    /// queued transfer and demote it to `unordered`.
    pub fn on_cancel(&mut self, peer: PeerHandle, piece: u32, offset: u32) -> bool {
        let Some(index) = self.lengths.validate_piece_index(piece) else {
            return false;
        };
        let Some(rl) = self.requests.get_mut(&peer) else {
            return false;
        };
        rl.cancel(&mut self.delegator, index, offset)
    }

    fn enqueue_hash(&mut self, index: ValidPieceIndex) -> Result<(), EngineError> {
        let now = Instant::now();
        let handle = self.chunk_list.get(index, ChunkGetFlags::default(), now)?;
        let chunk = self
            .chunk_list
            .chunk_of(index)
            .expect("just obtained a handle for this piece");
        self.pending_hash.insert(index.get(), handle);
        self.hash_pipeline.enqueue(HashJob {
            download_id: self.download_id,
            piece_index: index,
            chunk,
        });
        Ok(())
    }

    /// Drains freshly-completed BlockLists into hash jobs, and finished
    /// hash jobs into `piece_passed`/`piece_failed` outcomes. Call once
    /// per main-loop tick (same pattern as `HashPipeline::drain` itself).
    pub fn pump(&mut self) -> Vec<PieceOutcome> {
        for index in self.events.take_piece_complete() {
            if let Err(e) = self.enqueue_hash(index) {
                warn!(piece = %index, error = %e, "failed to enqueue hash job for a finished piece");
            }
        }

        let mut outcomes = Vec::new();
        for result in self.hash_pipeline.drain() {
            if result.download_id != self.download_id {
                continue;
            }
            let index = result.piece_index;
            if let Some(handle) = self.pending_hash.remove(&index.get()) {
                let _ = self.chunk_list.release(handle);
            }
            let expected = self.expected_hashes[index.get() as usize];
            if result.digest == expected {
                self.completed.set(index.get() as usize, true);
                self.delegator.done(index);
                outcomes.push(PieceOutcome::Passed(index));
            } else {
                self.delegator.redo(index, self.events.as_ref());
                for disabled in self.events.take_chunk_disable() {
                    self.started.set(disabled.get() as usize, false);
                }
                outcomes.push(PieceOutcome::Failed(index));
            }
        }
        outcomes
    }

    pub fn take_storage_errors(&self) -> Vec<(ValidPieceIndex, String)> {
        self.events.take_storage_errors()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha1w::ISha1;
    use std::net::SocketAddr;
    use std::time::Duration;

    fn sha1(data: &[u8]) -> [u8; 20] {
        let mut h: sha1w::Sha1 = ISha1::new();
        h.update(data);
        h.finish()
    }

    fn single_piece_core(data: &[u8]) -> (DownloadCore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let lengths = Lengths::new(data.len() as u64, data.len() as u32).unwrap();
        let file_infos = vec![FileInfo {
            relative_filename: "f.bin".into(),
            offset_in_torrent: 0,
            piece_range: 0..1,
            len: data.len() as u64,
            attrs: Default::default(),
        }];
        let mut high = PriorityRanges::new();
        high.insert(0..1);
        let core = DownloadCore::new(
            lengths,
            file_infos,
            dir.path().to_path_buf(),
            vec![sha1(data)],
            high,
            PriorityRanges::new(),
            EngineConfig::default(),
            1,
        )
        .unwrap();
        (core, dir)
    }

    async fn drain_until(core: &mut DownloadCore, deadline: Duration) -> Vec<PieceOutcome> {
        let started = Instant::now();
        loop {
            let out = core.pump();
            if !out.is_empty() {
                return out;
            }
            if started.elapsed() >= deadline {
                return Vec::new();
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn single_block_torrent_single_peer_passes() {
        let data = vec![0x42u8; 16384];
        let (mut core, _dir) = single_piece_core(&data);
        let peer: PeerHandle = SocketAddr::from(([127, 0, 0, 1], 1));
        core.set_peer_bitfield(peer, BF::repeat(true, 1));

        let (piece, offset, length) = core.request_block(peer).expect("should delegate the only block");
        assert_eq!((piece, offset, length), (0, 0, 16384));

        core.on_piece(peer, piece, offset, &data).unwrap();

        let outcomes = drain_until(&mut core, Duration::from_secs(5)).await;
        assert_eq!(outcomes, vec![PieceOutcome::Passed(core.lengths.validate_piece_index(0).unwrap())]);
        assert!(core.completed_bitfield()[0]);

        // Piece is done; no further block is offered to this peer.
        assert!(core.request_block(peer).is_none());
    }

    #[tokio::test]
    async fn hash_mismatch_reopens_the_piece_for_redelegation() {
        let expected_data = vec![0x11u8; 16384];
        let (mut core, _dir) = single_piece_core(&expected_data);
        let peer: PeerHandle = SocketAddr::from(([127, 0, 0, 1], 1));
        core.set_peer_bitfield(peer, BF::repeat(true, 1));

        let (piece, offset, _length) = core.request_block(peer).unwrap();
        let wrong_data = vec![0x22u8; 16384];
        core.on_piece(peer, piece, offset, &wrong_data).unwrap();

        let outcomes = drain_until(&mut core, Duration::from_secs(5)).await;
        assert_eq!(outcomes, vec![PieceOutcome::Failed(core.lengths.validate_piece_index(0).unwrap())]);
        assert!(!core.completed_bitfield()[0]);

        // The BlockList was destroyed and the piece re-enabled for selection.
        let again = core.request_block(peer).expect("piece 0 should be offered again");
        assert_eq!(again, (0, 0, 16384));
    }
}
