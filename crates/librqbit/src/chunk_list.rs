//! Component B: index chunks by piece number, hand out reference-counted
//! handles, and run the ordered write-dirty `msync` pipeline.
//!
//! Mutation is main-thread-only (see the concurrency model): every method
//! here takes `&mut self`, there is no internal locking. The only thing
//! shared across the hash worker boundary is the underlying
//! [`MemoryChunkRegion`], which is already safe for concurrent reads.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use librqbit_core::lengths::{Lengths, ValidPieceIndex};
use tracing::{debug, instrument, trace, warn};

use crate::engine_config::EngineConfig;
use crate::engine_error::EngineError;
use crate::file_info::FileInfo;
use crate::mem_region::{Chunk, MemoryChunkRegion};

/// Callbacks the embedder wires up at construction (design note: typed
/// listeners replace `sigc` signals; one receiver per signal is enough).
pub trait ChunkListEvents: Send + Sync {
    fn storage_error(&self, index: ValidPieceIndex, error: &EngineError);
}

pub struct NullChunkListEvents;
impl ChunkListEvents for NullChunkListEvents {
    fn storage_error(&self, index: ValidPieceIndex, error: &EngineError) {
        warn!(piece = %index, %error, "storage error during sync_chunks");
    }
}

struct ChunkListNode {
    chunk: Option<Chunk>,
    references: u32,
    writable: u32,
    blocking: u32,
    time_modified: Option<Instant>,
    sync_triggered: bool,
    queued: bool,
}

impl ChunkListNode {
    fn empty() -> Self {
        Self {
            chunk: None,
            references: 0,
            writable: 0,
            blocking: 0,
            time_modified: None,
            sync_triggered: false,
            queued: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkGetFlags {
    pub writable: bool,
    pub blocking: bool,
    pub nonblock: bool,
    pub dont_log: bool,
}

/// A ticket giving the holder typed access to one piece's chunk. Must be
/// consumed by exactly one matching [`ChunkList::release`]; dropping it
/// otherwise is a bug (logged, and debug-asserted).
pub struct ChunkHandle {
    index: ValidPieceIndex,
    writable: bool,
    blocking: bool,
    released: bool,
}

impl ChunkHandle {
    pub const fn index(&self) -> ValidPieceIndex {
        self.index
    }

    pub const fn is_writable(&self) -> bool {
        self.writable
    }
}

impl Drop for ChunkHandle {
    fn drop(&mut self) {
        if !self.released {
            tracing::error!(piece = %self.index, "bug: ChunkHandle dropped without release");
            debug_assert!(self.released, "ChunkHandle dropped without release");
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncFlags {
    pub all: bool,
    pub force: bool,
    pub safe: bool,
    pub sloppy: bool,
    pub use_timeout: bool,
    pub ignore_error: bool,
}

impl SyncFlags {
    pub fn all() -> Self {
        Self {
            all: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Default)]
pub struct SyncReport {
    pub synced: usize,
    pub skipped_by_optimizer: usize,
    pub failed: usize,
}

pub struct ChunkList {
    region: Arc<MemoryChunkRegion>,
    file_infos: Vec<FileInfo>,
    nodes: Vec<ChunkListNode>,
    queue: VecDeque<u32>,
    config: EngineConfig,
    listener: Arc<dyn ChunkListEvents>,
}

impl ChunkList {
    pub fn new(
        region: Arc<MemoryChunkRegion>,
        file_infos: Vec<FileInfo>,
        lengths: &Lengths,
        config: EngineConfig,
        listener: Arc<dyn ChunkListEvents>,
    ) -> Self {
        let nodes = (0..lengths.total_pieces())
            .map(|_| ChunkListNode::empty())
            .collect();
        Self {
            region,
            file_infos,
            nodes,
            queue: VecDeque::new(),
            config,
            listener,
        }
    }

    pub fn region(&self) -> &Arc<MemoryChunkRegion> {
        &self.region
    }

    /// A clone of the live `Chunk` backing `index`, if any handle is
    /// currently outstanding. Used by the hash pipeline driver to hand a
    /// read-only snapshot to the hash worker thread while the main thread
    /// keeps the owning `ChunkHandle` until the digest is drained.
    pub fn chunk_of(&self, index: ValidPieceIndex) -> Option<Chunk> {
        self.node(index).chunk.clone()
    }

    fn node(&self, index: ValidPieceIndex) -> &ChunkListNode {
        &self.nodes[index.get() as usize]
    }

    fn node_mut(&mut self, index: ValidPieceIndex) -> &mut ChunkListNode {
        &mut self.nodes[index.get() as usize]
    }

    #[instrument(level = "debug", skip(self), fields(piece = %index))]
    pub fn get(
        &mut self,
        index: ValidPieceIndex,
        flags: ChunkGetFlags,
        now: Instant,
    ) -> Result<ChunkHandle, EngineError> {
        let currently_writable = self.node(index).chunk.as_ref().map(|c| c.writable);

        match currently_writable {
            None => {
                let chunk = self
                    .region
                    .create_chunk(&self.file_infos, index, flags.writable)?;
                let node = self.node_mut(index);
                node.chunk = Some(chunk);
                node.time_modified = Some(now);
            }
            Some(false) if flags.writable => {
                let node = self.node(index);
                if node.blocking > 0 {
                    if !flags.nonblock {
                        return Err(EngineError::internal(format!(
                            "bug: write requested on piece {index} while a blocking reader holds it"
                        )));
                    }
                    return Err(EngineError::again());
                }
                let old = self.node_mut(index).chunk.take().unwrap();
                self.region.destroy_chunk(&old);
                let chunk = self
                    .region
                    .create_chunk(&self.file_infos, index, true)?;
                let node = self.node_mut(index);
                node.chunk = Some(chunk);
                node.time_modified = Some(now);
            }
            Some(_) => {}
        }

        let node = self.node_mut(index);
        node.references += 1;
        if flags.writable {
            node.writable += 1;
            node.sync_triggered = false;
        }
        if flags.blocking {
            node.blocking += 1;
        }

        if !flags.dont_log {
            trace!(piece = %index, writable = flags.writable, blocking = flags.blocking, references = node.references, "chunk get");
        }

        Ok(ChunkHandle {
            index,
            writable: flags.writable,
            blocking: flags.blocking,
            released: false,
        })
    }

    #[instrument(level = "debug", skip(self, handle))]
    pub fn release(&mut self, mut handle: ChunkHandle) -> Result<(), EngineError> {
        let index = handle.index;
        let node = self.node_mut(index);

        if handle.blocking {
            node.blocking = node.blocking.saturating_sub(1);
        }

        if handle.writable {
            node.writable = node.writable.saturating_sub(1);
            if node.writable == 0 {
                if node.queued {
                    return Err(EngineError::internal(format!(
                        "bug: piece {index} queued for sync twice"
                    )));
                }
                node.queued = true;
                self.queue.push_back(index.get());
            }
        }

        node.references = node.references.saturating_sub(1);

        if !handle.writable && node.references == 0 && !node.queued {
            if let Some(chunk) = node.chunk.take() {
                self.region.destroy_chunk(&chunk);
            }
        }

        handle.released = true;
        debug!(piece = %index, "chunk released");
        Ok(())
    }

    /// Maps a writable chunk's (file, offset) -> host address range, for
    /// the SIGBUS observer: resolves a faulting address back to a piece.
    pub fn find_address(&self, addr: usize) -> Option<(ValidPieceIndex, usize)> {
        for (i, node) in self.nodes.iter().enumerate() {
            let chunk = node.chunk.as_ref()?;
            for part in &chunk.parts {
                if let Ok((start, end)) = self.region.part_address_range(part) {
                    if addr >= start && addr < end {
                        let piece_index = self.region.lengths().validate_piece_index(i as u32)?;
                        return Some((piece_index, addr - start));
                    }
                }
            }
        }
        None
    }

    #[instrument(level = "debug", skip(self))]
    pub fn sync_chunks(
        &mut self,
        mut flags: SyncFlags,
        now: Instant,
        free_diskspace_bytes: u64,
    ) -> SyncReport {
        if self.queue.is_empty() {
            return SyncReport::default();
        }

        let mut items: Vec<u32> = self.queue.iter().copied().collect();

        let mut split = if flags.all {
            0
        } else {
            let mut front = Vec::new();
            let mut rest = Vec::new();
            for idx in items.iter().copied() {
                if self.nodes[idx as usize].writable != 1 {
                    front.push(idx);
                } else {
                    rest.push(idx);
                }
            }
            let split = front.len();
            items = front.into_iter().chain(rest).collect();
            split
        };

        items[split..].sort_unstable();

        if !flags.safe && !flags.sloppy {
            if self.config.safe_sync || free_diskspace_bytes <= self.config.safe_free_diskspace_bytes {
                flags.safe = true;
            } else {
                flags.force = true;
            }
        }

        let mut report = SyncReport::default();

        if flags.use_timeout && !flags.force {
            let new_split = self.optimize_split(&items, split, now);
            report.skipped_by_optimizer = new_split - split;
            split = new_split;
        }

        for &idx in &items[split..] {
            let raw_index = idx;
            let node_idx = raw_index as usize;
            let (async_mode, then_release) = {
                let node = &self.nodes[node_idx];
                determine_mode(&flags, node.sync_triggered)
            };

            let sync_result = {
                let node = &self.nodes[node_idx];
                match node.chunk.as_ref() {
                    Some(chunk) => chunk.sync(&self.region, async_mode),
                    None => Ok(()),
                }
            };

            match sync_result {
                Ok(()) => {
                    let node = &mut self.nodes[node_idx];
                    node.sync_triggered = true;
                    if then_release {
                        node.writable = node.writable.saturating_sub(1);
                        if node.writable == 0 && node.references == 0 {
                            if let Some(chunk) = node.chunk.take() {
                                self.region.destroy_chunk(&chunk);
                            }
                        }
                    }
                    node.queued = false;
                    report.synced += 1;
                }
                Err(e) => {
                    report.failed += 1;
                    if !flags.ignore_error {
                        if let Some(piece_index) = self.region.lengths().validate_piece_index(raw_index)
                        {
                            self.listener.storage_error(piece_index, &e);
                        }
                    }
                }
            }
        }

        self.queue = items
            .into_iter()
            .filter(|idx| self.nodes[*idx as usize].queued)
            .collect();

        report
    }

    /// Groups `items[split..]` (already sorted ascending) into runs of
    /// pieces within `sync_close_distance` of each other, and skips
    /// (leaves queued) any non-required run shorter than
    /// `sync_optimizer_max_distance`, debiting a weight budget per skip.
    /// Stops skipping at the first required or un-skippable run, or once
    /// the budget is exhausted.
    fn optimize_split(&self, items: &[u32], split: usize, now: Instant) -> usize {
        let tail = &items[split..];
        if tail.is_empty() {
            return split;
        }
        let mut weight = self.config.sync_optimizer_weight;
        let mut i = 0usize;
        while i < tail.len() {
            let mut j = i + 1;
            while j < tail.len()
                && (tail[j] - tail[j - 1]) as i64 <= self.config.sync_close_distance as i64
            {
                j += 1;
            }
            let run = &tail[i..j];
            let run_len = run.len() as u32;
            let required = run.iter().any(|&idx| {
                let node = &self.nodes[idx as usize];
                match node.time_modified {
                    Some(tm) => now.duration_since(tm) >= self.config.timeout_sync,
                    None => false,
                }
            });

            if !required && run_len < self.config.sync_optimizer_max_distance {
                if weight > 0 {
                    weight -= (run_len as i64) * (run_len as i64);
                    i = j;
                    continue;
                }
            }
            break;
        }
        split + i
    }
}

fn determine_mode(flags: &SyncFlags, sync_triggered: bool) -> (bool /* async */, bool /* release */) {
    if flags.force && flags.safe {
        (false, true)
    } else if flags.safe && !flags.force {
        if sync_triggered { (false, true) } else { (true, false) }
    } else if flags.force && !flags.safe {
        (true, true)
    } else {
        (true, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_info::FileInfo;
    use librqbit_core::lengths::Lengths;
    use std::time::Duration;

    fn build(total: u64, piece_length: u32) -> (ChunkList, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let lengths = Lengths::new(total, piece_length).unwrap();
        let file_infos = vec![FileInfo {
            relative_filename: "f.bin".into(),
            offset_in_torrent: 0,
            piece_range: 0..lengths.total_pieces(),
            len: total,
        }];
        let region = Arc::new(
            MemoryChunkRegion::new(
                lengths,
                &file_infos,
                dir.path().to_path_buf(),
                16 * 1024 * 1024,
                Duration::from_secs(10),
            )
            .unwrap(),
        );
        let list = ChunkList::new(
            region,
            file_infos,
            &lengths,
            EngineConfig::default(),
            Arc::new(NullChunkListEvents),
        );
        (list, dir)
    }

    fn lengths_of(list: &ChunkList) -> Lengths {
        *list.region.lengths()
    }

    #[test]
    fn get_then_release_read_only_destroys_chunk_immediately() {
        let (mut list, _dir) = build(16384, 16384);
        let idx = lengths_of(&list).validate_piece_index(0).unwrap();
        let now = Instant::now();
        let handle = list.get(idx, ChunkGetFlags::default(), now).unwrap();
        assert_eq!(list.region.memory_usage(), 16384);
        list.release(handle).unwrap();
        assert_eq!(list.region.memory_usage(), 0);
        assert!(list.queue.is_empty());
    }

    #[test]
    fn writable_release_enqueues_for_sync_without_unmapping() {
        let (mut list, _dir) = build(16384, 16384);
        let idx = lengths_of(&list).validate_piece_index(0).unwrap();
        let now = Instant::now();
        let handle = list
            .get(idx, ChunkGetFlags { writable: true, ..Default::default() }, now)
            .unwrap();
        list.release(handle).unwrap();
        assert_eq!(list.queue.len(), 1);
        // Still mapped: memory usage not released until synced.
        assert_eq!(list.region.memory_usage(), 16384);
    }

    #[test]
    fn sync_chunks_drains_queue_and_second_call_is_a_noop() {
        let (mut list, _dir) = build(16384, 16384);
        let idx = lengths_of(&list).validate_piece_index(0).unwrap();
        let now = Instant::now();
        let handle = list
            .get(idx, ChunkGetFlags { writable: true, ..Default::default() }, now)
            .unwrap();
        list.release(handle).unwrap();

        let report = list.sync_chunks(SyncFlags::all(), now, u64::MAX);
        assert_eq!(report.synced, 1);
        assert!(list.queue.is_empty());
        assert_eq!(list.region.memory_usage(), 0);

        let report2 = list.sync_chunks(SyncFlags::all(), now, u64::MAX);
        assert_eq!(report2.synced, 0);
        assert_eq!(report2.failed, 0);
    }

    #[test]
    fn nonblock_write_request_against_blocking_reader_returns_again() {
        let (mut list, _dir) = build(16384, 16384);
        let idx = lengths_of(&list).validate_piece_index(0).unwrap();
        let now = Instant::now();
        let _reader = list
            .get(idx, ChunkGetFlags { blocking: true, ..Default::default() }, now)
            .unwrap();
        let err = list
            .get(
                idx,
                ChunkGetFlags {
                    writable: true,
                    nonblock: true,
                    ..Default::default()
                },
                now,
            )
            .unwrap_err();
        assert!(err.is_again());
    }

    #[test]
    fn nonblock_write_request_against_non_blocking_reader_rebuilds_writable() {
        // A read-only holder with `blocking == 0` must not trip the
        // `e_again` path even when the writer passes `nonblock`: the
        // conflict only exists against a *blocking* reader.
        let (mut list, _dir) = build(16384, 16384);
        let idx = lengths_of(&list).validate_piece_index(0).unwrap();
        let now = Instant::now();
        let reader = list
            .get(idx, ChunkGetFlags { ..Default::default() }, now)
            .unwrap();
        let writer = list
            .get(
                idx,
                ChunkGetFlags {
                    writable: true,
                    nonblock: true,
                    ..Default::default()
                },
                now,
            )
            .expect("blocking==0 must fall through to the rebuild path regardless of nonblock");
        assert!(writer.writable);
        list.release(reader).unwrap();
        list.release(writer).unwrap();
    }
}
