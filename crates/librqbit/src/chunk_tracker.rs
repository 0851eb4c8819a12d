use std::collections::HashSet;

use anyhow::Context;
use librqbit_core::lengths::{ChunkInfo, Lengths, ValidPieceIndex};
use peer_binary_protocol::Piece;
use tracing::{debug, trace};

use crate::file_info::FileInfo;
use crate::priority_ranges::PriorityRanges;
use crate::type_aliases::{FileInfos, FilePriorities, BF};

/// Snapshot of how much of a torrent's selected content is downloaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HaveNeededSelected {
    pub have_bytes: u64,
    pub needed_bytes: u64,
    pub selected_bytes: u64,
}

impl HaveNeededSelected {
    pub fn total(&self) -> u64 {
        self.selected_bytes
    }

    pub fn progress(&self) -> u64 {
        self.have_bytes
    }

    pub fn finished(&self) -> bool {
        self.needed_bytes == 0
    }
}

pub struct ChunkTracker {
    // This forms the basis of a "queue" to pull from.
    // It's set to 1 if we need a piece, but the moment we start requesting a peer,
    // it's set to 0.
    //
    // Initially this is the opposite of "have", until we start making requests.
    // An in-flight request is not in "needed", and not in "have".
    needed_pieces: BF,

    // This has a bit set per each chunk (block) that we have written to the output file.
    // It doesn't mean it's valid yet. Used to track how much is left in each piece.
    chunk_status: BF,

    // These are the pieces that we actually have, fully checked and downloaded.
    have: BF,

    lengths: Lengths,

    // What pieces to download first.
    priority_piece_ids: Vec<usize>,

    total_selected_bytes: u64,

    // Download-level priority state: which pieces the user actually wants,
    // split into high and normal ranges. `wanted_chunks` is a cached count
    // that must equal |{i : !have[i] && (i in high or normal)}| after every
    // mutation of `have` or the priority ranges themselves.
    high_priority: PriorityRanges,
    normal_priority: PriorityRanges,
    wanted_chunks: u64,

    // Which pieces are part of the current file selection (as opposed to `needed_pieces`,
    // which also excludes pieces we already have).
    selected: BF,

    // Downloaded bytes per file, indexed the same way as `FileInfos`. Updated piece-by-piece
    // as pieces complete (see `update_file_have_on_piece_completed`), not recomputed from `have`.
    file_have_bytes: Vec<u64>,

    hns: HaveNeededSelected,
}

fn compute_file_have_bytes(have: &BF, lengths: &Lengths, file_infos: &FileInfos) -> Vec<u64> {
    file_infos
        .iter()
        .map(|fi| {
            fi.piece_range_usize()
                .filter(|&i| have.get(i).map(|b| *b).unwrap_or(false))
                .filter_map(|i| lengths.validate_piece_index(i as u32))
                .map(|piece_id| lengths.piece_length(piece_id) as u64)
                .sum::<u64>()
                .min(fi.len)
        })
        .collect()
}

// TODO: this should be redone from "have" pieces, not from "needed" pieces.
// Needed pieces are the ones we need to download, not necessarily the ones we have.
// E.g. we might have more pieces, but the client asks to download only some files
// partially.
fn compute_chunk_status(lengths: &Lengths, needed_pieces: &BF) -> anyhow::Result<BF> {
    if needed_pieces.len() < lengths.total_pieces() as usize {
        anyhow::bail!(
            "bug: needed_pieces.len() < lengths.total_pieces(); {} < {}",
            needed_pieces.len(),
            lengths.total_pieces()
        );
    }
    let required_size = lengths.chunk_bitfield_bytes();
    let vec = vec![0u8; required_size];
    let mut chunk_bf = BF::from_boxed_slice(vec.into_boxed_slice());

    for piece in lengths.iter_piece_infos() {
        let chunks = lengths.chunks_per_piece(piece.piece_index) as usize;
        let offset = (lengths.default_chunks_per_piece() * piece.piece_index.get()) as usize;
        let range = offset..(offset + chunks);
        if !needed_pieces[piece.piece_index.get() as usize] {
            chunk_bf
                .get_mut(range.clone())
                .with_context(|| {
                    format!("bug in bitvec: error getting range {range:?} from chunk_bf")
                })?
                .fill(true);
        }
    }
    Ok(chunk_bf)
}

pub enum ChunkMarkingResult {
    PreviouslyCompleted,
    NotCompleted,
    Completed,
}

impl ChunkTracker {
    /// `have` marks pieces already downloaded and verified, `selected` marks pieces belonging
    /// to files the user wants to download. Everything selected-but-not-had becomes "needed".
    pub fn new(
        have: BF,
        selected: BF,
        lengths: Lengths,
        file_infos: &FileInfos,
    ) -> anyhow::Result<Self> {
        let total_pieces = lengths.total_pieces() as usize;
        anyhow::ensure!(
            have.len() >= total_pieces && selected.len() >= total_pieces,
            "bug: have/selected bitfield shorter than total_pieces"
        );

        let mut needed_pieces =
            BF::from_boxed_slice(vec![0u8; lengths.piece_bitfield_bytes()].into_boxed_slice());
        for i in 0..total_pieces {
            let want = selected.get(i).map(|b| *b).unwrap_or(false)
                && !have.get(i).map(|b| *b).unwrap_or(false);
            needed_pieces.set(i, want);
        }

        // TODO: ideally this needs to be a list based on needed files, e.g.
        // last needed piece for each file. But let's keep simple for now.

        // TODO: bitvec is bugged, the short version panics.
        // let last_needed_piece_id = needed_pieces.iter_ones().next_back();
        let last_needed_piece_id = needed_pieces
            .iter()
            .enumerate()
            .filter_map(|(id, b)| if *b { Some(id) } else { None })
            .last();

        // The last pieces first. Often important information is stored in the last piece.
        // E.g. if it's a video file, than the last piece often contains some index, or just
        // players look into it, and it's better be there.
        let priority_piece_ids = last_needed_piece_id.into_iter().collect();
        let mut high_priority = PriorityRanges::new();
        high_priority.insert(0..lengths.total_pieces());

        let total_selected_bytes: u64 = selected
            .iter_ones()
            .filter_map(|piece_id| lengths.validate_piece_index(piece_id as u32))
            .map(|piece_id| lengths.piece_length(piece_id) as u64)
            .sum();

        let file_have_bytes = compute_file_have_bytes(&have, &lengths, file_infos);

        let mut tracker = Self {
            chunk_status: compute_chunk_status(&lengths, &needed_pieces)
                .context("error computing chunk status")?,
            needed_pieces,
            lengths,
            have,
            priority_piece_ids,
            total_selected_bytes,
            high_priority,
            normal_priority: PriorityRanges::new(),
            wanted_chunks: 0,
            selected,
            file_have_bytes,
            hns: HaveNeededSelected::default(),
        };
        tracker.recompute_wanted_chunks();
        tracker.recompute_hns();
        Ok(tracker)
    }

    /// Replaces the download's high/normal priority ranges (e.g. after the
    /// user changes file selection) and recomputes `wanted_chunks`.
    pub fn set_priorities(&mut self, high_priority: PriorityRanges, normal_priority: PriorityRanges) {
        self.high_priority = high_priority;
        self.normal_priority = normal_priority;
        self.recompute_wanted_chunks();
    }

    pub fn high_priority(&self) -> &PriorityRanges {
        &self.high_priority
    }

    pub fn normal_priority(&self) -> &PriorityRanges {
        &self.normal_priority
    }

    pub fn wanted_chunks(&self) -> u64 {
        self.wanted_chunks
    }

    fn recompute_wanted_chunks(&mut self) {
        self.wanted_chunks = (0..self.lengths.total_pieces())
            .filter(|&i| {
                !self.have.get(i as usize).map(|b| *b).unwrap_or(false)
                    && (self.high_priority.contains(i) || self.normal_priority.contains(i))
            })
            .count() as u64;
    }

    pub fn get_total_selected_bytes(&self) -> u64 {
        self.total_selected_bytes
    }

    pub fn get_lengths(&self) -> &Lengths {
        &self.lengths
    }

    pub fn get_have_pieces(&self) -> &BF {
        &self.have
    }
    pub fn reserve_needed_piece(&mut self, index: ValidPieceIndex) {
        self.needed_pieces.set(index.get() as usize, false)
    }

    pub fn calc_have_bytes(&self) -> u64 {
        self.have
            .iter_ones()
            .filter_map(|piece_id| {
                let piece_id = self.lengths.validate_piece_index(piece_id as u32)?;
                Some(self.lengths.piece_length(piece_id) as u64)
            })
            .sum()
    }

    pub fn calc_needed_bytes(&self) -> u64 {
        self.needed_pieces
            .iter_ones()
            .filter_map(|piece_id| {
                let piece_id = self.lengths.validate_piece_index(piece_id as u32)?;
                Some(self.lengths.piece_length(piece_id) as u64)
            })
            .sum()
    }

    pub fn iter_needed_pieces(&self) -> impl Iterator<Item = usize> + '_ {
        self.priority_piece_ids
            .iter()
            .copied()
            .filter(move |piece_id| self.needed_pieces[*piece_id])
            .chain(
                self.needed_pieces
                    .iter_ones()
                    .filter(move |id| !self.priority_piece_ids.contains(id)),
            )
    }

    // None if wrong chunk
    // true if did something
    // false if didn't do anything
    pub fn mark_chunk_request_cancelled(
        &mut self,
        index: ValidPieceIndex,
        _chunk: u32,
    ) -> Option<bool> {
        if *self.have.get(index.get() as usize)? {
            return Some(false);
        }
        // This will trigger the requesters to re-check each chunk in this piece.
        let chunk_range = self.lengths.chunk_range(index);
        if !self.chunk_status.get(chunk_range)?.all() {
            self.needed_pieces.set(index.get() as usize, true);
        }
        Some(true)
    }

    pub fn mark_piece_broken_if_not_have(&mut self, index: ValidPieceIndex) {
        if self
            .have
            .get(index.get() as usize)
            .map(|r| *r)
            .unwrap_or_default()
        {
            return;
        }
        debug!("remarking piece={} as broken", index);
        self.needed_pieces.set(index.get() as usize, true);
        if let Some(s) = self.chunk_status.get_mut(self.lengths.chunk_range(index)) {
            s.fill(false);
        }
        self.recompute_wanted_chunks();
        self.recompute_hns();
    }

    pub fn mark_piece_downloaded(&mut self, idx: ValidPieceIndex) {
        self.have.set(idx.get() as usize, true);
        self.recompute_wanted_chunks();
        self.recompute_hns();
    }

    fn recompute_hns(&mut self) {
        self.hns = HaveNeededSelected {
            have_bytes: self.calc_have_bytes(),
            needed_bytes: self.calc_needed_bytes(),
            selected_bytes: self.total_selected_bytes,
        };
    }

    /// Current have/needed/selected byte totals. Cheap: recomputed only when `have`,
    /// `needed_pieces` or the file selection change.
    pub fn get_hns(&self) -> &HaveNeededSelected {
        &self.hns
    }

    pub fn get_selected_pieces(&self) -> &BF {
        &self.selected
    }

    pub fn is_finished(&self) -> bool {
        self.hns.finished()
    }

    pub fn is_piece_have(&self, piece: ValidPieceIndex) -> bool {
        self.have.get(piece.get() as usize).map(|b| *b).unwrap_or(false)
    }

    pub fn is_file_finished(&self, file_info: &FileInfo) -> bool {
        file_info
            .piece_range_usize()
            .all(|i| self.have.get(i).map(|b| *b).unwrap_or(false))
    }

    /// Per-file downloaded byte counts, indexed the same way as `FileInfos`.
    pub fn per_file_have_bytes(&self) -> &[u64] {
        &self.file_have_bytes
    }

    /// Pieces that are still needed, ordered by file priority (files earlier in
    /// `file_priorities` are drained first).
    pub fn iter_queued_pieces<'a>(
        &'a self,
        file_priorities: &'a FilePriorities,
        file_infos: &'a FileInfos,
    ) -> impl Iterator<Item = ValidPieceIndex> + 'a {
        file_priorities
            .iter()
            .flat_map(move |&file_id| file_infos[file_id].piece_range_usize())
            .filter(move |&i| self.needed_pieces.get(i).map(|b| *b).unwrap_or(false))
            .filter_map(move |i| self.lengths.validate_piece_index(i as u32))
    }

    /// Replaces the file selection (`only_files`), recomputing needed pieces, selected
    /// bytes and priority ranges from scratch.
    pub fn update_only_files(
        &mut self,
        file_infos: &FileInfos,
        new_only_files: &HashSet<usize>,
    ) -> anyhow::Result<HaveNeededSelected> {
        let mut selected =
            BF::from_boxed_slice(vec![0u8; self.lengths.piece_bitfield_bytes()].into_boxed_slice());
        let mut total_selected_bytes = 0u64;
        let mut high_priority = PriorityRanges::new();
        for &file_id in new_only_files {
            let fi = file_infos
                .get(file_id)
                .with_context(|| format!("invalid file id {file_id} in only_files"))?;
            for i in fi.piece_range_usize() {
                selected.set(i, true);
            }
            high_priority.insert(fi.piece_range.clone());
            total_selected_bytes += fi.len;
        }

        self.selected = selected;
        self.total_selected_bytes = total_selected_bytes;
        self.high_priority = high_priority;
        self.normal_priority = PriorityRanges::new();

        for i in 0..self.lengths.total_pieces() as usize {
            let want = self.selected.get(i).map(|b| *b).unwrap_or(false)
                && !self.have.get(i).map(|b| *b).unwrap_or(false);
            self.needed_pieces.set(i, want);
        }

        self.recompute_wanted_chunks();
        self.recompute_hns();
        Ok(self.hns)
    }

    /// Records that `piece_id` (part of `file_id`) has completed, returning the file's
    /// remaining (not-yet-downloaded) byte count.
    pub fn update_file_have_on_piece_completed(
        &mut self,
        piece_id: ValidPieceIndex,
        file_id: usize,
        file_info: &FileInfo,
    ) -> u64 {
        let piece_len = self.lengths.piece_length(piece_id) as u64;
        let have = self
            .file_have_bytes
            .get_mut(file_id)
            .expect("bug: file_id out of range in update_file_have_on_piece_completed");
        *have = (*have + piece_len).min(file_info.len);
        file_info.len.saturating_sub(*have)
    }

    pub fn is_chunk_ready_to_upload(&self, chunk: &ChunkInfo) -> bool {
        self.have
            .get(chunk.piece_index.get() as usize)
            .map(|b| *b)
            .unwrap_or(false)
    }

    // return true if the whole piece is marked downloaded
    pub fn mark_chunk_downloaded<ByteBuf>(
        &mut self,
        piece: &Piece<ByteBuf>,
    ) -> Option<ChunkMarkingResult>
    where
        ByteBuf: AsRef<[u8]>,
    {
        let chunk_info = self.lengths.chunk_info_from_received_data(
            self.lengths.validate_piece_index(piece.index)?,
            piece.begin,
            piece.block.as_ref().len() as u32,
        )?;
        let chunk_range = self.lengths.chunk_range(chunk_info.piece_index);
        let chunk_range = self.chunk_status.get_mut(chunk_range).unwrap();
        if chunk_range.all() {
            return Some(ChunkMarkingResult::PreviouslyCompleted);
        }
        chunk_range.set(chunk_info.chunk_index as usize, true);
        trace!(
            "piece={}, chunk_info={:?}, bits={:?}",
            piece.index,
            chunk_info,
            chunk_range,
        );

        if chunk_range.all() {
            return Some(ChunkMarkingResult::Completed);
        }
        Some(ChunkMarkingResult::NotCompleted)
    }
}

#[cfg(test)]
mod tests {
    use librqbit_core::{constants::CHUNK_SIZE, lengths::Lengths};

    use crate::priority_ranges::PriorityRanges;
    use crate::type_aliases::BF;

    use super::compute_chunk_status;
    use super::ChunkTracker;

    #[test]
    fn wanted_chunks_tracks_have_and_priority_mutations() {
        let piece_length = CHUNK_SIZE;
        let l = Lengths::new(piece_length as u64 * 4, piece_length).unwrap();
        let selected = BF::from_boxed_slice(vec![0xffu8; l.piece_bitfield_bytes()].into_boxed_slice());
        let have = BF::from_boxed_slice(vec![0u8; l.piece_bitfield_bytes()].into_boxed_slice());
        let file_infos = vec![crate::file_info::FileInfo {
            relative_filename: "test.dat".into(),
            offset_in_torrent: 0,
            len: piece_length as u64 * 4,
            piece_range: 0..l.total_pieces(),
            attrs: Default::default(),
        }];
        let mut tracker = ChunkTracker::new(have, selected, l, &file_infos).unwrap();

        // Constructor seeds high_priority to the full range.
        assert_eq!(tracker.wanted_chunks(), 4);

        let idx = l.validate_piece_index(0).unwrap();
        tracker.mark_piece_downloaded(idx);
        assert_eq!(tracker.wanted_chunks(), 3);

        let mut high = PriorityRanges::new();
        high.insert(0..1);
        tracker.set_priorities(high, PriorityRanges::new());
        assert_eq!(tracker.wanted_chunks(), 0);
    }

    #[test]
    fn test_compute_chunk_status() {
        // Create the most obnoxious lenghts, and ensure it doesn't break in that case.
        let piece_length = CHUNK_SIZE * 2 + 1;
        let l = Lengths::new(piece_length as u64 * 2 + 1, piece_length).unwrap();

        assert_eq!(l.total_pieces(), 3);
        assert_eq!(l.default_chunks_per_piece(), 3);
        assert_eq!(l.total_chunks(), 7);

        {
            let mut needed_pieces =
                BF::from_boxed_slice(vec![0u8; l.piece_bitfield_bytes()].into_boxed_slice());
            needed_pieces.set(0, true);

            let chunks = compute_chunk_status(&l, &needed_pieces).unwrap();
            assert_eq!(chunks[0], false);
            assert_eq!(chunks[1], false);
            assert_eq!(chunks[2], false);
            assert_eq!(chunks[3], true);
            assert_eq!(chunks[4], true);
            assert_eq!(chunks[5], true);
            assert_eq!(chunks[6], true);
        }

        {
            let mut needed_pieces =
                BF::from_boxed_slice(vec![0u8; l.piece_bitfield_bytes()].into_boxed_slice());
            needed_pieces.set(1, true);

            let chunks = compute_chunk_status(&l, &needed_pieces).unwrap();
            dbg!(&chunks);
            assert_eq!(chunks[0], true);
            assert_eq!(chunks[1], true);
            assert_eq!(chunks[2], true);
            assert_eq!(chunks[3], false);
            assert_eq!(chunks[4], false);
            assert_eq!(chunks[5], false);
            assert_eq!(chunks[6], true);
        }

        {
            let mut needed_pieces =
                BF::from_boxed_slice(vec![0u8; l.piece_bitfield_bytes()].into_boxed_slice());
            needed_pieces.set(2, true);

            let chunks = compute_chunk_status(&l, &needed_pieces).unwrap();
            dbg!(&chunks);
            assert_eq!(chunks[0], true);
            assert_eq!(chunks[1], true);
            assert_eq!(chunks[2], true);
            assert_eq!(chunks[3], true);
            assert_eq!(chunks[4], true);
            assert_eq!(chunks[5], true);
            assert_eq!(chunks[6], false);
        }

        {
            // A more reasonable case.
            let piece_length = CHUNK_SIZE * 2;
            let l = Lengths::new(piece_length as u64 * 2 + 1, piece_length).unwrap();

            assert_eq!(l.total_pieces(), 3);
            assert_eq!(l.default_chunks_per_piece(), 2);
            assert_eq!(l.total_chunks(), 5);

            {
                let mut needed_pieces =
                    BF::from_boxed_slice(vec![0u8; l.piece_bitfield_bytes()].into_boxed_slice());
                needed_pieces.set(1, true);

                let chunks = compute_chunk_status(&l, &needed_pieces).unwrap();
                dbg!(&chunks);
                assert_eq!(chunks[0], true);
                assert_eq!(chunks[1], true);
                assert_eq!(chunks[2], false);
                assert_eq!(chunks[3], false);
                assert_eq!(chunks[4], true);
            }

            {
                let mut needed_pieces =
                    BF::from_boxed_slice(vec![0u8; l.piece_bitfield_bytes()].into_boxed_slice());
                needed_pieces.set(2, true);

                let chunks = compute_chunk_status(&l, &needed_pieces).unwrap();
                dbg!(&chunks);
                assert_eq!(chunks[0], true);
                assert_eq!(chunks[1], true);
                assert_eq!(chunks[2], true);
                assert_eq!(chunks[3], true);
                assert_eq!(chunks[4], false);
            }
        }
    }
}
