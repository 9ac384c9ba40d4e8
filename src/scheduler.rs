//! Block assignment across the swarm.
//!
//! [`PieceScheduler`] is the single authority on which blocks are wanted and
//! who has been asked for them. It also owns the local [`Bitfield`] of
//! verified pieces, so "is this piece missing" and "is this block assigned"
//! are always answered from the same state. Callers serialize access with a
//! mutex.

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::peer::{Bitfield, BlockRequest};
use crate::torrent::TorrentDescriptor;

#[derive(Debug, Clone, PartialEq, Eq)]
enum BlockSlot {
    Missing,
    /// Outstanding to these peers. More than one only in endgame.
    Requested(Vec<SocketAddr>),
    Received,
}

#[derive(Debug)]
struct PieceProgress {
    blocks: Vec<BlockSlot>,
}

impl PieceProgress {
    fn new(block_count: u32) -> Self {
        Self {
            blocks: vec![BlockSlot::Missing; block_count as usize],
        }
    }

    fn missing(&self) -> usize {
        self.blocks
            .iter()
            .filter(|b| **b == BlockSlot::Missing)
            .count()
    }
}

/// What became of a received block.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BlockReceipt {
    /// The block is new and should go to the assembler.
    pub accepted: bool,
    /// Duplicate endgame requests that should now be cancelled.
    pub cancel: Vec<(SocketAddr, BlockRequest)>,
}

/// Rarest-first block scheduler with endgame mode.
///
/// Outside endgame a block is outstanding to at most one peer. Endgame
/// begins once every block of every missing piece is either requested or
/// received; from then on idle peers may be handed duplicates of blocks
/// already outstanding elsewhere.
#[derive(Debug)]
pub struct PieceScheduler {
    block_size: u32,
    piece_lens: Vec<u32>,
    have: Bitfield,
    availability: Vec<u32>,
    pieces: HashMap<u32, PieceProgress>,
    /// `Missing` blocks across all missing pieces, counting pieces that
    /// have no progress entry yet.
    pending: usize,
}

impl PieceScheduler {
    pub fn new(descriptor: &TorrentDescriptor, block_size: u32) -> Self {
        let count = descriptor.piece_count();
        let piece_lens: Vec<u32> = (0..count as u32).map(|i| descriptor.piece_len(i)).collect();
        let block_size = block_size.max(1);
        let pending = piece_lens
            .iter()
            .map(|len| len.div_ceil(block_size) as usize)
            .sum();

        Self {
            block_size,
            piece_lens,
            have: Bitfield::new(count),
            availability: vec![0; count],
            pieces: HashMap::new(),
            pending,
        }
    }

    pub fn piece_count(&self) -> usize {
        self.piece_lens.len()
    }

    /// Verified pieces.
    pub fn have(&self) -> &Bitfield {
        &self.have
    }

    pub fn is_complete(&self) -> bool {
        self.have.is_complete()
    }

    pub fn in_endgame(&self) -> bool {
        self.pending == 0 && !self.is_complete()
    }

    /// Bytes covered by verified pieces.
    pub fn bytes_completed(&self) -> u64 {
        self.have
            .iter_set()
            .map(|i| self.piece_lens[i] as u64)
            .sum()
    }

    pub fn piece_available(&self, index: u32) -> u32 {
        self.availability.get(index as usize).copied().unwrap_or(0)
    }

    pub fn add_availability(&mut self, remote: &Bitfield) {
        for index in remote.iter_set() {
            if let Some(count) = self.availability.get_mut(index) {
                *count += 1;
            }
        }
    }

    pub fn remove_availability(&mut self, remote: &Bitfield) {
        for index in remote.iter_set() {
            if let Some(count) = self.availability.get_mut(index) {
                *count = count.saturating_sub(1);
            }
        }
    }

    /// Counts one more holder of `index` after a `have`.
    pub fn peer_has(&mut self, index: u32) {
        if let Some(count) = self.availability.get_mut(index as usize) {
            *count += 1;
        }
    }

    /// Whether `remote` offers anything we still lack.
    pub fn is_interesting(&self, remote: &Bitfield) -> bool {
        remote.has_any_missing_from(&self.have)
    }

    /// Marks a piece as already stored without going through assembly.
    pub fn mark_verified(&mut self, index: u32) {
        if !self.have.set(index as usize) {
            return;
        }
        let missing = match self.pieces.remove(&index) {
            Some(progress) => progress.missing(),
            None => self.block_count(index) as usize,
        };
        self.pending -= missing;
    }

    /// Picks up to `max_in_flight - in_flight` blocks for `peer` to fetch.
    ///
    /// Pieces are taken rarest first, ties broken by ascending index, and a
    /// chosen piece is drained of unassigned blocks before moving on.
    pub fn next_requests(
        &mut self,
        peer: SocketAddr,
        remote: &Bitfield,
        in_flight: usize,
        max_in_flight: usize,
    ) -> Vec<BlockRequest> {
        let mut capacity = max_in_flight.saturating_sub(in_flight);
        let mut out = Vec::new();
        if capacity == 0 || self.is_complete() {
            return out;
        }

        if !self.in_endgame() {
            let mut candidates: Vec<u32> = (0..self.piece_count() as u32)
                .filter(|&i| {
                    remote.has(i as usize) && !self.have.has(i as usize) && self.has_missing(i)
                })
                .collect();
            candidates.sort_by_key(|&i| (self.availability[i as usize], i));

            for index in candidates {
                let block_count = self.block_count(index);
                let piece_len = self.piece_lens[index as usize];
                let block_size = self.block_size;
                let progress = self
                    .pieces
                    .entry(index)
                    .or_insert_with(|| PieceProgress::new(block_count));

                for (block, slot) in progress.blocks.iter_mut().enumerate() {
                    if *slot != BlockSlot::Missing {
                        continue;
                    }
                    *slot = BlockSlot::Requested(vec![peer]);
                    self.pending -= 1;
                    out.push(block_request(index, block as u32, piece_len, block_size));
                    capacity -= 1;
                    if capacity == 0 {
                        return out;
                    }
                }
            }

            if !self.in_endgame() {
                return out;
            }
        }

        self.endgame_requests(peer, remote, capacity, &mut out);
        out
    }

    fn endgame_requests(
        &mut self,
        peer: SocketAddr,
        remote: &Bitfield,
        mut capacity: usize,
        out: &mut Vec<BlockRequest>,
    ) {
        let mut candidates: Vec<u32> = self
            .pieces
            .keys()
            .copied()
            .filter(|&i| remote.has(i as usize) && !self.have.has(i as usize))
            .collect();
        candidates.sort_by_key(|&i| (self.availability[i as usize], i));

        for index in candidates {
            let Some(progress) = self.pieces.get_mut(&index) else {
                continue;
            };
            let mut picked = Vec::new();
            for (block, slot) in progress.blocks.iter_mut().enumerate() {
                if capacity == 0 {
                    break;
                }
                if let BlockSlot::Requested(holders) = slot {
                    if !holders.contains(&peer) {
                        holders.push(peer);
                        picked.push(block as u32);
                        capacity -= 1;
                    }
                }
            }
            for block in picked {
                out.push(self.request_for(index, block));
            }
            if capacity == 0 {
                return;
            }
        }
    }

    /// Returns requests that `peer` will not answer to the assignable pool.
    pub fn release(&mut self, peer: SocketAddr, requests: &[BlockRequest]) {
        for request in requests {
            let Some(block) = self.block_index(request) else {
                continue;
            };
            let Some(progress) = self.pieces.get_mut(&request.piece) else {
                continue;
            };
            let slot = &mut progress.blocks[block];
            if let BlockSlot::Requested(holders) = slot {
                holders.retain(|h| *h != peer);
                if holders.is_empty() {
                    *slot = BlockSlot::Missing;
                    self.pending += 1;
                }
            }
        }
    }

    /// Records a block that arrived from `peer`.
    ///
    /// Blocks for verified pieces, blocks that do not match the piece
    /// layout and blocks already received are not accepted.
    pub fn block_received(&mut self, peer: SocketAddr, request: &BlockRequest) -> BlockReceipt {
        let mut receipt = BlockReceipt::default();
        if self.have.has(request.piece as usize) {
            return receipt;
        }
        let Some(block) = self.block_index(request) else {
            return receipt;
        };

        let block_count = self.block_count(request.piece);
        let progress = self
            .pieces
            .entry(request.piece)
            .or_insert_with(|| PieceProgress::new(block_count));

        let slot = &mut progress.blocks[block];
        match std::mem::replace(slot, BlockSlot::Received) {
            BlockSlot::Received => return receipt,
            BlockSlot::Missing => self.pending -= 1,
            BlockSlot::Requested(holders) => {
                receipt.cancel = holders
                    .into_iter()
                    .filter(|h| *h != peer)
                    .map(|h| (h, *request))
                    .collect();
            }
        }

        receipt.accepted = true;
        receipt
    }

    /// Marks a piece verified and stored. Returns requests for it still
    /// outstanding anywhere, which should be cancelled.
    pub fn piece_verified(&mut self, index: u32) -> Vec<(SocketAddr, BlockRequest)> {
        if !self.have.set(index as usize) {
            return Vec::new();
        }

        let Some(progress) = self.pieces.remove(&index) else {
            self.pending -= self.block_count(index) as usize;
            return Vec::new();
        };
        self.pending -= progress.missing();

        let mut cancel = Vec::new();
        for (block, slot) in progress.blocks.into_iter().enumerate() {
            if let BlockSlot::Requested(holders) = slot {
                let request = self.request_for(index, block as u32);
                cancel.extend(holders.into_iter().map(|h| (h, request)));
            }
        }
        cancel
    }

    /// Forgets all progress on a piece that failed verification, so every
    /// block of it is requested again.
    pub fn piece_failed(&mut self, index: u32) {
        if self.have.has(index as usize) {
            return;
        }
        if let Some(progress) = self.pieces.remove(&index) {
            self.pending += progress.blocks.len() - progress.missing();
        }
    }

    /// Drops a disconnected peer: its pieces no longer count towards
    /// availability and its outstanding requests become assignable.
    pub fn remove_peer(
        &mut self,
        peer: SocketAddr,
        remote: &Bitfield,
        outstanding: &[BlockRequest],
    ) {
        self.remove_availability(remote);
        self.release(peer, outstanding);
    }

    /// Peers a given block is currently outstanding to.
    pub fn holders(&self, request: &BlockRequest) -> Vec<SocketAddr> {
        let Some(block) = self.block_index(request) else {
            return Vec::new();
        };
        match self.pieces.get(&request.piece).map(|p| &p.blocks[block]) {
            Some(BlockSlot::Requested(holders)) => holders.clone(),
            _ => Vec::new(),
        }
    }

    fn has_missing(&self, index: u32) -> bool {
        match self.pieces.get(&index) {
            Some(progress) => progress.blocks.contains(&BlockSlot::Missing),
            None => true,
        }
    }

    fn block_count(&self, index: u32) -> u32 {
        self.piece_lens
            .get(index as usize)
            .map_or(0, |len| len.div_ceil(self.block_size))
    }

    fn request_for(&self, index: u32, block: u32) -> BlockRequest {
        block_request(index, block, self.piece_lens[index as usize], self.block_size)
    }

    /// Slot index for a request, if it lines up with the block layout.
    fn block_index(&self, request: &BlockRequest) -> Option<usize> {
        let piece_len = *self.piece_lens.get(request.piece as usize)?;
        if request.offset % self.block_size != 0 || request.offset >= piece_len {
            return None;
        }
        let block = request.offset / self.block_size;
        if self.request_for(request.piece, block).length != request.length {
            return None;
        }
        Some(block as usize)
    }
}

fn block_request(index: u32, block: u32, piece_len: u32, block_size: u32) -> BlockRequest {
    let offset = block * block_size;
    BlockRequest::new(index, offset, (piece_len - offset).min(block_size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::InfoHash;
    use std::collections::HashSet;

    const BLOCK: u32 = 16384;

    fn descriptor(total: u64, piece_length: u32) -> TorrentDescriptor {
        let count = total.div_ceil(piece_length as u64) as usize;
        TorrentDescriptor::new(
            InfoHash([0u8; 20]),
            total,
            piece_length,
            vec![[0u8; 20]; count],
            vec![],
        )
        .unwrap()
    }

    fn peer(n: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, n], 6881))
    }

    fn bitfield(count: usize, pieces: &[usize]) -> Bitfield {
        let mut bf = Bitfield::new(count);
        for &i in pieces {
            bf.set(i);
        }
        bf
    }

    #[test]
    fn test_splits_pieces_into_blocks() {
        // two pieces of 40000 bytes, the second one short
        let mut scheduler = PieceScheduler::new(&descriptor(70000, 40000), BLOCK);
        let all = Bitfield::full(2);

        let requests = scheduler.next_requests(peer(1), &all, 0, 100);
        assert_eq!(
            requests,
            vec![
                BlockRequest::new(0, 0, 16384),
                BlockRequest::new(0, 16384, 16384),
                BlockRequest::new(0, 32768, 7232),
                BlockRequest::new(1, 0, 16384),
                BlockRequest::new(1, 16384, 13616),
            ]
        );
    }

    #[test]
    fn test_rarest_first_with_index_tie_break() {
        let mut scheduler = PieceScheduler::new(&descriptor(4 * 16384, 16384), BLOCK);
        scheduler.add_availability(&bitfield(4, &[0, 1, 2, 3]));
        scheduler.add_availability(&bitfield(4, &[0, 1, 3]));
        scheduler.add_availability(&bitfield(4, &[0, 3]));

        // availability: 0 -> 3, 1 -> 2, 2 -> 1, 3 -> 3
        let requests = scheduler.next_requests(peer(1), &Bitfield::full(4), 0, 4);
        let order: Vec<u32> = requests.iter().map(|r| r.piece).collect();
        assert_eq!(order, vec![2, 1, 0, 3]);
    }

    #[test]
    fn test_only_requests_pieces_the_peer_has() {
        let mut scheduler = PieceScheduler::new(&descriptor(4 * 16384, 16384), BLOCK);
        let requests = scheduler.next_requests(peer(1), &bitfield(4, &[2]), 0, 10);
        assert_eq!(requests, vec![BlockRequest::new(2, 0, 16384)]);
    }

    #[test]
    fn test_backpressure() {
        let mut scheduler = PieceScheduler::new(&descriptor(10 * 16384, 16384), BLOCK);
        let all = Bitfield::full(10);

        assert_eq!(scheduler.next_requests(peer(1), &all, 0, 3).len(), 3);
        assert_eq!(scheduler.next_requests(peer(1), &all, 3, 3).len(), 0);
        assert_eq!(scheduler.next_requests(peer(1), &all, 2, 3).len(), 1);
    }

    #[test]
    fn test_no_duplicate_assignment_outside_endgame() {
        let mut scheduler = PieceScheduler::new(&descriptor(8 * 16384, 32768), BLOCK);
        let all = Bitfield::full(4);
        let mut seen = HashSet::new();

        for n in 1..=3 {
            assert!(!scheduler.in_endgame());
            for request in scheduler.next_requests(peer(n), &all, 0, 2) {
                assert!(seen.insert(request), "{:?} assigned twice", request);
                assert_eq!(scheduler.holders(&request), vec![peer(n)]);
            }
        }
        assert_eq!(seen.len(), 6);
    }

    #[test]
    fn test_release_returns_blocks_to_pool() {
        let mut scheduler = PieceScheduler::new(&descriptor(2 * 16384, 16384), BLOCK);
        let all = Bitfield::full(2);

        let taken = scheduler.next_requests(peer(1), &all, 0, 10);
        assert_eq!(taken.len(), 2);
        assert!(scheduler.next_requests(peer(2), &bitfield(2, &[]), 0, 10).is_empty());

        scheduler.remove_peer(peer(1), &all, &taken);
        assert!(!scheduler.in_endgame());
        let retaken = scheduler.next_requests(peer(2), &all, 0, 10);
        assert_eq!(retaken, taken);
    }

    #[test]
    fn test_endgame_duplicates_and_cancels() {
        let mut scheduler = PieceScheduler::new(&descriptor(16384, 16384), BLOCK);
        let all = Bitfield::full(1);

        let first = scheduler.next_requests(peer(1), &all, 0, 10);
        assert_eq!(first.len(), 1);
        assert!(scheduler.in_endgame());

        // the holder itself gets no duplicate
        assert!(scheduler.next_requests(peer(1), &all, 1, 10).is_empty());

        let second = scheduler.next_requests(peer(2), &all, 0, 10);
        assert_eq!(second, first);
        assert_eq!(scheduler.holders(&first[0]), vec![peer(1), peer(2)]);

        let receipt = scheduler.block_received(peer(2), &first[0]);
        assert!(receipt.accepted);
        assert_eq!(receipt.cancel, vec![(peer(1), first[0])]);

        // the slower copy is a duplicate
        assert!(!scheduler.block_received(peer(1), &first[0]).accepted);
    }

    #[test]
    fn test_endgame_releasing_one_holder_keeps_block_assigned() {
        let mut scheduler = PieceScheduler::new(&descriptor(16384, 16384), BLOCK);
        let all = Bitfield::full(1);

        let request = scheduler.next_requests(peer(1), &all, 0, 1)[0];
        scheduler.next_requests(peer(2), &all, 0, 1);

        scheduler.release(peer(1), &[request]);
        assert_eq!(scheduler.holders(&request), vec![peer(2)]);
        assert!(scheduler.in_endgame());

        scheduler.release(peer(2), &[request]);
        assert!(!scheduler.in_endgame());
        assert_eq!(scheduler.next_requests(peer(3), &all, 0, 1), vec![request]);
    }

    #[test]
    fn test_verified_piece_ignores_late_blocks() {
        let mut scheduler = PieceScheduler::new(&descriptor(2 * 16384, 16384), BLOCK);
        let request = BlockRequest::new(0, 0, 16384);

        assert!(scheduler.block_received(peer(1), &request).accepted);
        assert!(scheduler.piece_verified(0).is_empty());
        assert!(scheduler.have().has(0));

        assert!(!scheduler.block_received(peer(2), &request).accepted);
        assert!(scheduler.piece_verified(0).is_empty());
        assert_eq!(scheduler.bytes_completed(), 16384);
    }

    #[test]
    fn test_misaligned_block_is_rejected() {
        let mut scheduler = PieceScheduler::new(&descriptor(2 * 16384, 16384), BLOCK);
        assert!(!scheduler.block_received(peer(1), &BlockRequest::new(0, 100, 16384)).accepted);
        assert!(!scheduler.block_received(peer(1), &BlockRequest::new(0, 0, 100)).accepted);
        assert!(!scheduler.block_received(peer(1), &BlockRequest::new(9, 0, 16384)).accepted);
    }

    #[test]
    fn test_failed_piece_is_requested_again() {
        let mut scheduler = PieceScheduler::new(&descriptor(32768, 32768), BLOCK);
        let all = Bitfield::full(1);

        let requests = scheduler.next_requests(peer(1), &all, 0, 10);
        for request in &requests {
            assert!(scheduler.block_received(peer(1), request).accepted);
        }
        assert!(scheduler.in_endgame());

        scheduler.piece_failed(0);
        assert!(!scheduler.in_endgame());
        assert!(!scheduler.have().has(0));
        assert_eq!(scheduler.next_requests(peer(2), &all, 0, 10), requests);
    }

    #[test]
    fn test_mark_verified_skips_piece() {
        let mut scheduler = PieceScheduler::new(&descriptor(2 * 16384, 16384), BLOCK);
        scheduler.mark_verified(0);

        let all = Bitfield::full(2);
        assert!(scheduler.is_interesting(&all));
        assert!(!scheduler.is_interesting(&bitfield(2, &[0])));
        assert_eq!(
            scheduler.next_requests(peer(1), &all, 0, 10),
            vec![BlockRequest::new(1, 0, 16384)]
        );

        scheduler.mark_verified(1);
        assert!(scheduler.is_complete());
        assert!(!scheduler.in_endgame());
        assert!(scheduler.next_requests(peer(1), &all, 0, 10).is_empty());
    }

    #[test]
    fn test_availability_accounting() {
        let mut scheduler = PieceScheduler::new(&descriptor(3 * 16384, 16384), BLOCK);
        let remote = bitfield(3, &[0, 2]);

        scheduler.add_availability(&remote);
        scheduler.peer_has(1);
        assert_eq!(scheduler.piece_available(0), 1);
        assert_eq!(scheduler.piece_available(1), 1);

        scheduler.remove_availability(&remote);
        assert_eq!(scheduler.piece_available(0), 0);
        assert_eq!(scheduler.piece_available(2), 0);
        scheduler.remove_availability(&remote);
        assert_eq!(scheduler.piece_available(0), 0);
    }
}
