//! Priority x started x rarity piece selection.
//!
//! This module holds no state of its own: [`select_pieces`] is a pure
//! function over borrowed slices, which keeps selection deterministic and
//! independently testable. [`PieceManager`] and
//! [`crate::download::ActivePieceManager`] own the state this function
//! reads.

use std::cmp::Ordering;

use crate::{bitfield::BitField, piece_manager::Priority, PieceIndex};

/// The inputs [`select_pieces`] ranks over.
pub(crate) struct PickerInput<'a> {
    /// The pieces the peer we're picking for has.
    pub peer_bitfield: &'a BitField,
    /// The pieces we already have.
    pub own_bitfield: &'a BitField,
    /// Per-piece priority, index-aligned with the bitfields.
    pub piece_priority: &'a [Priority],
    /// Per-piece count of connected peers known to have it.
    pub piece_availability: &'a [u16],
    /// Pieces with an active, partially downloaded buffer -- preferred over
    /// starting fresh pieces so in-progress work finishes first.
    pub started_pieces: &'a [bool],
    /// The maximum number of piece indices to return.
    pub max_pieces: usize,
}

/// Counts, for diagnostics/tests, of how many candidate pieces were
/// filtered out for each reason, in filter-application order.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PickStats {
    pub skipped_owned: usize,
    pub skipped_peer_lacks: usize,
    pub skipped_low_priority: usize,
    pub considered: usize,
}

/// The result of a selection call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct PickResult {
    pub pieces: Vec<PieceIndex>,
    pub stats: PickStats,
}

/// Selects up to `input.max_pieces` piece indices the peer has that we
/// don't, in priority -> started -> rarest-first order, with the piece
/// index itself as the final, deterministic tie-break.
///
/// This applies three filters in order: own has it (skip), peer lacks it
/// (skip), priority is zero (skip). Survivors are
/// then ranked by the tuple `(-priority, -started, availability, index)`
/// ascending, i.e. higher priority first, started pieces before fresh ones,
/// then rarest first, then lowest index.
pub(crate) fn select_pieces(input: PickerInput<'_>) -> PickResult {
    let n = input.own_bitfield.len();
    debug_assert_eq!(n, input.peer_bitfield.len());
    debug_assert_eq!(n, input.piece_priority.len());
    debug_assert_eq!(n, input.piece_availability.len());

    let mut stats = PickStats::default();
    let mut candidates = Vec::new();

    for i in 0..n {
        if input.own_bitfield.get(i) {
            stats.skipped_owned += 1;
            continue;
        }
        if !input.peer_bitfield.get(i) {
            stats.skipped_peer_lacks += 1;
            continue;
        }
        if input.piece_priority[i] == Priority::Skip {
            stats.skipped_low_priority += 1;
            continue;
        }
        stats.considered += 1;
        let started = input.started_pieces.get(i).copied().unwrap_or(false);
        candidates.push((i, input.piece_priority[i], started, input.piece_availability[i]));
    }

    candidates.sort_by(|a, b| {
        let (ia, pa, sa, ra) = a;
        let (ib, pb, sb, rb) = b;
        // higher priority first
        pb.cmp(pa)
            // started pieces before fresh ones
            .then_with(|| sb.cmp(sa))
            // rarest first
            .then_with(|| ra.cmp(rb))
            // deterministic tie-break
            .then_with(|| ia.cmp(ib))
            .then(Ordering::Equal)
    });

    candidates.truncate(input.max_pieces);

    PickResult {
        pieces: candidates.into_iter().map(|(i, ..)| i).collect(),
        stats,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bitfield_from(bits: &[usize], len: usize) -> BitField {
        let mut b = BitField::new(len);
        for &i in bits {
            b.set(i, true);
        }
        b
    }

    #[test]
    fn skips_owned_and_unavailable_and_zero_priority() {
        let own = bitfield_from(&[0], 4);
        let peer = bitfield_from(&[0, 1, 2], 4);
        let priority = vec![
            Priority::Normal,
            Priority::Normal,
            Priority::Skip,
            Priority::Normal,
        ];
        let availability = vec![1, 1, 1, 1];
        let started = vec![false; 4];
        let result = select_pieces(PickerInput {
            peer_bitfield: &peer,
            own_bitfield: &own,
            piece_priority: &priority,
            piece_availability: &availability,
            started_pieces: &started,
            max_pieces: 10,
        });
        // piece 0: owned; piece 2: zero priority; piece 3: peer lacks it
        assert_eq!(result.pieces, vec![1]);
        assert_eq!(result.stats.skipped_owned, 1);
        assert_eq!(result.stats.skipped_low_priority, 1);
        assert_eq!(result.stats.skipped_peer_lacks, 1);
    }

    #[test]
    fn rarest_first_among_equal_priority() {
        let own = BitField::new(3);
        let peer = bitfield_from(&[0, 1, 2], 3);
        let priority = vec![Priority::Normal; 3];
        // piece 2 is rarest
        let availability = vec![5, 3, 1];
        let started = vec![false; 3];
        let result = select_pieces(PickerInput {
            peer_bitfield: &peer,
            own_bitfield: &own,
            piece_priority: &priority,
            piece_availability: &availability,
            started_pieces: &started,
            max_pieces: 3,
        });
        assert_eq!(result.pieces, vec![2, 1, 0]);
    }

    #[test]
    fn priority_outranks_rarity() {
        let own = BitField::new(2);
        let peer = bitfield_from(&[0, 1], 2);
        let priority = vec![Priority::Normal, Priority::High];
        // piece 0 is rarer but lower priority; piece 1 must still come first
        let availability = vec![1, 100];
        let started = vec![false; 2];
        let result = select_pieces(PickerInput {
            peer_bitfield: &peer,
            own_bitfield: &own,
            piece_priority: &priority,
            piece_availability: &availability,
            started_pieces: &started,
            max_pieces: 2,
        });
        assert_eq!(result.pieces, vec![1, 0]);
    }

    #[test]
    fn started_pieces_finish_before_fresh_ones() {
        let own = BitField::new(2);
        let peer = bitfield_from(&[0, 1], 2);
        let priority = vec![Priority::Normal; 2];
        // piece 1 is rarer, but piece 0 is already started
        let availability = vec![10, 1];
        let started = vec![true, false];
        let result = select_pieces(PickerInput {
            peer_bitfield: &peer,
            own_bitfield: &own,
            piece_priority: &priority,
            piece_availability: &availability,
            started_pieces: &started,
            max_pieces: 1,
        });
        assert_eq!(result.pieces, vec![0]);
    }

    #[test]
    fn index_is_the_final_deterministic_tiebreak() {
        let own = BitField::new(4);
        let peer = bitfield_from(&[0, 1, 2, 3], 4);
        let priority = vec![Priority::Normal; 4];
        let availability = vec![1, 1, 1, 1];
        let started = vec![false; 4];
        let result = select_pieces(PickerInput {
            peer_bitfield: &peer,
            own_bitfield: &own,
            piece_priority: &priority,
            piece_availability: &availability,
            started_pieces: &started,
            max_pieces: 4,
        });
        assert_eq!(result.pieces, vec![0, 1, 2, 3]);
    }

    #[test]
    fn max_pieces_truncates_output() {
        let own = BitField::new(4);
        let peer = bitfield_from(&[0, 1, 2, 3], 4);
        let priority = vec![Priority::Normal; 4];
        let availability = vec![1, 1, 1, 1];
        let started = vec![false; 4];
        let result = select_pieces(PickerInput {
            peer_bitfield: &peer,
            own_bitfield: &own,
            piece_priority: &priority,
            piece_availability: &availability,
            started_pieces: &started,
            max_pieces: 2,
        });
        assert_eq!(result.pieces.len(), 2);
    }
}
