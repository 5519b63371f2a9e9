//! Block placement for in-place updates
//!
//! Given the blocks of an updated document, decide which of them can stay
//! where they are, which must be (re)written and where. Blocks that stay put
//! are "fixed"; everything else is placed first-fit into the gaps between
//! fixed blocks or appended after the last one. Each block's allocation then
//! grows to absorb the gap up to the next block, so the block area remains a
//! contiguous run of blocks.
//!
//! When no block can stay fixed there is nothing to preserve and the caller
//! rewrites the whole file instead.

use crate::core::format::{calculate_padding, Padding, BLOCK_PREAMBLE};

/// Region occupied by a block in the existing file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub offset: u64,
    /// Magic, size field and header fields
    pub header_len: u64,
    pub allocated: u64,
}

impl Region {
    pub fn end(&self) -> u64 {
        self.offset
            .saturating_add(self.header_len)
            .saturating_add(self.allocated)
    }
}

/// What the update knows about one internal block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// On-disk bytes are current
    Clean { region: Region, used: u64 },
    /// Needs to be written; may reuse its previous region
    Dirty { used: u64, slot: Option<Region> },
}

/// Where a block ends up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Bytes stay in place; only the header changes if `allocated` differs
    Keep { offset: u64, allocated: u64 },
    /// Header and payload are written at `offset`
    Write { offset: u64, allocated: u64 },
}

impl Placement {
    pub fn offset(&self) -> u64 {
        match *self {
            Placement::Keep { offset, .. } | Placement::Write { offset, .. } => offset,
        }
    }

    pub fn allocated(&self) -> u64 {
        match *self {
            Placement::Keep { allocated, .. } | Placement::Write { allocated, .. } => allocated,
        }
    }

    fn set_allocated(&mut self, value: u64) {
        match self {
            Placement::Keep { allocated, .. } | Placement::Write { allocated, .. } => *allocated = value,
        }
    }

    /// Offset one past the allocated payload
    pub fn end(&self) -> u64 {
        self.offset()
            .saturating_add(BLOCK_PREAMBLE)
            .saturating_add(self.allocated())
    }
}

/// Place every block at or after `tree_end`
///
/// Returns placements in input order, or `None` when no block can stay
/// where it is or the existing regions can not be laid out (overlapping or
/// running past the end of the address space).
pub fn layout(
    tree_end: u64,
    blocks: &[BlockState],
    padding: Padding,
    io_block_size: usize,
) -> Option<Vec<Placement>> {
    let mut placements: Vec<Option<Placement>> = vec![None; blocks.len()];
    let mut fixed: Vec<(u64, u64)> = Vec::new();
    let mut free: Vec<(usize, u64)> = Vec::new();

    for (i, state) in blocks.iter().enumerate() {
        match *state {
            BlockState::Clean { region, used } => {
                if region.offset >= tree_end && region.header_len == BLOCK_PREAMBLE {
                    placements[i] = Some(Placement::Keep {
                        offset: region.offset,
                        allocated: region.allocated,
                    });
                    fixed.push((region.offset, region.end()));
                } else {
                    free.push((i, used));
                }
            }
            BlockState::Dirty { used, slot } => match slot {
                Some(region)
                    if region.offset >= tree_end
                        && region.header_len == BLOCK_PREAMBLE
                        && used <= region.allocated =>
                {
                    placements[i] = Some(Placement::Write {
                        offset: region.offset,
                        allocated: region.allocated,
                    });
                    fixed.push((region.offset, region.end()));
                }
                _ => free.push((i, used)),
            },
        }
    }

    if fixed.is_empty() {
        return None;
    }
    fixed.sort_unstable();
    if fixed.windows(2).any(|pair| pair[0].1 > pair[1].0) {
        return None;
    }

    let mut gaps: Vec<(u64, u64)> = Vec::new();
    let mut cursor = tree_end;
    for &(start, end) in &fixed {
        if start > cursor {
            gaps.push((cursor, start));
        }
        cursor = cursor.max(end);
    }
    let mut tail = cursor;

    for (i, used) in free {
        let need = BLOCK_PREAMBLE.checked_add(used)?;
        if let Some(gap) = gaps.iter_mut().find(|(start, end)| end - start >= need) {
            placements[i] = Some(Placement::Write {
                offset: gap.0,
                allocated: used,
            });
            gap.0 += need;
        } else {
            let allocated = used.checked_add(calculate_padding(used, padding, io_block_size))?;
            placements[i] = Some(Placement::Write {
                offset: tail,
                allocated,
            });
            tail = tail.checked_add(BLOCK_PREAMBLE)?.checked_add(allocated)?;
        }
    }

    let mut placements: Vec<Placement> = placements.into_iter().collect::<Option<Vec<_>>>()?;

    // absorb gaps so every block runs up to the next one
    let mut order: Vec<usize> = (0..placements.len()).collect();
    order.sort_by_key(|&i| placements[i].offset());
    for pair in order.windows(2) {
        let (this, next) = (pair[0], pair[1]);
        let allocated = placements[next]
            .offset()
            .checked_sub(placements[this].offset())?
            .checked_sub(BLOCK_PREAMBLE)?;
        placements[this].set_allocated(allocated);
    }
    Some(placements)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(offset: u64, allocated: u64) -> Region {
        Region {
            offset,
            header_len: BLOCK_PREAMBLE,
            allocated,
        }
    }

    #[test]
    fn test_unchanged_blocks_stay() {
        let blocks = [
            BlockState::Clean { region: region(100, 10), used: 10 },
            BlockState::Clean { region: region(164, 20), used: 20 },
        ];
        let placements = layout(100, &blocks, Padding::None, 4096).unwrap();
        assert_eq!(
            placements,
            vec![
                Placement::Keep { offset: 100, allocated: 10 },
                Placement::Keep { offset: 164, allocated: 20 },
            ]
        );
    }

    #[test]
    fn test_grown_block_moves_to_end() {
        let blocks = [
            BlockState::Dirty { used: 50, slot: Some(region(100, 10)) },
            BlockState::Clean { region: region(164, 20), used: 20 },
        ];
        let placements = layout(100, &blocks, Padding::None, 4096).unwrap();
        // block 1 stays and absorbs nothing (it is followed by the moved block)
        assert_eq!(placements[1], Placement::Keep { offset: 164, allocated: 20 });
        assert_eq!(placements[0], Placement::Write { offset: 238, allocated: 50 });
    }

    #[test]
    fn test_gap_before_first_fixed_block_is_reused() {
        let blocks = [
            BlockState::Dirty { used: 30, slot: None },
            BlockState::Clean { region: region(1000, 10), used: 10 },
        ];
        let placements = layout(100, &blocks, Padding::None, 4096).unwrap();
        // placed at the gap start, allocation stretched to the fixed block
        assert_eq!(
            placements[0],
            Placement::Write { offset: 100, allocated: 1000 - 100 - BLOCK_PREAMBLE }
        );
        assert_eq!(placements[1], Placement::Keep { offset: 1000, allocated: 10 });
    }

    #[test]
    fn test_tree_growth_pushes_out_first_block() {
        let blocks = [
            BlockState::Clean { region: region(100, 10), used: 10 },
            BlockState::Clean { region: region(164, 10), used: 10 },
        ];
        let placements = layout(120, &blocks, Padding::None, 4096).unwrap();
        assert_eq!(placements[1], Placement::Keep { offset: 164, allocated: 10 });
        assert_eq!(placements[0], Placement::Write { offset: 228, allocated: 10 });
    }

    #[test]
    fn test_shrunk_block_keeps_slot() {
        let blocks = [
            BlockState::Dirty { used: 4, slot: Some(region(100, 10)) },
            BlockState::Clean { region: region(164, 10), used: 10 },
        ];
        let placements = layout(100, &blocks, Padding::None, 4096).unwrap();
        assert_eq!(placements[0], Placement::Write { offset: 100, allocated: 10 });
    }

    #[test]
    fn test_nothing_fixed_means_rewrite() {
        let blocks = [
            BlockState::Dirty { used: 50, slot: Some(region(100, 10)) },
            BlockState::Dirty { used: 5, slot: None },
        ];
        assert_eq!(layout(100, &blocks, Padding::None, 4096), None);
        assert_eq!(layout(100, &[], Padding::None, 4096), None);
    }

    #[test]
    fn test_appended_blocks_are_padded() {
        let blocks = [
            BlockState::Clean { region: region(100, 10), used: 10 },
            BlockState::Dirty { used: 10, slot: None },
        ];
        let placements = layout(100, &blocks, Padding::Default, 64).unwrap();
        assert_eq!(placements[1], Placement::Write { offset: 164, allocated: 128 });
    }

    #[test]
    fn test_hostile_sizes_do_not_overflow() {
        let huge = region(100, u64::MAX);
        assert_eq!(huge.end(), u64::MAX);
        let kept = Placement::Keep { offset: 100, allocated: u64::MAX };
        assert_eq!(kept.end(), u64::MAX);

        let blocks = [
            BlockState::Clean { region: huge, used: 10 },
            BlockState::Dirty { used: 10, slot: None },
        ];
        assert_eq!(layout(100, &blocks, Padding::None, 4096), None);

        let blocks = [
            BlockState::Clean { region: region(100, 10), used: 10 },
            BlockState::Dirty { used: u64::MAX, slot: None },
        ];
        assert_eq!(layout(100, &blocks, Padding::None, 4096), None);
    }

    #[test]
    fn test_overlapping_regions_are_not_kept() {
        let blocks = [
            BlockState::Clean { region: region(100, 1000), used: 10 },
            BlockState::Clean { region: region(200, 10), used: 10 },
        ];
        assert_eq!(layout(100, &blocks, Padding::None, 4096), None);
    }
}
