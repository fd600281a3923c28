//! Chain selection.
//!
//! A [`ChainSelector`] decides where a block belongs (MAIN, SIDE or ORPHAN,
//! and at which depth) and which already-stored blocks must change chain as
//! a consequence. The chain store applies a [`Placement`] verbatim and never
//! classifies blocks itself.

use chainvault_core::error::LedgerError;
use chainvault_core::types::{BlockHeader, Chain, Hash256};

use crate::records::{RecordRead, Records};

/// Where a block goes, plus any re-tagging of stored blocks that must
/// commit atomically with it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Placement {
    pub chain: Chain,
    pub depth: i64,
    /// Stored blocks to move to another chain, applied in order. Depths
    /// are unchanged.
    pub reassign: Vec<(Hash256, Chain)>,
}

impl Placement {
    pub fn new(chain: Chain, depth: i64) -> Self {
        Self {
            chain,
            depth,
            reassign: Vec::new(),
        }
    }

    pub fn orphan() -> Self {
        Self::new(Chain::Orphan, -1)
    }
}

/// Chain-selection policy.
///
/// `reader` sees the store as it will be after everything staged so far in
/// the current atomic unit.
pub trait ChainSelector: Send + Sync {
    fn place(
        &self,
        reader: &dyn RecordRead,
        header: &BlockHeader,
    ) -> Result<Placement, LedgerError>;
}

/// Most-work-by-length selection: the longest chain from genesis is MAIN.
///
/// Ties keep the incumbent. A side branch that grows past the head is
/// promoted back to its fork point and the MAIN blocks above the fork are
/// demoted.
#[derive(Debug, Default, Clone, Copy)]
pub struct LongestChainSelector;

impl ChainSelector for LongestChainSelector {
    fn place(
        &self,
        reader: &dyn RecordRead,
        header: &BlockHeader,
    ) -> Result<Placement, LedgerError> {
        let hash = header.hash();

        if header.prev_hash.is_zero() {
            return Ok(match reader.main_block_at(0)? {
                Some(genesis) if genesis.hash != hash => Placement::new(Chain::Side, 0),
                _ => Placement::new(Chain::Main, 0),
            });
        }

        let Some(parent) = reader.block_by_hash(&header.prev_hash)? else {
            return Ok(Placement::orphan());
        };
        let depth = parent.depth + 1;

        match parent.chain {
            Chain::Orphan => Ok(Placement::orphan()),
            Chain::Main => Ok(match reader.main_block_at(depth)? {
                Some(incumbent) if incumbent.hash != hash => Placement::new(Chain::Side, depth),
                _ => Placement::new(Chain::Main, depth),
            }),
            Chain::Side => {
                let head_depth = reader.head_record()?.map_or(-1, |head| head.depth);
                if depth <= head_depth {
                    return Ok(Placement::new(Chain::Side, depth));
                }
                reorganize(reader, parent.hash, head_depth, depth)
            }
        }
    }
}

/// Promote the side branch ending at `tip` and demote MAIN above its fork.
fn reorganize(
    reader: &dyn RecordRead,
    tip: Hash256,
    head_depth: i64,
    depth: i64,
) -> Result<Placement, LedgerError> {
    let mut promote = Vec::new();
    let mut fork_depth = -1;
    let mut cursor = reader.block_by_hash(&tip)?;

    while let Some(block) = cursor {
        if block.chain == Chain::Main {
            fork_depth = block.depth;
            break;
        }
        promote.push(block.hash);
        if block.prev_hash.is_zero() {
            break;
        }
        cursor = reader.block_by_hash(&block.prev_hash)?;
    }

    let mut reassign = Vec::new();
    for d in fork_depth + 1..=head_depth {
        if let Some(stale) = reader.main_block_at(d)? {
            reassign.push((stale.hash, Chain::Side));
        }
    }
    reassign.extend(promote.into_iter().rev().map(|hash| (hash, Chain::Main)));

    Ok(Placement {
        chain: Chain::Main,
        depth,
        reassign,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::records::BlockRecord;
    use crate::unit::WriteUnit;

    fn header(prev_hash: Hash256, nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_hash,
            merkle_root: Hash256::ZERO,
            timestamp: 1_700_000_000,
            bits: 0x1d00_ffff,
            nonce,
        }
    }

    /// Store a header with the given placement and return its hash.
    fn put(unit: &mut WriteUnit<'_>, header: &BlockHeader, chain: Chain, depth: i64) -> Hash256 {
        let id = unit.next_id(crate::records::CF_BLOCKS).unwrap();
        let hash = header.hash();
        let mut record = BlockRecord {
            id,
            hash,
            depth,
            chain,
            version: 0,
            prev_hash: Hash256::ZERO,
            merkle_root: Hash256::ZERO,
            timestamp: 0,
            bits: 0,
            nonce: 0,
            size: 81,
        };
        record.set_header(header);
        unit.put_block(&record).unwrap();
        hash
    }

    // ------------------------------------------------------------------
    // Simple placement
    // ------------------------------------------------------------------

    #[test]
    fn genesis_is_main_at_zero() {
        let backend = MemoryBackend::new();
        let unit = WriteUnit::new(&backend);
        let placement = LongestChainSelector.place(&unit, &header(Hash256::ZERO, 0)).unwrap();
        assert_eq!(placement, Placement::new(Chain::Main, 0));
    }

    #[test]
    fn second_genesis_is_side() {
        let backend = MemoryBackend::new();
        let mut unit = WriteUnit::new(&backend);
        put(&mut unit, &header(Hash256::ZERO, 0), Chain::Main, 0);
        let placement = LongestChainSelector.place(&unit, &header(Hash256::ZERO, 1)).unwrap();
        assert_eq!(placement, Placement::new(Chain::Side, 0));
    }

    #[test]
    fn unknown_parent_is_orphan() {
        let backend = MemoryBackend::new();
        let unit = WriteUnit::new(&backend);
        let placement = LongestChainSelector.place(&unit, &header(Hash256([9; 32]), 0)).unwrap();
        assert_eq!(placement, Placement::orphan());
    }

    #[test]
    fn child_of_orphan_is_orphan() {
        let backend = MemoryBackend::new();
        let mut unit = WriteUnit::new(&backend);
        let orphan = put(&mut unit, &header(Hash256([9; 32]), 0), Chain::Orphan, -1);
        let placement = LongestChainSelector.place(&unit, &header(orphan, 1)).unwrap();
        assert_eq!(placement, Placement::orphan());
    }

    #[test]
    fn extending_head_is_main() {
        let backend = MemoryBackend::new();
        let mut unit = WriteUnit::new(&backend);
        let g = put(&mut unit, &header(Hash256::ZERO, 0), Chain::Main, 0);
        let placement = LongestChainSelector.place(&unit, &header(g, 1)).unwrap();
        assert_eq!(placement, Placement::new(Chain::Main, 1));
    }

    #[test]
    fn competing_block_at_occupied_depth_is_side() {
        let backend = MemoryBackend::new();
        let mut unit = WriteUnit::new(&backend);
        let g = put(&mut unit, &header(Hash256::ZERO, 0), Chain::Main, 0);
        put(&mut unit, &header(g, 1), Chain::Main, 1);
        let placement = LongestChainSelector.place(&unit, &header(g, 2)).unwrap();
        assert_eq!(placement, Placement::new(Chain::Side, 1));
    }

    #[test]
    fn replaying_main_block_keeps_it_main() {
        let backend = MemoryBackend::new();
        let mut unit = WriteUnit::new(&backend);
        let g = put(&mut unit, &header(Hash256::ZERO, 0), Chain::Main, 0);
        let b1 = header(g, 1);
        put(&mut unit, &b1, Chain::Main, 1);
        let placement = LongestChainSelector.place(&unit, &b1).unwrap();
        assert_eq!(placement, Placement::new(Chain::Main, 1));
    }

    // ------------------------------------------------------------------
    // Reorganization
    // ------------------------------------------------------------------

    #[test]
    fn side_branch_at_head_depth_stays_side() {
        let backend = MemoryBackend::new();
        let mut unit = WriteUnit::new(&backend);
        let g = put(&mut unit, &header(Hash256::ZERO, 0), Chain::Main, 0);
        let a1 = put(&mut unit, &header(g, 1), Chain::Main, 1);
        put(&mut unit, &header(a1, 2), Chain::Main, 2);
        let b1 = put(&mut unit, &header(g, 11), Chain::Side, 1);

        let placement = LongestChainSelector.place(&unit, &header(b1, 12)).unwrap();
        assert_eq!(placement, Placement::new(Chain::Side, 2));
    }

    #[test]
    fn longer_side_branch_takes_over() {
        let backend = MemoryBackend::new();
        let mut unit = WriteUnit::new(&backend);
        let g = put(&mut unit, &header(Hash256::ZERO, 0), Chain::Main, 0);
        let a1 = put(&mut unit, &header(g, 1), Chain::Main, 1);
        let b1 = put(&mut unit, &header(g, 11), Chain::Side, 1);
        let b2 = put(&mut unit, &header(b1, 12), Chain::Side, 2);

        // a1 is head at depth 1; b2 already sits at depth 2 on SIDE, b3 makes it 3.
        let placement = LongestChainSelector.place(&unit, &header(b2, 13)).unwrap();
        assert_eq!(placement.chain, Chain::Main);
        assert_eq!(placement.depth, 3);
        assert_eq!(
            placement.reassign,
            vec![(a1, Chain::Side), (b1, Chain::Main), (b2, Chain::Main)]
        );
    }

    #[test]
    fn side_block_one_past_head_triggers_reorg() {
        let backend = MemoryBackend::new();
        let mut unit = WriteUnit::new(&backend);
        let g = put(&mut unit, &header(Hash256::ZERO, 0), Chain::Main, 0);
        let a1 = put(&mut unit, &header(g, 1), Chain::Main, 1);
        let b1 = put(&mut unit, &header(g, 11), Chain::Side, 1);

        let placement = LongestChainSelector.place(&unit, &header(b1, 12)).unwrap();
        assert_eq!(placement.chain, Chain::Main);
        assert_eq!(placement.depth, 2);
        assert_eq!(placement.reassign, vec![(a1, Chain::Side), (b1, Chain::Main)]);
    }
}
