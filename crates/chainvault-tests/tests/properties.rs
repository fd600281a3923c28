//! Property tests for head tracking under arbitrary arrival order.
//!
//! A random block tree is ingested in a random permutation. After every
//! block the head must be the highest MAIN block and MAIN must form one
//! linked chain from genesis.

use chainvault_core::types::{Block, Chain, Hash256};
use chainvault_tests::helpers::*;
use proptest::prelude::*;
use proptest::sample::Index;

/// Build a tree: block 0 is genesis, block `i` extends one of `0..i`.
fn build_tree(parents: &[Index]) -> Vec<Block> {
    let mut blocks: Vec<Block> = vec![make_block(Hash256::ZERO, 0, vec![])];
    for (i, parent) in parents.iter().enumerate() {
        let prev = blocks[parent.index(i + 1)].hash();
        let coinbase = make_coinbase(50, pkh(i as u8), i as u64 + 1);
        blocks.push(make_block(prev, i as u32 + 1, vec![coinbase]));
    }
    blocks
}

fn tree_and_order() -> impl Strategy<Value = (Vec<Block>, Vec<usize>)> {
    prop::collection::vec(any::<Index>(), 0..14).prop_flat_map(|parents| {
        let blocks = build_tree(&parents);
        let order: Vec<usize> = (0..blocks.len()).collect();
        (Just(blocks), Just(order).prop_shuffle())
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn head_is_highest_main_block((blocks, order) in tree_and_order()) {
        let store = memory_store();
        let mut seen = Vec::new();

        for &i in &order {
            store.store_block(&blocks[i]).unwrap();
            seen.push(blocks[i].hash());

            let mut best: Option<(i64, Hash256)> = None;
            for hash in &seen {
                let stored = store.get_block_by_hash(hash).unwrap().unwrap();
                if stored.chain == Chain::Main && best.is_none_or(|(d, _)| stored.depth > d) {
                    best = Some((stored.depth, stored.hash));
                }
            }

            let depth = store.get_depth().unwrap();
            let head = store.get_head().unwrap().map(|b| b.hash);
            prop_assert_eq!(depth, best.map_or(-1, |(d, _)| d));
            prop_assert_eq!(head, best.map(|(_, h)| h));

            let mut prev = Hash256::ZERO;
            for d in 0..=depth {
                let main = store.get_block_by_depth(d).unwrap();
                prop_assert!(main.is_some(), "gap at depth {}", d);
                let main = main.unwrap();
                prop_assert_eq!(main.block.header.prev_hash, prev);
                prev = main.hash;
            }
        }

        // Every parent eventually arrived.
        for block in &blocks {
            let stored = store.get_block_by_hash(&block.hash()).unwrap().unwrap();
            prop_assert_ne!(stored.chain, Chain::Orphan);
        }
    }

    #[test]
    fn transactions_resolve_to_a_block((blocks, order) in tree_and_order()) {
        let store = memory_store();
        for &i in &order {
            store.store_block(&blocks[i]).unwrap();
        }
        for block in blocks.iter().skip(1) {
            let txid = block.transactions[0].txid();
            let stored = store.get_tx(&txid).unwrap().unwrap();
            prop_assert!(stored.block_id.is_some());
            let owner = store.get_block_by_transaction_hash(&txid).unwrap().unwrap();
            prop_assert_eq!(owner.hash, block.hash());
        }
    }
}
