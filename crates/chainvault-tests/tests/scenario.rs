//! End-to-end ingestion scenarios against the in-memory store.
//!
//! Covers the canonical B0/B1/B2 walk-through, idempotent re-ingestion,
//! orphan promotion and a reorganization driven by the default selector.

use chainvault_core::script::ScriptType;
use chainvault_core::types::{Chain, Hash256, OutPoint};
use chainvault_tests::helpers::*;

// ==========================================================================
// Scenario 1: head, address index and orphan promotion
// ==========================================================================

#[test]
fn scenario_head_address_and_orphan_promotion() {
    init_tracing();
    let store = memory_store();
    let x = pkh(0x42);

    let b0 = make_block(Hash256::ZERO, 0, vec![]);
    assert_eq!(store.persist_block(&b0, Chain::Main, 0).unwrap(), (0, Chain::Main));
    assert_eq!(store.get_depth().unwrap(), 0);

    let coinbase = make_coinbase(5_000_000_000, x, 1);
    let b1 = make_block(b0.hash(), 1, vec![coinbase.clone()]);
    assert_eq!(store.persist_block(&b1, Chain::Main, 1).unwrap(), (1, Chain::Main));
    assert_eq!(store.get_depth().unwrap(), 1);

    let outs = store.get_txouts_for_hash160(&x, false).unwrap();
    assert_eq!(outs.len(), 1);
    assert_eq!(outs[0].output.value, 5_000_000_000);
    assert_eq!(outs[0].script_type, ScriptType::Hash160);
    assert_eq!(outs[0].addresses, vec![x]);

    // B2's parent has not arrived yet.
    let parent = make_block(b1.hash(), 2, vec![]);
    let b2 = make_block(parent.hash(), 3, vec![]);
    assert_eq!(store.store_block(&b2).unwrap(), (-1, Chain::Orphan));
    assert!(store.has_block(&b2.hash()).unwrap());
    assert!(store.get_block_by_depth(2).unwrap().is_none());

    assert_eq!(store.store_block(&parent).unwrap(), (2, Chain::Main));
    let promoted = store.get_block_by_prev_hash(&parent.hash()).unwrap().unwrap();
    assert_eq!(promoted.hash, b2.hash());
    assert_eq!(promoted.chain, Chain::Main);
    assert_eq!(promoted.depth, 3);
    assert_eq!(store.get_depth().unwrap(), 3);
    assert_eq!(store.get_head().unwrap().unwrap().hash, b2.hash());
}

// ==========================================================================
// Scenario 2: idempotent re-ingestion
// ==========================================================================

#[test]
fn reingesting_block_does_not_duplicate_children() {
    let store = memory_store();
    let a = pkh(1);
    let b0 = make_block(Hash256::ZERO, 0, vec![make_coinbase(50, a, 0)]);
    store.store_block(&b0).unwrap();

    let first = store.get_block_by_hash(&b0.hash()).unwrap().unwrap();
    assert_eq!(store.store_block(&b0).unwrap(), (0, Chain::Main));
    assert_eq!(store.persist_block(&b0, Chain::Main, 0).unwrap(), (0, Chain::Main));

    let again = store.get_block_by_hash(&b0.hash()).unwrap().unwrap();
    assert_eq!(again.id, first.id);
    assert_eq!(again.block.transactions.len(), 1);
    assert_eq!(store.get_txouts_for_hash160(&a, true).unwrap().len(), 1);
}

#[test]
fn storing_same_transaction_twice_returns_same_id() {
    let store = memory_store();
    let tx = make_tx(
        vec![OutPoint {
            txid: Hash256([7; 32]),
            index: 0,
        }],
        vec![(10, pkh(2)), (20, pkh(3))],
    );

    let first = store.store_transaction(&tx, false).unwrap();
    let second = store.store_transaction(&tx, false).unwrap();
    assert_eq!(first, second);

    let stored = store.get_tx(&tx.txid()).unwrap().unwrap();
    assert_eq!(stored.tx, tx);
    assert_eq!(stored.block_id, None);
    assert_eq!(store.get_txouts_for_hash160(&pkh(2), true).unwrap().len(), 1);
}

#[test]
fn validation_without_validator_writes_nothing() {
    let store = memory_store();
    let tx = make_coinbase(50, pkh(4), 9);
    assert!(store.store_transaction(&tx, true).is_err());
    assert!(!store.has_transaction(&tx.txid()).unwrap());
}

// ==========================================================================
// Scenario 3: reorganization
// ==========================================================================

#[test]
fn longer_side_branch_takes_over() {
    let store = memory_store();
    let g = make_block(Hash256::ZERO, 0, vec![]);
    let a1 = make_block(g.hash(), 1, vec![]);
    let a2 = make_block(a1.hash(), 2, vec![]);
    let b1 = make_block(g.hash(), 11, vec![]);
    let b2 = make_block(b1.hash(), 12, vec![]);
    let b3 = make_block(b2.hash(), 13, vec![]);

    for block in [&g, &a1, &a2] {
        store.store_block(block).unwrap();
    }
    assert_eq!(store.store_block(&b1).unwrap(), (1, Chain::Side));
    assert_eq!(store.store_block(&b2).unwrap(), (2, Chain::Side));
    assert_eq!(store.get_head().unwrap().unwrap().hash, a2.hash());

    assert_eq!(store.store_block(&b3).unwrap(), (3, Chain::Main));
    assert_eq!(store.get_depth().unwrap(), 3);
    for (depth, block) in [(1, &b1), (2, &b2), (3, &b3)] {
        let main = store.get_block_by_depth(depth).unwrap().unwrap();
        assert_eq!(main.hash, block.hash(), "depth {depth}");
    }
    for block in [&a1, &a2] {
        let demoted = store.get_block_by_hash(&block.hash()).unwrap().unwrap();
        assert_eq!(demoted.chain, Chain::Side);
    }
}

#[test]
fn output_confirmation_follows_reorg() {
    let store = memory_store();
    let a = pkh(0xa0);
    let g = make_block(Hash256::ZERO, 0, vec![]);
    let main1 = make_block(g.hash(), 1, vec![]);
    let side1 = make_block(g.hash(), 2, vec![make_coinbase(50, a, 1)]);
    let side2 = make_block(side1.hash(), 3, vec![]);

    store.store_block(&g).unwrap();
    store.store_block(&main1).unwrap();
    store.store_block(&side1).unwrap();
    assert!(store.get_txouts_for_hash160(&a, false).unwrap().is_empty());
    assert_eq!(store.get_txouts_for_hash160(&a, true).unwrap().len(), 1);

    store.store_block(&side2).unwrap();
    assert_eq!(store.get_txouts_for_hash160(&a, false).unwrap().len(), 1);
}

#[test]
fn orphan_subtree_attaches_in_one_call() {
    let store = memory_store();
    let chain = make_chain(6);
    for block in chain.iter().skip(1).rev() {
        assert_eq!(store.store_block(block).unwrap().1, Chain::Orphan);
    }
    assert_eq!(store.get_depth().unwrap(), -1);

    store.store_block(&chain[0]).unwrap();
    assert_eq!(store.get_depth().unwrap(), 5);
    for (depth, block) in chain.iter().enumerate() {
        let stored = store.get_block_by_depth(depth as i64).unwrap().unwrap();
        assert_eq!(stored.hash, block.hash());
    }
    let tip = chain[5].transactions[0].txid();
    assert_eq!(
        store.get_block_by_transaction_hash(&tip).unwrap().unwrap().hash,
        chain[5].hash()
    );
}
