//! Transaction merkle root.
//!
//! Internal nodes are `sha256d(left || right)`. Odd-length layers are padded
//! by duplicating the last element. Empty trees produce [`Hash256::ZERO`].

use crate::types::{sha256d, Hash256};

/// Compute the merkle root from a slice of transaction IDs.
pub fn merkle_root(leaves: &[Hash256]) -> Hash256 {
    if leaves.is_empty() {
        return Hash256::ZERO;
    }

    let mut current = leaves.to_vec();
    while current.len() > 1 {
        current = next_layer(&current);
    }
    current[0]
}

fn next_layer(layer: &[Hash256]) -> Vec<Hash256> {
    layer
        .chunks(2)
        .map(|pair| {
            let left = &pair[0];
            let right = pair.get(1).unwrap_or(left);
            let mut data = [0u8; 64];
            data[..32].copy_from_slice(left.as_bytes());
            data[32..].copy_from_slice(right.as_bytes());
            sha256d(&data)
        })
        .collect()
}
