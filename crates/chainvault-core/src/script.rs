//! Locking-script classification.
//!
//! Maps an output's locking script to a [`ScriptType`] and the hash160
//! addresses it pays. Only standard templates are recognised; anything else
//! (including truncated or malformed scripts) is [`ScriptType::Unknown`] with
//! no addresses. No script execution happens here.

use serde::{Deserialize, Serialize};

use crate::types::{hash160, Hash160};

const OP_PUSHDATA1: u8 = 0x4c;
const OP_PUSHDATA2: u8 = 0x4d;
const OP_1: u8 = 0x51;
const OP_16: u8 = 0x60;
const OP_DUP: u8 = 0x76;
const OP_EQUAL: u8 = 0x87;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_HASH160: u8 = 0xa9;
const OP_CHECKSIG: u8 = 0xac;
const OP_CHECKMULTISIG: u8 = 0xae;

/// Standard locking-script templates.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash,
    bincode::Encode, bincode::Decode,
)]
pub enum ScriptType {
    Unknown,
    /// `<pubkey> OP_CHECKSIG`
    PubKey,
    /// `OP_DUP OP_HASH160 <20 bytes> OP_EQUALVERIFY OP_CHECKSIG`
    Hash160,
    /// `OP_m <pubkey>... OP_n OP_CHECKMULTISIG`
    Multisig,
    /// `OP_HASH160 <20 bytes> OP_EQUAL`
    P2sh,
}

/// Result of classifying a locking script.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScriptClass {
    pub script_type: ScriptType,
    /// Addresses paid by the script, in script order.
    pub addresses: Vec<Hash160>,
}

impl ScriptClass {
    fn unknown() -> Self {
        Self {
            script_type: ScriptType::Unknown,
            addresses: Vec::new(),
        }
    }
}

/// Classify a locking script.
pub fn classify(script: &[u8]) -> ScriptClass {
    if let Some(hash) = p2pkh_hash(script) {
        return ScriptClass {
            script_type: ScriptType::Hash160,
            addresses: vec![hash],
        };
    }
    if let Some(pubkey) = p2pk_pubkey(script) {
        return ScriptClass {
            script_type: ScriptType::PubKey,
            addresses: vec![hash160(pubkey)],
        };
    }
    if let Some(pubkeys) = multisig_pubkeys(script) {
        return ScriptClass {
            script_type: ScriptType::Multisig,
            addresses: pubkeys.into_iter().map(hash160).collect(),
        };
    }
    if is_p2sh(script) {
        return ScriptClass {
            script_type: ScriptType::P2sh,
            addresses: Vec::new(),
        };
    }
    ScriptClass::unknown()
}

fn p2pkh_hash(script: &[u8]) -> Option<Hash160> {
    if script.len() != 25 {
        return None;
    }
    if script[0] != OP_DUP
        || script[1] != OP_HASH160
        || script[2] != 0x14
        || script[23] != OP_EQUALVERIFY
        || script[24] != OP_CHECKSIG
    {
        return None;
    }
    let mut out = [0u8; 20];
    out.copy_from_slice(&script[3..23]);
    Some(Hash160(out))
}

fn p2pk_pubkey(script: &[u8]) -> Option<&[u8]> {
    let (&push, rest) = script.split_first()?;
    let (&last, key) = rest.split_last()?;
    if last != OP_CHECKSIG || !is_pubkey_len(push as usize) || key.len() != push as usize {
        return None;
    }
    Some(key)
}

fn is_p2sh(script: &[u8]) -> bool {
    script.len() == 23 && script[0] == OP_HASH160 && script[1] == 0x14 && script[22] == OP_EQUAL
}

fn is_pubkey_len(len: usize) -> bool {
    len == 33 || len == 65
}

/// Parse `OP_m <pubkey>... OP_n OP_CHECKMULTISIG`, returning the pubkeys.
fn multisig_pubkeys(script: &[u8]) -> Option<Vec<&[u8]>> {
    let (&first, _) = script.split_first()?;
    if !(OP_1..=OP_16).contains(&first) {
        return None;
    }
    let required = first - OP_1 + 1;

    let mut cursor = 1usize;
    let mut pubkeys = Vec::new();
    while cursor < script.len() {
        let op = script[cursor];
        if (OP_1..=OP_16).contains(&op) {
            break;
        }
        cursor += 1;
        let len = match op {
            1..=75 => op as usize,
            OP_PUSHDATA1 => {
                let len = *script.get(cursor)? as usize;
                cursor += 1;
                len
            }
            OP_PUSHDATA2 => {
                let bytes = script.get(cursor..cursor + 2)?;
                cursor += 2;
                u16::from_le_bytes([bytes[0], bytes[1]]) as usize
            }
            _ => return None,
        };
        let key = script.get(cursor..cursor + len)?;
        if !is_pubkey_len(key.len()) {
            return None;
        }
        pubkeys.push(key);
        cursor += len;
    }

    let total_op = *script.get(cursor)?;
    if !(OP_1..=OP_16).contains(&total_op) {
        return None;
    }
    let total = total_op - OP_1 + 1;
    cursor += 1;

    if script.get(cursor) != Some(&OP_CHECKMULTISIG) || cursor + 1 != script.len() {
        return None;
    }
    if total as usize != pubkeys.len() || required > total {
        return None;
    }
    Some(pubkeys)
}

/// Build a pay-to-hash160 locking script.
pub fn p2pkh_script(hash: &Hash160) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.extend_from_slice(&[OP_DUP, OP_HASH160, 0x14]);
    script.extend_from_slice(hash.as_bytes());
    script.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
    script
}
