//! Resolution of a key's version chain into its current value.

use std::sync::Arc;

use crate::error::{Error, Result};

use super::types::{Entry, Op};

/// Engine-level merge operator: `(key, existing, operands oldest-first)`.
pub type MergeFn = Arc<dyn Fn(&[u8], Option<&[u8]>, &[&[u8]]) -> Result<Vec<u8>> + Send + Sync>;

/// Collapse the entries of one key (newest first) into its current value.
///
/// Walks down from the newest entry collecting merge operands until a put,
/// a tombstone or the end of the chain, then applies the operands in write
/// order. Returns `None` when the key is deleted or absent.
pub fn resolve(key: &[u8], chain: &[Entry], merge: Option<&MergeFn>) -> Result<Option<Vec<u8>>> {
    let mut operands: Vec<&[u8]> = Vec::new();
    let mut base: Option<&[u8]> = None;

    for entry in chain {
        match &entry.op {
            Op::Merge(operand) => operands.push(operand.as_slice()),
            Op::Put(value) => {
                base = Some(value.as_slice());
                break;
            }
            Op::Delete => break,
        }
    }

    if operands.is_empty() {
        return Ok(base.map(<[u8]>::to_vec));
    }

    let merge = merge.ok_or_else(|| {
        Error::invalid("merge operand found but no merge operator is configured")
    })?;
    operands.reverse();
    merge(key, base, &operands).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lsm::types::Key;

    fn concat() -> MergeFn {
        Arc::new(|_key, existing, operands| {
            let mut out = existing.map(<[u8]>::to_vec).unwrap_or_default();
            for op in operands {
                out.extend_from_slice(op);
            }
            Ok(out)
        })
    }

    #[test]
    fn test_operands_apply_in_write_order() {
        let chain = vec![
            Entry::merge(Key::from("k"), 3, b"c".to_vec()),
            Entry::merge(Key::from("k"), 2, b"b".to_vec()),
            Entry::put(Key::from("k"), 1, b"a".to_vec()),
        ];
        let merge = concat();
        assert_eq!(resolve(b"k", &chain, Some(&merge)).unwrap(), Some(b"abc".to_vec()));
    }

    #[test]
    fn test_tombstone_stops_the_chain() {
        let chain = vec![
            Entry::merge(Key::from("k"), 3, b"x".to_vec()),
            Entry::delete(Key::from("k"), 2),
            Entry::put(Key::from("k"), 1, b"a".to_vec()),
        ];
        let merge = concat();
        assert_eq!(resolve(b"k", &chain, Some(&merge)).unwrap(), Some(b"x".to_vec()));
        assert_eq!(resolve(b"k", &chain[1..], Some(&merge)).unwrap(), None);
    }

    #[test]
    fn test_operand_without_operator_is_rejected() {
        let chain = vec![Entry::merge(Key::from("k"), 1, b"x".to_vec())];
        assert!(resolve(b"k", &chain, None).unwrap_err().is_invalid_argument());
    }
}
