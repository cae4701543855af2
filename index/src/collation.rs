//! Key collation.
//!
//! Every index stores a collation rule code in its root. The code is resolved
//! once, when the index is opened, into a [`Collator`] that carries a plain
//! function pointer; comparisons never re-dispatch on the rule.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::index::IndexError;

/// Offset of the name length (in UTF-16 code units) inside a file-name key.
const FILE_NAME_LENGTH_OFFSET: usize = 0x40;

/// Offset of the UTF-16 name inside a file-name key.
const FILE_NAME_OFFSET: usize = 0x42;

/// Number of entries in an upper-case table (one per UTF-16 code unit).
const UPCASE_ENTRIES: usize = 0x1_0000;

/// The collation rules understood by the engine, with their on-disk codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CollationRule {
    /// Case-insensitive comparison of the name inside a file-name record.
    Filename = 0x01,
    /// A single little-endian u32.
    UnsignedLong = 0x10,
    /// Raw security identifier bytes.
    Sid = 0x11,
    /// A u32 hash followed by a u32 security id.
    SecurityHash = 0x12,
    /// A sequence of little-endian u32 values.
    MultipleUnsignedLongs = 0x13,
}

impl CollationRule {
    /// The code stored in an index root.
    #[must_use]
    pub const fn code(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for CollationRule {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Filename),
            0x10 => Ok(Self::UnsignedLong),
            0x11 => Ok(Self::Sid),
            0x12 => Ok(Self::SecurityHash),
            0x13 => Ok(Self::MultipleUnsignedLongs),
            _ => Err(value),
        }
    }
}

type CompareFn = fn(&[u8], &[u8], &UpCaseTable) -> Ordering;

/// A three-way comparator over index keys.
#[derive(Clone)]
pub struct Collator {
    rule: CollationRule,
    compare_fn: CompareFn,
    upcase: Arc<UpCaseTable>,
}

impl Collator {
    /// Resolve a rule into a comparator.
    ///
    /// Only file-name collation consults `upcase`; when none is supplied the
    /// invariant table is used.
    #[must_use]
    pub fn new(rule: CollationRule, upcase: Option<Arc<UpCaseTable>>) -> Self {
        let compare_fn: CompareFn = match rule {
            CollationRule::Filename => compare_file_names,
            CollationRule::UnsignedLong => compare_unsigned_long,
            CollationRule::Sid => compare_sids,
            CollationRule::SecurityHash => compare_security_hashes,
            CollationRule::MultipleUnsignedLongs => compare_unsigned_longs,
        };
        let upcase = upcase.unwrap_or_else(|| Arc::new(UpCaseTable::invariant()));

        Self {
            rule,
            compare_fn,
            upcase,
        }
    }

    /// Resolve a stored rule code, rejecting codes the engine does not support.
    pub fn from_code(code: u32, upcase: Option<Arc<UpCaseTable>>) -> Result<Self, IndexError> {
        let rule = CollationRule::try_from(code).map_err(IndexError::UnknownCollation)?;
        Ok(Self::new(rule, upcase))
    }

    /// The rule this collator implements.
    #[must_use]
    pub const fn rule(&self) -> CollationRule {
        self.rule
    }

    /// Compare two possibly absent keys. An absent key sorts first.
    #[must_use]
    pub fn compare(&self, x: Option<&[u8]>, y: Option<&[u8]>) -> Ordering {
        match (x, y) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(x), Some(y)) => self.compare_keys(x, y),
        }
    }

    /// Compare two keys.
    #[must_use]
    pub fn compare_keys(&self, x: &[u8], y: &[u8]) -> Ordering {
        (self.compare_fn)(x, y, &self.upcase)
    }
}

impl std::fmt::Debug for Collator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collator")
            .field("rule", &self.rule)
            .finish_non_exhaustive()
    }
}

/// Little-endian u32 at `offset`; bytes past the end of a short key read as zero.
fn read_u32(key: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    if offset < key.len() {
        let available = (key.len() - offset).min(4);
        bytes[..available].copy_from_slice(&key[offset..offset + available]);
    }
    u32::from_le_bytes(bytes)
}

fn compare_unsigned_long(x: &[u8], y: &[u8], _: &UpCaseTable) -> Ordering {
    read_u32(x, 0).cmp(&read_u32(y, 0))
}

fn compare_unsigned_longs(x: &[u8], y: &[u8], _: &UpCaseTable) -> Ordering {
    let words = x.len().min(y.len()) / 4;
    for i in 0..words {
        let ord = read_u32(x, i * 4).cmp(&read_u32(y, i * 4));
        if ord != Ordering::Equal {
            return ord;
        }
    }
    x.len().cmp(&y.len())
}

fn compare_security_hashes(x: &[u8], y: &[u8], _: &UpCaseTable) -> Ordering {
    read_u32(x, 0)
        .cmp(&read_u32(y, 0))
        .then_with(|| read_u32(x, 4).cmp(&read_u32(y, 4)))
}

fn compare_sids(x: &[u8], y: &[u8], _: &UpCaseTable) -> Ordering {
    x.cmp(y)
}

fn compare_file_names(x: &[u8], y: &[u8], upcase: &UpCaseTable) -> Ordering {
    upcase.compare_utf16(file_name_bytes(x), file_name_bytes(y))
}

/// The UTF-16 name bytes embedded in a file-name key, clamped to the key.
fn file_name_bytes(key: &[u8]) -> &[u8] {
    let Some(&chars) = key.get(FILE_NAME_LENGTH_OFFSET) else {
        return &[];
    };
    let start = FILE_NAME_OFFSET.min(key.len());
    let end = (FILE_NAME_OFFSET + usize::from(chars) * 2).min(key.len());
    &key[start..end]
}

/// Upper-case mapping for every UTF-16 code unit, as stored in `$UpCase`.
pub struct UpCaseTable {
    table: Box<[u16]>,
}

impl UpCaseTable {
    /// Size in bytes of a serialized table.
    pub const SERIALIZED_SIZE: usize = UPCASE_ENTRIES * 2;

    /// Parse the on-disk table: one little-endian u16 per code unit.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IndexError> {
        if bytes.len() != Self::SERIALIZED_SIZE {
            return Err(IndexError::Malformed(format!(
                "upper-case table is {} bytes, expected {}",
                bytes.len(),
                Self::SERIALIZED_SIZE
            )));
        }

        let table = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Ok(Self { table })
    }

    /// Build a table from the Unicode simple upper-case mappings.
    ///
    /// Code units whose upper case is not a single BMP character map to themselves.
    #[must_use]
    pub fn invariant() -> Self {
        let table = (0..=u16::MAX)
            .map(|unit| {
                let Some(c) = char::from_u32(u32::from(unit)) else {
                    return unit;
                };
                let mut upper = c.to_uppercase();
                match (upper.next(), upper.next()) {
                    (Some(u), None) => u16::try_from(u32::from(u)).unwrap_or(unit),
                    _ => unit,
                }
            })
            .collect();
        Self { table }
    }

    /// Serialize the table in its on-disk form.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.table.iter().flat_map(|unit| unit.to_le_bytes()).collect()
    }

    /// Upper-case a single code unit.
    #[must_use]
    pub fn upcase(&self, unit: u16) -> u16 {
        self.table[usize::from(unit)]
    }

    /// Compare two UTF-16LE strings ignoring case. A proper prefix sorts first.
    #[must_use]
    pub fn compare_utf16(&self, x: &[u8], y: &[u8]) -> Ordering {
        let mut xs = utf16_units(x);
        let mut ys = utf16_units(y);

        loop {
            match (xs.next(), ys.next()) {
                (Some(a), Some(b)) => {
                    let ord = self.upcase(a).cmp(&self.upcase(b));
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                (None, None) => return Ordering::Equal,
                (None, Some(_)) => return Ordering::Less,
                (Some(_), None) => return Ordering::Greater,
            }
        }
    }
}

fn utf16_units(bytes: &[u8]) -> impl Iterator<Item = u16> + '_ {
    bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
}

impl std::fmt::Debug for UpCaseTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpCaseTable")
            .field("entries", &self.table.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys;

    fn collator(rule: CollationRule) -> Collator {
        Collator::new(rule, None)
    }

    #[test]
    fn test_rule_codes() {
        assert_eq!(CollationRule::try_from(0x10), Ok(CollationRule::UnsignedLong));
        assert_eq!(CollationRule::try_from(0x01), Ok(CollationRule::Filename));
        assert_eq!(CollationRule::SecurityHash.code(), 0x12);
        assert_eq!(CollationRule::try_from(0x00), Err(0x00));
        assert_eq!(CollationRule::try_from(0x02), Err(0x02));
    }

    #[test]
    fn test_unknown_code_rejected() {
        let err = Collator::from_code(0x99, None).unwrap_err();
        assert!(matches!(err, IndexError::UnknownCollation(0x99)));
    }

    #[test]
    fn test_absent_key_sorts_first() {
        let c = collator(CollationRule::Sid);
        assert_eq!(c.compare(None, Some(&[0])), Ordering::Less);
        assert_eq!(c.compare(Some(&[0]), None), Ordering::Greater);
        assert_eq!(c.compare(None, None), Ordering::Equal);
    }

    #[test]
    fn test_unsigned_long_is_little_endian() {
        let c = collator(CollationRule::UnsignedLong);
        // 0x0100 > 0x00FF even though the first byte is smaller
        assert_eq!(
            c.compare_keys(&[0x00, 0x01, 0, 0], &[0xFF, 0x00, 0, 0]),
            Ordering::Greater
        );
        // Only the first four bytes take part
        assert_eq!(
            c.compare_keys(&[5, 0, 0, 0, 1], &[5, 0, 0, 0, 2]),
            Ordering::Equal
        );
    }

    #[test]
    fn test_multiple_unsigned_longs_first_difference_wins() {
        let c = collator(CollationRule::MultipleUnsignedLongs);
        let a = [1u32, 2, 3].iter().flat_map(|v| v.to_le_bytes()).collect::<Vec<_>>();
        let b = [1u32, 3, 0].iter().flat_map(|v| v.to_le_bytes()).collect::<Vec<_>>();
        assert_eq!(c.compare_keys(&a, &b), Ordering::Less);
        assert_eq!(c.compare_keys(&b, &a), Ordering::Greater);
        assert_eq!(c.compare_keys(&a, &a), Ordering::Equal);
    }

    #[test]
    fn test_security_hash_tie_breaks_on_id() {
        let c = collator(CollationRule::SecurityHash);
        let low = keys::security_hash_key(0xAAAA, 1);
        let high = keys::security_hash_key(0xAAAA, 2);
        let other = keys::security_hash_key(0x1000, 9);
        assert_eq!(c.compare_keys(&low, &high), Ordering::Less);
        assert_eq!(c.compare_keys(&other, &low), Ordering::Less);
    }

    #[test]
    fn test_sid_shorter_prefix_first() {
        let c = collator(CollationRule::Sid);
        assert_eq!(c.compare_keys(&[1, 2], &[1, 2, 0]), Ordering::Less);
        assert_eq!(c.compare_keys(&[1, 3], &[1, 2, 9]), Ordering::Greater);
    }

    #[test]
    fn test_file_names_ignore_case() {
        let c = collator(CollationRule::Filename);
        let lower = keys::file_name_key(5, "foo.txt");
        let upper = keys::file_name_key(5, "FOO.TXT");
        let longer = keys::file_name_key(5, "foo.txt2");
        assert_eq!(c.compare_keys(&lower, &upper), Ordering::Equal);
        assert_eq!(c.compare_keys(&lower, &longer), Ordering::Less);
        assert_eq!(
            c.compare_keys(&keys::file_name_key(5, "a"), &keys::file_name_key(5, "B")),
            Ordering::Less
        );
    }

    #[test]
    fn test_upcase_table_roundtrip() {
        let table = UpCaseTable::invariant();
        assert_eq!(table.upcase(u16::from(b'a')), u16::from(b'A'));
        assert_eq!(table.upcase(0x00E9), 0x00C9); // é -> É
        assert_eq!(table.upcase(0xD800), 0xD800); // surrogates map to themselves

        let bytes = table.to_bytes();
        assert_eq!(bytes.len(), UpCaseTable::SERIALIZED_SIZE);
        let parsed = UpCaseTable::from_bytes(&bytes).expect("parse");
        assert_eq!(parsed.upcase(u16::from(b'z')), u16::from(b'Z'));
    }

    #[test]
    fn test_upcase_table_wrong_size() {
        let err = UpCaseTable::from_bytes(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, IndexError::Malformed(_)));
    }

    #[test]
    fn test_custom_upcase_table_is_used() {
        // A table that folds nothing makes file names case-sensitive
        let identity: Vec<u8> = (0..=u16::MAX).flat_map(u16::to_le_bytes).collect();
        let table = Arc::new(UpCaseTable::from_bytes(&identity).expect("parse"));
        let c = Collator::new(CollationRule::Filename, Some(table));
        assert_ne!(
            c.compare_keys(&keys::file_name_key(5, "a"), &keys::file_name_key(5, "A")),
            Ordering::Equal
        );
    }
}
