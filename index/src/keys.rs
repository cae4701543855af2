//! Key and value layouts used by the catalog indexes.
//!
//! The engine treats keys as opaque bytes compared by a collator. These
//! builders produce the layouts each collation rule expects:
//!
//! | Index            | Rule                    | Key                        |
//! |------------------|-------------------------|----------------------------|
//! | `$I30`           | `Filename`              | file-name record           |
//! | `$Secure:$SII`   | `UnsignedLong`          | security id                |
//! | `$Secure:$SDH`   | `SecurityHash`          | hash, security id          |
//! | `$ObjId:$O`      | `MultipleUnsignedLongs` | 16-byte object id          |
//! | `$Reparse:$R`    | `MultipleUnsignedLongs` | reparse tag, file reference|
//! | `$Quota:$O`      | `Sid`                   | owner SID bytes            |
//! | `$Quota:$Q`      | `UnsignedLong`          | owner id                   |

/// Offset of the name length inside a file-name record.
const NAME_LENGTH_OFFSET: usize = 0x40;

/// Offset of the namespace byte inside a file-name record.
const NAMESPACE_OFFSET: usize = 0x41;

/// Offset of the UTF-16 name inside a file-name record.
const NAME_OFFSET: usize = 0x42;

/// Win32 file-name namespace.
const NAMESPACE_WIN32: u8 = 1;

/// Binary SID revision.
const SID_REVISION: u8 = 1;

const MAX_SUB_AUTHORITIES: usize = 15;

/// Mask selecting the record number out of a file reference.
const RECORD_NUMBER_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

/// A single little-endian u32, as used by `$SII` and `$Q`.
#[must_use]
pub fn u32_key(value: u32) -> Vec<u8> {
    value.to_le_bytes().to_vec()
}

/// A `$SDH` key: descriptor hash then security id.
#[must_use]
pub fn security_hash_key(hash: u32, security_id: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(8);
    key.extend_from_slice(&hash.to_le_bytes());
    key.extend_from_slice(&security_id.to_le_bytes());
    key
}

/// An `$ObjId` key: the 16-byte object id.
#[must_use]
pub fn object_id_key(object_id: [u8; 16]) -> Vec<u8> {
    object_id.to_vec()
}

/// A `$Reparse` key: reparse tag then the owning file's reference.
#[must_use]
pub fn reparse_key(tag: u32, file: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(12);
    key.extend_from_slice(&tag.to_le_bytes());
    key.extend_from_slice(&file.to_le_bytes());
    key
}

/// A `$Quota:$O` key: the owner's SID in binary form.
///
/// Revision 1, the 48-bit identifier authority big-endian, then each
/// sub-authority little-endian. A SID holds at most 15 sub-authorities; any
/// beyond that are dropped.
#[must_use]
pub fn quota_owner_key(authority: u64, sub_authorities: &[u32]) -> Vec<u8> {
    let subs = &sub_authorities[..sub_authorities.len().min(MAX_SUB_AUTHORITIES)];

    let mut key = Vec::with_capacity(8 + subs.len() * 4);
    key.push(SID_REVISION);
    key.push(u8::try_from(subs.len()).unwrap_or(u8::MAX));
    key.extend_from_slice(&authority.to_be_bytes()[2..]);
    for sub in subs {
        key.extend_from_slice(&sub.to_le_bytes());
    }
    key
}

/// An 8-byte file reference: 48-bit record number, 16-bit sequence number.
#[must_use]
pub fn file_reference(record: u64, sequence: u16) -> [u8; 8] {
    ((record & RECORD_NUMBER_MASK) | (u64::from(sequence) << 48)).to_le_bytes()
}

/// Split an 8-byte file reference into record and sequence numbers.
#[must_use]
pub fn split_file_reference(reference: &[u8]) -> Option<(u64, u16)> {
    let raw = u64::from_le_bytes(<[u8; 8]>::try_from(reference).ok()?);
    let sequence = u16::try_from(raw >> 48).unwrap_or(u16::MAX);
    Some((raw & RECORD_NUMBER_MASK, sequence))
}

/// A `$I30` key: a file-name record naming `name` inside directory `parent`.
///
/// Timestamps, sizes and attribute flags are left zero; only the parent
/// reference and the name take part in lookups. Names longer than 255 UTF-16
/// code units are truncated, as NTFS cannot store them.
#[must_use]
pub fn file_name_key(parent: u64, name: &str) -> Vec<u8> {
    let units: Vec<u16> = name.encode_utf16().take(usize::from(u8::MAX)).collect();

    let mut key = vec![0u8; NAME_OFFSET + units.len() * 2];
    key[..8].copy_from_slice(&parent.to_le_bytes());
    key[NAME_LENGTH_OFFSET] = u8::try_from(units.len()).unwrap_or(u8::MAX);
    key[NAMESPACE_OFFSET] = NAMESPACE_WIN32;
    for (i, unit) in units.iter().enumerate() {
        let at = NAME_OFFSET + i * 2;
        key[at..at + 2].copy_from_slice(&unit.to_le_bytes());
    }
    key
}

/// Decode the name from a file-name record, if it is well-formed.
#[must_use]
pub fn file_name_from_key(key: &[u8]) -> Option<String> {
    let chars = usize::from(*key.get(NAME_LENGTH_OFFSET)?);
    let bytes = key.get(NAME_OFFSET..NAME_OFFSET + chars * 2)?;
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_key_layout() {
        let key = file_name_key(5, "Foo.txt");
        assert_eq!(key.len(), 0x42 + 14);
        assert_eq!(&key[..8], &5u64.to_le_bytes());
        assert_eq!(key[0x40], 7);
        assert_eq!(key[0x41], NAMESPACE_WIN32);
        assert_eq!(&key[0x42..0x44], &[b'F', 0]);
        assert_eq!(file_name_from_key(&key), Some("Foo.txt".to_string()));
    }

    #[test]
    fn test_file_name_from_truncated_key() {
        let mut key = file_name_key(5, "abc");
        key.truncate(0x43);
        assert_eq!(file_name_from_key(&key), None);
        assert_eq!(file_name_from_key(&[0u8; 4]), None);
    }

    #[test]
    fn test_file_reference_packing() {
        let reference = file_reference(0x1234, 7);
        assert_eq!(u64::from_le_bytes(reference), 0x0007_0000_0000_1234);
        assert_eq!(split_file_reference(&reference), Some((0x1234, 7)));
        assert_eq!(split_file_reference(&reference[..6]), None);
    }

    #[test]
    fn test_fixed_width_keys() {
        assert_eq!(u32_key(0x0102_0304), vec![4, 3, 2, 1]);
        assert_eq!(security_hash_key(1, 2), vec![1, 0, 0, 0, 2, 0, 0, 0]);
        assert_eq!(reparse_key(0xA000_000C, 9).len(), 12);
        assert_eq!(object_id_key([3u8; 16]), vec![3u8; 16]);
    }

    #[test]
    fn test_quota_owner_key_layout() {
        // S-1-5-32-544, the built-in administrators group
        let key = quota_owner_key(5, &[32, 544]);
        assert_eq!(
            key,
            vec![1, 2, 0, 0, 0, 0, 0, 5, 32, 0, 0, 0, 0x20, 0x02, 0, 0]
        );

        let long = quota_owner_key(5, &[1; 20]);
        assert_eq!(long[1], 15);
        assert_eq!(long.len(), 8 + 15 * 4);
    }
}
