//! Directory-record key normalization and hashing.
//!
//! APFS case-insensitive/case-preserving volumes store directory record keys
//! hashed over the NFD (canonical decomposition) form of the name, folded to
//! lowercase for the hash only (the on-disk name itself keeps its original
//! case). The hash uses CRC-32C (Castagnoli), packed into the top 22 bits of
//! a 32-bit `name_len_and_hash` field; the low 10 bits hold the UTF-8 byte
//! length of the *unnormalized* name actually stored in the key.

use unicode_normalization::UnicodeNormalization;

const HASH_NAME_LEN_MASK: u32 = 0x0000_03FF;

/// Compute the 22-bit name hash APFS stores in a hashed directory-record key.
///
/// `case_sensitive` mirrors the volume's `APFS_FS_CASE_SENSITIVE` flag
/// (`superblock::ApfsSuperblock::is_case_sensitive`): case-sensitive volumes
/// hash the NFD form as-is, case-insensitive ones additionally fold ASCII
/// letters to lowercase before hashing.
pub fn hash_name(name: &str, case_sensitive: bool) -> u32 {
    let normalized: String = name.nfd().collect();
    let folded: String = if case_sensitive {
        normalized
    } else {
        normalized
            .chars()
            .map(|c| c.to_ascii_lowercase())
            .collect()
    };

    let digest = crc32c::crc32c(folded.as_bytes());
    (digest << 10) & 0xFFFF_FC00
}

/// Pack a hash and UTF-8 name length (including the terminating NUL APFS
/// stores on disk) into the on-disk `name_len_and_hash` field.
pub fn pack_name_len_and_hash(name_len_with_nul: u16, hash: u32) -> u32 {
    (hash & !HASH_NAME_LEN_MASK) | (name_len_with_nul as u32 & HASH_NAME_LEN_MASK)
}

/// Compare two names the way a directory lookup on `case_sensitive` volume
/// would: exact byte equality if case-sensitive, NFD + ASCII-fold equality
/// otherwise. Non-ASCII case differences are intentionally not folded,
/// matching APFS's normalization-insensitive (not full Unicode
/// case-insensitive) comparison mode.
pub fn names_equal(a: &str, b: &str, case_sensitive: bool) -> bool {
    if case_sensitive {
        a.nfd().eq(b.nfd())
    } else {
        let fold = |s: &str| -> String {
            s.nfd().flat_map(|c| c.to_lowercase()).collect()
        };
        fold(a) == fold(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_sensitive_hash_differs_by_case() {
        let h1 = hash_name("Readme.txt", true);
        let h2 = hash_name("readme.txt", true);
        assert_ne!(h1, h2);
    }

    #[test]
    fn case_insensitive_hash_matches_regardless_of_case() {
        let h1 = hash_name("Readme.txt", false);
        let h2 = hash_name("readme.txt", false);
        assert_eq!(h1, h2);
    }

    #[test]
    fn nfd_decomposition_normalizes_precomposed_accents() {
        // "café" with a precomposed é (U+00E9) vs. decomposed e + combining acute.
        let precomposed = "caf\u{00E9}";
        let decomposed = "cafe\u{0301}";
        assert!(names_equal(precomposed, decomposed, true));
    }

    #[test]
    fn names_equal_respects_case_sensitivity_flag() {
        assert!(!names_equal("File", "file", true));
        assert!(names_equal("File", "file", false));
    }

    #[test]
    fn pack_name_len_and_hash_preserves_length_bits() {
        let hash = hash_name("x", true);
        let packed = pack_name_len_and_hash(2, hash);
        assert_eq!(packed & HASH_NAME_LEN_MASK, 2);
        assert_eq!(packed & !HASH_NAME_LEN_MASK, hash & !HASH_NAME_LEN_MASK);
    }
}
