//! FileVault-style volume encryption: keybag parsing, passphrase-based key
//! unwrap, and per-extent AES-XTS-128 sector decryption.
//!
//! Grounded on the on-disk structures documented for `nx_keylocker` /
//! `kb_locker_t` / `keybag_entry_t` and the "key encryption key" (KEK) /
//! "volume encryption key" (VEK) unwrap chain: a user's passphrase is run
//! through PBKDF2-HMAC-SHA256 to derive the KEK, which RFC 3394 key-unwraps
//! the VEK stored (wrapped) in the keybag. The VEK then drives AES-XTS-128
//! decryption of file content, one 512-byte sector at a time, keyed by each
//! extent's `crypto_id`.

use aes::cipher::KeyInit;
use aes::Aes128;
use byteorder::{LittleEndian, ReadBytesExt};
use hmac::Hmac;
use pbkdf2::pbkdf2;
use sha2::Sha256;
use std::io::{Cursor, Read};
use xts_mode::Xts128;

use crate::error::{ApfsError, Result};

pub const SECTOR_SIZE: usize = 512;

/// KB_LOCKER magic ("BLKB" little-endian) at the start of the keybag media.
const KEYBAG_MAGIC: u32 = 0x424B_4C42;

/// Keybag entry key class / OS type constants are not needed for read-only
/// unwrap; only the UUID match and the wrapped key bytes matter here.
#[derive(Debug, Clone)]
pub struct KeybagEntry {
    pub uuid: [u8; 16],
    pub key_type: u16,
    pub wrapped_key: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Keybag {
    pub entries: Vec<KeybagEntry>,
}

impl Keybag {
    /// Parse a `kb_locker_t` blob (the plaintext payload read from the
    /// `nx_keylocker` physical range — the keybag media block itself is not
    /// further encrypted).
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 16 {
            return Err(ApfsError::CorruptedData("keybag blob too short".into()));
        }
        let mut cursor = Cursor::new(data);
        let magic = cursor.read_u32::<LittleEndian>()?;
        if magic != KEYBAG_MAGIC {
            return Err(ApfsError::InvalidMagic(magic));
        }
        let _version = cursor.read_u16::<LittleEndian>()?;
        let num_entries = cursor.read_u16::<LittleEndian>()?;
        let _size = cursor.read_u32::<LittleEndian>()?;
        let mut _reserved = [0u8; 8];
        cursor.read_exact(&mut _reserved)?;

        let mut entries = Vec::with_capacity(num_entries as usize);
        for _ in 0..num_entries {
            let mut uuid = [0u8; 16];
            cursor.read_exact(&mut uuid)?;
            let key_type = cursor.read_u16::<LittleEndian>()?;
            let _padding = cursor.read_u16::<LittleEndian>()?;
            let key_len = cursor.read_u32::<LittleEndian>()?;
            let mut wrapped_key = vec![0u8; key_len as usize];
            cursor.read_exact(&mut wrapped_key)?;

            // Each entry's key data is padded to a 16-byte boundary.
            let padded = (key_len as usize + 15) & !15;
            if padded > key_len as usize {
                let mut pad = vec![0u8; padded - key_len as usize];
                cursor.read_exact(&mut pad)?;
            }

            entries.push(KeybagEntry {
                uuid,
                key_type,
                wrapped_key,
            });
        }

        Ok(Keybag { entries })
    }

    /// Find the wrapped volume encryption key entry for a volume UUID.
    pub fn find_vek(&self, volume_uuid: &[u8; 16]) -> Option<&KeybagEntry> {
        self.entries.iter().find(|e| &e.uuid == volume_uuid)
    }
}

/// Derive a 128-bit key-encryption key from a user passphrase via
/// PBKDF2-HMAC-SHA256, per §4.4's stated KDF.
pub fn derive_kek(passphrase: &str, salt: &[u8], iterations: u32) -> [u8; 16] {
    let mut kek = [0u8; 16];
    pbkdf2::<Hmac<Sha256>>(passphrase.as_bytes(), salt, iterations, &mut kek);
    kek
}

/// RFC 3394 key-unwrap of the volume encryption key using the derived KEK.
pub fn unwrap_vek(kek: &[u8; 16], wrapped: &[u8]) -> Result<Vec<u8>> {
    let kek = aes_kw::KekAes128::from(*kek);
    kek.unwrap_vec(wrapped).map_err(|_| ApfsError::BadPassphrase)
}

/// An unlocked AES-XTS-128 cipher over a volume's extent content, keyed by
/// the resolved (unwrapped) volume encryption key.
pub struct VolumeCipher {
    xts: Xts128<Aes128>,
}

impl std::fmt::Debug for VolumeCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeCipher").finish_non_exhaustive()
    }
}

impl VolumeCipher {
    /// `vek` must be exactly 32 bytes: two concatenated AES-128 keys (data
    /// unit key, tweak key) per the XTS-AES-128 spec.
    pub fn new(vek: &[u8]) -> Result<Self> {
        if vek.len() != 32 {
            return Err(ApfsError::InvalidArgument(format!(
                "AES-XTS-128 key must be 32 bytes, got {}",
                vek.len()
            )));
        }
        let cipher_1 = Aes128::new_from_slice(&vek[..16])
            .map_err(|_| ApfsError::InvalidArgument("bad AES-128 data key".into()))?;
        let cipher_2 = Aes128::new_from_slice(&vek[16..])
            .map_err(|_| ApfsError::InvalidArgument("bad AES-128 tweak key".into()))?;
        Ok(VolumeCipher {
            xts: Xts128::new(cipher_1, cipher_2),
        })
    }

    /// Decrypt `data` in place, one 512-byte sector at a time, starting at
    /// logical sector `first_sector` (each extent's `crypto_id` combined with
    /// its block offset determines the per-sector tweak).
    pub fn decrypt_sectors(&self, data: &mut [u8], first_sector: u64) -> Result<()> {
        if data.len() % SECTOR_SIZE != 0 {
            return Err(ApfsError::MisalignedSector);
        }
        self.xts
            .decrypt_area(data, SECTOR_SIZE, first_sector as u128, xts_mode::get_tweak_default);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keybag_rejects_bad_magic() {
        let data = [0u8; 16];
        let err = Keybag::parse(&data).unwrap_err();
        assert!(matches!(err, ApfsError::InvalidMagic(_)));
    }

    #[test]
    fn keybag_parses_single_entry() {
        let mut data = Vec::new();
        data.extend_from_slice(&KEYBAG_MAGIC.to_le_bytes());
        data.extend_from_slice(&2u16.to_le_bytes()); // version
        data.extend_from_slice(&1u16.to_le_bytes()); // num_entries
        data.extend_from_slice(&40u32.to_le_bytes()); // size
        data.extend_from_slice(&[0u8; 8]); // reserved

        let uuid = [0xAAu8; 16];
        data.extend_from_slice(&uuid);
        data.extend_from_slice(&3u16.to_le_bytes()); // key_type
        data.extend_from_slice(&0u16.to_le_bytes()); // padding
        let wrapped_key = vec![0x11u8; 40];
        data.extend_from_slice(&(wrapped_key.len() as u32).to_le_bytes());
        data.extend_from_slice(&wrapped_key);

        let keybag = Keybag::parse(&data).unwrap();
        assert_eq!(keybag.entries.len(), 1);
        assert_eq!(keybag.entries[0].uuid, uuid);
        assert_eq!(keybag.entries[0].wrapped_key, wrapped_key);
        assert!(keybag.find_vek(&uuid).is_some());
        assert!(keybag.find_vek(&[0u8; 16]).is_none());
    }

    #[test]
    fn derive_kek_is_deterministic() {
        let a = derive_kek("hunter2", b"salt-bytes", 10_000);
        let b = derive_kek("hunter2", b"salt-bytes", 10_000);
        assert_eq!(a, b);
        let c = derive_kek("different", b"salt-bytes", 10_000);
        assert_ne!(a, c);
    }

    #[test]
    fn volume_cipher_rejects_wrong_key_length() {
        let err = VolumeCipher::new(&[0u8; 16]).unwrap_err();
        assert!(matches!(err, ApfsError::InvalidArgument(_)));
    }

    #[test]
    fn volume_cipher_rejects_misaligned_buffer() {
        let vek = [0u8; 32];
        let cipher = VolumeCipher::new(&vek).unwrap();
        let mut buf = vec![0u8; 100];
        let err = cipher.decrypt_sectors(&mut buf, 0).unwrap_err();
        assert!(matches!(err, ApfsError::MisalignedSector));
    }

    #[test]
    fn volume_cipher_roundtrips_with_xts_encrypt() {
        let vek = [0x42u8; 32];
        let cipher1 = Aes128::new_from_slice(&vek[..16]).unwrap();
        let cipher2 = Aes128::new_from_slice(&vek[16..]).unwrap();
        let xts = Xts128::new(cipher1, cipher2);

        let mut plaintext = vec![0u8; SECTOR_SIZE * 2];
        for (i, b) in plaintext.iter_mut().enumerate() {
            *b = (i % 256) as u8;
        }
        let mut buf = plaintext.clone();
        xts.encrypt_area(&mut buf, SECTOR_SIZE, 7u128, xts_mode::get_tweak_default);

        let decryptor = VolumeCipher::new(&vek).unwrap();
        decryptor.decrypt_sectors(&mut buf, 7).unwrap();
        assert_eq!(buf, plaintext);
    }
}
