//! Checkpoint descriptor-ring scan and selection (§4.8).
//!
//! The teacher's `superblock::find_latest_nxsb` only compared transaction
//! ids across the ring; it never checked that the checkpoint-map entries a
//! candidate superblock's own transaction wrote were present and in-range,
//! so a torn or partially-overwritten checkpoint could still win. This
//! module adds that verification pass and falls back to the next-newest
//! candidate when it fails.

use byteorder::{LittleEndian, ReadBytesExt};
use std::collections::HashMap;
use std::io::{Cursor, Read, Seek, SeekFrom};

use crate::error::{ApfsError, Result};
use crate::fletcher;
use crate::object::{ObjectHeader, OBJECT_TYPE_CHECKPOINT_MAP, OBJECT_TYPE_NX_SUPERBLOCK};
use crate::superblock::{self, NxSuperblock};

/// One `checkpoint_mapping_t` entry: an ephemeral (type, oid) pair and the
/// physical block its current transaction's copy was written to.
#[derive(Debug, Clone)]
pub struct CheckpointMapping {
    pub obj_type: u32,
    pub obj_subtype: u32,
    pub oid: u64,
    pub paddr: u64,
}

/// A parsed `checkpoint_map_phys_t` block.
#[derive(Debug, Clone)]
pub struct CheckpointMap {
    pub mappings: Vec<CheckpointMapping>,
}

impl CheckpointMap {
    fn parse(block: &[u8]) -> Result<Self> {
        if block.len() < ObjectHeader::SIZE + 8 {
            return Err(ApfsError::InvalidBTree("checkpoint map too short".into()));
        }
        let mut cursor = Cursor::new(&block[ObjectHeader::SIZE..]);
        let _flags = cursor.read_u32::<LittleEndian>()?;
        let count = cursor.read_u32::<LittleEndian>()?;

        let mut mappings = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let obj_type = cursor.read_u32::<LittleEndian>()?;
            let obj_subtype = cursor.read_u32::<LittleEndian>()?;
            let _size = cursor.read_u32::<LittleEndian>()?;
            let _pad = cursor.read_u32::<LittleEndian>()?;
            let _fs_oid = cursor.read_u64::<LittleEndian>()?;
            let oid = cursor.read_u64::<LittleEndian>()?;
            let paddr = cursor.read_u64::<LittleEndian>()?;
            mappings.push(CheckpointMapping {
                obj_type,
                obj_subtype,
                oid,
                paddr,
            });
        }
        Ok(CheckpointMap { mappings })
    }

    /// Find the mapping for an ephemeral object by type and oid.
    pub fn find(&self, obj_type: u32, oid: u64) -> Option<&CheckpointMapping> {
        self.mappings
            .iter()
            .find(|m| m.obj_type == obj_type && m.oid == oid)
    }
}

/// The winning checkpoint: its NXSB plus the checkpoint-map entries its own
/// transaction wrote (if any — a transaction that touched no ephemeral
/// object writes no map).
pub struct CheckpointSelection {
    pub nxsb: NxSuperblock,
    pub checkpoint_map: Option<CheckpointMap>,
}

/// Scan the checkpoint descriptor ring and select the newest verified NXSB.
///
/// Reads block 0 to locate the ring, then scans every block in it,
/// verifying fletcher64 and filtering by object type. Candidates are tried
/// newest-xid first; a candidate is accepted once its own checkpoint map (if
/// any) is present and every mapping's paddr falls within the container.
pub fn select_checkpoint<R: Read + Seek>(reader: &mut R) -> Result<CheckpointSelection> {
    let block0 = superblock::read_nxsb(reader)?;
    let block_size = block0.block_size;
    let base = block0.xp_desc_base;
    let count = block0.xp_desc_blocks;

    let mut nxsb_candidates: Vec<NxSuperblock> = Vec::new();
    let mut maps_by_xid: HashMap<u64, CheckpointMap> = HashMap::new();

    for i in 0..count as u64 {
        let block_num = base + i;
        reader.seek(SeekFrom::Start(block_num * block_size as u64))?;
        let mut block = vec![0u8; block_size as usize];
        if reader.read_exact(&mut block).is_err() {
            continue;
        }
        if !fletcher::verify_object(&block) {
            continue;
        }
        let header = match ObjectHeader::parse(&block) {
            Ok(h) => h,
            Err(_) => continue,
        };

        match header.object_type() {
            OBJECT_TYPE_NX_SUPERBLOCK => {
                if let Ok(sb) = NxSuperblock::parse(&block) {
                    if sb.magic == superblock::NX_MAGIC {
                        nxsb_candidates.push(sb);
                    }
                }
            }
            OBJECT_TYPE_CHECKPOINT_MAP => {
                if let Ok(map) = CheckpointMap::parse(&block) {
                    maps_by_xid.insert(header.xid, map);
                }
            }
            _ => {}
        }
    }

    nxsb_candidates.push(block0.clone());
    nxsb_candidates.sort_by(|a, b| b.header.xid.cmp(&a.header.xid));
    nxsb_candidates.dedup_by_key(|sb| sb.header.xid);

    for candidate in nxsb_candidates {
        let checkpoint_map = maps_by_xid.get(&candidate.header.xid).cloned();
        if let Some(map) = &checkpoint_map {
            let all_in_range = map
                .mappings
                .iter()
                .all(|m| m.paddr < candidate.block_count);
            if !all_in_range {
                continue;
            }
        }
        return Ok(CheckpointSelection {
            nxsb: candidate,
            checkpoint_map,
        });
    }

    Err(ApfsError::NoValidCheckpoint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufReader;

    /// Requires ../tests/appfs.raw fixture. Run with `cargo test -- --ignored`.
    #[test]
    #[ignore]
    fn test_select_checkpoint() {
        let file = std::fs::File::open("../tests/appfs.raw").unwrap();
        let mut reader = BufReader::new(file);

        let selection = select_checkpoint(&mut reader).unwrap();
        assert_eq!(selection.nxsb.magic, superblock::NX_MAGIC);
    }

    #[test]
    fn checkpoint_map_find_matches_type_and_oid() {
        let map = CheckpointMap {
            mappings: vec![
                CheckpointMapping {
                    obj_type: 5,
                    obj_subtype: 0,
                    oid: 100,
                    paddr: 42,
                },
                CheckpointMapping {
                    obj_type: 5,
                    obj_subtype: 0,
                    oid: 200,
                    paddr: 99,
                },
            ],
        };
        let found = map.find(5, 200).unwrap();
        assert_eq!(found.paddr, 99);
        assert!(map.find(5, 300).is_none());
        assert!(map.find(6, 100).is_none());
    }
}
