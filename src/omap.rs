use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read, Seek};

use crate::btree;
use crate::error::{ApfsError, Result};
use crate::object;

/// OMAP key: (oid: u64, xid: u64) — 16 bytes, fixed-size.
/// OMAP value: (flags: u32, size: u32, paddr: u64) — 16 bytes, fixed-size.
const OMAP_KEY_SIZE: u32 = 16;
const OMAP_VAL_SIZE: u32 = 16;

// om_flags bits (omap_phys_t.om_flags)
pub const OMAP_MANUALLY_MANAGED: u32 = 0x00000001;
pub const OMAP_ENCRYPTING: u32 = 0x00000002;
pub const OMAP_DECRYPTING: u32 = 0x00000004;
pub const OMAP_KEYROLLING: u32 = 0x00000008;
pub const OMAP_CRYPTO_GENERATION: u32 = 0x00000010;

// omap_val_t.ov_flags bits
pub const OMAP_VAL_DELETED: u32 = 0x00000001;
pub const OMAP_VAL_SAVED: u32 = 0x00000002;
pub const OMAP_VAL_ENCRYPTED: u32 = 0x00000004;
pub const OMAP_VAL_NOHEADER: u32 = 0x00000008;
pub const OMAP_VAL_CRYPTO_GENERATION: u32 = 0x00000010;

/// An object map, parsed far enough to drive lookups: its own B-tree root
/// and the ambient fields (flags, snapshot tree) §3's "Object map" ambient
/// addition names.
#[derive(Debug, Clone)]
pub struct ObjectMap {
    pub flags: u32,
    pub tree_oid: u64,
    pub snapshot_tree_oid: u64,
}

/// A resolved (flags, size, paddr) OMAP entry.
#[derive(Debug, Clone, Copy)]
pub struct OmapEntry {
    pub flags: u32,
    pub size: u32,
    pub paddr: u64,
}

impl OmapEntry {
    pub fn is_encrypted(&self) -> bool {
        self.flags & OMAP_VAL_ENCRYPTED != 0
    }

    pub fn is_noheader(&self) -> bool {
        self.flags & OMAP_VAL_NOHEADER != 0
    }
}

/// A resolver context for virtual-oid lookups: which OMAP B-tree to search,
/// and the transaction-id floor to search under.
///
/// `xid_floor = None` means "the latest mapping for this oid" (the ordinary,
/// non-snapshot case — the container's checkpoint selection has already
/// ensured nothing newer than the current transaction exists). `xid_floor =
/// Some(x)` pins resolution to the greatest recorded xid that is `<= x`,
/// which is what makes a snapshot handle see pre-snapshot content (§4.12).
#[derive(Debug, Clone, Copy)]
pub struct OmapContext {
    pub tree_root: u64,
    pub xid_floor: Option<u64>,
}

impl OmapContext {
    pub fn latest(tree_root: u64) -> Self {
        OmapContext {
            tree_root,
            xid_floor: None,
        }
    }

    pub fn pinned(tree_root: u64, xid: u64) -> Self {
        OmapContext {
            tree_root,
            xid_floor: Some(xid),
        }
    }
}

/// Read the `omap_phys_t` structure at a given physical block.
pub fn read_object_map<R: Read + Seek>(
    reader: &mut R,
    omap_block: u64,
    block_size: u32,
) -> Result<ObjectMap> {
    let block_data = object::read_block(reader, omap_block, block_size)?;

    // omap_phys_t layout after obj_phys_t (32 bytes):
    //   om_flags: u32 (4)
    //   om_snap_count: u32 (4)
    //   om_tree_type: u32 (4)
    //   om_snapshot_tree_type: u32 (4)
    //   om_tree_oid: u64 (8)
    //   om_snapshot_tree_oid: u64 (8)
    //   om_most_recent_snap: u64 (8)
    //   om_pending_revert_min, om_pending_revert_max: u64 (8 * 2)
    let mut cursor = Cursor::new(&block_data[object::ObjectHeader::SIZE..]);
    let om_flags = cursor.read_u32::<LittleEndian>()?;
    let _om_snap_count = cursor.read_u32::<LittleEndian>()?;
    let _om_tree_type = cursor.read_u32::<LittleEndian>()?;
    let _om_snapshot_tree_type = cursor.read_u32::<LittleEndian>()?;
    let om_tree_oid = cursor.read_u64::<LittleEndian>()?;
    let om_snapshot_tree_oid = cursor.read_u64::<LittleEndian>()?;
    let _om_most_recent_snap = cursor.read_u64::<LittleEndian>()?;
    let _om_pending_revert_min = cursor.read_u64::<LittleEndian>()?;
    let _om_pending_revert_max = cursor.read_u64::<LittleEndian>()?;

    Ok(ObjectMap {
        flags: om_flags,
        tree_oid: om_tree_oid,
        snapshot_tree_oid: om_snapshot_tree_oid,
    })
}

/// Read the OMAP at `omap_block` and return an `OmapContext` ready for
/// "latest" (non-snapshot) resolution.
pub fn read_omap_tree_root<R: Read + Seek>(
    reader: &mut R,
    omap_block: u64,
    block_size: u32,
) -> Result<u64> {
    Ok(read_object_map(reader, omap_block, block_size)?.tree_oid)
}

/// Resolve a virtual OID to a physical block address via `ctx`, honoring the
/// xid floor: the entry chosen is the one with the greatest xid that is
/// `<=` the floor (or the greatest xid overall when the floor is absent).
pub fn resolve<R: Read + Seek>(
    reader: &mut R,
    ctx: &OmapContext,
    block_size: u32,
    target_oid: u64,
) -> Result<OmapEntry> {
    let range_fn = |key: &[u8]| -> Option<bool> {
        if key.len() < 16 {
            return Some(false);
        }
        let key_oid = u64::from_le_bytes([
            key[0], key[1], key[2], key[3], key[4], key[5], key[6], key[7],
        ]);
        match key_oid.cmp(&target_oid) {
            std::cmp::Ordering::Less => Some(false),
            std::cmp::Ordering::Equal => Some(true),
            std::cmp::Ordering::Greater => None,
        }
    };

    let entries = btree::btree_scan(
        reader,
        ctx.tree_root,
        block_size,
        OMAP_KEY_SIZE,
        OMAP_VAL_SIZE,
        &range_fn,
        None,
    )?;

    let mut best: Option<(u64, OmapEntry)> = None;
    for (key, val) in &entries {
        if key.len() < 16 {
            continue;
        }
        let xid = u64::from_le_bytes([
            key[8], key[9], key[10], key[11], key[12], key[13], key[14], key[15],
        ]);
        if let Some(floor) = ctx.xid_floor {
            if xid > floor {
                continue;
            }
        }
        if best.map(|(best_xid, _)| xid > best_xid).unwrap_or(true) {
            best = Some((xid, parse_omap_val(val)?));
        }
    }

    match best {
        Some((_, entry)) => Ok(entry),
        None => Err(ApfsError::FileNotFound(format!(
            "OMAP entry for oid {target_oid} not found"
        ))),
    }
}

/// Convenience wrapper over [`resolve`] for callers that only need the
/// physical block address, not the full entry (flags/size).
pub fn omap_lookup<R: Read + Seek>(
    reader: &mut R,
    ctx: &OmapContext,
    block_size: u32,
    target_oid: u64,
) -> Result<u64> {
    Ok(resolve(reader, ctx, block_size, target_oid)?.paddr)
}

/// Parse an OMAP value: (flags: u32, size: u32, paddr: u64).
fn parse_omap_val(val: &[u8]) -> Result<OmapEntry> {
    if val.len() < 16 {
        return Err(ApfsError::InvalidBTree("omap value too short".into()));
    }
    let flags = u32::from_le_bytes([val[0], val[1], val[2], val[3]]);
    let size = u32::from_le_bytes([val[4], val[5], val[6], val[7]]);
    let paddr = u64::from_le_bytes([
        val[8], val[9], val[10], val[11], val[12], val[13], val[14], val[15],
    ]);
    Ok(OmapEntry { flags, size, paddr })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::superblock;
    use std::io::BufReader;

    /// Requires ../tests/appfs.raw fixture. Run with `cargo test -- --ignored`.
    #[test]
    #[ignore]
    fn test_omap_lookup() {
        let file = std::fs::File::open("../tests/appfs.raw").unwrap();
        let mut reader = BufReader::new(file);

        let nxsb = superblock::read_nxsb(&mut reader).unwrap();
        let latest = superblock::find_latest_nxsb(&mut reader, &nxsb).unwrap();

        let omap_root = read_omap_tree_root(&mut reader, latest.omap_oid, latest.block_size).unwrap();
        let ctx = OmapContext::latest(omap_root);

        let vol_oid = latest.fs_oids.iter().find(|&&o| o != 0).copied().unwrap();

        let vol_block = omap_lookup(&mut reader, &ctx, latest.block_size, vol_oid).unwrap();
        assert!(
            vol_block > 0 && vol_block < latest.block_count,
            "Physical block {} should be within container",
            vol_block
        );

        let vol_data = object::read_block(&mut reader, vol_block, latest.block_size).unwrap();
        let vol_sb = superblock::ApfsSuperblock::parse(&vol_data).unwrap();
        assert_eq!(vol_sb.magic, superblock::APSB_MAGIC);
    }

    #[test]
    fn resolve_honors_xid_floor() {
        // Can't synthesize a whole B-tree cheaply in a unit test without a
        // fixture image; the xid-floor arithmetic itself (entries filtered,
        // greatest-remaining chosen) is exercised end-to-end by the
        // `OmapContext`-consuming snapshot tests in `container.rs`.
        let ctx = OmapContext::pinned(42, 100);
        assert_eq!(ctx.tree_root, 42);
        assert_eq!(ctx.xid_floor, Some(100));
        let ctx2 = OmapContext::latest(42);
        assert_eq!(ctx2.xid_floor, None);
    }
}
