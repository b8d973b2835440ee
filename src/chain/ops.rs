//! Chain topology operations: lookup, iteration, create, and
//! indirect-block maintenance.

use std::sync::Arc;

use bitflags::bitflags;
use log::debug;

use super::base;
use super::{materialize_child, Chain, ChainFlags};
use crate::error::{ErrorSet, Result};
use crate::freemap;
use crate::mount::Dev;
use crate::ondisk::{
    off_join, Blockref, BREF_TYPE_EMPTY, BREF_TYPE_FREEMAP, BREF_TYPE_FREEMAP_NODE,
    BREF_TYPE_INDIRECT, BREF_TYPE_INODE,
};
use crate::param::IND_BYTES;

bitflags! {
    pub struct LookupFlags: u32 {
        /// Leave the returned chain's data unresolved.
        const NODATA   = 0x0002;
        /// Hide the inode-embedded byte 0 from data lookups.
        const NODIRECT = 0x0004;
        /// Acquire shared locks during the descent.
        const SHARED   = 0x0100;
        /// Return an indirect node whose whole key range equals the
        /// request instead of descending through it.
        const MATCHIND = 0x0200;
        /// Resolve the returned chain's data.
        const ALWAYS   = 0x0800;
    }
}

fn is_node_type(typ: u8) -> bool {
    typ == BREF_TYPE_INDIRECT || typ == BREF_TYPE_FREEMAP_NODE
}

/// First candidate under `parent` intersecting `[beg, end]`: the lower of
/// the first live in-memory child and the first media bref that no
/// in-memory chain shadows. Returns the child chain, materialized if it
/// only existed on media.
fn find_first(parent: &Arc<Chain>, beg: u64, end: u64) -> Result<Option<Arc<Chain>>> {
    let mem_child = parent.first_child_in(beg, end);

    let media_bref = {
        let mut guard = parent.lock.write();
        let table = match base::read_table(parent, &mut guard) {
            Ok(table) => table,
            Err(e) if e == ErrorSet::ENOTDIR => return Ok(None),
            Err(e) => return Err(e),
        };
        let shadowed: Vec<u64> = {
            let core = parent.core.lock();
            core.children.keys().map(|(key, _)| *key).collect()
        };
        base::live_entries(&table)
            .into_iter()
            .filter(|b| b.key_end() >= beg && b.key_beg() <= end)
            .find(|b| !shadowed.contains(&b.key))
    };

    match (mem_child, media_bref) {
        (None, None) => Ok(None),
        (Some(chain), None) => Ok(Some(chain)),
        (None, Some(bref)) => Ok(Some(materialize_child(parent, bref))),
        (Some(chain), Some(bref)) => {
            if chain.key <= bref.key {
                Ok(Some(chain))
            } else {
                Ok(Some(materialize_child(parent, bref)))
            }
        }
    }
}

/// Descends from `parent` and returns the first live chain whose key
/// range intersects `[key_beg, key_end]`, plus the key at which iteration
/// should continue. Keys are not returned in global order across the
/// indirect hierarchy; iterate until the resume key passes `key_end`.
///
/// A chain whose data failed to load is still returned with its sticky
/// error recorded, so bulk scans can skip it while mutators abort.
pub fn lookup(
    parent: &Arc<Chain>,
    key_beg: u64,
    key_end: u64,
    flags: LookupFlags,
) -> Result<Option<(Arc<Chain>, u64)>> {
    // Embedded small-file contents: a DIRECTDATA inode carries its bytes
    // inline and has no chain at offset 0. Data lookups see the inode
    // itself unless NODIRECT asks for the raw topology.
    if parent.typ == BREF_TYPE_INODE && !flags.contains(LookupFlags::NODIRECT) && key_beg == 0 {
        let direct = {
            let mut guard = parent.lock.write();
            parent.resolve_data_locked(&mut guard)?;
            base::read_inode(parent, &guard)?.is_direct_data()
        };
        if direct {
            return Ok(Some((Arc::clone(parent), key_end.wrapping_add(1))));
        }
    }

    let mut cursor = Arc::clone(parent);
    let mut beg = key_beg;
    let mut stack: Vec<(Arc<Chain>, u64)> = Vec::new();

    loop {
        let found = find_first(&cursor, beg, key_end)?;
        match found {
            Some(chain) if is_node_type(chain.typ) => {
                let covers_request = chain.key == key_beg
                    && chain.keybits < 64
                    && chain.key | ((1u64 << chain.keybits) - 1) == key_end;
                if flags.contains(LookupFlags::MATCHIND) && covers_request {
                    finish_resolve(&chain, flags);
                    let resume = chain_range_end(&chain).wrapping_add(1);
                    return Ok(Some((chain, resume)));
                }
                let resume = chain_range_end(&chain).wrapping_add(1);
                stack.push((Arc::clone(&cursor), resume));
                cursor = chain;
            }
            Some(chain) => {
                finish_resolve(&chain, flags);
                let resume = chain_range_end(&chain).wrapping_add(1);
                return Ok(Some((chain, resume)));
            }
            None => loop {
                match stack.pop() {
                    Some((up, resume)) => {
                        // resume == 0 means the subtree ended at KEY_MAX.
                        if resume != 0 && resume <= key_end && resume > beg {
                            cursor = up;
                            beg = resume;
                            break;
                        }
                    }
                    None => return Ok(None),
                }
            },
        }
    }
}

fn chain_range_end(chain: &Chain) -> u64 {
    if chain.keybits >= 64 {
        u64::MAX
    } else {
        chain.key | ((1u64 << chain.keybits) - 1)
    }
}

fn finish_resolve(chain: &Arc<Chain>, flags: LookupFlags) {
    if !flags.contains(LookupFlags::NODATA) {
        // Error, if any, is recorded sticky on the chain.
        let _ = chain.resolve_data();
    }
}

/// Advances a scan past `key_next`. The placemarker discipline: callers
/// keep scanning until the resume key passes `key_end` rather than
/// assuming key monotonicity across indirect levels.
pub fn next(
    parent: &Arc<Chain>,
    key_next: u64,
    key_end: u64,
    flags: LookupFlags,
) -> Result<Option<(Arc<Chain>, u64)>> {
    if key_next == 0 || key_next > key_end {
        // Wrapped past KEY_MAX or exhausted the requested range.
        return Ok(None);
    }
    lookup(parent, key_next, key_end, flags)
}

/// Materializes every direct child of `parent`, one level deep, in key
/// order. Used by flush, bulkfree, and the sync scan, which all need the
/// node chains themselves rather than leaf-level descent.
pub fn scan_children(parent: &Arc<Chain>) -> Result<Vec<Arc<Chain>>> {
    let mut out = Vec::new();
    let mut beg = 0u64;
    loop {
        match find_first(parent, beg, u64::MAX)? {
            Some(chain) => {
                let end = chain_range_end(&chain);
                out.push(chain);
                if end == u64::MAX {
                    break;
                }
                beg = end + 1;
            }
            None => break,
        }
    }
    Ok(out)
}

pub struct CreateArgs {
    pub key: u64,
    pub keybits: u8,
    pub typ: u8,
    /// Logical block bytes; 0 creates a storage-less chain (short-name
    /// dirents).
    pub bytes: usize,
    pub mtid: u64,
    /// Check/compression methods; inherited from the parent when `None`.
    pub methods: Option<u8>,
    /// Dedup hint: adopt this existing physical extent instead of
    /// allocating fresh storage.
    pub dedup_off: Option<u64>,
}

/// Creates a fresh chain under `parent`. The parent's block table is not
/// touched; the child carries UPDATE so the next flush inserts its bref.
/// A full parent is split with an indirect block first.
pub fn create(dev: &Dev, parent: &Arc<Chain>, args: CreateArgs) -> Result<Arc<Chain>> {
    let mut parent = Arc::clone(parent);
    loop {
        // Descend into an existing indirect node covering the key; any
        // other live chain there is a collision.
        if let Some(existing) = parent.first_child_in(args.key, args.key) {
            if is_node_type(existing.typ) {
                parent = existing;
                continue;
            }
            return Err(ErrorSet::EEXIST);
        }
        let media_hit = {
            let mut guard = parent.lock.write();
            let table = base::read_table(&parent, &mut guard)?;
            base::live_entries(&table)
                .into_iter()
                .find(|b| b.covers(args.key))
        };
        if let Some(bref) = media_hit {
            if !is_node_type(bref.typ) {
                return Err(ErrorSet::EEXIST);
            }
            parent = materialize_child(&parent, bref);
            continue;
        }

        let (live, capacity, pending) = {
            let mut guard = parent.lock.write();
            let table = base::read_table(&parent, &mut guard)?;
            let capacity = base::table_capacity(&parent, &guard);
            let live = base::live_entries(&table).len();
            let pending = {
                let core = parent.core.lock();
                core.children
                    .values()
                    .filter(|c| {
                        c.flags().contains(ChainFlags::UPDATE)
                            && !c.flags().contains(ChainFlags::BMAPPED)
                            && !c.flags().contains(ChainFlags::DELETED)
                    })
                    .count()
            };
            (live, capacity, pending)
        };
        if capacity == 0 {
            return Err(ErrorSet::ENOSPC);
        }
        if live + pending >= capacity {
            let node = create_indirect(dev, &parent, args.mtid)?;
            if node.key <= args.key && args.key <= chain_range_end(&node) {
                parent = node;
            }
            continue;
        }

        let methods = args.methods.unwrap_or_else(|| {
            let guard = parent.lock.read();
            guard.bref.methods
        });
        let mut bref = Blockref::new(args.typ, args.key, args.keybits);
        bref.methods = methods;
        bref.modify_tid = args.mtid;
        if args.bytes > 0 {
            bref.vradix = crate::ondisk::bytes_to_radix(args.bytes);
        }

        let chain = Chain::from_bref(dev.dio.clone(), bref);
        chain.set_flags(ChainFlags::INITIAL | ChainFlags::UPDATE);
        parent.attach_child(&chain);
        // Unhook the half-built chain if storage setup fails.
        let chain = scopeguard::guard(chain, |chain| {
            parent.detach_child(&chain);
        });

        if args.bytes > 0 {
            if let Some(off) = args.dedup_off {
                // Adopt a dedup-matched extent; no new storage. The
                // registration vouches for the content, and the flush
                // computes a fresh check code over it.
                let radix = crate::ondisk::bytes_to_radix(args.bytes);
                let mut guard = chain.lock.write();
                guard.bref.data_off = off_join(off, radix);
                guard.bref.vradix = radix;
                drop(guard);
                chain.clear_flags(ChainFlags::INITIAL);
                chain.set_flags(ChainFlags::MODIFIED | ChainFlags::TESTEDGOOD);
            } else {
                super::cow::modify(dev, &chain, args.mtid, super::cow::ModifyFlags::OPTDATA)?;
            }
        } else {
            chain.set_flags(ChainFlags::MODIFIED);
        }
        let chain = scopeguard::ScopeGuard::into_inner(chain);
        chain.setflush();
        return Ok(chain);
    }
}

/// Materializes an INDIRECT (or FREEMAP_NODE) child splitting `parent`'s
/// key range. The split point is the key bit that most evenly bisects the
/// existing children, which minimizes predicted future splits.
pub fn create_indirect(dev: &Dev, parent: &Arc<Chain>, mtid: u64) -> Result<Arc<Chain>> {
    super::cow::modify(dev, parent, mtid, super::cow::ModifyFlags::empty())?;

    let (live, in_mem): (Vec<Blockref>, Vec<Arc<Chain>>) = {
        let mut guard = parent.lock.write();
        let table = base::read_table(parent, &mut guard)?;
        let live = base::live_entries(&table);
        let core = parent.core.lock();
        let in_mem = core
            .children
            .values()
            .filter(|c| !c.flags().contains(ChainFlags::DELETED))
            .cloned()
            .collect();
        (live, in_mem)
    };

    let mut keys: Vec<u64> = live.iter().map(|b| b.key).collect();
    keys.extend(in_mem.iter().map(|c| c.key));
    if keys.len() < 2 {
        return Err(ErrorSet::EINVAL);
    }
    keys.sort_unstable();
    keys.dedup();

    // Highest bit position in which the keys differ; one half of that bit
    // range becomes the indirect node.
    let diff = keys.iter().fold(0u64, |acc, k| acc | (k ^ keys[0]));
    let split_bit = 63 - diff.leading_zeros() as u8;
    let prefix_mask = if split_bit >= 63 {
        u64::MAX
    } else {
        (1u64 << (split_bit + 1)) - 1
    };
    let low_prefix = keys[0] & !prefix_mask;
    let lower = (low_prefix, low_prefix | ((1u64 << split_bit) - 1));
    let upper_base = low_prefix | (1u64 << split_bit);
    let upper = (upper_base, upper_base | ((1u64 << split_bit) - 1));
    let lower_count = keys.iter().filter(|k| **k >= lower.0 && **k <= lower.1).count();
    let (ind_key, ind_bits) = if lower_count * 2 >= keys.len() {
        (lower.0, split_bit)
    } else {
        (upper.0, split_bit)
    };

    let node_type = if parent.typ == BREF_TYPE_FREEMAP
        || parent.typ == BREF_TYPE_FREEMAP_NODE
    {
        BREF_TYPE_FREEMAP_NODE
    } else {
        BREF_TYPE_INDIRECT
    };

    debug!(
        "indirect split under typ={} key={:#x}: node {:#x}/{}",
        parent.typ, parent.key, ind_key, ind_bits
    );

    // The node is hooked in directly: it frees parent capacity rather
    // than consuming it, so the create() admission checks do not apply.
    let mut nbref = Blockref::new(node_type, ind_key, ind_bits);
    nbref.methods = {
        let guard = parent.lock.read();
        guard.bref.methods
    };
    nbref.modify_tid = mtid;
    nbref.vradix = crate::ondisk::bytes_to_radix(IND_BYTES);
    let node = Chain::from_bref(parent.dio_cache.clone(), nbref);
    node.set_flags(ChainFlags::INITIAL | ChainFlags::UPDATE);
    parent.attach_child(&node);
    if let Err(error) = super::cow::modify(dev, &node, mtid, super::cow::ModifyFlags::OPTDATA) {
        parent.detach_child(&node);
        return Err(error);
    }

    // Move covered media entries down into the node.
    let node_end = chain_range_end(&node);
    {
        let mut pguard = parent.lock.write();
        let mut nguard = node.lock.write();
        let table = base::read_table(parent, &mut pguard)?;
        for bref in base::live_entries(&table) {
            if bref.key >= ind_key && bref.key <= node_end && bref.typ != BREF_TYPE_EMPTY {
                base::base_delete(parent, &mut pguard, bref.key, bref.typ)?;
                base::base_insert(&node, &mut nguard, &bref)?;
            }
        }
    }

    // Re-hook covered in-memory children.
    for child in in_mem {
        if child.id != node.id && child.key >= ind_key && child.key <= node_end {
            parent.detach_child(&child);
            node.attach_child(&child);
        }
    }

    node.setflush();
    Ok(node)
}

/// Collapses an underpopulated indirect node back into its parent. Runs
/// only at flush time under the flush transaction, and never across a PFS
/// boundary.
pub fn collapse_indirect(
    dev: &Dev,
    parent: &Arc<Chain>,
    node: &Arc<Chain>,
    mtid: u64,
) -> Result<()> {
    debug_assert!(is_node_type(node.typ));
    if node.flags().contains(ChainFlags::PFSBOUNDARY) {
        return Ok(());
    }

    let entries = {
        let mut guard = node.lock.write();
        let table = base::read_table(node, &mut guard)?;
        base::live_entries(&table)
    };
    let in_mem: Vec<Arc<Chain>> = {
        let core = node.core.lock();
        core.children
            .values()
            .filter(|c| !c.flags().contains(ChainFlags::DELETED))
            .cloned()
            .collect()
    };

    let room = {
        let mut guard = parent.lock.write();
        let table = base::read_table(parent, &mut guard)?;
        let capacity = base::table_capacity(parent, &guard);
        let live = base::live_entries(&table);
        // The node's own slot frees up when it is spliced out.
        let freed = live.iter().any(|b| b.key == node.key && b.typ == node.typ) as usize;
        (capacity + freed).saturating_sub(live.len())
    };
    if entries.len() + in_mem.len() > room {
        return Ok(());
    }

    super::cow::modify(dev, parent, mtid, super::cow::ModifyFlags::empty())?;
    {
        let mut pguard = parent.lock.write();
        base::base_delete(parent, &mut pguard, node.key, node.typ).ok();
        for bref in &entries {
            base::base_insert(parent, &mut pguard, bref)?;
        }
    }
    for child in in_mem {
        node.detach_child(&child);
        parent.attach_child(&child);
    }
    node.set_flags(ChainFlags::DELETED | ChainFlags::DESTROY);
    parent.detach_child(node);
    parent.set_flags(ChainFlags::UPDATE);
    parent.setflush();
    debug!("collapsed indirect {:#x}/{}", node.key, node.keybits);
    freemap::chain_unallocate(dev, node, mtid)?;
    Ok(())
}
