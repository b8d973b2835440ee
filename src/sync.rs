//! Replica synchronization.
//!
//! One long-lived thread per cluster slot. Each pass probes whether the
//! slot's subtree `modify_tid` matches the quorum leader; if not, a joint
//! key-ordered scan drives convergence by inserting, replacing, or
//! destroying entries on the lagging side. Replaced inodes are deferred
//! onto a LIFO so their subtrees synchronize before the inode's tid is
//! adopted.
//!
//! The cross-cluster read side is modeled as direct access to the leader
//! replica; the message transport carrying the same queries between
//! machines is an external collaborator.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use itertools::{EitherOrBoth, Itertools};
use log::{debug, info, warn};
use zerocopy::{AsBytes, FromBytes};

use crate::chain::{self, Chain, CreateArgs, DeleteFlags};
use crate::error::{ErrorSet, Result};
use crate::lock::Sleepablelock;
use crate::mount::Dev;
use crate::ondisk::{InodeData, BREF_TYPE_INODE};
use crate::param::SYNC_DEFER_LIMIT;
use crate::trans::TransKind;

/// Stop after the current pass.
pub const SYNC_STOP: u32 = 0x0001;
/// Request a freeze; the thread acknowledges with FROZEN.
pub const SYNC_FREEZE: u32 = 0x0002;
pub const SYNC_UNFREEZE: u32 = 0x0004;
pub const SYNC_FROZEN: u32 = 0x0008;
/// Re-evaluate mastership before the next pass.
pub const SYNC_REMASTER: u32 = 0x0010;
/// Pending cross-cluster work.
pub const SYNC_XOPQ: u32 = 0x0020;

/// Handle to a running per-slot sync thread.
pub struct SyncThread {
    ctl: Arc<Sleepablelock<u32>>,
    join: Option<JoinHandle<()>>,
}

impl SyncThread {
    pub fn spawn(
        local: Arc<Dev>,
        local_root: Arc<Chain>,
        leader: Arc<Dev>,
        leader_root: Arc<Chain>,
        poll: Duration,
    ) -> SyncThread {
        let ctl = Arc::new(Sleepablelock::new(0u32));
        let thread_ctl = Arc::clone(&ctl);
        let join = thread::spawn(move || {
            run(thread_ctl, local, local_root, leader, leader_root, poll)
        });
        SyncThread {
            ctl,
            join: Some(join),
        }
    }

    fn post(&self, bit: u32) {
        let mut flags = self.ctl.lock();
        *flags |= bit;
        flags.wakeup();
    }

    pub fn freeze(&self) {
        self.post(SYNC_FREEZE);
    }

    pub fn unfreeze(&self) {
        self.post(SYNC_UNFREEZE);
    }

    pub fn remaster(&self) {
        self.post(SYNC_REMASTER);
    }

    pub fn kick(&self) {
        self.post(SYNC_XOPQ);
    }

    /// Stops the thread. The in-flight pass completes first; deferred
    /// work drains as EINPROGRESS.
    pub fn stop(mut self) {
        self.post(SYNC_STOP);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for SyncThread {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            self.post(SYNC_STOP);
            let _ = join.join();
        }
    }
}

fn run(
    ctl: Arc<Sleepablelock<u32>>,
    local: Arc<Dev>,
    local_root: Arc<Chain>,
    leader: Arc<Dev>,
    leader_root: Arc<Chain>,
    poll: Duration,
) {
    info!("sync thread started");
    loop {
        {
            let mut flags = ctl.lock();
            loop {
                if *flags & SYNC_STOP != 0 {
                    info!("sync thread stopping");
                    return;
                }
                if *flags & SYNC_FREEZE != 0 {
                    *flags = (*flags & !SYNC_FREEZE) | SYNC_FROZEN;
                    flags.wakeup();
                }
                if *flags & SYNC_UNFREEZE != 0 {
                    *flags &= !(SYNC_FROZEN | SYNC_UNFREEZE);
                }
                if *flags & SYNC_FROZEN != 0 {
                    flags.sleep();
                    continue;
                }
                *flags &= !(SYNC_REMASTER | SYNC_XOPQ);
                break;
            }
        }

        match sync_once(&local, &local_root, &leader, &leader_root) {
            Ok(true) => {
                debug!("sync pass converged work");
                continue;
            }
            Ok(false) => {}
            Err(e) if e.is_transient() => continue,
            Err(e) => warn!("sync pass failed: {:?}", e),
        }

        let mut flags = ctl.lock();
        if *flags & (SYNC_STOP | SYNC_FREEZE | SYNC_UNFREEZE | SYNC_XOPQ) == 0 {
            flags.sleep_timeout(poll);
        }
    }
}

/// One synchronization pass. Returns whether any mutation was replayed.
pub fn sync_once(
    local: &Arc<Dev>,
    local_root: &Arc<Chain>,
    leader: &Arc<Dev>,
    leader_root: &Arc<Chain>,
) -> Result<bool> {
    // Quorum probe: roll up the consensus tid and compare ours.
    let local_tid = local_root.lock.read().bref.modify_tid;
    let leader_tid = leader_root.lock.read().bref.modify_tid;
    if local_tid == leader_tid {
        return Ok(false);
    }
    if local.is_read_only() {
        return Err(ErrorSet::EROFS);
    }

    let trans = local.trans.begin(TransKind::Normal);
    let mtid = trans.mtid();
    let mut defer: Vec<(Arc<Chain>, Arc<Chain>)> = Vec::new();

    sync_subtree(local, local_root, leader, leader_root, mtid, &mut defer)?;

    // Deferred inode subtrees, LIFO so depth-first convergence completes
    // before any ancestor adopts the remote tid.
    let mut drained = 0usize;
    while let Some((lchain, rchain)) = defer.pop() {
        drained += 1;
        if drained > SYNC_DEFER_LIMIT {
            // Restart from the top; the next pass picks up where the
            // adopted tids left off.
            return Err(ErrorSet::EAGAIN);
        }
        sync_subtree(local, &lchain, leader, &rchain, mtid, &mut defer)?;
        adopt_tids(&lchain, &rchain);
    }

    adopt_tids(local_root, leader_root);
    Ok(true)
}

/// Joint key-ordered scan of one directory level.
fn sync_subtree(
    local: &Arc<Dev>,
    lparent: &Arc<Chain>,
    leader: &Arc<Dev>,
    rparent: &Arc<Chain>,
    mtid: u64,
    defer: &mut Vec<(Arc<Chain>, Arc<Chain>)>,
) -> Result<()> {
    let lchildren = chain::scan_children(lparent)?;
    let rchildren = chain::scan_children(rparent)?;

    for pair in lchildren
        .into_iter()
        .merge_join_by(rchildren.into_iter(), |l, r| l.key.cmp(&r.key))
    {
        match pair {
            EitherOrBoth::Left(lchain) => {
                // Local has an extra entry.
                sync_destroy(local, lparent, &lchain, mtid)?;
            }
            EitherOrBoth::Right(rchain) => {
                // Local is missing an entry.
                let lchain = sync_insert(local, lparent, leader, &rchain, mtid)?;
                if rchain.typ == BREF_TYPE_INODE {
                    defer.push((lchain, rchain));
                }
            }
            EitherOrBoth::Both(lchain, rchain) => {
                let ltid = lchain.lock.read().bref.modify_tid;
                let rtid = rchain.lock.read().bref.modify_tid;
                if ltid == rtid {
                    continue;
                }
                if lchain.typ != rchain.typ || lchain.keybits != rchain.keybits {
                    sync_destroy(local, lparent, &lchain, mtid)?;
                    let fresh = sync_insert(local, lparent, leader, &rchain, mtid)?;
                    if rchain.typ == BREF_TYPE_INODE {
                        defer.push((fresh, rchain));
                    }
                } else if rchain.typ == BREF_TYPE_INODE {
                    sync_replace_inode(local, &lchain, leader, &rchain, mtid)?;
                    // The tid is adopted only after the subtree syncs.
                    defer.push((lchain, rchain));
                } else {
                    sync_replace(local, &lchain, &rchain, mtid)?;
                }
            }
        }
    }
    Ok(())
}

fn adopt_tids(lchain: &Arc<Chain>, rchain: &Arc<Chain>) {
    let rbref = rchain.lock.read().bref;
    let mut guard = lchain.lock.write();
    guard.bref.modify_tid = rbref.modify_tid;
    guard.bref.update_tid = rbref.update_tid;
}

/// Local-only entry: replay the quorum's deletion.
fn sync_destroy(
    local: &Arc<Dev>,
    lparent: &Arc<Chain>,
    lchain: &Arc<Chain>,
    mtid: u64,
) -> Result<()> {
    debug!("sync destroy key={:#x}", lchain.key);
    match chain::delete(local, lparent, lchain, mtid, DeleteFlags::PERMANENT) {
        Ok(()) => Ok(()),
        Err(e) if e == ErrorSet::EAGAIN => {
            // Parent moved under us; restart the scan at the next pass.
            Err(ErrorSet::EAGAIN)
        }
        Err(e) => Err(e),
    }
}

/// Missing entry: copy the remote chain's bref and data into a fresh
/// local chain.
fn sync_insert(
    local: &Arc<Dev>,
    lparent: &Arc<Chain>,
    _leader: &Arc<Dev>,
    rchain: &Arc<Chain>,
    mtid: u64,
) -> Result<Arc<Chain>> {
    let rbref = rchain.lock.read().bref;
    debug!("sync insert key={:#x} typ={}", rbref.key, rbref.typ);
    let bytes = rbref.media_bytes();
    let lchain = chain::create(
        local,
        lparent,
        CreateArgs {
            key: rbref.key,
            keybits: rbref.keybits,
            typ: rbref.typ,
            bytes,
            mtid,
            methods: Some(rbref.methods),
            dedup_off: None,
        },
    )?;
    if bytes > 0 {
        let data = rchain.read_data()?;
        if rbref.typ == BREF_TYPE_INODE {
            // The remote blockset points at remote media; the deferred
            // subtree sync rebuilds the local one.
            let mut ip = InodeData::new_zeroed();
            ip.as_bytes_mut().copy_from_slice(&data);
            if !ip.is_direct_data() {
                ip.u = [0; crate::param::EMBED_BYTES];
            }
            local.write_chain_data(&lchain, ip.as_bytes())?;
        } else {
            local.write_chain_data(&lchain, &data)?;
        }
    }
    {
        let mut guard = lchain.lock.write();
        guard.bref.embed = rbref.embed;
        if bytes == 0 {
            // Short-name dirent: the name itself lives in the check area.
            guard.bref.check = rbref.check;
        }
        guard.bref.modify_tid = rbref.modify_tid;
        guard.bref.update_tid = rbref.update_tid;
    }
    Ok(lchain)
}

/// Same key, divergent content, non-inode: resize as needed, overwrite
/// the data, adopt the remote's shape, and let the next flush recompute
/// the check code.
fn sync_replace(
    local: &Arc<Dev>,
    lchain: &Arc<Chain>,
    rchain: &Arc<Chain>,
    mtid: u64,
) -> Result<()> {
    let rbref = rchain.lock.read().bref;
    debug!("sync replace key={:#x}", rbref.key);
    let bytes = rbref.media_bytes();
    if bytes > 0 {
        let lbytes = lchain.lock.read().bref.media_bytes();
        if lbytes != bytes {
            chain::resize(local, lchain, mtid, crate::ondisk::off_split(rbref.data_off).1)?;
        } else {
            chain::modify(local, lchain, mtid, chain::ModifyFlags::empty())?;
        }
        let data = rchain.read_data()?;
        local.write_chain_data(lchain, &data)?;
    } else {
        chain::modify(local, lchain, mtid, chain::ModifyFlags::empty())?;
    }
    let mut guard = lchain.lock.write();
    guard.bref.methods = rbref.methods;
    guard.bref.embed = rbref.embed;
    if bytes == 0 {
        guard.bref.check = rbref.check;
    }
    guard.bref.modify_tid = rbref.modify_tid;
    guard.bref.update_tid = rbref.update_tid;
    Ok(())
}

/// Inode replace. A PFS root only adopts a limited field subset: times,
/// ownership, mode, quotas, algorithm selectors, and the attr/dirent
/// tids. Its blockset and stored check survive untouched; the root's
/// identity must not be overwritten.
fn sync_replace_inode(
    local: &Arc<Dev>,
    lchain: &Arc<Chain>,
    leader: &Arc<Dev>,
    rchain: &Arc<Chain>,
    mtid: u64,
) -> Result<()> {
    let rip = leader.read_inode(rchain)?;
    let mut lip = local.read_inode(lchain)?;
    chain::modify(local, lchain, mtid, chain::ModifyFlags::empty())?;

    if lip.is_pfs_root() {
        copy_pfsroot_meta(&mut lip, &rip);
        local.write_inode(lchain, &lip)?;
    } else {
        // Ordinary inode: whole payload converges; the blockset area is
        // rebuilt by the deferred subtree sync.
        let preserved = lip.u;
        lip = rip;
        if !lip.is_direct_data() {
            lip.u = preserved;
        }
        local.write_inode(lchain, &lip)?;
    }
    Ok(())
}

fn copy_pfsroot_meta(lip: &mut InodeData, rip: &InodeData) {
    lip.meta.mtime = rip.meta.mtime;
    lip.meta.ctime = rip.meta.ctime;
    lip.meta.atime = rip.meta.atime;
    lip.meta.uid = rip.meta.uid;
    lip.meta.gid = rip.meta.gid;
    lip.meta.mode = rip.meta.mode;
    lip.meta.data_quota = rip.meta.data_quota;
    lip.meta.inode_quota = rip.meta.inode_quota;
    lip.meta.comp_algo = rip.meta.comp_algo;
    lip.meta.check_algo = rip.meta.check_algo;
    lip.meta.attr_tid = rip.meta.attr_tid;
    lip.meta.dirent_tid = rip.meta.dirent_tid;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;
    use crate::mount::{Dev, MountOptions};
    use crate::ondisk::OBJTYPE_REGFILE;
    use crate::param::ZONE_BYTES;

    fn mounted() -> (Arc<Dev>, Arc<Chain>) {
        let device = Arc::new(MemDevice::new(4 * ZONE_BYTES)) as Arc<dyn crate::device::Device>;
        let dev = Dev::format(device, MountOptions::default()).unwrap();
        let trans = dev.begin().unwrap();
        let root = dev.create_pfs_root(&trans, 1).unwrap();
        drop(trans);
        (dev, root)
    }

    fn add_file(dev: &Arc<Dev>, root: &Arc<Chain>, name: &[u8], key: u64, inum: u64, body: &[u8]) {
        let trans = dev.begin().unwrap();
        let ip = dev.create_inode(&trans, root, inum, OBJTYPE_REGFILE).unwrap();
        dev.create_dirent(&trans, root, name, key, inum, OBJTYPE_REGFILE)
            .unwrap();
        if !body.is_empty() {
            let data = chain::create(
                dev,
                &ip,
                CreateArgs {
                    key: 0,
                    keybits: 16,
                    typ: crate::ondisk::BREF_TYPE_DATA,
                    bytes: body.len(),
                    mtid: trans.mtid(),
                    methods: None,
                    dedup_off: None,
                },
            )
            .unwrap();
            dev.write_chain_data(&data, body).unwrap();
        }
        drop(trans);
    }

    #[test]
    fn insert_converges_missing_entries() {
        let (leader_dev, leader_root) = mounted();
        let (local_dev, local_root) = mounted();
        add_file(&leader_dev, &leader_root, b"alpha", 0x100, 10, b"contents");
        // Flush propagates the children's modify_tid into the root, which
        // is what the quorum probe compares.
        leader_dev.sync().unwrap();

        let worked = sync_once(&local_dev, &local_root, &leader_dev, &leader_root).unwrap();
        assert!(worked);

        let found = chain::lookup(&local_root, 0x100, 0x100, chain::LookupFlags::ALWAYS)
            .unwrap()
            .expect("dirent synced");
        assert_eq!(found.0.typ, crate::ondisk::BREF_TYPE_DIRENT);
        let head = found.0.lock.read().bref.embed_dirent();
        assert_eq!(head.inum, 10);

        // Second pass: already in sync.
        assert!(!sync_once(&local_dev, &local_root, &leader_dev, &leader_root).unwrap());
    }

    #[test]
    fn destroy_converges_extra_entries() {
        let (leader_dev, leader_root) = mounted();
        let (local_dev, local_root) = mounted();
        add_file(&local_dev, &local_root, b"stale", 0x200, 11, b"");
        // Leader advanced past the local replica without that entry.
        {
            let mut guard = leader_root.lock.write();
            guard.bref.modify_tid = 999;
        }

        sync_once(&local_dev, &local_root, &leader_dev, &leader_root).unwrap();
        let found = chain::lookup(&local_root, 0x200, 0x200, chain::LookupFlags::ALWAYS).unwrap();
        assert!(found.is_none());
        assert_eq!(
            local_root.lock.read().bref.modify_tid,
            leader_root.lock.read().bref.modify_tid
        );
    }

    fn burn_tids(dev: &Arc<Dev>, n: usize) {
        let mut trans = dev.begin().unwrap();
        for _ in 0..n {
            trans.sub();
        }
    }

    #[test]
    fn replace_converges_divergent_content() {
        let (leader_dev, leader_root) = mounted();
        let (local_dev, local_root) = mounted();
        add_file(&local_dev, &local_root, b"f", 0x300, 12, b"old");
        // The leader made the same entries later, under higher tids.
        burn_tids(&leader_dev, 16);
        add_file(&leader_dev, &leader_root, b"f", 0x300, 12, b"new-version-bytes");
        leader_dev.sync().unwrap();

        sync_once(&local_dev, &local_root, &leader_dev, &leader_root).unwrap();

        let (lfile, _) = chain::lookup(&local_root, 12, 12, chain::LookupFlags::ALWAYS)
            .unwrap()
            .expect("inode present");
        let (rfile, _) = chain::lookup(&leader_root, 12, 12, chain::LookupFlags::ALWAYS)
            .unwrap()
            .expect("inode present");
        let ldata = chain::lookup(&lfile, 0, u64::MAX, chain::LookupFlags::ALWAYS | chain::LookupFlags::NODIRECT)
            .unwrap()
            .expect("data chain synced");
        let rdata = chain::lookup(&rfile, 0, u64::MAX, chain::LookupFlags::ALWAYS | chain::LookupFlags::NODIRECT)
            .unwrap()
            .expect("leader data");
        assert_eq!(ldata.0.read_data().unwrap(), rdata.0.read_data().unwrap());
        assert_eq!(
            ldata.0.lock.read().bref.modify_tid,
            rdata.0.lock.read().bref.modify_tid
        );
    }

    #[test]
    fn pfsroot_replace_preserves_identity() {
        let (leader_dev, leader_root) = mounted();
        let (local_dev, local_root) = mounted();

        {
            let trans = leader_dev.begin().unwrap();
            let mut rip = leader_dev.read_inode(&leader_root).unwrap();
            rip.meta.mode = 0o755;
            rip.meta.mtime = 12345;
            chain::modify(&leader_dev, &leader_root, trans.mtid(), chain::ModifyFlags::empty())
                .unwrap();
            leader_dev.write_inode(&leader_root, &rip).unwrap();
        }
        let local_fsid_before = local_dev.read_inode(&local_root).unwrap().meta.pfs_fsid;

        sync_replace_inode(&local_dev, &local_root, &leader_dev, &leader_root, 50).unwrap();
        let lip = local_dev.read_inode(&local_root).unwrap();
        assert_eq!(lip.meta.mode, 0o755);
        assert_eq!(lip.meta.mtime, 12345);
        assert_eq!(lip.meta.pfs_fsid, local_fsid_before);
    }

    #[test]
    fn thread_freeze_and_stop() {
        let (leader_dev, leader_root) = mounted();
        let (local_dev, local_root) = mounted();
        let thread = SyncThread::spawn(
            local_dev,
            local_root,
            leader_dev,
            leader_root,
            Duration::from_millis(50),
        );
        thread.freeze();
        std::thread::sleep(Duration::from_millis(50));
        thread.unfreeze();
        thread.kick();
        thread.stop();
    }
}
