//! Volume-header management.
//!
//! The media keeps up to four rotating header copies, one per zone. Open
//! validates every copy and adopts the one with the highest `mirror_tid`;
//! flush writes the next slot after a barrier, so any crash leaves three
//! older valid generations and recovery loses at most one flush epoch.

use std::sync::Arc;

use log::{info, warn};
use zerocopy::{AsBytes, FromBytes};

use crate::device::Device;
use crate::error::{ErrorSet, Result};
use crate::ondisk::VolumeHeader;
use crate::param::{VOLUME_BYTES, ZONE_BYTES};

/// Volume alignment for the trailing member volume.
pub const VOLUME_ALIGN: u64 = 8 * 1024 * 1024;

/// Reads one header copy.
pub fn read_copy(device: &Arc<dyn Device>, slot: usize) -> Result<VolumeHeader> {
    let mut buf = vec![0u8; VOLUME_BYTES];
    device.read_at(VolumeHeader::copy_offset(slot), &mut buf)?;
    let mut vh = VolumeHeader::new_zeroed();
    vh.as_bytes_mut().copy_from_slice(&buf);
    Ok(vh)
}

/// Writes one header copy. The caller is responsible for the barrier
/// ordering writes before the rotation.
pub fn write_copy(device: &Arc<dyn Device>, slot: usize, vh: &VolumeHeader) -> Result<()> {
    device.write_at(VolumeHeader::copy_offset(slot), vh.as_bytes())
}

/// Cross-copy invariants over every accepted header: shared identity,
/// and member volume offsets forming a contiguous, non-overlapping,
/// monotonically-increasing partition with the required alignment.
pub fn verify_volume_set(headers: &[(usize, VolumeHeader)]) -> Result<()> {
    let (_, first) = match headers.first() {
        Some(h) => h,
        None => return Err(ErrorSet::EINVAL),
    };
    for (slot, vh) in headers.iter() {
        if vh.fsid != first.fsid
            || vh.fstype != first.fstype
            || vh.version != first.version
            || vh.nvolumes != first.nvolumes
        {
            warn!("volume header copy {} disagrees on identity", slot);
            return Err(ErrorSet::BADBREF);
        }
    }

    let nvolumes = first.nvolumes as usize;
    if nvolumes == 0 || nvolumes > first.volu_loff.len() {
        return Err(ErrorSet::BADBREF);
    }
    let mut expect = 0u64;
    for i in 0..first.volu_loff.len() {
        let loff = first.volu_loff[i];
        if i >= nvolumes {
            if loff != u64::MAX {
                return Err(ErrorSet::BADBREF);
            }
            continue;
        }
        if loff != expect {
            return Err(ErrorSet::BADBREF);
        }
        let span = if i + 1 == nvolumes {
            first.total_size - loff
        } else {
            // Interior members must be zone aligned.
            let next = if i + 1 < nvolumes { first.total_size.min(first.volu_loff[i + 1]) } else { first.total_size };
            next - loff
        };
        let align = if i + 1 == nvolumes { VOLUME_ALIGN } else { ZONE_BYTES };
        if span == 0 || span % align != 0 {
            return Err(ErrorSet::BADBREF);
        }
        expect += span;
    }
    if expect != first.total_size {
        return Err(ErrorSet::BADBREF);
    }
    Ok(())
}

/// Scans all header copies, validates each, and selects the valid one
/// with the highest `mirror_tid`. Failure of every copy is fatal.
pub fn scan(device: &Arc<dyn Device>) -> Result<(VolumeHeader, usize)> {
    let copies = VolumeHeader::copies_for_size(device.size());
    let mut valid: Vec<(usize, VolumeHeader)> = Vec::new();
    let mut errors = ErrorSet::empty();
    for slot in 0..copies {
        match read_copy(device, slot) {
            Ok(vh) => match vh.validate() {
                Ok(()) => valid.push((slot, vh)),
                Err(e) => {
                    warn!("volume header copy {} invalid: {:?}", slot, e);
                    errors |= e;
                }
            },
            Err(e) => {
                warn!("volume header copy {} unreadable: {:?}", slot, e);
                errors |= e;
            }
        }
    }
    if valid.is_empty() {
        return Err(if errors.is_empty() {
            ErrorSet::EINVAL
        } else {
            errors
        });
    }
    verify_volume_set(&valid)?;
    let (slot, vh) = valid
        .into_iter()
        .max_by_key(|(_, vh)| vh.mirror_tid)
        .unwrap();
    info!(
        "selected volume header copy {} mirror_tid={}",
        slot, vh.mirror_tid
    );
    Ok((vh, slot))
}

/// Commits `vh` to the slot after `current`, returning the new selected
/// slot. A device barrier orders all preceding topology writes first.
pub fn rotate_write(
    device: &Arc<dyn Device>,
    vh: &mut VolumeHeader,
    current: usize,
) -> Result<usize> {
    let copies = VolumeHeader::copies_for_size(device.size());
    let next = (current + 1) % copies;
    vh.update_crcs();
    device.barrier()?;
    write_copy(device, next, vh)?;
    device.barrier()?;
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;
    use crate::ondisk::{VOLUME_MAGIC, VOLUME_VERSION_DEFAULT};

    fn fresh_header(size: u64) -> VolumeHeader {
        let mut vh = VolumeHeader::new_zeroed();
        vh.magic = VOLUME_MAGIC;
        vh.version = VOLUME_VERSION_DEFAULT;
        vh.fsid = *uuid::Uuid::new_v4().as_bytes();
        vh.fstype = *uuid::Uuid::new_v4().as_bytes();
        vh.nvolumes = 1;
        vh.volu_size = size;
        vh.total_size = size;
        vh.volu_loff = [0, u64::MAX, u64::MAX, u64::MAX];
        vh.update_crcs();
        vh
    }

    fn device(size: u64) -> Arc<dyn Device> {
        Arc::new(MemDevice::new(size))
    }

    #[test]
    fn selects_highest_mirror_tid() {
        let size = 8 * ZONE_BYTES;
        let dev = device(size);
        for slot in 0..4usize {
            let mut vh = fresh_header(size);
            vh.mirror_tid = 10 + slot as u64;
            vh.update_crcs();
            write_copy(&dev, slot, &vh).unwrap();
        }
        let (vh, slot) = scan(&dev).unwrap();
        assert_eq!(slot, 3);
        assert_eq!(vh.mirror_tid, 13);
    }

    #[test]
    fn damaged_copy_is_skipped() {
        let size = 8 * ZONE_BYTES;
        let dev = device(size);
        for slot in 0..4usize {
            let mut vh = fresh_header(size);
            vh.mirror_tid = 10 + slot as u64;
            vh.update_crcs();
            write_copy(&dev, slot, &vh).unwrap();
        }
        // Corrupt the newest copy; selection falls back to the next one.
        dev.write_at(VolumeHeader::copy_offset(3) + 0x100, &[0xff; 8])
            .unwrap();
        let (vh, slot) = scan(&dev).unwrap();
        assert_eq!(slot, 2);
        assert_eq!(vh.mirror_tid, 12);
    }

    #[test]
    fn all_copies_damaged_is_fatal() {
        let size = 8 * ZONE_BYTES;
        let dev = device(size);
        assert!(scan(&dev).is_err());
    }

    #[test]
    fn rotation_walks_slots() {
        let size = 8 * ZONE_BYTES;
        let dev = device(size);
        let mut vh = fresh_header(size);
        vh.mirror_tid = 5;
        let next = rotate_write(&dev, &mut vh, 2).unwrap();
        assert_eq!(next, 3);
        let back = read_copy(&dev, 3).unwrap();
        assert!(back.validate().is_ok());
        assert_eq!(back.mirror_tid, 5);

        vh.mirror_tid = 6;
        let next = rotate_write(&dev, &mut vh, next).unwrap();
        assert_eq!(next, 0);
    }

    #[test]
    fn volume_set_partition_checks() {
        let size = 8 * ZONE_BYTES;
        let mut vh = fresh_header(size);
        vh.volu_loff[1] = 123; // must be MAX past nvolumes
        vh.update_crcs();
        assert!(verify_volume_set(&[(0, vh)]).is_err());
    }
}
