//! Physical device abstraction.
//!
//! The engine performs aligned, sized I/O through [`Device`]. Two backends
//! are provided: a sparse in-memory device used heavily by the test suite,
//! and a plain file/block-device backend.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{ErrorSet, Result};
use crate::param::PBUFSIZE;

/// A random-access block store. Implementations must be usable from
/// multiple threads; the DIO layer serializes per-frame access above this.
pub trait Device: Send + Sync {
    /// Total size in bytes.
    fn size(&self) -> u64;

    fn read_at(&self, off: u64, buf: &mut [u8]) -> Result<()>;

    fn write_at(&self, off: u64, buf: &[u8]) -> Result<()>;

    /// Write barrier: every write issued before this call is durable
    /// before any write issued after it. Used between flushing the
    /// topology and rotating the volume header.
    fn barrier(&self) -> Result<()>;
}

/// Sparse in-memory device. Unwritten frames read back as zeros, so a
/// multi-gigabyte geometry costs only what is touched.
pub struct MemDevice {
    size: u64,
    frames: spin::Mutex<HashMap<u64, Box<[u8]>>>,
    fail_writes: AtomicBool,
}

impl MemDevice {
    pub fn new(size: u64) -> MemDevice {
        MemDevice {
            size,
            frames: spin::Mutex::new(HashMap::new()),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Makes every subsequent write fail with EIO. Used to exercise the
    /// read-only degradation path.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }

    fn frame_base(off: u64) -> u64 {
        off & !(PBUFSIZE as u64 - 1)
    }
}

impl Device for MemDevice {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_at(&self, off: u64, buf: &mut [u8]) -> Result<()> {
        if off + buf.len() as u64 > self.size {
            return Err(ErrorSet::EIO);
        }
        let frames = self.frames.lock();
        let mut done = 0usize;
        while done < buf.len() {
            let cur = off + done as u64;
            let base = Self::frame_base(cur);
            let inner = (cur - base) as usize;
            let n = (PBUFSIZE - inner).min(buf.len() - done);
            match frames.get(&base) {
                Some(frame) => buf[done..done + n].copy_from_slice(&frame[inner..inner + n]),
                None => buf[done..done + n].fill(0),
            }
            done += n;
        }
        Ok(())
    }

    fn write_at(&self, off: u64, buf: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(ErrorSet::EIO);
        }
        if off + buf.len() as u64 > self.size {
            return Err(ErrorSet::EIO);
        }
        let mut frames = self.frames.lock();
        let mut done = 0usize;
        while done < buf.len() {
            let cur = off + done as u64;
            let base = Self::frame_base(cur);
            let inner = (cur - base) as usize;
            let n = (PBUFSIZE - inner).min(buf.len() - done);
            let frame = frames
                .entry(base)
                .or_insert_with(|| vec![0u8; PBUFSIZE].into_boxed_slice());
            frame[inner..inner + n].copy_from_slice(&buf[done..done + n]);
            done += n;
        }
        Ok(())
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}

/// File-backed device (regular file or raw block device node).
pub struct FileDevice {
    file: File,
    size: u64,
}

impl FileDevice {
    pub fn open(file: File) -> io::Result<FileDevice> {
        let size = file.metadata()?.len();
        Ok(FileDevice { file, size })
    }
}

fn io_err(_: io::Error) -> ErrorSet {
    ErrorSet::EIO
}

#[cfg(unix)]
impl Device for FileDevice {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_at(&self, off: u64, buf: &mut [u8]) -> Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.read_exact_at(buf, off).map_err(io_err)
    }

    fn write_at(&self, off: u64, buf: &[u8]) -> Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.write_all_at(buf, off).map_err(io_err)
    }

    fn barrier(&self) -> Result<()> {
        self.file.sync_data().map_err(io_err)
    }
}
