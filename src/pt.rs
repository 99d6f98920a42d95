//
// Copyright (c) 2025-2026 Jeff Garzik
//
// This file is part of the ptdd-rs project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT
//

//! Pass-through provider contract
//!
//! The engine issues explicit READ/WRITE/WRITE SAME/SYNCHRONIZE CACHE
//! commands against whatever sits behind this trait. Real SCSI transports
//! (SG_IO, bsg, CAM) are injected per platform; this crate ships a
//! file-backed provider that addresses any readable/writable node as an
//! array of fixed-size logical blocks, which carries the `pt` flag on
//! plain nodes and the test-suite.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

use crate::blkdev;

/// SCSI-level command outcome categories, passed through to the exit code
/// when fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtStatus {
    UnitAttention,
    AbortedCommand,
    MediumHard,
    InvalidOp,
    NotReady,
    Protection,
    ProtectionWithInfo,
    Other,
}

impl PtStatus {
    pub fn exit_code(self) -> u8 {
        match self {
            PtStatus::UnitAttention => crate::error::EXIT_UNIT_ATTENTION,
            PtStatus::AbortedCommand => crate::error::EXIT_ABORTED_COMMAND,
            PtStatus::MediumHard => crate::error::EXIT_MEDIUM_HARD,
            PtStatus::InvalidOp => crate::error::EXIT_INVALID_OP,
            PtStatus::NotReady => crate::error::EXIT_NOT_READY,
            PtStatus::Protection | PtStatus::ProtectionWithInfo => crate::error::EXIT_PROTECTION,
            PtStatus::Other => crate::error::EXIT_CAT_OTHER,
        }
    }
}

impl fmt::Display for PtStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PtStatus::UnitAttention => "unit attention",
            PtStatus::AbortedCommand => "aborted command",
            PtStatus::MediumHard => "medium or hardware error",
            PtStatus::InvalidOp => "invalid opcode",
            PtStatus::NotReady => "not ready",
            PtStatus::Protection => "protection error",
            PtStatus::ProtectionWithInfo => "protection error with info",
            PtStatus::Other => "other pass-through error",
        };
        write!(f, "{}", s)
    }
}

/// Result of a pass-through read: blocks actually transferred, plus the
/// command status when not all of them were.
pub struct PtReadResult {
    pub blocks: usize,
    pub status: Option<PtStatus>,
}

/// The commands the copy engine issues on a pass-through endpoint.
///
/// `dpo`, `fua`, `fua_nv`, `rarc` and the rd/wrprotect fields shape the
/// CDBs a real transport builds; a provider that has no such notion is
/// free to ignore them.
pub trait PassThrough {
    /// READ CAPACITY: (number of logical blocks, logical block size)
    fn read_capacity(&mut self) -> Result<(u64, usize), PtStatus>;

    /// Read `blocks` logical blocks starting at `lba` into `buf`.
    fn read(&mut self, buf: &mut [u8], blocks: usize, lba: u64) -> PtReadResult;

    /// Write `blocks` logical blocks starting at `lba` from `buf`.
    fn write(&mut self, buf: &[u8], blocks: usize, lba: u64) -> Result<(), PtStatus>;

    /// WRITE SAME (16) over `blocks` blocks at `lba`, replicating the single
    /// block in `blk`; `unmap` asks the device to de-allocate the range.
    fn write_same16(
        &mut self,
        blk: &[u8],
        blocks: usize,
        lba: u64,
        unmap: bool,
    ) -> Result<(), PtStatus>;

    /// SYNCHRONIZE CACHE
    fn sync_cache(&mut self) -> Result<(), PtStatus>;

    /// (protection type, P_I_EXPONENT) discovered at open; (0, 0) when the
    /// device has no protection information.
    fn protection(&self) -> (u8, u8) {
        (0, 0)
    }

    /// The kernel descriptor behind the handle, when there is one (used to
    /// cross-check a block device's kernel view against the pt view).
    fn raw_fd(&self) -> Option<RawFd> {
        None
    }
}

/// File-backed provider: the node is an LBA array of `block_size` units.
pub struct FileBackedPt {
    file: File,
    block_size: usize,
    is_block_dev: bool,
}

impl FileBackedPt {
    pub fn open(path: &Path, writable: bool, block_size: usize) -> io::Result<FileBackedPt> {
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .create(false)
            .open(path)?;
        let is_block_dev = {
            use std::os::unix::fs::FileTypeExt;
            file.metadata()?.file_type().is_block_device()
        };
        Ok(FileBackedPt {
            file,
            block_size,
            is_block_dev,
        })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    fn map_err(e: &io::Error) -> PtStatus {
        match e.raw_os_error() {
            Some(code) if code == libc::EIO => PtStatus::MediumHard,
            #[cfg(target_os = "linux")]
            Some(code) if code == libc::EREMOTEIO => PtStatus::MediumHard,
            Some(code) if code == libc::ENXIO || code == libc::ENODEV => PtStatus::NotReady,
            _ => PtStatus::Other,
        }
    }
}

impl PassThrough for FileBackedPt {
    fn read_capacity(&mut self) -> Result<(u64, usize), PtStatus> {
        if self.is_block_dev {
            let (num, sect_sz) = blkdev::capacity(&self.file).map_err(|e| Self::map_err(&e))?;
            // report in the engine's block size, not the kernel's
            let bytes = num * sect_sz as u64;
            return Ok((bytes / self.block_size as u64, self.block_size));
        }
        let len = self
            .file
            .metadata()
            .map_err(|e| Self::map_err(&e))?
            .len();
        Ok((len / self.block_size as u64, self.block_size))
    }

    fn read(&mut self, buf: &mut [u8], blocks: usize, lba: u64) -> PtReadResult {
        let want = blocks * self.block_size;
        let mut got = 0usize;
        while got < want {
            match self.file.read_at(&mut buf[got..want], lba * self.block_size as u64 + got as u64)
            {
                Ok(0) => break,
                Ok(n) => got += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return PtReadResult {
                        blocks: got / self.block_size,
                        status: Some(Self::map_err(&e)),
                    }
                }
            }
        }
        PtReadResult {
            blocks: got / self.block_size,
            status: None,
        }
    }

    fn write(&mut self, buf: &[u8], blocks: usize, lba: u64) -> Result<(), PtStatus> {
        let want = blocks * self.block_size;
        self.file
            .write_all_at(&buf[..want], lba * self.block_size as u64)
            .map_err(|e| Self::map_err(&e))
    }

    fn write_same16(
        &mut self,
        blk: &[u8],
        blocks: usize,
        lba: u64,
        _unmap: bool,
    ) -> Result<(), PtStatus> {
        let bs = self.block_size;
        for k in 0..blocks {
            self.file
                .write_all_at(&blk[..bs], (lba + k as u64) * bs as u64)
                .map_err(|e| Self::map_err(&e))?;
        }
        Ok(())
    }

    fn sync_cache(&mut self) -> Result<(), PtStatus> {
        self.file.sync_data().map_err(|e| Self::map_err(&e))
    }

    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.file.as_raw_fd())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn scratch(len: usize) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        f.write_all(&data).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn test_read_capacity_regular() {
        let f = scratch(512 * 10);
        let mut pt = FileBackedPt::open(f.path(), false, 512).unwrap();
        let (num, bs) = pt.read_capacity().unwrap();
        assert_eq!(num, 10);
        assert_eq!(bs, 512);
    }

    #[test]
    fn test_read_at_lba() {
        let f = scratch(512 * 4);
        let mut pt = FileBackedPt::open(f.path(), false, 512).unwrap();
        let mut buf = vec![0u8; 512 * 2];
        let res = pt.read(&mut buf, 2, 1);
        assert_eq!(res.blocks, 2);
        assert!(res.status.is_none());
        assert_eq!(buf[0], (512 % 251) as u8);
    }

    #[test]
    fn test_short_read_past_end() {
        let f = scratch(512 * 3);
        let mut pt = FileBackedPt::open(f.path(), false, 512).unwrap();
        let mut buf = vec![0u8; 512 * 4];
        let res = pt.read(&mut buf, 4, 1);
        assert_eq!(res.blocks, 2);
        assert!(res.status.is_none());
    }

    #[test]
    fn test_write_then_read_back() {
        let f = scratch(512 * 4);
        let mut pt = FileBackedPt::open(f.path(), true, 512).unwrap();
        let pattern = vec![0xa5u8; 512];
        pt.write(&pattern, 1, 2).unwrap();
        let mut buf = vec![0u8; 512];
        let res = pt.read(&mut buf, 1, 2);
        assert_eq!(res.blocks, 1);
        assert_eq!(buf, pattern);
    }

    #[test]
    fn test_write_same_zeros() {
        let f = scratch(512 * 4);
        let mut pt = FileBackedPt::open(f.path(), true, 512).unwrap();
        let zeros = vec![0u8; 512];
        pt.write_same16(&zeros, 3, 1, true).unwrap();
        let mut buf = vec![0u8; 512 * 3];
        let res = pt.read(&mut buf, 3, 1);
        assert_eq!(res.blocks, 3);
        assert!(buf.iter().all(|&b| b == 0));
    }
}
