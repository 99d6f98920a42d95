//
// Copyright (c) 2025-2026 Jeff Garzik
//
// This file is part of the ptdd-rs project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT
//

//! Block-device capacity oracle
//!
//! Answers "how many logical blocks, of what size" for a plain block
//! device, through whatever the platform provides.

use std::fs::File;
use std::io;

use std::os::unix::io::{AsRawFd, RawFd};

/// Number of sectors and sector size of the block device behind `file`.
pub fn capacity(file: &File) -> io::Result<(u64, usize)> {
    capacity_fd(file.as_raw_fd())
}

/// Same, for a borrowed descriptor.
#[cfg(target_os = "linux")]
pub fn capacity_fd(fd: RawFd) -> io::Result<(u64, usize)> {
    // from <linux/fs.h>
    const BLKSSZGET: libc::c_ulong = 0x1268;
    const BLKGETSIZE64: libc::c_ulong = 0x80081272;

    let mut sect_sz: libc::c_int = 0;
    if unsafe { libc::ioctl(fd, BLKSSZGET, &mut sect_sz) } < 0 {
        return Err(io::Error::last_os_error());
    }
    let mut bytes: u64 = 0;
    if unsafe { libc::ioctl(fd, BLKGETSIZE64, &mut bytes) } < 0 {
        return Err(io::Error::last_os_error());
    }
    if sect_sz <= 0 {
        return Err(io::Error::other("device reports zero sector size"));
    }
    Ok((bytes / sect_sz as u64, sect_sz as usize))
}

#[cfg(target_os = "freebsd")]
pub fn capacity_fd(fd: RawFd) -> io::Result<(u64, usize)> {
    // from <sys/disk.h>
    const DIOCGSECTORSIZE: libc::c_ulong = 0x40046480;
    const DIOCGMEDIASIZE: libc::c_ulong = 0x40086481;

    let mut sect_sz: libc::c_uint = 0;
    if unsafe { libc::ioctl(fd, DIOCGSECTORSIZE, &mut sect_sz) } < 0 {
        return Err(io::Error::last_os_error());
    }
    let mut media_sz: libc::off_t = 0;
    if unsafe { libc::ioctl(fd, DIOCGMEDIASIZE, &mut media_sz) } < 0 {
        return Err(io::Error::last_os_error());
    }
    if sect_sz == 0 {
        return Err(io::Error::other("device reports zero sector size"));
    }
    Ok((media_sz as u64 / sect_sz as u64, sect_sz as usize))
}

#[cfg(not(any(target_os = "linux", target_os = "freebsd")))]
pub fn capacity_fd(_fd: RawFd) -> io::Result<(u64, usize)> {
    Err(io::Error::other(
        "no block device capacity query on this platform",
    ))
}
