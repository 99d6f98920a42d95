//
// Copyright (c) 2025-2026 Jeff Garzik
//
// This file is part of the ptdd-rs project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT
//

//! File categorisation
//!
//! A path is classified into a small bitset so the opener and the copy
//! loop can dispatch on endpoint kind. The bits combine: a block device
//! accessed through the SCSI pass-through carries BLOCK | PT.

use std::fmt;
use std::fs;
use std::ops::{BitOr, BitOrAssign};
use std::os::unix::fs::FileTypeExt;

/// Bitset of endpoint kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileKind(u32);

impl FileKind {
    pub const OTHER: FileKind = FileKind(0x1);
    pub const PT: FileKind = FileKind(0x2);
    pub const REG: FileKind = FileKind(0x4);
    pub const DEV_NULL: FileKind = FileKind(0x8);
    pub const TAPE: FileKind = FileKind(0x10);
    pub const BLOCK: FileKind = FileKind(0x20);
    pub const FIFO: FileKind = FileKind(0x40);
    pub const CHAR: FileKind = FileKind(0x80);
    pub const ERROR: FileKind = FileKind(0x100);

    pub fn intersects(self, other: FileKind) -> bool {
        (self.0 & other.0) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for FileKind {
    type Output = FileKind;

    fn bitor(self, rhs: FileKind) -> FileKind {
        FileKind(self.0 | rhs.0)
    }
}

impl BitOrAssign for FileKind {
    fn bitor_assign(&mut self, rhs: FileKind) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<&str> = Vec::new();
        if self.intersects(FileKind::DEV_NULL) {
            parts.push("null device");
        }
        if self.intersects(FileKind::PT) {
            parts.push("pass-through [pt] device");
        }
        if self.intersects(FileKind::TAPE) {
            parts.push("SCSI tape device");
        }
        if self.intersects(FileKind::BLOCK) {
            parts.push("block device");
        }
        if self.intersects(FileKind::FIFO) {
            parts.push("fifo [stdin, stdout, named pipe]");
        }
        if self.intersects(FileKind::REG) {
            parts.push("regular file");
        }
        if self.intersects(FileKind::CHAR) {
            parts.push("char device");
        }
        if self.intersects(FileKind::OTHER) {
            parts.push("other file type");
        }
        if self.intersects(FileKind::ERROR) {
            parts.push("unable to stat");
        }
        write!(f, "{}", parts.join(", "))
    }
}

// Fixed Linux char-device majors of interest
#[cfg(target_os = "linux")]
const MEM_MAJOR: u64 = 1;
#[cfg(target_os = "linux")]
const DEV_NULL_MINOR: u64 = 3;
#[cfg(target_os = "linux")]
const SCSI_GENERIC_MAJOR: u64 = 21;
#[cfg(target_os = "linux")]
const SCSI_TAPE_MAJOR: u64 = 9;

/// The bsg character driver's major is allocated dynamically; look it up
/// once in /proc/devices.
#[cfg(target_os = "linux")]
fn bsg_major() -> u64 {
    use std::io::BufRead;
    use std::sync::OnceLock;

    static BSG_MAJOR: OnceLock<u64> = OnceLock::new();
    *BSG_MAJOR.get_or_init(|| {
        let file = match fs::File::open("/proc/devices") {
            Ok(f) => f,
            Err(_) => return 0,
        };
        let mut in_char_section = false;
        for line in std::io::BufReader::new(file).lines() {
            let line = match line {
                Ok(l) => l,
                Err(_) => break,
            };
            if line.starts_with("Character") {
                in_char_section = true;
                continue;
            }
            if line.starts_with("Block") {
                break;
            }
            if in_char_section {
                let mut it = line.split_whitespace();
                if let (Some(num), Some(name)) = (it.next(), it.next()) {
                    if name == "bsg" {
                        return num.parse().unwrap_or(0);
                    }
                }
            }
        }
        0
    })
}

/// Categorise a path. A single-dot path is the null sink; a path that
/// cannot be stat'ed is ERROR.
pub fn categorize(path: &str) -> FileKind {
    if path == "." {
        return FileKind::DEV_NULL;
    }
    let md = match fs::metadata(path) {
        Ok(md) => md,
        Err(_) => return FileKind::ERROR,
    };
    let ft = md.file_type();
    if ft.is_file() {
        return FileKind::REG;
    }
    if ft.is_char_device() {
        return categorize_char(&md);
    }
    if ft.is_block_device() {
        return FileKind::BLOCK;
    }
    if ft.is_fifo() {
        return FileKind::FIFO;
    }
    FileKind::OTHER
}

#[cfg(target_os = "linux")]
fn categorize_char(md: &fs::Metadata) -> FileKind {
    use std::os::unix::fs::MetadataExt;

    let rdev = md.rdev();
    let major = (rdev >> 8) & 0xfff;
    let minor = (rdev & 0xff) | ((rdev >> 12) & !0xffu64);
    if major == MEM_MAJOR && minor == DEV_NULL_MINOR {
        return FileKind::DEV_NULL;
    }
    if major == SCSI_GENERIC_MAJOR {
        return FileKind::PT;
    }
    if major == SCSI_TAPE_MAJOR {
        return FileKind::TAPE;
    }
    if bsg_major() != 0 && major == bsg_major() {
        return FileKind::PT;
    }
    // something like /dev/zero
    FileKind::CHAR
}

#[cfg(not(target_os = "linux"))]
fn categorize_char(_md: &fs::Metadata) -> FileKind {
    FileKind::CHAR
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dot_is_null_sink() {
        assert_eq!(categorize("."), FileKind::DEV_NULL);
    }

    #[test]
    fn test_missing_path_is_error() {
        assert_eq!(categorize("/no/such/path/at/all"), FileKind::ERROR);
    }

    #[test]
    fn test_regular_file() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let kind = categorize(tmp.path().to_str().unwrap());
        assert_eq!(kind, FileKind::REG);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_dev_null() {
        assert_eq!(categorize("/dev/null"), FileKind::DEV_NULL);
    }

    #[test]
    fn test_bit_combination() {
        let k = FileKind::BLOCK | FileKind::PT;
        assert!(k.intersects(FileKind::BLOCK));
        assert!(k.intersects(FileKind::PT));
        assert!(!k.intersects(FileKind::REG));
    }
}
