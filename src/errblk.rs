//
// Copyright (c) 2025-2026 Jeff Garzik
//
// This file is part of the ptdd-rs project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT
//

//! Error-block log (iflag=errblk)
//!
//! Append-only text file recording the LBA of every unrecovered read
//! error, one `0x<lba>` (or `0x<lba>-0x<lba_end>` range) per line,
//! bracketed by start/stop timestamp comments.

use std::fs::OpenOptions;
use std::io::Write;

use chrono::Local;

pub const ERRBLK_FILE: &str = "errblk.txt";

pub struct ErrBlkLog {
    file: std::fs::File,
}

impl ErrBlkLog {
    /// Open (appending) the error block file and stamp the start line.
    /// A failure to open is reported but not fatal to the copy.
    pub fn open() -> Option<ErrBlkLog> {
        let file = match OpenOptions::new()
            .append(true)
            .create(true)
            .open(ERRBLK_FILE)
        {
            Ok(f) => f,
            Err(_) => {
                eprintln!("unable to open or create {}", ERRBLK_FILE);
                return None;
            }
        };
        let mut log = ErrBlkLog { file };
        let _ = writeln!(
            log.file,
            "# start: {}",
            Local::now().format("%Y-%m-%d %H:%M:%S")
        );
        Some(log)
    }

    pub fn put(&mut self, lba: u64) {
        let _ = writeln!(self.file, "0x{:x}", lba);
    }

    pub fn put_range(&mut self, lba: u64, num: u64) {
        match num {
            0 => (),
            1 => self.put(lba),
            _ => {
                let _ = writeln!(self.file, "0x{:x}-0x{:x}", lba, lba + (num - 1));
            }
        }
    }

    /// Stamp the stop line. Called from the finaliser; dropping without
    /// closing leaves the file without a stop marker (e.g. on interrupt).
    pub fn close(mut self) {
        let _ = writeln!(
            self.file,
            "# stop: {}",
            Local::now().format("%Y-%m-%d %H:%M:%S")
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_log_format() {
        let dir = tempfile::tempdir().unwrap();
        let orig = std::env::current_dir().unwrap();
        // ERRBLK_FILE is relative to the working directory
        std::env::set_current_dir(dir.path()).unwrap();
        let mut log = ErrBlkLog::open().unwrap();
        log.put(0x1234);
        log.put_range(0x2000, 4);
        log.close();
        let text = fs::read_to_string(ERRBLK_FILE).unwrap();
        std::env::set_current_dir(orig).unwrap();
        assert!(text.starts_with("# start: "));
        assert!(text.contains("\n0x1234\n"));
        assert!(text.contains("\n0x2000-0x2003\n"));
        assert!(text.contains("# stop: "));
    }
}
