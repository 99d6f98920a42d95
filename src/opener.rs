//
// Copyright (c) 2025-2026 Jeff Garzik
//
// This file is part of the ptdd-rs project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT
//

//! Opening the three endpoints
//!
//! Applies each side's flag vector (direct, exclusive, sync, append,
//! truncate, advisory lock) and settles the endpoint variants the copy
//! loop dispatches on.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::path::Path;

use gettextrs::gettext;

use crate::error::{PtddError, PtddResult};
use crate::filetype::{categorize, FileKind};
use crate::options::{InputSrc, Opts, OutputDst};
use crate::pt::{FileBackedPt, PassThrough};

fn dup_fd(fd: RawFd) -> io::Result<File> {
    let new = unsafe { libc::dup(fd) };
    if new < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { File::from_raw_fd(new) })
}

fn apply_flock(fd: RawFd, path: &str) -> PtddResult<()> {
    if unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) } < 0 {
        return Err(PtddError::Flock(format!(
            "flock(LOCK_EX | LOCK_NB) on {} failed: {}",
            path,
            io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn advise_sequential(fd: RawFd) {
    let rt = unsafe { libc::posix_fadvise(fd, 0, 0, libc::POSIX_FADV_SEQUENTIAL) };
    if rt != 0 {
        eprintln!("posix_fadvise(SEQUENTIAL), err={}", rt);
    }
}

#[cfg(not(target_os = "linux"))]
fn advise_sequential(_fd: RawFd) {}

fn custom_open_bits(flags: &crate::options::Flags) -> i32 {
    let mut bits = 0;
    #[cfg(target_os = "linux")]
    if flags.direct {
        bits |= libc::O_DIRECT;
    }
    if flags.excl {
        bits |= libc::O_EXCL;
    }
    if flags.sync {
        bits |= libc::O_SYNC;
    }
    bits
}

/// Open IFILE per the input flag vector; settles `op.input`,
/// `op.in_kind` and the reading_fifo disposition.
pub fn open_input(op: &mut Opts) -> PtddResult<()> {
    if op.inf == "-" {
        op.in_kind = FileKind::FIFO;
        op.reading_fifo = true;
        if op.verbose > 0 {
            eprintln!(" >> Input file type: fifo [stdin, stdout, named pipe]");
        }
        let f = dup_fd(libc::STDIN_FILENO)
            .map_err(|e| PtddError::File(format!("could not dup stdin: {}", e)))?;
        op.input = Some(InputSrc::Fifo(f));
        return Ok(());
    }

    op.in_kind = categorize(&op.inf);
    if op.in_kind.intersects(FileKind::ERROR) {
        return Err(PtddError::File(format!(
            "{} {}",
            gettext("unable to access"),
            op.inf
        )));
    }
    if op
        .in_kind
        .intersects(FileKind::BLOCK | FileKind::TAPE | FileKind::OTHER)
        && op.iflag.pt
    {
        op.in_kind |= FileKind::PT;
    }
    if op.verbose > 0 {
        eprintln!(" >> Input file type: {}", op.in_kind);
    }
    if !op.in_kind.intersects(FileKind::PT) && op.rdprotect > 0 {
        eprintln!("{}", gettext("rdprotect ignored on non-pt device"));
    }
    if op
        .in_kind
        .intersects(FileKind::FIFO | FileKind::CHAR | FileKind::TAPE)
    {
        op.reading_fifo = true;
    }
    if op.in_kind.intersects(FileKind::TAPE) && op.in_kind.intersects(FileKind::PT) {
        return Err(PtddError::File(format!(
            "SCSI tape device {} not supported via pt",
            op.inf
        )));
    }

    if op.in_kind.intersects(FileKind::PT) {
        let pt = FileBackedPt::open(Path::new(&op.inf), false, op.ibs).map_err(|e| {
            PtddError::File(format!("could not open {} for reading: {}", op.inf, e))
        })?;
        let (typ, exp) = pt.protection();
        op.rdprot_typ = typ;
        op.rdp_i_exp = exp;
        if op.iflag.flock {
            apply_flock(pt.as_raw_fd(), &op.inf)?;
        }
        op.input = Some(InputSrc::Pt(Box::new(pt)));
        return Ok(());
    }

    let file = OpenOptions::new()
        .read(true)
        .custom_flags(custom_open_bits(&op.iflag))
        .open(&op.inf)
        .map_err(|e| PtddError::File(format!("could not open {} for reading: {}", op.inf, e)))?;
    if op.verbose > 0 {
        eprintln!("        open {}", op.inf);
    }
    if op.iflag.nocache > 0 {
        advise_sequential(file.as_raw_fd());
    }
    if op.iflag.flock {
        apply_flock(file.as_raw_fd(), &op.inf)?;
    }
    op.input = Some(if op.in_kind.intersects(FileKind::FIFO) {
        InputSrc::Fifo(file)
    } else if op.in_kind.intersects(FileKind::TAPE) {
        InputSrc::Tape(file)
    } else {
        InputSrc::File(file)
    });
    Ok(())
}

/// Open OFILE per the output flag vector; settles `op.output`,
/// `op.out_kind` and `op.out_kind_hold`.
pub fn open_output(op: &mut Opts) -> PtddResult<()> {
    if op.outf == "-" {
        op.out_kind = FileKind::FIFO;
        op.out_kind_hold = op.out_kind;
        if op.verbose > 0 {
            eprintln!(" >> Output file type: fifo [stdin, stdout, named pipe]");
        }
        let f = dup_fd(libc::STDOUT_FILENO)
            .map_err(|e| PtddError::File(format!("could not dup stdout: {}", e)))?;
        op.output = Some(OutputDst::File(f));
        return Ok(());
    }

    op.out_kind = categorize(&op.outf);
    if op
        .out_kind
        .intersects(FileKind::BLOCK | FileKind::TAPE | FileKind::OTHER)
        && op.oflag.pt
    {
        op.out_kind |= FileKind::PT;
    }
    op.out_kind_hold = op.out_kind;
    if op.verbose > 0 {
        eprintln!(" >> Output file type: {}", op.out_kind);
    }
    if !op.out_kind.intersects(FileKind::PT) && op.wrprotect > 0 {
        eprintln!("{}", gettext("wrprotect ignored on non-pt device"));
    }
    if op.out_kind.intersects(FileKind::TAPE) && op.out_kind.intersects(FileKind::PT) {
        return Err(PtddError::File(format!(
            "SCSI tape device {} not supported via pt",
            op.outf
        )));
    }

    if op.out_kind.intersects(FileKind::PT) {
        let pt = FileBackedPt::open(Path::new(&op.outf), true, op.obs).map_err(|e| {
            PtddError::File(format!("could not open {} for writing: {}", op.outf, e))
        })?;
        let (typ, exp) = pt.protection();
        op.wrprot_typ = typ;
        op.wrp_i_exp = exp;
        if op.oflag.flock {
            apply_flock(pt.as_raw_fd(), &op.outf)?;
        }
        op.output = Some(OutputDst::Pt(Box::new(pt)));
        return Ok(());
    }
    if op.out_kind.intersects(FileKind::DEV_NULL) {
        op.output = Some(OutputDst::Null);
        return Ok(());
    }

    // typically a regular file or block device node
    let outf_exists = std::fs::metadata(&op.outf).is_ok();
    let mut oo = OpenOptions::new();
    // sparing reads the destination before deciding to write
    oo.read(op.oflag.sparing).write(true).create(!outf_exists);
    let mut bits = custom_open_bits(&op.oflag);
    if op.oflag.append {
        bits |= libc::O_APPEND;
    }
    oo.custom_flags(bits).mode(0o666);
    let mut trim_to: Option<u64> = None;
    if op.out_kind.intersects(FileKind::REG) && outf_exists && op.oflag.trunc && !op.oflag.nowrite
    {
        if op.seek > 0 {
            let offset = op.seek * op.obs as u64;
            if let Ok(md) = std::fs::metadata(&op.outf) {
                // only truncate to shorten
                if md.len() > offset {
                    trim_to = Some(offset);
                }
            }
        } else {
            oo.truncate(true);
        }
    }
    let file = oo
        .open(&op.outf)
        .map_err(|e| PtddError::File(format!("could not open {} for writing: {}", op.outf, e)))?;
    if let Some(offset) = trim_to {
        file.set_len(offset).map_err(|e| {
            PtddError::File(format!(
                "could not truncate {} after open (seek): {}",
                op.outf, e
            ))
        })?;
    }
    if !outf_exists && op.out_kind.intersects(FileKind::ERROR) {
        // exists now
        op.out_kind = FileKind::REG;
        op.out_kind_hold = op.out_kind;
    }
    if op.verbose > 0 {
        eprintln!(
            "        {} {}",
            if outf_exists { "open" } else { "create" },
            op.outf
        );
        if let Some(offset) = trim_to {
            eprintln!("        truncated file at byte offset {}", offset);
        }
    }
    if op.oflag.flock {
        apply_flock(file.as_raw_fd(), &op.outf)?;
    }
    op.output = Some(if op.out_kind.intersects(FileKind::TAPE) {
        OutputDst::Tape(file)
    } else {
        OutputDst::File(file)
    });
    Ok(())
}

/// Open OFILE2 when given: a regular file or fifo mirror of the writes.
pub fn open_output2(op: &mut Opts) -> PtddResult<()> {
    if op.out2f.is_empty() {
        return Ok(());
    }
    if op.out2f == "-" {
        op.out2_kind = FileKind::FIFO;
        if op.verbose > 0 {
            eprintln!(" >> Output 2 file type: fifo [stdin, stdout, named pipe]");
        }
        let f = dup_fd(libc::STDOUT_FILENO)
            .map_err(|e| PtddError::File(format!("could not dup stdout: {}", e)))?;
        op.out2 = Some(f);
        return Ok(());
    }
    op.out2_kind = categorize(&op.out2f);
    if op.out2_kind.intersects(FileKind::DEV_NULL) {
        return Ok(());
    }
    if !op
        .out2_kind
        .intersects(FileKind::REG | FileKind::FIFO | FileKind::ERROR)
    {
        return Err(PtddError::File(gettext(
            "output 2 file type must be regular file or fifo",
        )));
    }
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .mode(0o666)
        .open(&op.out2f)
        .map_err(|e| PtddError::File(format!("could not open {} for writing: {}", op.out2f, e)))?;
    if op.out2_kind.intersects(FileKind::ERROR) {
        op.out2_kind = FileKind::REG;
    }
    if op.verbose > 0 {
        eprintln!(" >> Output 2 file type: regular");
    }
    op.out2 = Some(file);
    Ok(())
}
