//
// Copyright (c) 2025-2026 Jeff Garzik
//
// This file is part of the ptdd-rs project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT
//

//! The copy loop
//!
//! Each iteration plans up to bpt input blocks, reads them through the
//! per-endpoint read dispatch, optionally mirrors to OFILE2, compares for
//! sparing and sparse, then writes through the per-endpoint write
//! dispatch. File-position cursors are tracked so redundant seeks are
//! elided; signals are drained at the start of the iteration and again
//! before the write.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::{Deref, DerefMut};

use crate::error::{PtddError, PtddResult};
use crate::filetype::FileKind;
use crate::options::{InputSrc, Opts, OutputDst};
use crate::pt::PtStatus;
use crate::signals::SignalBroker;
use crate::stats::{self, Stats};

#[cfg(not(target_os = "linux"))]
const EREMOTEIO: i32 = libc::EIO;
#[cfg(target_os = "linux")]
const EREMOTEIO: i32 = libc::EREMOTEIO;

/// Why the loop must stop after finishing the current write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LeaveReason {
    /// end of input, the normal way out
    #[default]
    Eof,
    /// tape short reads are routine; the loop continues after the short
    /// write and must not re-seek the output
    TapeShortRead,
    MediumHard,
    Other,
}

/// Per-iteration copy state. The position cursors persist across
/// iterations; the rest is reset at plan time.
#[derive(Default)]
pub struct CopyState {
    /// input blocks planned (may shrink on short read)
    pub icbpt: usize,
    /// output blocks planned
    pub ocbpt: usize,
    /// trailing bytes that do not fill an output block
    pub partial_write_bytes: usize,
    /// believed byte offset of the input descriptor
    pub if_filepos: u64,
    /// believed byte offset of the output descriptor
    pub of_filepos: u64,
    pub bytes_read: usize,
    pub bytes_of: usize,
    pub bytes_of2: usize,
    pub leave_after_write: bool,
    pub leave_reason: LeaveReason,
}

/// Page-aligned transfer buffer for O_DIRECT I/O.
pub struct AlignedBuf {
    ptr: *mut u8,
    len: usize,
    layout: Layout,
}

impl AlignedBuf {
    pub fn new(len: usize, align: usize) -> AlignedBuf {
        let layout = Layout::from_size_align(len.max(1), align.max(1))
            .expect("bad transfer buffer layout");
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null(), "transfer buffer allocation failed");
        AlignedBuf { ptr, len, layout }
    }
}

impl Deref for AlignedBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl DerefMut for AlignedBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) };
    }
}

fn is_medium_errno(e: &std::io::Error) -> bool {
    matches!(e.raw_os_error(), Some(code) if code == libc::EIO || code == EREMOTEIO)
}

/// read(2) with transparent EINTR retry, counted.
fn read_retry(f: &mut std::fs::File, buf: &mut [u8], st: &mut Stats) -> std::io::Result<usize> {
    loop {
        match f.read(buf) {
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                st.interrupted_retries += 1;
            }
            other => return other,
        }
    }
}

/// write(2) with transparent EINTR retry, counted.
fn write_retry(f: &mut std::fs::File, buf: &[u8], st: &mut Stats) -> std::io::Result<usize> {
    loop {
        match f.write(buf) {
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                st.interrupted_retries += 1;
            }
            other => return other,
        }
    }
}

/// Note an unrecovered read error at `lba`: bump the counters and range,
/// log to the error-block file, and enforce coe_limit.
fn register_unrecovered(op: &mut Opts, lba: u64) -> PtddResult<()> {
    if op.coe_limit > 0 {
        op.stats.coe_count += 1;
        if op.stats.coe_count > op.coe_limit {
            eprintln!(">> coe_limit on consecutive reads exceeded");
            return Err(PtddError::Medium(
                "coe_limit on consecutive reads exceeded".to_string(),
            ));
        }
    }
    op.stats.note_unrecovered(lba);
    op.stats.in_partial += 1;
    if let Some(log) = op.errblk.as_mut() {
        log.put(lba);
    }
    eprintln!(">> unrecovered read error at blk={}, substitute zeros", lba);
    Ok(())
}

/// Continue-on-error recovery for block/regular input. All whole blocks
/// before the failure are kept; from there on, one block at a time, with
/// zeros substituted for each unreadable block.
fn coe_recover_read(
    op: &mut Opts,
    csp: &mut CopyState,
    buf: &mut [u8],
    outcome: Result<usize, i32>,
) -> PtddResult<()> {
    let ibs = op.ibs_pi;
    let num_read = match outcome {
        Ok(0) => {
            csp.icbpt = 0;
            csp.ocbpt = 0;
            csp.leave_after_write = true;
            csp.leave_reason = LeaveReason::Eof;
            return Ok(());
        }
        Err(errno) if errno == libc::EIO || errno == EREMOTEIO => {
            if csp.icbpt == 1 {
                // single block plan: this must be the bad block
                buf[..ibs].fill(0);
                register_unrecovered(op, op.skip)?;
                csp.bytes_read += ibs;
                return Ok(());
            }
            0
        }
        Err(errno) => {
            eprintln!(
                "reading, skip={} : {}",
                op.skip,
                std::io::Error::from_raw_os_error(errno)
            );
            return Err(PtddError::Other(format!(
                "read failed at skip={}",
                op.skip
            )));
        }
        Ok(n) => (n / ibs) * ibs,
    };

    let mut done = num_read / ibs;
    if done > 0 {
        op.stats.in_full += done as u64;
        op.stats.reset_coe_count(op.coe_limit);
    }
    csp.bytes_read = num_read;
    let mut my_skip = op.skip + done as u64;
    let mut offset = my_skip * ibs as u64;
    let mut at = num_read;
    let mut tail_bytes = 0usize;
    let mut short_out = false;

    while done < csp.icbpt {
        if offset != csp.if_filepos {
            if op.verbose > 2 {
                eprintln!("moving if filepos: new_pos={}", offset);
            }
            let f = match op.input.as_mut() {
                Some(InputSrc::File(f)) => f,
                _ => return Err(PtddError::Other("input endpoint mismatch".to_string())),
            };
            if let Err(e) = f.seek(SeekFrom::Start(offset)) {
                eprintln!(
                    "failed moving if filepos: new_pos={}\nlseek on input: {}",
                    offset, e
                );
                return Err(PtddError::File("lseek on input failed".to_string()));
            }
            csp.if_filepos = offset;
        }
        buf[at..at + ibs].fill(0);
        let res = {
            let f = match op.input.as_mut() {
                Some(InputSrc::File(f)) => f,
                _ => return Err(PtddError::Other("input endpoint mismatch".to_string())),
            };
            read_retry(f, &mut buf[at..at + ibs], &mut op.stats)
        };
        match res {
            Ok(0) => {
                csp.leave_reason = LeaveReason::Eof;
                short_out = true;
                break;
            }
            Err(e) if is_medium_errno(&e) => {
                register_unrecovered(op, my_skip)?;
                // substituted zeros stand in for the block
                csp.bytes_read += ibs;
            }
            Err(e) => {
                eprintln!("reading 1 block, skip={} : {}", my_skip, e);
                csp.leave_reason = LeaveReason::Other;
                short_out = true;
                break;
            }
            Ok(n) if n < ibs => {
                if op.verbose > 0 {
                    eprintln!(
                        "short read at skip={} , wanted={}, got={} bytes",
                        my_skip, ibs, n
                    );
                }
                csp.leave_reason = LeaveReason::Eof;
                tail_bytes = n;
                short_out = true;
                break;
            }
            Ok(_) => {
                op.stats.reset_coe_count(op.coe_limit);
                csp.if_filepos += ibs as u64;
                if op.verbose > 2 {
                    eprintln!("reading 1 block, skip={} : okay", my_skip);
                }
                op.stats.in_full += 1;
                csp.bytes_read += ibs;
            }
        }
        done += 1;
        my_skip += 1;
        offset += ibs as u64;
        at += ibs;
    }
    if !short_out {
        return Ok(());
    }

    let total_read = ibs * done + tail_bytes;
    csp.icbpt = total_read / ibs;
    if total_read % ibs > 0 {
        csp.icbpt += 1;
        op.stats.in_partial += 1;
    }
    csp.ocbpt = total_read / op.obs;
    csp.leave_after_write = true;
    if csp.leave_reason == LeaveReason::Eof {
        csp.partial_write_bytes = total_read % op.obs;
    } else if total_read % op.obs > 0 {
        // a short read that is not EOF still pads out a whole block
        csp.ocbpt += 1;
    }
    Ok(())
}

/// Pass-through input read. Short reads shrink the plan and finish the
/// copy after the corresponding write; no partial writes come from pt
/// reads.
fn read_input_pt(op: &mut Opts, csp: &mut CopyState, buf: &mut [u8]) -> PtddResult<()> {
    let want = csp.icbpt;
    let numbytes = want * op.ibs_pi;
    let mut attempts = 0u32;
    let (blocks, status) = loop {
        let res = {
            let pt = match op.input.as_mut() {
                Some(InputSrc::Pt(p)) => p.as_mut(),
                _ => return Err(PtddError::Other("input endpoint mismatch".to_string())),
            };
            pt.read(&mut buf[..numbytes], want, op.skip)
        };
        match res.status {
            Some(st @ (PtStatus::UnitAttention | PtStatus::AbortedCommand))
                if res.blocks == 0 && attempts < op.iflag.retries =>
            {
                attempts += 1;
                op.stats.num_retries += 1;
                if op.verbose > 0 {
                    eprintln!("pt read: {} , retrying", st);
                }
            }
            other => break (res.blocks, other),
        }
    };
    if let Some(st) = status {
        if blocks == 0 {
            eprintln!(
                "pt read failed, at or after lba={} [0x{:x}]",
                op.skip, op.skip
            );
            return Err(PtddError::Pt(st, format!("pt read failed at lba={}", op.skip)));
        }
        // limp on with the data we got, stop after the write; hold the
        // category for the exit code
        op.err_to_report = Some(st.exit_code());
    }
    if blocks < csp.icbpt {
        if op.verbose > 1 {
            eprintln!(
                "short read, requested {} blocks, got {} blocks",
                csp.icbpt, blocks
            );
        }
        csp.leave_after_write = true;
        // assume at end rather than error
        csp.leave_reason = LeaveReason::Eof;
        csp.icbpt = blocks;
        // round down, no partial writes from pt reads
        csp.ocbpt = (blocks * op.ibs) / op.obs;
    }
    op.stats.in_full += csp.icbpt as u64;
    csp.bytes_read = csp.icbpt * op.ibs_pi;
    Ok(())
}

/// Fifo input read: loop until the full transfer or EOF; never seeks.
fn read_input_fifo(op: &mut Opts, csp: &mut CopyState, buf: &mut [u8]) -> PtddResult<()> {
    let numbytes = csp.icbpt * op.ibs;
    let offset = op.skip * op.ibs as u64;
    if offset != csp.if_filepos {
        if op.verbose > 2 {
            eprintln!("fifo: _not_ moving IFILE filepos to {}", offset);
        }
        csp.if_filepos = offset;
    }
    let mut got = 0usize;
    while got < numbytes {
        let res = {
            let f = match op.input.as_mut() {
                Some(InputSrc::Fifo(f)) => f,
                _ => return Err(PtddError::Other("input endpoint mismatch".to_string())),
            };
            read_retry(f, &mut buf[got..numbytes], &mut op.stats)
        };
        match res {
            Err(e) => {
                eprintln!("read(fifo), skip={} : {}", op.skip, e);
                return Err(PtddError::Other("fifo read failed".to_string()));
            }
            Ok(0) => {
                csp.icbpt = got / op.ibs;
                if got % op.ibs > 0 {
                    csp.icbpt += 1;
                    op.stats.in_partial += 1;
                }
                csp.ocbpt = got / op.obs;
                csp.leave_after_write = true;
                csp.leave_reason = LeaveReason::Eof;
                csp.partial_write_bytes = got % op.obs;
                break;
            }
            Ok(n) => got += n,
        }
    }
    if op.verbose > 2 {
        eprintln!("read(fifo): requested bytes={}, res={}", numbytes, got);
    }
    csp.if_filepos += got as u64;
    csp.bytes_read = got;
    op.stats.in_full += (got / op.ibs) as u64;
    Ok(())
}

/// Tape input read: one read(2); short reads are routine and recoverable.
fn read_input_tape(op: &mut Opts, csp: &mut CopyState, buf: &mut [u8]) -> PtddResult<()> {
    let num = csp.icbpt * op.ibs;
    op.stats.read_tape_numbytes = num;
    let res = {
        let f = match op.input.as_mut() {
            Some(InputSrc::Tape(f)) => f,
            _ => return Err(PtddError::Other("input endpoint mismatch".to_string())),
        };
        read_retry(f, &mut buf[..num], &mut op.stats)
    };
    stats::print_tape_summary(op, *res.as_ref().unwrap_or(&0));
    match res {
        Err(e) => {
            // the Linux st driver answers ENOMEM when the tape block is
            // larger than the requested read length
            let msg = if e.raw_os_error() == Some(libc::ENOMEM) {
                "Tape block larger than requested read length".to_string()
            } else {
                e.to_string()
            };
            eprintln!("reading, skip={} : {}", op.skip, msg);
            op.stats.last_tape_read_len = 0;
            if is_medium_errno(&e) {
                Err(PtddError::Medium("tape read failed".to_string()))
            } else {
                Err(PtddError::Other("tape read failed".to_string()))
            }
        }
        Ok(n) => {
            if op.verbose > 2 {
                eprintln!(
                    "read(tape{}): requested bytes={}, res={}",
                    if n >= num { "" } else { ", short" },
                    num,
                    n
                );
            }
            if op.verbose > 1 {
                if n == op.stats.last_tape_read_len {
                    op.stats.consec_same_len_reads += 1;
                } else {
                    op.stats.last_tape_read_len = n;
                    op.stats.consec_same_len_reads = 1;
                }
            }
            let mut full_credit = csp.icbpt;
            if n < num {
                csp.icbpt = n / op.ibs;
                full_credit = csp.icbpt;
                if n % op.ibs > 0 {
                    csp.icbpt += 1;
                    op.stats.in_partial += 1;
                }
                csp.ocbpt = n / op.obs;
                csp.leave_after_write = true;
                csp.leave_reason = LeaveReason::TapeShortRead;
                csp.partial_write_bytes = n % op.obs;
                if op.verbose == 2 && op.stats.consec_same_len_reads == 1 {
                    eprintln!("short read: requested {} bytes, got {}", num, n);
                }
            }
            csp.if_filepos += n as u64;
            csp.bytes_read = n;
            op.stats.in_full += full_credit as u64;
            Ok(())
        }
    }
}

/// Block-device / regular-file input read. On a short read, probes one
/// extra block to tell EOF from a latent medium error.
fn read_input_file(op: &mut Opts, csp: &mut CopyState, buf: &mut [u8]) -> PtddResult<()> {
    let ibs = op.ibs_pi;
    let numbytes = csp.icbpt * ibs;
    let offset = op.skip * ibs as u64;
    if offset != csp.if_filepos {
        if op.verbose > 2 {
            eprintln!("moving if filepos: new_pos={}", offset);
        }
        let f = match op.input.as_mut() {
            Some(InputSrc::File(f)) => f,
            _ => return Err(PtddError::Other("input endpoint mismatch".to_string())),
        };
        if let Err(e) = f.seek(SeekFrom::Start(offset)) {
            eprintln!(
                "failed moving if filepos: new_pos={}\nlseek on input: {}",
                offset, e
            );
            return Err(PtddError::File("lseek on input failed".to_string()));
        }
        csp.if_filepos = offset;
    }
    let res = {
        let f = match op.input.as_mut() {
            Some(InputSrc::File(f)) => f,
            _ => return Err(PtddError::Other("input endpoint mismatch".to_string())),
        };
        read_retry(f, &mut buf[..numbytes], &mut op.stats)
    };
    if op.verbose > 2 {
        eprintln!(
            "read(unix): requested bytes={}, res={}",
            numbytes,
            res.as_ref().map(|n| *n as i64).unwrap_or(-1)
        );
    }
    if op.iflag.coe {
        let go_coe = match &res {
            Ok(n) => *n < numbytes,
            Err(_) => true,
        };
        if go_coe {
            let outcome = match res {
                Ok(n) => {
                    if op.verbose > 0 {
                        eprintln!("reading, skip={} : short read, go to coe", op.skip);
                    }
                    csp.if_filepos += n as u64;
                    Ok(n)
                }
                Err(e) => {
                    if op.verbose > 0 {
                        eprintln!("reading, skip={} : {}, go to coe", op.skip, e);
                    }
                    Err(e.raw_os_error().unwrap_or(libc::EIO))
                }
            };
            return coe_recover_read(op, csp, buf, outcome);
        }
    }
    let n = match res {
        Err(e) => {
            eprintln!("reading, skip={} : {}", op.skip, e);
            return if is_medium_errno(&e) {
                Err(PtddError::Medium(format!("read failed at skip={}", op.skip)))
            } else {
                Err(PtddError::Other(format!("read failed at skip={}", op.skip)))
            };
        }
        Ok(n) => n,
    };
    let mut full_credit = csp.icbpt;
    if n < numbytes {
        csp.icbpt = n / ibs;
        full_credit = csp.icbpt;
        if n % ibs > 0 {
            csp.icbpt += 1;
            op.stats.in_partial += 1;
        }
        csp.ocbpt = n / op.obs;
        csp.leave_after_write = true;
        // fall through is assumed EOF
        csp.leave_reason = LeaveReason::Eof;
        if op.verbose > 1 {
            if op.in_kind.intersects(FileKind::BLOCK) {
                eprintln!(
                    "short read at skip={}, requested {} blocks, got {} blocks",
                    op.skip,
                    numbytes / ibs,
                    csp.icbpt
                );
            } else {
                eprintln!("short read, requested {} bytes, got {} bytes", numbytes, n);
            }
        }
        // probe one more block: EOF or a medium error lurking?
        let mut extra = 0usize;
        if n >= ibs && n <= numbytes - ibs {
            let res2 = {
                let f = match op.input.as_mut() {
                    Some(InputSrc::File(f)) => f,
                    _ => return Err(PtddError::Other("input endpoint mismatch".to_string())),
                };
                read_retry(f, &mut buf[n..n + ibs], &mut op.stats)
            };
            match res2 {
                Err(e) => {
                    if is_medium_errno(&e) {
                        csp.leave_reason = LeaveReason::MediumHard;
                        op.stats.unrecovered_errs += 1;
                    } else {
                        csp.leave_reason = LeaveReason::Other;
                    }
                    if op.verbose > 0 {
                        eprintln!(
                            "after short read, read at skip={}: {}",
                            op.skip + csp.icbpt as u64,
                            e
                        );
                    }
                }
                Ok(n2) => {
                    // expect 0 indicating EOF
                    csp.if_filepos += n2 as u64;
                    extra = n2;
                    if op.verbose > 1 {
                        eprintln!("extra read after short read, res={}", n2);
                    }
                }
            }
        }
        if csp.leave_reason == LeaveReason::Eof {
            csp.partial_write_bytes = (n + extra) % op.obs;
        } else if n % op.obs > 0 {
            csp.ocbpt += 1;
        }
    }
    csp.if_filepos += n as u64;
    csp.bytes_read = n;
    op.stats.in_full += full_credit as u64;
    Ok(())
}

fn read_input(op: &mut Opts, csp: &mut CopyState, buf: &mut [u8]) -> PtddResult<()> {
    if op.in_kind.intersects(FileKind::PT) {
        read_input_pt(op, csp, buf)
    } else if op.in_kind.intersects(FileKind::FIFO) {
        read_input_fifo(op, csp, buf)
    } else if op.in_kind.intersects(FileKind::TAPE) {
        read_input_tape(op, csp, buf)
    } else {
        read_input_file(op, csp, buf)
    }
}

/// Mirror this iteration's data to OFILE2 (regular file or fifo). Writes
/// to a fifo are non-atomic, so loop while making progress.
fn mirror_to_of2(op: &mut Opts, csp: &mut CopyState, buf: &[u8]) -> PtddResult<()> {
    let numbytes = csp.ocbpt * op.obs + csp.partial_write_bytes;
    let is_fifo = op.out2_kind.intersects(FileKind::FIFO);
    let mut off = 0usize;
    let mut part = false;
    loop {
        let res = {
            let f = match op.out2.as_mut() {
                Some(f) => f,
                None => return Ok(()),
            };
            write_retry(f, &buf[off..numbytes], &mut op.stats)
        };
        match res {
            Err(e) => {
                eprintln!("writing to of2, seek={} : {}", op.seek, e);
                return Err(PtddError::Other("write to of2 failed".to_string()));
            }
            Ok(n) => {
                if n > 0 && n < numbytes - off {
                    part = true;
                }
                off += n;
                if is_fifo && n > 0 && off < numbytes {
                    continue;
                }
                break;
            }
        }
    }
    if off >= numbytes {
        if part && op.verbose > 0 {
            eprintln!("write to of2 splintered");
        }
    } else if off > 0 {
        eprintln!(
            "write to of2 fifo problem: count={}, off={}",
            numbytes, off
        );
    }
    if op.verbose > 2 && !part {
        eprintln!("write to of2: count={}, res={}", numbytes, off);
    }
    csp.bytes_of2 = off;
    Ok(())
}

/// Read the destination span back for sparing comparison.
fn readback_output(op: &mut Opts, csp: &mut CopyState, buf2: &mut [u8]) -> PtddResult<()> {
    if op.out_kind.intersects(FileKind::PT) {
        let want = csp.ocbpt;
        let res = {
            let pt = match op.output.as_mut() {
                Some(OutputDst::Pt(p)) => p.as_mut(),
                _ => return Err(PtddError::Other("output endpoint mismatch".to_string())),
            };
            pt.read(&mut buf2[..want * op.obs], want, op.seek)
        };
        if res.status.is_some() || res.blocks != want {
            eprintln!(
                "pt read(sparing) failed, at or after lba={} [0x{:x}]",
                op.seek, op.seek
            );
            return Err(PtddError::Other("sparing read failed".to_string()));
        }
        return Ok(());
    }
    let mut numbytes = csp.ocbpt * op.obs;
    if csp.partial_write_bytes > 0 {
        numbytes += csp.partial_write_bytes;
        if op.verbose > 0 {
            eprintln!(
                "read(sparing): {} bytes extra to fetch due to partial read",
                csp.partial_write_bytes
            );
        }
    }
    let offset = op.seek * op.obs as u64;
    {
        let f = match op.output.as_mut() {
            Some(OutputDst::File(f)) => f,
            _ => return Err(PtddError::Other("output endpoint mismatch".to_string())),
        };
        if offset != csp.of_filepos {
            if op.verbose > 2 {
                eprintln!("moving of filepos: new_pos={}", offset);
            }
            if let Err(e) = f.seek(SeekFrom::Start(offset)) {
                eprintln!(
                    "failed moving of filepos: new_pos={}\nlseek on output: {}",
                    offset, e
                );
                return Err(PtddError::File("lseek on output failed".to_string()));
            }
            csp.of_filepos = offset;
        }
    }
    let res = {
        let f = match op.output.as_mut() {
            Some(OutputDst::File(f)) => f,
            _ => return Err(PtddError::Other("output endpoint mismatch".to_string())),
        };
        read_retry(f, &mut buf2[..numbytes], &mut op.stats)
    };
    if op.verbose > 2 {
        eprintln!(
            "read(sparing): requested bytes={}, res={}",
            numbytes,
            res.as_ref().map(|n| *n as i64).unwrap_or(-1)
        );
    }
    match res {
        Ok(n) if n == numbytes => {
            csp.of_filepos += numbytes as u64;
            Ok(())
        }
        Ok(_) => {
            if op.verbose > 2 {
                eprintln!("short read");
            }
            Err(PtddError::Other("sparing read came up short".to_string()))
        }
        Err(e) => {
            eprintln!("read(sparing), seek={} : {}", op.seek, e);
            Err(PtddError::Other("sparing read failed".to_string()))
        }
    }
}

/// Pass-through output write, with pad policy for a partial tail and the
/// transient-status retry policy.
fn write_output_pt(
    op: &mut Opts,
    csp: &mut CopyState,
    seek_delta: i64,
    blks0: usize,
    buf: &mut [u8],
    at: usize,
    include_partial: bool,
) -> PtddResult<()> {
    if op.oflag.nowrite {
        return Ok(());
    }
    let obs = op.obs;
    let mut blks = blks0;
    let aseek = (op.seek as i64 + seek_delta) as u64;
    if include_partial && csp.partial_write_bytes > 0 {
        if op.oflag.pad {
            let have = blks * obs + csp.partial_write_bytes;
            csp.ocbpt += 1;
            blks += 1;
            let padded = blks * obs;
            buf[at + have..at + padded].fill(0);
            if op.verbose > 1 {
                eprintln!("pt write: padding probable final write at seek={}", aseek);
            }
        } else {
            eprintln!(
                ">>> ignore partial write of {} bytes to pt (unless oflag=pad given)",
                csp.partial_write_bytes
            );
        }
    }
    let mut attempts = 0u32;
    let res = loop {
        let res = {
            let pt = match op.output.as_mut() {
                Some(OutputDst::Pt(p)) => p.as_mut(),
                _ => return Err(PtddError::Other("output endpoint mismatch".to_string())),
            };
            pt.write(&buf[at..at + blks * obs], blks, aseek)
        };
        match res {
            Err(st @ (PtStatus::UnitAttention | PtStatus::AbortedCommand))
                if attempts < op.oflag.retries =>
            {
                attempts += 1;
                op.stats.num_retries += 1;
                if op.verbose > 0 {
                    eprintln!("pt write: {} , retrying", st);
                }
            }
            other => break other,
        }
    };
    match res {
        Err(st) => {
            eprintln!("pt write failed, seek={}", aseek);
            Err(PtddError::Pt(st, format!("pt write failed at seek={}", aseek)))
        }
        Ok(()) => {
            op.stats.out_full += blks as u64;
            csp.bytes_of += blks * obs;
            Ok(())
        }
    }
}

/// Tape output write, honouring nopad and the end-of-medium early-warning
/// retry under ignoreew.
fn write_output_tape(
    op: &mut Opts,
    csp: &mut CopyState,
    buf: &mut [u8],
    could_be_last: bool,
) -> PtddResult<()> {
    if op.oflag.nowrite {
        return Ok(());
    }
    let obs = op.obs;
    let mut blks = csp.ocbpt;
    let mut numbytes = blks * obs;
    let mut partial = false;
    if csp.partial_write_bytes > 0 {
        partial = true;
        numbytes += csp.partial_write_bytes;
        if op.oflag.nopad {
            op.stats.out_partial += 1;
        } else {
            csp.ocbpt += 1;
            blks += 1;
            let padded = blks * obs;
            buf[numbytes..padded].fill(0);
            numbytes = padded;
        }
    }

    let mut got_early_warning = false;
    let res = loop {
        let res = {
            let f = match op.output.as_mut() {
                Some(OutputDst::Tape(f)) => f,
                _ => return Err(PtddError::Other("output endpoint mismatch".to_string())),
            };
            write_retry(f, &buf[..numbytes], &mut op.stats)
        };
        // The Linux st driver answers ENOSPC at the end-of-medium early
        // warning; with ignoreew a retry is allowed and should succeed.
        // Exit on more than one ENOSPC in a row.
        if op.oflag.ignoreew && !got_early_warning {
            if let Err(e) = &res {
                if e.raw_os_error() == Some(libc::ENOSPC) {
                    got_early_warning = true;
                    if !op.printed_ew_message {
                        if op.verbose > 1 {
                            eprintln!(
                                "writing, seek={} : EOM early warning, continuing...",
                                op.seek
                            );
                        }
                        if op.verbose == 2 {
                            eprintln!("(suppressing further early warning messages)");
                            op.printed_ew_message = true;
                        }
                    }
                    continue;
                }
            }
        }
        break res;
    };

    if op.verbose > 2 || (op.verbose > 0 && could_be_last) {
        let padded = if !op.oflag.nopad && partial {
            ", padded"
        } else {
            ""
        };
        eprintln!(
            "write(tape{}{}): requested bytes={}, res={}",
            if partial { ", partial" } else { "" },
            padded,
            numbytes,
            res.as_ref().map(|n| *n as i64).unwrap_or(-1)
        );
    }
    match res {
        Err(e) => {
            eprintln!("writing, seek={} : {}", op.seek, e);
            if is_medium_errno(&e) {
                Err(PtddError::Medium("tape write failed".to_string()))
            } else {
                Err(PtddError::Other("tape write failed".to_string()))
            }
        }
        Ok(n) if n < numbytes => {
            eprintln!("write(tape): wrote less than requested, exit");
            csp.of_filepos += n as u64;
            csp.bytes_of += n;
            op.stats.out_full += (n / obs) as u64;
            // a partial write due to the short write
            if n % obs > 0 {
                op.stats.out_partial += 1;
                op.stats.out_full += 1;
            }
            Err(PtddError::Other("short tape write".to_string()))
        }
        Ok(n) => {
            csp.of_filepos += n as u64;
            csp.bytes_of += n;
            op.stats.out_full += blks as u64;
            Ok(())
        }
    }
}

/// Block-device / regular-file / fifo output write. Seeks only when the
/// tracked position disagrees (and never after a tape short read).
fn write_output_file(
    op: &mut Opts,
    csp: &mut CopyState,
    seek_delta: i64,
    blks0: usize,
    buf: &mut [u8],
    at: usize,
    include_partial: bool,
) -> PtddResult<()> {
    if op.oflag.nowrite {
        return Ok(());
    }
    let obs = op.obs_pi;
    let mut blks = blks0;
    let aseek = (op.seek as i64 + seek_delta) as u64;
    let mut numbytes = blks * obs;
    if include_partial && csp.partial_write_bytes > 0 {
        if op.oflag.pad {
            let have = numbytes + csp.partial_write_bytes;
            csp.ocbpt += 1;
            blks += 1;
            let padded = blks * obs;
            buf[at + have..at + padded].fill(0);
            numbytes = padded;
            if op.verbose > 1 {
                eprintln!("write(unix): padding probable final write at seek={}", aseek);
            }
        } else if op.out_kind.intersects(FileKind::BLOCK) {
            eprintln!(
                ">>> ignore partial write of {} bytes to block device",
                csp.partial_write_bytes
            );
        } else {
            numbytes += csp.partial_write_bytes;
            op.stats.out_partial += 1;
        }
    }
    let offset = aseek * obs as u64;
    if offset != csp.of_filepos && csp.leave_reason != LeaveReason::TapeShortRead {
        if op.verbose > 2 {
            eprintln!("moving of filepos: new_pos={}", offset);
        }
        let f = match op.output.as_mut() {
            Some(OutputDst::File(f)) => f,
            _ => return Ok(()),
        };
        if let Err(e) = f.seek(SeekFrom::Start(offset)) {
            eprintln!(
                "failed moving of filepos: new_pos={}\nlseek on output: {}",
                offset, e
            );
            return Err(PtddError::File("lseek on output failed".to_string()));
        }
        csp.of_filepos = offset;
    }
    // writes to a fifo are non-atomic so loop while making progress
    let is_fifo = op.out_kind.intersects(FileKind::FIFO);
    let mut off = 0usize;
    let mut part = false;
    loop {
        let res = {
            let f = match op.output.as_mut() {
                Some(OutputDst::File(f)) => f,
                _ => return Ok(()),
            };
            write_retry(f, &buf[at + off..at + numbytes], &mut op.stats)
        };
        match res {
            Err(e) => {
                eprintln!("writing, seek={} : {}", aseek, e);
                return if is_medium_errno(&e) {
                    Err(PtddError::Medium(format!("write failed at seek={}", aseek)))
                } else {
                    Err(PtddError::Other(format!("write failed at seek={}", aseek)))
                };
            }
            Ok(n) => {
                if n > 0 && n < numbytes - off {
                    part = true;
                }
                off += n;
                if is_fifo && n > 0 && off < numbytes {
                    continue;
                }
                break;
            }
        }
    }
    if off >= numbytes {
        if part && op.verbose > 0 {
            eprintln!("write to output file splintered");
        }
    } else if off > 0 {
        eprintln!(
            "write to of fifo problem: count={}, off={}",
            numbytes, off
        );
    }
    if op.verbose > 2 && !part {
        eprintln!("write(unix): requested bytes={}, res={}", numbytes, off);
    }
    if off < numbytes {
        eprintln!("output file probably full, seek={}", aseek);
        csp.of_filepos += off as u64;
        csp.bytes_of += off;
        op.stats.out_full += (off / obs) as u64;
        // a partial write due to the short write
        if off % obs > 0 {
            op.stats.out_partial += 1;
            op.stats.out_full += 1;
        }
        return Err(PtddError::Other("output file probably full".to_string()));
    }
    csp.of_filepos += numbytes as u64;
    csp.bytes_of += numbytes;
    op.stats.out_full += blks as u64;
    Ok(())
}

/// Issue WRITE SAME(16) with the UNMAP bit over a zero run; trim failures
/// count but never abort.
fn trim_run(op: &mut Opts, blk: &[u8], blocks: usize, lba: u64) {
    let res = {
        let pt = match op.output.as_mut() {
            Some(OutputDst::Pt(p)) => p.as_mut(),
            _ => return,
        };
        pt.write_same16(&blk[..op.obs], blocks, lba, true)
    };
    if res.is_err() {
        op.stats.trim_errs += 1;
    }
}

/// Write one mismatching byte-run in fine-grained mode. Runs are
/// chunk-aligned; only the run that reaches the end of the transfer may
/// carry a partial tail.
fn emit_run(
    op: &mut Opts,
    csp: &mut CopyState,
    buf: &mut [u8],
    at: usize,
    len: usize,
) -> PtddResult<()> {
    if op.out_kind.intersects(FileKind::DEV_NULL) {
        return Ok(());
    }
    let obs = op.obs;
    if op.out_kind.intersects(FileKind::PT) {
        return write_output_pt(op, csp, (at / obs) as i64, len / obs, buf, at, false);
    }
    if op.oflag.nowrite {
        return Ok(());
    }
    // byte-granular span write for regular/block output; a tail shorter
    // than one block counts as a partial record
    let aseek = op.seek + (at / obs) as u64;
    let offset = aseek * obs as u64;
    {
        let f = match op.output.as_mut() {
            Some(OutputDst::File(f)) => f,
            _ => return Ok(()),
        };
        if offset != csp.of_filepos {
            if op.verbose > 2 {
                eprintln!("moving of filepos: new_pos={}", offset);
            }
            if let Err(e) = f.seek(SeekFrom::Start(offset)) {
                eprintln!(
                    "failed moving of filepos: new_pos={}\nlseek on output: {}",
                    offset, e
                );
                return Err(PtddError::File("lseek on output failed".to_string()));
            }
            csp.of_filepos = offset;
        }
    }
    let res = {
        let f = match op.output.as_mut() {
            Some(OutputDst::File(f)) => f,
            _ => return Ok(()),
        };
        f.write_all(&buf[at..at + len])
    };
    if let Err(e) = res {
        eprintln!("writing, seek={} : {}", aseek, e);
        return if is_medium_errno(&e) {
            Err(PtddError::Medium(format!("write failed at seek={}", aseek)))
        } else {
            Err(PtddError::Other(format!("write failed at seek={}", aseek)))
        };
    }
    csp.of_filepos += len as u64;
    csp.bytes_of += len;
    op.stats.out_full += (len / obs) as u64;
    if len % obs > 0 {
        op.stats.out_partial += 1;
    }
    Ok(())
}

/// Fine-grained comparison: split the transfer into obpc-block chunks and
/// write only the runs of mismatching chunks. Matching chunks count as
/// sparse; with trim allowed, matching (zero) runs are de-allocated via
/// WRITE SAME on a pt output.
fn chunked_compare_write(
    op: &mut Opts,
    csp: &mut CopyState,
    b1: &mut [u8],
    b2: &[u8],
    allow_trim: bool,
) -> PtddResult<()> {
    let oblks = csp.ocbpt;
    let obs = op.obs;
    if op.obpc >= oblks {
        // nothing finer to do: whole transfer at once
        if op.out_kind.intersects(FileKind::DEV_NULL) {
            return Ok(());
        }
        if op.out_kind.intersects(FileKind::PT) {
            return write_output_pt(op, csp, 0, oblks, b1, 0, true);
        }
        return write_output_file(op, csp, 0, oblks, b1, 0, true);
    }
    let mut numbytes = oblks * obs;
    if op.out_kind.intersects(FileKind::REG) && csp.partial_write_bytes > 0 {
        numbytes += csp.partial_write_bytes;
    }
    let chunk = op.obpc * obs;
    let trim_check =
        allow_trim && op.oflag.sparse > 0 && op.oflag.wsame16 && op.out_kind.intersects(FileKind::PT);
    let mut need_wr = false;
    let mut wr_at = 0usize;
    let mut wr_len = 0usize;
    let mut need_tr = false;
    let mut tr_at = 0usize;
    let mut tr_len = 0usize;

    let mut k = 0usize;
    while k < numbytes {
        let n = chunk.min(numbytes - k);
        if b1[k..k + n] == b2[k..k + n] {
            if need_wr {
                emit_run(op, csp, b1, wr_at, wr_len)?;
                need_wr = false;
            }
            if need_tr {
                tr_len += n;
            } else if trim_check {
                need_tr = true;
                tr_len = n;
                tr_at = k;
            }
            op.stats.out_sparse += (n / obs) as u64;
        } else {
            if need_wr {
                wr_len += n;
            } else {
                need_wr = true;
                wr_len = n;
                wr_at = k;
            }
            if need_tr {
                let lba = op.seek + (tr_at / obs) as u64;
                trim_run(op, b2, tr_len / obs, lba);
                need_tr = false;
            }
        }
        k += n;
    }
    if need_wr {
        emit_run(op, csp, b1, wr_at, wr_len)?;
    }
    if need_tr {
        let lba = op.seek + (tr_at / obs) as u64;
        trim_run(op, b2, tr_len / obs, lba);
    }
    Ok(())
}

/// Sparse post-pass for a regular OFILE: when the last blocks were
/// bypassed, settle the file length per the strunc/sparse policy.
fn sparse_finalise(op: &mut Opts, csp: &mut CopyState, zeros: &mut [u8]) {
    let offset = op.seek * op.obs as u64;
    if offset <= csp.of_filepos {
        return;
    }
    if !op.oflag.strunc && op.oflag.sparse > 1 {
        if op.verbose > 1 {
            eprintln!("asked to bypass writing sparse last block zeros");
        }
        return;
    }
    let cur_len = {
        let f = match op.output.as_ref() {
            Some(OutputDst::File(f)) => f,
            _ => return,
        };
        match f.metadata() {
            Ok(md) => md.len(),
            Err(e) => {
                eprintln!("sparse cleanup: fstat: {}", e);
                return;
            }
        }
    };
    if offset == cur_len {
        if op.verbose > 1 {
            eprintln!("sparse cleanup: OFILE already correct length");
        }
        return;
    }
    if offset < cur_len {
        if op.verbose > 1 {
            eprintln!("sparse cleanup: OFILE longer than required, do nothing");
        }
        return;
    }
    if op.oflag.strunc {
        if op.verbose > 1 {
            eprintln!("About to truncate {} to byte offset {}", op.outf, offset);
        }
        let res = match op.output.as_ref() {
            Some(OutputDst::File(f)) => f.set_len(offset),
            _ => return,
        };
        if let Err(e) = res {
            eprintln!("could not ftruncate after copy: {}", e);
        }
    } else if op.oflag.sparse == 1 {
        if op.verbose > 1 {
            eprintln!("writing sparse last block zeros");
        }
        // materialise the tail so the file length is right
        csp.partial_write_bytes = 0;
        if write_output_file(op, csp, -1, 1, zeros, 0, false).is_err() {
            eprintln!(
                "writing sparse last block zeros error, seek={}",
                op.seek - 1
            );
        } else {
            op.stats.out_sparse -= 1;
        }
    }
}

/// posix_fadvise(DONTNEED) hinting after each iteration for nocache.
#[cfg(target_os = "linux")]
fn advise_dontneed(op: &mut Opts, csp: &CopyState) {
    use std::os::unix::io::AsRawFd;

    let in_valid = op.in_kind == FileKind::REG || op.in_kind == FileKind::BLOCK;
    let out_valid = op.out_kind == FileKind::REG || op.out_kind == FileKind::BLOCK;
    let out2_valid = op.out2_kind == FileKind::REG || op.out2_kind == FileKind::BLOCK;
    if op.iflag.nocache > 0 && csp.bytes_read > 0 && in_valid {
        if op.lowest_skip.is_none() || op.skip > op.lowest_skip.unwrap() {
            op.lowest_skip = Some(op.skip);
        }
        if let Some(InputSrc::File(f)) = op.input.as_ref() {
            let low = op.lowest_skip.unwrap();
            let rt = unsafe {
                libc::posix_fadvise(
                    f.as_raw_fd(),
                    (low * op.ibs as u64) as libc::off_t,
                    ((op.skip - low) * op.ibs as u64) as libc::off_t + csp.bytes_read as libc::off_t,
                    libc::POSIX_FADV_DONTNEED,
                )
            };
            if rt != 0 {
                eprintln!("posix_fadvise on read, skip={} , err={}", op.skip, rt);
            }
        }
    }
    if op.oflag.nocache & 2 != 0 && csp.bytes_of2 > 0 && out2_valid {
        if let Some(f) = op.out2.as_ref() {
            let rt =
                unsafe { libc::posix_fadvise(f.as_raw_fd(), 0, 0, libc::POSIX_FADV_DONTNEED) };
            if rt != 0 {
                eprintln!("posix_fadvise on of2, seek={} , err={}", op.seek, rt);
            }
        }
    }
    if op.oflag.nocache & 1 != 0 && csp.bytes_of > 0 && out_valid {
        if op.lowest_seek.is_none() || op.seek > op.lowest_seek.unwrap() {
            op.lowest_seek = Some(op.seek);
        }
        if let Some(OutputDst::File(f)) = op.output.as_ref() {
            let low = op.lowest_seek.unwrap();
            let rt = unsafe {
                libc::posix_fadvise(
                    f.as_raw_fd(),
                    (low * op.obs as u64) as libc::off_t,
                    ((op.seek - low) * op.obs as u64) as libc::off_t + csp.bytes_of as libc::off_t,
                    libc::POSIX_FADV_DONTNEED,
                )
            };
            if rt != 0 {
                eprintln!("posix_fadvise on output, seek={} , err={}", op.seek, rt);
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn advise_dontneed(_op: &mut Opts, _csp: &CopyState) {}

/// The main copy loop: copy dd_count blocks (or a fifo until EOF) in
/// transfers of bpt input blocks.
pub fn run_copy(
    op: &mut Opts,
    broker: &SignalBroker,
    wrk: &mut [u8],
    mut wrk2: Option<&mut [u8]>,
) -> PtddResult<()> {
    let continual_read = op.reading_fifo && op.dd_count < 0;
    if op.verbose > 3 {
        if continual_read {
            eprintln!("copy loop: reading fifo continually");
        } else {
            eprintln!("copy loop: dd_count={}", op.dd_count);
        }
    }
    if op.dd_count <= 0 && !op.reading_fifo {
        return Ok(());
    }
    let ibpt = op.bpt_i;
    let obpt = (op.ibs * op.bpt_i) / op.obs;
    let mut zeros: Vec<u8> = if op.oflag.sparse > 0 {
        vec![0u8; obpt * op.obs]
    } else {
        Vec::new()
    };
    let mut csp = CopyState::default();
    let mut ret: PtddResult<()> = Ok(());

    while op.dd_count > 0 || continual_read {
        csp.bytes_read = 0;
        csp.bytes_of = 0;
        csp.bytes_of2 = 0;
        csp.partial_write_bytes = 0;
        // leave_reason is deliberately not reset: after a tape short
        // read it stays TapeShortRead so later writes keep the tape's
        // own position
        csp.leave_after_write = false;
        let mut sparing_skip = false;
        let mut sparse_skip = false;
        let mut wrote_chunked = false;

        // PLAN
        if op.dd_count >= ibpt as i64 || continual_read {
            csp.icbpt = ibpt;
            csp.ocbpt = obpt;
        } else {
            csp.icbpt = op.dd_count as usize;
            let n = csp.icbpt * op.ibs;
            csp.ocbpt = n / op.obs;
            if n % op.obs != 0 {
                csp.ocbpt += 1;
                // the unused tail must not contribute ghost data
                wrk[..op.ibs * ibpt].fill(0);
            }
        }

        // READ
        broker.drain(op);
        if let Err(e) = read_input(op, &mut csp, wrk) {
            ret = Err(e);
            break;
        }
        if csp.icbpt == 0 {
            // nothing read so leave loop
            break;
        }

        if op.out2.is_some() {
            if let Err(e) = mirror_to_of2(op, &mut csp, wrk) {
                ret = Err(e);
                break;
            }
        }

        // SPARSE compare
        if op.oflag.sparse > 0 {
            let n = csp.ocbpt * op.obs + csp.partial_write_bytes;
            if wrk[..n] == zeros[..n] {
                sparse_skip = true;
                if op.oflag.wsame16 && op.out_kind.intersects(FileKind::PT) {
                    let lba = op.seek;
                    trim_run(op, &zeros, csp.ocbpt, lba);
                }
            } else if op.obpc > 0 {
                if let Err(e) = chunked_compare_write(op, &mut csp, wrk, &zeros, true) {
                    ret = Err(e);
                    break;
                }
                wrote_chunked = true;
            }
        }
        // SPARING compare: read the destination first
        if op.oflag.sparing && !sparse_skip && !wrote_chunked {
            let buf2 = match wrk2.as_deref_mut() {
                Some(b) => b,
                None => {
                    ret = Err(PtddError::Other(
                        "sparing active without a readback buffer".to_string(),
                    ));
                    break;
                }
            };
            if let Err(e) = readback_output(op, &mut csp, buf2) {
                ret = Err(e);
                break;
            }
            let n = csp.ocbpt * op.obs + csp.partial_write_bytes;
            if wrk[..n] == buf2[..n] {
                sparing_skip = true;
            } else if op.obpc > 0 {
                let res = {
                    let b2: &[u8] = buf2;
                    chunked_compare_write(op, &mut csp, wrk, b2, false)
                };
                if let Err(e) = res {
                    ret = Err(e);
                    break;
                }
                wrote_chunked = true;
            }
        }

        // WRITE
        if !wrote_chunked {
            broker.drain(op);
            let could_be_last = !continual_read && csp.icbpt as i64 >= op.dd_count;
            if sparing_skip || sparse_skip {
                op.stats.out_sparse += csp.ocbpt as u64;
                if csp.partial_write_bytes > 0 {
                    op.stats.out_sparse_partial += 1;
                }
            } else {
                let ocbpt = csp.ocbpt;
                let res = if op.out_kind.intersects(FileKind::PT) {
                    write_output_pt(op, &mut csp, 0, ocbpt, wrk, 0, true)
                } else if op.out_kind.intersects(FileKind::DEV_NULL) {
                    Ok(())
                } else if op.out_kind.intersects(FileKind::TAPE) {
                    write_output_tape(op, &mut csp, wrk, could_be_last)
                } else {
                    write_output_file(op, &mut csp, 0, ocbpt, wrk, 0, true)
                };
                if let Err(e) = res {
                    ret = Err(e);
                    break;
                }
            }
        }

        // ADVANCE
        advise_dontneed(op, &csp);
        if op.dd_count > 0 {
            op.dd_count -= csp.icbpt as i64;
        }
        op.skip += csp.icbpt as u64;
        op.seek += csp.ocbpt as u64;
        if csp.leave_after_write {
            if csp.leave_reason == LeaveReason::TapeShortRead {
                // allow multiple partial writes for tape
                csp.partial_write_bytes = 0;
                csp.leave_after_write = false;
            } else {
                ret = match csp.leave_reason {
                    LeaveReason::Eof | LeaveReason::TapeShortRead => Ok(()),
                    LeaveReason::MediumHard => Err(PtddError::Medium(
                        "unrecovered medium error on input".to_string(),
                    )),
                    LeaveReason::Other => {
                        Err(PtddError::Other("error ended the copy".to_string()))
                    }
                };
                break;
            }
        }
    }

    // sparse: settle OFILE length when the last blocks were not written
    if op.out_kind.intersects(FileKind::REG) && !op.oflag.nowrite && op.oflag.sparse > 0 {
        sparse_finalise(op, &mut csp, &mut zeros);
    }

    if !op.out_kind.intersects(
        FileKind::PT | FileKind::DEV_NULL | FileKind::FIFO | FileKind::CHAR | FileKind::TAPE,
    ) {
        if op.oflag.fdatasync {
            let res = match op.output.as_ref() {
                Some(OutputDst::File(f)) => f.sync_data(),
                _ => Ok(()),
            };
            match res {
                Err(e) => eprintln!("fdatasync() error: {}", e),
                Ok(()) => {
                    if op.verbose > 0 {
                        eprintln!("Called fdatasync() on {} successfully", op.outf);
                    }
                }
            }
        } else if op.oflag.fsync {
            let res = match op.output.as_ref() {
                Some(OutputDst::File(f)) => f.sync_all(),
                _ => Ok(()),
            };
            match res {
                Err(e) => eprintln!("fsync() error: {}", e),
                Ok(()) => {
                    if op.verbose > 0 {
                        eprintln!("Called fsync() on {} successfully", op.outf);
                    }
                }
            }
        }
    }
    ret
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_opts() -> Opts {
        Opts {
            ibs: 512,
            obs: 512,
            ibs_pi: 512,
            obs_pi: 512,
            bpt_i: 4,
            ..Default::default()
        }
    }

    #[test]
    fn test_coe_limit_enforced_at_the_limit() {
        let mut op = test_opts();
        op.coe_limit = 2;
        assert!(register_unrecovered(&mut op, 10).is_ok());
        assert!(register_unrecovered(&mut op, 11).is_ok());
        // the third consecutive bad block crosses the limit
        let err = register_unrecovered(&mut op, 12).unwrap_err();
        assert!(matches!(err, PtddError::Medium(_)));
        assert_eq!(op.stats.unrecovered_errs, 2);
    }

    #[test]
    fn test_good_read_resets_consecutive_bad_count() {
        let mut op = test_opts();
        op.coe_limit = 2;
        assert!(register_unrecovered(&mut op, 10).is_ok());
        op.stats.reset_coe_count(op.coe_limit);
        assert!(register_unrecovered(&mut op, 11).is_ok());
        assert!(register_unrecovered(&mut op, 12).is_ok());
        assert_eq!(op.stats.unrecovered_errs, 3);
        assert_eq!(op.stats.lowest_unrecovered, Some(10));
        assert_eq!(op.stats.highest_unrecovered, Some(12));
    }

    #[test]
    fn test_coe_single_block_substitutes_zeros() {
        let mut op = test_opts();
        let mut csp = CopyState {
            icbpt: 1,
            ocbpt: 1,
            ..Default::default()
        };
        let mut buf = vec![0xffu8; 512];
        coe_recover_read(&mut op, &mut csp, &mut buf, Err(libc::EIO)).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
        assert_eq!(op.stats.in_partial, 1);
        assert_eq!(op.stats.unrecovered_errs, 1);
        assert_eq!(csp.bytes_read, 512);
    }

    #[test]
    fn test_coe_eof_leaves_cleanly() {
        let mut op = test_opts();
        let mut csp = CopyState {
            icbpt: 4,
            ocbpt: 4,
            ..Default::default()
        };
        let mut buf = vec![0u8; 2048];
        coe_recover_read(&mut op, &mut csp, &mut buf, Ok(0)).unwrap();
        assert_eq!(csp.icbpt, 0);
        assert!(csp.leave_after_write);
        assert_eq!(csp.leave_reason, LeaveReason::Eof);
    }

    #[test]
    fn test_aligned_buf_alignment_and_zeroing() {
        let buf = AlignedBuf::new(8192, 4096);
        assert_eq!(buf.as_ptr() as usize % 4096, 0);
        assert_eq!(buf.len(), 8192);
        assert!(buf.iter().all(|&b| b == 0));
    }
}
