//
// Copyright (c) 2025-2026 Jeff Garzik
//
// This file is part of the ptdd-rs project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT
//

//! Capacity / count calculation
//!
//! Reconciles device capacities, file sizes, skip/seek and user limits
//! into the final dd_count, and applies the resume adjustment.

use gettextrs::gettext;

use crate::blkdev;
use crate::error::{PtddError, PtddResult};
use crate::filetype::FileKind;
use crate::options::{InputSrc, Opts, OutputDst};
use crate::pt::PtStatus;

/// Whether the copy should run at all after count resolution.
#[derive(Debug, PartialEq, Eq)]
pub enum CountOutcome {
    Proceed,
    /// resume found nothing left to do
    AlreadyComplete,
}

/// Blocks and block size, with the total shown in decimal MB/GB/TB when
/// large enough.
fn print_blk_sizes(fname: &str, access: &str, num_sect: u64, sect_sz: usize) {
    let bytes = num_sect.saturating_mul(sect_sz as u64);
    let mb = bytes / 1_000_000;
    if mb > 999_999 {
        eprintln!(
            "  {} [{}]: blocks={} [0x{:x}], _bs={}, {:.2} TB",
            fname,
            access,
            num_sect,
            num_sect,
            sect_sz,
            bytes as f64 / 1e12
        );
    } else if mb > 999 {
        eprintln!(
            "  {} [{}]: blocks={} [0x{:x}], _bs={}, {:.2} GB",
            fname,
            access,
            num_sect,
            num_sect,
            sect_sz,
            bytes as f64 / 1e9
        );
    } else if mb > 0 {
        eprintln!(
            "  {} [{}]: blocks={} [0x{:x}], _bs={}, {} MB{}",
            fname,
            access,
            num_sect,
            num_sect,
            sect_sz,
            mb,
            if mb < 10 { " approx" } else { "" }
        );
    } else {
        eprintln!(
            "  {} [{}]: blocks={} [0x{:x}], _bs={}",
            fname, access, num_sect, num_sect, sect_sz
        );
    }
}

/// READ CAPACITY with the one-retry policy on unit attention and aborted
/// command.
fn pt_capacity(
    pt: &mut dyn crate::pt::PassThrough,
    which: &str,
) -> Result<(u64, usize), PtStatus> {
    match pt.read_capacity() {
        Ok(v) => Ok(v),
        Err(PtStatus::UnitAttention) => {
            eprintln!("Unit attention (readcap {}), continuing", which);
            pt.read_capacity()
        }
        Err(PtStatus::AbortedCommand) => {
            eprintln!("Aborted command (readcap {}), continuing", which);
            pt.read_capacity()
        }
        Err(e) => Err(e),
    }
}

fn readcap_error(path: &str, status: PtStatus) -> PtddError {
    let msg = match status {
        PtStatus::InvalidOp => format!("read capacity not supported on {}", path),
        PtStatus::NotReady => format!("read capacity failed on {} - not ready", path),
        _ => format!("Unable to read capacity on {}", path),
    };
    PtddError::Pt(status, msg)
}

/// Size IFILE in ibs-sized blocks, when it can be sized.
fn size_input(op: &mut Opts) -> PtddResult<Option<u64>> {
    let in_kind = op.in_kind;
    if in_kind.intersects(FileKind::PT) {
        if op.iflag.norcap {
            if in_kind.intersects(FileKind::BLOCK) && !op.iflag.force {
                eprintln!(">> warning: norcap on input block device accessed via pt is risky.");
                return Err(PtddError::Other(
                    "Abort copy, use iflag=force to override".to_string(),
                ));
            }
            return Ok(None);
        }
        let (num_sect, sect_sz) = {
            let pt = match op.input.as_mut() {
                Some(InputSrc::Pt(p)) => p.as_mut(),
                _ => return Ok(None),
            };
            match pt_capacity(pt, "in") {
                Ok(v) => v,
                Err(status) => return Err(readcap_error(&op.inf, status)),
            }
        };
        if op.verbose > 0 {
            print_blk_sizes(&op.inf, "pt", num_sect, sect_sz);
        }
        if num_sect > 0 && sect_sz != op.ibs {
            eprintln!(
                ">> warning: {} block size confusion: ibs={}, device claims={}",
                op.inf, op.ibs, sect_sz
            );
            if !op.iflag.force {
                return Err(PtddError::Other(
                    "abort copy, use iflag=force to override".to_string(),
                ));
            }
        }
        if in_kind.intersects(FileKind::BLOCK) && !op.iflag.force {
            let kernel_view = match op.input.as_ref() {
                Some(InputSrc::Pt(p)) => p.raw_fd().and_then(|fd| blkdev::capacity_fd(fd).ok()),
                _ => None,
            };
            if let Some((k_sect, k_sz)) = kernel_view {
                if num_sect * sect_sz as u64 != k_sect * k_sz as u64 {
                    eprintln!(
                        ">> warning: size of input block device is different from pt size.\n\
                         >> Pass-through on block partition can give unexpected offsets."
                    );
                    return Err(PtddError::Other(
                        "Abort copy, use iflag=force to override".to_string(),
                    ));
                }
            }
        }
        return Ok(Some(num_sect));
    }
    if op.dd_count > 0 && !op.oflag.resume {
        return Ok(None);
    }
    if in_kind.intersects(FileKind::BLOCK) {
        let cap = match op.input.as_ref() {
            Some(InputSrc::File(f)) => blkdev::capacity(f),
            _ => return Ok(None),
        };
        let (num_sect, sect_sz) = match cap {
            Ok(v) => v,
            Err(_) => {
                eprintln!("{} {}", gettext("Unable to read block capacity on"), op.inf);
                return Ok(None);
            }
        };
        if op.verbose > 0 {
            print_blk_sizes(&op.inf, "blk", num_sect, sect_sz);
        }
        if num_sect > 0 && op.ibs != sect_sz {
            eprintln!(
                ">> warning: {} block size confusion: bs={}, device claims={}",
                op.inf, op.ibs, sect_sz
            );
            return Ok(None);
        }
        return Ok(Some(num_sect));
    }
    if in_kind.intersects(FileKind::REG) {
        let len = match op.input.as_ref() {
            Some(InputSrc::File(f)) => match f.metadata() {
                Ok(md) => md.len(),
                Err(e) => {
                    eprintln!("fstat on input: {}", e);
                    return Ok(None);
                }
            },
            _ => return Ok(None),
        };
        let mut num_sect = len / op.ibs as u64;
        let res = len % op.ibs as u64;
        if op.verbose > 0 {
            print_blk_sizes(&op.inf, "reg", num_sect, op.ibs);
            if res > 0 {
                eprintln!("    residual_bytes={}", res);
            }
        }
        // tail accounted as one partial block
        if res > 0 {
            num_sect += 1;
        }
        return Ok(Some(num_sect));
    }
    Ok(None)
}

/// Size OFILE in obs-sized blocks, when it can be sized.
fn size_output(op: &mut Opts) -> PtddResult<Option<u64>> {
    let out_kind = op.out_kind;
    if out_kind.intersects(FileKind::PT) {
        if op.oflag.norcap {
            if out_kind.intersects(FileKind::BLOCK) && !op.oflag.force {
                eprintln!(">> warning: norcap on output block device accessed via pt is risky.");
                return Err(PtddError::Other(
                    "Abort copy, use oflag=force to override".to_string(),
                ));
            }
            return Ok(None);
        }
        let (num_sect, sect_sz) = {
            let pt = match op.output.as_mut() {
                Some(OutputDst::Pt(p)) => p.as_mut(),
                _ => return Ok(None),
            };
            match pt_capacity(pt, "out") {
                Ok(v) => v,
                Err(status) => return Err(readcap_error(&op.outf, status)),
            }
        };
        if op.verbose > 0 {
            print_blk_sizes(&op.outf, "pt", num_sect, sect_sz);
        }
        if num_sect > 0 && op.obs != sect_sz {
            eprintln!(
                ">> warning: {} block size confusion: obs={}, device claims={}",
                op.outf, op.obs, sect_sz
            );
            if !op.oflag.force {
                return Err(PtddError::Other(
                    "abort copy, use oflag=force to override".to_string(),
                ));
            }
        }
        if out_kind.intersects(FileKind::BLOCK) && !op.oflag.force {
            let kernel_view = match op.output.as_ref() {
                Some(OutputDst::Pt(p)) => p.raw_fd().and_then(|fd| blkdev::capacity_fd(fd).ok()),
                _ => None,
            };
            if let Some((k_sect, k_sz)) = kernel_view {
                if num_sect * sect_sz as u64 != k_sect * k_sz as u64 {
                    eprintln!(
                        ">> warning: size of output block device is different from pt size.\n\
                         >> Pass-through on block partition can give unexpected results."
                    );
                    return Err(PtddError::Other(
                        "abort copy, use oflag=force to override".to_string(),
                    ));
                }
            }
        }
        return Ok(Some(num_sect));
    }
    if op.dd_count > 0 && !op.oflag.resume {
        return Ok(None);
    }
    if out_kind.intersects(FileKind::BLOCK) {
        let cap = match op.output.as_ref() {
            Some(OutputDst::File(f)) => blkdev::capacity(f),
            _ => return Ok(None),
        };
        let (num_sect, sect_sz) = match cap {
            Ok(v) => v,
            Err(_) => {
                eprintln!(
                    "{} {}",
                    gettext("Unable to read block capacity on"),
                    op.outf
                );
                return Ok(None);
            }
        };
        if op.verbose > 0 {
            print_blk_sizes(&op.outf, "blk", num_sect, sect_sz);
        }
        if num_sect > 0 && op.obs != sect_sz {
            eprintln!(
                ">> warning: {} block size confusion: obs={}, device claims={}",
                op.outf, op.obs, sect_sz
            );
            return Ok(None);
        }
        return Ok(Some(num_sect));
    }
    if out_kind.intersects(FileKind::REG) {
        let len = match op.output.as_ref() {
            Some(OutputDst::File(f)) => match f.metadata() {
                Ok(md) => md.len(),
                Err(e) => {
                    eprintln!("fstat on output: {}", e);
                    return Ok(None);
                }
            },
            _ => return Ok(None),
        };
        let mut num_sect = len / op.obs as u64;
        let res = len % op.obs as u64;
        if op.verbose > 0 {
            print_blk_sizes(&op.outf, "reg", num_sect, op.obs);
            if res > 0 {
                eprintln!("    residual_bytes={}", res);
            }
        }
        if res > 0 {
            num_sect += 1;
        }
        return Ok(Some(num_sect));
    }
    Ok(None)
}

/// Resolve the final dd_count from endpoint sizes and user limits, and
/// apply the resume adjustment when asked for.
pub fn count_calculate(op: &mut Opts) -> PtddResult<CountOutcome> {
    let in_num_sect = size_input(op)?;
    let out_num_sect = size_output(op)?;
    if !op.oflag.resume && op.dd_count > 0 {
        return Ok(CountOutcome::Proceed);
    }
    if op.verbose > 1 {
        eprintln!(
            "count_calculate: in_num_sect={}, out_num_sect={}",
            in_num_sect.map_or(-1, |v| v as i64),
            out_num_sect.map_or(-1, |v| v as i64)
        );
    }
    if op.skip > 0 && op.in_kind == FileKind::REG {
        if let Some(in_sect) = in_num_sect {
            if op.skip > in_sect {
                return Err(PtddError::Other(format!(
                    "{} {}",
                    gettext("cannot skip to specified offset on"),
                    op.inf
                )));
            }
        }
    }

    let mut valid_resume = false;
    if op.oflag.resume {
        if op.out_kind == FileKind::REG {
            if out_num_sect.is_none() {
                eprintln!("{}", gettext("resume cannot determine size of OFILE, ignore"));
            } else {
                valid_resume = true;
            }
        } else {
            eprintln!("{}", gettext("resume expects OFILE to be regular, ignore"));
        }
    }

    if op.dd_count < 0 && !valid_resume {
        // scale back by skip and seek, then pick the smaller side in bytes
        let in_avail = in_num_sect.map(|n| if op.skip > 0 && n > op.skip { n - op.skip } else { n });
        let out_avail =
            out_num_sect.map(|n| if op.seek > 0 && n > op.seek { n - op.seek } else { n });
        match (in_avail, out_avail) {
            (Some(i), None) if i > 0 => op.dd_count = i as i64,
            (_, None) => (),
            (in_a, Some(o)) => {
                let ibytes = in_a.unwrap_or(0) * op.ibs as u64;
                let obytes = o * op.obs as u64;
                if ibytes == 0 {
                    // an unsizable non-fifo input can still be bounded by
                    // the output; a fifo keeps reading until EOF
                    if !op.reading_fifo {
                        op.dd_count = (obytes / op.ibs as u64) as i64;
                    }
                } else if ibytes > obytes && op.out_kind != FileKind::REG {
                    op.dd_count = (obytes / op.ibs as u64) as i64;
                } else {
                    op.dd_count = in_a.unwrap_or(0) as i64;
                }
            }
        }
    }

    if valid_resume {
        let out_sect = out_num_sect.unwrap_or(0);
        if op.dd_count < 0 {
            op.dd_count = in_num_sect.unwrap_or(0).saturating_sub(op.skip) as i64;
        }
        if out_sect <= op.seek {
            eprintln!("{}", gettext("resume finds no previous copy, restarting"));
        } else {
            let obytes = op.obs as u64 * (out_sect - op.seek);
            let mut ibk = obytes / op.ibs as u64;
            if ibk as i64 >= op.dd_count {
                eprintln!("{}", gettext("resume finds copy complete, exiting"));
                op.dd_count = 0;
                return Ok(CountOutcome::AlreadyComplete);
            }
            // align to a whole bpt multiple
            ibk = (ibk / op.bpt_i as u64) * op.bpt_i as u64;
            op.skip += ibk;
            op.seek += (ibk * op.ibs as u64) / op.obs as u64;
            op.dd_count -= ibk as i64;
            eprintln!(
                "resume adjusting skip={}, seek={}, and count={}",
                op.skip, op.seek, op.dd_count
            );
        }
    }
    Ok(CountOutcome::Proceed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opener;
    use std::io::Write;

    fn reg_pair(in_len: usize, out_len: Option<usize>) -> (Opts, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let mut f = std::fs::File::create(&src).unwrap();
        f.write_all(&vec![0u8; in_len]).unwrap();
        let outf = match out_len {
            Some(n) => {
                let dst = dir.path().join("dst");
                std::fs::write(&dst, vec![0u8; n]).unwrap();
                dst.to_str().unwrap().to_string()
            }
            None => dir.path().join("dst").to_str().unwrap().to_string(),
        };
        let mut op = Opts {
            inf: src.to_str().unwrap().to_string(),
            outf,
            ibs: 512,
            obs: 512,
            ibs_pi: 512,
            obs_pi: 512,
            bpt_i: 4,
            ..Default::default()
        };
        opener::open_input(&mut op).unwrap();
        opener::open_output(&mut op).unwrap();
        (op, dir)
    }

    #[test]
    fn test_count_derived_from_input_size() {
        let (mut op, _dir) = reg_pair(512 * 10, None);
        assert_eq!(count_calculate(&mut op).unwrap(), CountOutcome::Proceed);
        assert_eq!(op.dd_count, 10);
    }

    #[test]
    fn test_partial_tail_counts_one_block() {
        let (mut op, _dir) = reg_pair(512 * 10 + 100, None);
        count_calculate(&mut op).unwrap();
        assert_eq!(op.dd_count, 11);
    }

    #[test]
    fn test_skip_reduces_count() {
        let (mut op, _dir) = reg_pair(512 * 10, None);
        op.skip = 4;
        count_calculate(&mut op).unwrap();
        assert_eq!(op.dd_count, 6);
    }

    #[test]
    fn test_skip_past_end_rejected() {
        let (mut op, _dir) = reg_pair(512 * 4, None);
        op.skip = 10;
        assert!(count_calculate(&mut op).is_err());
    }

    #[test]
    fn test_explicit_count_kept() {
        let (mut op, _dir) = reg_pair(512 * 100, None);
        op.dd_count = 7;
        count_calculate(&mut op).unwrap();
        assert_eq!(op.dd_count, 7);
    }

    #[test]
    fn test_resume_advances_by_bpt_multiples() {
        // dst already holds 41 blocks of a 100 block copy; bpt=4 so the
        // restart point rounds down to 40
        let (mut op, _dir) = reg_pair(512 * 100, Some(512 * 41));
        op.oflag.resume = true;
        count_calculate(&mut op).unwrap();
        assert_eq!(op.skip, 40);
        assert_eq!(op.seek, 40);
        assert_eq!(op.dd_count, 60);
    }

    #[test]
    fn test_resume_complete_short_circuits() {
        let (mut op, _dir) = reg_pair(512 * 10, Some(512 * 10));
        op.oflag.resume = true;
        assert_eq!(
            count_calculate(&mut op).unwrap(),
            CountOutcome::AlreadyComplete
        );
        assert_eq!(op.dd_count, 0);
    }

    #[test]
    fn test_resume_with_empty_output_restarts() {
        let (mut op, _dir) = reg_pair(512 * 10, Some(0));
        op.oflag.resume = true;
        count_calculate(&mut op).unwrap();
        assert_eq!(op.skip, 0);
        assert_eq!(op.dd_count, 10);
    }
}
