//
// Copyright (c) 2025-2026 Jeff Garzik
//
// This file is part of the ptdd-rs project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT
//

//! ptdd - copy files and devices, specialised for storage devices
//! reachable through a SCSI pass-through channel. Broadly follows the
//! syntax of dd.

mod blkdev;
mod calc;
mod copy;
mod errblk;
mod error;
mod filetype;
mod opener;
mod options;
mod pt;
mod signals;
mod stats;

use std::process::ExitCode;
use std::time::Instant;

use gettextrs::{bind_textdomain_codeset, gettext, setlocale, textdomain, LocaleCategory};

use crate::calc::CountOutcome;
use crate::copy::AlignedBuf;
use crate::errblk::ErrBlkLog;
use crate::error::{EXIT_CAT_OTHER, EXIT_MEDIUM_HARD, EXIT_PROTECTION, EXIT_SYNTAX};
use crate::filetype::FileKind;
use crate::options::{CliAction, Opts, OutputDst};
use crate::signals::SignalBroker;

fn redirect_stderr_to_null() {
    unsafe {
        let fd = libc::open(
            b"/dev/null\0".as_ptr() as *const libc::c_char,
            libc::O_WRONLY,
        );
        if fd >= 0 {
            libc::dup2(fd, libc::STDERR_FILENO);
            libc::close(fd);
        }
    }
}

/// Before closing a tape OFILE, adjust the filemark/flush behaviour the
/// st driver applies on close:
///   nofm:         write an immediate zero-count filemark (or back-record)
///   nofm & fsync: synchronous zero-count filemark
///   fsync:        nothing, st writes a filemark and flushes on close
///   neither:      immediate one-count filemark when available
#[cfg(target_os = "linux")]
fn tape_close_filemark(op: &Opts) {
    use std::os::unix::io::AsRawFd;

    #[repr(C)]
    struct Mtop {
        mt_op: libc::c_short,
        mt_count: libc::c_int,
    }
    const MTIOCTOP: libc::c_ulong = 0x4008_6d01;
    const MTBSR: libc::c_short = 4;
    const MTWEOF: libc::c_short = 5;
    const MTWEOFI: libc::c_short = 35;

    if !op.out_kind.intersects(FileKind::TAPE) {
        return;
    }
    if !op.oflag.nofm && op.oflag.fsync {
        return;
    }
    let fd = match op.output.as_ref() {
        Some(OutputDst::Tape(f)) => f.as_raw_fd(),
        _ => return,
    };
    let mut cmd = Mtop {
        mt_op: if op.oflag.fsync { MTWEOF } else { MTWEOFI },
        mt_count: if op.oflag.nofm { 0 } else { 1 },
    };
    if unsafe { libc::ioctl(fd, MTIOCTOP, &cmd) } != 0 {
        if op.verbose > 0 {
            eprintln!(
                "MTWEOF{} {} failed: {}",
                if op.oflag.fsync { "" } else { "I" },
                cmd.mt_count,
                std::io::Error::last_os_error()
            );
        }
        if op.oflag.nofm && !op.oflag.fsync {
            if op.verbose > 0 {
                eprintln!("Trying MTBSR 0 instead");
            }
            cmd.mt_op = MTBSR;
            cmd.mt_count = 0;
            if unsafe { libc::ioctl(fd, MTIOCTOP, &cmd) } != 0 {
                eprintln!(
                    "MTBSR 0 failed: {}\n(Filemark will be written when tape file is closed)",
                    std::io::Error::last_os_error()
                );
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn tape_close_filemark(_op: &Opts) {}

/// Try to pre-allocate space in the output file. On Linux, prefer
/// FALLOC_FL_KEEP_SIZE, which does not change the apparent file size so
/// oflag=resume stays usable; fall back to a size-changing allocation on
/// kernels without it. Elsewhere posix_fallocate() sets the file to its
/// full length, which defeats a later resume.
fn preallocate_output(op: &mut Opts) -> Result<(), u8> {
    use std::os::unix::io::AsRawFd;

    if op.dd_count <= 0 {
        return Ok(());
    }
    let fd = match op.output.as_ref() {
        Some(OutputDst::File(f)) => f.as_raw_fd(),
        _ => return Ok(()),
    };
    let offset = (op.obs as i64) * (op.seek as i64);
    let len = (op.obs as i64) * op.dd_count;
    #[cfg(target_os = "linux")]
    {
        let mut res = unsafe {
            libc::fallocate(fd, libc::FALLOC_FL_KEEP_SIZE, offset, len)
        };
        if res == -1 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno == libc::ENOTTY || errno == libc::EINVAL || errno == libc::EOPNOTSUPP {
                if op.verbose > 0 {
                    eprintln!(
                        "Could not pre-allocate with FALLOC_FL_KEEP_SIZE ({}), retrying without...",
                        std::io::Error::last_os_error()
                    );
                }
                res = unsafe { libc::fallocate(fd, 0, offset, len) };
            }
        } else {
            // the apparent size is unchanged, so the resume hint stays
            // valid; clear the flag that would suppress it
            op.oflag.prealloc = false;
        }
        if res == -1 {
            eprintln!(
                "Unable to pre-allocate space: {}",
                std::io::Error::last_os_error()
            );
            return Err(EXIT_CAT_OTHER);
        }
    }
    #[cfg(all(unix, not(target_os = "linux"), not(target_os = "macos")))]
    {
        let res = unsafe { libc::posix_fallocate(fd, offset, len) };
        if res != 0 {
            eprintln!(
                "Unable to pre-allocate space: {}",
                std::io::Error::from_raw_os_error(res)
            );
            return Err(EXIT_CAT_OTHER);
        }
    }
    #[cfg(target_os = "macos")]
    {
        let _ = fd;
        eprintln!("pre-alloc not supported on this platform, ignore");
        return Ok(());
    }
    if op.verbose > 1 {
        eprintln!("Pre-allocated {} bytes at offset {}", len, offset);
    }
    Ok(())
}

fn run(op: &mut Opts) -> u8 {
    if op.quiet {
        redirect_stderr_to_null();
    }
    let broker = SignalBroker::install(op.verbose, op.interrupt_io);
    if op.verbose > 1 {
        eprintln!(
            " >> {}masking signals during IO",
            if op.interrupt_io { "not " } else { "" }
        );
    }

    if op.inf.is_empty() {
        eprintln!(
            "{}",
            gettext("'if=IFILE' option must be given. For stdin as input use 'if=-'")
        );
        eprintln!("For more information use '--help'");
        return EXIT_SYNTAX;
    }
    if let Err(e) = opener::open_input(op) {
        eprintln!("ptdd: {}", e);
        return e.exit_code();
    }
    if op.outf.is_empty() {
        // treat a missing 'of=OFILE' as the null sink
        op.outf = ".".to_string();
    }
    if let Err(e) = opener::open_output(op) {
        eprintln!("ptdd: {}", e);
        return e.exit_code();
    }
    if let Err(e) = opener::open_output2(op) {
        eprintln!("ptdd: {}", e);
        return e.exit_code();
    }

    // with tape on either side default bpt to 1, avoiding accidental use
    // of the wrong tape block size
    if !op.bpt_given
        && (op.in_kind.intersects(FileKind::TAPE) || op.out_kind.intersects(FileKind::TAPE))
    {
        op.bpt_i = 1;
    }

    if op.iflag.sparse > 0 && op.oflag.sparse == 0 {
        if op.out_kind.intersects(FileKind::DEV_NULL) {
            eprintln!(
                "{}",
                gettext("sparse flag usually ignored on input; set it on output in this case")
            );
            op.oflag.sparse += 1;
        } else {
            eprintln!("{}", gettext("sparse flag ignored on input"));
        }
    }
    if op.oflag.sparse > 0 {
        if op.out_kind.intersects(FileKind::FIFO | FileKind::TAPE) {
            eprintln!("{}", gettext("oflag=sparse needs seekable output file, ignore"));
            op.oflag.sparse = 0;
        } else {
            op.out_sparse_active = true;
            if op.oflag.wsame16 {
                op.out_trim_active = true;
            }
        }
    }
    if op.oflag.sparing {
        if op
            .out_kind
            .intersects(FileKind::DEV_NULL | FileKind::FIFO | FileKind::TAPE)
        {
            eprintln!(
                "{}",
                gettext("oflag=sparing needs a readable and seekable output file, ignore")
            );
            op.oflag.sparing = false;
        } else {
            op.out_sparing_active = true;
        }
    }

    match calc::count_calculate(op) {
        Err(e) => {
            if op.verbose > 0 {
                eprintln!("count_calculate() failed, exit");
            }
            eprintln!("ptdd: {}", e);
            return e.exit_code();
        }
        Ok(CountOutcome::AlreadyComplete) => return 0,
        Ok(CountOutcome::Proceed) => (),
    }

    // protection information inflates the block sizes actually moved
    op.ibs_pi = op.ibs;
    op.obs_pi = op.obs;
    if op.rdprotect > 0 {
        if op.rdprot_typ == 0 || !op.in_kind.intersects(FileKind::PT) {
            eprintln!(
                "{}",
                gettext("IFILE is not a pt device or doesn't have protection information")
            );
            return EXIT_CAT_OTHER;
        }
        if op.ibs != op.obs {
            eprintln!(
                "{}",
                gettext("protect: don't support IFILE and OFILE with different block sizes")
            );
            return EXIT_CAT_OTHER;
        }
        if op.wrprotect > 0 && op.rdp_i_exp != op.wrp_i_exp {
            eprintln!(
                "{}",
                gettext("Don't support IFILE and OFILE with different P_I_EXP fields")
            );
            return EXIT_CAT_OTHER;
        }
        let extra = (if op.rdp_i_exp > 0 { 1usize << op.rdp_i_exp } else { 1 }) * 8;
        op.ibs_pi += extra;
        op.obs_pi += extra;
    }
    if op.wrprotect > 0 {
        if op.wrprot_typ == 0 || !op.out_kind.intersects(FileKind::PT) {
            eprintln!(
                "{}",
                gettext("OFILE is not a pt device or doesn't have protection information")
            );
            return EXIT_CAT_OTHER;
        }
        if op.ibs != op.obs {
            eprintln!(
                "{}",
                gettext("protect: don't support IFILE and OFILE with different block sizes")
            );
            return EXIT_CAT_OTHER;
        }
        let extra = (if op.wrp_i_exp > 0 { 1usize << op.wrp_i_exp } else { 1 }) * 8;
        op.ibs_pi += extra;
        op.obs_pi += extra;
    }

    if op.dd_count < 0 && !op.reading_fifo {
        eprintln!("{}", gettext("Couldn't calculate count, please give one"));
        return EXIT_CAT_OTHER;
    }

    if op.oflag.prealloc
        && op.out_kind.intersects(
            FileKind::DEV_NULL | FileKind::FIFO | FileKind::TAPE | FileKind::PT,
        )
    {
        eprintln!("{}", gettext("oflag=pre-alloc needs a normal output file, ignore"));
        op.oflag.prealloc = false;
    }

    // auto-promote the CDB size when the offsets or counts overflow the
    // 32-bit lba / 16-bit count fields of the 10 byte commands
    if !op.cdbsz_given {
        if op.in_kind.intersects(FileKind::PT)
            && op.iflag.cdbsz < 16
            && ((op.dd_count > 0 && op.dd_count as u64 + op.skip > u32::MAX as u64)
                || op.bpt_i > u16::MAX as usize)
        {
            if op.verbose > 0 {
                eprintln!("SCSI command size increased from 10 to 16 bytes on {}", op.inf);
            }
            op.iflag.cdbsz = 16;
        }
        if op.out_kind.intersects(FileKind::PT)
            && op.oflag.cdbsz < 16
            && ((op.dd_count > 0 && op.dd_count as u64 + op.seek > u32::MAX as u64)
                || (op.ibs * op.bpt_i) / op.obs > u16::MAX as usize)
        {
            if op.verbose > 0 {
                eprintln!("SCSI command size increased from 10 to 16 bytes on {}", op.outf);
            }
            op.oflag.cdbsz = 16;
        }
    }

    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) }.max(512) as usize;
    let align = if op.iflag.direct || op.oflag.direct {
        page
    } else {
        8
    };
    let mut wrk = AlignedBuf::new(op.ibs_pi * op.bpt_i, align);
    let mut wrk2 = if op.oflag.sparing {
        Some(AlignedBuf::new(op.ibs_pi * op.bpt_i, align))
    } else {
        None
    };

    if op.verbose > 0 {
        eprintln!(
            "skip={} (blocks on input), seek={} (blocks on output)",
            op.skip, op.seek
        );
        if op.verbose > 1 {
            eprintln!(
                "  ibs={} bytes, obs={} bytes, OBPC={}",
                op.ibs, op.obs, op.obpc
            );
            if op.ibs != op.ibs_pi {
                eprintln!(
                    "  due to protect ibs_pi={} bytes, obs_pi={} bytes",
                    op.ibs_pi, op.obs_pi
                );
            }
        }
        if op.reading_fifo && op.dd_count < 0 {
            eprintln!("  reading fifo, blocks_per_transfer={}", op.bpt_i);
        } else {
            eprintln!(
                "  initial count={} (blocks of input), blocks_per_transfer={}",
                op.dd_count, op.bpt_i
            );
        }
    }
    op.read1_or_transfer = op.out_kind.intersects(FileKind::DEV_NULL);
    if op.read1_or_transfer && !op.outf_given && (op.dd_count > 0 || op.reading_fifo) {
        eprintln!(
            "{}",
            gettext("Output file not specified so no copy, just reading input")
        );
    }

    if op.do_time {
        op.stats.start = Some(Instant::now());
    }
    if op.iflag.errblk {
        op.errblk = ErrBlkLog::open();
    }
    if op.oflag.prealloc {
        if let Err(code) = preallocate_output(op) {
            return code;
        }
    }

    let copy_res = copy::run_copy(
        op,
        &broker,
        &mut wrk,
        wrk2.as_mut().map(|b| &mut b[..]),
    );

    if let Some(log) = op.errblk.take() {
        log.close();
    }
    stats::print_stats("", op);
    if op.out_kind.intersects(FileKind::TAPE) && op.verbose > 1 && op.oflag.nofm {
        eprintln!("(suppressing writing of filemark on close)");
    }
    if op.do_time {
        stats::print_throughput("", false, op);
    }

    if op.oflag.ssync && op.out_kind.intersects(FileKind::PT) {
        eprintln!(">> SCSI synchronizing cache on {}", op.outf);
        if let Some(OutputDst::Pt(p)) = op.output.as_mut() {
            if let Err(st) = p.sync_cache() {
                eprintln!("synchronize cache failed: {}", st);
            }
        }
    }
    tape_close_filemark(op);

    let mut code = match &copy_res {
        Ok(()) => 0,
        // per-site messages have already been printed
        Err(e) => e.exit_code(),
    };
    if code == 0 {
        if let Some(held) = op.err_to_report {
            code = held;
        }
    }
    if op.dd_count != 0 && !op.reading_fifo {
        if code == 0 {
            eprintln!("Early termination, EOF on input?");
        } else if code == EXIT_MEDIUM_HARD {
            eprintln!("Early termination, medium error occurred");
        } else if code == EXIT_PROTECTION {
            eprintln!("Early termination, protection information error occurred");
        } else {
            eprintln!("Early termination, some error occurred");
        }
    }
    code
}

fn main() -> ExitCode {
    setlocale(LocaleCategory::LcAll, "");
    let _ = textdomain("ptdd");
    let _ = bind_textdomain_codeset("ptdd", "UTF-8");

    let args: Vec<String> = std::env::args().skip(1).collect();
    match options::parse_cmdline(&args) {
        Err(e) => {
            eprintln!("ptdd: {}", e);
            eprintln!("For more information use '--help'");
            ExitCode::from(e.exit_code())
        }
        Ok(CliAction::Help) => {
            options::usage();
            ExitCode::SUCCESS
        }
        Ok(CliAction::Version) => {
            eprintln!("ptdd version {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        Ok(CliAction::Run(mut op)) => ExitCode::from(run(&mut op)),
    }
}
