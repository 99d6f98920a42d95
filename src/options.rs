//
// Copyright (c) 2025-2026 Jeff Garzik
//
// This file is part of the ptdd-rs project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT
//

//! Option records and command line processing
//!
//! The command line is dd-style: order-independent `key=value` operands
//! plus a handful of long options. Parsed values land in one process-wide
//! `Opts` record that the rest of the engine reads (and whose counters it
//! updates) for the duration of the run.

use std::fs::File;

use gettextrs::gettext;

use crate::errblk::ErrBlkLog;
use crate::error::{PtddError, PtddResult};
use crate::filetype::FileKind;
use crate::pt::PassThrough;
use crate::stats::Stats;

pub const DEF_BLOCK_SIZE: usize = 512;
pub const DEF_SCSI_CDBSZ: u8 = 10;

/// Default input blocks-per-transfer, by input block size
pub fn default_bpt(ibs: usize) -> usize {
    if ibs < 8 {
        8192
    } else if ibs < 64 {
        1024
    } else if ibs < 1024 {
        128
    } else if ibs < 8192 {
        16
    } else if ibs < 32768 {
        4
    } else {
        1
    }
}

/// Per-side flag vector (iflag= / oflag= plus conv= shortcuts)
#[derive(Debug, Clone, Default)]
pub struct Flags {
    pub append: bool,
    pub cdbsz: u8,
    pub coe: bool,
    pub direct: bool,
    pub dpo: bool,
    pub errblk: bool,
    pub excl: bool,
    pub fdatasync: bool,
    pub flock: bool,
    pub force: bool,
    pub fsync: bool,
    pub fua: bool,
    pub fua_nv: bool,
    pub ignoreew: bool,
    /// counts occurrences: on output, 1 hints OFILE, 2 hints OFILE2 as well
    pub nocache: u8,
    pub nofm: bool,
    pub nopad: bool,
    pub norcap: bool,
    pub nowrite: bool,
    pub pad: bool,
    pub prealloc: bool,
    pub pt: bool,
    pub rarc: bool,
    pub resume: bool,
    pub retries: u32,
    pub self_copy: bool,
    pub sparing: bool,
    /// 0 off; 1 materialise the tail; 2+ leave holes at the tail
    pub sparse: u8,
    pub ssync: bool,
    pub strunc: bool,
    pub sync: bool,
    pub trunc: bool,
    pub wsame16: bool,
}

/// Opened input endpoint, tagged by the read algorithm it needs
pub enum InputSrc {
    Pt(Box<dyn PassThrough>),
    Fifo(File),
    Tape(File),
    /// block device, regular file or char device
    File(File),
}

/// Opened output endpoint
pub enum OutputDst {
    Null,
    Pt(Box<dyn PassThrough>),
    Tape(File),
    /// block device, regular file or fifo
    File(File),
}

/// Process-wide option record: user-selected parameters plus the mutable
/// state of the run.
pub struct Opts {
    // block and batch sizes
    pub ibs: usize,
    pub obs: usize,
    /// block sizes inflated by protection-information bytes
    pub ibs_pi: usize,
    pub obs_pi: usize,
    /// ibs as given, stable across protection adjustment (throughput math)
    pub ibs_hold: usize,
    pub bpt_i: usize,
    /// output blocks per fine-grained sparse/sparing check; 0 = whole
    /// transfer at once
    pub obpc: usize,

    // positions, in block units
    pub skip: u64,
    pub seek: u64,
    /// remaining input blocks; -1 means derive from capacities
    pub dd_count: i64,

    // endpoints
    pub inf: String,
    pub outf: String,
    pub out2f: String,
    pub in_kind: FileKind,
    pub out_kind: FileKind,
    pub out2_kind: FileKind,
    /// out_kind as first derived, stable across re-derivations
    pub out_kind_hold: FileKind,
    pub input: Option<InputSrc>,
    pub output: Option<OutputDst>,
    pub out2: Option<File>,

    pub iflag: Flags,
    pub oflag: Flags,

    // protection information
    pub rdprotect: u8,
    pub wrprotect: u8,
    pub rdp_i_exp: u8,
    pub wrp_i_exp: u8,
    pub rdprot_typ: u8,
    pub wrprot_typ: u8,

    pub coe_limit: u32,

    // signal/progress policy
    pub interrupt_io: bool,
    pub reading_fifo: bool,
    /// true when there is no real output (null sink): the run only reads
    pub read1_or_transfer: bool,

    pub verbose: i32,
    pub quiet: bool,
    pub do_time: bool,

    // which options were given explicitly
    pub bpt_given: bool,
    pub bs_given: bool,
    pub ibs_given: bool,
    pub obs_given: bool,
    pub cdbsz_given: bool,
    pub outf_given: bool,

    /// non-fatal error category held back until clean termination
    pub err_to_report: Option<u8>,

    pub stats: Stats,
    pub out_sparse_active: bool,
    pub out_sparing_active: bool,
    pub out_trim_active: bool,

    pub errblk: Option<ErrBlkLog>,

    // nocache fadvise tracking
    pub lowest_skip: Option<u64>,
    pub lowest_seek: Option<u64>,

    pub printed_ew_message: bool,
}

impl Default for Opts {
    fn default() -> Self {
        Opts {
            ibs: 0,
            obs: 0,
            ibs_pi: 0,
            obs_pi: 0,
            ibs_hold: 0,
            bpt_i: 0,
            obpc: 0,
            skip: 0,
            seek: 0,
            dd_count: -1,
            inf: String::new(),
            outf: String::new(),
            out2f: String::new(),
            in_kind: FileKind::OTHER,
            out_kind: FileKind::OTHER,
            out2_kind: FileKind::default(),
            out_kind_hold: FileKind::OTHER,
            input: None,
            output: None,
            out2: None,
            iflag: Flags {
                cdbsz: DEF_SCSI_CDBSZ,
                ..Default::default()
            },
            oflag: Flags {
                cdbsz: DEF_SCSI_CDBSZ,
                ..Default::default()
            },
            rdprotect: 0,
            wrprotect: 0,
            rdp_i_exp: 0,
            wrp_i_exp: 0,
            rdprot_typ: 0,
            wrprot_typ: 0,
            coe_limit: 0,
            interrupt_io: false,
            reading_fifo: false,
            read1_or_transfer: false,
            verbose: 0,
            quiet: false,
            do_time: true,
            bpt_given: false,
            bs_given: false,
            ibs_given: false,
            obs_given: false,
            cdbsz_given: false,
            outf_given: false,
            err_to_report: None,
            stats: Stats::default(),
            out_sparse_active: false,
            out_sparing_active: false,
            out_trim_active: false,
            errblk: None,
            lowest_skip: None,
            lowest_seek: None,
            printed_ew_message: false,
        }
    }
}

/// What the command line asked for
pub enum CliAction {
    Run(Box<Opts>),
    Help,
    Version,
}

fn syntax(msg: String) -> PtddError {
    PtddError::Syntax(msg)
}

/// Parse one component of a size expression: decimal or 0x hex, with an
/// optional single-character binary suffix.
fn parse_size_component(s: &str) -> Result<u64, String> {
    if s.is_empty() {
        return Err(gettext("empty numeric operand"));
    }
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16).map_err(|_| format!("bad hex number: {}", s));
    }
    let (num, scale) = match s.char_indices().last() {
        Some((idx, last)) if last.is_alphabetic() => {
            let scale: u64 = match last {
                'c' => 1,
                'w' => 2,
                'b' => 512,
                'k' | 'K' => 1024,
                'm' | 'M' => 1024 * 1024,
                'g' | 'G' => 1024 * 1024 * 1024,
                _ => return Err(format!("{}: {}", gettext("invalid size suffix"), last)),
            };
            (&s[..idx], scale)
        }
        _ => (s, 1),
    };
    let n = num
        .parse::<u64>()
        .map_err(|_| format!("bad number: {}", s))?;
    n.checked_mul(scale)
        .ok_or_else(|| gettext("numeric operand overflow"))
}

/// Parse a numeric operand. Components separated by 'x' multiply; a 0x
/// prefix means one hex number, not a product.
pub fn parse_num(s: &str) -> Result<u64, String> {
    if s.starts_with("0x") || s.starts_with("0X") {
        return parse_size_component(s);
    }
    let mut result: u64 = 1;
    for part in s.split('x') {
        let component = parse_size_component(part)?;
        result = result
            .checked_mul(component)
            .ok_or_else(|| gettext("numeric operand overflow"))?;
    }
    Ok(result)
}

/// Like parse_num but "-1" is accepted (count=-1 means derive).
fn parse_count(s: &str) -> Result<i64, String> {
    if s == "-1" {
        return Ok(-1);
    }
    let n = parse_num(s)?;
    i64::try_from(n).map_err(|_| gettext("numeric operand overflow"))
}

/// conv= shortcuts; these fold onto the iflag/oflag vectors
fn process_conv(arg: &str, iflag: &mut Flags, oflag: &mut Flags) -> Result<(), String> {
    if arg.is_empty() {
        return Err(gettext("no conversions found"));
    }
    for tok in arg.split(',') {
        match tok {
            "fdatasync" => oflag.fdatasync = true,
            "fsync" => oflag.fsync = true,
            // will still fail on write error
            "noerror" => iflag.coe = true,
            // notrunc is the default action here, accepted as a no-op
            "notrunc" => (),
            "null" => (),
            "resume" => oflag.resume = true,
            "sparing" => oflag.sparing = true,
            "sparse" => oflag.sparse += 1,
            // zero-padding of errored blocks is the default, so sync is a
            // no-op; accepted for dd's 'conv=noerror,sync' habit
            "sync" => (),
            "trunc" => oflag.trunc = true,
            _ => return Err(format!("{}: {}", gettext("unrecognised conversion"), tok)),
        }
    }
    Ok(())
}

/// iflag= / oflag= lists
fn process_flags(arg: &str, fp: &mut Flags) -> Result<(), String> {
    if arg.is_empty() {
        return Err(gettext("no flag found"));
    }
    for tok in arg.split(',') {
        match tok {
            "append" => fp.append = true,
            "coe" => fp.coe = true,
            "direct" => fp.direct = true,
            "dpo" => fp.dpo = true,
            "errblk" => fp.errblk = true,
            "excl" => fp.excl = true,
            "fdatasync" => fp.fdatasync = true,
            "flock" => fp.flock = true,
            "force" => fp.force = true,
            "fsync" => fp.fsync = true,
            "fua" => fp.fua = true,
            "fua_nv" => fp.fua_nv = true,
            // "ignore early warning" (tape end-of-medium)
            "ignoreew" => fp.ignoreew = true,
            "nocache" => fp.nocache = fp.nocache.saturating_add(1),
            // no filemark on tape close
            "nofm" => fp.nofm = true,
            "nopad" => fp.nopad = true,
            "norcap" => fp.norcap = true,
            "nowrite" => fp.nowrite = true,
            "null" => (),
            "pad" => fp.pad = true,
            "pre-alloc" | "prealloc" => fp.prealloc = true,
            "pt" => fp.pt = true,
            "rarc" => fp.rarc = true,
            "resume" => fp.resume = true,
            "self" => fp.self_copy = true,
            "sparing" => fp.sparing = true,
            "sparse" => fp.sparse += 1,
            "ssync" => fp.ssync = true,
            "strunc" => fp.strunc = true,
            "sync" => fp.sync = true,
            // trim (ATA term) and unmap (SCSI term) are synonyms
            "trim" | "unmap" => fp.wsame16 = true,
            "trunc" => fp.trunc = true,
            _ => return Err(format!("{}: {}", gettext("unrecognised flag"), tok)),
        }
    }
    Ok(())
}

pub fn usage() {
    eprintln!(
        "Usage: ptdd  [bpt=BPT[,OBPC]] [bs=BS] [cdbsz=6|10|12|16|32] [coe=0|1]
             [coe_limit=CL] [conv=CONVS] [count=COUNT] [ibs=IBS] if=IFILE
             [iflag=FLAGS] [intio=0|1] [iseek=SKIP] [obs=OBS] [of=OFILE]
             [of2=OFILE2] [oflag=FLAGS] [oseek=SEEK] [protect=RDP[,WRP]]
             [retries=RETR] [seek=SEEK] [skip=SKIP] [status=STAT]
             [verbose=VERB] [--help] [--verbose] [--version]
  where:
    bpt         input Blocks Per Transfer (BPT) (def: 128 when IBS is 512)
                Output Blocks Per Check (OBPC) (def: 0 implies BPT*IBS/OBS)
    bs          block size for input and output (overrides ibs and obs)
    cdbsz       size of SCSI READ or WRITE cdb (default is 10)
    coe         0->exit on error (def), 1->continue on error (zero fill)
    coe_limit   limit consecutive 'bad' blocks on reads to CL times
                when coe=1 (default: 0 which is no limit)
    conv        conversions, comma separated list of CONVS (see below)
    count       number of input blocks to copy (def: (remaining)
                device/file size)
    ibs         input block size (default 512 bytes)
    if          file or device to read from (for stdin use '-')
    iflag       input flags, comma separated list from FLAGS (see below)
    intio       interrupt during IO; allow signals during reads and writes
                (def: 0 causes signals to be masked during IO)
    iseek       block position to start reading from IFILE
    obs         output block size (def: 512). When IBS is not equal to OBS
                then (((IBS * BPT) % OBS) == 0) is required
    of          file or device to write to (def: /dev/null)
    of2         additional output file (def: /dev/null), OFILE2 should be
                regular file or pipe
    oflag       output flags, comma separated list from FLAGS (see below)
    oseek       block position to start writing to OFILE
    protect     set rdprotect and/or wrprotect fields on pt commands
    retries     retry pass-through errors RETR times (def: 0)
    seek        block position to start writing to OFILE
    skip        block position to start reading from IFILE
    status      value: 'noxfer' suppresses throughput calculation
    verbose     0->normal(def), 1->some noise, 2->more noise, etc
                -1->quiet (stderr->/dev/null)
    --help      print out this usage message then exit
    --verbose   equivalent to verbose=1
    --version   print version information then exit

Copy all or part of IFILE to OFILE, IBS*BPT bytes at a time. Similar to
dd command. Support for block devices, especially those accessed via
a SCSI pass-through.
FLAGS: append(o),coe,direct,dpo,errblk(i),excl,fdatasync(o),flock,force,
fsync(o),fua,fua_nv,ignoreew(o),nocache,nofm(o),nopad,norcap,nowrite(o),
null,pad,pre-alloc(o),pt,rarc(i),resume(o),self,sparing(o),sparse(o),
ssync(o),strunc(o),sync,trim(o),trunc(o),unmap(o).
CONVS: fdatasync,fsync,noerror,notrunc,null,resume,sparing,sparse,sync,
trunc"
    );
}

/// Process the command line. `args` excludes argv[0].
pub fn parse_cmdline(args: &[String]) -> PtddResult<CliAction> {
    let mut op = Box::new(Opts::default());

    for arg in args {
        let (key, val) = match arg.split_once('=') {
            Some((k, v)) => (k, v),
            None => (arg.as_str(), ""),
        };
        match key {
            "bpt" => {
                let (bpt_s, obpc_s) = match val.split_once(',') {
                    Some((a, b)) => (a, Some(b)),
                    None => (val, None),
                };
                let n = parse_num(bpt_s).map_err(|e| syntax(format!("bpt: {}", e)))?;
                if n > 0 {
                    op.bpt_i = n as usize;
                    op.bpt_given = true;
                }
                if let Some(o) = obpc_s {
                    let n = parse_num(o).map_err(|e| syntax(format!("bpt OBPC: {}", e)))?;
                    op.obpc = n as usize;
                }
            }
            "bs" => {
                if op.bs_given {
                    return Err(syntax(gettext("second 'bs=' option given, dangerous")));
                }
                if op.ibs_given || op.obs_given {
                    return Err(syntax(gettext(
                        "'bs=' option cannot be combined with 'ibs=' or 'obs='",
                    )));
                }
                let n = parse_num(val).map_err(|e| syntax(format!("bs: {}", e)))?;
                op.bs_given = true;
                op.ibs = n as usize;
                op.obs = n as usize;
            }
            "cbs" => eprintln!("{}", gettext("the cbs= option is ignored")),
            "cdbsz" => {
                let n = parse_num(val).map_err(|e| syntax(format!("cdbsz: {}", e)))?;
                if ![6, 10, 12, 16, 32].contains(&n) {
                    return Err(syntax(format!(
                        "{}: {}",
                        gettext("cdbsz expects 6, 10, 12, 16 or 32"),
                        n
                    )));
                }
                op.iflag.cdbsz = n as u8;
                op.oflag.cdbsz = n as u8;
                op.cdbsz_given = true;
            }
            "coe" => {
                let n = parse_num(val).map_err(|e| syntax(format!("coe: {}", e)))?;
                op.iflag.coe = n > 0;
                op.oflag.coe = n > 0;
            }
            "coe_limit" => {
                let n = parse_num(val).map_err(|e| syntax(format!("coe_limit: {}", e)))?;
                op.coe_limit =
                    u32::try_from(n).map_err(|_| syntax("coe_limit too large".to_string()))?;
            }
            "conv" => {
                process_conv(val, &mut op.iflag, &mut op.oflag)
                    .map_err(|e| syntax(format!("{}: {}", gettext("bad argument to 'conv='"), e)))?;
            }
            "count" => {
                op.dd_count = parse_count(val).map_err(|e| syntax(format!("count: {}", e)))?;
            }
            "ibs" => {
                if op.bs_given {
                    return Err(syntax(gettext(
                        "'ibs=' option cannot be combined with 'bs='; try 'obs=' instead",
                    )));
                }
                let n = parse_num(val).map_err(|e| syntax(format!("ibs: {}", e)))?;
                op.ibs_given = true;
                op.ibs = n as usize;
            }
            "if" => {
                if !op.inf.is_empty() {
                    return Err(syntax(gettext("second IFILE argument")));
                }
                op.inf = val.to_string();
            }
            "iflag" => {
                process_flags(val, &mut op.iflag).map_err(|e| {
                    syntax(format!("{}: {}", gettext("bad argument to 'iflag='"), e))
                })?;
            }
            "intio" => {
                let n = parse_num(val).map_err(|e| syntax(format!("intio: {}", e)))?;
                op.interrupt_io = n > 0;
            }
            "iseek" | "skip" => {
                let n = parse_num(val).map_err(|e| syntax(format!("{}: {}", key, e)))?;
                op.skip = n;
            }
            "obs" => {
                if op.bs_given {
                    return Err(syntax(gettext(
                        "'obs=' option cannot be combined with 'bs='; try 'ibs=' instead",
                    )));
                }
                let n = parse_num(val).map_err(|e| syntax(format!("obs: {}", e)))?;
                op.obs_given = true;
                op.obs = n as usize;
            }
            "of" => {
                if !op.outf.is_empty() {
                    return Err(syntax(gettext("second OFILE argument")));
                }
                op.outf = val.to_string();
                op.outf_given = true;
            }
            "of2" => {
                if !op.out2f.is_empty() {
                    return Err(syntax(gettext("second OFILE2 argument")));
                }
                op.out2f = val.to_string();
            }
            "oflag" => {
                process_flags(val, &mut op.oflag).map_err(|e| {
                    syntax(format!("{}: {}", gettext("bad argument to 'oflag='"), e))
                })?;
            }
            "oseek" | "seek" => {
                let n = parse_num(val).map_err(|e| syntax(format!("{}: {}", key, e)))?;
                op.seek = n;
            }
            "protect" => {
                let (rdp_s, wrp_s) = match val.split_once(',') {
                    Some((a, b)) => (a, Some(b)),
                    None => (val, None),
                };
                let n = parse_num(rdp_s).map_err(|e| syntax(format!("protect RDP: {}", e)))?;
                if n > 7 {
                    return Err(syntax(gettext("bad RDP argument to 'protect='")));
                }
                op.rdprotect = n as u8;
                if let Some(w) = wrp_s {
                    let n = parse_num(w).map_err(|e| syntax(format!("protect WRP: {}", e)))?;
                    if n > 7 {
                        return Err(syntax(gettext("bad WRP argument to 'protect='")));
                    }
                    op.wrprotect = n as u8;
                }
            }
            "retries" => {
                let n = parse_num(val).map_err(|e| syntax(format!("retries: {}", e)))?;
                let n = u32::try_from(n).map_err(|_| syntax("retries too large".to_string()))?;
                op.iflag.retries = n;
                op.oflag.retries = n;
            }
            "status" => match val {
                "null" => (),
                "noxfer" => op.do_time = false,
                _ => {
                    return Err(syntax(gettext("'status=' expects 'noxfer' or 'null'")));
                }
            },
            "verbose" | "verb" => {
                let n = val
                    .parse::<i32>()
                    .map_err(|_| syntax(gettext("bad argument to 'verbose='")))?;
                if n < 0 {
                    op.quiet = true;
                    op.verbose = 0;
                } else {
                    op.verbose = n;
                }
            }
            "--verbose" => op.verbose += 1,
            "-vvvv" => op.verbose += 4,
            "-vvv" => op.verbose += 3,
            "-vv" => op.verbose += 2,
            "-v" => op.verbose += 1,
            "--help" | "-h" | "-?" => return Ok(CliAction::Help),
            "--version" | "-V" => return Ok(CliAction::Version),
            _ => {
                return Err(syntax(format!(
                    "{} '{}'",
                    gettext("Unrecognized option"),
                    key
                )));
            }
        }
    }
    sanity_defaults(&mut op)?;
    Ok(CliAction::Run(op))
}

/// Apply defaults and the cross-flag policies, after all operands are in.
fn sanity_defaults(op: &mut Opts) -> PtddResult<()> {
    if op.ibs == 0 && op.obs == 0 {
        op.ibs = DEF_BLOCK_SIZE;
        op.obs = DEF_BLOCK_SIZE;
        if !op.inf.is_empty() {
            eprintln!(
                "{}",
                gettext("Assume block size of 512 bytes for both input and output")
            );
        }
    } else if op.obs == 0 {
        op.obs = DEF_BLOCK_SIZE;
        if op.ibs != DEF_BLOCK_SIZE && !op.outf.is_empty() {
            eprintln!("{}", gettext("Neither obs nor bs given so set obs=512"));
        }
    } else if op.ibs == 0 {
        op.ibs = DEF_BLOCK_SIZE;
        if op.obs != DEF_BLOCK_SIZE {
            eprintln!("{}", gettext("Neither ibs nor bs given so set ibs=512"));
        }
    }
    op.ibs_hold = op.ibs;
    if !op.bpt_given {
        op.bpt_i = default_bpt(op.ibs);
    }

    if op.ibs != op.obs && (op.ibs * op.bpt_i) % op.obs != 0 {
        return Err(syntax(format!(
            "{} (bpt={})",
            gettext("when 'ibs' and 'obs' differ, ((ibs*bpt)/obs) must have no remainder"),
            op.bpt_i
        )));
    }
    if op.oflag.append && op.seek > 0 {
        return Err(syntax(gettext("Can't use both append and seek switches")));
    }
    if op.bpt_i < 1 {
        return Err(syntax(gettext("bpt must be greater than 0")));
    }

    // input-side flags that only make sense on output
    if op.iflag.append {
        eprintln!("{}", gettext("append flag ignored on input"));
        op.iflag.append = false;
    }
    if op.iflag.ignoreew {
        eprintln!("{}", gettext("ignoreew flag ignored on input"));
        op.iflag.ignoreew = false;
    }
    if op.iflag.nofm {
        eprintln!("{}", gettext("nofm flag ignored on input"));
        op.iflag.nofm = false;
    }
    if op.iflag.prealloc {
        eprintln!("{}", gettext("pre-alloc flag ignored on input"));
        op.iflag.prealloc = false;
    }
    if op.iflag.sparing {
        eprintln!("{}", gettext("sparing flag ignored on input"));
        op.iflag.sparing = false;
    }
    if op.iflag.ssync {
        eprintln!("{}", gettext("ssync flag ignored on input"));
        op.iflag.ssync = false;
    }

    if op.oflag.trunc {
        if op.oflag.resume {
            op.oflag.trunc = false;
            if op.verbose > 0 {
                eprintln!(
                    "{}",
                    gettext("trunc ignored due to resume flag, otherwise open truncates too early")
                );
            }
        } else if op.oflag.append {
            op.oflag.trunc = false;
            eprintln!("{}", gettext("trunc ignored due to append flag"));
        } else if op.oflag.sparing {
            return Err(syntax(gettext("trunc flag conflicts with sparing")));
        }
    }

    if op.iflag.self_copy || op.oflag.self_copy {
        op.oflag.self_copy = true;
        if op.iflag.wsame16 || op.oflag.wsame16 {
            op.oflag.wsame16 = true;
            op.oflag.nowrite = true;
        }
        if op.outf.is_empty() {
            op.outf = op.inf.clone();
        }
        if op.seek == 0 && op.skip > 0 {
            if op.ibs == op.obs {
                op.seek = op.skip;
            } else {
                let bytes = op.skip * op.ibs as u64;
                op.seek = bytes / op.obs as u64;
                if op.seek * op.obs as u64 != bytes {
                    return Err(syntax(gettext(
                        "self cannot translate skip to seek properly, try different skip value",
                    )));
                }
            }
            if op.verbose > 0 {
                eprintln!("self: set seek={}", op.seek);
            }
        }
    }
    if op.oflag.wsame16 {
        op.oflag.sparse += 2;
    }
    if op.oflag.strunc && op.oflag.sparse == 0 {
        op.oflag.sparse = 1;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> PtddResult<CliAction> {
        let v: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        parse_cmdline(&v)
    }

    fn parse_ok(args: &[&str]) -> Box<Opts> {
        match parse(args).unwrap() {
            CliAction::Run(op) => op,
            _ => panic!("expected a run action"),
        }
    }

    #[test]
    fn test_parse_num_suffixes() {
        assert_eq!(parse_num("512").unwrap(), 512);
        assert_eq!(parse_num("1k").unwrap(), 1024);
        assert_eq!(parse_num("2K").unwrap(), 2048);
        assert_eq!(parse_num("1M").unwrap(), 1024 * 1024);
        assert_eq!(parse_num("4b").unwrap(), 2048);
        assert_eq!(parse_num("2w").unwrap(), 4);
        assert_eq!(parse_num("3c").unwrap(), 3);
        assert_eq!(parse_num("0x10").unwrap(), 16);
        assert_eq!(parse_num("2x3x4").unwrap(), 24);
        assert!(parse_num("").is_err());
        assert!(parse_num("12q").is_err());
    }

    #[test]
    fn test_defaults() {
        let op = parse_ok(&["if=foo"]);
        assert_eq!(op.ibs, 512);
        assert_eq!(op.obs, 512);
        assert_eq!(op.bpt_i, 128);
        assert_eq!(op.dd_count, -1);
        assert_eq!(op.iflag.cdbsz, 10);
    }

    #[test]
    fn test_default_bpt_table() {
        assert_eq!(default_bpt(1), 8192);
        assert_eq!(default_bpt(8), 1024);
        assert_eq!(default_bpt(512), 128);
        assert_eq!(default_bpt(2048), 16);
        assert_eq!(default_bpt(8192), 4);
        assert_eq!(default_bpt(32768), 1);
    }

    #[test]
    fn test_bs_conflicts() {
        assert!(parse(&["bs=512", "ibs=512"]).is_err());
        assert!(parse(&["ibs=512", "bs=512"]).is_err());
        assert!(parse(&["bs=512", "bs=512"]).is_err());
    }

    #[test]
    fn test_alignment_rejected_before_io() {
        // (ibs * bpt) % obs != 0
        assert!(parse(&["ibs=512", "obs=768", "bpt=1"]).is_err());
        // and accepted when aligned
        let op = parse_ok(&["ibs=512", "obs=1024", "bpt=4"]);
        assert_eq!(op.bpt_i, 4);
    }

    #[test]
    fn test_conv_list() {
        let op = parse_ok(&["if=x", "conv=noerror,sparse,fdatasync,notrunc,null,sync"]);
        assert!(op.iflag.coe);
        assert_eq!(op.oflag.sparse, 1);
        assert!(op.oflag.fdatasync);
        assert!(!op.oflag.trunc);
        assert!(parse(&["conv=bogus"]).is_err());
    }

    #[test]
    fn test_flag_lists() {
        let op = parse_ok(&["if=x", "iflag=coe,direct,errblk", "oflag=sparing,pad"]);
        assert!(op.iflag.coe);
        assert!(op.iflag.direct);
        assert!(op.iflag.errblk);
        assert!(op.oflag.sparing);
        assert!(op.oflag.pad);
        assert!(parse(&["iflag=whatever"]).is_err());
    }

    #[test]
    fn test_trim_unmap_synonyms() {
        let a = parse_ok(&["if=x", "oflag=trim"]);
        let b = parse_ok(&["if=x", "oflag=unmap"]);
        assert!(a.oflag.wsame16);
        assert!(b.oflag.wsame16);
        // wsame16 lifts sparse to hole-leaving mode
        assert_eq!(a.oflag.sparse, 2);
    }

    #[test]
    fn test_trunc_policies() {
        // resume wins over trunc
        let op = parse_ok(&["if=x", "oflag=trunc,resume"]);
        assert!(!op.oflag.trunc);
        // append wins over trunc
        let op = parse_ok(&["if=x", "oflag=trunc,append"]);
        assert!(!op.oflag.trunc);
        // sparing + trunc is fatal
        assert!(parse(&["if=x", "oflag=trunc,sparing"]).is_err());
    }

    #[test]
    fn test_append_seek_conflict() {
        assert!(parse(&["if=x", "oflag=append", "seek=4"]).is_err());
    }

    #[test]
    fn test_self_derives_seek() {
        let op = parse_ok(&["if=x", "iflag=self", "skip=8"]);
        assert!(op.oflag.self_copy);
        assert_eq!(op.outf, "x");
        assert_eq!(op.seek, 8);
        // untranslatable skip is rejected
        assert!(parse(&["if=x", "ibs=512", "obs=1024", "bpt=2", "iflag=self", "skip=1"]).is_err());
    }

    #[test]
    fn test_strunc_implies_sparse() {
        let op = parse_ok(&["if=x", "oflag=strunc"]);
        assert_eq!(op.oflag.sparse, 1);
    }

    #[test]
    fn test_protect_range() {
        let op = parse_ok(&["if=x", "protect=3,5"]);
        assert_eq!(op.rdprotect, 3);
        assert_eq!(op.wrprotect, 5);
        assert!(parse(&["if=x", "protect=8"]).is_err());
    }

    #[test]
    fn test_cdbsz_validation() {
        assert!(parse(&["if=x", "cdbsz=11"]).is_err());
        let op = parse_ok(&["if=x", "cdbsz=16"]);
        assert_eq!(op.iflag.cdbsz, 16);
        assert_eq!(op.oflag.cdbsz, 16);
        assert!(op.cdbsz_given);
    }

    #[test]
    fn test_seek_skip_aliases() {
        let op = parse_ok(&["if=x", "iseek=3", "oseek=7"]);
        assert_eq!(op.skip, 3);
        assert_eq!(op.seek, 7);
    }

    #[test]
    fn test_count_minus_one() {
        let op = parse_ok(&["if=x", "count=-1"]);
        assert_eq!(op.dd_count, -1);
    }

    #[test]
    fn test_status_values() {
        let op = parse_ok(&["if=x", "status=noxfer"]);
        assert!(!op.do_time);
        let op = parse_ok(&["if=x", "status=null"]);
        assert!(op.do_time);
        assert!(parse(&["if=x", "status=progress"]).is_err());
    }
}
