//
// Copyright (c) 2025-2026 Jeff Garzik
//
// This file is part of the ptdd-rs project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT
//

//! Counters and the stats / throughput reports
//!
//! All counters are owned by the copy loop; nothing here is shared across
//! threads. The report format follows dd's "N+M records" convention with
//! extra lines for sparse, error and retry outcomes.

use std::time::Instant;

use crate::options::Opts;

/// Statistics for a copy run
#[derive(Default)]
pub struct Stats {
    /// Full input blocks read
    pub in_full: u64,
    /// Partial input blocks read
    pub in_partial: u64,
    /// Full output blocks written
    pub out_full: u64,
    /// Partial output blocks written
    pub out_partial: u64,
    /// Output blocks bypassed (or trimmed) because the data was zero or
    /// already in place
    pub out_sparse: u64,
    /// Trailing partial output blocks bypassed
    pub out_sparse_partial: u64,
    pub recovered_errs: u32,
    pub unrecovered_errs: u32,
    pub wr_recovered_errs: u32,
    pub wr_unrecovered_errs: u32,
    pub trim_errs: u32,
    pub num_retries: u32,
    pub interrupted_retries: u32,
    /// Consecutive unrecovered read errors, reset by any good read
    pub coe_count: u32,
    pub lowest_unrecovered: Option<u64>,
    pub highest_unrecovered: Option<u64>,
    /// Monotonic start timestamp; None when status=noxfer
    pub start: Option<Instant>,
    // tape read summarising state
    pub last_tape_read_len: usize,
    pub consec_same_len_reads: u32,
    pub read_tape_numbytes: usize,
}

impl Stats {
    /// Record an unrecovered read error at `lba` for the lowest/highest
    /// tracking lines.
    pub fn note_unrecovered(&mut self, lba: u64) {
        self.unrecovered_errs += 1;
        match self.lowest_unrecovered {
            None => {
                self.lowest_unrecovered = Some(lba);
                self.highest_unrecovered = Some(lba);
            }
            Some(low) => {
                if lba < low {
                    self.lowest_unrecovered = Some(lba);
                }
                if lba > self.highest_unrecovered.unwrap_or(low) {
                    self.highest_unrecovered = Some(lba);
                }
            }
        }
    }

    /// Any fully good read resets the consecutive-bad counter.
    pub fn reset_coe_count(&mut self, coe_limit: u32) {
        if coe_limit > 0 {
            self.coe_count = 0;
        }
    }
}

/// Summarise previous consecutive same-length tape reads, when the read
/// length changes.
pub fn print_tape_summary(op: &Opts, res: usize) {
    let st = &op.stats;
    let len = st.last_tape_read_len;
    if op.verbose > 1 && res != len && st.consec_same_len_reads >= 1 {
        eprintln!(
            "({}{} read{} of {} byte{})",
            st.consec_same_len_reads,
            if len < st.read_tape_numbytes {
                " short"
            } else {
                ""
            },
            if st.consec_same_len_reads != 1 { "s" } else { "" },
            len,
            if len != 1 { "s" } else { "" }
        );
    }
}

/// Print the stats block to stderr. `prefix` indents each line (used for
/// the progress-report form).
pub fn print_stats(prefix: &str, op: &Opts) {
    print_tape_summary(op, 0);
    let st = &op.stats;
    if op.dd_count != 0 && !op.reading_fifo {
        eprintln!("  remaining block count={}", op.dd_count);
    }
    eprintln!("{}{}+{} records in", prefix, st.in_full, st.in_partial);
    eprintln!("{}{}+{} records out", prefix, st.out_full, st.out_partial);
    if op.out_sparse_active || op.out_sparing_active {
        if op.out_trim_active {
            let what = if st.trim_errs > 0 {
                "attempted trim"
            } else {
                "trimmed"
            };
            if st.out_sparse_partial > 0 {
                eprintln!(
                    "{}{}+{} {} records out",
                    prefix, st.out_sparse, st.out_sparse_partial, what
                );
            } else {
                eprintln!("{}{} {} records out", prefix, st.out_sparse, what);
            }
        } else if st.out_sparse_partial > 0 {
            eprintln!(
                "{}{}+{} bypassed records out",
                prefix, st.out_sparse, st.out_sparse_partial
            );
        } else {
            eprintln!("{}{} bypassed records out", prefix, st.out_sparse);
        }
    }
    if st.recovered_errs > 0 {
        eprintln!("{}{} recovered read errors", prefix, st.recovered_errs);
    }
    if st.num_retries > 0 {
        eprintln!("{}{} retries attempted", prefix, st.num_retries);
    }
    if st.unrecovered_errs > 0 {
        eprintln!(
            "{}{} unrecovered read error{}",
            prefix,
            st.unrecovered_errs,
            if st.unrecovered_errs == 1 { "" } else { "s" }
        );
        if let (Some(low), Some(high)) = (st.lowest_unrecovered, st.highest_unrecovered) {
            eprintln!(
                "lowest unrecovered read lba={}, highest unrecovered lba={}",
                low, high
            );
        }
    }
    if st.wr_recovered_errs > 0 {
        eprintln!("{}{} recovered write errors", prefix, st.wr_recovered_errs);
    }
    if st.wr_unrecovered_errs > 0 {
        eprintln!(
            "{}{} unrecovered write error{}",
            prefix,
            st.wr_unrecovered_errs,
            if st.wr_unrecovered_errs == 1 { "" } else { "s" }
        );
    }
    if st.trim_errs > 0 {
        eprintln!("{}{} trim errors", prefix, st.trim_errs);
    }
    if st.interrupted_retries > 0 {
        eprintln!(
            "{}{} {} after interrupted system call(s)",
            prefix,
            st.interrupted_retries,
            if st.interrupted_retries == 1 {
                "retry"
            } else {
                "retries"
            }
        );
    }
}

/// Elapsed time and throughput, in decimal megabytes per second. When
/// called mid-copy (`contin`) and enough remains, also estimates the time
/// remaining.
pub fn print_throughput(leadin: &str, contin: bool, op: &Opts) {
    let start = match op.stats.start {
        Some(t) => t,
        None => return,
    };
    let elapsed = start.elapsed();
    let a = elapsed.as_secs_f64();
    let b = (op.ibs_hold as u64 * op.stats.in_full) as f64;
    eprint!(
        "{}time to {} data{}: {}.{:06} secs",
        leadin,
        if op.read1_or_transfer {
            "read"
        } else {
            "transfer"
        },
        if contin { " so far" } else { "" },
        elapsed.as_secs(),
        elapsed.subsec_micros()
    );
    let mut rate = 0.0;
    if a > 0.00001 && b > 511.0 {
        rate = b / (a * 1_000_000.0);
        if rate < 1.0 {
            eprintln!(" at {:.1} KB/sec", rate * 1000.0);
        } else {
            eprintln!(" at {:.2} MB/sec", rate);
        }
    } else {
        eprintln!();
    }
    if contin && !op.reading_fifo && rate > 0.01 && op.dd_count > 100 {
        let mut secs = ((op.ibs_hold as f64 * op.dd_count as f64) / (rate * 1_000_000.0)) as u64;
        if secs > 10 {
            let h = secs / 3600;
            secs -= h * 3600;
            let m = secs / 60;
            secs -= m * 60;
            if h > 0 {
                eprintln!("{}estimated time remaining: {}:{:02}:{:02}", leadin, h, m, secs);
            } else {
                eprintln!("{}estimated time remaining: {}:{:02}", leadin, m, secs);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_note_unrecovered_tracks_range() {
        let mut st = Stats::default();
        st.note_unrecovered(100);
        st.note_unrecovered(50);
        st.note_unrecovered(200);
        assert_eq!(st.unrecovered_errs, 3);
        assert_eq!(st.lowest_unrecovered, Some(50));
        assert_eq!(st.highest_unrecovered, Some(200));
    }

    #[test]
    fn test_reset_coe_count_only_with_limit() {
        let mut st = Stats {
            coe_count: 5,
            ..Default::default()
        };
        st.reset_coe_count(0);
        assert_eq!(st.coe_count, 5);
        st.reset_coe_count(3);
        assert_eq!(st.coe_count, 0);
    }
}
