//
// Copyright (c) 2025-2026 Jeff Garzik
//
// This file is part of the ptdd-rs project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT
//

//! Signal broker
//!
//! Two asynchronous flags bridge the handlers and the copy loop: a pending
//! fatal signal (SIGINT or SIGPIPE) and a count of pending info signals
//! (SIGUSR1, or SIGINFO where the platform has one). Unless intio was
//! requested, the caught signals stay blocked outside the drain point so
//! handlers only run at well-defined suspension points in the loop.

use std::mem;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use crate::filetype::FileKind;
use crate::options::Opts;
use crate::stats;

/// The pending fatal signal value, 0 when none.
static INTERRUPT_SIGNAL: AtomicI32 = AtomicI32::new(0);

/// Count of pending info signals, decremented as processed.
static INFO_SIGNALS_PENDING: AtomicU32 = AtomicU32::new(0);

#[cfg(any(target_os = "macos", target_os = "freebsd"))]
const SIG_INFO: libc::c_int = libc::SIGINFO;
#[cfg(not(any(target_os = "macos", target_os = "freebsd")))]
const SIG_INFO: libc::c_int = libc::SIGUSR1;

extern "C" fn interrupt_handler(sig: libc::c_int) {
    INTERRUPT_SIGNAL.store(sig, Ordering::SeqCst);
}

extern "C" fn siginfo_handler(_sig: libc::c_int) {
    INFO_SIGNALS_PENDING.fetch_add(1, Ordering::SeqCst);
}

fn signal_name(sig: libc::c_int) -> String {
    match sig {
        libc::SIGINT => "SIGINT".to_string(),
        libc::SIGQUIT => "SIGQUIT".to_string(),
        libc::SIGPIPE => "SIGPIPE".to_string(),
        s if s == SIG_INFO => {
            if SIG_INFO == libc::SIGUSR1 {
                "SIGUSR1".to_string()
            } else {
                "SIGINFO".to_string()
            }
        }
        other => other.to_string(),
    }
}

/// Installed handler state: which signals we caught and the mask to restore
/// around the drain point.
pub struct SignalBroker {
    caught: Vec<libc::c_int>,
    masked: bool,
}

impl SignalBroker {
    /// Install handlers for the interrupt and info signals, skipping any
    /// whose disposition is already 'ignored'. When `interrupt_io` is
    /// false the caught set is blocked so handlers only run at drain.
    pub fn install(verbose: i32, interrupt_io: bool) -> SignalBroker {
        let mut caught: Vec<libc::c_int> = Vec::new();

        for (sig, fatal) in [
            (SIG_INFO, false),
            (libc::SIGINT, true),
            (libc::SIGPIPE, true),
        ] {
            unsafe {
                let mut old: libc::sigaction = mem::zeroed();
                if libc::sigaction(sig, std::ptr::null(), &mut old) != 0 {
                    continue;
                }
                if old.sa_sigaction == libc::SIG_IGN {
                    if verbose > 0 {
                        if fatal {
                            eprintln!("{} ignored", signal_name(sig));
                        } else {
                            eprintln!(
                                "{} ignored, progress reports not available",
                                signal_name(sig)
                            );
                        }
                    }
                    continue;
                }
                let mut act: libc::sigaction = mem::zeroed();
                libc::sigemptyset(&mut act.sa_mask);
                for &s in &[SIG_INFO, libc::SIGINT, libc::SIGPIPE] {
                    libc::sigaddset(&mut act.sa_mask, s);
                }
                if fatal {
                    act.sa_sigaction = interrupt_handler as *const () as libc::sighandler_t;
                    act.sa_flags = libc::SA_NODEFER | libc::SA_RESETHAND;
                } else {
                    act.sa_sigaction = siginfo_handler as *const () as libc::sighandler_t;
                    act.sa_flags = 0;
                }
                if libc::sigaction(sig, &act, std::ptr::null_mut()) == 0 {
                    caught.push(sig);
                }
            }
        }

        let masked = !interrupt_io && !caught.is_empty();
        if masked {
            unsafe {
                let mut set: libc::sigset_t = mem::zeroed();
                libc::sigemptyset(&mut set);
                for &s in &caught {
                    libc::sigaddset(&mut set, s);
                }
                libc::sigprocmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
            }
        }

        SignalBroker { caught, masked }
    }

    /// Let any blocked caught signal be delivered now, then re-block.
    fn let_pending_run(&self) {
        if !self.masked {
            return;
        }
        unsafe {
            let mut set: libc::sigset_t = mem::zeroed();
            libc::sigemptyset(&mut set);
            for &s in &self.caught {
                libc::sigaddset(&mut set, s);
            }
            let mut pending: libc::sigset_t = mem::zeroed();
            libc::sigemptyset(&mut pending);
            libc::sigpending(&mut pending);
            let any = self
                .caught
                .iter()
                .any(|&s| libc::sigismember(&pending, s) == 1);
            if any {
                libc::sigprocmask(libc::SIG_UNBLOCK, &set, std::ptr::null_mut());
                // pending handlers run here
                libc::sigprocmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
            }
        }
    }

    /// Process pending signals. Called at the loop's suspension points: an
    /// interrupt prints stats and re-raises the signal with the default
    /// disposition; an info signal prints a progress report and continues.
    pub fn drain(&self, op: &Opts) {
        self.let_pending_run();

        loop {
            let interrupt = INTERRUPT_SIGNAL.load(Ordering::SeqCst);
            let infos = INFO_SIGNALS_PENDING.load(Ordering::SeqCst);
            if interrupt == 0 && infos == 0 {
                break;
            }
            if infos > 0 {
                INFO_SIGNALS_PENDING.store(infos - 1, Ordering::SeqCst);
            }

            if interrupt != 0 {
                eprintln!("Interrupted by signal {}", signal_name(interrupt));
                stats::print_stats("", op);
                if !op.reading_fifo
                    && op.out_kind_hold.intersects(FileKind::REG)
                    && !op.oflag.prealloc
                {
                    eprintln!("To resume, invoke with same arguments plus oflag=resume");
                }
                INTERRUPT_SIGNAL.store(0, Ordering::SeqCst);
                unsafe {
                    libc::signal(interrupt, libc::SIG_DFL);
                    if self.masked {
                        let mut set: libc::sigset_t = mem::zeroed();
                        libc::sigemptyset(&mut set);
                        libc::sigaddset(&mut set, interrupt);
                        libc::sigprocmask(libc::SIG_UNBLOCK, &set, std::ptr::null_mut());
                    }
                    libc::raise(interrupt);
                }
            } else {
                eprintln!("Progress report:");
                stats::print_stats("  ", op);
                if op.do_time {
                    stats::print_throughput("  ", true, op);
                }
                eprintln!("  continuing ...");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_counter_drains() {
        INFO_SIGNALS_PENDING.store(2, Ordering::SeqCst);
        let broker = SignalBroker {
            caught: Vec::new(),
            masked: false,
        };
        let op = Opts::default();
        broker.drain(&op);
        assert_eq!(INFO_SIGNALS_PENDING.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_signal_names() {
        assert_eq!(signal_name(libc::SIGINT), "SIGINT");
        assert_eq!(signal_name(libc::SIGPIPE), "SIGPIPE");
        assert_eq!(signal_name(99), "99");
    }
}
