// Copyright (c) 2022 Huawei Technologies Co.,Ltd. All rights reserved.
//
// solisten is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan
// PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//         http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY
// KIND, EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO
// NON-INFRINGEMENT, MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

//! live-child bookkeeping for the forking accept loop
use crate::error::*;
use nix::{
    errno::Errno,
    libc,
    sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal},
    sys::wait::{self, WaitPidFlag, WaitStatus},
    unistd::Pid,
};
use std::sync::atomic::{AtomicI64, Ordering};

static NUM_CHILD: AtomicI64 = AtomicI64::new(0);

// Runs in signal context: only async-signal-safe calls (waitpid, atomics).
extern "C" fn child_reaper(_signo: libc::c_int) {
    loop {
        match wait::waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(status) => {
                if status.pid().is_some() {
                    let _ = NUM_CHILD
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some((v - 1).max(0)));
                } else {
                    break;
                }
            }
            Err(_) => break,
        }
    }
}

/// Install the handler that reaps terminated children and keeps the live
/// count current. Must be in place before the first fork.
pub(crate) fn register_reaper() -> Result<()> {
    let flags = SaFlags::SA_NOCLDSTOP | SaFlags::SA_RESTART;
    let action = SigAction::new(SigHandler::Handler(child_reaper), flags, SigSet::empty());
    unsafe {
        signal::sigaction(Signal::SIGCHLD, &action).context(NixSnafu)?;
    }
    Ok(())
}

/// back to the default disposition, for the drain-and-exit path
pub(crate) fn reset_reaper() {
    let action = SigAction::new(
        SigHandler::SigDfl,
        SaFlags::SA_NOCLDSTOP,
        SigSet::empty(),
    );
    unsafe {
        if let Err(e) = signal::sigaction(Signal::SIGCHLD, &action) {
            log::warn!("Failed to reset SIGCHLD handler: {}", e);
        }
    }
}

fn sigchld_set() -> SigSet {
    let mut set = SigSet::empty();
    set.add(Signal::SIGCHLD);
    set
}

/// Hold back child-termination notification. A child that dies before the
/// parent has recorded its existence must not be reaped in between.
pub(crate) fn block_sigchld() {
    if let Err(e) = signal::sigprocmask(SigmaskHow::SIG_BLOCK, Some(&sigchld_set()), None) {
        log::warn!("blocking SIGCHLD failed: {}", e);
    }
}

pub(crate) fn unblock_sigchld() {
    if let Err(e) = signal::sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&sigchld_set()), None) {
        log::warn!("unblocking SIGCHLD failed: {}", e);
    }
}

/// Record a newly forked child. Call with SIGCHLD blocked, so the
/// registration happens before the termination can be observed.
pub(crate) fn note_child_born() {
    NUM_CHILD.fetch_add(1, Ordering::SeqCst);
}

pub(crate) fn live_children() -> i64 {
    NUM_CHILD.load(Ordering::SeqCst)
}

/// Withhold new acceptance until capacity frees up: sleep until any signal
/// arrives (normally the termination notification), then re-check.
pub(crate) fn wait_admission(max_children: i64) {
    while live_children() >= max_children {
        log::info!("max-children are active, waiting");
        nix::unistd::pause();
    }
}

/// Block until every live child has exited.
pub(crate) fn drain_children() {
    loop {
        match wait::wait() {
            Ok(_) => continue,
            Err(Errno::ECHILD) => break,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                log::warn!("wait(): {}", e);
                break;
            }
        }
    }
    NUM_CHILD.store(0, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_bookkeeping() {
        let before = live_children();
        note_child_born();
        note_child_born();
        assert_eq!(live_children(), before + 2);
        NUM_CHILD.store(before, Ordering::SeqCst);
    }

    #[test]
    fn test_register_and_reset() {
        register_reaper().unwrap();
        reset_reaper();
    }

    #[test]
    fn test_block_unblock() {
        block_sigchld();
        let blocked = SigSet::thread_get_mask().unwrap();
        assert!(blocked.contains(Signal::SIGCHLD));
        unblock_sigchld();
        let blocked = SigSet::thread_get_mask().unwrap();
        assert!(!blocked.contains(Signal::SIGCHLD));
    }
}
