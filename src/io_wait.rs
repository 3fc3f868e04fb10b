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

//! readability waits
use crate::error::*;
use nix::{
    errno::Errno,
    libc,
    poll::{self, PollFd, PollFlags},
    sys::{signal::SigSet, time::TimeSpec},
};
use std::os::unix::prelude::RawFd;
use std::time::Duration;

fn ppoll_timeout(fds: &mut [PollFd], timeout: Option<TimeSpec>) -> Result<libc::c_int> {
    if fds.is_empty() {
        return Ok(0);
    }

    let ret = match poll::ppoll(fds, timeout, SigSet::empty()) {
        Ok(n) => n,
        Err(Errno::EINTR) => {
            return Err(Error::Interrupted {
                syscall: "ppoll",
                source: Errno::EINTR,
            })
        }
        Err(e) => return Err(Error::Nix { source: e }),
    };

    if ret == 0 {
        return Ok(0);
    }

    for item in fds {
        if item.revents().is_none() {
            continue;
        }

        if item.revents().unwrap().eq(&PollFlags::POLLNVAL) {
            return Err(Error::Nix {
                source: Errno::EBADF,
            });
        }
    }

    Ok(ret)
}

/// Wait until the fd becomes readable, up to `timeout` (`None` waits
/// forever). Returns false if the timeout elapsed with no event.
pub(crate) fn wait_for_readable(fd: RawFd, timeout: Option<Duration>) -> Result<bool> {
    let poll_fd = PollFd::new(fd, PollFlags::POLLIN);
    let time_spec = timeout.map(|t| {
        TimeSpec::from_timespec(libc::timespec {
            tv_sec: t.as_secs() as libc::time_t,
            tv_nsec: t.subsec_nanos() as libc::c_long,
        })
    });
    let mut fds = [poll_fd];

    let ret = ppoll_timeout(&mut fds, time_spec)?;

    Ok(ret > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd;

    #[test]
    fn test_wait_timeout_and_ready() {
        let (rfd, wfd) = unistd::pipe().unwrap();

        // nothing written yet, a short wait must run out
        let ready = wait_for_readable(rfd, Some(Duration::from_millis(10))).unwrap();
        assert!(!ready);

        unistd::write(wfd, b"x").unwrap();
        let ready = wait_for_readable(rfd, Some(Duration::from_secs(5))).unwrap();
        assert!(ready);

        unistd::close(rfd).unwrap();
        unistd::close(wfd).unwrap();
    }
}
