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

//!
use crate::error::*;
use nix::{
    fcntl::{FcntlArg, FdFlag, OFlag},
    sys::socket::{self, sockopt},
};
use std::{os::unix::prelude::RawFd, path::Path};

///
pub fn ipv6_is_supported() -> bool {
    let inet6 = Path::new("/proc/net/if_inet6");

    if inet6.exists() {
        return true;
    }

    false
}

///
pub fn set_reuse_addr(fd: RawFd, v: bool) -> Result<()> {
    socket::setsockopt(fd, sockopt::ReuseAddr, &v).context(NixSnafu)
}

///
pub fn set_pass_cred(fd: RawFd, v: bool) -> Result<()> {
    socket::setsockopt(fd, sockopt::PassCred, &v).context(NixSnafu)
}

///
pub fn set_receive_buffer(fd: RawFd, v: usize) -> Result<()> {
    socket::setsockopt(fd, sockopt::RcvBuf, &v).context(NixSnafu)
}

///
pub fn set_send_buffer(fd: RawFd, v: usize) -> Result<()> {
    socket::setsockopt(fd, sockopt::SndBuf, &v).context(NixSnafu)
}

/// Set keepalive properties
pub fn set_keepalive_state(fd: RawFd, v: bool) -> Result<()> {
    socket::setsockopt(fd, sockopt::KeepAlive, &v).context(NixSnafu)
}

///
pub fn fd_nonblock(fd: RawFd, nonblock: bool) -> Result<()> {
    assert!(fd >= 0);

    let flags = nix::fcntl::fcntl(fd, FcntlArg::F_GETFL).context(NixSnafu)?;
    let fd_flag = unsafe { OFlag::from_bits_unchecked(flags) };

    let nflag = match nonblock {
        true => fd_flag | OFlag::O_NONBLOCK,
        false => fd_flag & !OFlag::O_NONBLOCK,
    };

    if nflag == fd_flag {
        return Ok(());
    }

    nix::fcntl::fcntl(fd, FcntlArg::F_SETFL(nflag)).context(NixSnafu)?;

    Ok(())
}

///
pub fn fd_cloexec(fd: RawFd, cloexec: bool) -> Result<()> {
    assert!(fd >= 0);

    let flags = nix::fcntl::fcntl(fd, FcntlArg::F_GETFD).context(NixSnafu)?;

    let fd_flag = unsafe { FdFlag::from_bits_unchecked(flags) };

    let nflag = match cloexec {
        true => fd_flag | FdFlag::FD_CLOEXEC,
        false => fd_flag & !FdFlag::FD_CLOEXEC,
    };

    nix::fcntl::fcntl(fd, FcntlArg::F_SETFD(nflag)).context(NixSnafu)?;

    Ok(())
}

///
pub fn close(fd: RawFd) {
    if let Err(e) = nix::unistd::close(fd) {
        log::warn!("close fd {} failed, errno: {}", fd, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::{self, AddressFamily, SockFlag, SockType};

    #[test]
    fn test_sockopts() {
        let fd = socket::socket(
            AddressFamily::Inet,
            SockType::Stream,
            SockFlag::empty(),
            None,
        )
        .unwrap();

        assert!(set_reuse_addr(fd, true).is_ok());
        assert!(socket::getsockopt(fd, sockopt::ReuseAddr).unwrap());

        assert!(set_keepalive_state(fd, true).is_ok());
        assert!(socket::getsockopt(fd, sockopt::KeepAlive).unwrap());

        assert!(set_receive_buffer(fd, 16 * 1024).is_ok());
        assert!(set_send_buffer(fd, 16 * 1024).is_ok());

        close(fd);
    }

    #[test]
    fn test_fd_flags() {
        let fd = socket::socket(
            AddressFamily::Inet,
            SockType::Stream,
            SockFlag::empty(),
            None,
        )
        .unwrap();

        assert!(fd_cloexec(fd, true).is_ok());
        let flags = nix::fcntl::fcntl(fd, FcntlArg::F_GETFD).unwrap();
        assert!(FdFlag::from_bits(flags).unwrap().contains(FdFlag::FD_CLOEXEC));

        assert!(fd_nonblock(fd, true).is_ok());
        let flags = nix::fcntl::fcntl(fd, FcntlArg::F_GETFL).unwrap();
        assert!(unsafe { OFlag::from_bits_unchecked(flags) }.contains(OFlag::O_NONBLOCK));

        close(fd);
    }
}
