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

//! error definitions
use nix::errno::Errno;
use snafu::prelude::*;
#[allow(unused_imports)]
pub use snafu::ResultExt;

/// What the retry wrapper is allowed to do with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retriable {
    /// retry after sleeping the configured interval
    Later,
    /// retry immediately
    Now,
    /// final, regardless of any remaining retry budget
    Never,
}

#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("socket(): {}", source))]
    Socket { source: Errno },

    #[snafu(display("bind({}, {}): {}", fd, addr, source))]
    Bind {
        fd: i32,
        addr: String,
        source: Errno,
    },

    #[snafu(display("listen({}, {}): {}", fd, backlog, source))]
    Listen {
        fd: i32,
        backlog: i64,
        source: Errno,
    },

    #[snafu(display("accept({}): {}", fd, source))]
    Accept { fd: i32, source: Errno },

    #[snafu(display("fork(): {}", source))]
    Fork { source: Errno },

    #[snafu(display("{}: {}", syscall, source))]
    Interrupted {
        syscall: &'static str,
        source: Errno,
    },

    #[snafu(display("Errno: {}", source))]
    Nix { source: Errno },

    #[snafu(display("invalid option: {}", what))]
    Options { what: String },

    #[snafu(display("invalid range: '{}'", what))]
    Range { what: String },

    #[snafu(display("invalid address: '{}'", what))]
    Parse { what: String },

    #[snafu(display("configuration: {}", source))]
    Config { source: confique::Error },

    #[snafu(display("giving up after {} attempts: {}", attempts, source))]
    RetryExhausted { attempts: u32, source: Box<Error> },
}

impl Error {
    /// Classify the failure for the outer retry wrapper.
    pub fn retriable(&self) -> Retriable {
        match self {
            Self::Socket { .. }
            | Self::Bind { .. }
            | Self::Listen { .. }
            | Self::Accept { .. }
            | Self::Fork { .. }
            | Self::Nix { .. } => Retriable::Later,
            Self::Interrupted { .. } => Retriable::Now,
            Self::Options { .. }
            | Self::Range { .. }
            | Self::Parse { .. }
            | Self::Config { .. }
            | Self::RetryExhausted { .. } => Retriable::Never,
        }
    }
}

///
pub type Result<T, E = Error> = std::result::Result<T, E>;
