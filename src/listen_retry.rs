//! listen_retry wraps the listener lifecycle with the outer retry/backoff
//! policy. Only this layer decides between retrying and giving up; every
//! layer below merely classifies its failures.
//!
use crate::error::*;
use crate::listen_accept;
use crate::listen_config::ListenConfig;
use crate::listen_opts::OptSet;
use crate::listen_port::{ListenFlags, ListenPort};
use std::rc::Rc;

/// Open a listening endpoint and block until a connection has been
/// accepted and adopted by this process. With a `fork` directive the call
/// returns in a child process holding the connection, while the parent
/// keeps accepting; without it, the returned handle's descriptor is the
/// accepted connection (the listener is consumed).
pub fn listen(config: &Rc<ListenConfig>, opts: &OptSet, flags: ListenFlags) -> Result<ListenPort> {
    let port = ListenPort::new(config, flags);

    // inconsistent directive sets never reach a socket operation
    listen_accept::check_preconditions(&port, opts)?;

    run_attempts(&port, config.interval, opts, |p, o, level| {
        p.open_listen(o, level)?;
        listen_accept::accept_loop(p, o, level)
    })?;

    Ok(port)
}

/// Drive `attempt` until it succeeds, the retry budget is exhausted, or a
/// final failure arrives. Each new attempt starts from a fresh copy of the
/// original directive set.
pub(crate) fn run_attempts<F>(
    port: &ListenPort,
    interval: std::time::Duration,
    opts0: &OptSet,
    mut attempt: F,
) -> Result<()>
where
    F: FnMut(&ListenPort, &mut OptSet, log::Level) -> Result<()>,
{
    // a failure that will be retried is not worth an error-level line
    let level = if port.retry_enabled() {
        log::Level::Info
    } else {
        log::Level::Error
    };

    let mut opts = opts0.clone();
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        let e = match attempt(port, &mut opts, level) {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        match e.retriable() {
            Retriable::Later | Retriable::Now => {
                if !port.retry_enabled() {
                    return Err(Error::RetryExhausted {
                        attempts,
                        source: Box::new(e),
                    });
                }

                opts.reset_from(opts0);
                if e.retriable() == Retriable::Later {
                    log::info!("retrying in {:?}", interval);
                    std::thread::sleep(interval);
                }
                port.consume_retry();
            }
            Retriable::Never => return Err(e),
        }
    }
}
