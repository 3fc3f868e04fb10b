use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use nix::sys::socket::SockType;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult};

use solisten::listen;
use solisten::listen_config::{parse_socket_address, ListenConfig};
use solisten::listen_opts::{OptDirective, OptPhase, OptSet, OptValue, OPT_MODE};
use solisten::ListenFlags;

fn connect_tcp(addr: &str) -> TcpStream {
    for _ in 0..200 {
        if let Ok(s) = TcpStream::connect(addr) {
            return s;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("no listener at {}", addr);
}

#[test]
fn test_accept_consumes_listener() {
    let sa = parse_socket_address("127.0.0.1:31466", SockType::Stream).unwrap();
    let config = Rc::new(ListenConfig::new(sa));

    let client = thread::spawn(|| {
        let mut stream = connect_tcp("127.0.0.1:31466");
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).unwrap();
        buf
    });

    let port = listen(&config, &OptSet::new(), ListenFlags::empty()).unwrap();

    // the handle now holds the accepted connection, not the listener
    assert!(nix::sys::socket::getpeername::<nix::sys::socket::SockaddrStorage>(port.fd()).is_ok());
    nix::unistd::write(port.fd(), b"hello").unwrap();

    assert_eq!(&client.join().unwrap(), b"hello");
    port.close();
}

#[test]
fn test_unix_accept_applies_mode() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("accept.sock");
    let spec = path.to_str().unwrap().to_string();

    let sa = parse_socket_address(&spec, SockType::Stream).unwrap();
    let config = Rc::new(ListenConfig::new(sa));

    let mut opts = OptSet::new();
    opts.push(OptDirective::new(
        OPT_MODE,
        OptPhase::Fd,
        OptValue::Int(0o600),
    ));

    let spec2 = spec.clone();
    let client = thread::spawn(move || {
        for _ in 0..200 {
            if let Ok(mut s) = UnixStream::connect(&spec2) {
                let mut buf = [0u8; 2];
                s.read_exact(&mut buf).unwrap();
                return buf;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("no listener at {}", spec2);
    });

    let port = listen(&config, &opts, ListenFlags::empty()).unwrap();

    let mode = std::fs::metadata(&path).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);

    nix::unistd::write(port.fd(), b"ok").unwrap();
    assert_eq!(&client.join().unwrap(), b"ok");
    port.close();
    assert!(!path.exists());
}

#[test]
fn test_fork_services_connections_and_caps_children() {
    // The forking listener lives in its own process. Every accepted
    // connection is handed to a child that confirms its exported pid,
    // greets the peer and holds the connection until released; with
    // max-children 1 the second connection must stay unserviced while the
    // first child is alive.
    let listener = match unsafe { fork() }.unwrap() {
        ForkResult::Child => {
            let sa = parse_socket_address("127.0.0.1:31468", SockType::Stream).unwrap();
            let config = Rc::new(ListenConfig::new(sa));

            let mut opts = OptSet::new();
            opts.push(OptDirective::new(
                solisten::listen_opts::OPT_FORK,
                OptPhase::PastAccept,
                OptValue::Bool(true),
            ));
            opts.push(OptDirective::new(
                solisten::listen_opts::OPT_MAX_CHILDREN,
                OptPhase::PastAccept,
                OptValue::Int(1),
            ));
            opts.push(OptDirective::new(
                solisten::listen_opts::OPT_ACCEPT_TIMEOUT,
                OptPhase::Listen,
                OptValue::Duration(Duration::from_secs(1)),
            ));

            // only the per-connection children ever get here; the
            // listening parent leaves through the timeout path
            let port = match listen(&config, &opts, ListenFlags::MAY_FORK) {
                Ok(p) => p,
                Err(_) => std::process::exit(1),
            };

            let me = nix::unistd::getpid().to_string();
            let exported = std::env::vars().any(|(k, v)| k.ends_with("_PID") && v == me);
            let greeting: &[u8] = if exported { b"R" } else { b"X" };
            let _ = nix::unistd::write(port.fd(), greeting);

            let mut byte = [0u8; 1];
            let _ = nix::unistd::read(port.fd(), &mut byte);
            std::process::exit(0);
        }
        ForkResult::Parent { child } => child,
    };

    let mut first = connect_tcp("127.0.0.1:31468");
    let mut buf = [0u8; 1];
    first.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"R");

    // capacity 1 is taken: the second connection sits in the queue
    let mut second = connect_tcp("127.0.0.1:31468");
    second
        .set_read_timeout(Some(Duration::from_millis(300)))
        .unwrap();
    assert!(second.read_exact(&mut buf).is_err());

    // release the first child; its exit frees the slot
    first.write_all(b".").unwrap();
    second.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    second.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"R");
    second.write_all(b".").unwrap();

    assert_eq!(waitpid(listener, None).unwrap(), WaitStatus::Exited(listener, 0));
}

#[test]
fn test_timeout_after_rejection_exits_clean() {
    // The listener lives in its own process: a peer outside the permitted
    // range is refused, then the accept timeout expires without any other
    // connection and the process exits with status 0.
    let child = match unsafe { fork() }.unwrap() {
        ForkResult::Child => {
            let sa = parse_socket_address("127.0.0.1:31467", SockType::Stream).unwrap();
            let config = Rc::new(ListenConfig::new(sa));

            let mut opts = OptSet::new();
            opts.push(OptDirective::new(
                solisten::listen_opts::OPT_RANGE,
                OptPhase::PastAccept,
                OptValue::String("10.0.0.0/8".to_string()),
            ));
            opts.push(OptDirective::new(
                solisten::listen_opts::OPT_ACCEPT_TIMEOUT,
                OptPhase::Listen,
                OptValue::Duration(Duration::from_secs(1)),
            ));

            let _ = listen(&config, &opts, ListenFlags::empty());
            // a refused-only run must leave through the timeout path
            std::process::exit(1);
        }
        ForkResult::Parent { child } => child,
    };

    let mut stream = connect_tcp("127.0.0.1:31467");
    // the refusal shuts the connection down; read sees EOF or a reset
    let mut buf = [0u8; 1];
    let _ = stream.read(&mut buf);

    assert_eq!(waitpid(child, None).unwrap(), WaitStatus::Exited(child, 0));
}
