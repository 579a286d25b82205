//! Notify datagrams as a supervisor would receive them.

use std::net::TcpListener;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixDatagram;
use std::time::Duration;

use gone_core::Registry;
use gone_notify::{spawn_watchdog, NotifyAddr, NotifyMessage, NotifyState, Notifier, StatusKind};
use tokio_util::sync::CancellationToken;

/// Receives one datagram and any descriptors passed with it.
fn recv_with_fds(sock: &UnixDatagram) -> (String, Vec<OwnedFd>) {
    let mut buf = vec![0u8; 4096];
    let mut control = vec![0u64; 1024];
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = (control.len() * 8) as _;

    let n = unsafe { libc::recvmsg(sock.as_raw_fd(), &mut msg, libc::MSG_CMSG_CLOEXEC) };
    assert!(n >= 0, "recvmsg: {}", std::io::Error::last_os_error());

    let mut fds = Vec::new();
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data = libc::CMSG_DATA(cmsg).cast::<RawFd>();
                let len = (*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                for i in 0..len / std::mem::size_of::<RawFd>() {
                    fds.push(OwnedFd::from_raw_fd(*data.add(i)));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    buf.truncate(n as usize);
    (String::from_utf8(buf).unwrap(), fds)
}

fn supervisor() -> (tempfile::TempDir, UnixDatagram, Notifier) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notify.sock");
    let sock = UnixDatagram::bind(&path).unwrap();
    sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    (dir, sock, Notifier::new(NotifyAddr::Path(path)))
}

#[test]
fn test_status_reaches_supervisor() {
    let (_dir, sock, notifier) = supervisor();

    notifier
        .notify_status(StatusKind::Reloading, "generation 2")
        .unwrap();
    notifier.notify_main_pid(4242).unwrap();

    let (first, fds) = recv_with_fds(&sock);
    assert_eq!(first, "RELOADING=1\nSTATUS=generation 2");
    assert!(fds.is_empty());

    let (second, _) = recv_with_fds(&sock);
    assert_eq!(second, "MAINPID=4242");
}

#[test]
fn test_fdstore_groups_by_name() {
    let (_dir, sock, notifier) = supervisor();
    let registry = Registry::new();

    let web_a = TcpListener::bind("127.0.0.1:0").unwrap();
    let web_b = TcpListener::bind("127.0.0.1:0").unwrap();
    let anon = TcpListener::bind("127.0.0.1:0").unwrap();
    registry.export("web", &web_a).unwrap();
    registry.export("web", &web_b).unwrap();
    registry.export("", &anon).unwrap();

    let message = NotifyMessage::new().with(NotifyState::Ready);
    let sent = notifier.notify_with_fds(&message, &registry).unwrap();
    assert_eq!(sent, 2);

    // Groups are sent in name order, so the anonymous one comes first.
    let (payload, fds) = recv_with_fds(&sock);
    assert_eq!(payload, "READY=1\nFDSTORE=1");
    assert_eq!(fds.len(), 1);
    let received = TcpListener::from(fds.into_iter().next().unwrap());
    assert_eq!(
        received.local_addr().unwrap(),
        anon.local_addr().unwrap()
    );

    let (payload, fds) = recv_with_fds(&sock);
    assert_eq!(payload, "READY=1\nFDSTORE=1\nFDNAME=web");
    assert_eq!(fds.len(), 2);

    // The registry keeps its own copies.
    assert_eq!(registry.active_count(), 3);
}

#[test]
fn test_fdstore_without_descriptors_sends_message_only() {
    let (_dir, sock, notifier) = supervisor();
    let registry = Registry::new();

    let message = NotifyMessage::new().with(NotifyState::Stopping);
    assert_eq!(notifier.notify_with_fds(&message, &registry).unwrap(), 1);

    let (payload, fds) = recv_with_fds(&sock);
    assert_eq!(payload, "STOPPING=1");
    assert!(fds.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_pings_until_cancelled() {
    let (_dir, sock, notifier) = supervisor();
    sock.set_nonblocking(true).unwrap();
    let token = CancellationToken::new();

    let handle = spawn_watchdog(notifier, Duration::from_secs(2), token.clone());

    // First tick fires immediately, then once per second.
    tokio::time::sleep(Duration::from_millis(2500)).await;
    token.cancel();
    handle.await.unwrap();

    let mut pings = 0;
    let mut buf = [0u8; 64];
    while let Ok(n) = sock.recv(&mut buf) {
        assert_eq!(&buf[..n], b"WATCHDOG=1");
        pings += 1;
    }
    assert_eq!(pings, 3);
}
