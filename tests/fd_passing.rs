//! A file descriptor sent as ancillary data on a Unix-domain connection
//! keeps working on the receiving end after the sender's own copy has been
//! closed.

mod support;

use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pomp::context::ConnectionId;
use pomp::wire::{DecodedValue, Value};
use pomp::{Address, Config, Context, Event};
use support::pump_until;

#[test]
fn received_fd_outlives_the_senders_own_handle() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let sock_path = dir.path().join("pomp.sock");
    let addr = Address::parse(&format!("unix:{}", sock_path.display()))?;

    let received_fd: Arc<Mutex<Option<OwnedFd>>> = Arc::new(Mutex::new(None));
    let rf = received_fd.clone();
    let mut server = Context::listen(&addr, Config::default(), move |_ctx, event| {
        if let Event::Msg(_, msg) = event {
            let vals = msg.read("%x").unwrap();
            if let DecodedValue::Fd(fd) = &vals[0] {
                *rf.lock().unwrap() = Some(fd.try_clone().unwrap());
            }
        }
    })?;

    let client_id: Arc<Mutex<Option<ConnectionId>>> = Arc::new(Mutex::new(None));
    let cid = client_id.clone();
    let mut client = Context::connect(addr, Config::default(), move |_ctx, event| {
        if let Event::Connected(id) = event {
            *cid.lock().unwrap() = Some(id);
        }
    })?;

    let connected = pump_until(
        &mut [&mut server, &mut client],
        || client_id.lock().unwrap().is_some(),
        Duration::from_secs(2),
    );
    assert!(connected, "client never connected");
    let id = client_id.lock().unwrap().unwrap();

    // Write known bytes into one end of a connected pair, then hand the
    // other end off as ancillary data; keep a raw fd number to prove the
    // receiver's copy is a distinct descriptor afterward.
    let (carried, mut keep) = UnixStream::pair()?;
    keep.write_all(b"hello through the fd")?;
    drop(keep);
    let carried_raw = carried.as_raw_fd();
    let carried_owned: OwnedFd = carried.into();

    let mut msg = pomp::wire::Message::init(3);
    msg.write("%x", vec![Value::Fd(carried_owned)])?;
    msg.finish()?;
    client.send_msg(id, &msg)?;
    drop(msg);

    let got_fd = pump_until(
        &mut [&mut server, &mut client],
        || received_fd.lock().unwrap().is_some(),
        Duration::from_secs(2),
    );
    assert!(got_fd, "server never received the fd");

    // The sender's own descriptor (and the message that held it) is long
    // gone by now; only the kernel-duplicated copy the server holds
    // remains live.
    let owned = received_fd.lock().unwrap().take().unwrap();
    assert_ne!(owned.as_raw_fd(), carried_raw);

    let mut stream = unsafe { UnixStream::from_raw_fd(owned.into_raw_fd()) };
    let mut buf = [0u8; 64];
    let n = stream.read(&mut buf)?;
    assert_eq!(&buf[..n], b"hello through the fd");

    Ok(())
}
