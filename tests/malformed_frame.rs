//! A connection that sends garbage bytes instead of a valid frame is
//! disconnected on its own; every other connection, and the context as a
//! whole, keeps working.

mod support;

use std::io::Write;
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pomp::wire::Value;
use pomp::{Address, Config, Context, Event};
use support::{pump_until, Record};

#[test_log::test]
fn malformed_peer_is_dropped_without_taking_down_the_context() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let sock_path = dir.path().join("pomp.sock");
    let addr = Address::parse(&format!("unix:{}", sock_path.display()))?;

    let records: Arc<Mutex<Vec<Record>>> = Arc::new(Mutex::new(Vec::new()));
    let r = records.clone();
    let mut server = Context::listen(&addr, Config::default(), move |_ctx, event| match event {
        Event::Connected(id) => r.lock().unwrap().push(Record::Connected(id)),
        Event::Disconnected(id) => r.lock().unwrap().push(Record::Disconnected(id)),
        Event::Msg(id, _msg) => r.lock().unwrap().push(Record::Msg(id, 0)),
        Event::DgramMsg(..) => unreachable!(),
    })?;

    let mut raw = UnixStream::connect(&sock_path)?;

    pump_until(&mut [&mut server], || !records.lock().unwrap().is_empty(), Duration::from_secs(2));
    let connects_before = records.lock().unwrap().iter().filter(|r| matches!(r, Record::Connected(_))).count();
    assert_eq!(connects_before, 1);

    // Twelve bytes that pass the header-length check but carry a bad magic.
    raw.write_all(&[0xffu8; 12])?;

    let dropped = pump_until(
        &mut [&mut server],
        || records.lock().unwrap().iter().any(|r| matches!(r, Record::Disconnected(_))),
        Duration::from_secs(2),
    );
    assert!(dropped, "the malformed connection was never dropped");

    // A well-behaved second client should still be able to connect and
    // exchange a message, proving the context survived the garbage peer.
    let second_connected = Arc::new(Mutex::new(false));
    let sc = second_connected.clone();
    let mut client = Context::connect(addr, Config::default(), move |ctx, event| {
        if let Event::Connected(id) = event {
            *sc.lock().unwrap() = true;
            let mut msg = pomp::wire::Message::init(1);
            msg.write("%u", vec![Value::U32(5)]).unwrap();
            msg.finish().unwrap();
            ctx.send_msg(id, &msg).unwrap();
        }
    })?;

    let got_second = pump_until(
        &mut [&mut server, &mut client],
        || *second_connected.lock().unwrap() && records.lock().unwrap().iter().any(|r| matches!(r, Record::Msg(_, 0))),
        Duration::from_secs(2),
    );
    assert!(got_second, "the context stopped accepting new connections after the malformed peer");

    Ok(())
}
