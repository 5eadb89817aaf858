//! A server and a client exchange one message each way over a Unix-domain
//! stream socket.

mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use pomp::wire::{DecodedValue, Value};
use pomp::{Address, Config, Context, Event};
use support::{pump_until, Record};

#[test_log::test]
fn unix_socket_roundtrip() -> anyhow::Result<()> {
    use rand::Rng;
    // A random socket filename per run avoids collisions between parallel
    // test invocations sharing the same tempdir root.
    let dir = tempfile::tempdir()?;
    let sock_path = dir.path().join(format!("pomp-{}.sock", rand::rng().random_range(0..1_000_000u32)));
    let addr = Address::parse(&format!("unix:{}", sock_path.display()))?;

    let server_records: Arc<Mutex<Vec<Record>>> = Arc::new(Mutex::new(Vec::new()));
    let sr = server_records.clone();
    let mut server = Context::listen(&addr, Config::default(), move |ctx, event| match event {
        Event::Connected(id) => sr.lock().unwrap().push(Record::Connected(id)),
        Event::Disconnected(id) => sr.lock().unwrap().push(Record::Disconnected(id)),
        Event::Msg(id, msg) => {
            let vals = msg.read("%u%s").unwrap();
            if let DecodedValue::U32(n) = &vals[0] {
                sr.lock().unwrap().push(Record::Msg(id, *n));
            }
            let mut reply = pomp::wire::Message::init(2);
            reply
                .write("%u", vec![Value::U32(100)])
                .unwrap();
            reply.finish().unwrap();
            ctx.send_msg(id, &reply).unwrap();
        }
        Event::DgramMsg(..) => unreachable!(),
    })?;

    let client_records: Arc<Mutex<Vec<Record>>> = Arc::new(Mutex::new(Vec::new()));
    let cr = client_records.clone();
    let mut client = Context::connect(addr, Config::default(), move |_ctx, event| match event {
        Event::Connected(id) => cr.lock().unwrap().push(Record::Connected(id)),
        Event::Disconnected(id) => cr.lock().unwrap().push(Record::Disconnected(id)),
        Event::Msg(id, msg) => {
            let vals = msg.read("%u").unwrap();
            if let DecodedValue::U32(n) = &vals[0] {
                cr.lock().unwrap().push(Record::Msg(id, *n));
            }
        }
        Event::DgramMsg(..) => unreachable!(),
    })?;

    let connected = pump_until(
        &mut [&mut server, &mut client],
        || !client_records.lock().unwrap().is_empty(),
        Duration::from_secs(2),
    );
    assert!(connected, "client never observed Connected");

    let client_conn_id = match client_records.lock().unwrap()[0] {
        Record::Connected(id) => id,
        _ => panic!("expected Connected first"),
    };

    let mut ping = pomp::wire::Message::init(1);
    ping.write("%u%s", vec![Value::U32(42), Value::Str(std::ffi::CString::new("hi").unwrap())])?;
    ping.finish()?;
    client.send_msg(client_conn_id, &ping)?;

    let got_reply = pump_until(
        &mut [&mut server, &mut client],
        || client_records.lock().unwrap().iter().any(|r| matches!(r, Record::Msg(_, 100))),
        Duration::from_secs(2),
    );
    assert!(got_reply, "client never got the server's reply");

    assert!(server_records.lock().unwrap().iter().any(|r| matches!(r, Record::Msg(_, 42))));

    Ok(())
}
