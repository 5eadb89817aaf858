//! A server with three live connections broadcasts one message; all three
//! see identical bytes.

mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use pomp::wire::{DecodedValue, Value};
use pomp::{Address, Config, Context, Event};
use support::pump_until;

#[test]
fn broadcast_reaches_every_peer() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let sock_path = dir.path().join("pomp.sock");
    let addr = Address::parse(&format!("unix:{}", sock_path.display()))?;

    let connected_count = Arc::new(Mutex::new(0usize));
    let cc = connected_count.clone();
    let mut server = Context::listen(&addr, Config::default(), move |_ctx, event| {
        if let Event::Connected(_) = event {
            *cc.lock().unwrap() += 1;
        }
    })?;

    let mut received: Vec<Arc<Mutex<Vec<u32>>>> = Vec::new();
    let mut clients = Vec::new();
    for _ in 0..3 {
        let got = Arc::new(Mutex::new(Vec::new()));
        let g = got.clone();
        let client = Context::connect(addr.clone(), Config::default(), move |_ctx, event| {
            if let Event::Msg(_, msg) = event {
                let vals = msg.read("%u").unwrap();
                if let DecodedValue::U32(n) = &vals[0] {
                    g.lock().unwrap().push(*n);
                }
            }
        })?;
        received.push(got);
        clients.push(client);
    }

    let mut all: Vec<&mut Context> = std::iter::once(&mut server).chain(clients.iter_mut()).collect();
    let all_connected = pump_until(&mut all, || *connected_count.lock().unwrap() == 3, Duration::from_secs(2));
    assert!(all_connected, "not all three clients connected");

    let mut msg = pomp::wire::Message::init(9);
    msg.write("%u", vec![Value::U32(777)])?;
    msg.finish()?;
    all[0].broadcast(&msg)?;

    let all_received = pump_until(
        &mut all,
        || received.iter().all(|r| r.lock().unwrap().contains(&777)),
        Duration::from_secs(2),
    );
    assert!(all_received, "not every peer received the broadcast");

    Ok(())
}
