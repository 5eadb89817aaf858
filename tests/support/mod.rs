//! Shared helpers for the integration tests: driving one or more
//! [`pomp::Context`]s by hand, the way a real caller's own event loop would,
//! without any of this crate's own async/threaded machinery (there isn't
//! any — `wait_and_process` is meant to be pumped exactly like this).

use std::time::{Duration, Instant};

use pomp::Context;

/// A simplified record of one dispatched [`pomp::Event`], stripped of the
/// borrowed/owned `Message`/fd payloads so it can sit in a plain
/// `Arc<Mutex<Vec<Record>>>` shared between a context's callback and the
/// test body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Connected(pomp::context::ConnectionId),
    Disconnected(pomp::context::ConnectionId),
    Msg(pomp::context::ConnectionId, u32),
    DgramMsg(u32),
}

/// Repeatedly pumps every context in `ctxs` with a short timeout each,
/// until `done` reports success or `overall` elapses. Returns whatever
/// `done` returned on the final check.
pub fn pump_until(ctxs: &mut [&mut Context], mut done: impl FnMut() -> bool, overall: Duration) -> bool {
    let deadline = Instant::now() + overall;
    loop {
        if done() {
            return true;
        }
        if Instant::now() >= deadline {
            return done();
        }
        for ctx in ctxs.iter_mut() {
            let _ = ctx.wait_and_process(Some(Duration::from_millis(20)));
        }
    }
}
