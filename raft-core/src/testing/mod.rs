//! Deterministic test harness: an in-memory [`Io`](crate::Io)
//! implementation, a tiny arithmetic state machine and a cluster simulator
//! driving up to eight engines through virtual time.
//!
//! The fixture checks the classic Raft safety properties (Election Safety,
//! Leader Append-Only) and every engine's internal invariants on each step,
//! so scenario tests get safety checking for free.

mod fixture;
mod fsm;
mod io;

pub use fixture::Cluster;
pub use fsm::TestFsm;
pub use io::Delivery;
pub use io::StubIo;

/// Install a tracing subscriber honoring `RUST_LOG`, once per process.
pub fn init_tracing() {
    use std::sync::Once;

    static START: Once = Once::new();
    START.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
