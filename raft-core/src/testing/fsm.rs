use bytes::Buf;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;

use crate::error::Error;
use crate::io::Fsm;

/// A state machine holding a single counter.
///
/// Commands are 8-byte little-endian increments; snapshots serialize the
/// counter. The fixture's scenario tests read the counter and the restore
/// count to verify State Machine Safety end to end.
#[derive(Debug, Default)]
pub struct TestFsm {
    x: u64,
    n_applied: u64,
    n_restored: u64,
}

impl TestFsm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode a command adding `v` to the counter.
    pub fn encode_add(v: u64) -> Bytes {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u64_le(v);
        buf.freeze()
    }

    pub fn x(&self) -> u64 {
        self.x
    }

    pub fn n_applied(&self) -> u64 {
        self.n_applied
    }

    pub fn n_restored(&self) -> u64 {
        self.n_restored
    }
}

impl Fsm for TestFsm {
    fn apply(&mut self, payload: &Bytes) -> Result<(), Error> {
        if payload.len() != 8 {
            return Err(Error::io(format!("bad command payload length {}", payload.len())));
        }
        let mut buf = &payload[..];
        self.x = self.x.wrapping_add(buf.get_u64_le());
        self.n_applied += 1;
        Ok(())
    }

    fn snapshot(&mut self) -> Result<Bytes, Error> {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u64_le(self.x);
        Ok(buf.freeze())
    }

    fn restore(&mut self, data: Bytes) -> Result<(), Error> {
        if data.len() != 8 {
            return Err(Error::io(format!("bad snapshot length {}", data.len())));
        }
        let mut buf = &data[..];
        self.x = buf.get_u64_le();
        self.n_restored += 1;
        Ok(())
    }
}
