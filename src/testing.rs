//! In-memory controller used by unit tests.

use crate::connection::{Error, Transport};
use crate::modbus::{MAX_READ_COUNT, MAX_WRITE_COUNT};
use crate::registers::split_u32;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Exception code a real controller answers with for unavailable registers.
const ILLEGAL_DATA_ADDRESS: u8 = 2;

/// A register image with a log of every request made against it.
///
/// Unset registers read as zero.
#[derive(Default)]
pub struct MockTransport {
    registers: Mutex<BTreeMap<u16, u16>>,
    reads: Mutex<Vec<(u16, u16)>>,
    writes: Mutex<Vec<(u16, Vec<u16>)>>,
    failing: Mutex<BTreeSet<u16>>,
    disconnected: AtomicBool,
    reconnects: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, address: u16, value: u16) {
        self.registers.lock().unwrap().insert(address, value);
    }

    pub fn set_many(&self, address: u16, values: &[u16]) {
        let mut registers = self.registers.lock().unwrap();
        for (offset, value) in values.iter().enumerate() {
            registers.insert(address + offset as u16, *value);
        }
    }

    pub fn set_u32(&self, address: u16, value: u32) {
        let (high, low) = split_u32(value);
        self.set_many(address, &[high, low]);
    }

    pub fn get(&self, address: u16) -> u16 {
        self.registers.lock().unwrap().get(&address).copied().unwrap_or(0)
    }

    /// `(address, count)` of every read request, in order.
    pub fn reads(&self) -> Vec<(u16, u16)> {
        self.reads.lock().unwrap().clone()
    }

    pub fn writes(&self) -> Vec<(u16, Vec<u16>)> {
        self.writes.lock().unwrap().clone()
    }

    /// Answer any request touching `address` with an exception.
    pub fn fail_at(&self, address: u16) {
        self.failing.lock().unwrap().insert(address);
    }

    pub fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }

    pub fn reconnects(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }

    fn check(&self, function: u8, address: u16, count: usize) -> Result<(), Error> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        let end = usize::from(address) + count;
        let failing = self.failing.lock().unwrap();
        if failing.iter().any(|&a| usize::from(a) >= usize::from(address) && usize::from(a) < end) {
            return Err(Error::Exception { function, address, code: ILLEGAL_DATA_ADDRESS });
        }
        Ok(())
    }
}

impl Transport for MockTransport {
    async fn read_holdings(&self, address: u16, count: u16) -> Result<Vec<u16>, Error> {
        assert!(count <= MAX_READ_COUNT, "read of {count} registers in one request");
        self.reads.lock().unwrap().push((address, count));
        self.check(3, address, count.into())?;
        Ok((0..count).map(|offset| self.get(address + offset)).collect())
    }

    async fn write_holding(&self, address: u16, value: u16) -> Result<(), Error> {
        self.check(6, address, 1)?;
        self.writes.lock().unwrap().push((address, vec![value]));
        self.set(address, value);
        Ok(())
    }

    async fn write_holdings(&self, address: u16, values: &[u16]) -> Result<(), Error> {
        assert!(values.len() <= usize::from(MAX_WRITE_COUNT));
        self.check(16, address, values.len())?;
        self.writes.lock().unwrap().push((address, values.to_vec()));
        self.set_many(address, values);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.disconnected.load(Ordering::SeqCst)
    }

    async fn reconnect(&self) -> Result<(), Error> {
        self.disconnected.store(false, Ordering::SeqCst);
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Encode `text` the way the controller stores strings: two bytes per register, NUL padded.
pub fn string_words(text: &str, registers: usize) -> Vec<u16> {
    let mut bytes = text.as_bytes().to_vec();
    bytes.resize(registers * 2, 0);
    bytes.chunks_exact(2).map(|pair| u16::from_be_bytes([pair[0], pair[1]])).collect()
}
