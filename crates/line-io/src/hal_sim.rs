use crate::plc_link::{Connector, RegisterClient};
use async_trait::async_trait;
use line_core::DeviceDescriptor;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug)]
struct Bank {
    registers: Mutex<BTreeMap<u16, u16>>,
    online: AtomicBool,
    requests: AtomicU64,
}

/// In-memory holding-register bank standing in for a PLC.
///
/// Clones share the same bank. Unset registers read as zero. While offline,
/// connects and requests fail with `ConnectionRefused`/`BrokenPipe`.
#[derive(Debug, Clone)]
pub struct SimulatedPlc {
    bank: Arc<Bank>,
}

impl SimulatedPlc {
    pub fn new() -> Self {
        Self {
            bank: Arc::new(Bank {
                registers: Mutex::new(BTreeMap::new()),
                online: AtomicBool::new(true),
                requests: AtomicU64::new(0),
            }),
        }
    }

    pub fn set_register(&self, address: u16, word: u16) {
        self.bank.registers.lock().insert(address, word);
    }

    pub fn set_registers(&self, start: u16, words: &[u16]) {
        let mut registers = self.bank.registers.lock();
        for (address, word) in (start..).zip(words) {
            registers.insert(address, *word);
        }
    }

    pub fn register(&self, address: u16) -> u16 {
        self.bank.registers.lock().get(&address).copied().unwrap_or(0)
    }

    /// Apply `f` to one register under the bank lock.
    pub fn update_register(&self, address: u16, f: impl FnOnce(u16) -> u16) -> u16 {
        let mut registers = self.bank.registers.lock();
        let slot = registers.entry(address).or_insert(0);
        *slot = f(*slot);
        *slot
    }

    pub fn set_online(&self, online: bool) {
        self.bank.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.bank.online.load(Ordering::SeqCst)
    }

    /// Requests served so far (reads and writes).
    pub fn request_count(&self) -> u64 {
        self.bank.requests.load(Ordering::Relaxed)
    }

    fn check(&self) -> io::Result<()> {
        self.bank.requests.fetch_add(1, Ordering::Relaxed);
        if self.is_online() {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "simulated PLC offline"))
        }
    }
}

impl Default for SimulatedPlc {
    fn default() -> Self {
        Self::new()
    }
}

fn span_end(start: u16, count: usize) -> io::Result<u16> {
    u16::try_from(count)
        .ok()
        .and_then(|n| start.checked_add(n))
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "register range overflows"))
}

#[async_trait]
impl RegisterClient for SimulatedPlc {
    async fn read_holding_registers(&mut self, start: u16, count: u16) -> io::Result<Vec<u16>> {
        self.check()?;
        let end = span_end(start, usize::from(count))?;
        let registers = self.bank.registers.lock();
        Ok((start..end)
            .map(|a| registers.get(&a).copied().unwrap_or(0))
            .collect())
    }

    async fn write_single_register(&mut self, address: u16, word: u16) -> io::Result<()> {
        self.check()?;
        self.set_register(address, word);
        Ok(())
    }

    async fn write_multiple_registers(&mut self, address: u16, words: &[u16]) -> io::Result<()> {
        self.check()?;
        span_end(address, words.len())?;
        self.set_registers(address, words);
        Ok(())
    }
}

/// Hands out clients sharing one [`SimulatedPlc`].
#[derive(Debug, Clone)]
pub struct SimConnector {
    plc: SimulatedPlc,
}

impl SimConnector {
    pub fn new(plc: SimulatedPlc) -> Self {
        Self { plc }
    }
}

#[async_trait]
impl Connector for SimConnector {
    async fn connect(&self, device: &DeviceDescriptor) -> io::Result<Box<dyn RegisterClient>> {
        if !self.plc.is_online() {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("simulated PLC {} offline", device.device_no),
            ));
        }
        Ok(Box::new(self.plc.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_unset_registers_as_zero() {
        let mut plc = SimulatedPlc::new();
        plc.set_registers(10, &[1, 2]);
        let words = plc.read_holding_registers(9, 4).await.unwrap();
        assert_eq!(words, vec![0, 1, 2, 0]);
    }

    #[tokio::test]
    async fn rejects_ranges_past_address_space() {
        let mut plc = SimulatedPlc::new();
        let err = plc.read_holding_registers(u16::MAX, 2).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn clones_share_the_bank() {
        let plc = SimulatedPlc::new();
        let mut client = plc.clone();
        client.write_multiple_registers(5, &[7, 8]).await.unwrap();
        assert_eq!(plc.register(6), 8);
        assert_eq!(plc.update_register(6, |w| w + 1), 9);
        assert_eq!(plc.request_count(), 1);
    }
}
