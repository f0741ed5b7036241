//! In-process simulated coil bank
//!
//! Used for bench runs without hardware (`device_type: simulated`) and as the
//! recording link in tests: recent writes are logged with their timestamp, and
//! individual reads or writes can be made to fail.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::CoilLink;
use crate::error::LinkError;

/// Writes kept in the log before the oldest are dropped
pub const DEFAULT_WRITE_LOG: usize = 4096;

/// A write observed by the bank
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    pub address: u16,
    pub value: bool,
    pub at: Instant,
}

#[derive(Debug)]
struct Bank {
    coils: HashMap<u16, bool>,
    writes: VecDeque<WriteRecord>,
    write_log: usize,
    reads: HashMap<u16, usize>,
    /// Writes to these addresses succeed this many more times, then fail
    write_budget: HashMap<u16, usize>,
    failing_reads: Vec<u16>,
}

impl Default for Bank {
    fn default() -> Self {
        Self {
            coils: HashMap::new(),
            writes: VecDeque::new(),
            write_log: DEFAULT_WRITE_LOG,
            reads: HashMap::new(),
            write_budget: HashMap::new(),
            failing_reads: Vec::new(),
        }
    }
}

pub struct MemoryCoilLink {
    bank: Mutex<Bank>,
    latency: Duration,
    open: AtomicBool,
}

impl MemoryCoilLink {
    /// Empty bank; unknown addresses read as `false`
    pub fn new() -> Self {
        Self {
            bank: Mutex::new(Bank::default()),
            latency: Duration::ZERO,
            open: AtomicBool::new(true),
        }
    }

    /// Bank with the given addresses present and off
    pub fn with_coils(addresses: &[u16]) -> Self {
        let link = Self::new();
        {
            let mut bank = link.bank.lock();
            for &address in addresses {
                bank.coils.insert(address, false);
            }
        }
        link
    }

    /// Delay every request by `latency` to mimic a slow transport
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Keep at most `capacity` writes in the log
    pub fn with_write_log(self, capacity: usize) -> Self {
        {
            let mut bank = self.bank.lock();
            bank.write_log = capacity;
            while bank.writes.len() > capacity {
                bank.writes.pop_front();
            }
        }
        self
    }

    pub fn set(&self, address: u16, value: bool) {
        self.bank.lock().coils.insert(address, value);
    }

    pub fn get(&self, address: u16) -> bool {
        self.bank.lock().coils.get(&address).copied().unwrap_or(false)
    }

    /// Logged writes, oldest first
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.bank.lock().writes.iter().cloned().collect()
    }

    pub fn writes_to(&self, address: u16) -> Vec<WriteRecord> {
        self.bank
            .lock()
            .writes
            .iter()
            .filter(|w| w.address == address)
            .cloned()
            .collect()
    }

    pub fn read_count(&self, address: u16) -> usize {
        self.bank.lock().reads.get(&address).copied().unwrap_or(0)
    }

    /// Let `successes` more writes to `address` through, then fail the rest
    pub fn fail_writes_after(&self, address: u16, successes: usize) {
        self.bank.lock().write_budget.insert(address, successes);
    }

    pub fn fail_reads(&self, address: u16) {
        self.bank.lock().failing_reads.push(address);
    }

    /// Remove all injected failures
    pub fn heal(&self) {
        let mut bank = self.bank.lock();
        bank.write_budget.clear();
        bank.failing_reads.clear();
    }

    async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn ensure_open(&self) -> Result<(), LinkError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(LinkError::Closed)
        }
    }
}

impl Default for MemoryCoilLink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoilLink for MemoryCoilLink {
    async fn read_coil(&self, address: u16) -> Result<bool, LinkError> {
        self.ensure_open()?;
        self.delay().await;

        let mut bank = self.bank.lock();
        if bank.failing_reads.contains(&address) {
            return Err(LinkError::io(address, "simulated read failure"));
        }
        *bank.reads.entry(address).or_insert(0) += 1;
        let value = bank.coils.get(&address).copied().unwrap_or(false);

        debug!("Simulated read coil {} = {}", address, value);
        Ok(value)
    }

    async fn write_coil(&self, address: u16, value: bool) -> Result<(), LinkError> {
        self.ensure_open()?;
        self.delay().await;

        let mut bank = self.bank.lock();
        if let Some(budget) = bank.write_budget.get_mut(&address) {
            if *budget == 0 {
                return Err(LinkError::io(address, "simulated write failure"));
            }
            *budget -= 1;
        }

        bank.coils.insert(address, value);
        if bank.write_log > 0 {
            if bank.writes.len() == bank.write_log {
                bank.writes.pop_front();
            }
            bank.writes.push_back(WriteRecord {
                address,
                value,
                at: Instant::now(),
            });
        }

        debug!("Simulated write coil {} = {}", address, value);
        Ok(())
    }

    async fn close(&self) -> Result<(), LinkError> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn target(&self) -> String {
        "simulated".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_write() {
        let link = MemoryCoilLink::with_coils(&[8192, 8193]);

        assert!(!link.read_coil(8192).await.unwrap());
        link.write_coil(8192, true).await.unwrap();
        assert!(link.read_coil(8192).await.unwrap());
        assert!(link.get(8192));
        assert_eq!(link.read_count(8192), 2);
        assert_eq!(link.writes().len(), 1);
        assert_eq!(link.writes_to(8193).len(), 0);
    }

    #[tokio::test]
    async fn test_write_budget() {
        let link = MemoryCoilLink::new();
        link.fail_writes_after(5, 1);

        assert!(link.write_coil(5, true).await.is_ok());
        let err = link.write_coil(5, false).await.unwrap_err();
        assert!(matches!(err, LinkError::Io { address: 5, .. }));
        // The failed write left the coil as it was
        assert!(link.get(5));
        assert_eq!(link.writes_to(5).len(), 1);

        link.heal();
        assert!(link.write_coil(5, false).await.is_ok());
    }

    #[tokio::test]
    async fn test_write_log_keeps_latest() {
        let link = MemoryCoilLink::with_coils(&[1, 2]).with_write_log(3);

        for i in 0..10u16 {
            link.write_coil(1 + i % 2, i % 3 == 0).await.unwrap();
        }

        let writes = link.writes();
        assert_eq!(writes.len(), 3);
        // Writes 7, 8 and 9 survive
        assert_eq!(
            writes.iter().map(|w| (w.address, w.value)).collect::<Vec<_>>(),
            vec![(2, false), (1, false), (2, true)]
        );
        // The bank itself still tracks every coil
        assert!(link.get(2));
    }

    #[tokio::test]
    async fn test_write_log_disabled() {
        let link = MemoryCoilLink::new().with_write_log(0);

        link.write_coil(5, true).await.unwrap();

        assert!(link.writes().is_empty());
        assert!(link.get(5));
    }

    #[tokio::test]
    async fn test_failing_reads() {
        let link = MemoryCoilLink::new();
        link.fail_reads(7);

        assert!(link.read_coil(7).await.is_err());
        assert!(link.read_coil(8).await.is_ok());
        assert_eq!(link.read_count(7), 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let link = MemoryCoilLink::new();
        link.close().await.unwrap();
        link.close().await.unwrap();

        assert!(!link.is_connected());
        assert!(matches!(link.read_coil(1).await, Err(LinkError::Closed)));
        assert!(matches!(
            link.write_coil(1, true).await,
            Err(LinkError::Closed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency() {
        let link = MemoryCoilLink::new().with_latency(Duration::from_millis(20));
        let start = Instant::now();

        link.write_coil(1, true).await.unwrap();

        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
