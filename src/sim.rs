//! In-memory stand-ins for the register window and the DMA driver.
//!
//! Used by the demo binary and the test suites to exercise the capture core
//! without a card.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::capture::dma::{DmaBackend, SgEntry, SgTable};
use crate::error::EngineError;
use crate::hw::{regs, RegisterAccess};

/// Register bank with a fixed REG_CAPS value and a write log
#[derive(Debug, Default)]
pub struct SimRegisters {
    values: Mutex<HashMap<u32, u32>>,
    writes: Mutex<Vec<(u32, u32)>>,
}

impl SimRegisters {
    pub fn new(caps: u32) -> Self {
        let bank = Self::default();
        bank.values.lock().insert(regs::REG_CAPS, caps);
        bank
    }

    pub fn peek(&self, offset: u32) -> u32 {
        self.values.lock().get(&offset).copied().unwrap_or(0)
    }

    pub fn write_log(&self) -> Vec<(u32, u32)> {
        self.writes.lock().clone()
    }
}

impl RegisterAccess for SimRegisters {
    fn read32(&self, offset: u32) -> u32 {
        self.peek(offset)
    }

    fn write32(&self, offset: u32, value: u32) {
        self.values.lock().insert(offset, value);
        self.writes.lock().push((offset, value));
    }
}

/// Scripted result for one transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Move every byte the descriptor list asks for
    Full,
    Bytes(usize),
    Error(i32),
}

/// A transfer as the engine saw it
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub engine: u32,
    pub entries: Vec<SgEntry>,
    pub timeout: Duration,
}

/// Transfers kept in the [`SimDma`] call log; older ones are dropped.
pub const CALL_LOG_DEPTH: usize = 64;

/// DMA driver double. Transfers complete immediately according to the
/// script (then `Full` once the script runs dry).
#[derive(Debug, Default)]
pub struct SimDma {
    script: Mutex<VecDeque<TransferOutcome>>,
    calls: Mutex<VecDeque<RecordedCall>>,
    submitted: AtomicU64,
    events: Mutex<u32>,
    fail_enable: Mutex<Option<i32>>,
}

impl SimDma {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, outcomes: impl IntoIterator<Item = TransferOutcome>) {
        self.script.lock().extend(outcomes);
    }

    /// The most recent transfers, oldest first, at most [`CALL_LOG_DEPTH`].
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().iter().cloned().collect()
    }

    /// Every transfer submitted so far, including those no longer logged
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Currently enabled event lines
    pub fn events_enabled(&self) -> u32 {
        *self.events.lock()
    }

    /// Make the next `enable_events` fail with `code`.
    pub fn fail_next_enable(&self, code: i32) {
        *self.fail_enable.lock() = Some(code);
    }
}

impl DmaBackend for SimDma {
    fn submit_c2h(
        &self,
        engine: u32,
        sgt: &SgTable,
        timeout: Duration,
    ) -> Result<usize, EngineError> {
        self.submitted.fetch_add(1, Ordering::Relaxed);
        {
            let mut calls = self.calls.lock();
            if calls.len() == CALL_LOG_DEPTH {
                calls.pop_front();
            }
            calls.push_back(RecordedCall {
                engine,
                entries: sgt.entries().to_vec(),
                timeout,
            });
        }
        let outcome = self.script.lock().pop_front().unwrap_or(TransferOutcome::Full);
        match outcome {
            TransferOutcome::Full => Ok(sgt.dma_len()),
            TransferOutcome::Bytes(n) => Ok(n),
            TransferOutcome::Error(code) => Err(EngineError(code)),
        }
    }

    fn enable_events(&self, mask: u32) -> Result<(), EngineError> {
        if let Some(code) = self.fail_enable.lock().take() {
            return Err(EngineError(code));
        }
        *self.events.lock() |= mask;
        Ok(())
    }

    fn disable_events(&self, mask: u32) {
        *self.events.lock() &= !mask;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_log_keeps_only_recent_transfers() {
        let dma = SimDma::new();
        dma.script([TransferOutcome::Bytes(7)]);
        for i in 0..(CALL_LOG_DEPTH as u32 + 10) {
            let sgt = SgTable::new(vec![SgEntry::new(u64::from(i) * 0x1000, 0x1000)]);
            dma.submit_c2h(i, &sgt, Duration::from_millis(1)).unwrap();
        }

        let calls = dma.calls();
        assert_eq!(calls.len(), CALL_LOG_DEPTH);
        assert_eq!(calls[0].engine, 10);
        assert_eq!(calls[CALL_LOG_DEPTH - 1].engine, CALL_LOG_DEPTH as u32 + 9);
        assert_eq!(dma.submitted(), CALL_LOG_DEPTH as u64 + 10);
    }

    #[test]
    fn scripted_outcomes_then_full() {
        let dma = SimDma::new();
        dma.script([TransferOutcome::Error(-5), TransferOutcome::Bytes(3)]);
        let sgt = SgTable::new(vec![SgEntry::new(0, 64)]);
        let t = Duration::from_millis(1);
        assert_eq!(dma.submit_c2h(0, &sgt, t), Err(EngineError(-5)));
        assert_eq!(dma.submit_c2h(0, &sgt, t), Ok(3));
        assert_eq!(dma.submit_c2h(0, &sgt, t), Ok(64));
    }
}
