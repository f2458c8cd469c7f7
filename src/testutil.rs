//! Scripted stand-ins for the hardware seams, shared by the test modules.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::acquisition::{ConversionDriver, SampleBus};
use crate::send::SendTransport;
use crate::trigger::{TriggerEdge, TriggerLevelOutput};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct DriverState {
    allocations: Vec<u32>,
    releases: u32,
    failing_allocations: u32,
    read_lens: VecDeque<usize>,
    levels: VecDeque<i32>,
    last_level: i32,
}

/// Conversion-driver double. Clones share state, so a test keeps one
/// handle for assertions while the backend owns the other.
///
/// Reads fill the whole buffer unless a shorter length was queued;
/// trigger levels replay a queued sequence, repeating the final value.
#[derive(Clone, Default)]
pub struct ScriptedDriver {
    state: Arc<Mutex<DriverState>>,
}

impl ScriptedDriver {
    /// Byte value every scripted read fills buffers with.
    pub const FILL: u8 = 0xA5;

    pub fn fail_next_allocations(&self, count: u32) {
        lock(&self.state).failing_allocations = count;
    }

    pub fn queue_read_lens(&self, lens: &[usize]) {
        lock(&self.state).read_lens.extend(lens.iter().copied());
    }

    pub fn queue_levels(&self, levels: &[i32]) {
        lock(&self.state).levels.extend(levels.iter().copied());
    }

    pub fn allocations(&self) -> Vec<u32> {
        lock(&self.state).allocations.clone()
    }

    pub fn releases(&self) -> u32 {
        lock(&self.state).releases
    }
}

impl ConversionDriver for ScriptedDriver {
    fn allocate(&mut self, sample_rate_hz: u32) -> io::Result<()> {
        let mut state = lock(&self.state);
        if state.failing_allocations > 0 {
            state.failing_allocations -= 1;
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                "pipeline unavailable",
            ));
        }
        state.allocations.push(sample_rate_hz);
        Ok(())
    }

    fn release(&mut self) {
        lock(&self.state).releases += 1;
    }

    fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> io::Result<usize> {
        let len = lock(&self.state)
            .read_lens
            .pop_front()
            .unwrap_or(buf.len());
        buf.fill(Self::FILL);
        Ok(len)
    }

    fn trigger_input_level(&mut self) -> i32 {
        let mut state = lock(&self.state);
        if let Some(level) = state.levels.pop_front() {
            state.last_level = level;
        }
        state.last_level
    }
}

#[derive(Default)]
struct BusState {
    transfers: u32,
    transfer_lens: VecDeque<usize>,
    clock_steps: Vec<usize>,
    edge_counts: VecDeque<i32>,
    last_edge_count: i32,
    armed_edges: Vec<TriggerEdge>,
}

/// Sample-bus double with the same shared-state cloning as
/// [`ScriptedDriver`].
#[derive(Clone, Default)]
pub struct ScriptedBus {
    state: Arc<Mutex<BusState>>,
}

impl ScriptedBus {
    pub fn queue_transfer_len(&self, len: usize) {
        lock(&self.state).transfer_lens.push_back(len);
    }

    pub fn queue_edge_count(&self, count: i32) {
        lock(&self.state).edge_counts.push_back(count);
    }

    pub fn transfers(&self) -> u32 {
        lock(&self.state).transfers
    }

    pub fn clock_steps(&self) -> Vec<usize> {
        lock(&self.state).clock_steps.clone()
    }

    pub fn armed_edges(&self) -> Vec<TriggerEdge> {
        lock(&self.state).armed_edges.clone()
    }
}

impl SampleBus for ScriptedBus {
    fn transfer(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = lock(&self.state);
        state.transfers += 1;
        let len = state.transfer_lens.pop_front().unwrap_or(buf.len());
        buf.fill(ScriptedDriver::FILL);
        Ok(len)
    }

    fn edge_count(&mut self) -> i32 {
        let mut state = lock(&self.state);
        if let Some(count) = state.edge_counts.pop_front() {
            state.last_edge_count = count;
        }
        state.last_edge_count
    }

    fn arm_edge_counter(&mut self, edge: TriggerEdge) -> io::Result<()> {
        lock(&self.state).armed_edges.push(edge);
        Ok(())
    }

    fn set_clock_step(&mut self, step: usize) -> io::Result<()> {
        lock(&self.state).clock_steps.push(step);
        Ok(())
    }
}

#[derive(Default)]
struct DutyState {
    last: Option<u32>,
    fail_next: bool,
}

/// PWM-output double recording the most recent duty value.
#[derive(Clone, Default)]
pub struct FakeDuty {
    state: Arc<Mutex<DutyState>>,
}

impl FakeDuty {
    pub fn last(&self) -> Option<u32> {
        lock(&self.state).last
    }

    pub fn fail_next(&self) {
        lock(&self.state).fail_next = true;
    }
}

impl TriggerLevelOutput for FakeDuty {
    fn set_duty(&mut self, duty: u32) -> io::Result<()> {
        let mut state = lock(&self.state);
        if state.fail_next {
            state.fail_next = false;
            return Err(io::Error::other("pwm update rejected"));
        }
        state.last = Some(duty);
        Ok(())
    }
}

/// One scripted response of a [`FlakyTransport`] write call.
#[derive(Debug, Clone, Copy)]
pub enum WriteStep {
    /// Accept up to this many bytes.
    Accept(usize),
    WouldBlock,
    Interrupted,
    /// Fail the write with a broken pipe.
    Error,
}

/// Write-side transport double. Each write consumes one script step;
/// with the script exhausted every write is accepted in full.
pub struct FlakyTransport {
    script: VecDeque<WriteStep>,
    written: Vec<u8>,
    requested_lens: Vec<usize>,
    nonblocking: bool,
}

impl FlakyTransport {
    pub fn new(script: Vec<WriteStep>) -> Self {
        Self {
            script: script.into(),
            written: Vec::new(),
            requested_lens: Vec::new(),
            nonblocking: false,
        }
    }

    pub fn written(&self) -> Vec<u8> {
        self.written.clone()
    }

    pub fn requested_lens(&self) -> Vec<usize> {
        self.requested_lens.clone()
    }

    pub fn nonblocking(&self) -> bool {
        self.nonblocking
    }
}

impl Write for FlakyTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.requested_lens.push(buf.len());
        match self.script.pop_front().unwrap_or(WriteStep::Accept(buf.len())) {
            WriteStep::Accept(n) => {
                let accepted = n.min(buf.len());
                self.written.extend_from_slice(&buf[..accepted]);
                Ok(accepted)
            }
            WriteStep::WouldBlock => Err(io::ErrorKind::WouldBlock.into()),
            WriteStep::Interrupted => Err(io::ErrorKind::Interrupted.into()),
            WriteStep::Error => Err(io::ErrorKind::BrokenPipe.into()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SendTransport for FlakyTransport {
    fn set_nonblocking(&mut self, nonblocking: bool) -> io::Result<()> {
        self.nonblocking = nonblocking;
        Ok(())
    }
}
