use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::acquisition::AcquisitionSource;
use crate::control::ScopeControl;
use crate::send::{AbortReason, SendChannel, SendOutcome};
use crate::timing;
use crate::trigger::{TriggerEngine, TriggerMode};


/// Poll interval while no listening socket is configured.
const IDLE_POLL: Duration = Duration::from_secs(1);

/// Poll interval of the non-blocking accept loop; also bounds how long a
/// control-plane flag stays unobserved while waiting for a client.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Consecutive misses before the loss is reported as critical.
const MISS_CRITICAL_THRESHOLD: u32 = 10;

/// Pacing of direct trigger-pin polling while armed and not fired.
const TRIGGER_POLL: Duration = Duration::from_millis(1);

/// The long-lived worker bridging acquisition to the network.
///
/// Runs the `Idle → WaitingForClient → Streaming → teardown` state
/// machine on the calling thread until shutdown is requested. All
/// coordination with the request path goes through [`ScopeControl`];
/// every blocking point re-checks its flags within one poll interval.
pub struct StreamingLoop<S: AcquisitionSource> {
    control: Arc<ScopeControl>,
    source: S,
    trigger: TriggerEngine,
    channel: SendChannel,
    buffer: Vec<u8>,
}

impl<S: AcquisitionSource> StreamingLoop<S> {
    pub fn new(control: Arc<ScopeControl>, source: S) -> Self {
        let buffer_len = source.descriptor().buffer_samples * source.config().sample_size;
        let trigger = TriggerEngine::for_input(source.trigger_input_kind());
        Self {
            control,
            source,
            trigger,
            channel: SendChannel::new(),
            buffer: vec![0; buffer_len],
        }
    }

    /// Run until [`ScopeControl::request_shutdown`] is observed.
    pub fn run(&mut self) {
        log::info!("streaming worker started");
        while !self.control.shutdown_requested() {
            self.control.service_pause();

            // Divider changes are also honored between sessions, so a
            // reconfiguration during a pause takes effect before the
            // next client is accepted.
            if let Some(divider) = self.control.take_divider_change() {
                if let Err(e) = self.source.reconfigure(divider) {
                    log::error!("sample-rate reconfiguration failed: {e}");
                }
            }

            if !self.control.has_listener() {
                thread::sleep(IDLE_POLL);
                continue;
            }

            let generation = self.control.generation();
            match self.wait_for_client(generation) {
                Some(client) => self.stream_to(client, generation),
                None => continue,
            }
        }
        log::info!("streaming worker stopped");
    }

    /// Non-blocking accept loop. Returns `None` when a pause request, a
    /// generation change, a reset, or a listener fault aborts the wait.
    fn wait_for_client(&mut self, generation: u64) -> Option<TcpStream> {
        loop {
            if self.control.shutdown_requested() || self.control.pause_requested() {
                return None;
            }
            if self.control.generation() != generation || !self.control.has_listener() {
                return None;
            }
            if self.control.take_reset() {
                // No client is connected yet; consuming the flag is all
                // the reset asks for here.
                return None;
            }

            match self.control.try_accept() {
                Ok(Some(stream)) => return Some(stream),
                Ok(None) => thread::sleep(ACCEPT_POLL),
                Err(e) => {
                    log::error!("accept failed: {e}");
                    self.control.invalidate_listener();
                    return None;
                }
            }
        }
    }

    /// Stream sample buffers to one client until a session-level fault
    /// or a control-plane interruption ends the session.
    fn stream_to(&mut self, mut client: TcpStream, generation: u64) {
        if self.source.starts_per_session() {
            if let Err(e) = self.source.start() {
                log::error!("failed to start acquisition: {e}");
                return;
            }
        }
        let payload = self.source.config().payload_range(self.buffer.len());

        loop {
            if self.control.shutdown_requested() || self.control.pause_requested() {
                break;
            }
            if self.control.generation() != generation {
                log::info!("listening socket replaced; ending session");
                break;
            }
            if self.control.take_reset() {
                log::info!("socket reset requested; dropping client");
                break;
            }
            if let Some(divider) = self.control.take_divider_change() {
                match self.source.reconfigure(divider) {
                    Ok(()) => log::info!("sample-rate divider now {divider}"),
                    Err(e) => {
                        log::error!("sample-rate reconfiguration failed: {e}");
                        break;
                    }
                }
            }
            self.sync_trigger();

            let mut len = 0;
            if self.source.reads_every_iteration() {
                len = self.acquire();
            }
            if self.trigger.mode() == TriggerMode::SingleShot {
                let current = self.source.trigger_input();
                if !self.trigger.check(current) {
                    if !self.source.reads_every_iteration() {
                        thread::sleep(TRIGGER_POLL);
                    }
                    continue;
                }
            }
            if !self.source.reads_every_iteration() {
                if self.trigger.mode() == TriggerMode::SingleShot {
                    // Center the detected edge within the buffer.
                    timing::wait_until(Instant::now() + self.source.conversion_interval() / 2);
                }
                len = self.acquire();
            }
            if len == 0 {
                self.record_miss();
                continue;
            }

            let control = Arc::clone(&self.control);
            let cancel = move || {
                if control.pause_requested() || control.shutdown_requested() {
                    Some(AbortReason::PauseRequested)
                } else if control.generation() != generation || control.reset_pending() {
                    Some(AbortReason::SocketChanged)
                } else {
                    None
                }
            };
            match self
                .channel
                .send(&mut client, &self.buffer[payload.clone()], cancel)
            {
                Ok(SendOutcome::Complete) => {}
                Ok(SendOutcome::Aborted(reason)) => {
                    log::info!("send aborted ({reason:?}); ending session");
                    break;
                }
                Err(e) => {
                    log::warn!("send failed: {e}; ending session");
                    break;
                }
            }
        }

        if self.source.starts_per_session() {
            self.source.stop();
        }
        log::info!("client disconnected");
    }

    /// Apply pending trigger mode/edge changes at a safe point.
    fn sync_trigger(&mut self) {
        let mode = self.control.trigger_mode();
        if mode != self.trigger.mode() {
            if let Err(e) = self.trigger.apply_mode(mode, &mut self.source) {
                log::warn!("trigger mode change failed: {e}");
            }
        }
        let edge = self.control.trigger_edge();
        if edge != self.trigger.edge() {
            if let Err(e) = self.trigger.apply_edge(edge, &mut self.source) {
                log::warn!("trigger edge change failed: {e}");
            }
        }
    }

    /// One acquisition attempt; faults are absorbed as misses.
    fn acquire(&mut self) -> usize {
        match self.source.read(&mut self.buffer) {
            Ok(len) => len,
            Err(e) => {
                log::warn!("acquisition read failed: {e}");
                0
            }
        }
    }

    fn record_miss(&mut self) {
        let count = self.control.record_miss();
        log::warn!("missed acquisition read (count {count})");
        if count >= MISS_CRITICAL_THRESHOLD {
            log::error!("critical acquisition data loss detected");
            self.control.reset_miss_count();
        }
    }
}
