use std::io;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::acquisition::{AcquisitionConfig, AcquisitionError, BackendDescriptor};
use crate::timing;
use crate::trigger::{TriggerEdge, TriggerError, TriggerLevel, TriggerLevelOutput, TriggerMode};

/// How long a requester waits for the worker to acknowledge a pause
/// before proceeding anyway.
const PAUSE_ACK_TIMEOUT: Duration = Duration::from_secs(5);
const PAUSE_ACK_POLL: Duration = Duration::from_millis(50);

/// Poll interval of a paused worker waiting for release.
const PAUSE_HOLD_POLL: Duration = Duration::from_millis(20);

/// If the worker has not honored a socket reset within this window, the
/// requester force-closes the listening socket itself.
const RESET_FALLBACK: Duration = Duration::from_millis(350);
const RESET_POLL: Duration = Duration::from_millis(25);

/// Shared state between the streaming worker and the request path.
///
/// All flags are lock-free atomics with single-writer-per-field
/// discipline, which is what makes the design sound:
///
/// - requester writes: `pause_requested`, `generation`, `divider` and
///   `divider_changed`, trigger mode/edge cells, and the *set* half of
///   `reset_requested`;
/// - worker writes: `pause_acknowledged`, the miss counter, and the
///   *clear* half of `reset_requested` (the requester's fallback may
///   also clear it, which is benign).
///
/// The listening socket handle itself lives behind a mutex; staleness
/// detection goes through the atomic generation counter, so the worker
/// never blocks on the handle to learn the world changed.
pub struct ScopeControl {
    descriptor: BackendDescriptor,
    config: AcquisitionConfig,

    shutdown: AtomicBool,
    pause_requested: AtomicBool,
    pause_acknowledged: AtomicBool,
    reset_requested: AtomicBool,

    generation: AtomicU64,
    listener: Mutex<Option<TcpListener>>,

    divider: AtomicU32,
    divider_changed: AtomicBool,

    trigger_mode: AtomicU8,
    trigger_edge: AtomicU8,
    level: Mutex<TriggerLevel>,

    miss_count: AtomicU32,
}

/// Snapshot of the externally visible device state, consumed by the
/// status/configuration reporting layer.
#[derive(Debug, Clone)]
pub struct ScopeStatus {
    pub sample_rate_hz: u32,
    pub dividing_factor: u32,
    pub sample_width_bits: u32,
    pub data_mask: u32,
    pub channel_mask: u32,
    pub resolution_bits: u32,
    pub max_value: u32,
    pub mid_value: u32,
    pub samples_per_packet: usize,
    pub sample_rate_divider: u32,
    pub trigger_mode: TriggerMode,
    pub trigger_edge: TriggerEdge,
    pub trigger_level_percent: u8,
    pub miss_count: u32,
}

impl ScopeControl {
    pub fn new(
        descriptor: BackendDescriptor,
        config: AcquisitionConfig,
        level_output: Box<dyn TriggerLevelOutput>,
    ) -> Self {
        Self {
            descriptor,
            config,
            shutdown: AtomicBool::new(false),
            pause_requested: AtomicBool::new(false),
            pause_acknowledged: AtomicBool::new(false),
            reset_requested: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            listener: Mutex::new(None),
            divider: AtomicU32::new(config.sample_rate_divider),
            divider_changed: AtomicBool::new(false),
            trigger_mode: AtomicU8::new(TriggerMode::Continuous.to_raw()),
            trigger_edge: AtomicU8::new(TriggerEdge::Rising.to_raw()),
            level: Mutex::new(TriggerLevel::new(level_output)),
            miss_count: AtomicU32::new(0),
        }
    }

    fn lock_listener(&self) -> MutexGuard<'_, Option<TcpListener>> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_level(&self) -> MutexGuard<'_, TriggerLevel> {
        self.level.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ---- requester side ----------------------------------------------

    /// Ask the worker to pause at its next safe point and wait for the
    /// acknowledgment.
    ///
    /// A timeout does not abort the request: the requester proceeds
    /// anyway with a warning, trading strict mutual exclusion for
    /// liveness when the worker is wedged.
    pub fn request_pause(&self) {
        self.pause_requested.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + PAUSE_ACK_TIMEOUT;
        while !self.pause_acknowledged.load(Ordering::SeqCst) {
            if Instant::now() >= deadline {
                log::warn!(
                    "pause not acknowledged within {PAUSE_ACK_TIMEOUT:?}; proceeding anyway"
                );
                return;
            }
            timing::wait_for(PAUSE_ACK_POLL);
        }
        log::debug!("streaming worker acknowledged pause");
    }

    /// Let a paused worker resume.
    pub fn release_pause(&self) {
        self.pause_requested.store(false, Ordering::SeqCst);
    }

    /// Install a new listening socket (or none) and bump the generation
    /// counter so the worker notices the swap at its next check point.
    pub fn replace_listening_socket(&self, listener: Option<TcpListener>) -> io::Result<()> {
        if let Some(listener) = &listener {
            listener.set_nonblocking(true)?;
        }
        *self.lock_listener() = listener;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        log::info!("listening socket replaced (generation {generation})");
        Ok(())
    }

    /// Ask the worker to proactively drop a connected client.
    ///
    /// Blocks until the worker clears the flag or the fallback deadline
    /// expires; in the latter case the listening socket is force-closed
    /// here so the reconfiguration takes effect even with a stalled
    /// worker.
    pub fn request_socket_reset(&self) {
        self.reset_requested.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + RESET_FALLBACK;
        while Instant::now() < deadline {
            if !self.reset_requested.load(Ordering::SeqCst) {
                return;
            }
            timing::wait_for(RESET_POLL);
        }
        if self.reset_requested.swap(false, Ordering::SeqCst) {
            log::warn!("socket reset unhandled after {RESET_FALLBACK:?}; force-closing listener");
            *self.lock_listener() = None;
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Request a new sample-rate divider; the worker applies it at its
    /// next safe point.
    pub fn request_sample_rate_change(&self, divider: u32) -> Result<(), AcquisitionError> {
        if divider == 0
            || !divider.is_power_of_two()
            || divider > self.descriptor.largest_divider()
        {
            return Err(AcquisitionError::InvalidDivider(divider));
        }
        self.divider.store(divider, Ordering::SeqCst);
        self.divider_changed.store(true, Ordering::SeqCst);
        log::info!("sample-rate divider change to {divider} requested");
        Ok(())
    }

    pub fn set_trigger_mode(&self, mode: TriggerMode) -> Result<(), TriggerError> {
        if mode == TriggerMode::Continuous {
            // The comparator level is meaningless in continuous mode.
            // Reset it before publishing the mode so a failed reset
            // leaves mode and level consistent.
            self.lock_level().set(0)?;
        }
        self.trigger_mode.store(mode.to_raw(), Ordering::SeqCst);
        Ok(())
    }

    pub fn set_trigger_edge(&self, edge: TriggerEdge) {
        self.trigger_edge.store(edge.to_raw(), Ordering::SeqCst);
    }

    pub fn set_trigger_level(&self, percent: u8) -> Result<(), TriggerError> {
        self.lock_level().set(percent)
    }

    /// Stop the streaming worker permanently (process shutdown).
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn status(&self) -> ScopeStatus {
        ScopeStatus {
            sample_rate_hz: self.descriptor.sample_rate_hz,
            dividing_factor: self.descriptor.dividing_factor,
            sample_width_bits: self.descriptor.sample_width_bits,
            data_mask: self.descriptor.data_mask,
            channel_mask: self.descriptor.channel_mask,
            resolution_bits: self.descriptor.resolution_bits,
            max_value: self.descriptor.max_value,
            mid_value: self.descriptor.mid_value,
            samples_per_packet: self.config.samples_per_packet(&self.descriptor),
            sample_rate_divider: self.divider.load(Ordering::SeqCst),
            trigger_mode: self.trigger_mode(),
            trigger_edge: self.trigger_edge(),
            trigger_level_percent: self.lock_level().percent(),
            miss_count: self.miss_count.load(Ordering::SeqCst),
        }
    }

    // ---- worker side -------------------------------------------------

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn pause_requested(&self) -> bool {
        self.pause_requested.load(Ordering::SeqCst)
    }

    /// Acknowledge a pending pause and block until released. No-op when
    /// no pause is pending.
    pub fn service_pause(&self) {
        if self.pause_requested() {
            self.acknowledge_pause_and_wait();
        }
    }

    fn acknowledge_pause_and_wait(&self) {
        log::info!("streaming worker paused");
        self.pause_acknowledged.store(true, Ordering::SeqCst);
        while self.pause_requested() && !self.shutdown_requested() {
            timing::wait_for(PAUSE_HOLD_POLL);
        }
        self.pause_acknowledged.store(false, Ordering::SeqCst);
        log::info!("streaming worker resumed");
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn has_listener(&self) -> bool {
        self.lock_listener().is_some()
    }

    /// One non-blocking accept attempt on the current listener.
    pub fn try_accept(&self) -> io::Result<Option<TcpStream>> {
        let guard = self.lock_listener();
        let Some(listener) = guard.as_ref() else {
            return Ok(None);
        };
        match listener.accept() {
            Ok((stream, addr)) => {
                // The accepted socket starts out blocking; the send
                // channel toggles it per send.
                stream.set_nonblocking(false)?;
                log::info!("client connected: {addr}");
                Ok(Some(stream))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Drop a listening socket the worker found faulty. The generation
    /// counter is left alone; the requester owns it.
    pub fn invalidate_listener(&self) {
        log::warn!("invalidating listening socket");
        *self.lock_listener() = None;
    }

    /// Consume a pending reset request, if any.
    pub fn take_reset(&self) -> bool {
        self.reset_requested.swap(false, Ordering::SeqCst)
    }

    pub fn reset_pending(&self) -> bool {
        self.reset_requested.load(Ordering::SeqCst)
    }

    /// Consume a pending divider change, if any.
    pub fn take_divider_change(&self) -> Option<u32> {
        self.divider_changed
            .swap(false, Ordering::SeqCst)
            .then(|| self.divider.load(Ordering::SeqCst))
    }

    pub fn trigger_mode(&self) -> TriggerMode {
        TriggerMode::from_raw(self.trigger_mode.load(Ordering::SeqCst))
    }

    pub fn trigger_edge(&self) -> TriggerEdge {
        TriggerEdge::from_raw(self.trigger_edge.load(Ordering::SeqCst))
    }

    /// Count one zero-byte acquisition read; returns the running count.
    pub fn record_miss(&self) -> u32 {
        self.miss_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn reset_miss_count(&self) {
        self.miss_count.store(0, Ordering::SeqCst);
    }

    pub fn miss_count(&self) -> u32 {
        self.miss_count.load(Ordering::SeqCst)
    }

    pub(crate) fn pause_acknowledged(&self) -> bool {
        self.pause_acknowledged.load(Ordering::SeqCst)
    }
}
