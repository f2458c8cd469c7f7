use std::io;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::timing;
use crate::trigger::{TriggerEdge, TriggerInputKind};

/// Rate the continuous-mode converter driver is allocated with; the
/// effective rate reported to clients differs (see [`BackendDescriptor::INTERNAL`]).
const ADC_ALLOCATION_RATE_HZ: u32 = 600_000;

/// Base wait for one conversion frame of the internal converter, scaled
/// by the sample-rate divider.
const BASE_CONVERSION_WAIT: Duration = Duration::from_millis(15);

/// Upper bound on a single driver read once the conversion wait elapsed.
const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// The driver allocator may transiently fail right after a stop, so a
/// reconfiguration retries allocation a bounded number of times.
const REALLOC_ATTEMPTS: u32 = 5;
const REALLOC_DELAY: Duration = Duration::from_millis(50);

/// Clock steps of the external converter's timing generator, fastest
/// first. A sample-rate divider of `2^n` selects entry `n`.
pub const BUS_CLOCK_TABLE_HZ: [u32; 7] = [
    40_000_000, 20_000_000, 10_000_000, 5_000_000, 2_500_000, 1_250_000, 625_000,
];

#[derive(Debug, thiserror::Error)]
pub enum AcquisitionError {
    #[error("acquisition backend is busy initializing")]
    Busy,

    #[error("conversion pipeline allocation failed after {attempts} attempts: {source}")]
    AllocationFailed {
        attempts: u32,
        #[source]
        source: io::Error,
    },

    #[error("sample-rate divider {0} is not a supported power of two")]
    InvalidDivider(u32),

    #[error("discarding {head}+{trailer} samples exceeds the {buffer} sample buffer")]
    InvalidDiscard {
        head: usize,
        trailer: usize,
        buffer: usize,
    },

    #[error("sample bus transaction failed: {0}")]
    Bus(#[source] io::Error),

    #[error("conversion read failed: {0}")]
    Read(#[source] io::Error),
}

/// Static identity of a sampling backend: effective sample rate, how raw
/// words are laid out, and the value range of one sample. Reported to the
/// configuration-query layer so clients can interpret the raw stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendDescriptor {
    pub sample_rate_hz: u32,
    pub dividing_factor: u32,
    pub sample_width_bits: u32,
    pub data_mask: u32,
    pub channel_mask: u32,
    pub resolution_bits: u32,
    pub max_value: u32,
    pub mid_value: u32,
    pub buffer_samples: usize,
}

impl BackendDescriptor {
    /// On-chip continuous-mode converter.
    pub const INTERNAL: Self = Self {
        sample_rate_hz: 494_753,
        dividing_factor: 2,
        sample_width_bits: 16,
        data_mask: 0x0FFF,
        channel_mask: 0xF000,
        resolution_bits: 10,
        max_value: 1023,
        mid_value: 512,
        buffer_samples: 17_280 * 3,
    };

    /// External converter driven over the shared synchronous bus.
    pub const EXTERNAL: Self = Self {
        sample_rate_hz: 2_500_000,
        dividing_factor: 1,
        sample_width_bits: 16,
        data_mask: 0x1FF8,
        channel_mask: 0x0000,
        resolution_bits: 10,
        max_value: 1023,
        mid_value: 512,
        buffer_samples: 17_280 * 4,
    };

    pub fn largest_divider(&self) -> u32 {
        if self.channel_mask == 0 {
            // External timing table covers dividers 1..=64.
            1 << (BUS_CLOCK_TABLE_HZ.len() - 1)
        } else {
            16
        }
    }
}

/// Mutable acquisition parameters. The divider changes at runtime through
/// the control plane; the discard window is fixed at startup but kept
/// general (both edges default to zero).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquisitionConfig {
    pub sample_rate_divider: u32,
    pub discard_head: usize,
    pub discard_trailer: usize,
    pub sample_size: usize,
}

impl AcquisitionConfig {
    pub fn new() -> Self {
        Self {
            sample_rate_divider: 1,
            discard_head: 0,
            discard_trailer: 0,
            sample_size: 1,
        }
    }

    /// Discard `head` samples at the front and `trailer` at the back of
    /// every forwarded buffer.
    pub fn with_discards(
        descriptor: &BackendDescriptor,
        head: usize,
        trailer: usize,
    ) -> Result<Self, AcquisitionError> {
        if head + trailer > descriptor.buffer_samples {
            return Err(AcquisitionError::InvalidDiscard {
                head,
                trailer,
                buffer: descriptor.buffer_samples,
            });
        }
        Ok(Self {
            discard_head: head,
            discard_trailer: trailer,
            ..Self::new()
        })
    }

    /// Samples forwarded per buffer once the discard window is applied.
    pub fn samples_per_packet(&self, descriptor: &BackendDescriptor) -> usize {
        descriptor.buffer_samples - self.discard_head - self.discard_trailer
    }

    /// Byte range of a raw buffer that goes out on the wire.
    pub fn payload_range(&self, buffer_len: usize) -> Range<usize> {
        let head = self.discard_head * self.sample_size;
        let trailer = self.discard_trailer * self.sample_size;
        head..buffer_len.saturating_sub(trailer)
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Hardware seam for the on-chip continuous-mode converter. The real
/// implementation wraps the vendor conversion driver; the trigger
/// reference input is the digital level on the trigger pin.
pub trait ConversionDriver: Send {
    /// Allocate and start a conversion pipeline at `sample_rate_hz`.
    fn allocate(&mut self, sample_rate_hz: u32) -> io::Result<()>;

    /// Stop and release the conversion pipeline.
    fn release(&mut self);

    /// Pull converted bytes into `buf`. `Ok(0)` is a miss, not an error.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    /// Current digital level of the trigger reference input.
    fn trigger_input_level(&mut self) -> i32;
}

/// Hardware seam for the external converter's shared synchronous bus and
/// its hardware edge counter.
pub trait SampleBus: Send {
    /// One full-buffer transaction. `Ok(0)` is a miss, not an error.
    fn transfer(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Current value of the hardware edge counter.
    fn edge_count(&mut self) -> i32;

    /// Re-arm the edge counter to count edges of the given polarity.
    fn arm_edge_counter(&mut self, edge: TriggerEdge) -> io::Result<()>;

    /// Select an entry of [`BUS_CLOCK_TABLE_HZ`], retuning bus clock and
    /// timing generator together.
    fn set_clock_step(&mut self, step: usize) -> io::Result<()>;
}

/// A source of raw sample buffers. Two interchangeable backends exist;
/// the streaming loop is written against this trait only.
pub trait AcquisitionSource: Send {
    fn descriptor(&self) -> &BackendDescriptor;

    fn config(&self) -> &AcquisitionConfig;

    /// True when the backend is started on client connect and stopped on
    /// disconnect (the external converter free-runs instead).
    fn starts_per_session(&self) -> bool;

    /// True when acquiring requires one explicit transaction per loop
    /// iteration regardless of trigger state.
    fn reads_every_iteration(&self) -> bool;

    fn start(&mut self) -> Result<(), AcquisitionError>;

    fn stop(&mut self);

    /// Apply a new sample-rate divider. Restarts the conversion pipeline
    /// when it is running; on failure the source is left stopped.
    fn reconfigure(&mut self, divider: u32) -> Result<(), AcquisitionError>;

    /// Fill `buf` with raw samples. `Ok(0)` is a miss, not an error.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, AcquisitionError>;

    /// Current trigger reference sample (digital level or edge count).
    fn trigger_input(&mut self) -> i32;

    /// How [`Self::trigger_input`] samples are to be interpreted.
    fn trigger_input_kind(&self) -> TriggerInputKind;

    /// Prepare edge detection for the given polarity.
    fn arm_trigger(&mut self, edge: TriggerEdge) -> Result<(), AcquisitionError>;

    /// Wall time covered by one full sample buffer.
    fn conversion_interval(&self) -> Duration;
}

fn validate_divider(
    divider: u32,
    descriptor: &BackendDescriptor,
) -> Result<(), AcquisitionError> {
    if divider == 0 || !divider.is_power_of_two() || divider > descriptor.largest_divider() {
        return Err(AcquisitionError::InvalidDivider(divider));
    }
    Ok(())
}

/// On-chip continuous-mode converter backend.
pub struct InternalAdc<D: ConversionDriver> {
    driver: D,
    descriptor: BackendDescriptor,
    config: AcquisitionConfig,
    base_wait: Duration,
    conversion_wait: Duration,
    running: bool,
    initializing: AtomicBool,
}

impl<D: ConversionDriver> InternalAdc<D> {
    pub fn new(driver: D) -> Self {
        Self::with_descriptor(driver, BackendDescriptor::INTERNAL, BASE_CONVERSION_WAIT)
    }

    pub(crate) fn with_descriptor(
        driver: D,
        descriptor: BackendDescriptor,
        base_wait: Duration,
    ) -> Self {
        Self {
            driver,
            descriptor,
            config: AcquisitionConfig::new(),
            base_wait,
            conversion_wait: base_wait,
            running: false,
            initializing: AtomicBool::new(false),
        }
    }

    fn allocation_rate(&self) -> u32 {
        ADC_ALLOCATION_RATE_HZ / self.config.sample_rate_divider
    }
}

impl<D: ConversionDriver> AcquisitionSource for InternalAdc<D> {
    fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    fn config(&self) -> &AcquisitionConfig {
        &self.config
    }

    fn starts_per_session(&self) -> bool {
        true
    }

    fn reads_every_iteration(&self) -> bool {
        false
    }

    fn start(&mut self) -> Result<(), AcquisitionError> {
        if self.running {
            return Ok(());
        }
        // Overlapping starts must not race the driver allocation.
        if self.initializing.swap(true, Ordering::SeqCst) {
            return Err(AcquisitionError::Busy);
        }
        let result = self
            .driver
            .allocate(self.allocation_rate())
            .map_err(|source| AcquisitionError::AllocationFailed { attempts: 1, source });
        if result.is_ok() {
            log::info!(
                "conversion pipeline started at {} Hz",
                self.allocation_rate()
            );
            self.running = true;
        }
        self.initializing.store(false, Ordering::SeqCst);
        result
    }

    fn stop(&mut self) {
        if self.running {
            self.driver.release();
            self.running = false;
            log::info!("conversion pipeline stopped");
        }
    }

    fn reconfigure(&mut self, divider: u32) -> Result<(), AcquisitionError> {
        validate_divider(divider, &self.descriptor)?;
        self.config.sample_rate_divider = divider;
        self.conversion_wait = self.base_wait * divider;
        if !self.running {
            // Allocation happens on the next start with the new rate.
            return Ok(());
        }

        self.stop();
        timing::wait_for(REALLOC_DELAY);

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.driver.allocate(self.allocation_rate()) {
                Ok(()) => {
                    log::info!(
                        "conversion pipeline reconfigured to {} Hz",
                        self.allocation_rate()
                    );
                    self.running = true;
                    return Ok(());
                }
                Err(source) => {
                    if attempt >= REALLOC_ATTEMPTS {
                        return Err(AcquisitionError::AllocationFailed {
                            attempts: attempt,
                            source,
                        });
                    }
                    log::warn!("pipeline allocation attempt {attempt} failed: {source}; retrying");
                    timing::wait_for(REALLOC_DELAY);
                }
            }
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, AcquisitionError> {
        if !self.running {
            return Err(AcquisitionError::Busy);
        }
        timing::wait_for(self.conversion_wait);
        self.driver
            .read(buf, READ_TIMEOUT)
            .map_err(AcquisitionError::Read)
    }

    fn trigger_input(&mut self) -> i32 {
        self.driver.trigger_input_level()
    }

    fn trigger_input_kind(&self) -> TriggerInputKind {
        TriggerInputKind::Level
    }

    fn arm_trigger(&mut self, _edge: TriggerEdge) -> Result<(), AcquisitionError> {
        // The digital trigger input is sampled directly; polarity lives
        // in the edge-detection rule.
        Ok(())
    }

    fn conversion_interval(&self) -> Duration {
        self.conversion_wait
    }
}

/// External converter backend. The bus is shared electrically with the
/// timing generator, so every transaction takes the bus mutex.
pub struct ExternalAdc<B: SampleBus> {
    bus: Arc<Mutex<B>>,
    descriptor: BackendDescriptor,
    config: AcquisitionConfig,
}

impl<B: SampleBus> ExternalAdc<B> {
    pub fn new(bus: Arc<Mutex<B>>) -> Self {
        Self::with_descriptor(bus, BackendDescriptor::EXTERNAL)
    }

    pub(crate) fn with_descriptor(bus: Arc<Mutex<B>>, descriptor: BackendDescriptor) -> Self {
        Self {
            bus,
            descriptor,
            config: AcquisitionConfig::new(),
        }
    }

    fn lock_bus(&self) -> MutexGuard<'_, B> {
        self.bus.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<B: SampleBus> AcquisitionSource for ExternalAdc<B> {
    fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    fn config(&self) -> &AcquisitionConfig {
        &self.config
    }

    fn starts_per_session(&self) -> bool {
        false
    }

    fn reads_every_iteration(&self) -> bool {
        true
    }

    fn start(&mut self) -> Result<(), AcquisitionError> {
        // The converter free-runs; nothing to start.
        Ok(())
    }

    fn stop(&mut self) {}

    fn reconfigure(&mut self, divider: u32) -> Result<(), AcquisitionError> {
        validate_divider(divider, &self.descriptor)?;
        let step = divider.trailing_zeros() as usize;
        self.lock_bus()
            .set_clock_step(step)
            .map_err(AcquisitionError::Bus)?;
        self.config.sample_rate_divider = divider;
        log::info!(
            "bus clock stepped to {} Hz (divider {divider})",
            BUS_CLOCK_TABLE_HZ[step]
        );
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, AcquisitionError> {
        // Mutex held only for the duration of one transaction.
        self.lock_bus().transfer(buf).map_err(AcquisitionError::Bus)
    }

    fn trigger_input(&mut self) -> i32 {
        self.lock_bus().edge_count()
    }

    fn trigger_input_kind(&self) -> TriggerInputKind {
        TriggerInputKind::EdgeCount
    }

    fn arm_trigger(&mut self, edge: TriggerEdge) -> Result<(), AcquisitionError> {
        self.lock_bus()
            .arm_edge_counter(edge)
            .map_err(AcquisitionError::Bus)
    }

    fn conversion_interval(&self) -> Duration {
        let rate = u64::from(self.descriptor.sample_rate_hz / self.config.sample_rate_divider);
        let micros = self.descriptor.buffer_samples as u64 * 1_000_000 / rate.max(1);
        Duration::from_micros(micros)
    }
}
