//! # NetScope
//!
//! A Rust library implementing the streaming core of a network-attached
//! oscilloscope: sample acquisition, edge triggering, and raw buffer
//! delivery over TCP.
//!
//! Two interchangeable sampling backends produce raw buffers. A
//! long-lived worker runs the accept/stream loop and pushes each buffer
//! to the connected client; a lock-free control plane lets a request
//! path (an HTTP handler, a CLI, a test) retune the device while the
//! worker keeps running.
//!
//! ## Features
//!
//! - **Two sampling backends**: an on-chip continuous-mode converter and
//!   an external converter on a shared synchronous bus, both behind the
//!   [`AcquisitionSource`] trait
//! - **Edge triggering**: continuous and single-shot modes with
//!   rising/falling polarity and a PWM-derived trigger level
//! - **Resumable sends**: non-blocking socket writes that survive
//!   partial writes and can be cancelled between attempts
//! - **Live reconfiguration**: pause/resume handshake, sample-rate
//!   dividers, and listening-socket hot-swap without restarting the
//!   worker
//! - **Hardware seams**: [`ConversionDriver`], [`SampleBus`], and
//!   [`TriggerLevelOutput`] keep the core testable off-target
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::net::TcpListener;
//! use std::sync::Arc;
//! use std::thread;
//!
//! use netscope::{
//!     AcquisitionConfig, BackendDescriptor, InternalAdc, ScopeControl, StreamingLoop,
//!     TriggerMode,
//! };
//!
//! # use std::io;
//! # use std::time::Duration;
//! # struct Driver;
//! # impl netscope::ConversionDriver for Driver {
//! #     fn allocate(&mut self, _rate: u32) -> io::Result<()> { Ok(()) }
//! #     fn release(&mut self) {}
//! #     fn read(&mut self, _buf: &mut [u8], _timeout: Duration) -> io::Result<usize> { Ok(0) }
//! #     fn trigger_input_level(&mut self) -> i32 { 0 }
//! # }
//! # struct Pwm;
//! # impl netscope::TriggerLevelOutput for Pwm {
//! #     fn set_duty(&mut self, _duty: u32) -> io::Result<()> { Ok(()) }
//! # }
//! let control = Arc::new(ScopeControl::new(
//!     BackendDescriptor::INTERNAL,
//!     AcquisitionConfig::new(),
//!     Box::new(Pwm),
//! ));
//!
//! let mut worker = StreamingLoop::new(Arc::clone(&control), InternalAdc::new(Driver));
//! let handle = thread::spawn(move || worker.run());
//!
//! // Clients can now connect and receive raw sample buffers.
//! control.replace_listening_socket(Some(TcpListener::bind("0.0.0.0:9000")?))?;
//!
//! // Retune while streaming.
//! control.set_trigger_mode(TriggerMode::SingleShot)?;
//! control.set_trigger_level(55)?;
//! control.request_sample_rate_change(4)?;
//!
//! control.request_shutdown();
//! handle.join().unwrap();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod acquisition;
pub mod control;
pub mod send;
pub mod streaming;
pub mod timing;
pub mod trigger;

#[cfg(test)]
pub(crate) mod testutil;

// Re-export the main types for convenience
pub use acquisition::{
    AcquisitionConfig, AcquisitionError, AcquisitionSource, BackendDescriptor, ConversionDriver,
    ExternalAdc, InternalAdc, SampleBus,
};

pub use control::{ScopeControl, ScopeStatus};

pub use send::{AbortReason, SendChannel, SendError, SendOutcome, SendTransport};

pub use streaming::StreamingLoop;

pub use trigger::{
    TriggerEdge, TriggerEngine, TriggerError, TriggerInputKind, TriggerLevel, TriggerLevelOutput,
    TriggerMode,
};
