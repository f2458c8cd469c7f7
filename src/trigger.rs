use std::io;

use crate::acquisition::{AcquisitionError, AcquisitionSource};

/// Resolution of the PWM channel driving the trigger-level comparator
/// reference.
pub const LEVEL_PWM_RESOLUTION_BITS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    /// Every acquired buffer is forwarded.
    Continuous,
    /// A buffer is forwarded only after an edge on the trigger input.
    SingleShot,
}

impl TriggerMode {
    pub(crate) fn to_raw(self) -> u8 {
        match self {
            Self::Continuous => 0,
            Self::SingleShot => 1,
        }
    }

    pub(crate) fn from_raw(raw: u8) -> Self {
        if raw == 1 {
            Self::SingleShot
        } else {
            Self::Continuous
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerEdge {
    Rising,
    Falling,
}

impl TriggerEdge {
    pub(crate) fn to_raw(self) -> u8 {
        match self {
            Self::Rising => 1,
            Self::Falling => 0,
        }
    }

    pub(crate) fn from_raw(raw: u8) -> Self {
        if raw == 1 {
            Self::Rising
        } else {
            Self::Falling
        }
    }
}

/// What the trigger-input samples of a backend mean.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerInputKind {
    /// Direct digital level of the trigger pin; edge polarity is applied
    /// in software when comparing consecutive samples.
    Level,
    /// Hardware edge counter. Polarity is selected at arming time and
    /// the counter only ever increments, so any change is an edge of the
    /// armed polarity.
    EdgeCount,
}

#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("trigger level {0}% out of range (0-100)")]
    LevelOutOfRange(u8),

    #[error("failed to update trigger level output: {0}")]
    LevelUpdateFailed(#[source] io::Error),
}

/// Seam for the PWM channel whose filtered output is the comparator
/// reference voltage for the trigger level.
pub trait TriggerLevelOutput: Send {
    fn set_duty(&mut self, duty: u32) -> io::Result<()>;
}

/// Map a level percentage onto the PWM duty range. Monotone over
/// `0..=100`.
pub fn percent_to_duty(percent: u8) -> u32 {
    u32::from(percent) * (1 << LEVEL_PWM_RESOLUTION_BITS) / 100
}

/// Edge-detection rule for a directly sampled trigger level.
pub fn edge_detected(edge: TriggerEdge, previous: i32, current: i32) -> bool {
    match edge {
        TriggerEdge::Rising => current > previous,
        TriggerEdge::Falling => current < previous,
    }
}

/// Whether two consecutive trigger-input samples constitute an edge of
/// the armed polarity. For a hardware edge counter the polarity already
/// happened in silicon; the count moving at all is the detection.
pub fn trigger_fired(
    kind: TriggerInputKind,
    edge: TriggerEdge,
    previous: i32,
    current: i32,
) -> bool {
    match kind {
        TriggerInputKind::Level => edge_detected(edge, previous, current),
        TriggerInputKind::EdgeCount => current != previous,
    }
}

/// The trigger-level reference. Owned by the control plane: level changes
/// arrive from the request path and poke the PWM directly, independent of
/// the streaming worker.
pub struct TriggerLevel {
    output: Box<dyn TriggerLevelOutput>,
    percent: u8,
}

impl TriggerLevel {
    pub fn new(output: Box<dyn TriggerLevelOutput>) -> Self {
        Self { output, percent: 0 }
    }

    /// Set the trigger level as a percentage of the full input range.
    /// Rejects out-of-range values without touching the current level.
    pub fn set(&mut self, percent: u8) -> Result<(), TriggerError> {
        if percent > 100 {
            return Err(TriggerError::LevelOutOfRange(percent));
        }
        let duty = percent_to_duty(percent);
        log::info!("setting trigger level to {percent}% (duty {duty})");
        self.output
            .set_duty(duty)
            .map_err(TriggerError::LevelUpdateFailed)?;
        self.percent = percent;
        Ok(())
    }

    pub fn percent(&self) -> u8 {
        self.percent
    }
}

/// Per-iteration edge detection state. Owned by the streaming worker;
/// mode and edge changes are applied at its safe points so re-arming
/// never straddles an acquisition.
pub struct TriggerEngine {
    mode: TriggerMode,
    edge: TriggerEdge,
    input: TriggerInputKind,
    last_sample: i32,
}

impl TriggerEngine {
    pub fn new() -> Self {
        Self::for_input(TriggerInputKind::Level)
    }

    pub fn for_input(input: TriggerInputKind) -> Self {
        Self {
            mode: TriggerMode::Continuous,
            edge: TriggerEdge::Rising,
            input,
            last_sample: 0,
        }
    }

    pub fn mode(&self) -> TriggerMode {
        self.mode
    }

    pub fn edge(&self) -> TriggerEdge {
        self.edge
    }

    /// Switch trigger mode. Entering single-shot samples the current
    /// trigger input so the first comparison is well-defined, and re-arms
    /// the hardware edge counter where the backend has one.
    pub fn apply_mode<S: AcquisitionSource>(
        &mut self,
        mode: TriggerMode,
        source: &mut S,
    ) -> Result<(), AcquisitionError> {
        if mode == self.mode {
            return Ok(());
        }
        if mode == TriggerMode::SingleShot {
            source.arm_trigger(self.edge)?;
            self.last_sample = source.trigger_input();
        }
        log::info!("trigger mode set to {mode:?}");
        self.mode = mode;
        Ok(())
    }

    /// Switch edge polarity. While single-shot is active this re-arms and
    /// re-samples in one step, so no edge is missed or double-counted
    /// across the change.
    pub fn apply_edge<S: AcquisitionSource>(
        &mut self,
        edge: TriggerEdge,
        source: &mut S,
    ) -> Result<(), AcquisitionError> {
        if edge == self.edge {
            return Ok(());
        }
        if self.mode == TriggerMode::SingleShot {
            source.arm_trigger(edge)?;
            self.last_sample = source.trigger_input();
        }
        log::info!("trigger edge set to {edge:?}");
        self.edge = edge;
        Ok(())
    }

    /// One edge-detection step against the previous trigger-input sample.
    pub fn check(&mut self, current: i32) -> bool {
        let fired = trigger_fired(self.input, self.edge, self.last_sample, current);
        self.last_sample = current;
        fired
    }
}

impl Default for TriggerEngine {
    fn default() -> Self {
        Self::new()
    }
}
