use std::io::{self, Write};
use std::net::TcpStream;
use std::time::Duration;

use crate::timing;

/// Sleep between write attempts while the socket buffer is full. Bounds
/// CPU usage without an event-driven wait.
const WOULD_BLOCK_RETRY: Duration = Duration::from_millis(10);

/// Why an in-progress send was cancelled cooperatively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// The control plane asked the worker to pause.
    PauseRequested,
    /// The listening socket was replaced or a reset was requested.
    SocketChanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The whole buffer was written.
    Complete,
    /// A cancellation predicate fired between write attempts. Not an
    /// error; a control signal.
    Aborted(AbortReason),
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("a send is already in progress")]
    Busy,

    #[error("socket write failed: {0}")]
    Io(#[from] io::Error),
}

/// Transport a [`SendChannel`] can drive: byte sink plus blocking-mode
/// control. Implemented for [`TcpStream`]; tests substitute a scripted
/// transport.
pub trait SendTransport: Write {
    fn set_nonblocking(&mut self, nonblocking: bool) -> io::Result<()>;
}

impl SendTransport for TcpStream {
    fn set_nonblocking(&mut self, nonblocking: bool) -> io::Result<()> {
        Self::set_nonblocking(self, nonblocking)
    }
}

#[derive(Debug, Clone, Copy)]
struct SendState {
    total_len: usize,
    offset: usize,
    in_progress: bool,
}

impl SendState {
    const fn idle() -> Self {
        Self {
            total_len: 0,
            offset: 0,
            in_progress: false,
        }
    }
}

/// Resumable, cancellable non-blocking byte-stream sender.
///
/// Exactly one send may be outstanding at a time; the channel owns the
/// buffer for the duration of the call and must not be reentered from
/// another task.
pub struct SendChannel {
    state: SendState,
}

impl SendChannel {
    pub fn new() -> Self {
        Self {
            state: SendState::idle(),
        }
    }

    /// Write `buffer` in full, retrying on partial writes and would-block.
    ///
    /// The transport is switched to non-blocking mode on entry and
    /// restored to blocking mode on every exit path. `cancel` is
    /// evaluated before each write attempt; when it yields a reason the
    /// send returns [`SendOutcome::Aborted`] with the offset bookkeeping
    /// intact up to that point.
    pub fn send<T, C>(
        &mut self,
        transport: &mut T,
        buffer: &[u8],
        cancel: C,
    ) -> Result<SendOutcome, SendError>
    where
        T: SendTransport,
        C: FnMut() -> Option<AbortReason>,
    {
        if self.state.in_progress {
            return Err(SendError::Busy);
        }
        transport.set_nonblocking(true)?;
        self.state = SendState {
            total_len: buffer.len(),
            offset: 0,
            in_progress: true,
        };

        let result = self.drive(transport, buffer, cancel);
        let restored = transport.set_nonblocking(false);
        self.state = SendState::idle();

        let outcome = result?;
        restored?;
        Ok(outcome)
    }

    fn drive<T, C>(
        &mut self,
        transport: &mut T,
        buffer: &[u8],
        mut cancel: C,
    ) -> Result<SendOutcome, SendError>
    where
        T: SendTransport,
        C: FnMut() -> Option<AbortReason>,
    {
        while self.state.offset < self.state.total_len {
            if let Some(reason) = cancel() {
                log::debug!(
                    "send aborted ({reason:?}) at {}/{} bytes",
                    self.state.offset,
                    self.state.total_len
                );
                return Ok(SendOutcome::Aborted(reason));
            }

            match transport.write(&buffer[self.state.offset..]) {
                Ok(0) => {
                    return Err(SendError::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "transport accepted no bytes",
                    )))
                }
                Ok(written) => self.state.offset += written,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    timing::wait_for(WOULD_BLOCK_RETRY);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(SendError::Io(e)),
            }
        }
        Ok(SendOutcome::Complete)
    }
}

impl Default for SendChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FlakyTransport, WriteStep};

    #[test]
    fn test_send_completes_across_partial_writes_and_would_block() {
        let payload: Vec<u8> = (0..=99).collect();
        let mut transport = FlakyTransport::new(vec![
            WriteStep::Accept(30),
            WriteStep::WouldBlock,
            WriteStep::Accept(30),
            WriteStep::WouldBlock,
            WriteStep::WouldBlock,
            WriteStep::Accept(25),
        ]);

        let mut channel = SendChannel::new();
        let outcome = channel.send(&mut transport, &payload, || None).unwrap();

        assert_eq!(outcome, SendOutcome::Complete);
        assert_eq!(transport.written(), payload);
        // Requested lengths shrink exactly by what was accepted, so the
        // internal offset was monotone and never exceeded the total.
        assert_eq!(transport.requested_lens(), vec![100, 70, 70, 40, 40, 40, 15]);
        assert!(!transport.nonblocking());
    }

    #[test]
    fn test_send_aborts_on_cancellation_without_corrupting_state() {
        let payload = vec![7u8; 50];
        let mut transport = FlakyTransport::new(vec![WriteStep::Accept(20)]);

        let mut calls = 0;
        let mut channel = SendChannel::new();
        let outcome = channel
            .send(&mut transport, &payload, || {
                calls += 1;
                (calls > 1).then_some(AbortReason::SocketChanged)
            })
            .unwrap();

        assert_eq!(outcome, SendOutcome::Aborted(AbortReason::SocketChanged));
        assert_eq!(transport.written().len(), 20);
        assert!(!transport.nonblocking());

        // The channel is reusable after an abort.
        let mut transport = FlakyTransport::new(vec![]);
        let outcome = channel.send(&mut transport, &payload, || None).unwrap();
        assert_eq!(outcome, SendOutcome::Complete);
        assert_eq!(transport.written().len(), payload.len());
    }

    #[test]
    fn test_send_surfaces_io_error_and_restores_blocking() {
        let payload = vec![1u8; 10];
        let mut transport =
            FlakyTransport::new(vec![WriteStep::Accept(4), WriteStep::Error]);

        let mut channel = SendChannel::new();
        let result = channel.send(&mut transport, &payload, || None);

        assert!(matches!(result, Err(SendError::Io(_))));
        assert!(!transport.nonblocking());

        // Error cleared the in-progress state.
        let mut transport = FlakyTransport::new(vec![]);
        assert!(channel.send(&mut transport, &payload, || None).is_ok());
    }

    #[test]
    fn test_empty_buffer_completes_without_writes() {
        let mut transport = FlakyTransport::new(vec![]);
        let mut channel = SendChannel::new();
        let outcome = channel.send(&mut transport, &[], || None).unwrap();
        assert_eq!(outcome, SendOutcome::Complete);
        assert!(transport.requested_lens().is_empty());
    }

    #[test]
    fn test_interrupted_write_is_retried() {
        let payload = vec![9u8; 8];
        let mut transport =
            FlakyTransport::new(vec![WriteStep::Interrupted, WriteStep::Accept(8)]);

        let mut channel = SendChannel::new();
        let outcome = channel.send(&mut transport, &payload, || None).unwrap();
        assert_eq!(outcome, SendOutcome::Complete);
        assert_eq!(transport.written().len(), 8);
    }
}
