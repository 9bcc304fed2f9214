//! Narrow transport interfaces the pipeline is built against.
//!
//! The real deployment binds these to the shared-memory message transport;
//! tests and standalone runs use the in-memory pair in [`mem`]. The core
//! never sees anything wider than these traits.

use std::time::Duration;

use crate::error::DataDistError;
use crate::pool::PooledMessage;

/// Result of one receive attempt on a readout channel.
#[derive(Debug, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// `parts` was filled with one multi-part delivery.
    Parts,
    /// Nothing arrived within the channel's internal wait (~100 ms).
    Timeout,
    /// The transport is in an interrupted state (reconfiguring, stopping).
    Interrupted,
    /// Hard receive failure with a transport error code.
    Error(i32),
}

/// Inbound multi-part message channel (readout side).
pub trait ReadoutChannel: Send {
    fn name(&self) -> &str;

    /// Fetch one delivery, appending its parts to `parts`.
    ///
    /// Blocks internally for at most ~100 ms; the caller loops on
    /// `Timeout`/`Interrupted`.
    fn receive(&mut self, parts: &mut Vec<PooledMessage>) -> ReceiveOutcome;
}

/// Outbound multi-part message channel.
pub trait OutputChannel: Send {
    fn name(&self) -> &str;

    /// Send one multi-part burst. Hard failures surface as errors; part
    /// leases are released once the parts are dropped downstream.
    fn send(&mut self, parts: Vec<PooledMessage>) -> Result<(), DataDistError>;

    /// Whether the transport still considers itself running; decides the
    /// log severity of send failures during shutdown.
    fn is_running(&self) -> bool;
}

/// In-memory channel pair over [`ConcurrentFifo`](crate::queue::ConcurrentFifo).
///
/// Stands in for the shared-memory transport in tests and standalone runs.
pub mod mem {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::queue::{ConcurrentFifo, PopResult};

    const RECEIVE_WAIT: Duration = Duration::from_millis(100);

    enum Delivery {
        Parts(Vec<PooledMessage>),
        /// Injected hard failure (test hook).
        Error(i32),
    }

    /// Producer handle feeding a [`MemReadoutChannel`].
    #[derive(Clone)]
    pub struct MemReadoutLink {
        queue: Arc<ConcurrentFifo<Delivery>>,
    }

    impl MemReadoutLink {
        /// Deliver one multi-part message.
        pub fn deliver(&self, parts: Vec<PooledMessage>) -> bool {
            self.queue.push(Delivery::Parts(parts))
        }

        /// Make the next receive report a hard transport error.
        pub fn inject_error(&self, code: i32) {
            self.queue.push(Delivery::Error(code));
        }

        /// Put the channel into the interrupted/stopping state.
        pub fn close(&self) {
            self.queue.stop();
        }
    }

    /// Consumer end implementing [`ReadoutChannel`].
    pub struct MemReadoutChannel {
        name: String,
        queue: Arc<ConcurrentFifo<Delivery>>,
    }

    /// Create a linked producer/consumer readout channel.
    pub fn readout_pair(name: &str) -> (MemReadoutLink, MemReadoutChannel) {
        let queue = Arc::new(ConcurrentFifo::new());
        (
            MemReadoutLink {
                queue: Arc::clone(&queue),
            },
            MemReadoutChannel {
                name: name.to_owned(),
                queue,
            },
        )
    }

    impl ReadoutChannel for MemReadoutChannel {
        fn name(&self) -> &str {
            &self.name
        }

        fn receive(&mut self, parts: &mut Vec<PooledMessage>) -> ReceiveOutcome {
            match self.queue.pop_wait_for(RECEIVE_WAIT) {
                PopResult::Item(Delivery::Parts(delivered)) => {
                    parts.extend(delivered);
                    ReceiveOutcome::Parts
                }
                PopResult::Item(Delivery::Error(code)) => ReceiveOutcome::Error(code),
                PopResult::Timeout => ReceiveOutcome::Timeout,
                PopResult::Stopped => ReceiveOutcome::Interrupted,
            }
        }
    }

    /// Sender end implementing [`OutputChannel`].
    pub struct MemOutputChannel {
        name: String,
        queue: Arc<ConcurrentFifo<Vec<PooledMessage>>>,
        running: Arc<AtomicBool>,
    }

    /// Receiver handle for inspecting sent bursts.
    #[derive(Clone)]
    pub struct MemOutputSink {
        queue: Arc<ConcurrentFifo<Vec<PooledMessage>>>,
        running: Arc<AtomicBool>,
    }

    /// Create a linked output channel and its inspection sink.
    pub fn output_pair(name: &str) -> (MemOutputChannel, MemOutputSink) {
        let queue = Arc::new(ConcurrentFifo::new());
        let running = Arc::new(AtomicBool::new(true));
        (
            MemOutputChannel {
                name: name.to_owned(),
                queue: Arc::clone(&queue),
                running: Arc::clone(&running),
            },
            MemOutputSink { queue, running },
        )
    }

    impl OutputChannel for MemOutputChannel {
        fn name(&self) -> &str {
            &self.name
        }

        fn send(&mut self, parts: Vec<PooledMessage>) -> Result<(), DataDistError> {
            if !self.queue.push(parts) {
                return Err(DataDistError::Channel {
                    channel: self.name.clone(),
                    message: "output channel closed".into(),
                });
            }
            Ok(())
        }

        fn is_running(&self) -> bool {
            self.running.load(Ordering::Relaxed)
        }
    }

    impl MemOutputSink {
        /// Pop one sent burst, waiting up to `timeout`.
        pub fn recv_timeout(&self, timeout: Duration) -> Option<Vec<PooledMessage>> {
            self.queue.pop_wait_for(timeout).into_item()
        }

        /// Simulate the transport leaving the running state.
        pub fn shut_down(&self) {
            self.running.store(false, Ordering::Relaxed);
            self.queue.stop();
        }

        pub fn pending(&self) -> usize {
            self.queue.len()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mem::*;
    use super::*;
    use bytes::Bytes;

    fn msg(data: &'static [u8]) -> PooledMessage {
        PooledMessage::unpooled(Bytes::from_static(data))
    }

    #[test]
    fn test_mem_readout_delivery() {
        let (link, mut channel) = readout_pair("readout");
        link.deliver(vec![msg(b"hdr"), msg(b"payload")]);

        let mut parts = Vec::new();
        assert_eq!(channel.receive(&mut parts), ReceiveOutcome::Parts);
        assert_eq!(parts.len(), 2);
    }

    #[test]
    fn test_mem_readout_timeout_and_interrupt() {
        let (link, mut channel) = readout_pair("readout");
        let mut parts = Vec::new();
        assert_eq!(channel.receive(&mut parts), ReceiveOutcome::Timeout);
        link.close();
        assert_eq!(channel.receive(&mut parts), ReceiveOutcome::Interrupted);
    }

    #[test]
    fn test_mem_readout_error_injection() {
        let (link, mut channel) = readout_pair("readout");
        link.inject_error(-42);
        let mut parts = Vec::new();
        assert_eq!(channel.receive(&mut parts), ReceiveOutcome::Error(-42));
    }

    #[test]
    fn test_mem_output_send_and_shutdown() {
        let (mut out, sink) = output_pair("dpl");
        assert!(out.is_running());
        out.send(vec![msg(b"x")]).unwrap();
        assert_eq!(sink.recv_timeout(Duration::from_millis(10)).unwrap().len(), 1);

        sink.shut_down();
        assert!(!out.is_running());
        assert!(out.send(vec![msg(b"y")]).is_err());
    }
}
