use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ambilight_common::protocol::ServerEvent;
use tokio::sync::mpsc;

/// Pushes events to one specific connection.
///
/// Implemented by the transport layer; sessions and the control plane only
/// see this trait. `emit` must not block: transports queue the event and
/// deliver it from their own writer.
pub trait Emitter: Send + Sync {
    fn emit(&self, event: ServerEvent) -> Result<(), EmitError>;
}

#[derive(Debug, thiserror::Error)]
pub enum EmitError {
    #[error("connection closed")]
    Disconnected,
    /// The client is not keeping up; the event was dropped.
    #[error("outbound queue full")]
    QueueFull,
    #[error("transport error: {0}")]
    Transport(String),
}

/// Emitter feeding a connection's writer task.
///
/// Events keep their emission order. Acknowledgments and errors are always
/// queued; `colors` events are refused with [`EmitError::QueueFull`] once
/// `capacity` of them are waiting, so a slow client sees fresh colors
/// instead of an ever-growing backlog.
pub struct ChannelEmitter {
    tx: mpsc::UnboundedSender<ServerEvent>,
    pending_colors: Arc<AtomicUsize>,
    capacity: usize,
}

/// Writer-side half of a [`ChannelEmitter`].
pub struct EmitterReceiver {
    rx: mpsc::UnboundedReceiver<ServerEvent>,
    pending_colors: Arc<AtomicUsize>,
}

impl ChannelEmitter {
    /// `capacity` is the colors backlog; clamped to at least 1.
    pub fn channel(capacity: usize) -> (Self, EmitterReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending_colors = Arc::new(AtomicUsize::new(0));
        let emitter = Self {
            tx,
            pending_colors: Arc::clone(&pending_colors),
            capacity: capacity.max(1),
        };
        (emitter, EmitterReceiver { rx, pending_colors })
    }

    fn reserve_color_slot(&self) -> Result<(), EmitError> {
        self.pending_colors
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|_| EmitError::QueueFull)
    }
}

impl Emitter for ChannelEmitter {
    fn emit(&self, event: ServerEvent) -> Result<(), EmitError> {
        if self.tx.is_closed() {
            return Err(EmitError::Disconnected);
        }
        let is_colors = matches!(event, ServerEvent::Colors(_));
        if is_colors {
            self.reserve_color_slot()?;
        }
        self.tx.send(event).map_err(|_| {
            if is_colors {
                self.pending_colors.fetch_sub(1, Ordering::AcqRel);
            }
            EmitError::Disconnected
        })
    }
}

impl EmitterReceiver {
    /// Next queued event; `None` once every emitter is dropped and the
    /// queue is drained.
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        let event = self.rx.recv().await?;
        if matches!(event, ServerEvent::Colors(_)) {
            self.pending_colors.fetch_sub(1, Ordering::AcqRel);
        }
        Some(event)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Records every event in emission order.
    #[derive(Default)]
    pub struct RecordingEmitter {
        events: Mutex<Vec<ServerEvent>>,
    }

    impl RecordingEmitter {
        pub fn events(&self) -> Vec<ServerEvent> {
            self.events.lock().unwrap().clone()
        }

        pub fn colors(&self) -> Vec<ambilight_common::frame::ZoneColorSet> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    ServerEvent::Colors(set) => Some(set),
                    _ => None,
                })
                .collect()
        }

        pub fn names(&self) -> Vec<&'static str> {
            self.events().iter().map(|e| e.name()).collect()
        }
    }

    impl Emitter for RecordingEmitter {
        fn emit(&self, event: ServerEvent) -> Result<(), EmitError> {
            self.events.lock().unwrap().push(event);
            Ok(())
        }
    }
}
