use tandem_protocol::TransferEvent;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Capacity of the lifecycle event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Cloneable handle for publishing [`TransferEvent`]s.
///
/// Emission never blocks: a full channel drops the event with a warning.
#[derive(Debug, Clone, Default)]
pub struct EventSender {
    tx: Option<mpsc::Sender<TransferEvent>>,
}

impl EventSender {
    /// Creates a connected sender/receiver pair.
    pub fn channel() -> (Self, mpsc::Receiver<TransferEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        (Self { tx: Some(tx) }, rx)
    }

    /// A sender that discards everything.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: TransferEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                tracing::warn!(event = event.name(), "event channel full, dropping event");
            }
            Err(TrySendError::Closed(_)) => {
                tracing::trace!("event receiver dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emits_to_receiver() {
        let (events, mut rx) = EventSender::channel();
        events.emit(TransferEvent::TransferCancelled {
            transfer_id: "t1".into(),
        });
        let got = rx.recv().await.unwrap();
        assert_eq!(got.transfer_id(), Some("t1"));
    }

    #[test]
    fn disabled_and_closed_are_silent() {
        EventSender::disabled().emit(TransferEvent::DeviceDisconnected {
            device_id: "d".into(),
        });

        let (events, rx) = EventSender::channel();
        drop(rx);
        events.emit(TransferEvent::DeviceDisconnected {
            device_id: "d".into(),
        });
    }
}
