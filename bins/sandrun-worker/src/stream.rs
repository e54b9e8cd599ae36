// Live streaming between a caller and a running job
//
// The job side gets a `StreamChannel` (inputs in, events out), the caller
// keeps the matching `StreamHandle`. Dropping the handle's input sender
// closes the child's stdin.

use sandrun_common::types::{StreamEvent, StreamInput};
use tokio::sync::mpsc;

pub struct StreamChannel {
    pub(crate) inbound: mpsc::Receiver<StreamInput>,
    pub(crate) outbound: mpsc::Sender<StreamEvent>,
    inbound_closed: bool,
}

pub struct StreamHandle {
    pub input: mpsc::Sender<StreamInput>,
    pub events: mpsc::Receiver<StreamEvent>,
}

impl StreamChannel {
    pub fn pair(capacity: usize) -> (StreamChannel, StreamHandle) {
        let (input_tx, input_rx) = mpsc::channel(capacity);
        let (event_tx, event_rx) = mpsc::channel(capacity);
        (
            StreamChannel {
                inbound: input_rx,
                outbound: event_tx,
                inbound_closed: false,
            },
            StreamHandle {
                input: input_tx,
                events: event_rx,
            },
        )
    }

    /// Next caller input, or `None` once the caller has hung up.
    pub(crate) async fn recv(&mut self) -> Option<StreamInput> {
        if self.inbound_closed {
            return None;
        }
        let input = self.inbound.recv().await;
        if input.is_none() {
            self.inbound_closed = true;
        }
        input
    }

    pub(crate) fn is_inbound_closed(&self) -> bool {
        self.inbound_closed
    }

    /// A caller that stopped listening is not an error for the job.
    pub(crate) async fn emit(&self, event: StreamEvent) {
        let _ = self.outbound.send(event).await;
    }
}

/// How a stage's stdio is handled
pub enum OutputMode<'a> {
    /// Stdin written once up front, output captured and capped
    Buffered,
    /// Stdin and output relayed live through the channel, no output cap
    Streaming(&'a mut StreamChannel),
}

impl OutputMode<'_> {
    pub fn reborrow(&mut self) -> OutputMode<'_> {
        match self {
            OutputMode::Buffered => OutputMode::Buffered,
            OutputMode::Streaming(channel) => OutputMode::Streaming(&mut **channel),
        }
    }

    pub(crate) async fn emit(&self, event: StreamEvent) {
        if let OutputMode::Streaming(channel) = self {
            channel.emit(event).await;
        }
    }
}
