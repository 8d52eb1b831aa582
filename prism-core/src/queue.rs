//! Write work queue.
//!
//! A bounded FIFO of outbound messages posted by the dispatcher and
//! drained by the single writer task — the only place that touches the
//! socket's write half. FIFO order of posts is the wire order of
//! replies. The queue drains on shutdown; there is no cancellation.

use futures::{Sink, SinkExt};
use tokio::sync::mpsc;

use crate::error::PrismError;
use crate::wire::Message;

/// Queue capacity; posting blocks once this many replies are pending,
/// which is the session's only back-pressure beyond TCP's own.
pub const QUEUE_DEPTH: usize = 128;

/// Producer half, held by the reader task.
pub struct WorkQueue {
    tx: mpsc::Sender<Message>,
}

impl WorkQueue {
    pub fn channel() -> (WorkQueue, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        (WorkQueue { tx }, rx)
    }

    /// Enqueue one reply for the writer.
    pub async fn post(&self, message: Message) -> Result<(), PrismError> {
        self.tx
            .send(message)
            .await
            .map_err(|_| PrismError::QueueClosed)
    }
}

/// Writer loop: drain the queue into the framed sink until every
/// producer is gone, then flush and close.
pub async fn drain<S>(mut rx: mpsc::Receiver<Message>, mut sink: S) -> Result<(), PrismError>
where
    S: Sink<Message, Error = PrismError> + Unpin,
{
    while let Some(message) = rx.recv().await {
        sink.send(message).await?;
    }
    sink.close().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::Opcode;
    use crate::wire::WireCodec;
    use bytes::Bytes;
    use futures::StreamExt;
    use tokio_util::codec::{FramedRead, FramedWrite};

    #[tokio::test]
    async fn replies_leave_in_post_order() {
        let (client, server) = tokio::io::duplex(1 << 16);
        let sink = FramedWrite::new(server, WireCodec);
        let mut reader = FramedRead::new(client, WireCodec);

        let (queue, rx) = WorkQueue::channel();
        let writer = tokio::spawn(drain(rx, sink));

        for i in 0u8..5 {
            queue
                .post(Message::new(Opcode::Property, Bytes::from(vec![i])))
                .await
                .unwrap();
        }
        drop(queue);

        for i in 0u8..5 {
            let msg = reader.next().await.unwrap().unwrap();
            assert_eq!(msg.payload(), &[i]);
        }
        writer.await.unwrap().unwrap();
        assert!(reader.next().await.is_none());
    }

    #[tokio::test]
    async fn queue_drains_pending_replies_on_shutdown() {
        let (client, server) = tokio::io::duplex(1 << 16);
        let sink = FramedWrite::new(server, WireCodec);

        let (queue, rx) = WorkQueue::channel();
        queue
            .post(Message::new(Opcode::FrameIsReady, Bytes::from_static(&[7])))
            .await
            .unwrap();
        drop(queue); // shutdown before the writer even starts

        tokio::spawn(drain(rx, sink)).await.unwrap().unwrap();

        let mut reader = FramedRead::new(client, WireCodec);
        let msg = reader.next().await.unwrap().unwrap();
        assert_eq!(msg.opcode().unwrap(), Opcode::FrameIsReady);
    }
}
