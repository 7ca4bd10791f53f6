#![forbid(unsafe_code)]

//! Output side of a request.
//!
//! A `ResponseSink` is the worker's write handle; the matching
//! `ResponseReceiver` stays with the HTTP handler (or a parked download
//! ticket). The head, either a stream descriptor, a metadata payload or an
//! error, travels over a oneshot, so it can be decided at most once. Media
//! bytes travel over a bounded channel, which is where client backpressure
//! reaches the relay. Dropping the receiver is how a disconnect is observed.
//!
//! Terminal operations take `self`, so a sink completes exactly once.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::{error::FetchError, resolver::VideoMetadata};

/// Chunks buffered between the relay and the HTTP body.
pub const DEFAULT_SINK_BUFFER: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHead {
    pub content_type: &'static str,
    pub filename: String,
}

#[derive(Debug)]
pub enum ResponseHead {
    Stream(StreamHead),
    Metadata(Arc<VideoMetadata>),
    Failed(FetchError),
}

/// The receiving end went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkClosed;

#[derive(Debug)]
pub struct ResponseSink {
    head: Option<oneshot::Sender<ResponseHead>>,
    body: mpsc::Sender<Bytes>,
    pending_stream: Option<StreamHead>,
    bytes_sent: u64,
}

#[derive(Debug)]
pub struct ResponseReceiver {
    pub head: oneshot::Receiver<ResponseHead>,
    pub body: mpsc::Receiver<Bytes>,
}

pub fn response_channel(buffer: usize) -> (ResponseSink, ResponseReceiver) {
    let (head_tx, head_rx) = oneshot::channel();
    let (body_tx, body_rx) = mpsc::channel(buffer.max(1));
    (
        ResponseSink {
            head: Some(head_tx),
            body: body_tx,
            pending_stream: None,
            bytes_sent: 0,
        },
        ResponseReceiver {
            head: head_rx,
            body: body_rx,
        },
    )
}

impl ResponseSink {
    /// Stages the headers that go out together with the first chunk.
    pub fn prepare_stream(&mut self, head: StreamHead) {
        self.pending_stream = Some(head);
    }

    /// True once any media byte was handed to the client. From then on the
    /// status line is committed and failures can only cut the stream.
    pub fn has_started(&self) -> bool {
        self.head.is_none() && self.bytes_sent > 0
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn is_closed(&self) -> bool {
        self.body.is_closed()
    }

    /// Resolves when the client side has been dropped.
    pub async fn closed(&self) {
        self.body.closed().await
    }

    /// Forwards one chunk, committing the staged stream head first. Waits
    /// while the client is not reading.
    pub async fn write(&mut self, chunk: Bytes) -> Result<(), SinkClosed> {
        if let Some(head) = self.head.take() {
            let stream = self.pending_stream.take().unwrap_or_else(|| StreamHead {
                content_type: "application/octet-stream",
                filename: "download.bin".to_string(),
            });
            head.send(ResponseHead::Stream(stream))
                .map_err(|_| SinkClosed)?;
        }
        let len = chunk.len() as u64;
        self.body.send(chunk).await.map_err(|_| SinkClosed)?;
        self.bytes_sent += len;
        Ok(())
    }

    /// Ends a successful stream. Dropping the body sender closes it.
    pub fn finish(self) {}

    /// Hands a metadata result to whoever is waiting on the head.
    pub fn deliver_metadata(mut self, metadata: Arc<VideoMetadata>) -> Result<(), SinkClosed> {
        match self.head.take() {
            Some(head) => head
                .send(ResponseHead::Metadata(metadata))
                .map_err(|_| SinkClosed),
            None => Err(SinkClosed),
        }
    }

    /// Reports a failure. Before the head went out this becomes an error
    /// response; afterwards the stream is just cut. Returns whether the error
    /// reached the client.
    pub fn fail(mut self, error: FetchError) -> bool {
        match self.head.take() {
            Some(head) => head.send(ResponseHead::Failed(error)).is_ok(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_write_commits_the_prepared_head() {
        let (mut sink, mut receiver) = response_channel(2);
        sink.prepare_stream(StreamHead {
            content_type: "audio/mpeg",
            filename: "alpha.mp3".into(),
        });
        assert!(!sink.has_started());
        sink.write(Bytes::from_static(b"abc")).await.unwrap();
        assert!(sink.has_started());
        assert_eq!(sink.bytes_sent(), 3);

        match receiver.head.try_recv().unwrap() {
            ResponseHead::Stream(head) => assert_eq!(head.filename, "alpha.mp3"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(receiver.body.recv().await.unwrap(), Bytes::from_static(b"abc"));

        // A late failure never turns into an error head.
        assert!(!sink.fail(FetchError::Timeout));
        assert!(receiver.body.recv().await.is_none());
    }

    #[tokio::test]
    async fn failure_before_first_chunk_reaches_client() {
        let (sink, receiver) = response_channel(2);
        assert!(sink.fail(FetchError::PrivateVideo));
        match receiver.head.await.unwrap() {
            ResponseHead::Failed(err) => assert_eq!(err, FetchError::PrivateVideo),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropping_receiver_closes_sink() {
        let (mut sink, receiver) = response_channel(2);
        assert!(!sink.is_closed());
        drop(receiver);
        sink.closed().await;
        assert!(sink.is_closed());
        assert_eq!(sink.write(Bytes::from_static(b"x")).await, Err(SinkClosed));
    }

    #[tokio::test]
    async fn metadata_delivery_is_single_shot() {
        let (sink, receiver) = response_channel(1);
        sink.deliver_metadata(Arc::new(VideoMetadata::default()))
            .unwrap();
        assert!(matches!(
            receiver.head.await.unwrap(),
            ResponseHead::Metadata(_)
        ));
    }
}
