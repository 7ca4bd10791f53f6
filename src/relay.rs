#![forbid(unsafe_code)]

//! Streams extractor stdout into a response sink.
//!
//! One chunk is in flight at a time: the relay does not read from the child
//! until the previous chunk was accepted by the sink, so memory stays bounded
//! by the chunk size plus the sink's small channel no matter how long the
//! video is. A dropped client or an elapsed deadline terminates the child
//! right away.

use bytes::Bytes;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use crate::{error::FetchError, resolver::StreamHandle, sink::ResponseSink};

pub const CHUNK_SIZE: usize = 64 * 1024;

/// Lifecycle of one in-flight download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Spawned,
    Streaming { bytes: u64 },
    Completed { bytes: u64 },
    Failed { bytes: u64 },
    TimedOut { bytes: u64 },
    Cancelled { bytes: u64 },
}

impl RelayState {
    pub fn bytes(self) -> u64 {
        match self {
            Self::Spawned => 0,
            Self::Streaming { bytes }
            | Self::Completed { bytes }
            | Self::Failed { bytes }
            | Self::TimedOut { bytes }
            | Self::Cancelled { bytes } => bytes,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Spawned | Self::Streaming { .. })
    }

    fn on_chunk(self, len: usize) -> Self {
        match self {
            Self::Spawned => Self::Streaming { bytes: len as u64 },
            Self::Streaming { bytes } => Self::Streaming {
                bytes: bytes + len as u64,
            },
            terminal => terminal,
        }
    }

    fn complete(self) -> Self {
        self.settle(|bytes| Self::Completed { bytes })
    }

    fn fail(self) -> Self {
        self.settle(|bytes| Self::Failed { bytes })
    }

    fn time_out(self) -> Self {
        self.settle(|bytes| Self::TimedOut { bytes })
    }

    fn cancel(self) -> Self {
        self.settle(|bytes| Self::Cancelled { bytes })
    }

    fn settle(self, to: impl FnOnce(u64) -> Self) -> Self {
        if self.is_terminal() {
            self
        } else {
            to(self.bytes())
        }
    }
}

enum Step {
    Chunk(usize),
    Eof,
    ReadError(std::io::Error),
    Disconnected,
    Deadline,
}

/// Forwards the child's output to `sink` until EOF, disconnect or `deadline`.
///
/// Returns the number of bytes delivered on success. On failure the sink is
/// left untouched so the caller can decide between an error response
/// (nothing sent yet) and silently cutting the stream.
pub async fn relay(
    mut handle: StreamHandle,
    sink: &mut ResponseSink,
    deadline: Instant,
) -> Result<u64, FetchError> {
    let mut state = RelayState::Spawned;
    let mut buf = vec![0u8; CHUNK_SIZE];

    loop {
        let step = tokio::select! {
            biased;
            _ = sink.closed() => Step::Disconnected,
            _ = sleep_until(deadline) => Step::Deadline,
            read = handle.read_chunk(&mut buf) => match read {
                Ok(0) => Step::Eof,
                Ok(n) => Step::Chunk(n),
                Err(err) => Step::ReadError(err),
            },
        };

        match step {
            Step::Chunk(n) => {
                let chunk = Bytes::copy_from_slice(&buf[..n]);
                let sent = tokio::select! {
                    biased;
                    sent = sink.write(chunk) => Some(sent.is_ok()),
                    _ = sleep_until(deadline) => None,
                };
                match sent {
                    Some(true) => state = state.on_chunk(n),
                    Some(false) => {
                        state = state.cancel();
                        handle.terminate().await;
                        debug!(bytes = state.bytes(), "client went away mid-stream");
                        return Err(FetchError::ClientDisconnected);
                    }
                    None => {
                        state = state.time_out();
                        handle.terminate().await;
                        warn!(bytes = state.bytes(), "download deadline elapsed");
                        return Err(FetchError::Timeout);
                    }
                }
            }
            Step::Disconnected => {
                state = state.cancel();
                handle.terminate().await;
                debug!(bytes = state.bytes(), "client went away");
                return Err(FetchError::ClientDisconnected);
            }
            Step::Deadline => {
                state = state.time_out();
                handle.terminate().await;
                warn!(bytes = state.bytes(), "download deadline elapsed");
                return Err(FetchError::Timeout);
            }
            Step::ReadError(err) => {
                state = state.fail();
                handle.terminate().await;
                warn!(bytes = state.bytes(), %err, "reading extractor output failed");
                return Err(if state.bytes() > 0 {
                    FetchError::Truncated(err.to_string())
                } else {
                    FetchError::TransientFailure(err.to_string())
                });
            }
            Step::Eof => break,
        }
    }

    // Stdout is closed; the exit status decides how the stream ends.
    let exit = tokio::select! {
        exit = handle.finish() => exit,
        _ = sleep_until(deadline) => Err(FetchError::Timeout),
    };
    match exit {
        Ok(()) if state.bytes() > 0 => {
            state = state.complete();
            info!(bytes = state.bytes(), "download relayed");
            Ok(state.bytes())
        }
        Ok(()) => {
            warn!("extractor exited cleanly without output");
            Err(FetchError::GenericFailure(
                "extractor produced no output".into(),
            ))
        }
        Err(err) if state.bytes() > 0 => {
            state = state.fail();
            warn!(bytes = state.bytes(), %err, "extractor failed after streaming began");
            Err(FetchError::Truncated(err.to_string()))
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        sink::{ResponseHead, StreamHead, response_channel},
        test_support::{media_stub, resolver_with_stub, wait_until_gone, write_stub},
        video::{FormatSpec, validate},
    };
    use std::time::Duration;
    use tempfile::tempdir;

    fn head() -> StreamHead {
        StreamHead {
            content_type: "video/mp4",
            filename: "alpha.mp4".into(),
        }
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    #[test]
    fn state_machine_settles_once() {
        let state = RelayState::Spawned.on_chunk(10).on_chunk(5);
        assert_eq!(state, RelayState::Streaming { bytes: 15 });
        let done = state.complete();
        assert_eq!(done, RelayState::Completed { bytes: 15 });
        assert_eq!(done.cancel(), done);
        assert_eq!(done.on_chunk(3), done);
        assert_eq!(RelayState::Spawned.time_out(), RelayState::TimedOut { bytes: 0 });
    }

    #[tokio::test]
    async fn relays_all_bytes_in_chunks() {
        let dir = tempdir().unwrap();
        let resolver = resolver_with_stub(media_stub(dir.path(), "Alpha", 200_000));
        let handle = resolver
            .open_stream(&validate("alphaAAAAAA").unwrap(), FormatSpec::default())
            .unwrap();
        let (mut sink, mut receiver) = response_channel(2);
        sink.prepare_stream(head());

        let reader = tokio::spawn(async move {
            let mut total = 0usize;
            while let Some(chunk) = receiver.body.recv().await {
                assert!(chunk.len() <= CHUNK_SIZE);
                total += chunk.len();
            }
            let head = receiver.head.await.unwrap();
            (total, head)
        });

        let sent = relay(handle, &mut sink, far_deadline()).await.unwrap();
        sink.finish();
        let (total, head) = reader.await.unwrap();
        assert_eq!(sent, 200_000);
        assert_eq!(total, 200_000);
        assert!(matches!(head, ResponseHead::Stream(h) if h.content_type == "video/mp4"));
    }

    #[tokio::test]
    async fn early_failure_is_classified_and_nothing_is_sent() {
        let dir = tempdir().unwrap();
        let stub = write_stub(
            dir.path(),
            "echo 'ERROR: [youtube] alpha: Video unavailable' >&2\nexit 1",
        );
        let handle = resolver_with_stub(stub)
            .open_stream(&validate("alphaAAAAAA").unwrap(), FormatSpec::default())
            .unwrap();
        let (mut sink, _receiver) = response_channel(2);
        let err = relay(handle, &mut sink, far_deadline()).await.unwrap_err();
        assert_eq!(err, FetchError::VideoUnavailable);
        assert!(!sink.has_started());
    }

    #[tokio::test]
    async fn failure_after_first_chunk_is_a_truncation() {
        let dir = tempdir().unwrap();
        let stub = write_stub(
            dir.path(),
            "printf 'partial-bytes'\necho 'ERROR: HTTP Error 403: Forbidden' >&2\nexit 1",
        );
        let handle = resolver_with_stub(stub)
            .open_stream(&validate("alphaAAAAAA").unwrap(), FormatSpec::default())
            .unwrap();
        let (mut sink, mut receiver) = response_channel(4);
        sink.prepare_stream(head());
        let err = relay(handle, &mut sink, far_deadline()).await.unwrap_err();
        assert!(matches!(err, FetchError::Truncated(_)));
        assert!(sink.has_started());
        assert!(!sink.fail(err));
        assert!(matches!(
            receiver.head.await.unwrap(),
            ResponseHead::Stream(_)
        ));
        assert_eq!(
            receiver.body.recv().await.unwrap(),
            Bytes::from_static(b"partial-bytes")
        );
    }

    #[tokio::test]
    async fn disconnect_terminates_the_whole_process_group() {
        let dir = tempdir().unwrap();
        let helper_pid = dir.path().join("helper.pid");
        // Forks a long-lived helper the way yt-dlp forks ffmpeg, then emits
        // forever.
        let stub = write_stub(
            dir.path(),
            &format!(
                "sleep 30 >/dev/null 2>&1 &\necho $! > {}\nwhile true; do printf 'chunk'; sleep 0.01; done",
                helper_pid.display()
            ),
        );
        let handle = resolver_with_stub(stub)
            .open_stream(&validate("alphaAAAAAA").unwrap(), FormatSpec::default())
            .unwrap();
        let pid = handle.pid().unwrap();
        let (mut sink, mut receiver) = response_channel(1);
        sink.prepare_stream(head());

        let client = tokio::spawn(async move {
            // Read a few chunks, then hang up.
            for _ in 0..3 {
                receiver.body.recv().await;
            }
            drop(receiver);
        });

        let started = std::time::Instant::now();
        let err = relay(handle, &mut sink, far_deadline()).await.unwrap_err();
        client.await.unwrap();
        assert_eq!(err, FetchError::ClientDisconnected);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(sink.is_closed());

        assert!(wait_until_gone(pid).await, "extractor {pid} survived the disconnect");
        let helper: u32 = std::fs::read_to_string(&helper_pid)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(wait_until_gone(helper).await, "helper {helper} outlived the extractor");
    }

    #[tokio::test]
    async fn deadline_after_first_chunk_cuts_the_stream() {
        let dir = tempdir().unwrap();
        let stub = write_stub(dir.path(), "printf 'first'\nexec sleep 30");
        let handle = resolver_with_stub(stub)
            .open_stream(&validate("alphaAAAAAA").unwrap(), FormatSpec::default())
            .unwrap();
        let pid = handle.pid().unwrap();
        let (mut sink, mut receiver) = response_channel(4);
        sink.prepare_stream(head());

        let deadline = Instant::now() + Duration::from_millis(500);
        let err = relay(handle, &mut sink, deadline).await.unwrap_err();
        assert_eq!(err, FetchError::Timeout);
        assert!(sink.has_started());
        // The status line already went out as a stream; no timeout response.
        assert!(!sink.fail(err));
        assert!(matches!(
            receiver.head.await.unwrap(),
            ResponseHead::Stream(_)
        ));
        assert_eq!(
            receiver.body.recv().await.unwrap(),
            Bytes::from_static(b"first")
        );
        assert!(receiver.body.recv().await.is_none());
        assert!(wait_until_gone(pid).await, "extractor {pid} outlived the deadline");
    }

    #[tokio::test]
    async fn deadline_before_output_reports_timeout() {
        let dir = tempdir().unwrap();
        let stub = write_stub(dir.path(), "exec sleep 30");
        let handle = resolver_with_stub(stub)
            .open_stream(&validate("alphaAAAAAA").unwrap(), FormatSpec::default())
            .unwrap();
        let (mut sink, _receiver) = response_channel(1);
        let deadline = Instant::now() + Duration::from_millis(200);
        let err = relay(handle, &mut sink, deadline).await.unwrap_err();
        assert_eq!(err, FetchError::Timeout);
        assert!(!sink.has_started());
    }
}
