//! Segmented acquisition: ordered segment lists fetched with bounded
//! concurrency, reassembled in order through a reorder buffer, and written
//! sequentially to the staging file.

use std::collections::BTreeMap;
use std::path::Path;

use bytes::Bytes;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use url::Url;

use crate::error::DownloadError;
use crate::retry::{RetryAction, retry_with_backoff};
use crate::transport::is_transient_reqwest_error;

use super::{Downloader, ProgressReporter};

/// One entry of a segment manifest.
#[derive(Debug, Clone)]
pub struct SegmentRef {
    pub url: Url,
    pub size: Option<u64>,
}

/// Holds completed out-of-order segments until their turn to be written.
///
/// Bounded implicitly by the dispatch loop: at most `concurrency` segments
/// are in flight, so at most that many can be parked here.
#[derive(Debug, Default)]
pub(super) struct ReorderBuffer {
    next_write: usize,
    parked: BTreeMap<usize, Bytes>,
}

impl ReorderBuffer {
    /// Accept a completed segment and return every chunk that is now
    /// contiguous, in writing order.
    pub(super) fn accept(&mut self, index: usize, data: Bytes) -> Vec<Bytes> {
        self.parked.insert(index, data);
        let mut ready = Vec::new();
        while let Some(data) = self.parked.remove(&self.next_write) {
            ready.push(data);
            self.next_write += 1;
        }
        ready
    }

    pub(super) fn parked_len(&self) -> usize {
        self.parked.len()
    }

    pub(super) fn is_drained(&self, total: usize) -> bool {
        self.next_write == total && self.parked.is_empty()
    }
}

impl Downloader {
    /// Fetch an ordered segment list into `dest`.
    ///
    /// Segments are requested with bounded concurrency and retried with
    /// backoff on transient failures; any non-transient segment failure
    /// aborts the item. Totals are the sum of known segment sizes, or 0
    /// (indeterminate) when any size is unknown. The staging file is
    /// truncated first; segmented transfers restart rather than resume.
    pub async fn fetch_segmented(
        &self,
        dest: &Path,
        segments: &[SegmentRef],
        reporter: &mut ProgressReporter,
        label: &str,
        token: &CancellationToken,
    ) -> Result<u64, DownloadError> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(dest)
            .await?;

        let total: u64 = segments
            .iter()
            .map(|s| s.size)
            .sum::<Option<u64>>()
            .unwrap_or(0);
        reporter.register(label, total, 0);

        let concurrency = self.tuning.segment_concurrency.max(1);
        let mut in_flight = FuturesUnordered::new();
        let mut next_dispatch = 0usize;
        let mut reorder = ReorderBuffer::default();
        let mut written: u64 = 0;

        while next_dispatch < segments.len() && in_flight.len() < concurrency {
            in_flight.push(self.fetch_segment(next_dispatch, &segments[next_dispatch], token));
            next_dispatch += 1;
        }

        while !in_flight.is_empty() {
            let completed = tokio::select! {
                _ = token.cancelled() => {
                    reporter.finish();
                    return Err(DownloadError::Cancelled);
                }
                completed = in_flight.next() => completed,
            };

            let (index, result) = match completed {
                Some(pair) => pair,
                None => break,
            };
            let data = match result {
                Ok(data) => data,
                Err(err) => {
                    reporter.finish();
                    return Err(err);
                }
            };

            trace!(index, bytes = data.len(), "segment fetched");
            for chunk in reorder.accept(index, data) {
                written += chunk.len() as u64;
                file.write_all(&chunk).await?;
                reporter.advance(chunk.len() as u64);
            }

            // Keep the pipeline full; parked segments count against the
            // bound so the buffer cannot grow past the concurrency limit.
            while next_dispatch < segments.len()
                && in_flight.len() + reorder.parked_len() < concurrency
            {
                in_flight.push(self.fetch_segment(next_dispatch, &segments[next_dispatch], token));
                next_dispatch += 1;
            }
        }

        if !reorder.is_drained(segments.len()) {
            reporter.finish();
            return Err(DownloadError::internal(
                "segment pipeline ended with undelivered segments",
            ));
        }

        file.sync_all().await?;
        reporter.finish();
        debug!(dest = %dest.display(), segments = segments.len(), written, "segmented fetch complete");
        Ok(written)
    }

    /// Fetch one segment fully into memory, with per-segment timeout and
    /// retry-with-backoff on transient failures.
    async fn fetch_segment(
        &self,
        index: usize,
        segment: &SegmentRef,
        token: &CancellationToken,
    ) -> (usize, Result<Bytes, DownloadError>) {
        let result = retry_with_backoff(&self.tuning.retry, token, |_attempt| async {
            let attempt = async {
                let response = match self.transport.get(&segment.url, 0, token).await {
                    Ok(response) => response,
                    Err(err) => {
                        return if err.is_retryable() {
                            RetryAction::Retry(err)
                        } else {
                            RetryAction::Fail(err)
                        };
                    }
                };
                match response.bytes().await {
                    Ok(bytes) => RetryAction::Success(bytes),
                    Err(err) if is_transient_reqwest_error(&err) => {
                        RetryAction::Retry(err.into())
                    }
                    Err(err) => RetryAction::Fail(err.into()),
                }
            };

            match tokio::time::timeout(self.tuning.segment_timeout, attempt).await {
                Ok(action) => action,
                Err(_) => RetryAction::Retry(DownloadError::Timeout {
                    reason: format!("segment {} timed out", segment.url),
                }),
            }
        })
        .await;

        (index, result)
    }
}
