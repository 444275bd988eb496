//! Sequential chunks of concurrently polled tasks with pacing between chunks.
//!
//! Chunk boundaries are ordering barriers: every task of a chunk has settled
//! before the pacer runs and before any task of the next chunk starts.

use std::{future::Future, sync::Arc, time::Duration};

use axum::async_trait;
use futures::{stream::FuturesUnordered, StreamExt};
use leaky_bucket::RateLimiter;
use tokio_util::sync::CancellationToken;

use crate::server_config::PacingConfig;

use super::ValidationError;

/// Paces a chunked run. `pause` runs between two chunks, never before the
/// first or after the last. `admit` runs before every chunk, the first one
/// included, and is where per-item budgets are charged.
#[async_trait]
pub trait Pacer: Send + Sync {
    async fn pause(&self, _next_chunk_len: usize) {}

    async fn admit(&self, _chunk_len: usize) {}
}

pub struct NoPacing;

impl Pacer for NoPacing {}

pub struct FixedDelay(pub Duration);

#[async_trait]
impl Pacer for FixedDelay {
    async fn pause(&self, _next_chunk_len: usize) {
        tokio::time::sleep(self.0).await;
    }
}

/// Starts at most `per_second` items per second. Every chunk is charged its
/// full length before it starts, and the bucket starts with one token.
pub struct TokenBucket {
    limiter: RateLimiter,
    capacity: usize,
}

impl TokenBucket {
    pub fn new(per_second: usize) -> Self {
        let capacity = per_second.max(1);
        let limiter = RateLimiter::builder()
            .initial(1)
            .interval(Duration::from_secs_f64(1.0 / capacity as f64))
            .refill(1)
            .max(capacity)
            .build();
        Self { limiter, capacity }
    }
}

#[async_trait]
impl Pacer for TokenBucket {
    async fn admit(&self, chunk_len: usize) {
        // The bucket holds one second of budget, so big chunks pay in parts
        let mut owed = chunk_len;
        while owed > 0 {
            let part = owed.min(self.capacity);
            self.limiter.acquire(part).await;
            owed -= part;
        }
    }
}

pub fn pacer_from_config(config: &PacingConfig) -> Arc<dyn Pacer> {
    match config {
        PacingConfig::None => Arc::new(NoPacing),
        PacingConfig::Fixed { delay_ms } => Arc::new(FixedDelay(Duration::from_millis(*delay_ms))),
        PacingConfig::TokenBucket { per_second } => Arc::new(TokenBucket::new(*per_second)),
    }
}

#[derive(Debug)]
pub struct ChunkedRun<T, O> {
    /// Outcomes, chunk by chunk, in completion order within each chunk
    pub completed: Vec<O>,
    /// Items never started because the run was cancelled, in input order
    pub remaining: Vec<T>,
}

pub async fn run_chunked<T, O, F, Fut>(
    items: Vec<T>,
    chunk_size: usize,
    pacer: &dyn Pacer,
    cancel: &CancellationToken,
    worker: F,
) -> Result<ChunkedRun<T, O>, ValidationError>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = O>,
{
    if chunk_size == 0 {
        return Err(ValidationError(
            "chunk size must be a positive integer".to_string(),
        ));
    }

    let mut completed = Vec::with_capacity(items.len());
    let mut items = items.into_iter().peekable();
    let mut chunk_index = 0usize;

    while items.peek().is_some() {
        let chunk: Vec<T> = items.by_ref().take(chunk_size).collect();

        let chunk_len = chunk.len();
        let paced = async {
            if chunk_index > 0 {
                pacer.pause(chunk_len).await;
            }
            pacer.admit(chunk_len).await;
        };
        let cancelled = tokio::select! {
            biased;
            _ = cancel.cancelled() => true,
            _ = paced => false,
        };
        if cancelled {
            return Ok(ChunkedRun {
                completed,
                remaining: chunk.into_iter().chain(items).collect(),
            });
        }

        tracing::debug!("Running chunk {} with {} items", chunk_index, chunk.len());
        let mut in_flight: FuturesUnordered<Fut> = chunk.into_iter().map(&worker).collect();
        while let Some(outcome) = in_flight.next().await {
            completed.push(outcome);
        }

        chunk_index += 1;
    }

    Ok(ChunkedRun {
        completed,
        remaining: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };
    use tokio::time::Instant;

    #[derive(Default)]
    struct CountingPacer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Pacer for CountingPacer {
        async fn pause(&self, _next_chunk_len: usize) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Start(&'static str),
        End(&'static str),
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunks_are_ordering_barriers() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let pacer = CountingPacer::default();
        let cancel = CancellationToken::new();

        let run = run_chunked(
            vec!["a", "b", "c", "d", "e"],
            2,
            &pacer,
            &cancel,
            |item| {
                let events = events.clone();
                async move {
                    events.lock().unwrap().push(Event::Start(item));
                    // Later items finish first within their chunk
                    let delay = match item {
                        "a" | "c" => 30,
                        _ => 10,
                    };
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    events.lock().unwrap().push(Event::End(item));
                    item
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(run.completed, vec!["b", "a", "d", "c", "e"]);
        assert!(run.remaining.is_empty());
        assert_eq!(pacer.calls.load(Ordering::SeqCst), 2);

        let events = events.lock().unwrap().clone();
        let pos = |e: Event| events.iter().position(|x| *x == e).unwrap();
        for (earlier, later) in [(["a", "b"], ["c", "d"]), (["c", "d"], ["e", "e"])] {
            for done in earlier {
                for started in later {
                    assert!(pos(Event::End(done)) < pos(Event::Start(started)));
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_delay_only_between_chunks() {
        let starts = Arc::new(Mutex::new(Vec::new()));
        let begin = Instant::now();
        let cancel = CancellationToken::new();

        run_chunked(
            vec![1, 2, 3],
            2,
            &FixedDelay(Duration::from_millis(1000)),
            &cancel,
            |item| {
                let starts = starts.clone();
                async move {
                    starts.lock().unwrap().push((item, begin.elapsed()));
                }
            },
        )
        .await
        .unwrap();

        let starts = starts.lock().unwrap().clone();
        assert_eq!(starts[0].1, Duration::ZERO);
        assert_eq!(starts[1].1, Duration::ZERO);
        assert_eq!(starts[2].0, 3);
        assert!(starts[2].1 >= Duration::from_millis(1000));
        // No trailing delay after the last chunk
        assert!(begin.elapsed() < Duration::from_millis(1100));
    }

    #[tokio::test]
    async fn test_empty_input_runs_nothing() {
        let pacer = CountingPacer::default();
        let calls = AtomicUsize::new(0);
        let cancel = CancellationToken::new();

        let run = run_chunked(Vec::<u32>::new(), 3, &pacer, &cancel, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {}
        })
        .await
        .unwrap();

        assert!(run.completed.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(pacer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_zero_chunk_size_is_rejected() {
        let calls = AtomicUsize::new(0);
        let cancel = CancellationToken::new();

        let result = run_chunked(vec![1, 2], 0, &NoPacing, &cancel, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {}
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_chunk_larger_than_input() {
        let cancel = CancellationToken::new();
        let run = run_chunked(vec![1, 2, 3], 10, &NoPacing, &cancel, |i| async move { i * 2 })
            .await
            .unwrap();
        assert_eq!(run.completed.len(), 3);
        assert!(run.completed.contains(&6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_at_chunk_boundary() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        let run = run_chunked(
            vec!["a", "b", "c", "d", "e"],
            2,
            &FixedDelay(Duration::from_secs(1)),
            &cancel,
            |item| {
                let trigger = trigger.clone();
                async move {
                    if item == "b" {
                        trigger.cancel();
                    }
                    item
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(run.completed.len(), 2);
        assert_eq!(run.remaining, vec!["c", "d", "e"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_limits_item_rate() {
        let per_second = 2;
        let pacer = TokenBucket::new(per_second);
        let begin = Instant::now();
        let cancel = CancellationToken::new();
        let starts = Arc::new(Mutex::new(Vec::new()));

        run_chunked((0..12).collect::<Vec<_>>(), 4, &pacer, &cancel, |_| {
            let starts = starts.clone();
            async move {
                starts.lock().unwrap().push(begin.elapsed());
            }
        })
        .await
        .unwrap();

        let starts = starts.lock().unwrap().clone();
        assert_eq!(starts.len(), 12);
        // One token up front, then `per_second` more each second
        for at in &starts {
            let started_by = starts.iter().filter(|s| *s <= at).count();
            let budget = 1.0 + per_second as f64 * at.as_secs_f64();
            assert!(
                started_by as f64 <= budget + 1e-6,
                "{started_by} items started by {at:?}"
            );
        }
        assert!(begin.elapsed() >= Duration::from_millis(5_500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_charges_first_chunk() {
        let pacer = TokenBucket::new(2);
        let begin = Instant::now();
        let cancel = CancellationToken::new();

        run_chunked(vec![1, 2, 3], 3, &pacer, &cancel, |_| async {})
            .await
            .unwrap();

        // Single chunk, no pause, but still three tokens
        assert!(begin.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacer_from_config() {
        let begin = Instant::now();
        let none = pacer_from_config(&PacingConfig::None);
        none.pause(5).await;
        none.admit(5).await;
        assert_eq!(begin.elapsed(), Duration::ZERO);

        let begin = Instant::now();
        let fixed = pacer_from_config(&PacingConfig::Fixed { delay_ms: 250 });
        fixed.admit(5).await;
        assert_eq!(begin.elapsed(), Duration::ZERO);
        fixed.pause(5).await;
        assert!(begin.elapsed() >= Duration::from_millis(250));

        // Zero is raised to one item per second
        let begin = Instant::now();
        let bucket = pacer_from_config(&PacingConfig::TokenBucket { per_second: 0 });
        bucket.pause(3).await;
        assert_eq!(begin.elapsed(), Duration::ZERO);
        bucket.admit(3).await;
        assert!(begin.elapsed() >= Duration::from_secs(2));
    }
}
