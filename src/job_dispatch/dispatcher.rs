use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, error, warn};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::types::DispatchStats;
use crate::error_handling::types::ForensicError;

struct DispatchState {
    max_active: usize,
    max_queued: usize,
    active: usize,
    waiters: VecDeque<oneshot::Sender<()>>,
}

impl DispatchState {
    /// Gives the slot to the oldest live waiter; only frees it when nobody is waiting.
    fn release(&mut self) {
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.send(()).is_ok() {
                return;
            }
        }
        self.active = self.active.saturating_sub(1);
    }

    fn live_waiters(&self) -> usize {
        self.waiters.iter().filter(|w| !w.is_closed()).count()
    }
}

fn lock(state: &Mutex<DispatchState>) -> MutexGuard<'_, DispatchState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Counting semaphore with a bounded FIFO wait queue for heavy jobs.
///
/// At most `max_active` jobs hold a slot; up to `max_queued` further callers
/// wait in arrival order; anyone beyond that gets [`ForensicError::QueueFull`]
/// immediately.
///
/// ```no_run
/// # use forensic_engine::error_handling::types::ForensicError;
/// # use forensic_engine::job_dispatch::AnalysisDispatcher;
/// # use std::time::Duration;
/// # async fn demo() -> Result<(), ForensicError> {
/// let dispatcher = AnalysisDispatcher::new(2, 8);
/// let answer = dispatcher
///     .run("demo", Duration::from_secs(5), async { Ok::<u32, ForensicError>(42) })
///     .await?;
/// assert_eq!(answer, 42);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct AnalysisDispatcher {
    state: Arc<Mutex<DispatchState>>,
}

/// A held slot. Dropping it hands the slot to the next waiter.
pub struct Permit {
    state: Arc<Mutex<DispatchState>>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        lock(&self.state).release();
    }
}

/// Aborts the worker when the caller stops waiting for it.
struct WorkerGuard<T>(JoinHandle<T>);

impl<T> Drop for WorkerGuard<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Outcome of [`AnalysisDispatcher::reserve`].
pub enum Reservation {
    Granted(Permit),
    Queued(QueuedSlot),
}

/// A place in the wait queue. Dropping it gives the place up.
pub struct QueuedSlot {
    state: Arc<Mutex<DispatchState>>,
    receiver: Option<oneshot::Receiver<()>>,
}

impl QueuedSlot {
    /// Waits until a running job hands its slot over.
    pub async fn granted(mut self) -> Result<Permit, ForensicError> {
        if let Some(receiver) = self.receiver.as_mut() {
            if receiver.await.is_err() {
                self.receiver = None;
                return Err(ForensicError::process(
                    None,
                    "dispatcher dropped a queued job",
                ));
            }
        }
        self.receiver = None;
        Ok(Permit {
            state: Arc::clone(&self.state),
        })
    }
}

impl Drop for QueuedSlot {
    fn drop(&mut self) {
        if let Some(mut receiver) = self.receiver.take() {
            receiver.close();
            // The slot may have been handed over between the last poll and now.
            if receiver.try_recv().is_ok() {
                lock(&self.state).release();
            }
        }
    }
}

impl AnalysisDispatcher {
    pub fn new(max_active: usize, max_queued: usize) -> Self {
        debug!(
            "AnalysisDispatcher created: max_active={}, max_queued={}",
            max_active, max_queued
        );
        Self {
            state: Arc::new(Mutex::new(DispatchState {
                max_active: max_active.max(1),
                max_queued,
                active: 0,
                waiters: VecDeque::new(),
            })),
        }
    }

    /// Takes a slot if one is free, otherwise joins the queue, otherwise fails.
    pub fn reserve(&self) -> Result<Reservation, ForensicError> {
        let mut state = lock(&self.state);
        if state.active < state.max_active {
            state.active += 1;
            return Ok(Reservation::Granted(Permit {
                state: Arc::clone(&self.state),
            }));
        }

        state.waiters.retain(|w| !w.is_closed());
        if state.waiters.len() >= state.max_queued {
            warn!(
                "Rejecting job: {} running, {} queued",
                state.active,
                state.waiters.len()
            );
            return Err(ForensicError::QueueFull {
                max_queued: state.max_queued,
            });
        }

        let (sender, receiver) = oneshot::channel();
        state.waiters.push_back(sender);
        debug!("Job queued at position {}", state.waiters.len());
        Ok(Reservation::Queued(QueuedSlot {
            state: Arc::clone(&self.state),
            receiver: Some(receiver),
        }))
    }

    pub async fn acquire(&self) -> Result<Permit, ForensicError> {
        match self.reserve()? {
            Reservation::Granted(permit) => Ok(permit),
            Reservation::Queued(slot) => slot.granted().await,
        }
    }

    /// Runs `job` on its own task once a slot is available.
    ///
    /// If the job exceeds `timeout` its task is aborted, which drops (and so
    /// kills) any subprocess it owns, and the caller gets
    /// [`ForensicError::Timeout`]. A panicking job fails only this call.
    /// Dropping the returned future aborts the job as well; the slot stays
    /// taken until the job's task has actually been dropped.
    pub async fn run<F, T>(&self, label: &str, timeout: Duration, job: F) -> Result<T, ForensicError>
    where
        F: Future<Output = Result<T, ForensicError>> + Send + 'static,
        T: Send + 'static,
    {
        let permit = self.acquire().await?;
        debug!("[{}] job started", label);

        let mut worker = WorkerGuard(tokio::spawn(async move {
            let output = job.await;
            drop(permit);
            output
        }));
        let result = match tokio::time::timeout(timeout, &mut worker.0).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => {
                error!("[{}] worker failed: {}", label, join_error);
                Err(ForensicError::process(
                    None,
                    &format!("worker for {} failed: {}", label, join_error),
                ))
            }
            Err(_) => {
                warn!(
                    "[{}] job exceeded {:.1}s, tearing it down",
                    label,
                    timeout.as_secs_f64()
                );
                worker.0.abort();
                // Wait for the aborted task to be dropped so its subprocess is gone too.
                let _ = (&mut worker.0).await;
                Err(ForensicError::Timeout { after: timeout })
            }
        };

        debug!("[{}] job finished", label);
        result
    }

    pub fn stats(&self) -> DispatchStats {
        let state = lock(&self.state);
        DispatchStats {
            active: state.active,
            queued: state.live_waiters(),
            max_active: state.max_active,
            max_queued: state.max_queued,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::timeout;

    fn granted(reservation: Reservation) -> Permit {
        match reservation {
            Reservation::Granted(permit) => permit,
            Reservation::Queued(_) => panic!("expected a free slot"),
        }
    }

    fn queued(reservation: Reservation) -> QueuedSlot {
        match reservation {
            Reservation::Queued(slot) => slot,
            Reservation::Granted(_) => panic!("expected to be queued"),
        }
    }

    #[tokio::test]
    async fn saturation_queues_then_rejects_then_promotes() {
        let dispatcher = AnalysisDispatcher::new(2, 1);

        let first = granted(dispatcher.reserve().unwrap());
        let _second = granted(dispatcher.reserve().unwrap());
        let third = queued(dispatcher.reserve().unwrap());
        let fourth = dispatcher.reserve();
        assert!(matches!(
            fourth,
            Err(ForensicError::QueueFull { max_queued: 1 })
        ));

        let stats = dispatcher.stats();
        assert_eq!((stats.active, stats.queued), (2, 1));

        drop(first);
        // Handed over directly: the active count never dropped to 1.
        assert_eq!(dispatcher.stats().active, 2);
        let promoted = timeout(Duration::from_millis(200), third.granted())
            .await
            .expect("queued job was not promoted")
            .unwrap();

        let stats = dispatcher.stats();
        assert_eq!((stats.active, stats.queued), (2, 0));
        drop(promoted);
        assert_eq!(dispatcher.stats().active, 1);
    }

    #[tokio::test]
    async fn abandoned_waiter_gives_up_its_place() {
        let dispatcher = AnalysisDispatcher::new(1, 1);
        let _running = granted(dispatcher.reserve().unwrap());
        let waiter = queued(dispatcher.reserve().unwrap());
        drop(waiter);

        assert_eq!(dispatcher.stats().queued, 0);
        assert!(matches!(
            dispatcher.reserve().unwrap(),
            Reservation::Queued(_)
        ));
    }

    #[tokio::test]
    async fn slot_handed_to_abandoned_waiter_is_not_leaked() {
        let dispatcher = AnalysisDispatcher::new(1, 1);
        let running = granted(dispatcher.reserve().unwrap());
        let waiter = queued(dispatcher.reserve().unwrap());

        drop(running);
        assert_eq!(dispatcher.stats().active, 1);
        drop(waiter);
        assert_eq!(dispatcher.stats().active, 0);
        let _again = granted(dispatcher.reserve().unwrap());
    }

    #[tokio::test]
    async fn run_returns_job_output() {
        let dispatcher = AnalysisDispatcher::new(1, 0);
        let value = dispatcher
            .run("ok", Duration::from_secs(1), async { Ok::<u32, ForensicError>(7) })
            .await;
        tokio_test::assert_ok!(&value);
        assert_eq!(value.unwrap(), 7);
        assert_eq!(dispatcher.stats().active, 0);
    }

    #[tokio::test]
    async fn stuck_job_times_out_and_frees_its_slot() {
        let dispatcher = AnalysisDispatcher::new(1, 0);
        let result = dispatcher
            .run("stuck", Duration::from_millis(50), async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<(), ForensicError>(())
            })
            .await;

        let err = result.unwrap_err();
        assert!(matches!(err, ForensicError::Timeout { .. }));
        assert!(err.is_retryable());
        assert_eq!(dispatcher.stats().active, 0);
    }

    async fn exploding() -> Result<(), ForensicError> {
        panic!("dissection blew up")
    }

    #[tokio::test]
    async fn panicking_job_fails_alone() {
        let dispatcher = AnalysisDispatcher::new(1, 0);
        let result = dispatcher
            .run("panics", Duration::from_secs(1), exploding())
            .await;
        assert!(matches!(result, Err(ForensicError::Process { .. })));

        let after = dispatcher
            .run("after", Duration::from_secs(1), async {
                Ok::<&str, ForensicError>("still alive")
            })
            .await
            .unwrap();
        assert_eq!(after, "still alive");
    }

    #[tokio::test]
    async fn queued_run_starts_when_slot_frees() {
        let dispatcher = AnalysisDispatcher::new(1, 1);
        let blocker = dispatcher.acquire().await.unwrap();

        let d2 = dispatcher.clone();
        let queued_job = tokio::spawn(async move {
            d2.run("queued", Duration::from_secs(1), async {
                Ok::<i32, ForensicError>(1)
            })
                .await
        });
        // Let the spawned caller reach the queue.
        while dispatcher.stats().queued == 0 {
            tokio::task::yield_now().await;
        }
        drop(blocker);

        let output = timeout(Duration::from_secs(1), queued_job)
            .await
            .expect("queued job never ran")
            .unwrap()
            .unwrap();
        assert_eq!(output, 1);
    }

    struct Running(Arc<AtomicUsize>);

    impl Drop for Running {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn counted_job(
        running: &Arc<AtomicUsize>,
        peak: &Arc<AtomicUsize>,
        duration: Duration,
    ) -> impl Future<Output = Result<(), ForensicError>> + Send + 'static {
        let running = Arc::clone(running);
        let peak = Arc::clone(peak);
        async move {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            let _running = Running(running);
            tokio::time::sleep(duration).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn abandoned_run_keeps_its_slot_until_the_job_is_gone() {
        let dispatcher = AnalysisDispatcher::new(1, 1);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let abandoned = timeout(
            Duration::from_millis(50),
            dispatcher.run(
                "abandoned",
                Duration::from_secs(5),
                counted_job(&running, &peak, Duration::from_millis(500)),
            ),
        )
        .await;
        assert!(abandoned.is_err());

        dispatcher
            .run(
                "next",
                Duration::from_secs(5),
                counted_job(&running, &peak, Duration::from_millis(10)),
            )
            .await
            .unwrap();

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(running.load(Ordering::SeqCst), 0);
        assert_eq!(dispatcher.stats().active, 0);
    }
}
