use super::events::AdmissionEvent;
use futures::future::{ready, Ready};
use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tower::Service;

/// Future of the in-process sinks, which record synchronously in `call`.
type Recorded = Ready<Result<(), Infallible>>;

/// A telemetry sink that consumes admission events.
pub trait TelemetrySink:
    tower::Service<AdmissionEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
pub async fn emit_best_effort<S>(sink: S, event: AdmissionEvent)
where
    S: tower::Service<AdmissionEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

/// Hand `event` to `sink` on a detached task so the caller never waits on telemetry.
///
/// Outside a tokio runtime the event is dropped.
pub fn spawn_emit<S>(sink: S, event: AdmissionEvent)
where
    S: tower::Service<AdmissionEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(emit_best_effort(sink, event));
        }
        Err(_) => {
            tracing::trace!(target: "turnstile::telemetry", outcome = event.outcome(), "no runtime; event dropped");
        }
    }
}

/// A no-op telemetry sink that discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<AdmissionEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = Recorded;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: AdmissionEvent) -> Self::Future {
        ready(Ok(()))
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// A telemetry sink that logs events using the `tracing` crate.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<AdmissionEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = Recorded;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: AdmissionEvent) -> Self::Future {
        tracing::info!(
            target: "turnstile::telemetry",
            metric = event.metric_name(),
            policy = %event.policy(),
            event = %event,
            "admission_event"
        );
        ready(Ok(()))
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// A telemetry sink that keeps the most recent events in memory.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<VecDeque<AdmissionEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn events(&self) -> Vec<AdmissionEvent> {
        self.buffer().iter().cloned().collect()
    }

    /// Events whose outcome label matches, e.g. `"denied"`.
    pub fn count(&self, outcome: &str) -> usize {
        self.buffer().iter().filter(|e| e.outcome() == outcome).count()
    }

    pub fn clear(&self) {
        self.buffer().clear();
    }

    pub fn len(&self) -> usize {
        self.buffer().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    fn buffer(&self) -> MutexGuard<'_, VecDeque<AdmissionEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<AdmissionEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = Recorded;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: AdmissionEvent) -> Self::Future {
        let mut guard = self.buffer();
        if guard.len() >= self.capacity {
            guard.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push_back(event);
        ready(Ok(()))
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}

/// Offloads telemetry emission to a bounded channel and worker task.
///
/// Events that do not fit in the channel are dropped and counted, so a slow sink never delays
/// the request path.
#[derive(Clone)]
pub struct NonBlockingSink {
    tx: tokio::sync::mpsc::Sender<AdmissionEvent>,
    dropped: Arc<AtomicU64>,
}

impl std::fmt::Debug for NonBlockingSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonBlockingSink").field("dropped", &self.dropped()).finish()
    }
}

impl NonBlockingSink {
    /// Spawn the worker. Must be called from within a tokio runtime.
    pub fn with_capacity<S>(sink: S, capacity: usize) -> Self
    where
        S: tower::Service<AdmissionEvent, Response = ()> + Send + 'static,
        S::Error: std::error::Error + Send + 'static,
        S::Future: Send + 'static,
    {
        let (tx, mut rx) = tokio::sync::mpsc::channel(capacity.max(1));
        let mut sink = sink;

        tokio::spawn(async move {
            use tower::ServiceExt;
            while let Some(event) = rx.recv().await {
                match sink.ready().await {
                    Ok(ready) => {
                        if let Err(err) = ready.call(event).await {
                            tracing::debug!(target: "turnstile::telemetry", error = %err, "sink rejected event");
                        }
                    }
                    Err(err) => {
                        tracing::warn!(target: "turnstile::telemetry", error = %err, "sink failed; worker stopping");
                        break;
                    }
                }
            }
        });

        Self { tx, dropped: Arc::new(AtomicU64::new(0)) }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl tower::Service<AdmissionEvent> for NonBlockingSink {
    type Response = ();
    type Error = Infallible;
    type Future = Recorded;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: AdmissionEvent) -> Self::Future {
        if self.tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        ready(Ok(()))
    }
}

impl TelemetrySink for NonBlockingSink {
    type SinkError = Infallible;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn allowed(remaining: u64) -> AdmissionEvent {
        AdmissionEvent::Allowed { policy: "api".into(), limit: 100, remaining }
    }

    #[tokio::test]
    async fn null_sink_accepts_everything() {
        let mut sink = NullSink;
        sink.call(AdmissionEvent::FailedOpen { policy: "api".into() }).await.unwrap();
    }

    #[tokio::test]
    async fn memory_sink_evicts_oldest() {
        let mut sink = MemorySink::with_capacity(2);
        assert!(sink.is_empty());

        sink.call(allowed(99)).await.unwrap();
        sink.call(allowed(98)).await.unwrap();
        sink.call(allowed(97)).await.unwrap();

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.evicted(), 1);
        assert_eq!(sink.events(), vec![allowed(98), allowed(97)]);
        assert_eq!(sink.count("allowed"), 2);

        sink.clear();
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn non_blocking_sink_forwards_to_worker() {
        let memory = MemorySink::new();
        let mut sink = NonBlockingSink::with_capacity(memory.clone(), 8);

        sink.call(allowed(1)).await.unwrap();
        for _ in 0..50 {
            if memory.len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(memory.events(), vec![allowed(1)]);
        assert_eq!(sink.dropped(), 0);
    }

    #[tokio::test]
    async fn emit_best_effort_swallows_errors() {
        #[derive(Clone)]
        struct Fails;
        impl tower::Service<AdmissionEvent> for Fails {
            type Response = ();
            type Error = std::io::Error;
            type Future = Ready<Result<(), std::io::Error>>;
            fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
                Poll::Ready(Ok(()))
            }
            fn call(&mut self, _req: AdmissionEvent) -> Self::Future {
                ready(Err(std::io::Error::new(std::io::ErrorKind::Other, "fail")))
            }
        }

        emit_best_effort(Fails, AdmissionEvent::FailedOpen { policy: "auth".into() }).await;
    }

    #[tokio::test]
    async fn spawn_emit_delivers_off_the_caller_task() {
        let memory = MemorySink::new();
        spawn_emit(memory.clone(), allowed(7));
        assert!(memory.is_empty(), "nothing recorded until the caller yields");

        tokio::task::yield_now().await;
        assert_eq!(memory.events(), vec![allowed(7)]);
    }

    #[test]
    fn spawn_emit_without_runtime_drops_the_event() {
        let memory = MemorySink::new();
        spawn_emit(memory.clone(), allowed(7));
        assert!(memory.is_empty());
    }

    #[tokio::test]
    async fn log_sink_accepts_events() {
        let mut sink = LogSink;
        sink.call(allowed(10)).await.unwrap();
    }
}
