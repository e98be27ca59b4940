//! Per-process progress broker.
//!
//! The pipeline publishes; SSE handlers and tests subscribe. Each subscriber
//! owns a bounded buffer — a slow consumer is dropped (its channel closed)
//! rather than ever blocking the pipeline. Publication holds the registry
//! lock only long enough to fan out `try_send`s, which preserves per-job
//! publication order.

mod event;

pub use event::ProgressEvent;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::ids::JobId;

const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

/// Receiving half of a progress subscription. Wraps a bounded flume channel;
/// the stream ends when the job finishes or the subscriber falls too far
/// behind.
pub struct ProgressStream {
    rx: flume::Receiver<ProgressEvent>,
}

impl ProgressStream {
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.rx.recv_async().await.ok()
    }

    pub fn try_recv(&mut self) -> Option<ProgressEvent> {
        self.rx.try_recv().ok()
    }

    /// Drain everything currently buffered (test helper).
    pub fn drain(&mut self) -> Vec<ProgressEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            out.push(event);
        }
        out
    }

    pub fn into_inner(self) -> flume::Receiver<ProgressEvent> {
        self.rx
    }
}

struct JobChannel {
    subscribers: Vec<flume::Sender<ProgressEvent>>,
    last_publish: Instant,
}

struct BusInner {
    jobs: Mutex<FxHashMap<String, JobChannel>>,
    buffer: usize,
    dropped_subscribers: AtomicUsize,
}

/// Fan-out broker for per-job progress events.
#[derive(Clone)]
pub struct ProgressBus {
    inner: Arc<BusInner>,
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_BUFFER)
    }
}

impl ProgressBus {
    pub fn new(buffer: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                jobs: Mutex::new(FxHashMap::default()),
                buffer: buffer.max(1),
                dropped_subscribers: AtomicUsize::new(0),
            }),
        }
    }

    /// Register interest in a job's events. The job does not have to exist
    /// yet; events published later will be delivered in order.
    pub fn subscribe(&self, job_id: &JobId) -> ProgressStream {
        let (tx, rx) = flume::bounded(self.inner.buffer);
        let mut jobs = self.inner.jobs.lock();
        jobs.entry(job_id.as_str().to_string())
            .or_insert_with(|| JobChannel {
                subscribers: Vec::new(),
                last_publish: Instant::now(),
            })
            .subscribers
            .push(tx);
        ProgressStream { rx }
    }

    /// A closed stream carrying exactly one synthetic event, for subscribers
    /// that join after a job already reached a terminal state.
    pub fn synthetic(&self, event: ProgressEvent) -> ProgressStream {
        let (tx, rx) = flume::bounded(1);
        let _ = tx.try_send(event);
        ProgressStream { rx }
    }

    /// Publish one event to every subscriber of `job_id`. Overflowing
    /// subscribers are dropped, closing their streams; the publisher never
    /// waits.
    pub fn publish(&self, job_id: &JobId, event: ProgressEvent) {
        let mut jobs = self.inner.jobs.lock();
        let Some(channel) = jobs.get_mut(job_id.as_str()) else {
            return;
        };
        channel.last_publish = Instant::now();
        let mut dropped = 0usize;
        channel.subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(flume::TrySendError::Full(_)) => {
                dropped += 1;
                false
            }
            Err(flume::TrySendError::Disconnected(_)) => false,
        });
        if dropped > 0 {
            self.inner
                .dropped_subscribers
                .fetch_add(dropped, Ordering::Relaxed);
            debug!(
                job_id = %job_id,
                dropped,
                "dropped slow progress subscribers"
            );
        }
    }

    /// Publish a terminal event and tear down the job's subscriber list;
    /// dropping the senders closes every stream.
    pub fn finish(&self, job_id: &JobId, event: ProgressEvent) {
        self.publish(job_id, event);
        self.inner.jobs.lock().remove(job_id.as_str());
    }

    /// Remove a job's subscriber list without a terminal event (used when a
    /// queued job is torn down before it ever ran).
    pub fn forget(&self, job_id: &JobId) {
        self.inner.jobs.lock().remove(job_id.as_str());
    }

    /// Publish heartbeats to jobs that have had no event for `idle`. Called
    /// on a timer by the engine so idle SSE connections stay alive.
    pub fn heartbeat_idle(&self, idle: std::time::Duration) {
        let now = Instant::now();
        let mut jobs = self.inner.jobs.lock();
        for channel in jobs.values_mut() {
            if channel.subscribers.is_empty() {
                continue;
            }
            if now.duration_since(channel.last_publish) < idle {
                continue;
            }
            channel.last_publish = now;
            let event = ProgressEvent::Heartbeat {
                timestamp: Utc::now(),
            };
            channel
                .subscribers
                .retain(|tx| tx.try_send(event.clone()).is_ok());
        }
    }

    /// Total subscribers dropped for falling behind.
    pub fn dropped_subscribers(&self) -> usize {
        self.inner.dropped_subscribers.load(Ordering::Relaxed)
    }

    pub fn active_jobs(&self) -> usize {
        self.inner.jobs.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn job() -> JobId {
        JobId::from("urn:cl:job:test")
    }

    fn started(job_id: &JobId) -> ProgressEvent {
        ProgressEvent::JobStarted {
            job_id: job_id.clone(),
            url: "https://example.com/a".into(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn events_arrive_in_publication_order() {
        let bus = ProgressBus::default();
        let id = job();
        let mut stream = bus.subscribe(&id);

        bus.publish(&id, started(&id));
        for stage in ["extract", "screen", "transform"] {
            bus.publish(
                &id,
                ProgressEvent::StageStarted {
                    job_id: id.clone(),
                    stage,
                    timestamp: Utc::now(),
                },
            );
        }

        let kinds: Vec<&str> = stream.drain().iter().map(|e| e.kind()).collect();
        assert_eq!(
            kinds,
            vec!["job_started", "stage_started", "stage_started", "stage_started"]
        );
    }

    #[tokio::test]
    async fn slow_subscriber_is_dropped_not_blocked() {
        let bus = ProgressBus::new(2);
        let id = job();
        let mut slow = bus.subscribe(&id);

        for _ in 0..5 {
            bus.publish(&id, started(&id));
        }
        assert_eq!(bus.dropped_subscribers(), 1);

        // The dropped subscriber's stream closes after its buffered events.
        assert!(slow.recv().await.is_some());
        assert!(slow.recv().await.is_some());
        assert!(slow.recv().await.is_none());
    }

    #[tokio::test]
    async fn finish_closes_all_streams() {
        let bus = ProgressBus::default();
        let id = job();
        let mut stream = bus.subscribe(&id);
        bus.finish(
            &id,
            ProgressEvent::JobCompleted {
                job_id: id.clone(),
                duration_ms: 5,
                doc_id: None,
                tier: None,
                title: None,
                timestamp: Utc::now(),
            },
        );
        assert_eq!(stream.recv().await.map(|e| e.kind()), Some("job_completed"));
        assert!(stream.recv().await.is_none());
        assert_eq!(bus.active_jobs(), 0);
    }

    #[tokio::test]
    async fn heartbeat_reaches_only_idle_jobs() {
        let bus = ProgressBus::default();
        let idle_id = JobId::from("urn:cl:job:idle");
        let busy_id = JobId::from("urn:cl:job:busy");
        let mut idle = bus.subscribe(&idle_id);
        let mut busy = bus.subscribe(&busy_id);

        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.publish(&busy_id, started(&busy_id));
        bus.heartbeat_idle(Duration::from_millis(10));

        let idle_kinds: Vec<&str> = idle.drain().iter().map(|e| e.kind()).collect();
        assert_eq!(idle_kinds, vec!["heartbeat"]);
        let busy_kinds: Vec<&str> = busy.drain().iter().map(|e| e.kind()).collect();
        assert_eq!(busy_kinds, vec!["job_started"]);
    }

    #[tokio::test]
    async fn synthetic_stream_yields_one_event_then_closes() {
        let bus = ProgressBus::default();
        let id = job();
        let mut stream = bus.synthetic(ProgressEvent::JobCompleted {
            job_id: id.clone(),
            duration_ms: 0,
            doc_id: None,
            tier: None,
            title: None,
            timestamp: Utc::now(),
        });
        assert!(stream.recv().await.is_some());
        assert!(stream.recv().await.is_none());
    }
}
