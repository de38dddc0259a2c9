//! In-process event bus backed by a broadcast channel.

use async_trait::async_trait;
use sediment_core::events::Event;
use sediment_core::ports::{EventBus, EventStream};
use sediment_core::{Error, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Event bus delivering to every live subscriber in this process.
///
/// A subscriber that falls more than `capacity` events behind receives an
/// `Error::EventsLagged` item and continues from the newest events.
#[derive(Clone)]
pub struct MemoryEventBus {
    sender: broadcast::Sender<Event>,
    published: Arc<AtomicU64>,
}

impl MemoryEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            published: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Total events published since creation.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

impl Default for MemoryEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventBus for MemoryEventBus {
    async fn publish(&self, event: Event) -> Result<()> {
        let subject = event.subject();
        self.published.fetch_add(1, Ordering::Relaxed);
        if self.sender.send(event).is_err() {
            debug!(subject = %subject, "Published event with no subscribers");
        }
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<EventStream> {
        if pattern.is_empty() {
            return Err(Error::EventBus("empty subscription pattern".into()));
        }
        let mut receiver = self.sender.subscribe();
        let pattern = pattern.to_string();
        let stream = async_stream::stream! {
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        if subject_matches(&pattern, &event.subject()) {
                            yield Ok(event);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(pattern = %pattern, skipped, "Event subscriber lagged");
                        yield Err(Error::EventsLagged(skipped));
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

/// Match a dot separated subject against a pattern where `*` matches one
/// token and a trailing `>` matches one or more tokens.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut subject_tokens = subject.split('.');
    for token in pattern.split('.') {
        match token {
            ">" => return subject_tokens.next().is_some(),
            "*" => {
                if subject_tokens.next().is_none() {
                    return false;
                }
            }
            literal => {
                if subject_tokens.next() != Some(literal) {
                    return false;
                }
            }
        }
    }
    subject_tokens.next().is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use futures::StreamExt;
    use sediment_core::events::CommitFinishedPayload;
    use sediment_core::ids::CommitId;
    use sediment_core::repo::Commit;

    fn finished(repo: &str) -> Event {
        Event::CommitFinished(CommitFinishedPayload {
            commit: Commit::new(repo, CommitId::new()),
            branch: Some("master".to_string()),
            finished_at: Utc::now(),
        })
    }

    #[test]
    fn test_subject_matching() {
        assert!(subject_matches("commit.finished.>", "commit.finished.a.master"));
        assert!(subject_matches("commit.*.a.master", "commit.finished.a.master"));
        assert!(!subject_matches("commit.finished.>", "commit.finished"));
        assert!(!subject_matches("commit.finished.b.*", "commit.finished.a.master"));
        assert!(!subject_matches("job.*", "job.edges.job_1"));
        assert!(subject_matches("job.edges.job_1", "job.edges.job_1"));
    }

    #[tokio::test]
    async fn test_subscribe_filters() {
        let bus = MemoryEventBus::new(16);
        let mut stream = bus.subscribe("commit.finished.b.>").await.unwrap();
        bus.publish(finished("a")).await.unwrap();
        bus.publish(finished("b")).await.unwrap();

        let event = stream.next().await.unwrap().unwrap();
        match event {
            Event::CommitFinished(p) => assert_eq!(p.commit.repo, "b"),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(bus.published(), 2);
    }

    #[tokio::test]
    async fn test_lagged_subscriber_is_told() {
        let bus = MemoryEventBus::new(2);
        let mut stream = bus.subscribe(">").await.unwrap();
        for _ in 0..5 {
            bus.publish(finished("a")).await.unwrap();
        }
        let first = stream.next().await.unwrap();
        assert!(matches!(first, Err(Error::EventsLagged(3))));
        assert!(stream.next().await.unwrap().is_ok());
    }
}
