//! Per-project progress events.
//!
//! Publishing never blocks. Each subscriber has its own bounded buffer, and a
//! subscriber that falls too far behind loses the oldest events. That's
//! acceptable, because the page store remains the source of truth and a new
//! subscription always starts with a replay of the persisted state.

use futures::{StreamExt as _, stream};
use schemars::JsonSchema;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};

use crate::{
    async_utils::BoxedStream,
    error::LastError,
    prelude::*,
    project::{ProjectStatus, Stage, StageCounters},
    store::PageOutcome,
};

/// A progress event for a single project.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct ProgressEvent {
    /// The project this event belongs to.
    pub project_id: String,

    /// What happened.
    #[serde(flatten)]
    pub kind: ProgressKind,
}

impl ProgressEvent {
    /// Is this the last event of a run?
    pub fn is_finished(&self) -> bool {
        matches!(self.kind, ProgressKind::Finished { .. })
    }
}

/// The different kinds of [`ProgressEvent`].
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressKind {
    /// A page reached a terminal outcome.
    Page {
        stage: Stage,
        index: usize,
        outcome: PageOutcome,

        /// The page text, for `done` pages.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,

        /// Why the page failed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,

        /// Was this page completed before the subscription started?
        #[serde(default)]
        replayed: bool,
    },

    /// The project status or counters changed.
    Status(StatusSnapshot),

    /// The run ended in a state that will not change without a new command.
    Finished { status: ProjectStatus },
}

/// Everything a UI needs to show the state of a project.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub status: ProjectStatus,
    pub extraction: StageCounters,
    pub translation: StageCounters,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LastError>,

    /// Pages whose latest result is `failed`.
    #[serde(default)]
    pub failed_pages: Vec<PageRef>,
}

/// Identifies one page of one stage.
#[derive(Clone, Copy, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
pub struct PageRef {
    pub stage: Stage,
    pub index: usize,
}

/// Broadcasts [`ProgressEvent`]s for one project.
#[derive(Clone, Debug)]
pub struct ProgressBus {
    project_id: String,
    sender: broadcast::Sender<ProgressEvent>,
}

impl ProgressBus {
    /// Create a bus where each subscriber buffers up to `capacity` events.
    pub fn new(project_id: impl Into<String>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            project_id: project_id.into(),
            sender,
        }
    }

    /// The project ID stamped on every event.
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Publish an event. Returns immediately, even with no subscribers.
    pub fn publish(&self, kind: ProgressKind) {
        let event = self.event(kind);
        trace!(?event, "Publishing progress event");
        // An error here just means nobody is listening.
        let _ = self.sender.send(event);
    }

    /// Wrap `kind` in an event for this project.
    pub fn event(&self, kind: ProgressKind) -> ProgressEvent {
        ProgressEvent {
            project_id: self.project_id.clone(),
            kind,
        }
    }

    /// Start receiving live events.
    ///
    /// Call this *before* reading any state you plan to replay, so that no
    /// event falls between the replay and the live stream.
    pub fn receiver(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }
}

/// Turn a receiver into a stream of events, ending after the first
/// [`ProgressKind::Finished`].
pub fn live_events(receiver: broadcast::Receiver<ProgressEvent>) -> BoxedStream<ProgressEvent> {
    stream::unfold(
        (BroadcastStream::new(receiver), false),
        |(mut events, finished)| async move {
            if finished {
                return None;
            }
            loop {
                match events.next().await? {
                    Ok(event) => {
                        let finished = event.is_finished();
                        return Some((event, (events, finished)));
                    }
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!(skipped, "Progress subscriber fell behind; dropped oldest events");
                    }
                }
            }
        },
    )
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(index: usize) -> ProgressKind {
        ProgressKind::Page {
            stage: Stage::Extraction,
            index,
            outcome: PageOutcome::Done,
            content: Some(format!("page {index}")),
            error: None,
            replayed: false,
        }
    }

    fn index_of(event: &ProgressEvent) -> Option<usize> {
        match event.kind {
            ProgressKind::Page { index, .. } => Some(index),
            _ => None,
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_block() {
        let bus = ProgressBus::new("p", 2);
        for index in 0..100 {
            bus.publish(page(index));
        }
    }

    #[tokio::test]
    async fn subscription_ends_after_finished() {
        let bus = ProgressBus::new("p", 16);
        let events = live_events(bus.receiver());
        bus.publish(page(1));
        bus.publish(page(0));
        bus.publish(ProgressKind::Finished {
            status: ProjectStatus::ExtractionDone,
        });
        bus.publish(page(7));

        let events = events.collect::<Vec<_>>().await;
        assert_eq!(events.len(), 3);
        assert_eq!(index_of(&events[0]), Some(1));
        assert_eq!(index_of(&events[1]), Some(0));
        assert!(events[2].is_finished());
        assert!(events.iter().all(|e| e.project_id == "p"));
    }

    #[tokio::test]
    async fn slow_subscribers_lose_the_oldest_events() {
        let bus = ProgressBus::new("p", 2);
        let events = live_events(bus.receiver());
        for index in 0..5 {
            bus.publish(page(index));
        }
        bus.publish(ProgressKind::Finished {
            status: ProjectStatus::Cancelled,
        });

        let events = events.collect::<Vec<_>>().await;
        assert_eq!(events.len(), 2);
        assert_eq!(index_of(&events[0]), Some(4));
        assert!(events[1].is_finished());
    }

    #[test]
    fn events_serialize_with_a_tag() {
        let bus = ProgressBus::new("book", 1);
        let json = serde_json::to_value(bus.event(ProgressKind::Finished {
            status: ProjectStatus::Failed,
        }))
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "project_id": "book",
                "event": "finished",
                "status": "failed",
            })
        );
    }
}
