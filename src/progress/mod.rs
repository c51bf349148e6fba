//! Per-inspection publish/subscribe for progress events.
//!
//! Each inspection id owns a topic. The global map lock is held only long
//! enough to find or create a topic; the subscriber set of a topic is guarded
//! by its own mutex, so publishers of different inspections never contend.
//!
//! Delivery is at-most-once. Each subscriber has a bounded buffer; an event
//! that does not fit is dropped for that subscriber only. Nothing is queued
//! for subscribers that attach later.

pub mod protocol;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::ProtocolError;
use crate::orchestrator::job::{InspectionId, InspectionStatus};

/// One progress emission of an inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub inspection_id: InspectionId,
    pub percent: u8,
    pub step: String,
    pub status: InspectionStatus,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(
        inspection_id: InspectionId,
        percent: u8,
        step: impl Into<String>,
        status: InspectionStatus,
    ) -> Self {
        Self {
            inspection_id,
            percent: percent.min(100),
            step: step.into(),
            status,
            timestamp: Utc::now(),
        }
    }
}

/// Contiguous slice of the overall 0-100 range owned by one phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressBand {
    pub start: u8,
    pub end: u8,
}

impl ProgressBand {
    pub const fn new(start: u8, end: u8) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self { start: end, end: start }
        }
    }

    /// Band `index` of `count` equal slices of `self`. The last slice absorbs
    /// rounding so the slices exactly tile the parent.
    pub fn split(&self, index: usize, count: usize) -> Self {
        let count = count.max(1);
        let index = index.min(count - 1);
        let width = usize::from(self.end - self.start);
        let start = usize::from(self.start) + width * index / count;
        let end = usize::from(self.start) + width * (index + 1) / count;
        Self::new(start as u8, end as u8)
    }

    /// Map a local 0-100 percent into this band.
    pub fn map(&self, local: u8) -> u8 {
        let local = usize::from(local.min(100));
        let width = usize::from(self.end - self.start);
        (usize::from(self.start) + width * local / 100) as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one subscription for [`ProgressBroadcaster::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub inspection_id: InspectionId,
    pub id: SubscriptionId,
}

/// A live subscription. The receiver yields `None` once the topic closes or
/// the handle is released.
#[derive(Debug)]
pub struct Subscription {
    pub handle: SubscriptionHandle,
    pub events: mpsc::Receiver<ProgressEvent>,
}

#[derive(Debug, Default)]
struct Topic {
    subscribers: HashMap<SubscriptionId, mpsc::Sender<ProgressEvent>>,
}

type TopicRef = Arc<Mutex<Topic>>;

/// Fans progress events out to the current subscribers of each inspection.
#[derive(Debug)]
pub struct ProgressBroadcaster {
    topics: RwLock<HashMap<InspectionId, TopicRef>>,
    buffer: usize,
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new(64)
    }
}

impl ProgressBroadcaster {
    /// `buffer` is the per-subscriber event capacity.
    pub fn new(buffer: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            buffer: buffer.max(1),
        }
    }

    /// Create the topic of a new inspection. Idempotent.
    pub fn open_topic(&self, inspection_id: InspectionId) {
        let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
        topics.entry(inspection_id).or_default();
    }

    /// Drop a topic and every subscription on it; receivers observe the end
    /// of their stream.
    pub fn close_topic(&self, inspection_id: InspectionId) {
        let removed = self
            .topics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&inspection_id);
        if let Some(topic) = removed {
            let mut topic = topic.lock().unwrap_or_else(PoisonError::into_inner);
            let released = topic.subscribers.len();
            topic.subscribers.clear();
            tracing::debug!(inspection_id = %inspection_id, released, "closed progress topic");
        }
    }

    pub fn subscribe(&self, inspection_id: InspectionId) -> Result<Subscription, ProtocolError> {
        let topic = self
            .topic(inspection_id)
            .ok_or_else(|| ProtocolError::UnknownInspection(inspection_id.to_string()))?;

        let (tx, rx) = mpsc::channel(self.buffer);
        let id = SubscriptionId::new();
        topic
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribers
            .insert(id, tx);

        tracing::debug!(inspection_id = %inspection_id, subscription = %id, "subscribed");
        Ok(Subscription {
            handle: SubscriptionHandle { inspection_id, id },
            events: rx,
        })
    }

    /// Release a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let Some(topic) = self.topic(handle.inspection_id) else {
            return false;
        };
        let removed = topic
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribers
            .remove(&handle.id)
            .is_some();
        if removed {
            tracing::debug!(
                inspection_id = %handle.inspection_id,
                subscription = %handle.id,
                "unsubscribed"
            );
        }
        removed
    }

    /// Deliver `event` to every current subscriber of its inspection.
    /// Returns how many subscribers accepted it.
    pub fn publish(&self, event: ProgressEvent) -> usize {
        let Some(topic) = self.topic(event.inspection_id) else {
            return 0;
        };
        let mut topic = topic.lock().unwrap_or_else(PoisonError::into_inner);

        let mut delivered = 0;
        topic.subscribers.retain(|id, tx| match tx.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!(subscription = %id, "subscriber buffer full, dropping event");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        delivered
    }

    pub fn subscriber_count(&self, inspection_id: InspectionId) -> usize {
        self.topic(inspection_id)
            .map(|topic| {
                topic
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .subscribers
                    .len()
            })
            .unwrap_or(0)
    }

    pub fn has_topic(&self, inspection_id: InspectionId) -> bool {
        self.topic(inspection_id).is_some()
    }

    fn topic(&self, inspection_id: InspectionId) -> Option<TopicRef> {
        self.topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&inspection_id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn event(id: InspectionId, percent: u8) -> ProgressEvent {
        ProgressEvent::new(id, percent, "step", InspectionStatus::InProgress)
    }

    #[tokio::test]
    async fn fan_out_to_every_subscriber() {
        let broadcaster = ProgressBroadcaster::new(8);
        let id = InspectionId::new();
        broadcaster.open_topic(id);
        let mut a = broadcaster.subscribe(id).unwrap();
        let mut b = broadcaster.subscribe(id).unwrap();

        assert_eq!(broadcaster.publish(event(id, 10)), 2);
        assert_eq!(a.events.recv().await.unwrap().percent, 10);
        assert_eq!(b.events.recv().await.unwrap().percent, 10);
    }

    #[tokio::test]
    async fn late_subscriber_sees_only_later_events() {
        let broadcaster = ProgressBroadcaster::new(8);
        let id = InspectionId::new();
        broadcaster.open_topic(id);
        broadcaster.publish(event(id, 10));
        let mut late = broadcaster.subscribe(id).unwrap();
        broadcaster.publish(event(id, 20));
        assert_eq!(late.events.recv().await.unwrap().percent, 20);
        assert!(late.events.try_recv().is_err());
    }

    #[test]
    fn topics_are_isolated() {
        let broadcaster = ProgressBroadcaster::new(8);
        let a = InspectionId::new();
        let b = InspectionId::new();
        broadcaster.open_topic(a);
        broadcaster.open_topic(b);
        let mut sub = broadcaster.subscribe(a).unwrap();
        assert_eq!(broadcaster.publish(event(b, 50)), 0);
        assert!(sub.events.try_recv().is_err());
    }

    #[test]
    fn unsubscribe_releases_the_handle() {
        let broadcaster = ProgressBroadcaster::new(8);
        let id = InspectionId::new();
        broadcaster.open_topic(id);
        let sub = broadcaster.subscribe(id).unwrap();
        assert_eq!(broadcaster.subscriber_count(id), 1);
        assert!(broadcaster.unsubscribe(&sub.handle));
        assert!(!broadcaster.unsubscribe(&sub.handle));
        assert_eq!(broadcaster.subscriber_count(id), 0);
    }

    #[test]
    fn full_buffer_drops_without_blocking() {
        let broadcaster = ProgressBroadcaster::new(1);
        let id = InspectionId::new();
        broadcaster.open_topic(id);
        let mut sub = broadcaster.subscribe(id).unwrap();
        assert_eq!(broadcaster.publish(event(id, 10)), 1);
        assert_eq!(broadcaster.publish(event(id, 20)), 0);
        assert_eq!(sub.events.try_recv().unwrap().percent, 10);
        assert!(sub.events.try_recv().is_err());
        assert_eq!(broadcaster.subscriber_count(id), 1);
    }

    #[test]
    fn dropped_receiver_is_pruned_on_publish() {
        let broadcaster = ProgressBroadcaster::new(4);
        let id = InspectionId::new();
        broadcaster.open_topic(id);
        drop(broadcaster.subscribe(id).unwrap());
        broadcaster.publish(event(id, 10));
        assert_eq!(broadcaster.subscriber_count(id), 0);
    }

    #[tokio::test]
    async fn closing_a_topic_ends_streams() {
        let broadcaster = ProgressBroadcaster::new(4);
        let id = InspectionId::new();
        broadcaster.open_topic(id);
        let mut sub = broadcaster.subscribe(id).unwrap();
        broadcaster.close_topic(id);
        assert!(sub.events.recv().await.is_none());
        assert!(matches!(
            broadcaster.subscribe(id),
            Err(ProtocolError::UnknownInspection(_))
        ));
    }

    #[test]
    fn band_split_tiles_parent() {
        let parent = ProgressBand::new(0, 95);
        let bands: Vec<_> = (0..3).map(|i| parent.split(i, 3)).collect();
        assert_eq!(bands[0].start, 0);
        assert_eq!(bands[2].end, 95);
        assert_eq!(bands[0].end, bands[1].start);
        assert_eq!(bands[1].end, bands[2].start);
    }

    proptest! {
        #[test]
        fn band_map_is_monotonic_and_bounded(
            start in 0u8..=100,
            end in 0u8..=100,
            a in 0u8..=255,
            b in 0u8..=255,
        ) {
            let band = ProgressBand::new(start, end);
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            let mapped_lo = band.map(lo);
            let mapped_hi = band.map(hi);
            prop_assert!(mapped_lo <= mapped_hi);
            prop_assert!(mapped_lo >= band.start && mapped_hi <= band.end);
            prop_assert!(mapped_hi <= 100);
        }

        #[test]
        fn split_bands_are_contiguous(count in 1usize..8, start in 0u8..50, end in 50u8..=100) {
            let parent = ProgressBand::new(start, end);
            let mut cursor = parent.start;
            for index in 0..count {
                let band = parent.split(index, count);
                prop_assert_eq!(band.start, cursor);
                prop_assert!(band.start <= band.end);
                cursor = band.end;
            }
            prop_assert_eq!(cursor, parent.end);
        }
    }
}
