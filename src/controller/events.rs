//! Kubernetes Event publishing.
//!
//! Events are fire-and-forget: a failure to publish is logged and never
//! fails the reconcile.

use std::sync::Mutex;

use async_trait::async_trait;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};

use crate::crd::TikvCluster;

/// Reporter name used for events and as field manager
pub const FIELD_MANAGER: &str = "tikv-operator";

/// An event about a cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterEvent {
    pub warning: bool,
    pub reason: String,
    pub action: String,
    pub note: Option<String>,
}

impl ClusterEvent {
    pub fn normal(reason: &str, action: &str, note: impl Into<String>) -> Self {
        Self {
            warning: false,
            reason: reason.to_string(),
            action: action.to_string(),
            note: Some(note.into()),
        }
    }

    pub fn warning(reason: &str, action: &str, note: impl Into<String>) -> Self {
        Self {
            warning: true,
            reason: reason.to_string(),
            action: action.to_string(),
            note: Some(note.into()),
        }
    }
}

/// Destination of cluster events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, tc: &TikvCluster, event: ClusterEvent);
}

/// Publishes events through the Kubernetes events API.
pub struct KubeEventSink {
    recorder: Recorder,
}

impl KubeEventSink {
    pub fn new(client: Client) -> Self {
        let reporter = Reporter {
            controller: FIELD_MANAGER.into(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn publish(&self, tc: &TikvCluster, event: ClusterEvent) {
        let object_ref = tc.object_ref(&());
        let type_ = if event.warning {
            EventType::Warning
        } else {
            EventType::Normal
        };
        if let Err(e) = self
            .recorder
            .publish(
                &Event {
                    type_,
                    reason: event.reason.clone(),
                    note: event.note,
                    action: event.action,
                    secondary: None,
                },
                &object_ref,
            )
            .await
        {
            tracing::warn!(reason = %event.reason, error = %e, "Failed to publish event");
        }
    }
}

/// Records events in memory.
#[derive(Default)]
pub struct FakeEventSink {
    events: Mutex<Vec<ClusterEvent>>,
}

impl FakeEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ClusterEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }
}

#[async_trait]
impl EventSink for FakeEventSink {
    async fn publish(&self, _tc: &TikvCluster, event: ClusterEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
