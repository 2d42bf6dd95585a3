use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::{Value, json};

use crate::events::{
    DESK_DISPATCH_COMPLETED, DESK_MODE_CHANGED, EventEmitter, WAITLIST_ENTRY_ADDED,
    WAITLIST_ENTRY_REMOVED,
};
use crate::logging::{LogLevel, Logger};
use crate::orchestrator::Lane;
use crate::orchestrator::desk::DispatchOutcome;
use crate::orchestrator::mode::ServiceMode;
use crate::orchestrator::waitlist::QueueEntry;

use super::{LiveView, RemovalReason};

/// Publishes waitlist changes as events on the process emitter.
pub struct EmitterLiveView {
    emitter: Arc<EventEmitter>,
    logger: Arc<Logger>,
}

impl EmitterLiveView {
    pub fn new(emitter: Arc<EventEmitter>, logger: Arc<Logger>) -> Self {
        Self { emitter, logger }
    }

    fn publish(&self, event_name: &str, payload: Value) {
        if let Err(error) = self.emitter.emit(event_name, Some(payload)) {
            self.logger
                .warn(Some("live_view"), &format!("live view update failed: {error}"));
        }
    }
}

impl LiveView for EmitterLiveView {
    fn entry_added(&self, lane: Lane, entry: &QueueEntry, position: usize) {
        self.publish(
            WAITLIST_ENTRY_ADDED,
            json!({
                "lane": lane.as_str(),
                "position": position,
                "requester_id": entry.requester_id,
                "display_name": entry.display_name,
                "topic": entry.topic,
                "group_members": entry.group_members,
                "enqueued_at": entry.enqueued_at.to_rfc3339()
            }),
        );
    }

    fn entry_removed(&self, lane: Lane, entry: &QueueEntry, reason: RemovalReason) {
        self.publish(
            WAITLIST_ENTRY_REMOVED,
            json!({
                "lane": lane.as_str(),
                "requester_id": entry.requester_id,
                "reason": reason.as_str()
            }),
        );
    }

    fn mode_changed(&self, lane: Lane, mode: ServiceMode) {
        self.publish(
            DESK_MODE_CHANGED,
            json!({
                "lane": lane.as_str(),
                "mode": mode.as_str()
            }),
        );
    }

    fn dispatch_completed(&self, lane: Lane, helper_id: &str, outcome: &DispatchOutcome) {
        self.publish(
            DESK_DISPATCH_COMPLETED,
            json!({
                "lane": lane.as_str(),
                "helper_id": helper_id,
                "outcome": outcome.code(),
                "requester_id": outcome.entry().map(|entry| entry.requester_id.as_str())
            }),
        );
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct RosterLine {
    requester_id: String,
    rendered: String,
}

#[derive(Default)]
struct RosterState {
    lanes: HashMap<Lane, Vec<RosterLine>>,
    degraded: HashMap<Lane, bool>,
}

/// Rendered list of waiting requesters per lane, kept current from live view
/// events.
#[derive(Default)]
pub struct LiveRoster {
    state: Mutex<RosterState>,
}

fn render_line(display_name: &str, topic: Option<&str>) -> String {
    match topic {
        Some(topic) => format!("{display_name}: {topic}"),
        None => display_name.to_owned(),
    }
}

fn lane_of(payload: &Value) -> Option<Lane> {
    payload.get("lane")?.as_str()?.parse().ok()
}

impl LiveRoster {
    pub fn attach(emitter: &EventEmitter, logger: Arc<Logger>) -> Arc<Self> {
        let roster = Arc::new(Self::default());

        let added = Arc::clone(&roster);
        let added_logger = Arc::clone(&logger);
        emitter.on(WAITLIST_ENTRY_ADDED, move |event| {
            let Some(payload) = event.payload.as_ref() else {
                return Ok(());
            };
            if let Some(lane) = lane_of(payload) {
                added.push_payload(lane, payload);
                added.log_lane(lane, &added_logger);
            }
            Ok(())
        });

        let removed = Arc::clone(&roster);
        let removed_logger = Arc::clone(&logger);
        emitter.on(WAITLIST_ENTRY_REMOVED, move |event| {
            let Some(payload) = event.payload.as_ref() else {
                return Ok(());
            };
            let requester_id = payload.get("requester_id").and_then(Value::as_str);
            if let (Some(lane), Some(requester_id)) = (lane_of(payload), requester_id) {
                removed.remove(lane, requester_id);
                removed.log_lane(lane, &removed_logger);
            }
            Ok(())
        });

        let mode = Arc::clone(&roster);
        emitter.on(DESK_MODE_CHANGED, move |event| {
            let Some(payload) = event.payload.as_ref() else {
                return Ok(());
            };
            let mode_name = payload.get("mode").and_then(Value::as_str).unwrap_or("unknown");
            if let Some(lane) = lane_of(payload) {
                mode.state
                    .lock()
                    .expect("roster lock poisoned")
                    .degraded
                    .insert(lane, mode_name == ServiceMode::Degraded.as_str());
                logger.info(
                    Some("live_view::roster"),
                    &format!("{} desk is now in {mode_name} mode", lane.as_str()),
                );
            }
            Ok(())
        });

        roster
    }

    /// Fills a lane from entries that already existed, e.g. after a restart.
    pub fn seed(&self, lane: Lane, entries: &[QueueEntry]) {
        let mut state = self.state.lock().expect("roster lock poisoned");
        state.lanes.insert(
            lane,
            entries
                .iter()
                .map(|entry| RosterLine {
                    requester_id: entry.requester_id.clone(),
                    rendered: render_line(&entry.display_name, entry.topic.as_deref()),
                })
                .collect(),
        );
    }

    pub fn lines(&self, lane: Lane) -> Vec<String> {
        self.state
            .lock()
            .expect("roster lock poisoned")
            .lanes
            .get(&lane)
            .map(|lines| lines.iter().map(|line| line.rendered.clone()).collect())
            .unwrap_or_default()
    }

    pub fn is_degraded(&self, lane: Lane) -> bool {
        self.state
            .lock()
            .expect("roster lock poisoned")
            .degraded
            .get(&lane)
            .copied()
            .unwrap_or(false)
    }

    fn push_payload(&self, lane: Lane, payload: &Value) {
        let Some(requester_id) = payload.get("requester_id").and_then(Value::as_str) else {
            return;
        };
        let display_name = payload
            .get("display_name")
            .and_then(Value::as_str)
            .unwrap_or(requester_id);
        let topic = payload.get("topic").and_then(Value::as_str);
        let position = payload.get("position").and_then(Value::as_u64);

        let mut state = self.state.lock().expect("roster lock poisoned");
        let lines = state.lanes.entry(lane).or_default();
        lines.retain(|line| line.requester_id != requester_id);
        let index = position
            .and_then(|position| usize::try_from(position.saturating_sub(1)).ok())
            .map_or(lines.len(), |index| index.min(lines.len()));
        lines.insert(
            index,
            RosterLine {
                requester_id: requester_id.to_owned(),
                rendered: render_line(display_name, topic),
            },
        );
    }

    fn remove(&self, lane: Lane, requester_id: &str) {
        if let Some(lines) = self
            .state
            .lock()
            .expect("roster lock poisoned")
            .lanes
            .get_mut(&lane)
        {
            lines.retain(|line| line.requester_id != requester_id);
        }
    }

    fn log_lane(&self, lane: Lane, logger: &Logger) {
        if !logger.enabled(LogLevel::Debug) {
            return;
        }
        logger.log(
            LogLevel::Debug,
            Some("live_view::roster"),
            &format!("{} waitlist updated", lane.as_str()),
            Some(json!({ "waiting": self.lines(lane) })),
        );
    }
}
