use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use serde_json::json;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::logging::{LogLevel, Logger};
use crate::platform::{Connector, Directory, LiveView, Location, Notice, Notifier, RemovalReason};

use super::Lane;
use super::mode::{ModeState, ServiceMode};
use super::waitlist::persistent::{NextGroup, PersistentWaitlist};
use super::waitlist::{EnqueueRequest, Enqueued, QueueEntry, QueueStore, WaitlistError};

/// What happens to a requester whose connection attempt failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailurePolicy {
    Skip,
    Requeue,
}

impl FailurePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Skip => "skip",
            Self::Requeue => "requeue",
        }
    }
}

impl FromStr for FailurePolicy {
    type Err = ();

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "skip" => Ok(Self::Skip),
            "requeue" => Ok(Self::Requeue),
            _ => Err(()),
        }
    }
}

#[derive(Clone)]
pub struct Collaborators {
    pub directory: Arc<dyn Directory>,
    pub connector: Arc<dyn Connector>,
    pub notifier: Arc<dyn Notifier>,
    pub live_view: Arc<dyn LiveView>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeskSettings {
    pub lane: Lane,
    pub failure_policy: FailurePolicy,
    pub coordinators: Vec<String>,
}

impl DeskSettings {
    pub fn from_app_config(lane: Lane, app_config: &AppConfig) -> Result<Self, DeskError> {
        let raw_policy = app_config.dispatch.on_connect_failure.as_str();
        let failure_policy =
            raw_policy
                .parse::<FailurePolicy>()
                .map_err(|_| DeskError::InvalidFailurePolicy {
                    value: raw_policy.to_owned(),
                })?;

        Ok(Self {
            lane,
            failure_policy,
            coordinators: app_config.session.coordinators.clone(),
        })
    }
}

#[derive(Debug)]
pub enum DeskError {
    InvalidFailurePolicy { value: String },
    NotCoordinator { identity: String },
    Waitlist(WaitlistError),
}

impl fmt::Display for DeskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidFailurePolicy { value } => write!(
                f,
                "invalid dispatch.on_connect_failure '{value}'; allowed values: skip, requeue"
            ),
            Self::NotCoordinator { identity } => {
                write!(f, "'{identity}' is not allowed to change the service mode")
            }
            Self::Waitlist(source) => write!(f, "{source}"),
        }
    }
}

impl std::error::Error for DeskError {}

impl From<WaitlistError> for DeskError {
    fn from(value: WaitlistError) -> Self {
        Self::Waitlist(value)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    NothingToDo,
    /// The helper has no location to receive a requester in; nothing was dequeued.
    InvalidHelperContext,
    /// Degraded mode: the entry left the queue and the helper reaches out directly.
    Released { entry: QueueEntry },
    Connected { entry: QueueEntry, location: Location },
    ConnectionFailed { entry: QueueEntry, requeued: bool },
    GroupServed {
        entry: QueueEntry,
        connected: Vec<String>,
        failed: Vec<String>,
        next_up: Option<String>,
        requeued: bool,
    },
}

impl DispatchOutcome {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NothingToDo => "nothing_to_do",
            Self::InvalidHelperContext => "invalid_helper_context",
            Self::Released { .. } => "released",
            Self::Connected { .. } => "connected",
            Self::ConnectionFailed { .. } => "connection_failed",
            Self::GroupServed { .. } => "group_served",
        }
    }

    pub fn entry(&self) -> Option<&QueueEntry> {
        match self {
            Self::NothingToDo | Self::InvalidHelperContext => None,
            Self::Released { entry }
            | Self::Connected { entry, .. }
            | Self::ConnectionFailed { entry, .. }
            | Self::GroupServed { entry, .. } => Some(entry),
        }
    }
}

/// Pairs requesters waiting in one lane with helpers that signal readiness.
pub struct HelpDesk<S: QueueStore> {
    lane: Lane,
    store: S,
    mode: ModeState,
    failure_policy: FailurePolicy,
    coordinators: Vec<String>,
    collaborators: Collaborators,
    logger: Arc<Logger>,
    session_id: Uuid,
    /// Held across every store mutation and the live view update mirroring it.
    live_order: Mutex<()>,
}

impl<S: QueueStore> HelpDesk<S> {
    pub fn new(
        store: S,
        settings: DeskSettings,
        collaborators: Collaborators,
        logger: Arc<Logger>,
    ) -> Self {
        let session_id = Uuid::new_v4();
        logger.log(
            LogLevel::Info,
            Some("desk::init"),
            "Help desk opened",
            Some(json!({
                "session_id": session_id.to_string(),
                "lane": settings.lane.as_str(),
                "on_connect_failure": settings.failure_policy.as_str(),
                "coordinators": settings.coordinators.len()
            })),
        );

        Self {
            lane: settings.lane,
            store,
            mode: ModeState::new(),
            failure_policy: settings.failure_policy,
            coordinators: settings.coordinators,
            collaborators,
            logger,
            session_id,
            live_order: Mutex::new(()),
        }
    }

    pub fn lane(&self) -> Lane {
        self.lane
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn mode(&self) -> ServiceMode {
        self.mode.current()
    }

    pub fn enqueue(&self, request: EnqueueRequest) -> Result<Enqueued, WaitlistError> {
        let requester_id = request.requester_id.clone();

        let result = self.in_live_order(|| {
            let enqueued = self.store.enqueue(request)?;
            self.collaborators
                .live_view
                .entry_added(self.lane, &enqueued.entry, enqueued.position);
            Ok::<_, WaitlistError>(enqueued)
        });

        match result {
            Ok(enqueued) => {
                self.collaborators.notifier.notify(
                    &requester_id,
                    &Notice::Enqueued {
                        position: enqueued.position,
                        mode: self.mode.current(),
                    },
                );
                self.logger.log(
                    LogLevel::Info,
                    Some("desk::enqueue"),
                    "Requester joined the waitlist",
                    Some(json!({
                        "lane": self.lane.as_str(),
                        "requester_id": requester_id,
                        "position": enqueued.position,
                        "group_size": enqueued.entry.group_members.len() + 1,
                        "sequence": enqueued.entry.sequence
                    })),
                );
                Ok(enqueued)
            }
            Err(WaitlistError::AlreadyQueued {
                requester_id,
                position,
            }) => {
                self.collaborators
                    .notifier
                    .notify(&requester_id, &Notice::AlreadyWaiting { position });
                self.logger.debug(
                    Some("desk::enqueue"),
                    &format!("requester '{requester_id}' is already waiting at position {position}"),
                );
                Err(WaitlistError::AlreadyQueued {
                    requester_id,
                    position,
                })
            }
            Err(error) => {
                self.logger.warn(
                    Some("desk::enqueue"),
                    &format!("enqueue for '{requester_id}' failed: {error}"),
                );
                Err(error)
            }
        }
    }

    /// Administrative removal. Returns whether the requester was waiting.
    pub fn remove(&self, requester_id: &str) -> Result<bool, WaitlistError> {
        let removed = self.in_live_order(|| {
            let entry = self.store.remove(requester_id)?;
            if let Some(entry) = &entry {
                self.collaborators
                    .live_view
                    .entry_removed(self.lane, entry, RemovalReason::Withdrawn);
            }
            Ok::<_, WaitlistError>(entry)
        })?;
        if removed.is_none() {
            return Ok(false);
        }

        self.logger.info(
            Some("desk::remove"),
            &format!("requester '{requester_id}' removed from the {} waitlist", self.lane.as_str()),
        );
        Ok(true)
    }

    pub fn position_of(&self, requester_id: &str) -> Result<Option<usize>, WaitlistError> {
        self.store.position_of(requester_id)
    }

    pub fn size(&self) -> Result<usize, WaitlistError> {
        self.store.size()
    }

    pub fn snapshot(&self) -> Result<Vec<QueueEntry>, WaitlistError> {
        self.store.snapshot()
    }

    /// Empty coordinator lists leave gating to the surrounding platform.
    pub fn is_coordinator(&self, identity: &str) -> bool {
        self.coordinators.is_empty() || self.coordinators.iter().any(|id| id == identity)
    }

    /// Removal on behalf of `source`, which must be allowed to administer the desk.
    pub fn withdraw(&self, source: &str, requester_id: &str) -> Result<bool, DeskError> {
        if !self.is_coordinator(source) {
            self.logger.warn(
                Some("desk::remove"),
                &format!("withdraw of '{requester_id}' by non-coordinator '{source}' ignored"),
            );
            return Err(DeskError::NotCoordinator {
                identity: source.to_owned(),
            });
        }
        Ok(self.remove(requester_id)?)
    }

    /// Switches the desk to degraded mode. Returns `true` only on the call that
    /// changed it.
    pub fn degrade(&self, source: &str) -> Result<bool, DeskError> {
        if !self.is_coordinator(source) {
            self.logger.warn(
                Some("desk::mode"),
                &format!("degrade signal from non-coordinator '{source}' ignored"),
            );
            return Err(DeskError::NotCoordinator {
                identity: source.to_owned(),
            });
        }

        let changed = self.mode.degrade();
        if changed {
            self.collaborators
                .live_view
                .mode_changed(self.lane, ServiceMode::Degraded);
            self.logger.log(
                LogLevel::Info,
                Some("desk::mode"),
                "Service mode switched",
                Some(json!({
                    "session_id": self.session_id.to_string(),
                    "lane": self.lane.as_str(),
                    "mode": ServiceMode::Degraded.as_str(),
                    "source": source
                })),
            );
        }
        Ok(changed)
    }

    /// Serves the oldest waiting requester for `helper_id`.
    pub fn dispatch(&self, helper_id: &str) -> Result<DispatchOutcome, WaitlistError> {
        let outcome = self.run_dispatch(helper_id)?;
        self.finish_dispatch(helper_id, &outcome);
        Ok(outcome)
    }

    fn run_dispatch(&self, helper_id: &str) -> Result<DispatchOutcome, WaitlistError> {
        if self.store.size()? == 0 {
            return Ok(self.nothing_to_do(helper_id));
        }

        if self.mode.current() == ServiceMode::Degraded {
            return Ok(match self.take_oldest(RemovalReason::Released)? {
                Some(entry) => DispatchOutcome::Released { entry },
                None => self.nothing_to_do(helper_id),
            });
        }

        let Some(location) = self.collaborators.directory.locate(helper_id) else {
            self.collaborators
                .notifier
                .notify(helper_id, &Notice::JoinLocationFirst);
            return Ok(DispatchOutcome::InvalidHelperContext);
        };

        let Some(entry) = self.take_oldest(RemovalReason::Dispatched)? else {
            return Ok(self.nothing_to_do(helper_id));
        };

        let notifier = &self.collaborators.notifier;
        match self
            .collaborators
            .connector
            .connect(&entry.requester_id, &location)
        {
            Ok(()) => {
                notifier.notify(&entry.requester_id, &Notice::HelperReady);
                notifier.notify(
                    helper_id,
                    &Notice::RequesterConnected {
                        display_name: entry.display_name.clone(),
                    },
                );
                Ok(DispatchOutcome::Connected { entry, location })
            }
            Err(error) => {
                self.logger.warn(
                    Some("desk::dispatch"),
                    &format!(
                        "could not connect '{}' to {location}: {error}",
                        entry.requester_id
                    ),
                );
                let requeued = self.requeue_after_failure(&entry);
                notifier.notify(&entry.requester_id, &Notice::ConnectFailed { requeued });
                notifier.notify(
                    helper_id,
                    &Notice::RequesterSkipped {
                        display_name: entry.display_name.clone(),
                        requeued,
                    },
                );
                Ok(DispatchOutcome::ConnectionFailed { entry, requeued })
            }
        }
    }

    fn in_live_order<T>(&self, mutate: impl FnOnce() -> T) -> T {
        let _order = self.live_order.lock().expect("desk live order lock poisoned");
        mutate()
    }

    fn take_oldest(&self, reason: RemovalReason) -> Result<Option<QueueEntry>, WaitlistError> {
        self.in_live_order(|| {
            let entry = self.store.dequeue_oldest()?;
            if let Some(entry) = &entry {
                self.collaborators
                    .live_view
                    .entry_removed(self.lane, entry, reason);
            }
            Ok::<_, WaitlistError>(entry)
        })
    }

    fn nothing_to_do(&self, helper_id: &str) -> DispatchOutcome {
        self.collaborators
            .notifier
            .notify(helper_id, &Notice::NothingToDo);
        DispatchOutcome::NothingToDo
    }

    fn requeue_after_failure(&self, entry: &QueueEntry) -> bool {
        if self.failure_policy == FailurePolicy::Skip {
            return false;
        }

        let restored = self.in_live_order(|| {
            self.store.restore(entry.clone())?;
            if let Ok(Some(position)) = self.store.position_of(&entry.requester_id) {
                self.collaborators
                    .live_view
                    .entry_added(self.lane, entry, position);
            }
            Ok::<(), WaitlistError>(())
        });

        match restored {
            Ok(()) => true,
            Err(error) => {
                self.logger.warn(
                    Some("desk::dispatch"),
                    &format!("could not requeue '{}': {error}", entry.requester_id),
                );
                false
            }
        }
    }

    fn finish_dispatch(&self, helper_id: &str, outcome: &DispatchOutcome) {
        self.collaborators
            .live_view
            .dispatch_completed(self.lane, helper_id, outcome);

        let level = match outcome {
            DispatchOutcome::NothingToDo | DispatchOutcome::InvalidHelperContext => LogLevel::Debug,
            DispatchOutcome::ConnectionFailed { .. } => LogLevel::Warn,
            _ => LogLevel::Info,
        };
        self.logger.log(
            level,
            Some("desk::dispatch"),
            "Dispatch finished",
            Some(json!({
                "dispatch_id": Uuid::new_v4().to_string(),
                "session_id": self.session_id.to_string(),
                "lane": self.lane.as_str(),
                "mode": self.mode.current().as_str(),
                "helper_id": helper_id,
                "outcome": outcome.code(),
                "requester_id": outcome.entry().map(|entry| entry.requester_id.as_str())
            })),
        );
    }
}

impl HelpDesk<PersistentWaitlist> {
    /// Serves the whole group at the head of the booth waitlist and warns the
    /// lead of the group behind it.
    pub fn dispatch_next_group(&self, helper_id: &str) -> Result<DispatchOutcome, WaitlistError> {
        let outcome = self.run_group_dispatch(helper_id)?;
        self.finish_dispatch(helper_id, &outcome);
        Ok(outcome)
    }

    fn run_group_dispatch(&self, helper_id: &str) -> Result<DispatchOutcome, WaitlistError> {
        if self.store.size()? == 0 {
            return Ok(self.nothing_to_do(helper_id));
        }

        if self.mode.current() == ServiceMode::Degraded {
            return Ok(match self.take_next_group(RemovalReason::Released)? {
                Some(group) => DispatchOutcome::Released { entry: group.entry },
                None => self.nothing_to_do(helper_id),
            });
        }

        let Some(location) = self.collaborators.directory.locate(helper_id) else {
            self.collaborators
                .notifier
                .notify(helper_id, &Notice::JoinLocationFirst);
            return Ok(DispatchOutcome::InvalidHelperContext);
        };

        let Some(group) = self.take_next_group(RemovalReason::Dispatched)? else {
            return Ok(self.nothing_to_do(helper_id));
        };

        let notifier = &self.collaborators.notifier;
        let mut connected = Vec::new();
        let mut failed = Vec::new();
        for member in &group.current_group {
            match self.collaborators.connector.connect(member, &location) {
                Ok(()) => {
                    notifier.notify(member, &Notice::HelperReady);
                    connected.push(member.clone());
                }
                Err(error) => {
                    self.logger.warn(
                        Some("desk::dispatch"),
                        &format!("could not connect group member '{member}' to {location}: {error}"),
                    );
                    failed.push(member.clone());
                }
            }
        }

        let requeued = connected.is_empty() && self.requeue_after_failure(&group.entry);
        for member in &failed {
            notifier.notify(member, &Notice::ConnectFailed { requeued });
        }
        notifier.notify(
            helper_id,
            &Notice::GroupConnected {
                connected: connected.len(),
                total: group.current_group.len(),
            },
        );

        if !requeued {
            if let Some(lead) = &group.next_group_preview {
                notifier.notify(lead, &Notice::UpNext);
            }
        }

        Ok(DispatchOutcome::GroupServed {
            entry: group.entry,
            connected,
            failed,
            next_up: group.next_group_preview,
            requeued,
        })
    }

    fn take_next_group(&self, reason: RemovalReason) -> Result<Option<NextGroup>, WaitlistError> {
        self.in_live_order(|| {
            let group = self.store.dequeue_next_group()?;
            if let Some(group) = &group {
                self.collaborators
                    .live_view
                    .entry_removed(self.lane, &group.entry, reason);
            }
            Ok::<_, WaitlistError>(group)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::{Arc, OnceLock};
    use std::thread;

    use crate::config::AppConfig;
    use crate::events::EventEmitter;
    use crate::logging::LogLevel;
    use crate::logging::testing::{memory_logger, quiet_logger};
    use crate::orchestrator::Lane;
    use crate::orchestrator::mode::ServiceMode;
    use crate::orchestrator::waitlist::persistent::PersistentWaitlist;
    use crate::orchestrator::waitlist::testing::{FaultyStore, StoreFault};
    use crate::orchestrator::waitlist::{EnqueueRequest, QueueStore, Waitlist, WaitlistError};
    use crate::platform::testing::{
        LiveEvent, RecordingLiveView, RecordingNotifier, ScriptedConnector, ScriptedDirectory,
    };
    use crate::platform::{
        EmitterLiveView, LiveRoster, Location, Notice, Notifier, RemovalReason,
    };
    use crate::storage::testing::{open_storage, unique_temp_path};

    use super::{
        Collaborators, DeskError, DeskSettings, DispatchOutcome, FailurePolicy, HelpDesk,
    };

    struct Fixture<S: QueueStore> {
        desk: HelpDesk<S>,
        notifier: Arc<RecordingNotifier>,
        directory: Arc<ScriptedDirectory>,
        connector: Arc<ScriptedConnector>,
        live: Arc<RecordingLiveView>,
    }

    fn fixture_with<S: QueueStore>(
        store: S,
        lane: Lane,
        failure_policy: FailurePolicy,
        coordinators: &[&str],
    ) -> Fixture<S> {
        let notifier = Arc::new(RecordingNotifier::default());
        let directory = Arc::new(ScriptedDirectory::default());
        let connector = Arc::new(ScriptedConnector::default());
        let live = Arc::new(RecordingLiveView::default());

        let desk = HelpDesk::new(
            store,
            DeskSettings {
                lane,
                failure_policy,
                coordinators: coordinators.iter().map(|id| (*id).to_owned()).collect(),
            },
            Collaborators {
                directory: directory.clone(),
                connector: connector.clone(),
                notifier: notifier.clone(),
                live_view: live.clone(),
            },
            quiet_logger(),
        );

        Fixture {
            desk,
            notifier,
            directory,
            connector,
            live,
        }
    }

    fn session(policy: FailurePolicy) -> Fixture<Waitlist> {
        fixture_with(Waitlist::new(), Lane::Session, policy, &[])
    }

    fn enqueue_all(desk: &HelpDesk<Waitlist>, ids: &[&str]) {
        for id in ids {
            desk.enqueue(EnqueueRequest::new(*id, id.to_uppercase()))
                .expect("enqueue should work");
        }
    }

    fn waiting_ids<S: QueueStore>(desk: &HelpDesk<S>) -> Vec<String> {
        desk.snapshot()
            .expect("snapshot")
            .into_iter()
            .map(|entry| entry.requester_id)
            .collect()
    }

    #[test]
    fn failure_policy_is_read_from_config() {
        let mut app_config = AppConfig::default();
        let settings =
            DeskSettings::from_app_config(Lane::Session, &app_config).expect("defaults are valid");
        assert_eq!(settings.failure_policy, FailurePolicy::Skip);

        app_config.dispatch.on_connect_failure = "requeue".to_owned();
        let settings =
            DeskSettings::from_app_config(Lane::Booth, &app_config).expect("requeue is valid");
        assert_eq!(settings.failure_policy, FailurePolicy::Requeue);
        assert_eq!(settings.lane, Lane::Booth);

        app_config.dispatch.on_connect_failure = "retry".to_owned();
        assert!(matches!(
            DeskSettings::from_app_config(Lane::Session, &app_config),
            Err(DeskError::InvalidFailurePolicy { .. })
        ));
    }

    #[test]
    fn enqueue_notifies_position_and_updates_live_view() {
        let fx = session(FailurePolicy::Skip);
        enqueue_all(&fx.desk, &["a", "b"]);

        assert_eq!(
            fx.notifier.notices_for("b"),
            vec![Notice::Enqueued {
                position: 2,
                mode: ServiceMode::Normal
            }]
        );
        assert_eq!(
            fx.live.events(),
            vec![
                LiveEvent::Added(Lane::Session, "a".to_owned(), 1),
                LiveEvent::Added(Lane::Session, "b".to_owned(), 2),
            ]
        );
    }

    #[test]
    fn second_raise_is_already_waiting_with_unchanged_position() {
        let fx = session(FailurePolicy::Skip);
        enqueue_all(&fx.desk, &["a", "b", "c"]);

        let err = fx
            .desk
            .enqueue(EnqueueRequest::new("b", "B"))
            .expect_err("duplicate should be rejected");
        assert!(matches!(err, WaitlistError::AlreadyQueued { position: 2, .. }));
        assert_eq!(
            fx.notifier.notices_for("b").last(),
            Some(&Notice::AlreadyWaiting { position: 2 })
        );
        assert_eq!(fx.desk.size().expect("size"), 3);
        assert_eq!(waiting_ids(&fx.desk), vec!["a", "b", "c"]);
    }

    #[test]
    fn empty_queue_dispatch_tells_helper_nothing_to_do() {
        let fx = session(FailurePolicy::Skip);
        fx.directory.place("helper", "room-1");

        let outcome = fx.desk.dispatch("helper").expect("dispatch should work");
        assert_eq!(outcome, DispatchOutcome::NothingToDo);
        assert_eq!(fx.notifier.notices_for("helper"), vec![Notice::NothingToDo]);
        assert!(fx.connector.connected().is_empty());
        assert_eq!(
            fx.live.events(),
            vec![LiveEvent::Dispatch(Lane::Session, "helper".to_owned(), "nothing_to_do")]
        );
    }

    #[test]
    fn helper_without_location_never_dequeues() {
        let fx = session(FailurePolicy::Skip);
        enqueue_all(&fx.desk, &["a", "b"]);

        let outcome = fx.desk.dispatch("helper").expect("dispatch should work");
        assert_eq!(outcome, DispatchOutcome::InvalidHelperContext);
        assert_eq!(fx.desk.size().expect("size"), 2);
        assert_eq!(fx.notifier.notices_for("helper"), vec![Notice::JoinLocationFirst]);
        assert!(fx.connector.connected().is_empty());
    }

    #[test]
    fn successful_dispatch_serves_the_oldest_requester() {
        let fx = session(FailurePolicy::Skip);
        enqueue_all(&fx.desk, &["a", "b", "c"]);
        fx.directory.place("helper", "room-1");

        let outcome = fx.desk.dispatch("helper").expect("dispatch should work");
        match outcome {
            DispatchOutcome::Connected { entry, location } => {
                assert_eq!(entry.requester_id, "a");
                assert_eq!(location, Location::new("room-1"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        assert_eq!(waiting_ids(&fx.desk), vec!["b", "c"]);
        assert_eq!(
            fx.connector.connected(),
            vec![("a".to_owned(), Location::new("room-1"))]
        );
        assert_eq!(fx.notifier.notices_for("a").last(), Some(&Notice::HelperReady));
        assert_eq!(
            fx.notifier.notices_for("helper"),
            vec![Notice::RequesterConnected {
                display_name: "A".to_owned()
            }]
        );
        assert!(fx.live.events().contains(&LiveEvent::Removed(
            Lane::Session,
            "a".to_owned(),
            RemovalReason::Dispatched
        )));
    }

    #[test]
    fn failed_connection_skips_requester_and_notifies_both() {
        let fx = session(FailurePolicy::Skip);
        enqueue_all(&fx.desk, &["a", "b"]);
        fx.directory.place("helper", "room-1");
        fx.connector.fail_for("a");

        let outcome = fx.desk.dispatch("helper").expect("dispatch should work");
        assert!(matches!(
            outcome,
            DispatchOutcome::ConnectionFailed { ref entry, requeued: false } if entry.requester_id == "a"
        ));
        assert_eq!(waiting_ids(&fx.desk), vec!["b"]);
        assert_eq!(
            fx.notifier.notices_for("a").last(),
            Some(&Notice::ConnectFailed { requeued: false })
        );
        assert_eq!(
            fx.notifier.notices_for("helper"),
            vec![Notice::RequesterSkipped {
                display_name: "A".to_owned(),
                requeued: false
            }]
        );
        assert_eq!(
            fx.live.events()[2..],
            [
                LiveEvent::Removed(Lane::Session, "a".to_owned(), RemovalReason::Dispatched),
                LiveEvent::Dispatch(Lane::Session, "helper".to_owned(), "connection_failed"),
            ]
        );
    }

    #[test]
    fn requeue_policy_keeps_failed_requester_at_the_front() {
        let fx = session(FailurePolicy::Requeue);
        enqueue_all(&fx.desk, &["a", "b"]);
        fx.directory.place("helper", "room-1");
        fx.connector.fail_for("a");

        let outcome = fx.desk.dispatch("helper").expect("dispatch should work");
        assert!(matches!(
            outcome,
            DispatchOutcome::ConnectionFailed { requeued: true, .. }
        ));
        assert_eq!(waiting_ids(&fx.desk), vec!["a", "b"]);
        assert_eq!(fx.desk.position_of("a").expect("position"), Some(1));
        assert_eq!(
            fx.notifier.notices_for("a").last(),
            Some(&Notice::ConnectFailed { requeued: true })
        );
        assert_eq!(
            fx.live.events()[2..],
            [
                LiveEvent::Removed(Lane::Session, "a".to_owned(), RemovalReason::Dispatched),
                LiveEvent::Added(Lane::Session, "a".to_owned(), 1),
                LiveEvent::Dispatch(Lane::Session, "helper".to_owned(), "connection_failed"),
            ]
        );
    }

    #[test]
    fn degraded_dispatch_only_pops_the_queue() {
        let fx = session(FailurePolicy::Skip);
        enqueue_all(&fx.desk, &["a", "b"]);
        assert!(fx.desk.degrade("coordinator").expect("degrade should work"));
        let notices_before = fx.notifier.count();

        // no location needed in degraded mode
        let outcome = fx.desk.dispatch("helper").expect("dispatch should work");
        assert!(matches!(
            outcome,
            DispatchOutcome::Released { ref entry } if entry.requester_id == "a"
        ));
        assert_eq!(waiting_ids(&fx.desk), vec!["b"]);
        assert!(fx.connector.connected().is_empty());
        assert_eq!(fx.notifier.count(), notices_before);
    }

    #[test]
    fn degrade_is_idempotent_and_changes_enqueue_notice() {
        let fx = session(FailurePolicy::Skip);
        assert_eq!(fx.desk.mode(), ServiceMode::Normal);

        assert!(fx.desk.degrade("coordinator").expect("first degrade"));
        assert!(!fx.desk.degrade("coordinator").expect("second degrade"));
        assert_eq!(fx.desk.mode(), ServiceMode::Degraded);

        let mode_events = fx
            .live
            .events()
            .into_iter()
            .filter(|event| matches!(event, LiveEvent::Mode(..)))
            .count();
        assert_eq!(mode_events, 1);

        enqueue_all(&fx.desk, &["a"]);
        assert_eq!(
            fx.notifier.notices_for("a"),
            vec![Notice::Enqueued {
                position: 1,
                mode: ServiceMode::Degraded
            }]
        );
    }

    #[test]
    fn only_coordinators_may_degrade_when_configured() {
        let fx = fixture_with(Waitlist::new(), Lane::Session, FailurePolicy::Skip, &["lead"]);

        let err = fx
            .desk
            .degrade("random")
            .expect_err("non-coordinator should be refused");
        assert!(matches!(err, DeskError::NotCoordinator { .. }));
        assert_eq!(fx.desk.mode(), ServiceMode::Normal);

        assert!(fx.desk.degrade("lead").expect("coordinator degrade"));
    }

    #[test]
    fn withdraw_is_administrative_when_coordinators_are_configured() {
        let fx = fixture_with(Waitlist::new(), Lane::Session, FailurePolicy::Skip, &["lead"]);
        enqueue_all(&fx.desk, &["a"]);

        assert!(matches!(
            fx.desk.withdraw("a", "a"),
            Err(DeskError::NotCoordinator { .. })
        ));
        assert_eq!(fx.desk.size().expect("size"), 1);
        assert!(fx.desk.withdraw("lead", "a").expect("coordinator withdraw"));
        assert!(!fx.desk.withdraw("lead", "a").expect("repeat withdraw"));
    }

    #[test]
    fn remove_reports_withdrawal_once() {
        let fx = session(FailurePolicy::Skip);
        enqueue_all(&fx.desk, &["a", "b"]);

        assert!(fx.desk.remove("a").expect("remove"));
        assert!(!fx.desk.remove("a").expect("remove"));
        assert_eq!(fx.desk.position_of("b").expect("position"), Some(1));
        assert!(fx.live.events().contains(&LiveEvent::Removed(
            Lane::Session,
            "a".to_owned(),
            RemovalReason::Withdrawn
        )));
    }

    #[test]
    fn dispatch_outcome_is_logged_with_lane_and_requester() {
        let (logger, sink) = memory_logger(LogLevel::Debug);
        let notifier = Arc::new(RecordingNotifier::default());
        let directory = Arc::new(ScriptedDirectory::default());
        let connector = Arc::new(ScriptedConnector::default());
        let live = Arc::new(RecordingLiveView::default());
        directory.place("helper", "room-1");

        let desk = HelpDesk::new(
            Waitlist::new(),
            DeskSettings {
                lane: Lane::Session,
                failure_policy: FailurePolicy::Skip,
                coordinators: Vec::new(),
            },
            Collaborators {
                directory,
                connector,
                notifier,
                live_view: live,
            },
            logger,
        );
        enqueue_all(&desk, &["ada"]);
        desk.dispatch("helper").expect("dispatch should work");

        assert!(sink.contains("[desk::dispatch] Dispatch finished"));
        assert!(sink.contains("\"outcome\":\"connected\""));
        assert!(sink.contains("\"requester_id\":\"ada\""));
    }

    #[test]
    fn concurrent_helpers_never_serve_a_requester_twice() {
        let fx = Arc::new(session(FailurePolicy::Skip));
        for n in 0..100 {
            fx.desk
                .enqueue(EnqueueRequest::new(format!("r{n}"), "x"))
                .expect("enqueue");
        }
        for helper in 0..4 {
            fx.directory.place(&format!("h{helper}"), &format!("room-{helper}"));
        }

        let handles: Vec<_> = (0..4)
            .map(|helper| {
                let fx = Arc::clone(&fx);
                thread::spawn(move || {
                    let helper_id = format!("h{helper}");
                    while fx.desk.dispatch(&helper_id).expect("dispatch") != DispatchOutcome::NothingToDo {}
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("helper thread should finish");
        }

        let served = fx.connector.connected();
        let unique: HashSet<_> = served.iter().map(|(id, _)| id.clone()).collect();
        assert_eq!(served.len(), 100);
        assert_eq!(unique.len(), 100);
        assert_eq!(fx.desk.size().expect("size"), 0);
    }

    #[test]
    fn group_dispatch_serves_party_and_warns_next_lead() {
        let path = unique_temp_path("desk-group");
        let storage = open_storage(&path).expect("storage init should work");
        let waitlist = PersistentWaitlist::bootstrap(Arc::new(storage), &quiet_logger())
            .expect("bootstrap should work");
        let fx = fixture_with(waitlist, Lane::Booth, FailurePolicy::Skip, &[]);

        fx.desk
            .enqueue(EnqueueRequest::new("a", "Ada").with_group_members(["x", "y"]))
            .expect("a enqueues");
        fx.desk
            .enqueue(EnqueueRequest::new("b", "Bo"))
            .expect("b enqueues");
        fx.directory.place("helper", "booth-3");
        fx.connector.fail_for("y");

        let outcome = fx
            .desk
            .dispatch_next_group("helper")
            .expect("group dispatch should work");
        match outcome {
            DispatchOutcome::GroupServed {
                entry,
                connected,
                failed,
                next_up,
                requeued,
            } => {
                assert_eq!(entry.requester_id, "a");
                assert_eq!(connected, vec!["x", "a"]);
                assert_eq!(failed, vec!["y"]);
                assert_eq!(next_up.as_deref(), Some("b"));
                assert!(!requeued);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        assert_eq!(waiting_ids(&fx.desk), vec!["b"]);
        assert_eq!(fx.notifier.notices_for("b").last(), Some(&Notice::UpNext));
        assert_eq!(
            fx.notifier.notices_for("y"),
            vec![Notice::ConnectFailed { requeued: false }]
        );
        assert_eq!(
            fx.notifier.notices_for("helper"),
            vec![Notice::GroupConnected {
                connected: 2,
                total: 3
            }]
        );

        let _ = std::fs::remove_dir_all(path);
    }

    #[test]
    fn group_dispatch_without_helper_location_keeps_everyone() {
        let path = unique_temp_path("desk-group-no-location");
        let storage = open_storage(&path).expect("storage init should work");
        let waitlist = PersistentWaitlist::bootstrap(Arc::new(storage), &quiet_logger())
            .expect("bootstrap should work");
        let fx = fixture_with(waitlist, Lane::Booth, FailurePolicy::Skip, &[]);

        fx.desk
            .enqueue(EnqueueRequest::new("a", "Ada"))
            .expect("a enqueues");

        let outcome = fx
            .desk
            .dispatch_next_group("helper")
            .expect("group dispatch should work");
        assert_eq!(outcome, DispatchOutcome::InvalidHelperContext);
        assert_eq!(fx.desk.size().expect("size"), 1);

        let _ = std::fs::remove_dir_all(path);
    }

    /// Runs a helper's dispatch on another thread while the enqueue notice is
    /// being delivered, as a slow socket write would allow.
    struct DispatchingNotifier {
        desk: OnceLock<Arc<HelpDesk<Waitlist>>>,
    }

    impl Notifier for DispatchingNotifier {
        fn notify(&self, _identity: &str, notice: &Notice) {
            if !matches!(notice, Notice::Enqueued { .. }) {
                return;
            }
            if let Some(desk) = self.desk.get() {
                let desk = Arc::clone(desk);
                thread::spawn(move || desk.dispatch("helper").expect("dispatch should work"))
                    .join()
                    .expect("dispatching thread should finish");
            }
        }
    }

    fn rostered_desk(
        failure_policy: FailurePolicy,
        notifier: Arc<dyn Notifier>,
    ) -> (Arc<HelpDesk<Waitlist>>, Arc<LiveRoster>, Arc<ScriptedConnector>) {
        let emitter = Arc::new(EventEmitter::new());
        let roster = LiveRoster::attach(&emitter, quiet_logger());
        let directory = Arc::new(ScriptedDirectory::default());
        directory.place("helper", "room-1");
        let connector = Arc::new(ScriptedConnector::default());

        let desk = HelpDesk::new(
            Waitlist::new(),
            DeskSettings {
                lane: Lane::Session,
                failure_policy,
                coordinators: Vec::new(),
            },
            Collaborators {
                directory,
                connector: connector.clone(),
                notifier,
                live_view: Arc::new(EmitterLiveView::new(emitter, quiet_logger())),
            },
            quiet_logger(),
        );
        (Arc::new(desk), roster, connector)
    }

    #[test]
    fn roster_never_keeps_a_requester_served_during_their_enqueue_notice() {
        let notifier = Arc::new(DispatchingNotifier {
            desk: OnceLock::new(),
        });
        let (desk, roster, connector) = rostered_desk(FailurePolicy::Skip, notifier.clone());
        assert!(notifier.desk.set(Arc::clone(&desk)).is_ok());

        desk.enqueue(EnqueueRequest::new("a", "Ada"))
            .expect("enqueue should work");

        assert_eq!(desk.size().expect("size"), 0);
        assert_eq!(connector.connected().len(), 1);
        assert!(roster.lines(Lane::Session).is_empty());
    }

    #[test]
    fn roster_matches_queue_order_after_concurrent_enqueues_and_requeue() {
        let (desk, roster, connector) =
            rostered_desk(FailurePolicy::Requeue, Arc::new(RecordingNotifier::default()));

        let handles: Vec<_> = (0..8)
            .map(|n| {
                let desk = Arc::clone(&desk);
                thread::spawn(move || {
                    desk.enqueue(EnqueueRequest::new(format!("r{n}"), format!("R{n}")))
                        .expect("enqueue should work");
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("enqueue thread should finish");
        }

        let head = desk.snapshot().expect("snapshot")[0].requester_id.clone();
        connector.fail_for(&head);
        desk.dispatch("helper").expect("dispatch should work");

        let expected: Vec<String> = desk
            .snapshot()
            .expect("snapshot")
            .into_iter()
            .map(|entry| entry.display_name)
            .collect();
        assert_eq!(expected.len(), 8);
        assert_eq!(roster.lines(Lane::Session), expected);
    }

    #[test]
    fn head_that_vanishes_before_dequeue_is_nothing_to_do() {
        let fx = fixture_with(
            FaultyStore::new(StoreFault::VanishingHead),
            Lane::Session,
            FailurePolicy::Skip,
            &[],
        );
        fx.directory.place("helper", "room-1");
        assert_eq!(fx.desk.size().expect("size"), 1);

        let outcome = fx.desk.dispatch("helper").expect("dispatch should work");
        assert_eq!(outcome, DispatchOutcome::NothingToDo);
        assert_eq!(fx.notifier.notices_for("helper"), vec![Notice::NothingToDo]);
        assert!(fx.connector.connected().is_empty());
        assert!(
            !fx.live
                .events()
                .iter()
                .any(|event| matches!(event, LiveEvent::Removed(..)))
        );
    }

    #[test]
    fn unavailable_storage_is_returned_to_the_caller() {
        let fx = fixture_with(
            FaultyStore::new(StoreFault::Unavailable),
            Lane::Session,
            FailurePolicy::Skip,
            &[],
        );
        fx.directory.place("helper", "room-1");

        assert!(matches!(
            fx.desk.enqueue(EnqueueRequest::new("a", "Ada")),
            Err(WaitlistError::StorageUnavailable(_))
        ));
        assert!(matches!(
            fx.desk.dispatch("helper"),
            Err(WaitlistError::StorageUnavailable(_))
        ));
        assert!(matches!(
            fx.desk.withdraw("lead", "a"),
            Err(DeskError::Waitlist(WaitlistError::StorageUnavailable(_)))
        ));

        assert_eq!(fx.desk.store.inner().size().expect("size"), 0);
        assert_eq!(fx.notifier.count(), 0);
        assert!(fx.connector.connected().is_empty());
        assert!(fx.live.events().is_empty());
    }
}
