use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::logging::Logger;
use crate::orchestrator::Lane;
use crate::orchestrator::desk::{DeskError, DispatchOutcome, HelpDesk};
use crate::orchestrator::mode::ServiceMode;
use crate::orchestrator::waitlist::persistent::PersistentWaitlist;
use crate::orchestrator::waitlist::{EnqueueRequest, QueueStore, Waitlist, WaitlistError};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    Enqueue {
        display_name: String,
        group_members: Vec<String>,
        topic: Option<String>,
    },
    HelperReady,
    Degrade,
    Withdraw {
        requester_id: String,
    },
    QueryPosition,
    QuerySize,
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Enqueue { .. } => "enqueue",
            Self::HelperReady => "helper_ready",
            Self::Degrade => "degrade",
            Self::Withdraw { .. } => "withdraw",
            Self::QueryPosition => "position",
            Self::QuerySize => "size",
        }
    }
}

/// One external signal, already attributed to the identity that sent it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signal {
    pub source: String,
    pub lane: Lane,
    pub action: Action,
}

impl Signal {
    pub fn new(source: impl Into<String>, lane: Lane, action: Action) -> Self {
        Self {
            source: source.into(),
            lane,
            action,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    Enqueued { position: usize },
    AlreadyWaiting { position: usize },
    Dispatched(DispatchOutcome),
    Mode { changed: bool, mode: ServiceMode },
    Withdrawn { removed: bool },
    Position(Option<usize>),
    Size(usize),
    /// Same signal from the same source is still being handled.
    Duplicate,
}

#[derive(Debug)]
pub enum IntakeError {
    LaneUnavailable { lane: Lane },
    GroupOutsideBooth,
    InvalidIdentity,
    NotCoordinator { identity: String },
    Storage(String),
}

impl IntakeError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::LaneUnavailable { .. } => "LANE_UNAVAILABLE",
            Self::GroupOutsideBooth => "GROUP_OUTSIDE_BOOTH",
            Self::InvalidIdentity => "INVALID_IDENTITY",
            Self::NotCoordinator { .. } => "NOT_COORDINATOR",
            Self::Storage(_) => "STORAGE_UNAVAILABLE",
        }
    }
}

impl fmt::Display for IntakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LaneUnavailable { lane } => write!(f, "the {} lane is not enabled", lane.as_str()),
            Self::GroupOutsideBooth => write!(f, "group requests are only accepted at the booth"),
            Self::InvalidIdentity => write!(f, "signal source identity must not be blank"),
            Self::NotCoordinator { identity } => {
                write!(f, "'{identity}' is not allowed to administer this desk")
            }
            Self::Storage(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for IntakeError {}

impl From<WaitlistError> for IntakeError {
    fn from(value: WaitlistError) -> Self {
        match value {
            WaitlistError::InvalidIdentity => Self::InvalidIdentity,
            other => Self::Storage(other.to_string()),
        }
    }
}

impl From<DeskError> for IntakeError {
    fn from(value: DeskError) -> Self {
        match value {
            DeskError::NotCoordinator { identity } => Self::NotCoordinator { identity },
            DeskError::Waitlist(source) => source.into(),
            other => Self::Storage(other.to_string()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct InFlightKey {
    source: String,
    lane: Lane,
    kind: &'static str,
}

struct InFlightGuard<'a> {
    in_flight: &'a Mutex<HashSet<InFlightKey>>,
    key: InFlightKey,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .expect("intake in-flight lock poisoned")
            .remove(&self.key);
    }
}

/// Turns concurrently arriving signals into single desk calls.
pub struct Intake {
    session: Arc<HelpDesk<Waitlist>>,
    booth: Option<Arc<HelpDesk<PersistentWaitlist>>>,
    in_flight: Mutex<HashSet<InFlightKey>>,
    logger: Arc<Logger>,
}

impl Intake {
    pub fn new(
        session: Arc<HelpDesk<Waitlist>>,
        booth: Option<Arc<HelpDesk<PersistentWaitlist>>>,
        logger: Arc<Logger>,
    ) -> Self {
        Self {
            session,
            booth,
            in_flight: Mutex::new(HashSet::new()),
            logger,
        }
    }

    pub fn handle(&self, signal: Signal) -> Result<Reply, IntakeError> {
        if signal.source.trim().is_empty() {
            return Err(IntakeError::InvalidIdentity);
        }

        let key = InFlightKey {
            source: signal.source.clone(),
            lane: signal.lane,
            kind: signal.action.kind(),
        };
        let Some(_guard) = self.try_begin(key) else {
            self.logger.debug(
                Some("intake"),
                &format!(
                    "duplicate {} signal from '{}' dropped while the first is in flight",
                    signal.action.kind(),
                    signal.source
                ),
            );
            return Ok(Reply::Duplicate);
        };

        let result = match signal.lane {
            Lane::Session => route(self.session.as_ref(), signal),
            Lane::Booth => match &self.booth {
                Some(booth) => route_booth(booth.as_ref(), signal),
                None => Err(IntakeError::LaneUnavailable { lane: Lane::Booth }),
            },
        };

        if let Err(error) = &result {
            self.logger
                .warn(Some("intake"), &format!("signal rejected: {error}"));
        }
        result
    }

    fn try_begin(&self, key: InFlightKey) -> Option<InFlightGuard<'_>> {
        let inserted = self
            .in_flight
            .lock()
            .expect("intake in-flight lock poisoned")
            .insert(key.clone());
        inserted.then(|| InFlightGuard {
            in_flight: &self.in_flight,
            key,
        })
    }
}

fn route_booth(desk: &HelpDesk<PersistentWaitlist>, signal: Signal) -> Result<Reply, IntakeError> {
    if signal.action == Action::HelperReady {
        return Ok(Reply::Dispatched(desk.dispatch_next_group(&signal.source)?));
    }
    route(desk, signal)
}

fn route<S: QueueStore>(desk: &HelpDesk<S>, signal: Signal) -> Result<Reply, IntakeError> {
    let Signal {
        source,
        lane,
        action,
    } = signal;

    match action {
        Action::Enqueue {
            display_name,
            group_members,
            topic,
        } => {
            if lane == Lane::Session && !group_members.is_empty() {
                return Err(IntakeError::GroupOutsideBooth);
            }
            let mut request =
                EnqueueRequest::new(source, display_name).with_group_members(group_members);
            if let Some(topic) = topic {
                request = request.with_topic(topic);
            }
            match desk.enqueue(request) {
                Ok(enqueued) => Ok(Reply::Enqueued {
                    position: enqueued.position,
                }),
                Err(WaitlistError::AlreadyQueued { position, .. }) => {
                    Ok(Reply::AlreadyWaiting { position })
                }
                Err(error) => Err(error.into()),
            }
        }
        Action::HelperReady => Ok(Reply::Dispatched(desk.dispatch(&source)?)),
        Action::Degrade => {
            let changed = desk.degrade(&source)?;
            Ok(Reply::Mode {
                changed,
                mode: desk.mode(),
            })
        }
        Action::Withdraw { requester_id } => Ok(Reply::Withdrawn {
            removed: desk.withdraw(&source, &requester_id)?,
        }),
        Action::QueryPosition => Ok(Reply::Position(desk.position_of(&source)?)),
        Action::QuerySize => Ok(Reply::Size(desk.size()?)),
    }
}
