mod live;
mod presence;

use std::fmt;

use crate::orchestrator::Lane;
use crate::orchestrator::desk::DispatchOutcome;
use crate::orchestrator::mode::ServiceMode;
use crate::orchestrator::waitlist::QueueEntry;

pub use live::{EmitterLiveView, LiveRoster};
pub use presence::PresenceRegistry;

/// A place a helper can receive requesters in, such as a call room.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Location(String);

impl Location {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    RequesterUnreachable { requester_id: String },
    Rejected { reason: String },
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RequesterUnreachable { requester_id } => {
                write!(f, "requester '{requester_id}' is not in a connectable location")
            }
            Self::Rejected { reason } => write!(f, "connection rejected: {reason}"),
        }
    }
}

impl std::error::Error for ConnectError {}

/// Resolves where a helper can currently receive a requester.
pub trait Directory: Send + Sync {
    fn locate(&self, identity: &str) -> Option<Location>;
}

pub trait Connector: Send + Sync {
    fn connect(&self, requester_id: &str, target: &Location) -> Result<(), ConnectError>;
}

/// Fire-and-forget delivery of a notice to one identity.
pub trait Notifier: Send + Sync {
    fn notify(&self, identity: &str, notice: &Notice);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemovalReason {
    /// Taken by a helper; the dispatch outcome follows separately.
    Dispatched,
    Released,
    Withdrawn,
}

impl RemovalReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dispatched => "dispatched",
            Self::Released => "released",
            Self::Withdrawn => "withdrawn",
        }
    }
}

/// Observer of waitlist changes, typically a rendered roster. Updates arrive
/// in the order the waitlist changed.
pub trait LiveView: Send + Sync {
    /// `position` is the 1-based rank the entry took.
    fn entry_added(&self, lane: Lane, entry: &QueueEntry, position: usize);
    fn entry_removed(&self, lane: Lane, entry: &QueueEntry, reason: RemovalReason);
    fn mode_changed(&self, lane: Lane, mode: ServiceMode);
    fn dispatch_completed(&self, lane: Lane, helper_id: &str, outcome: &DispatchOutcome);
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notice {
    Enqueued { position: usize, mode: ServiceMode },
    AlreadyWaiting { position: usize },
    NothingToDo,
    JoinLocationFirst,
    HelperReady,
    RequesterConnected { display_name: String },
    ConnectFailed { requeued: bool },
    RequesterSkipped { display_name: String, requeued: bool },
    GroupConnected { connected: usize, total: usize },
    UpNext,
}

impl Notice {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Enqueued { .. } => "enqueued",
            Self::AlreadyWaiting { .. } => "already_waiting",
            Self::NothingToDo => "nothing_to_do",
            Self::JoinLocationFirst => "join_location_first",
            Self::HelperReady => "helper_ready",
            Self::RequesterConnected { .. } => "requester_connected",
            Self::ConnectFailed { .. } => "connect_failed",
            Self::RequesterSkipped { .. } => "requester_skipped",
            Self::GroupConnected { .. } => "group_connected",
            Self::UpNext => "up_next",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::Enqueued {
                position,
                mode: ServiceMode::Normal,
            } => format!(
                "You are number {position} in line. Stay in a connectable room; if you cannot be reached when it is your turn you will be skipped."
            ),
            Self::Enqueued {
                position,
                mode: ServiceMode::Degraded,
            } => format!(
                "You are number {position} in line. A helper will message you directly, so keep an eye on your inbox."
            ),
            Self::AlreadyWaiting { position } => format!(
                "You are already waiting at position {position}. A helper will get to you soon."
            ),
            Self::NothingToDo => "No one needs help right now.".to_owned(),
            Self::JoinLocationFirst => {
                "Join a room before taking the next requester.".to_owned()
            }
            Self::HelperReady => "A helper is ready for you and you are with them now.".to_owned(),
            Self::RequesterConnected { display_name } => {
                format!("{display_name} was moved to your room. Thanks for helping!")
            }
            Self::ConnectFailed { requeued: false } => "A helper was ready for you, but we could not bring you to their room. Make sure you are reachable and ask again.".to_owned(),
            Self::ConnectFailed { requeued: true } => "A helper was ready for you, but we could not bring you to their room. You keep your place in line.".to_owned(),
            Self::RequesterSkipped {
                display_name,
                requeued: false,
            } => format!(
                "{display_name} needed help but could not be moved to your room. They were notified and skipped; please take the next one."
            ),
            Self::RequesterSkipped {
                display_name,
                requeued: true,
            } => format!(
                "{display_name} could not be moved to your room and keeps their place in line. Please take the next one."
            ),
            Self::GroupConnected { connected, total } => {
                format!("{connected} of {total} group members were moved to your room.")
            }
            Self::UpNext => "Your group is next in line. Get ready!".to_owned(),
        }
    }
}
