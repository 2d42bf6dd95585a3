pub mod desk;
pub mod mode;
pub mod waitlist;

use std::str::FromStr;

use serde::Serialize;

/// Which waitlist a signal targets: the in-memory session queue or the
/// persisted booth queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    Session,
    Booth,
}

impl Lane {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::Booth => "booth",
        }
    }
}

impl FromStr for Lane {
    type Err = ();

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "session" => Ok(Self::Session),
            "booth" => Ok(Self::Booth),
            _ => Err(()),
        }
    }
}
