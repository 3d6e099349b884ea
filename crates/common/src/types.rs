use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable handle for a body owned by the simulation.
///
/// The spatial index only ever stores this id; resolving it to a live body is
/// the job of whoever owns the body table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BodyId(pub u64);

impl fmt::Display for BodyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "body#{}", self.0)
    }
}

/// Identifier handed out for every accepted tile load request.
///
/// Ids are monotonically increasing within one streamer and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl RequestId {
    /// First id issued by a fresh streamer.
    pub const FIRST: RequestId = RequestId(1);

    /// The id following this one.
    pub fn next(self) -> RequestId {
        RequestId(self.0 + 1)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req#{}", self.0)
    }
}
