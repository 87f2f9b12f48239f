//! Connection lifecycle states

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Init,
    Connecting,
    Connected,
    UnAuthenticated,
    Authenticated,
    Closed,
    /// Entered only by explicit shutdown; never left
    Terminal,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Init => "initialized",
            Status::Connecting => "connecting",
            Status::Connected => "connected",
            Status::UnAuthenticated => "unauthenticated",
            Status::Authenticated => "authenticated",
            Status::Closed => "closed",
            Status::Terminal => "terminal",
        }
    }

    /// Whether `self -> next` is a legal transition.
    ///
    /// Staying in the same state is always allowed except out of `Terminal`,
    /// where it is the only thing allowed.
    pub fn can_transition_to(self, next: Status) -> bool {
        use Status::*;

        if self == next {
            return true;
        }
        match (self, next) {
            (Terminal, _) => false,
            (_, Terminal) => true,
            (_, Closed) => true,
            (Init | Closed, Connecting | Connected) => true,
            (Connecting | Closed, Init) => true,
            (Connecting, Connected) => true,
            (Connected | UnAuthenticated | Authenticated, UnAuthenticated | Authenticated) => true,
            _ => false,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            Status::Connected | Status::UnAuthenticated | Status::Authenticated
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
