//! Link status classification.

use std::fmt;

use super::constants::{LINK_BUSY, LINK_BUSY_DATA, LINK_READY, LINK_RETRY_BIT};

/// Meaning of a link status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    /// Idle, ready for the next phase.
    Ready,
    /// Busy, more data expected.
    Busy,
    /// The scanner asks for the phase to be repeated.
    Retry,
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkStatus::Ready => write!(f, "READY"),
            LinkStatus::Busy => write!(f, "BUSY"),
            LinkStatus::Retry => write!(f, "RETRY"),
        }
    }
}

/// Result of classifying a raw status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classified {
    pub status: LinkStatus,
    /// False when the byte matched no known pattern and the closest one was
    /// picked.
    pub exact: bool,
}

/// Classify a status byte.
///
/// Exact patterns are checked in order (ready, busy, retry bit). Anything
/// else resolves to the known pattern with the fewest differing bits.
pub fn classify(raw: u8) -> Classified {
    let exact = |status| Classified {
        status,
        exact: true,
    };
    match raw {
        LINK_READY => exact(LinkStatus::Ready),
        LINK_BUSY | LINK_BUSY_DATA => exact(LinkStatus::Busy),
        r if r & LINK_RETRY_BIT != 0 => exact(LinkStatus::Retry),
        r => {
            let candidates = [
                (LINK_READY, LinkStatus::Ready),
                (LINK_BUSY, LinkStatus::Busy),
                (LINK_BUSY_DATA, LinkStatus::Busy),
            ];
            let status = candidates
                .iter()
                .min_by_key(|(pattern, _)| (pattern ^ r).count_ones())
                .map(|(_, status)| *status)
                .unwrap_or(LinkStatus::Busy);
            Classified {
                status,
                exact: false,
            }
        }
    }
}
