// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Coarse time for flow bookkeeping.
//!
//! Every timeout in the configuration grammar is whole seconds, so the
//! flow machinery runs on a seconds-granular [`Moment`] passed in by the
//! caller.  Element wrappers stamp packets from a monotonic [`Clock`];
//! tests drive expiry deterministically with fixed moments.

use std::time::Instant;

/// A point in coarse time, in seconds from an arbitrary epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Moment(u64);

impl Moment {
    /// The epoch itself.
    pub const ZERO: Moment = Moment(0);

    /// A moment `secs` seconds from the epoch.
    #[must_use]
    pub const fn from_secs(secs: u64) -> Moment {
        Moment(secs)
    }

    /// Seconds from the epoch.
    #[must_use]
    pub const fn as_secs(self) -> u64 {
        self.0
    }

    /// This moment advanced by `secs` seconds.
    #[must_use]
    pub const fn plus_secs(self, secs: u64) -> Moment {
        Moment(self.0.saturating_add(secs))
    }

    /// Seconds remaining until `later`, zero if already past.
    #[must_use]
    pub const fn until(self, later: Moment) -> u64 {
        later.0.saturating_sub(self.0)
    }
}

/// A pair of base timeout and guarantee window, in seconds.  When the
/// guarantee is non-zero, new and refreshed flows live on the guaranteed
/// heap for that window; otherwise the base timeout applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPair {
    /// Best-effort timeout in seconds.
    pub timeout: u32,
    /// Guarantee window in seconds; zero disables guarantees.
    pub guarantee: u32,
}

impl TimeoutPair {
    /// The timeout that applies to a fresh flow: the guarantee when one
    /// is configured, the base timeout otherwise.
    #[must_use]
    pub fn relevant(&self) -> u32 {
        if self.guarantee != 0 {
            self.guarantee
        } else {
            self.timeout
        }
    }
}

/// TCP timeout table, in seconds.  Which entry applies depends on the
/// flow's transport state; see the flow's timeout selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpTimeouts {
    /// Timeout for flows that have carried no data yet.
    pub nodata: u32,
    /// Timeout for flows that have carried data.
    pub data: u32,
    /// Timeout once both sides have closed (FIN/RST).
    pub done: u32,
    /// Guarantee window; zero disables guarantees.
    pub guarantee: u32,
}

impl TcpTimeouts {
    pub(crate) fn base(&self) -> TimeoutPair {
        TimeoutPair {
            timeout: self.nodata,
            guarantee: self.guarantee,
        }
    }
}

/// UDP timeout table, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpTimeouts {
    /// Timeout for one-way flows.
    pub timeout: u32,
    /// Timeout once traffic has been seen in both directions.
    pub streaming: u32,
    /// Guarantee window; zero disables guarantees.
    pub guarantee: u32,
}

impl UdpTimeouts {
    pub(crate) fn base(&self) -> TimeoutPair {
        TimeoutPair {
            timeout: self.timeout,
            guarantee: self.guarantee,
        }
    }
}

/// A time source for element wrappers.
#[derive(Debug, Clone, Copy)]
pub enum Clock {
    /// Wall-clock seconds since construction.
    System {
        /// When this clock was started.
        epoch: Instant,
    },
    /// A fixed moment, set by hand.  Useful in tests and simulations.
    Fixed(Moment),
}

impl Clock {
    /// A system clock starting now.
    #[must_use]
    pub fn system() -> Clock {
        Clock::System {
            epoch: Instant::now(),
        }
    }

    /// The current moment.
    #[must_use]
    pub fn now(&self) -> Moment {
        match self {
            Clock::System { epoch } => Moment::from_secs(epoch.elapsed().as_secs()),
            Clock::Fixed(moment) => *moment,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moment_arithmetic() {
        let t = Moment::from_secs(100);
        assert_eq!(t.plus_secs(50).as_secs(), 150);
        assert_eq!(t.until(Moment::from_secs(130)), 30);
        assert_eq!(Moment::from_secs(130).until(t), 0);
        assert!(t < t.plus_secs(1));
    }

    #[test]
    fn relevant_timeout_prefers_guarantee() {
        let pair = TimeoutPair {
            timeout: 300,
            guarantee: 0,
        };
        assert_eq!(pair.relevant(), 300);
        let pair = TimeoutPair {
            timeout: 300,
            guarantee: 5,
        };
        assert_eq!(pair.relevant(), 5);
    }

    #[test]
    fn fixed_clock_reads_back() {
        let clock = Clock::Fixed(Moment::from_secs(42));
        assert_eq!(clock.now(), Moment::from_secs(42));
    }
}
