// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Epoch time.
//!
//! The mix network runs on a shared schedule of fixed-length epochs,
//! numbered from 0 starting at a genesis instant that every participant
//! agrees on. Directory documents, mix keys, and descriptor uploads are
//! all keyed by epoch, so "which epoch is it, and how far into it are we"
//! is the one clock question the rest of the system asks.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Duration of a single epoch.
pub const EPOCH_PERIOD: Duration = Duration::from_secs(3 * 60 * 60);

/// Unix time of the start of epoch 0: 2025-01-01T00:00:00Z.
const GENESIS_UNIX_SECS: u64 = 1_735_689_600;

/// An epoch number.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub struct Epoch(pub u64);

impl Epoch {
    pub fn next(self) -> Epoch {
        Epoch(self.0 + 1)
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where an instant falls within the epoch schedule.
///
/// `elapsed + remaining == EPOCH_PERIOD` and `elapsed < EPOCH_PERIOD`
/// always hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochPosition {
    /// The current epoch.
    pub epoch: Epoch,
    /// Time elapsed since the start of `epoch`.
    pub elapsed: Duration,
    /// Time remaining until the next epoch begins.
    pub remaining: Duration,
}

impl EpochPosition {
    /// Returns the position of the wall-clock instant `when`. Instants
    /// before genesis saturate to the start of epoch 0.
    pub fn of(when: SystemTime) -> EpochPosition {
        let genesis = UNIX_EPOCH + Duration::from_secs(GENESIS_UNIX_SECS);
        let since_genesis =
            when.duration_since(genesis).unwrap_or(Duration::ZERO);
        EpochPosition::at(since_genesis)
    }

    /// Returns the position of the instant `since_genesis` after the start
    /// of epoch 0.
    pub fn at(since_genesis: Duration) -> EpochPosition {
        let period = EPOCH_PERIOD.as_secs();
        let epoch = since_genesis.as_secs() / period;
        let elapsed = since_genesis - Duration::from_secs(epoch * period);
        EpochPosition {
            epoch: Epoch(epoch),
            elapsed,
            remaining: EPOCH_PERIOD - elapsed,
        }
    }
}

/// Source of epoch time.
///
/// A trait rather than a free function so that schedule-driven code can be
/// run against a deterministic clock in tests.
pub trait EpochClock: Send + Sync + 'static {
    fn now(&self) -> EpochPosition;
}

/// [`EpochClock`] backed by the system wall clock.
///
/// Instants before genesis saturate to the start of epoch 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl EpochClock for SystemClock {
    fn now(&self) -> EpochPosition {
        EpochPosition::of(SystemTime::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_at_genesis() {
        let pos = EpochPosition::at(Duration::ZERO);
        assert_eq!(pos.epoch, Epoch(0));
        assert_eq!(pos.elapsed, Duration::ZERO);
        assert_eq!(pos.remaining, EPOCH_PERIOD);
    }

    #[test]
    fn position_rolls_over_at_period() {
        let pos = EpochPosition::at(EPOCH_PERIOD);
        assert_eq!(pos.epoch, Epoch(1));
        assert_eq!(pos.elapsed, Duration::ZERO);
        assert_eq!(pos.remaining, EPOCH_PERIOD);
    }

    #[test]
    fn position_mid_epoch() {
        let elapsed = Duration::from_secs(2 * 60 * 60);
        let pos = EpochPosition::at(5 * EPOCH_PERIOD + elapsed);
        assert_eq!(pos.epoch, Epoch(5));
        assert_eq!(pos.elapsed, elapsed);
        assert_eq!(pos.remaining, EPOCH_PERIOD - elapsed);
    }

    #[test]
    fn elapsed_and_remaining_partition_the_period() {
        for secs in [0u64, 1, 3600, 10799, 10800, 123456] {
            let pos = EpochPosition::at(Duration::from_secs(secs));
            assert_eq!(pos.elapsed + pos.remaining, EPOCH_PERIOD);
            assert!(pos.elapsed < EPOCH_PERIOD);
        }
    }

    #[test]
    fn subsecond_elapsed_is_preserved() {
        let since = EPOCH_PERIOD - Duration::from_nanos(1);
        let pos = EpochPosition::at(since);
        assert_eq!(pos.epoch, Epoch(0));
        assert_eq!(pos.elapsed, since);
        assert_eq!(pos.remaining, Duration::from_nanos(1));
    }

    #[test]
    fn pre_genesis_instants_saturate_to_epoch_zero() {
        // The Unix epoch is well before genesis.
        let pos = EpochPosition::of(UNIX_EPOCH);
        assert_eq!(pos.epoch, Epoch(0));
        assert_eq!(pos.elapsed, Duration::ZERO);
        assert_eq!(pos.remaining, EPOCH_PERIOD);
    }

    #[test]
    fn wall_clock_position_measures_from_genesis() {
        let genesis = UNIX_EPOCH + Duration::from_secs(GENESIS_UNIX_SECS);
        let offset = 3 * EPOCH_PERIOD + Duration::from_secs(42);
        assert_eq!(
            EpochPosition::of(genesis + offset),
            EpochPosition::at(offset)
        );
    }

    #[test]
    fn epoch_successor() {
        assert_eq!(Epoch(7).next(), Epoch(8));
        assert_eq!(Epoch(7).to_string(), "7");
    }
}
