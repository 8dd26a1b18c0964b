// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The per-epoch phase cycle.
//!
//! Every epoch passes through three phases: `Wait` (descriptors
//! accumulate), `Exchange` (the authority drafts its vote for the next
//! epoch and trades it with peers), and `Tabulate` (collected signatures
//! are counted and the document published). The state machine itself owns
//! no timers and does no I/O; it reacts to [`StateMachine::advance`] calls
//! from the scheduler and fires the injected hooks on the two transitions
//! that have side effects.

use dirauth_common::epochtime::EPOCH_PERIOD;
use slog::{debug, Logger};
use std::time::Duration;
use thiserror::Error;

/// Offset into an epoch at which the exchange phase begins and a vote is
/// drafted.
pub const TIL_EXCHANGE: Duration = Duration::from_secs(120 * 60);

/// Offset into an epoch at which the tabulate phase begins and the drafted
/// document is finalized.
pub const TIL_TABULATE: Duration = Duration::from_secs(150 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Wait,
    Exchange,
    Tabulate,
}

/// Something the scheduler can tick. The production implementation is
/// [`PhaseStateMachine`]; tests substitute counters.
pub trait StateMachine: Send {
    fn advance(&mut self);
}

pub type TransitionHook = Box<dyn FnMut() + Send>;

#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("elapsed time {0:?} exceeds the epoch period")]
    ElapsedPastEpoch(Duration),
}

pub struct PhaseStateMachine {
    phase: Phase,
    vote_hook: TransitionHook,
    signature_hook: TransitionHook,
    log: Logger,
}

impl PhaseStateMachine {
    /// Builds a state machine whose initial phase matches `elapsed`, the
    /// time already spent in the current epoch. A boundary that passed
    /// before startup is accounted for here; the scheduler never fires it
    /// retroactively.
    pub fn new(
        elapsed: Duration,
        vote_hook: TransitionHook,
        signature_hook: TransitionHook,
        log: &Logger,
    ) -> Result<Self, PhaseError> {
        let phase = if elapsed < TIL_EXCHANGE {
            Phase::Wait
        } else if elapsed < TIL_TABULATE {
            Phase::Exchange
        } else if elapsed <= EPOCH_PERIOD {
            Phase::Tabulate
        } else {
            return Err(PhaseError::ElapsedPastEpoch(elapsed));
        };
        Ok(Self {
            phase,
            vote_hook,
            signature_hook,
            log: log.new(slog::o!("component" => "state-machine")),
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }
}

impl StateMachine for PhaseStateMachine {
    fn advance(&mut self) {
        let next = match self.phase {
            Phase::Wait => {
                (self.vote_hook)();
                Phase::Exchange
            }
            Phase::Exchange => {
                (self.signature_hook)();
                Phase::Tabulate
            }
            Phase::Tabulate => Phase::Wait,
        };
        debug!(
            self.log, "phase transition";
            "from" => ?self.phase,
            "to" => ?next,
        );
        self.phase = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn test_log() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    fn counting_machine(
    ) -> (PhaseStateMachine, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let votes = Arc::new(AtomicUsize::new(0));
        let signatures = Arc::new(AtomicUsize::new(0));
        let vote_hook = {
            let votes = Arc::clone(&votes);
            Box::new(move || {
                votes.fetch_add(1, Ordering::SeqCst);
            })
        };
        let signature_hook = {
            let signatures = Arc::clone(&signatures);
            Box::new(move || {
                signatures.fetch_add(1, Ordering::SeqCst);
            })
        };
        let machine = PhaseStateMachine::new(
            Duration::ZERO,
            vote_hook,
            signature_hook,
            &test_log(),
        )
        .unwrap();
        (machine, votes, signatures)
    }

    #[test]
    fn boundaries_are_ordered() {
        assert!(TIL_EXCHANGE < TIL_TABULATE);
        assert!(TIL_TABULATE < EPOCH_PERIOD);
    }

    #[test]
    fn initial_phase_follows_elapsed() {
        let new = |elapsed| {
            PhaseStateMachine::new(
                elapsed,
                Box::new(|| ()),
                Box::new(|| ()),
                &test_log(),
            )
        };
        assert_eq!(new(Duration::ZERO).unwrap().phase(), Phase::Wait);
        assert_eq!(
            new(TIL_EXCHANGE - Duration::from_secs(1)).unwrap().phase(),
            Phase::Wait
        );
        assert_eq!(new(TIL_EXCHANGE).unwrap().phase(), Phase::Exchange);
        assert_eq!(
            new(TIL_TABULATE - Duration::from_secs(1)).unwrap().phase(),
            Phase::Exchange
        );
        assert_eq!(new(TIL_TABULATE).unwrap().phase(), Phase::Tabulate);
        assert_eq!(new(EPOCH_PERIOD).unwrap().phase(), Phase::Tabulate);
        assert!(matches!(
            new(EPOCH_PERIOD + Duration::from_secs(1)),
            Err(PhaseError::ElapsedPastEpoch(_))
        ));
    }

    #[test]
    fn phases_cycle_and_hooks_fire_once_per_transition() {
        let (mut machine, votes, signatures) = counting_machine();
        let expected = [
            (Phase::Exchange, 1, 0),
            (Phase::Tabulate, 1, 1),
            (Phase::Wait, 1, 1),
            (Phase::Exchange, 2, 1),
            (Phase::Tabulate, 2, 2),
            (Phase::Wait, 2, 2),
            (Phase::Exchange, 3, 2),
            (Phase::Tabulate, 3, 3),
            (Phase::Wait, 3, 3),
        ];
        for (phase, vote_count, signature_count) in expected {
            machine.advance();
            assert_eq!(machine.phase(), phase);
            assert_eq!(votes.load(Ordering::SeqCst), vote_count);
            assert_eq!(signatures.load(Ordering::SeqCst), signature_count);
        }
    }

    #[test]
    fn mid_epoch_machine_skips_passed_boundaries() {
        let votes = Arc::new(AtomicUsize::new(0));
        let vote_hook = {
            let votes = Arc::clone(&votes);
            Box::new(move || {
                votes.fetch_add(1, Ordering::SeqCst);
            })
        };
        let mut machine = PhaseStateMachine::new(
            TIL_EXCHANGE + Duration::from_secs(60),
            vote_hook,
            Box::new(|| ()),
            &test_log(),
        )
        .unwrap();
        assert_eq!(machine.phase(), Phase::Exchange);
        // The Wait -> Exchange boundary already passed; the first advance
        // is Exchange -> Tabulate and must not fire the vote hook.
        machine.advance();
        assert_eq!(machine.phase(), Phase::Tabulate);
        assert_eq!(votes.load(Ordering::SeqCst), 0);
    }
}
