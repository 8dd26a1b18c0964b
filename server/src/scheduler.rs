// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Epoch-aligned wake-ups for the phase state machine.
//!
//! The scheduler converts clock positions into an ordered set of boundary
//! timers (exchange, tabulate, epoch end) and ticks the state machine
//! exactly once per expired timer. Timers are computed from a single clock
//! observation per epoch; a boundary that already passed before the
//! observation is omitted, because the state machine's initial phase
//! already accounts for it.

use dirauth_common::epochtime::EpochClock;
use slog::{debug, info, Logger};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{self, Instant};

use crate::state_machine::{StateMachine, TIL_EXCHANGE, TIL_TABULATE};

pub struct EpochScheduler {
    clock: Arc<dyn EpochClock>,
    log: Logger,
}

impl EpochScheduler {
    pub fn new(clock: Arc<dyn EpochClock>, log: &Logger) -> Self {
        Self { clock, log: log.new(slog::o!("component" => "scheduler")) }
    }

    /// Drives `machine` until `shutdown` flips to true, re-reading the
    /// clock at each epoch so successive epochs stay aligned.
    pub async fn run<M: StateMachine>(
        &self,
        machine: &mut M,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(self.log, "epoch scheduler running");
        while !*shutdown.borrow_and_update() {
            if !self.run_once(machine, &mut shutdown).await {
                break;
            }
        }
        info!(self.log, "epoch scheduler stopped");
    }

    /// Sleeps through the remaining phase boundaries of the current epoch,
    /// advancing `machine` at each one in order. Returns false if shutdown
    /// was observed mid-wait.
    pub async fn run_once<M: StateMachine>(
        &self,
        machine: &mut M,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        let position = self.clock.now();
        let mut waits = Vec::with_capacity(3);
        if position.elapsed < TIL_EXCHANGE {
            waits.push(TIL_EXCHANGE - position.elapsed);
        }
        if position.elapsed < TIL_TABULATE {
            waits.push(TIL_TABULATE - position.elapsed);
        }
        waits.push(position.remaining);
        debug!(
            self.log, "scheduling phase boundaries";
            "epoch" => %position.epoch,
            "boundaries" => waits.len(),
        );
        let start = Instant::now();
        for wait in waits {
            tokio::select! {
                _ = time::sleep_until(start + wait) => machine.advance(),
                _ = shutdown.wait_for(|stop| *stop) => return false,
            }
        }
        true
    }
}
