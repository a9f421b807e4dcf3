//! Deterministic clock and bus doubles.
//!
//! Real contention needs co-resident processes and real wall time. These
//! doubles let the sampler, the discovery protocol and the covert channel run
//! in a single thread against a clock that advances by a fixed step per
//! reading, and a bus whose latency is a function of that clock.

use std::cell::{Cell, RefCell};

use crate::bus::Bus;
use crate::config::MAX_ID_BITS;
use crate::discovery::{BitAction, DiscoveryConfig, Participant, PhaseEnd};
use crate::scheduler::{Clock, Micros};

// ---------------------------------------------------------------------------
// SimClock
// ---------------------------------------------------------------------------

/// A clock that advances by `step` microseconds every time it is read.
///
/// A stall `[from, to)` models a descheduled process: a reading that falls
/// inside it returns `to` instead.
#[derive(Debug)]
pub struct SimClock {
    now: Cell<Micros>,
    step: Micros,
    stalls: Vec<(Micros, Micros)>,
}

impl SimClock {
    pub fn new(start: Micros, step: Micros) -> Self {
        Self {
            now: Cell::new(start),
            step,
            stalls: Vec::new(),
        }
    }

    pub fn with_stall(mut self, from: Micros, to: Micros) -> Self {
        self.stalls.push((from, to));
        self
    }

    /// Current time, without advancing.
    pub fn peek(&self) -> Micros {
        self.now.get()
    }

    pub fn advance(&self, by: Micros) {
        self.now.set(self.now.get() + by);
    }
}

impl Clock for SimClock {
    fn now_us(&self) -> Micros {
        let mut t = self.now.get();
        if let Some(&(_, to)) = self.stalls.iter().find(|(from, to)| (*from..*to).contains(&t)) {
            t = to;
        }
        self.now.set(t + self.step);
        t
    }
}

// ---------------------------------------------------------------------------
// WindowBus
// ---------------------------------------------------------------------------

/// A bus that is contended during fixed time windows.
///
/// Every atomic op costs `high` cycles while [`SimClock::peek`] lies inside one
/// of the windows and `low` cycles otherwise. Bus operations never read the
/// clock through [`Clock::now_us`], so they do not advance it.
#[derive(Debug)]
pub struct WindowBus<'a> {
    clock: &'a SimClock,
    low: u64,
    high: u64,
    windows: Vec<(Micros, Micros)>,
    ops: Cell<u64>,
    probe_times: RefCell<Vec<Micros>>,
}

impl<'a> WindowBus<'a> {
    pub fn new(clock: &'a SimClock, low: u64, high: u64, windows: Vec<(Micros, Micros)>) -> Self {
        Self {
            clock,
            low,
            high,
            windows,
            ops: Cell::new(0),
            probe_times: RefCell::new(Vec::new()),
        }
    }

    /// Total atomic ops issued so far.
    pub fn ops(&self) -> u64 {
        self.ops.get()
    }

    /// Clock readings at which [`Bus::probe`] ran.
    pub fn probe_times(&self) -> Vec<Micros> {
        self.probe_times.borrow().clone()
    }

    fn op_cost(&self) -> u64 {
        let t = self.clock.peek();
        if self.windows.iter().any(|&(from, to)| (from..to).contains(&t)) {
            self.high
        } else {
            self.low
        }
    }
}

impl Bus for WindowBus<'_> {
    fn probe(&self) -> u64 {
        self.probe_times.borrow_mut().push(self.clock.peek());
        self.ops.set(self.ops.get() + 1);
        self.op_cost()
    }

    fn timed_batch(&self, ops: usize) -> u64 {
        self.ops.set(self.ops.get() + ops as u64);
        self.op_cost() * ops as u64
    }

    fn hammer(&self, ops: usize) {
        self.ops.set(self.ops.get() + ops as u64);
    }
}

// ---------------------------------------------------------------------------
// Lockstep discovery
// ---------------------------------------------------------------------------

/// Run discovery for `ids` in lockstep on an ideal OR bus.
///
/// In every bit interval the bus reads 1 iff at least one participant writes.
/// `max_phases == 0` runs until convergence and `max_bits` is clamped to
/// [`MAX_ID_BITS`]. Returns the final participant states in input order.
pub fn simulate_discovery(
    ids: &[u32],
    max_bits: u32,
    max_phases: u32,
    repeat_phases: bool,
) -> Vec<Participant> {
    let max_bits = max_bits.min(MAX_ID_BITS);
    let limit = DiscoveryConfig {
        max_bits,
        max_phases,
        repeat_phases,
        bit_duration_us: 0,
        retain_samples: false,
    }
    .phase_limit();

    let mut participants: Vec<Participant> = ids
        .iter()
        .map(|&id| Participant::new(id, max_bits, repeat_phases))
        .collect();
    let mut active = vec![true; participants.len()];

    for _ in 0..limit {
        if !active.iter().any(|&a| a) {
            break;
        }
        for (p, _) in participants.iter_mut().zip(&active).filter(|(_, a)| **a) {
            p.begin_phase();
        }
        for position in (0..max_bits).rev() {
            let bus = participants
                .iter()
                .zip(&active)
                .any(|(p, &a)| a && p.action(position) == BitAction::Write);
            for (p, _) in participants.iter_mut().zip(&active).filter(|(_, a)| **a) {
                let read = match p.action(position) {
                    BitAction::Write => true,
                    BitAction::Listen => bus,
                };
                p.record(position, read);
            }
        }
        for (p, a) in participants.iter_mut().zip(active.iter_mut()) {
            if *a && p.end_phase() == PhaseEnd::Converged {
                *a = false;
            }
        }
    }
    participants
}
