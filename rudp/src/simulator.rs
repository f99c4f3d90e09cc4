//! Network fault injection for deterministic testing.
//!
//! Real networks drop, reorder, and duplicate packets.  To exercise the
//! reliability mechanisms without depending on actual network conditions,
//! a [`Simulator`] sits between an engine and the wire and applies a fault
//! model to every outbound datagram:
//!
//! | Fault            | Description                                          |
//! |------------------|------------------------------------------------------|
//! | Packet loss      | Drop a datagram with probability `loss_rate`.        |
//! | Duplication      | Deliver a datagram twice.                            |
//! | Reordering       | Hold a datagram back until the next one has passed.  |
//! | Scripted rules   | Drop or duplicate the next N datagrams of one type.  |
//!
//! Random faults draw from a [`StdRng`] seeded from [`SimulatorConfig::seed`]
//! so a failing run can be replayed exactly.  Scripted rules are checked
//! before the random model and make single-fault scenarios ("lose the first
//! DATA segment") independent of the seed.
//!
//! A simulator can be attached to a [`crate::socket::Socket`] or driven
//! directly in memory, where tests route the returned datagrams themselves.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::engine::Transmit;
use crate::packet::{peek_type, PacketType};

/// Configuration for the random fault model.
///
/// All probabilities are in the range `[0.0, 1.0]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatorConfig {
    /// Probability that any given datagram is silently dropped.
    pub loss_rate: f64,
    /// Probability that a datagram is delivered twice.
    pub duplicate_rate: f64,
    /// Probability that a datagram is held back behind the next one.
    pub reorder_rate: f64,
    pub seed: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        // No faults by default; the simulator is a transparent pass-through.
        Self {
            loss_rate: 0.0,
            duplicate_rate: 0.0,
            reorder_rate: 0.0,
            seed: 0,
        }
    }
}

/// What a scripted rule does to a matching datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Drop,
    Duplicate,
}

/// Apply `fault` to the next `remaining` datagrams of type `kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultRule {
    pub kind: PacketType,
    pub fault: Fault,
    pub remaining: usize,
}

/// Counters of what the simulator did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimulatorStats {
    pub passed: u64,
    pub dropped: u64,
    pub duplicated: u64,
    pub reordered: u64,
}

/// A seeded fault injector for outbound datagrams.
#[derive(Debug)]
pub struct Simulator {
    config: SimulatorConfig,
    rng: StdRng,
    rules: Vec<FaultRule>,
    held: Option<Transmit>,
    stats: SimulatorStats,
}

impl Simulator {
    pub fn new(config: SimulatorConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            rng,
            rules: Vec::new(),
            held: None,
            stats: SimulatorStats::default(),
        }
    }

    /// A simulator with no random faults, only scripted rules.
    pub fn scripted() -> Self {
        Self::new(SimulatorConfig::default())
    }

    /// Drop the next `times` datagrams of type `kind`.
    pub fn drop_next(mut self, kind: PacketType, times: usize) -> Self {
        self.add_rule(FaultRule {
            kind,
            fault: Fault::Drop,
            remaining: times,
        });
        self
    }

    /// Duplicate the next `times` datagrams of type `kind`.
    pub fn duplicate_next(mut self, kind: PacketType, times: usize) -> Self {
        self.add_rule(FaultRule {
            kind,
            fault: Fault::Duplicate,
            remaining: times,
        });
        self
    }

    pub fn add_rule(&mut self, rule: FaultRule) {
        if rule.remaining > 0 {
            self.rules.push(rule);
        }
    }

    pub fn stats(&self) -> SimulatorStats {
        self.stats
    }

    /// Run one outbound datagram through the fault model.
    ///
    /// Returns the datagrams that actually reach the network, in delivery
    /// order: none if it was lost, two if it was duplicated, and possibly a
    /// previously held datagram after it.
    pub fn transmit(&mut self, datagram: Transmit) -> Vec<Transmit> {
        let kind = peek_type(&datagram.bytes);
        let mut out = Vec::with_capacity(2);

        match self.scripted_fault(kind) {
            Some(Fault::Drop) => {
                self.stats.dropped += 1;
                log::debug!("[sim] scripted drop of {:?} to {}", kind, datagram.dest);
                return self.release_held(out);
            }
            Some(Fault::Duplicate) => {
                self.stats.duplicated += 1;
                out.push(datagram.clone());
                out.push(datagram);
                return self.release_held(out);
            }
            None => {}
        }

        if self.roll(self.config.loss_rate) {
            self.stats.dropped += 1;
            log::debug!("[sim] lost {:?} to {}", kind, datagram.dest);
            return self.release_held(out);
        }
        if self.held.is_none() && self.roll(self.config.reorder_rate) {
            self.stats.reordered += 1;
            self.held = Some(datagram);
            return out;
        }
        if self.roll(self.config.duplicate_rate) {
            self.stats.duplicated += 1;
            out.push(datagram.clone());
        }
        self.stats.passed += 1;
        out.push(datagram);
        self.release_held(out)
    }

    /// Release a datagram still held for reordering.
    pub fn flush(&mut self) -> Option<Transmit> {
        self.held.take()
    }

    fn release_held(&mut self, mut out: Vec<Transmit>) -> Vec<Transmit> {
        if let Some(held) = self.held.take() {
            out.push(held);
        }
        out
    }

    fn scripted_fault(&mut self, kind: Option<PacketType>) -> Option<Fault> {
        let kind = kind?;
        let rule = self.rules.iter_mut().find(|r| r.kind == kind)?;
        rule.remaining -= 1;
        let fault = rule.fault;
        self.rules.retain(|r| r.remaining > 0);
        Some(fault)
    }

    fn roll(&mut self, probability: f64) -> bool {
        probability > 0.0 && self.rng.random::<f64>() < probability
    }
}
