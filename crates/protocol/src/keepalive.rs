//! Tunnel liveness timers
//!
//! Decides, from the last send/receive/rekey times, whether the data
//! channel owes the gateway a rekey, a dead-peer probe or a keepalive, and
//! how long it may sleep before asking again. A zero interval disables the
//! corresponding timer.

use std::time::{Duration, Instant};

/// What the data channel should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveAction {
    None,
    Rekey,
    /// Send a dead-peer probe
    Dpd,
    /// No traffic from the peer for twice the probe interval
    DpdDead,
    Keepalive,
}

/// Intervals and last-activity timestamps of a live tunnel
#[derive(Debug, Clone)]
pub struct KeepaliveState {
    pub dpd: Duration,
    pub keepalive: Duration,
    pub rekey: Duration,

    pub last_rx: Instant,
    pub last_tx: Instant,
    pub last_rekey: Instant,
    pub last_dpd: Instant,
}

impl KeepaliveState {
    pub fn new(dpd: Duration, keepalive: Duration, rekey: Duration, now: Instant) -> Self {
        Self {
            dpd,
            keepalive,
            rekey,
            last_rx: now,
            last_tx: now,
            last_rekey: now,
            last_dpd: now,
        }
    }

    pub fn record_rx(&mut self, now: Instant) {
        self.last_rx = now;
    }

    pub fn record_tx(&mut self, now: Instant) {
        self.last_tx = now;
    }

    pub fn record_rekey(&mut self, now: Instant) {
        self.last_rekey = now;
    }

    /// Next action for an active channel
    ///
    /// `timeout` is lowered to the time left until the nearest pending
    /// deadline. Returning `Dpd` records `now` as the last probe time.
    /// A deadline too far out to represent is never due.
    pub fn keepalive_action(&mut self, now: Instant, timeout: &mut Duration) -> KeepaliveAction {
        if let Some(action) = self.check_rekey(now, timeout) {
            return action;
        }

        if !self.dpd.is_zero() {
            if self.dpd_overdue().is_some_and(|overdue| now > overdue) {
                return KeepaliveAction::DpdDead;
            }

            // A probe is already outstanding: repeat only after half a period
            let due = if self.last_dpd > self.last_rx {
                deadline(self.last_dpd, self.dpd / 2)
            } else {
                deadline(self.last_rx, self.dpd)
            };
            if let Some(due) = due {
                if now >= due {
                    self.last_dpd = now;
                    return KeepaliveAction::Dpd;
                }
                tighten(timeout, due - now);
            }
        }

        if !self.keepalive.is_zero() {
            if let Some(due) = deadline(self.last_tx, self.keepalive) {
                if now >= due {
                    return KeepaliveAction::Keepalive;
                }
                tighten(timeout, due - now);
            }
        }

        KeepaliveAction::None
    }

    /// Next action for a channel that cannot currently send
    ///
    /// Only rekey and dead-peer detection apply.
    pub fn stalled_action(&self, now: Instant, timeout: &mut Duration) -> KeepaliveAction {
        if let Some(action) = self.check_rekey(now, timeout) {
            return action;
        }

        if self.dpd.is_zero() {
            return KeepaliveAction::None;
        }

        let Some(due) = self.dpd_overdue() else {
            return KeepaliveAction::None;
        };
        if now > due {
            return KeepaliveAction::DpdDead;
        }
        tighten(timeout, due - now);
        KeepaliveAction::None
    }

    /// When the peer counts as dead: two probe intervals after the last receive
    fn dpd_overdue(&self) -> Option<Instant> {
        self.dpd
            .checked_mul(2)
            .and_then(|window| deadline(self.last_rx, window))
    }

    fn check_rekey(&self, now: Instant, timeout: &mut Duration) -> Option<KeepaliveAction> {
        if self.rekey.is_zero() {
            return None;
        }
        let due = deadline(self.last_rekey, self.rekey)?;
        if now >= due {
            return Some(KeepaliveAction::Rekey);
        }
        tighten(timeout, due - now);
        None
    }
}

fn deadline(from: Instant, after: Duration) -> Option<Instant> {
    from.checked_add(after)
}

fn tighten(timeout: &mut Duration, left: Duration) {
    if *timeout > left {
        *timeout = left;
    }
}
