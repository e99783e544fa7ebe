// Copyright 2019-2022 Subi Platform developers
// SPDX-License-Identifier: Apache-2.0, MIT

use subi_types::BlockHeight;

/// Observer notifications fanned out to the periodic tier components.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TierEvent {
    /// The active chain advanced to a new tip.
    TipUpdated(BlockHeight),
    /// A subinode list entry was received or refreshed.
    SubinodeListUpdated,
    /// A payment vote was accepted.
    PaymentVoteAdded,
}

/// Lightweight broadcast channel for [`TierEvent`]s. Producers clone the
/// bus; the scheduler drains the receiver once per tick.
#[derive(Clone)]
pub struct EventBus {
    sender: flume::Sender<TierEvent>,
}

impl EventBus {
    pub fn new() -> (EventBus, flume::Receiver<TierEvent>) {
        let (sender, receiver) = flume::unbounded();
        (EventBus { sender }, receiver)
    }

    /// Never blocks; a dropped receiver silently discards events.
    pub fn emit(&self, event: TierEvent) {
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_delivered_in_order() {
        let (bus, rx) = EventBus::new();
        bus.emit(TierEvent::TipUpdated(7));
        bus.emit(TierEvent::SubinodeListUpdated);
        assert_eq!(rx.try_recv().unwrap(), TierEvent::TipUpdated(7));
        assert_eq!(rx.try_recv().unwrap(), TierEvent::SubinodeListUpdated);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn emit_without_receiver_is_a_no_op() {
        let (bus, rx) = EventBus::new();
        drop(rx);
        bus.emit(TierEvent::PaymentVoteAdded);
    }
}
