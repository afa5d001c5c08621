//! Handler verdicts and how they map to broker acknowledgments.

use peril_broker::{Acknowledger, BrokerError, Delivery};

/// What a handler wants the broker to do with the message it was given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckType {
    /// Processed; remove it from the queue.
    Ack,
    /// Recoverable failure; put it back at the head of the queue.
    NackRequeue,
    /// Malformed or invalid; remove it without processing. The queue's
    /// dead-letter exchange receives it.
    NackDiscard,
}

impl AckType {
    /// Sends the matching acknowledgment for `delivery`.
    pub async fn resolve<A: Acknowledger>(
        self,
        delivery: &Delivery<A>,
    ) -> Result<(), BrokerError> {
        match self {
            Self::Ack => delivery.ack().await,
            Self::NackRequeue => delivery.nack(true).await,
            Self::NackDiscard => delivery.nack(false).await,
        }
    }
}

/// Counters kept by a subscription's dispatch loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub acked: u64,
    pub requeued: u64,
    /// Includes every decode failure.
    pub discarded: u64,
    pub decode_failures: u64,
}

impl DispatchStats {
    pub(crate) fn record(&mut self, decision: AckType) {
        match decision {
            AckType::Ack => self.acked += 1,
            AckType::NackRequeue => self.requeued += 1,
            AckType::NackDiscard => self.discarded += 1,
        }
    }

    /// Counts a delivery that failed to decode and was discarded.
    pub(crate) fn record_undecodable(&mut self) {
        self.record(AckType::NackDiscard);
        self.decode_failures += 1;
    }

    /// Total deliveries resolved.
    pub fn total(&self) -> u64 {
        self.acked + self.requeued + self.discarded
    }
}
