use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;

use super::protocol::{ACK_WINDOW, Message, sequence_greater_than};

const RTT_SAMPLES: usize = 32;

#[derive(Debug, Clone)]
pub struct SentDatagram {
    pub sequence: u32,
    pub send_time: Instant,
    pub payloads: Vec<Bytes>,
}

#[derive(Debug, Default)]
pub struct AckOutcome {
    pub acked: Vec<SentDatagram>,
    pub lost: Vec<SentDatagram>,
}

/// Datagrams sent but not yet acknowledged or declared lost, oldest first.
#[derive(Debug, Default)]
pub struct SendWindow {
    pending: VecDeque<SentDatagram>,
}

impl SendWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, sequence: u32, send_time: Instant, payloads: Vec<Bytes>) {
        self.pending.push_back(SentDatagram {
            sequence,
            send_time,
            payloads,
        });
    }

    /// Removes every entry sent more than `timeout` before `now`.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<SentDatagram> {
        let mut expired = Vec::new();
        self.pending.retain(|sent| {
            if now.saturating_duration_since(sent.send_time) > timeout {
                expired.push(sent.clone());
                false
            } else {
                true
            }
        });
        expired
    }

    /// Resolves pending entries against the ack window carried by `message`.
    ///
    /// Entries inside the window are acked or lost depending on their bit, entries
    /// that fell out of the back of the window are lost, newer ones stay pending.
    pub fn process_ack(&mut self, message: &Message) -> AckOutcome {
        let mut outcome = AckOutcome::default();

        self.pending.retain(|sent| {
            if sequence_greater_than(sent.sequence, message.ack) {
                return true;
            }
            if message.is_acked(sent.sequence) {
                outcome.acked.push(sent.clone());
            } else {
                outcome.lost.push(sent.clone());
            }
            false
        });

        outcome
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Reception history of the last 32 remote sequence numbers, newest last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveWindow {
    entries: VecDeque<bool>,
}

impl Default for ReceiveWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiveWindow {
    pub fn new() -> Self {
        Self {
            entries: std::iter::repeat_n(false, ACK_WINDOW as usize).collect(),
        }
    }

    pub fn from_bitfield(bitfield: u32) -> Self {
        let mut window = Self::new();
        for (slot, entry) in window.entries.iter_mut().enumerate() {
            let age = ACK_WINDOW as usize - 1 - slot;
            *entry = bitfield & (1 << age) != 0;
        }
        window
    }

    pub fn push(&mut self, received: bool) {
        self.entries.pop_front();
        self.entries.push_back(received);
    }

    /// Moves the window forward by `difference` sequence numbers, marking the
    /// skipped ones missing and the newest one `received`.
    pub fn advance(&mut self, difference: u64, received: bool) {
        let skipped = difference.saturating_sub(1).min(ACK_WINDOW as u64);
        for _ in 0..skipped {
            self.push(false);
        }
        self.push(received);
    }

    /// Bit `i` is set when the entry `i` places behind the newest was received.
    pub fn bitfield(&self) -> u32 {
        self.entries
            .iter()
            .rev()
            .enumerate()
            .filter(|(_, received)| **received)
            .fold(0, |bits, (age, _)| bits | (1 << age))
    }

    pub fn entries(&self) -> impl Iterator<Item = bool> + '_ {
        self.entries.iter().copied()
    }
}

#[derive(Debug, Default)]
pub struct RttSamples {
    samples: VecDeque<u64>,
}

impl RttSamples {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(RTT_SAMPLES),
        }
    }

    pub fn record(&mut self, rtt_ms: u64) {
        while self.samples.len() >= RTT_SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back(rtt_ms);
    }

    /// Mean of the retained samples in milliseconds, zero before the first one.
    pub fn average_ms(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<u64>() as f64 / self.samples.len() as f64
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::protocol::PROTOCOL_ID;

    #[test]
    fn test_receive_window_bitfield() {
        let mut window = ReceiveWindow::new();

        window.push(true);
        window.push(true);
        window.push(true);

        assert_eq!(window.bitfield(), 0b111);
    }

    #[test]
    fn test_receive_window_gap() {
        let mut window = ReceiveWindow::new();

        window.push(true);
        window.advance(3, true);

        assert_eq!(window.bitfield(), 0b1001);
    }

    #[test]
    fn test_receive_window_large_jump_clears_history() {
        let mut window = ReceiveWindow::from_bitfield(u32::MAX);
        window.advance(1_000, true);
        assert_eq!(window.bitfield(), 1);
    }

    #[test]
    fn test_bitfield_round_trip() {
        for bitfield in [0, 1, 0x8000_0000, 0xDEAD_BEEF, u32::MAX] {
            assert_eq!(ReceiveWindow::from_bitfield(bitfield).bitfield(), bitfield);
        }
    }

    #[test]
    fn test_send_window_resolves_acks() {
        let now = Instant::now();
        let mut window = SendWindow::new();
        for sequence in 0..4 {
            window.track(sequence, now, vec![Bytes::from(vec![sequence as u8])]);
        }

        // Remote saw 2 and 0, missed 1, has not seen 3 yet.
        let ack = Message::new(PROTOCOL_ID, 0, 2, 0b101);
        let outcome = window.process_ack(&ack);

        let acked: Vec<u32> = outcome.acked.iter().map(|s| s.sequence).collect();
        let lost: Vec<u32> = outcome.lost.iter().map(|s| s.sequence).collect();
        assert_eq!(acked, vec![0, 2]);
        assert_eq!(lost, vec![1]);
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn test_send_window_drops_entries_behind_window() {
        let now = Instant::now();
        let mut window = SendWindow::new();
        window.track(10, now, Vec::new());

        let ack = Message::new(PROTOCOL_ID, 0, 42, u32::MAX);
        let outcome = window.process_ack(&ack);
        assert_eq!(outcome.lost.len(), 1);
        assert!(window.is_empty());
    }

    #[test]
    fn test_send_window_expiry() {
        let start = Instant::now();
        let mut window = SendWindow::new();
        window.track(1, start, Vec::new());
        window.track(2, start + Duration::from_millis(600), Vec::new());

        let expired = window.expire(start + Duration::from_millis(1_100), Duration::from_secs(1));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].sequence, 1);
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn test_rtt_ring_keeps_latest_samples() {
        let mut rtt = RttSamples::new();
        assert_eq!(rtt.average_ms(), 0.0);

        for _ in 0..32 {
            rtt.record(1_000);
        }
        for _ in 0..32 {
            rtt.record(10);
        }

        assert_eq!(rtt.len(), 32);
        assert_eq!(rtt.average_ms(), 10.0);
    }
}
