//! The message layer: one reliable-transmission state machine per exchange.
//!
//! The machine is sans-io: the caller feeds it inputs and the current
//! `Instant`, then drains the events it wants performed. Time and randomness
//! never come from ambient sources, so the retransmission schedule is fully
//! deterministic under test.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use log::{debug, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::message::header::MessageType;
use crate::message::packet::Packet;

/// Transmission tunables (RFC 7252 §4.8).
#[derive(Debug, Clone)]
pub struct TransmissionParameters {
    pub ack_timeout: Duration,
    pub ack_random_factor: f64,
    pub max_retransmit: u32,
    /// How long the application may sit on a confirmable request before the
    /// server side emits an empty ack and goes separate-response.
    pub processing_delay: Duration,
}

impl Default for TransmissionParameters {
    fn default() -> TransmissionParameters {
        TransmissionParameters {
            ack_timeout: Duration::from_millis(2000),
            ack_random_factor: 1.5,
            max_retransmit: 4,
            processing_delay: Duration::from_millis(1000),
        }
    }
}

impl TransmissionParameters {
    /// Upper bound on the time a reliable transmission can stay in flight.
    pub fn max_transmit_wait(&self) -> Duration {
        let spans = ((1u64 << (self.max_retransmit + 1)) - 1) as f64;
        self.ack_timeout.mul_f64(spans * self.ack_random_factor)
    }
}

/// Commands the request/response layer issues to an exchange.
#[derive(Debug, Clone)]
pub enum Command {
    /// Transmit a confirmable message and retry until acked, reset, or out
    /// of retransmissions.
    ReliableSend(Packet),
    /// Fire-and-forget a non-confirmable message.
    UnreliableSend(Packet),
    /// Answer the confirmable message currently awaiting an ack.
    Accept(Packet),
    /// Abandon the in-flight reliable transmission with this message-id.
    Cancel(u16),
}

/// One input consumed by the machine.
#[derive(Debug, Clone)]
pub enum Input {
    Command(Command),
    /// A decoded datagram from the peer, routed here by the endpoint.
    Recv(Packet),
}

/// What the machine asks its driver to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Write this message to the socket.
    Transmit(Packet),
    /// Write the cached confirmable again; carries the retries remaining.
    Retransmit(Packet, u32),
    /// Hand an inbound message up to the request/response layer.
    Deliver(Packet),
    /// The reliable transmission for this message-id is over, unanswered.
    Failed(u16, FailReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {
    /// The peer answered with a reset.
    Reset,
    /// Retransmissions were exhausted.
    Timeout,
}

#[derive(Debug)]
enum Phase {
    Closed,
    ReliableTx {
        message: Packet,
        retries_left: u32,
        timeout: Duration,
        deadline: Instant,
    },
    AckPending {
        message_id: u16,
    },
}

/// The per-exchange state machine.
///
/// Inputs that the current phase cannot consume are postponed on an explicit
/// queue and re-dispatched, in arrival order, after every phase change.
pub struct Exchange {
    phase: Phase,
    params: TransmissionParameters,
    deferred: VecDeque<Input>,
    events: VecDeque<Event>,
    rng: StdRng,
    generation: u64,
}

impl Exchange {
    pub fn new(params: TransmissionParameters) -> Exchange {
        Exchange::with_rng(params, StdRng::from_entropy())
    }

    /// Build with a caller-supplied rng so tests can pin the jitter.
    pub fn with_rng(params: TransmissionParameters, rng: StdRng) -> Exchange {
        assert!(params.ack_random_factor >= 1.0);
        Exchange {
            phase: Phase::Closed,
            params,
            deferred: VecDeque::new(),
            events: VecDeque::new(),
            rng,
            generation: 0,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.phase, Phase::Closed)
    }

    /// Feed one input and re-dispatch anything a phase change unblocked.
    pub fn handle(&mut self, now: Instant, input: Input) {
        self.dispatch(now, input);
        self.pump(now);
    }

    /// Next instant at which [`handle_timeout`](Self::handle_timeout) wants
    /// to run, if any timer is armed.
    pub fn poll_timeout(&self) -> Option<Instant> {
        match &self.phase {
            Phase::ReliableTx { deadline, .. } => Some(*deadline),
            _ => None,
        }
    }

    /// Drive the retransmission schedule.
    pub fn handle_timeout(&mut self, now: Instant) {
        let mut exhausted = None;
        if let Phase::ReliableTx {
            message,
            retries_left,
            timeout,
            deadline,
        } = &mut self.phase
        {
            if now < *deadline {
                return;
            }
            if *retries_left == 0 {
                exhausted = Some(message.header.message_id);
            } else {
                *retries_left -= 1;
                *timeout *= 2;
                *deadline = now + *timeout;
                let remaining = *retries_left;
                let again = message.clone();
                self.events.push_back(Event::Retransmit(again, remaining));
            }
        }
        if let Some(message_id) = exhausted {
            debug!("exchange: retransmissions exhausted for mid {}", message_id);
            self.events
                .push_back(Event::Failed(message_id, FailReason::Timeout));
            self.set_phase(Phase::Closed);
        }
        self.pump(now);
    }

    /// Drain the next pending event.
    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    fn set_phase(&mut self, next: Phase) {
        self.phase = next;
        self.generation += 1;
    }

    /// Re-dispatch postponed inputs until a full pass makes no phase change.
    /// Items postponed again keep their relative order.
    fn pump(&mut self, now: Instant) {
        let mut generation = self.generation;
        loop {
            if self.deferred.is_empty() {
                return;
            }
            let mut queue = std::mem::take(&mut self.deferred);
            while let Some(input) = queue.pop_front() {
                self.dispatch(now, input);
            }
            if self.generation == generation {
                return;
            }
            generation = self.generation;
        }
    }

    fn dispatch(&mut self, now: Instant, input: Input) {
        match input {
            Input::Command(Command::ReliableSend(message)) => self.on_reliable_send(now, message),
            Input::Command(Command::UnreliableSend(message)) => self.on_unreliable_send(message),
            Input::Command(Command::Accept(message)) => self.on_accept(message),
            Input::Command(Command::Cancel(message_id)) => self.on_cancel(message_id),
            Input::Recv(message) => self.on_recv(message),
        }
    }

    fn on_reliable_send(&mut self, now: Instant, message: Packet) {
        if !matches!(self.phase, Phase::Closed) {
            self.deferred
                .push_back(Input::Command(Command::ReliableSend(message)));
            return;
        }
        debug_assert_eq!(message.header.message_type, MessageType::Confirmable);
        let timeout = self.initial_timeout();
        self.events.push_back(Event::Transmit(message.clone()));
        let retries_left = self.params.max_retransmit;
        self.set_phase(Phase::ReliableTx {
            message,
            retries_left,
            timeout,
            deadline: now + timeout,
        });
    }

    fn on_unreliable_send(&mut self, message: Packet) {
        if !matches!(self.phase, Phase::Closed) {
            self.deferred
                .push_back(Input::Command(Command::UnreliableSend(message)));
            return;
        }
        self.events.push_back(Event::Transmit(message));
    }

    fn on_accept(&mut self, message: Packet) {
        let pending = match &self.phase {
            Phase::AckPending { message_id } => Some(*message_id),
            _ => None,
        };
        match pending {
            Some(message_id) if message_id == message.header.message_id => {
                self.events.push_back(Event::Transmit(message));
                self.set_phase(Phase::Closed);
            }
            Some(message_id) => {
                warn!(
                    "exchange: accept for mid {} while mid {} awaits its ack",
                    message.header.message_id, message_id
                );
            }
            None => {
                warn!(
                    "exchange: accept for mid {} with no ack pending",
                    message.header.message_id
                );
            }
        }
    }

    fn on_cancel(&mut self, message_id: u16) {
        let in_flight = match &self.phase {
            Phase::ReliableTx { message, .. } => Some(message.header.message_id),
            _ => None,
        };
        if in_flight == Some(message_id) {
            debug!("exchange: cancelled reliable send of mid {}", message_id);
            self.set_phase(Phase::Closed);
        } else {
            debug!("exchange: cancel for mid {} ignored", message_id);
        }
    }

    fn on_recv(&mut self, message: Packet) {
        // Snapshot the phase so transitions below stay borrow-free.
        enum At {
            Closed,
            ReliableTx(u16),
            AckPending,
        }
        let at = match &self.phase {
            Phase::Closed => At::Closed,
            Phase::ReliableTx { message, .. } => At::ReliableTx(message.header.message_id),
            Phase::AckPending { .. } => At::AckPending,
        };

        match at {
            At::Closed => match message.header.message_type {
                MessageType::Confirmable => {
                    let message_id = message.header.message_id;
                    self.events.push_back(Event::Deliver(message));
                    self.set_phase(Phase::AckPending { message_id });
                }
                MessageType::NonConfirmable => {
                    self.events.push_back(Event::Deliver(message));
                }
                MessageType::Acknowledgement | MessageType::Reset => {
                    // Duplicate of an already-consumed reply; receiving it
                    // again is a no-op.
                    debug!(
                        "exchange: stray {:?} for mid {} dropped",
                        message.header.message_type, message.header.message_id
                    );
                }
            },
            At::ReliableTx(our_mid) => match message.header.message_type {
                MessageType::Acknowledgement if message.header.message_id == our_mid => {
                    self.events.push_back(Event::Deliver(message));
                    self.set_phase(Phase::Closed);
                }
                MessageType::Reset if message.header.message_id == our_mid => {
                    self.events
                        .push_back(Event::Failed(our_mid, FailReason::Reset));
                    self.set_phase(Phase::Closed);
                }
                MessageType::NonConfirmable => {
                    // The reply outran the ack; stop retrying.
                    self.events.push_back(Event::Deliver(message));
                    self.set_phase(Phase::Closed);
                }
                _ => self.deferred.push_back(Input::Recv(message)),
            },
            At::AckPending => self.deferred.push_back(Input::Recv(message)),
        }
    }

    /// Uniform over `[ack_timeout, ack_timeout * ack_random_factor]`.
    fn initial_timeout(&mut self) -> Duration {
        let spread = self
            .params
            .ack_timeout
            .mul_f64(self.params.ack_random_factor - 1.0);
        self.params.ack_timeout + spread.mul_f64(self.rng.gen::<f64>())
    }
}

/// Message-id source for one exchange: random seed, then one step per
/// message, wrapping past 0xFFFF to 1.
#[derive(Debug)]
pub struct MessageIdGenerator {
    next: u16,
}

impl MessageIdGenerator {
    pub fn new<R: Rng>(rng: &mut R) -> MessageIdGenerator {
        MessageIdGenerator {
            next: rng.gen_range(1..=u16::MAX),
        }
    }

    pub fn next_id(&mut self) -> u16 {
        let id = self.next;
        self.next = match self.next.wrapping_add(1) {
            0 => 1,
            n => n,
        };
        id
    }
}

/// Convenience used where determinism is wanted without threading state.
pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::message::header::{MessageClass, RequestType, ResponseType};
    use std::time::{Duration, Instant};

    fn con_request(message_id: u16) -> Packet {
        let mut packet = Packet::new();
        packet.header.message_type = MessageType::Confirmable;
        packet.header.code = MessageClass::Request(RequestType::Get);
        packet.header.message_id = message_id;
        packet.set_token(vec![0x01, 0x02, 0x03, 0x04]);
        packet
    }

    fn ack_for(message_id: u16, payload: &[u8]) -> Packet {
        let mut packet = Packet::new();
        packet.header.message_type = MessageType::Acknowledgement;
        packet.header.code = MessageClass::Response(ResponseType::Content);
        packet.header.message_id = message_id;
        packet.set_token(vec![0x01, 0x02, 0x03, 0x04]);
        packet.payload = payload.to_vec();
        packet
    }

    fn fixed_params(ack_timeout_ms: u64, max_retransmit: u32) -> TransmissionParameters {
        TransmissionParameters {
            ack_timeout: Duration::from_millis(ack_timeout_ms),
            ack_random_factor: 1.0,
            max_retransmit,
            ..TransmissionParameters::default()
        }
    }

    fn exchange(params: TransmissionParameters) -> Exchange {
        Exchange::with_rng(params, seeded_rng(7))
    }

    fn drain(fsm: &mut Exchange) -> Vec<Event> {
        std::iter::from_fn(|| fsm.poll_event()).collect()
    }

    #[test]
    fn test_ack_completes_reliable_send() {
        let mut fsm = exchange(fixed_params(100, 4));
        let t0 = Instant::now();

        fsm.handle(t0, Input::Command(Command::ReliableSend(con_request(100))));
        assert!(matches!(drain(&mut fsm)[..], [Event::Transmit(_)]));

        fsm.handle(t0 + Duration::from_millis(20), Input::Recv(ack_for(100, b"hello")));
        let events = drain(&mut fsm);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], Event::Deliver(m) if m.payload == b"hello"));
        assert!(fsm.is_closed());

        // No retransmission can follow a delivered reply.
        assert_eq!(fsm.poll_timeout(), None);
        fsm.handle_timeout(t0 + Duration::from_secs(60));
        assert!(drain(&mut fsm).is_empty());
    }

    #[test]
    fn test_retransmit_schedule_and_timeout() {
        // 100 ms base, two retries, no jitter: sends at 0, 100, 300 and the
        // failure lands at 700.
        let mut fsm = exchange(fixed_params(100, 2));
        let t0 = Instant::now();

        fsm.handle(t0, Input::Command(Command::ReliableSend(con_request(42))));
        assert!(matches!(drain(&mut fsm)[..], [Event::Transmit(_)]));
        assert_eq!(fsm.poll_timeout(), Some(t0 + Duration::from_millis(100)));

        fsm.handle_timeout(t0 + Duration::from_millis(100));
        let events = drain(&mut fsm);
        assert!(matches!(events[..], [Event::Retransmit(_, 1)]));
        assert_eq!(fsm.poll_timeout(), Some(t0 + Duration::from_millis(300)));

        fsm.handle_timeout(t0 + Duration::from_millis(300));
        let events = drain(&mut fsm);
        assert!(matches!(events[..], [Event::Retransmit(_, 0)]));
        assert_eq!(fsm.poll_timeout(), Some(t0 + Duration::from_millis(700)));

        fsm.handle_timeout(t0 + Duration::from_millis(700));
        let events = drain(&mut fsm);
        assert_eq!(events, vec![Event::Failed(42, FailReason::Timeout)]);
        assert!(fsm.is_closed());
        assert_eq!(fsm.poll_timeout(), None);
    }

    #[test]
    fn test_early_timeout_poll_is_harmless() {
        let mut fsm = exchange(fixed_params(100, 2));
        let t0 = Instant::now();
        fsm.handle(t0, Input::Command(Command::ReliableSend(con_request(42))));
        drain(&mut fsm);

        fsm.handle_timeout(t0 + Duration::from_millis(50));
        assert!(drain(&mut fsm).is_empty());
        assert_eq!(fsm.poll_timeout(), Some(t0 + Duration::from_millis(100)));
    }

    #[test]
    fn test_reset_fails_exchange() {
        let mut fsm = exchange(fixed_params(100, 4));
        let t0 = Instant::now();
        fsm.handle(t0, Input::Command(Command::ReliableSend(con_request(9))));
        drain(&mut fsm);

        fsm.handle(t0 + Duration::from_millis(10), Input::Recv(Packet::reset(9)));
        assert_eq!(drain(&mut fsm), vec![Event::Failed(9, FailReason::Reset)]);
        assert!(fsm.is_closed());
    }

    #[test]
    fn test_duplicate_ack_is_noop() {
        let mut fsm = exchange(fixed_params(100, 4));
        let t0 = Instant::now();
        fsm.handle(t0, Input::Command(Command::ReliableSend(con_request(5))));
        drain(&mut fsm);

        fsm.handle(t0, Input::Recv(ack_for(5, b"x")));
        assert_eq!(drain(&mut fsm).len(), 1);

        fsm.handle(t0, Input::Recv(ack_for(5, b"x")));
        assert!(drain(&mut fsm).is_empty());
        assert!(fsm.is_closed());
    }

    #[test]
    fn test_mismatched_ack_postponed_not_consumed() {
        let mut fsm = exchange(fixed_params(100, 4));
        let t0 = Instant::now();
        fsm.handle(t0, Input::Command(Command::ReliableSend(con_request(5))));
        drain(&mut fsm);

        // An ack for some other mid must not complete this transmission.
        fsm.handle(t0, Input::Recv(ack_for(77, b"stale")));
        assert!(drain(&mut fsm).is_empty());
        assert!(!fsm.is_closed());

        // The matching ack still lands; the postponed stray is then
        // reprocessed in closed and dropped.
        fsm.handle(t0, Input::Recv(ack_for(5, b"fresh")));
        let events = drain(&mut fsm);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], Event::Deliver(m) if m.payload == b"fresh"));
        assert!(fsm.is_closed());
    }

    #[test]
    fn test_second_reliable_send_postponed() {
        let mut fsm = exchange(fixed_params(100, 4));
        let t0 = Instant::now();
        fsm.handle(t0, Input::Command(Command::ReliableSend(con_request(1))));
        drain(&mut fsm);

        fsm.handle(t0, Input::Command(Command::ReliableSend(con_request(2))));
        assert!(drain(&mut fsm).is_empty());

        fsm.handle(t0, Input::Recv(ack_for(1, b"")));
        let events = drain(&mut fsm);
        // The first transmission completes and the postponed send starts.
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], Event::Deliver(_)));
        assert!(matches!(&events[1], Event::Transmit(m) if m.header.message_id == 2));
        assert_eq!(fsm.poll_timeout(), Some(t0 + Duration::from_millis(100)));
    }

    #[test]
    fn test_cancel_is_silent() {
        let mut fsm = exchange(fixed_params(100, 4));
        let t0 = Instant::now();
        fsm.handle(t0, Input::Command(Command::ReliableSend(con_request(30))));
        drain(&mut fsm);

        fsm.handle(t0, Input::Command(Command::Cancel(31)));
        assert!(!fsm.is_closed());

        fsm.handle(t0, Input::Command(Command::Cancel(30)));
        assert!(fsm.is_closed());
        assert!(drain(&mut fsm).is_empty());
        fsm.handle_timeout(t0 + Duration::from_secs(10));
        assert!(drain(&mut fsm).is_empty());
    }

    #[test]
    fn test_inbound_con_acked_via_accept() {
        let mut fsm = exchange(fixed_params(100, 4));
        let t0 = Instant::now();

        let request = con_request(700);
        fsm.handle(t0, Input::Recv(request));
        let events = drain(&mut fsm);
        assert!(matches!(events[..], [Event::Deliver(_)]));
        assert!(!fsm.is_closed());

        let mut reply = ack_for(700, b"done");
        reply.header.message_id = 700;
        fsm.handle(t0, Input::Command(Command::Accept(reply)));
        let events = drain(&mut fsm);
        assert!(matches!(&events[..], [Event::Transmit(m)] if m.header.message_id == 700));
        assert!(fsm.is_closed());
    }

    #[test]
    fn test_recv_during_ack_pending_postponed() {
        let mut fsm = exchange(fixed_params(100, 4));
        let t0 = Instant::now();

        fsm.handle(t0, Input::Recv(con_request(700)));
        drain(&mut fsm);

        // A second confirmable cannot be delivered until the first is acked.
        fsm.handle(t0, Input::Recv(con_request(701)));
        assert!(drain(&mut fsm).is_empty());

        fsm.handle(t0, Input::Command(Command::Accept(Packet::empty_ack(700))));
        let events = drain(&mut fsm);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], Event::Transmit(_)));
        assert!(matches!(&events[1], Event::Deliver(m) if m.header.message_id == 701));
    }

    #[test]
    fn test_initial_timeout_within_jitter_window() {
        for seed in 0..32 {
            let params = TransmissionParameters {
                ack_timeout: Duration::from_millis(2000),
                ack_random_factor: 1.5,
                ..TransmissionParameters::default()
            };
            let mut fsm = Exchange::with_rng(params, seeded_rng(seed));
            let t0 = Instant::now();
            fsm.handle(t0, Input::Command(Command::ReliableSend(con_request(1))));
            let deadline = fsm.poll_timeout().unwrap();
            let timeout = deadline - t0;
            assert!(timeout >= Duration::from_millis(2000), "{:?}", timeout);
            assert!(timeout <= Duration::from_millis(3000), "{:?}", timeout);
        }
    }

    #[test]
    fn test_max_transmit_wait() {
        let params = fixed_params(100, 2);
        assert_eq!(params.max_transmit_wait(), Duration::from_millis(700));

        let defaults = TransmissionParameters::default();
        // 2000 ms * 31 * 1.5
        assert_eq!(defaults.max_transmit_wait(), Duration::from_millis(93_000));
    }

    #[test]
    fn test_message_id_generator_wraps_to_one() {
        let mut generator = MessageIdGenerator { next: 0xFFFE };
        assert_eq!(generator.next_id(), 0xFFFE);
        assert_eq!(generator.next_id(), 0xFFFF);
        assert_eq!(generator.next_id(), 1);
        assert_eq!(generator.next_id(), 2);
    }

    #[test]
    fn test_message_id_generator_is_sequential() {
        let mut rng = seeded_rng(3);
        let mut generator = MessageIdGenerator::new(&mut rng);
        let first = generator.next_id();
        let second = generator.next_id();
        if first != 0xFFFF {
            assert_eq!(second, first.wrapping_add(1));
        } else {
            assert_eq!(second, 1);
        }
    }
}
