//! QoS 2 acknowledgement tracking
//!
//! rumqttc hands out packet ids only when a publish leaves the event loop, so
//! a caller cannot know its pkid when it queues the publish. The tracker keeps
//! one registration per queued publish in request order and binds it to the
//! pkid of the next `Outgoing::Publish` (or `Outgoing::AwaitAck` when the pkid
//! collides with a publish still in flight). rumqttc takes requests in the
//! order they were queued, which keeps the two sequences aligned.
//!
//! rumqttc only emits `Incoming::PubComp` for a successful completion. A
//! failing PUBREC or PUBCOMP, or a publish too large for the broker, comes
//! back from `poll()` as a connection error without naming the pkid. Every
//! connection error therefore settles all registrations through
//! [`AckTracker::connection_lost`], and the session drops rumqttc's replay
//! queue so no packet id outlives the connection it was issued on.

use crate::error::PublishError;
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::{ConnectionError, Event, Request, StateError};
use rumqttc::Outgoing;
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::oneshot;
use tracing::{debug, warn};

pub type AckResult = Result<(), PublishError>;
pub type AckReceiver = oneshot::Receiver<AckResult>;

type Waiter = oneshot::Sender<AckResult>;

/// QoS 2 handshake step a sent publish is waiting on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// PUBLISH written, waiting for PUBREC
    Published,
    /// PUBREL written, waiting for PUBCOMP
    Released,
}

#[derive(Debug)]
struct InFlight {
    waiter: Waiter,
    phase: Phase,
}

#[derive(Debug, Default)]
pub struct AckTracker {
    queued: VecDeque<Waiter>,
    inflight: HashMap<u16, InFlight>,
    /// Publish held back by rumqttc until the previous user of its pkid completes
    collided: Option<(u16, Waiter)>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a publish that is about to be queued on the client
    pub fn register(&mut self) -> AckReceiver {
        let (tx, rx) = oneshot::channel();
        self.queued.push_back(tx);
        rx
    }

    /// Undo the latest `register` after the client refused the request
    pub fn cancel_last(&mut self) {
        self.queued.pop_back();
    }

    /// Feed an event loop event
    pub fn handle_event(&mut self, event: &Event) {
        match event {
            Event::Outgoing(Outgoing::Publish(pkid)) => self.on_outgoing_publish(*pkid),
            Event::Outgoing(Outgoing::AwaitAck(pkid)) => self.on_collision(*pkid),
            Event::Outgoing(Outgoing::PubRel(pkid)) => {
                if let Some(entry) = self.inflight.get_mut(pkid) {
                    entry.phase = Phase::Released;
                }
            }
            Event::Incoming(Packet::PubComp(pubcomp)) => self.on_pubcomp(pubcomp.pkid),
            _ => {}
        }
    }

    /// Settle every registration after the event loop reported `error`
    ///
    /// `replay` is the event loop's pending queue right after the error. A
    /// publish missing from it was dropped by rumqttc, which for a PUBREC or
    /// PUBCOMP failure identifies the publish the broker refused. That one is
    /// rejected, everything else fails with the connection error.
    pub fn connection_lost(&mut self, error: &ConnectionError, replay: &VecDeque<Request>) {
        let mut rejected = 0usize;

        match error {
            ConnectionError::MqttState(StateError::PubRecFail { reason }) => {
                let resent = replayed_publishes(replay);
                rejected += self.reject_where(
                    |pkid, phase| phase == Phase::Published && !resent.contains(&pkid),
                    &format!("PUBREC {reason:?}"),
                );
            }
            ConnectionError::MqttState(StateError::PubCompFail { reason }) => {
                let released = replayed_releases(replay);
                rejected += self.reject_where(
                    |pkid, phase| phase == Phase::Released && !released.contains(&pkid),
                    &format!("PUBCOMP {reason:?}"),
                );
            }
            ConnectionError::MqttState(StateError::OutgoingPacketTooLarge { pkt_size, max }) => {
                // Requests leave in queue order, so the oldest unsent one is the culprit
                if let Some(waiter) = self.queued.pop_front() {
                    let _ = waiter.send(Err(PublishError::rejected(format!(
                        "packet of {pkt_size} bytes exceeds the broker maximum of {max}"
                    ))));
                    rejected += 1;
                }
            }
            _ => {}
        }

        let failed = self.fail_all(&error.to_string());
        if rejected > 0 {
            warn!(rejected, failed, error = %error, "Broker refused a publish");
        }
    }

    /// Fail every outstanding registration and forget it; returns how many there were
    pub fn fail_all(&mut self, reason: &str) -> usize {
        let waiters: Vec<Waiter> = self
            .queued
            .drain(..)
            .chain(self.inflight.drain().map(|(_, entry)| entry.waiter))
            .chain(self.collided.take().map(|(_, waiter)| waiter))
            .collect();

        let failed = waiters.len();
        for waiter in waiters {
            let _ = waiter.send(Err(PublishError::transport(reason.to_string())));
        }

        if failed > 0 {
            warn!(failed, reason, "Failed pending publishes after connection loss");
        }
        failed
    }

    /// Registrations not yet resolved
    pub fn pending(&self) -> usize {
        self.queued.len() + self.inflight.len() + usize::from(self.collided.is_some())
    }

    fn on_outgoing_publish(&mut self, pkid: u16) {
        if matches!(self.collided, Some((held, _)) if held == pkid) {
            // The held-back publish goes out right before the PUBCOMP that frees its pkid
            debug!(pkid, "Sending publish held back by pkid collision");
            return;
        }

        let Some(waiter) = self.queued.pop_front() else {
            warn!(pkid, "Outgoing publish without a registration");
            return;
        };

        let entry = InFlight {
            waiter,
            phase: Phase::Published,
        };
        if let Some(displaced) = self.inflight.insert(pkid, entry) {
            warn!(pkid, "Packet id reused while still in flight");
            let _ = displaced
                .waiter
                .send(Err(PublishError::transport("packet id reused before completion")));
        }
    }

    fn on_collision(&mut self, pkid: u16) {
        let Some(waiter) = self.queued.pop_front() else {
            warn!(pkid, "Collision without a registration");
            return;
        };
        debug!(pkid, "Publish waiting for packet id to be released");
        if let Some((held, previous)) = self.collided.replace((pkid, waiter)) {
            warn!(pkid = held, "Second collision while one is pending");
            let _ = previous.send(Err(PublishError::transport("packet id collision")));
        }
    }

    fn on_pubcomp(&mut self, pkid: u16) {
        match self.inflight.remove(&pkid) {
            Some(entry) => {
                let _ = entry.waiter.send(Ok(()));
            }
            None => debug!(pkid, "Acknowledgement for unknown packet id"),
        }

        if matches!(self.collided, Some((held, _)) if held == pkid) {
            if let Some((_, waiter)) = self.collided.take() {
                self.inflight.insert(
                    pkid,
                    InFlight {
                        waiter,
                        phase: Phase::Published,
                    },
                );
            }
        }
    }

    fn reject_where<F>(&mut self, refused: F, reason: &str) -> usize
    where
        F: Fn(u16, Phase) -> bool,
    {
        let pkids: Vec<u16> = self
            .inflight
            .iter()
            .filter(|(pkid, entry)| refused(**pkid, entry.phase))
            .map(|(pkid, _)| *pkid)
            .collect();

        for pkid in &pkids {
            if let Some(entry) = self.inflight.remove(pkid) {
                let _ = entry.waiter.send(Err(PublishError::rejected(reason)));
            }
        }
        pkids.len()
    }
}

fn replayed_publishes(replay: &VecDeque<Request>) -> HashSet<u16> {
    replay
        .iter()
        .filter_map(|request| match request {
            Request::Publish(publish) => Some(publish.pkid),
            _ => None,
        })
        .collect()
}

fn replayed_releases(replay: &VecDeque<Request>) -> HashSet<u16> {
    replay
        .iter()
        .filter_map(|request| match request {
            Request::PubRel(pubrel) => Some(pubrel.pkid),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::v5::mqttbytes::v5::{
        PubComp, PubCompReason, PubRec, PubRecReason, PubRel, Publish,
    };
    use rumqttc::v5::mqttbytes::QoS;

    fn outgoing(pkid: u16) -> Event {
        Event::Outgoing(Outgoing::Publish(pkid))
    }

    fn released(pkid: u16) -> Event {
        Event::Outgoing(Outgoing::PubRel(pkid))
    }

    fn pubrec(pkid: u16) -> Event {
        Event::Incoming(Packet::PubRec(PubRec::new(pkid, None)))
    }

    fn pubcomp(pkid: u16) -> Event {
        Event::Incoming(Packet::PubComp(PubComp::new(pkid, None)))
    }

    fn replay_publish(pkid: u16) -> Request {
        let mut publish = Publish::new("room/1", QoS::ExactlyOnce, "{}", None);
        publish.pkid = pkid;
        Request::Publish(publish)
    }

    fn replay_release(pkid: u16) -> Request {
        Request::PubRel(PubRel::new(pkid, None))
    }

    fn io_error() -> ConnectionError {
        ConnectionError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection reset",
        ))
    }

    #[test]
    fn test_pubcomp_resolves_in_registration_order() {
        let mut tracker = AckTracker::new();
        let mut first = tracker.register();
        let mut second = tracker.register();

        tracker.handle_event(&outgoing(1));
        tracker.handle_event(&outgoing(2));

        tracker.handle_event(&pubcomp(2));
        assert!(matches!(second.try_recv(), Ok(Ok(()))));
        assert!(first.try_recv().is_err());

        tracker.handle_event(&pubcomp(1));
        assert!(matches!(first.try_recv(), Ok(Ok(()))));
        assert_eq!(tracker.pending(), 0);
    }

    #[test]
    fn test_pubrec_and_pubrel_do_not_resolve() {
        let mut tracker = AckTracker::new();
        let mut rx = tracker.register();

        tracker.handle_event(&outgoing(7));
        tracker.handle_event(&pubrec(7));
        tracker.handle_event(&released(7));
        assert!(rx.try_recv().is_err());

        tracker.handle_event(&pubcomp(7));
        assert!(matches!(rx.try_recv(), Ok(Ok(()))));
    }

    #[test]
    fn test_collision_binds_after_previous_pubcomp() {
        let mut tracker = AckTracker::new();
        let mut first = tracker.register();
        let mut second = tracker.register();
        let mut held = tracker.register();

        tracker.handle_event(&outgoing(1));
        tracker.handle_event(&outgoing(2));
        // pkid 1 wrapped around while the first publish is still in flight
        tracker.handle_event(&Event::Outgoing(Outgoing::AwaitAck(1)));
        assert_eq!(tracker.pending(), 3);

        tracker.handle_event(&pubcomp(2));
        assert!(matches!(second.try_recv(), Ok(Ok(()))));

        // rumqttc writes the held publish before yielding the PUBCOMP that frees pkid 1
        tracker.handle_event(&outgoing(1));
        tracker.handle_event(&pubcomp(1));
        assert!(matches!(first.try_recv(), Ok(Ok(()))));
        assert!(held.try_recv().is_err());

        tracker.handle_event(&pubcomp(1));
        assert!(matches!(held.try_recv(), Ok(Ok(()))));
        assert_eq!(tracker.pending(), 0);
    }

    #[test]
    fn test_pubrec_failure_rejects_only_the_refused_publish() {
        let mut tracker = AckTracker::new();
        let mut accepted = tracker.register();
        let mut refused = tracker.register();

        tracker.handle_event(&outgoing(5));
        tracker.handle_event(&released(5));
        tracker.handle_event(&outgoing(6));

        // rumqttc dropped pkid 6 and queued the PUBREL for 5 for replay
        let error = ConnectionError::MqttState(StateError::PubRecFail {
            reason: PubRecReason::NotAuthorized,
        });
        tracker.connection_lost(&error, &VecDeque::from([replay_release(5)]));

        match refused.try_recv() {
            Ok(Err(PublishError::Rejected { reason })) => assert!(reason.contains("NotAuthorized")),
            other => panic!("expected rejection, got {other:?}"),
        }
        assert!(matches!(accepted.try_recv(), Ok(Err(PublishError::Transport(_)))));
        assert_eq!(tracker.pending(), 0);
    }

    #[test]
    fn test_pubcomp_failure_rejects_the_released_publish() {
        let mut tracker = AckTracker::new();
        let mut refused = tracker.register();
        let mut waiting = tracker.register();

        tracker.handle_event(&outgoing(3));
        tracker.handle_event(&released(3));
        tracker.handle_event(&outgoing(4));

        let error = ConnectionError::MqttState(StateError::PubCompFail {
            reason: PubCompReason::PacketIdentifierNotFound,
        });
        tracker.connection_lost(&error, &VecDeque::from([replay_publish(4)]));

        assert!(matches!(
            refused.try_recv(),
            Ok(Err(PublishError::Rejected { .. }))
        ));
        assert!(matches!(waiting.try_recv(), Ok(Err(PublishError::Transport(_)))));
    }

    #[test]
    fn test_packet_id_reuse_after_connection_loss() {
        let mut tracker = AckTracker::new();
        let mut lost = tracker.register();
        tracker.handle_event(&outgoing(5));

        let error = ConnectionError::MqttState(StateError::PubRecFail {
            reason: PubRecReason::UnspecifiedError,
        });
        tracker.connection_lost(&error, &VecDeque::new());
        assert!(matches!(lost.try_recv(), Ok(Err(PublishError::Rejected { .. }))));
        assert_eq!(tracker.pending(), 0);

        let mut a = tracker.register();
        tracker.handle_event(&outgoing(5));
        let mut b = tracker.register();
        tracker.handle_event(&outgoing(6));

        tracker.handle_event(&pubcomp(5));
        assert!(matches!(a.try_recv(), Ok(Ok(()))));
        assert!(b.try_recv().is_err());

        tracker.handle_event(&pubcomp(6));
        assert!(matches!(b.try_recv(), Ok(Ok(()))));
        assert_eq!(tracker.pending(), 0);
    }

    #[test]
    fn test_oversized_publish_rejects_oldest_unsent() {
        let mut tracker = AckTracker::new();
        let mut oversized = tracker.register();
        let mut behind = tracker.register();

        let error = ConnectionError::MqttState(StateError::OutgoingPacketTooLarge {
            pkt_size: 300_000,
            max: 262_144,
        });
        tracker.connection_lost(&error, &VecDeque::new());

        match oversized.try_recv() {
            Ok(Err(PublishError::Rejected { reason })) => assert!(reason.contains("300000")),
            other => panic!("expected rejection, got {other:?}"),
        }
        assert!(matches!(behind.try_recv(), Ok(Err(PublishError::Transport(_)))));
    }

    #[test]
    fn test_connection_lost_settles_everything() {
        let mut tracker = AckTracker::new();
        let mut sent = tracker.register();
        let mut held = tracker.register();
        let mut waiting = tracker.register();
        tracker.handle_event(&outgoing(10));
        tracker.handle_event(&Event::Outgoing(Outgoing::AwaitAck(10)));

        tracker.connection_lost(&io_error(), &VecDeque::from([replay_publish(10)]));

        for rx in [&mut sent, &mut held, &mut waiting] {
            match rx.try_recv() {
                Ok(Err(PublishError::Transport(e))) => {
                    assert!(e.to_string().contains("connection reset"))
                }
                other => panic!("expected transport error, got {other:?}"),
            }
        }
        assert_eq!(tracker.pending(), 0);

        // Nothing stale is left to capture the next publish
        let mut fresh = tracker.register();
        tracker.handle_event(&outgoing(10));
        tracker.handle_event(&pubcomp(10));
        assert!(matches!(fresh.try_recv(), Ok(Ok(()))));
    }

    #[test]
    fn test_fail_all_reports_count() {
        let mut tracker = AckTracker::new();
        let _a = tracker.register();
        let _b = tracker.register();
        tracker.handle_event(&outgoing(1));

        assert_eq!(tracker.fail_all("MQTT session closed"), 2);
        assert_eq!(tracker.fail_all("MQTT session closed"), 0);
    }

    #[test]
    fn test_cancel_last_removes_registration() {
        let mut tracker = AckTracker::new();
        let _kept = tracker.register();
        let _refused = tracker.register();
        tracker.cancel_last();
        assert_eq!(tracker.pending(), 1);
    }

    #[test]
    fn test_dropped_receiver_is_harmless() {
        let mut tracker = AckTracker::new();
        drop(tracker.register());

        tracker.handle_event(&outgoing(5));
        tracker.handle_event(&pubcomp(5));
        assert_eq!(tracker.pending(), 0);
    }
}
