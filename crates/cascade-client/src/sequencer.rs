//! Ordered, batched, recoverable message delivery.
//!
//! Every message belongs to exactly one sequence. Within an ordered
//! sequence, terminal outcomes are delivered to listeners in send order:
//! an outcome that arrives early is parked until every predecessor is
//! terminal. The unordered pseudo-sequence relaxes that, and a message on
//! it with no listener takes a fire-and-forget fast path with no
//! tracking at all.
use cascade_wire::OutcomeKind;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

use crate::events::{MessageListener, MessageOutcome};

pub(crate) const UNORDERED_SEQUENCE: &str = "UNORDERED_MESSAGES";

/// A callback owed to a message listener.
pub(crate) struct Delivery {
    pub(crate) listener: Arc<dyn MessageListener>,
    pub(crate) outcome: MessageOutcome,
}

/// Data the engine needs to put a message on the wire.
#[derive(Debug, Clone)]
pub(crate) struct WireSend {
    pub(crate) sequence: String,
    pub(crate) prog: u32,
    pub(crate) payload: String,
    pub(crate) delay_timeout_ms: Option<u64>,
    pub(crate) ack: bool,
}

struct PendingMessage {
    payload: String,
    delay_timeout_ms: Option<u64>,
    listener: Option<Arc<dyn MessageListener>>,
    sent_on_network: bool,
    outcome: Option<MessageOutcome>,
}

#[derive(Default)]
struct SequenceState {
    next_prog: u32,
    pending: BTreeMap<u32, PendingMessage>,
}

#[derive(Default)]
pub(crate) struct Sequencer {
    sequences: HashMap<String, SequenceState>,
}

pub(crate) struct Enqueued {
    pub(crate) send: Option<WireSend>,
    pub(crate) delivery: Option<Delivery>,
}

impl Sequencer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Accept a message. Returns what to send now (if a session is up)
    /// and/or an immediate abort delivery (if there is no session and the
    /// message was not flagged to wait for one).
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn enqueue(
        &mut self,
        sequence: Option<String>,
        payload: String,
        delay_timeout_ms: Option<u64>,
        listener: Option<Arc<dyn MessageListener>>,
        enqueue_while_disconnected: bool,
        session_present: bool,
    ) -> Enqueued {
        let sequence = sequence.unwrap_or_else(|| UNORDERED_SEQUENCE.to_string());

        if !session_present && !enqueue_while_disconnected {
            // No session and not allowed to wait: aborted before any
            // transmission attempt.
            return Enqueued {
                send: None,
                delivery: listener.map(|listener| Delivery {
                    listener,
                    outcome: MessageOutcome::Aborted {
                        sent_on_network: false,
                    },
                }),
            };
        }

        let state = self.sequences.entry(sequence.clone()).or_default();
        state.next_prog += 1;
        let prog = state.next_prog;

        let fire_and_forget =
            sequence == UNORDERED_SEQUENCE && listener.is_none() && session_present;
        if fire_and_forget {
            // No tracking, no dedup, no outcome: the fast path.
            return Enqueued {
                send: Some(WireSend {
                    sequence,
                    prog,
                    payload,
                    delay_timeout_ms,
                    ack: false,
                }),
                delivery: None,
            };
        }

        state.pending.insert(
            prog,
            PendingMessage {
                payload: payload.clone(),
                delay_timeout_ms,
                listener,
                sent_on_network: false,
                outcome: None,
            },
        );
        let send = session_present.then_some(WireSend {
            sequence,
            prog,
            payload,
            delay_timeout_ms,
            ack: true,
        });
        Enqueued {
            send,
            delivery: None,
        }
    }

    /// A transmission attempt for this message left the local transport.
    pub(crate) fn mark_sent(&mut self, sequence: &str, prog: u32) {
        if let Some(state) = self.sequences.get_mut(sequence)
            && let Some(entry) = state.pending.get_mut(&prog)
        {
            entry.sent_on_network = true;
        }
    }

    /// Messages held while no session existed (or that never got sent on
    /// the lost one), to be transmitted on a fresh session.
    pub(crate) fn unsent(&self) -> Vec<WireSend> {
        let mut sends = Vec::new();
        for (sequence, state) in &self.sequences {
            for (&prog, entry) in &state.pending {
                if !entry.sent_on_network && entry.outcome.is_none() {
                    sends.push(WireSend {
                        sequence: sequence.clone(),
                        prog,
                        payload: entry.payload.clone(),
                        delay_timeout_ms: entry.delay_timeout_ms,
                        ack: true,
                    });
                }
            }
        }
        sends
    }

    /// Record a server-reported outcome and drain every delivery that is
    /// now in order.
    pub(crate) fn on_outcome(
        &mut self,
        sequence: &str,
        prog: u32,
        outcome: OutcomeKind,
    ) -> Vec<Delivery> {
        let Some(state) = self.sequences.get_mut(sequence) else {
            debug!(sequence, prog, "outcome for unknown sequence");
            return Vec::new();
        };
        let Some(entry) = state.pending.get_mut(&prog) else {
            // Fire-and-forget or already terminal.
            debug!(sequence, prog, "outcome for untracked message");
            return Vec::new();
        };
        if entry.outcome.is_some() {
            debug!(sequence, prog, "duplicate outcome ignored");
            return Vec::new();
        }
        entry.outcome = Some(translate(outcome));

        let mut deliveries = Vec::new();
        if sequence == UNORDERED_SEQUENCE {
            // Relaxed ordering: deliver immediately.
            if let Some(entry) = state.pending.remove(&prog)
                && let Some(listener) = entry.listener
            {
                deliveries.push(Delivery {
                    listener,
                    outcome: entry.outcome.expect("outcome just set"),
                });
            }
            return deliveries;
        }

        // Ordered drain: pop from the front while the head is terminal.
        while let Some(first) = state.pending.first_entry() {
            if first.get().outcome.is_none() {
                break;
            }
            let entry = first.remove();
            if let Some(listener) = entry.listener {
                deliveries.push(Delivery {
                    listener,
                    outcome: entry.outcome.expect("terminal outcome"),
                });
            }
        }
        deliveries
    }

    /// Abort every pending message: the engine is entering a fully
    /// disconnected state and no outcome can ever be established.
    pub(crate) fn abort_all(&mut self) -> Vec<Delivery> {
        let mut deliveries = Vec::new();
        for state in self.sequences.values_mut() {
            for (_, entry) in std::mem::take(&mut state.pending) {
                if let Some(listener) = entry.listener {
                    deliveries.push(Delivery {
                        listener,
                        outcome: entry
                            .outcome
                            .unwrap_or(MessageOutcome::Aborted {
                                sent_on_network: entry.sent_on_network,
                            }),
                    });
                }
            }
        }
        deliveries
    }

    /// The session died without recovery: anything already transmitted on
    /// it has an unknowable outcome. Untransmitted messages stay queued
    /// for the replacement session.
    pub(crate) fn abort_sent(&mut self) -> Vec<Delivery> {
        let mut deliveries = Vec::new();
        for state in self.sequences.values_mut() {
            let sent: Vec<u32> = state
                .pending
                .iter()
                .filter(|(_, entry)| entry.sent_on_network)
                .map(|(&prog, _)| prog)
                .collect();
            for prog in sent {
                let entry = state.pending.remove(&prog).expect("pending entry");
                if let Some(listener) = entry.listener {
                    deliveries.push(Delivery {
                        listener,
                        outcome: MessageOutcome::Aborted {
                            sent_on_network: true,
                        },
                    });
                }
            }
        }
        deliveries
    }
}

fn translate(outcome: OutcomeKind) -> MessageOutcome {
    match outcome {
        OutcomeKind::Processed { response } => MessageOutcome::Processed { response },
        OutcomeKind::Deny { code, message } => MessageOutcome::Denied { code, message },
        OutcomeKind::Error => MessageOutcome::Error,
        OutcomeKind::Discarded => MessageOutcome::Discarded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Recorder(Mutex<Vec<String>>);

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self(Mutex::new(Vec::new())))
        }

        fn log(&self) -> Vec<String> {
            self.0.lock().clone()
        }
    }

    struct Tagged {
        recorder: Arc<Recorder>,
        tag: &'static str,
    }

    impl MessageListener for Tagged {
        fn on_outcome(&self, outcome: &MessageOutcome) {
            let label = match outcome {
                MessageOutcome::Processed { .. } => "processed",
                MessageOutcome::Denied { .. } => "denied",
                MessageOutcome::Error => "error",
                MessageOutcome::Discarded => "discarded",
                MessageOutcome::Aborted { sent_on_network } => {
                    if *sent_on_network {
                        "aborted-sent"
                    } else {
                        "aborted-unsent"
                    }
                }
            };
            self.recorder.0.lock().push(format!("{}:{}", self.tag, label));
        }
    }

    fn listener(recorder: &Arc<Recorder>, tag: &'static str) -> Arc<dyn MessageListener> {
        Arc::new(Tagged {
            recorder: Arc::clone(recorder),
            tag,
        })
    }

    fn deliver(deliveries: Vec<Delivery>) {
        for delivery in deliveries {
            delivery.listener.on_outcome(&delivery.outcome);
        }
    }

    #[test]
    fn ordered_outcomes_wait_for_predecessors() {
        let recorder = Recorder::new();
        let mut sequencer = Sequencer::new();
        for tag in ["a", "b"] {
            let enqueued = sequencer.enqueue(
                Some("seq".to_string()),
                tag.to_string(),
                None,
                Some(listener(&recorder, if tag == "a" { "a" } else { "b" })),
                false,
                true,
            );
            assert!(enqueued.send.is_some());
        }

        // B's outcome arrives first and must be parked.
        deliver(sequencer.on_outcome("seq", 2, OutcomeKind::Processed { response: None }));
        assert!(recorder.log().is_empty());

        deliver(sequencer.on_outcome("seq", 1, OutcomeKind::Processed { response: None }));
        assert_eq!(recorder.log(), vec!["a:processed", "b:processed"]);
    }

    #[test]
    fn discard_of_predecessor_unblocks_successor() {
        let recorder = Recorder::new();
        let mut sequencer = Sequencer::new();
        sequencer.enqueue(
            Some("seq".to_string()),
            "a".to_string(),
            Some(0),
            Some(listener(&recorder, "a")),
            false,
            true,
        );
        sequencer.enqueue(
            Some("seq".to_string()),
            "b".to_string(),
            None,
            Some(listener(&recorder, "b")),
            false,
            true,
        );

        deliver(sequencer.on_outcome("seq", 2, OutcomeKind::Processed { response: None }));
        deliver(sequencer.on_outcome("seq", 1, OutcomeKind::Discarded));
        assert_eq!(recorder.log(), vec!["a:discarded", "b:processed"]);
    }

    #[test]
    fn unordered_outcomes_deliver_immediately() {
        let recorder = Recorder::new();
        let mut sequencer = Sequencer::new();
        sequencer.enqueue(
            None,
            "a".to_string(),
            None,
            Some(listener(&recorder, "a")),
            false,
            true,
        );
        sequencer.enqueue(
            None,
            "b".to_string(),
            None,
            Some(listener(&recorder, "b")),
            false,
            true,
        );
        deliver(sequencer.on_outcome(UNORDERED_SEQUENCE, 2, OutcomeKind::Processed { response: None }));
        assert_eq!(recorder.log(), vec!["b:processed"]);
    }

    #[test]
    fn fire_and_forget_is_untracked() {
        let mut sequencer = Sequencer::new();
        let enqueued = sequencer.enqueue(None, "a".to_string(), None, None, false, true);
        let send = enqueued.send.expect("send");
        assert!(!send.ack);
        // A late outcome for it is ignored without panic.
        assert!(sequencer
            .on_outcome(UNORDERED_SEQUENCE, send.prog, OutcomeKind::Error)
            .is_empty());
    }

    #[test]
    fn disconnected_without_flag_aborts_immediately() {
        let recorder = Recorder::new();
        let mut sequencer = Sequencer::new();
        let enqueued = sequencer.enqueue(
            Some("seq".to_string()),
            "a".to_string(),
            None,
            Some(listener(&recorder, "a")),
            false,
            false,
        );
        assert!(enqueued.send.is_none());
        deliver(enqueued.delivery.into_iter().collect());
        assert_eq!(recorder.log(), vec!["a:aborted-unsent"]);
    }

    #[test]
    fn enqueue_while_disconnected_holds_until_flush() {
        let recorder = Recorder::new();
        let mut sequencer = Sequencer::new();
        let enqueued = sequencer.enqueue(
            Some("seq".to_string()),
            "held".to_string(),
            None,
            Some(listener(&recorder, "held")),
            true,
            false,
        );
        assert!(enqueued.send.is_none());
        assert!(enqueued.delivery.is_none());

        let unsent = sequencer.unsent();
        assert_eq!(unsent.len(), 1);
        assert_eq!(unsent[0].payload, "held");

        // Tear-down while still pending aborts it.
        deliver(sequencer.abort_all());
        assert_eq!(recorder.log(), vec!["held:aborted-unsent"]);
    }

    #[test]
    fn session_loss_aborts_only_transmitted_messages() {
        let recorder = Recorder::new();
        let mut sequencer = Sequencer::new();
        sequencer.enqueue(
            Some("seq".to_string()),
            "sent".to_string(),
            None,
            Some(listener(&recorder, "sent")),
            false,
            true,
        );
        sequencer.enqueue(
            Some("seq".to_string()),
            "unsent".to_string(),
            None,
            Some(listener(&recorder, "unsent")),
            false,
            true,
        );
        sequencer.mark_sent("seq", 1);

        deliver(sequencer.abort_sent());
        assert_eq!(recorder.log(), vec!["sent:aborted-sent"]);
        assert_eq!(sequencer.unsent().len(), 1);
    }

    #[test]
    fn at_most_one_outcome_per_message() {
        let recorder = Recorder::new();
        let mut sequencer = Sequencer::new();
        sequencer.enqueue(
            Some("seq".to_string()),
            "a".to_string(),
            None,
            Some(listener(&recorder, "a")),
            false,
            true,
        );
        deliver(sequencer.on_outcome("seq", 1, OutcomeKind::Processed { response: None }));
        deliver(sequencer.on_outcome("seq", 1, OutcomeKind::Error));
        deliver(sequencer.abort_all());
        assert_eq!(recorder.log(), vec!["a:processed"]);
    }
}
