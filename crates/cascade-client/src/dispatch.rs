// Notification dispatcher: one task owns callback delivery, so listeners
// observe every event for this client in the order the engine processed
// the triggering input, and never concurrently.
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

use crate::events::{
    ClientEvent, ClientListener, MessageListener, MessageOutcome, MpnDeviceEvent,
    MpnSubscriptionEvent, SubscriptionEvent,
};
use crate::macros::t_counter;
use crate::mpn::{MpnDeviceShared, MpnSubShared};
use crate::subscription::SubscriptionShared;

pub(crate) enum DispatchItem {
    Client {
        listeners: Vec<Arc<dyn ClientListener>>,
        event: ClientEvent,
    },
    Subscription {
        target: Arc<SubscriptionShared>,
        event: SubscriptionEvent,
    },
    Message {
        listener: Arc<dyn MessageListener>,
        outcome: MessageOutcome,
    },
    MpnDevice {
        target: Arc<MpnDeviceShared>,
        event: MpnDeviceEvent,
    },
    MpnSubscription {
        targets: Vec<Arc<MpnSubShared>>,
        event: MpnSubscriptionEvent,
    },
}

#[derive(Clone)]
pub(crate) struct DispatcherHandle {
    tx: mpsc::UnboundedSender<DispatchItem>,
}

impl DispatcherHandle {
    pub(crate) fn enqueue(&self, item: DispatchItem) {
        // A closed dispatcher means the client is shutting down; late
        // events have no one left to hear them.
        let _ = self.tx.send(item);
    }
}

pub(crate) fn spawn() -> (DispatcherHandle, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(run_dispatcher(rx));
    (DispatcherHandle { tx }, handle)
}

async fn run_dispatcher(mut rx: mpsc::UnboundedReceiver<DispatchItem>) {
    while let Some(item) = rx.recv().await {
        t_counter!("cascade_client_callbacks_total").increment(1);
        match item {
            DispatchItem::Client { listeners, event } => {
                trace!(?event, "dispatching client event");
                for listener in listeners {
                    listener.on_event(&event);
                }
            }
            DispatchItem::Subscription { target, event } => {
                let listeners: Vec<_> = target.listeners.read().clone();
                for listener in listeners {
                    listener.on_event(&event);
                }
            }
            DispatchItem::Message { listener, outcome } => {
                listener.on_outcome(&outcome);
            }
            DispatchItem::MpnDevice { target, event } => {
                let listeners: Vec<_> = target.listeners.read().clone();
                for listener in listeners {
                    listener.on_event(&event);
                }
            }
            DispatchItem::MpnSubscription { targets, event } => {
                for target in targets {
                    let listeners: Vec<_> = target.listeners.read().clone();
                    for listener in listeners {
                        listener.on_event(&event);
                    }
                }
            }
        }
    }
}
