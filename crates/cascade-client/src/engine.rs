//! The protocol worker: one task owns the session machine, the
//! subscription registry, the message sequencer, and the MPN registry.
//!
//! Public calls enqueue commands and return; protocol events and policy
//! timers are multiplexed into the same loop, so every state transition
//! happens on this task and reaches listeners through the dispatcher in
//! processing order.
use cascade_transport::{
    ConnectionHandle, Endpoint, TransportConfig, TransportEvent, TransportFactory,
};
use cascade_wire::{
    ClientRequest, ClientStatus, Property, ProtocolEvent, TransportKind,
};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::{ConnectionDetails, ConnectionOptions};
use crate::dispatch::{DispatchItem, DispatcherHandle};
use crate::events::{ClientEvent, ClientListener, MessageListener};
use crate::macros::{t_counter, t_gauge};
use crate::mpn::{MpnAction, MpnDeviceShared, MpnFilter, MpnRegistry, MpnRecords, MpnSubShared};
use crate::registry::{Registry, RegistryAction};
use crate::sequencer::{Delivery, Sequencer};
use crate::session::{SessionMachine, Timer};
use crate::subscription::{MaxFrequency, SubscriptionShared};

/// State readable synchronously from any caller thread. The engine is the
/// only writer for the server-assigned fields.
pub(crate) struct Shared {
    pub(crate) status: RwLock<ClientStatus>,
    pub(crate) details: RwLock<ConnectionDetails>,
    pub(crate) options: RwLock<ConnectionOptions>,
}

impl Shared {
    pub(crate) fn new(details: ConnectionDetails, options: ConnectionOptions) -> Self {
        Self {
            status: RwLock::new(ClientStatus::Disconnected),
            details: RwLock::new(details),
            options: RwLock::new(options),
        }
    }
}

pub(crate) enum Command {
    Connect,
    Disconnect,
    Subscribe {
        shared: Arc<SubscriptionShared>,
    },
    Unsubscribe {
        shared: Arc<SubscriptionShared>,
    },
    ChangeFrequency {
        shared: Arc<SubscriptionShared>,
        frequency: MaxFrequency,
    },
    SendMessage {
        payload: String,
        sequence: Option<String>,
        delay_timeout_ms: Option<u64>,
        listener: Option<Arc<dyn MessageListener>>,
        enqueue_while_disconnected: bool,
    },
    PropertyChanged {
        property: Property,
    },
    RegisterMpnDevice {
        shared: Arc<MpnDeviceShared>,
    },
    MpnSubscribe {
        shared: Arc<MpnSubShared>,
        coalescing: bool,
    },
    MpnUnsubscribe {
        shared: Arc<MpnSubShared>,
    },
    MpnUnsubscribeFiltered {
        filter: MpnFilter,
    },
    MpnChangeFormat {
        shared: Arc<MpnSubShared>,
        format: String,
    },
    MpnChangeTrigger {
        shared: Arc<MpnSubShared>,
        trigger: Option<String>,
    },
    Shutdown,
}

pub(crate) struct Notifier {
    dispatcher: DispatcherHandle,
    client_listeners: Arc<RwLock<Vec<Arc<dyn ClientListener>>>>,
}

impl Notifier {
    pub(crate) fn new(
        dispatcher: DispatcherHandle,
        client_listeners: Arc<RwLock<Vec<Arc<dyn ClientListener>>>>,
    ) -> Self {
        Self {
            dispatcher,
            client_listeners,
        }
    }

    fn client(&self, event: ClientEvent) {
        let listeners: Vec<_> = self.client_listeners.read().clone();
        self.dispatcher.enqueue(DispatchItem::Client { listeners, event });
    }

    fn message(&self, delivery: Delivery) {
        self.dispatcher.enqueue(DispatchItem::Message {
            listener: delivery.listener,
            outcome: delivery.outcome,
        });
    }
}

pub(crate) struct EngineSeed {
    pub(crate) shared: Arc<Shared>,
    pub(crate) notifier: Notifier,
    pub(crate) factory: Arc<dyn TransportFactory>,
    pub(crate) transport_config: TransportConfig,
    pub(crate) mpn_records: MpnRecords,
}

pub(crate) fn spawn(seed: EngineSeed) -> mpsc::UnboundedSender<Command> {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let engine = Engine {
        shared: seed.shared,
        notifier: seed.notifier,
        factory: seed.factory,
        transport_config: seed.transport_config,
        session: SessionMachine::new(),
        registry: Registry::new(),
        sequencer: Sequencer::new(),
        mpn: MpnRegistry::new(seed.mpn_records),
        link: None,
        user_disconnect: false,
    };
    tokio::spawn(engine_task(cmd_rx, engine));
    cmd_tx
}

type EventsRx = Option<mpsc::Receiver<TransportEvent>>;

async fn next_transport_event(events_rx: &mut EventsRx) -> Option<TransportEvent> {
    match events_rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(instant) => tokio::time::sleep_until(instant).await,
        None => std::future::pending().await,
    }
}

async fn engine_task(mut cmd_rx: mpsc::UnboundedReceiver<Command>, mut engine: Engine) {
    let mut events_rx: EventsRx = None;
    loop {
        let deadline = engine.next_deadline();
        tokio::select! {
            biased;

            command = cmd_rx.recv() => {
                match command {
                    None | Some(Command::Shutdown) => {
                        engine.teardown();
                        return;
                    }
                    Some(command) => engine.handle_command(command, &mut events_rx).await,
                }
            }

            event = next_transport_event(&mut events_rx) => {
                match event {
                    Some(TransportEvent::Event(event)) => {
                        engine.handle_protocol_event(event, &mut events_rx).await;
                    }
                    Some(TransportEvent::Closed { reason }) => {
                        engine.on_transport_lost(&reason, &mut events_rx).await;
                    }
                    None => {
                        engine.on_transport_lost("transport event channel closed", &mut events_rx).await;
                    }
                }
            }

            _ = sleep_until(deadline.map(|(instant, _)| instant)) => {
                if let Some((_, timer)) = deadline {
                    engine.handle_timer(timer, &mut events_rx).await;
                }
            }
        }
    }
}

struct Engine {
    shared: Arc<Shared>,
    notifier: Notifier,
    factory: Arc<dyn TransportFactory>,
    transport_config: TransportConfig,
    session: SessionMachine,
    registry: Registry,
    sequencer: Sequencer,
    mpn: MpnRegistry,
    link: Option<ConnectionHandle>,
    user_disconnect: bool,
}

impl Engine {
    fn next_deadline(&self) -> Option<(tokio::time::Instant, Timer)> {
        let options = self.shared.options.read().clone();
        self.session.next_deadline(&options)
    }

    fn options(&self) -> ConnectionOptions {
        self.shared.options.read().clone()
    }

    fn set_status(&mut self, status: ClientStatus) {
        if self.session.status == status {
            return;
        }
        debug!(from = %self.session.status, to = %status, "status transition");
        self.session.status = status;
        *self.shared.status.write() = status;
        self.notifier.client(ClientEvent::StatusChange { status });
        t_counter!("cascade_client_status_changes_total").increment(1);
    }

    fn notify_property(&self, property: Property) {
        self.notifier.client(ClientEvent::PropertyChange { property });
    }

    fn session_present(&self) -> bool {
        self.session.session_id.is_some() && self.link.is_some()
    }

    fn drop_link(&mut self, events_rx: &mut EventsRx) {
        self.link = None;
        *events_rx = None;
    }

    async fn send_request(&mut self, request: ClientRequest) -> bool {
        let Some(link) = &self.link else {
            return false;
        };
        match link.send(request).await {
            Ok(()) => {
                self.session.record_tx();
                true
            }
            Err(err) => {
                // The closed event follows on the event channel.
                debug!(error = %err, "request send failed");
                false
            }
        }
    }

    fn candidate_kinds(&self) -> Vec<TransportKind> {
        let supported = self.factory.supported();
        if let Some(forced) = self.options().forced_transport {
            return supported.into_iter().filter(|kind| *kind == forced).collect();
        }
        let preference = [
            TransportKind::WsStreaming,
            TransportKind::HttpStreaming,
            TransportKind::WsPolling,
            TransportKind::HttpPolling,
        ];
        preference
            .into_iter()
            .filter(|kind| supported.contains(kind))
            .collect()
    }

    fn endpoint(&self) -> Option<Endpoint> {
        let details = self.shared.details.read();
        let options = self.shared.options.read();
        Some(Endpoint {
            server_address: details.server_address.clone()?,
            extra_headers: options.http_extra_headers.clone(),
        })
    }

    async fn open_link(&mut self, kind: TransportKind, events_rx: &mut EventsRx) -> bool {
        let Some(endpoint) = self.endpoint() else {
            warn!("connect attempted without a server address");
            return false;
        };
        match self
            .factory
            .connect(kind, &endpoint, &self.transport_config)
            .await
        {
            Ok(connection) => {
                let (handle, rx) = connection.split();
                self.link = Some(handle);
                *events_rx = Some(rx);
                self.session.record_rx();
                true
            }
            Err(err) => {
                debug!(?kind, error = %err, "transport connect failed");
                false
            }
        }
    }

    fn create_session_request(&self, polling: bool) -> ClientRequest {
        let details = self.shared.details.read();
        let options = self.shared.options.read();
        ClientRequest::CreateSession {
            adapter_set: details.adapter_set.clone(),
            user: details.user.clone(),
            password: details.password.clone(),
            requested_max_bandwidth: Some(options.requested_max_bandwidth.as_token()),
            polling,
        }
    }

    /// Open a pre-flight connection and request a fresh session.
    async fn start_connecting(&mut self, events_rx: &mut EventsRx) {
        self.drop_link(events_rx);
        self.set_status(ClientStatus::Connecting);
        for kind in self.candidate_kinds() {
            if self.open_link(kind, events_rx).await {
                let request = self.create_session_request(!kind.is_streaming());
                if self.send_request(request).await {
                    self.session.bound_kind = Some(kind);
                    return;
                }
                self.drop_link(events_rx);
            }
        }
        self.enter_will_retry(events_rx, "no transport available");
    }

    fn enter_will_retry(&mut self, events_rx: &mut EventsRx, reason: &str) {
        debug!(reason, "entering retry backoff");
        self.drop_link(events_rx);
        if self.session.session_id.is_some() {
            self.abandon_session();
        }
        let options = self.options();
        self.session.schedule_retry(&options);
        self.set_status(ClientStatus::WillRetry);
    }

    /// The session is gone for good: aborts, cache resets, property
    /// notifications.
    fn abandon_session(&mut self) {
        self.session.clear_session();
        {
            let mut details = self.shared.details.write();
            details.session_id = None;
        }
        self.notify_property(Property::SessionId);
        for action in self.registry.on_session_lost() {
            self.apply_registry_notification(action);
        }
        for delivery in self.sequencer.abort_sent() {
            self.notifier.message(delivery);
        }
    }

    fn apply_registry_notification(&mut self, action: RegistryAction) {
        match action {
            RegistryAction::Send(request) => {
                // Lost-session paths produce no sends; requests reaching
                // here without a link are dropped with the session.
                debug!(?request, "registry request outside a session; dropped");
            }
            RegistryAction::Notify { target, event } => {
                self.notifier
                    .dispatcher
                    .enqueue(DispatchItem::Subscription { target, event });
            }
        }
    }

    async fn execute_registry_actions(&mut self, actions: Vec<RegistryAction>) {
        for action in actions {
            match action {
                RegistryAction::Send(request) => {
                    self.send_request(request).await;
                }
                RegistryAction::Notify { target, event } => {
                    self.notifier
                        .dispatcher
                        .enqueue(DispatchItem::Subscription { target, event });
                }
            }
        }
    }

    async fn execute_mpn_actions(&mut self, actions: Vec<MpnAction>) {
        for action in actions {
            match action {
                MpnAction::Send(request) => {
                    self.send_request(request).await;
                }
                MpnAction::NotifyDevice { target, event } => {
                    self.notifier
                        .dispatcher
                        .enqueue(DispatchItem::MpnDevice { target, event });
                }
                MpnAction::NotifySubs { targets, event } => {
                    self.notifier
                        .dispatcher
                        .enqueue(DispatchItem::MpnSubscription { targets, event });
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command, events_rx: &mut EventsRx) {
        match command {
            Command::Connect => {
                // A no-op anywhere outside the disconnected family, and
                // while a recovery attempt is already in flight.
                if !self.session.status.is_disconnected()
                    || self.session.status == ClientStatus::TryingRecovery
                {
                    return;
                }
                self.user_disconnect = false;
                self.session.retry_attempt = 0;
                self.session.retry_at = None;
                self.start_connecting(events_rx).await;
            }
            Command::Disconnect => {
                if self.session.status == ClientStatus::Disconnected {
                    return;
                }
                self.user_disconnect = true;
                if let Some(session_id) = self.session.session_id.clone() {
                    let _ = self.send_request(ClientRequest::Destroy { session_id }).await;
                }
                self.disconnect_terminal(events_rx);
            }
            Command::Subscribe { shared } => match self.registry.activate(shared) {
                Ok(id) => {
                    t_gauge!("cascade_client_active_subscriptions")
                        .set(self.registry.active_count() as f64);
                    if self.session_present()
                        && let Some(request) = self.registry.build_subscribe(id)
                    {
                        self.send_request(request).await;
                    }
                    // Without a session the request is deferred until one
                    // becomes available (resubscribe_all covers it).
                }
                Err(err) => warn!(error = %err, "subscription activation failed"),
            },
            Command::Unsubscribe { shared } => {
                let actions = self.registry.deactivate(&shared);
                t_gauge!("cascade_client_active_subscriptions")
                    .set(self.registry.active_count() as f64);
                if self.session_present() {
                    self.execute_registry_actions(actions).await;
                } else {
                    for action in actions {
                        self.apply_registry_notification(action);
                    }
                }
            }
            Command::ChangeFrequency { shared, frequency } => {
                if let Some(request) = self
                    .registry
                    .change_frequency(&shared, frequency.as_token())
                    && self.session_present()
                {
                    self.send_request(request).await;
                }
            }
            Command::SendMessage {
                payload,
                sequence,
                delay_timeout_ms,
                listener,
                enqueue_while_disconnected,
            } => {
                let enqueued = self.sequencer.enqueue(
                    sequence,
                    payload,
                    delay_timeout_ms,
                    listener,
                    enqueue_while_disconnected,
                    self.session_present(),
                );
                if let Some(delivery) = enqueued.delivery {
                    self.notifier.message(delivery);
                }
                if let Some(send) = enqueued.send {
                    let request = ClientRequest::Message {
                        sequence: send.sequence.clone(),
                        prog: send.prog,
                        payload: send.payload,
                        delay_timeout_ms: send.delay_timeout_ms,
                        ack: send.ack,
                    };
                    if self.send_request(request).await {
                        self.sequencer.mark_sent(&send.sequence, send.prog);
                    }
                }
            }
            Command::PropertyChanged { property } => {
                self.notify_property(property);
                if property == Property::RequestedMaxBandwidth && self.session_present() {
                    let token = self.options().requested_max_bandwidth.as_token();
                    self.send_request(ClientRequest::Constrain {
                        requested_max_bandwidth: token,
                    })
                    .await;
                }
            }
            Command::RegisterMpnDevice { shared } => {
                let actions = self.mpn.register(shared, self.session_present());
                self.execute_mpn_actions(actions).await;
            }
            Command::MpnSubscribe { shared, coalescing } => {
                match self.mpn.subscribe(shared, coalescing, self.session_present()) {
                    Ok(actions) => self.execute_mpn_actions(actions).await,
                    Err(err) => warn!(error = %err, "MPN subscribe failed"),
                }
            }
            Command::MpnUnsubscribe { shared } => match self.mpn.unsubscribe(&shared) {
                Ok(actions) => self.execute_mpn_actions(actions).await,
                Err(err) => warn!(error = %err, "MPN unsubscribe failed"),
            },
            Command::MpnUnsubscribeFiltered { filter } => {
                let actions = self.mpn.unsubscribe_filtered(filter);
                self.execute_mpn_actions(actions).await;
            }
            Command::MpnChangeFormat { shared, format } => {
                let actions = self.mpn.change_format(&shared, format);
                self.execute_mpn_actions(actions).await;
            }
            Command::MpnChangeTrigger { shared, trigger } => {
                let actions = self.mpn.change_trigger(&shared, trigger);
                self.execute_mpn_actions(actions).await;
            }
            Command::Shutdown => unreachable!("handled by the loop"),
        }
    }

    /// Orderly teardown into the terminal DISCONNECTED state.
    fn disconnect_terminal(&mut self, events_rx: &mut EventsRx) {
        self.drop_link(events_rx);
        self.session.clear_session();
        {
            let mut details = self.shared.details.write();
            if details.session_id.take().is_some() {
                drop(details);
                self.notify_property(Property::SessionId);
            }
        }
        for action in self.registry.on_session_lost() {
            self.apply_registry_notification(action);
        }
        for delivery in self.sequencer.abort_all() {
            self.notifier.message(delivery);
        }
        self.session.retry_at = None;
        self.set_status(ClientStatus::Disconnected);
    }

    fn teardown(&mut self) {
        self.link = None;
        for delivery in self.sequencer.abort_all() {
            self.notifier.message(delivery);
        }
        *self.shared.status.write() = ClientStatus::Disconnected;
    }

    async fn handle_protocol_event(&mut self, event: ProtocolEvent, events_rx: &mut EventsRx) {
        self.session.record_rx();
        // Any traffic resolves a stall; a stream-sense probe is answered
        // by the first event that proves the stream flows.
        match self.session.status {
            ClientStatus::StreamSensing => {
                if matches!(event, ProtocolEvent::Sync { .. } | ProtocolEvent::Update { .. }) {
                    if let Some(kind) = self.link.as_ref().map(ConnectionHandle::kind) {
                        self.set_status(ClientStatus::Connected(kind));
                    }
                }
            }
            ClientStatus::Stalled => {
                let kind = self
                    .session
                    .pre_stall_kind
                    .or_else(|| self.link.as_ref().map(ConnectionHandle::kind));
                if let Some(kind) = kind {
                    self.session.pre_stall_kind = None;
                    self.set_status(ClientStatus::Connected(kind));
                }
            }
            _ => {}
        }

        match event {
            ProtocolEvent::SessionCreated {
                session_id,
                keepalive_ms,
                control_link,
                server_socket_name,
                client_ip,
            } => {
                self.on_session_created(
                    session_id,
                    keepalive_ms,
                    control_link,
                    server_socket_name,
                    client_ip,
                )
                .await;
            }
            ProtocolEvent::SessionBound { session_id } => {
                if self.session.session_id.as_deref() != Some(session_id.as_str()) {
                    warn!(%session_id, "bind ack for an unexpected session");
                }
                if let Some(kind) = self.link.as_ref().map(ConnectionHandle::kind) {
                    self.session.bound_kind = Some(kind);
                    self.set_status(ClientStatus::Connected(kind));
                }
                self.flush_deferred_work().await;
            }
            ProtocolEvent::Sync { .. } => {}
            ProtocolEvent::LoopHint { .. } => {
                // End of a polling cycle (or a server-requested rebind):
                // bind again on the same transport.
                if let Some(session_id) = self.session.session_id.clone() {
                    let polling = self
                        .link
                        .as_ref()
                        .is_some_and(|link| !link.kind().is_streaming());
                    self.send_request(ClientRequest::BindSession {
                        session_id,
                        polling,
                    })
                    .await;
                }
            }
            ProtocolEvent::Update {
                subscription,
                item,
                key,
                command,
                snapshot,
                changes,
            } => {
                self.session.data_counter += 1;
                let actions = self
                    .registry
                    .on_update(subscription, item, key, command, snapshot, changes);
                self.execute_registry_actions(actions).await;
            }
            ProtocolEvent::EndOfSnapshot { subscription, item } => {
                self.session.data_counter += 1;
                let actions = self.registry.on_end_of_snapshot(subscription, item);
                self.execute_registry_actions(actions).await;
            }
            ProtocolEvent::ClearSnapshot { subscription, item } => {
                self.session.data_counter += 1;
                let actions = self.registry.on_clear_snapshot(subscription, item);
                self.execute_registry_actions(actions).await;
            }
            ProtocolEvent::Overflow {
                subscription,
                item,
                lost,
            } => {
                let actions = self.registry.on_overflow(subscription, item, lost);
                self.execute_registry_actions(actions).await;
            }
            ProtocolEvent::SubscriptionAck {
                subscription,
                items,
                fields,
                key_position,
                command_position,
            } => {
                let actions = self.registry.on_subscription_ack(
                    subscription,
                    items,
                    fields,
                    key_position,
                    command_position,
                );
                self.execute_registry_actions(actions).await;
            }
            ProtocolEvent::SubscriptionError {
                subscription,
                code,
                message,
            } => {
                let actions = self.registry.on_subscription_error(subscription, code, message);
                self.execute_registry_actions(actions).await;
            }
            ProtocolEvent::UnsubscriptionAck { subscription } => {
                self.registry.on_unsubscription_ack(subscription);
            }
            ProtocolEvent::RealMaxFrequency {
                subscription,
                frequency,
            } => {
                let actions = self.registry.on_real_max_frequency(subscription, frequency);
                self.execute_registry_actions(actions).await;
            }
            ProtocolEvent::MessageOutcome {
                sequence,
                prog,
                outcome,
            } => {
                for delivery in self.sequencer.on_outcome(&sequence, prog, outcome) {
                    self.notifier.message(delivery);
                }
            }
            ProtocolEvent::PropertyUpdate { key, value } => {
                self.on_property_update(&key, value);
            }
            ProtocolEvent::ServerError { code, message } => {
                self.notifier.client(ClientEvent::ServerError {
                    code,
                    message: message.clone(),
                });
                warn!(code, reason = %message, "server closed the session");
                self.disconnect_terminal(events_rx);
            }
            ProtocolEvent::RecoveryAck { session_id } => {
                if self.session.session_id.as_deref() != Some(session_id.as_str()) {
                    warn!(%session_id, "recovery ack for an unexpected session");
                }
                self.session.recovery_started = None;
                self.session.retry_at = None;
                self.session.retry_attempt = 0;
                if let Some(kind) = self.link.as_ref().map(ConnectionHandle::kind) {
                    self.session.bound_kind = Some(kind);
                    self.set_status(ClientStatus::Connected(kind));
                }
                // Work accepted during the interruption rides the
                // recovered session.
                self.flush_deferred_work().await;
            }
            ProtocolEvent::RecoveryRejected { code, message } => {
                // Session too old or unknown: abandoned in favor of a
                // fresh one.
                debug!(code, reason = %message, "session recovery rejected");
                self.enter_will_retry(events_rx, "recovery rejected");
            }
            ProtocolEvent::MpnRegisterAck { device_id } => {
                let actions = self.mpn.on_register_ack(device_id);
                self.execute_mpn_actions(actions).await;
            }
            ProtocolEvent::MpnRegisterError { code, message } => {
                let actions = self.mpn.on_register_error(code, message);
                self.execute_mpn_actions(actions).await;
            }
            ProtocolEvent::MpnSubscriptionAck {
                requested,
                subscription_id,
            } => {
                let actions = self.mpn.on_subscription_ack(requested, subscription_id);
                self.execute_mpn_actions(actions).await;
            }
            ProtocolEvent::MpnSubscriptionError {
                requested,
                code,
                message,
            } => {
                let actions = self.mpn.on_subscription_error(requested, code, message);
                self.execute_mpn_actions(actions).await;
            }
            ProtocolEvent::MpnUnsubscriptionAck { subscription_id } => {
                let actions = self.mpn.on_unsubscription_ack(subscription_id);
                self.execute_mpn_actions(actions).await;
            }
            ProtocolEvent::MpnDeviceStatusChange { status, timestamp } => {
                let actions = self.mpn.on_device_status(status, timestamp);
                self.execute_mpn_actions(actions).await;
            }
            ProtocolEvent::MpnStatusChange {
                subscription_id,
                status,
                timestamp,
            } => {
                let actions = self.mpn.on_status_change(subscription_id, status, timestamp);
                self.execute_mpn_actions(actions).await;
            }
            ProtocolEvent::MpnSubscriptionList { subscriptions } => {
                let actions = self.mpn.on_subscription_list(subscriptions);
                self.execute_mpn_actions(actions).await;
            }
            ProtocolEvent::MpnPropertyChanged {
                subscription_id,
                property,
                value,
            } => {
                let actions = self.mpn.on_property_changed(subscription_id, property, value);
                self.execute_mpn_actions(actions).await;
            }
            ProtocolEvent::MpnModificationError {
                subscription_id,
                property,
                code,
                message,
            } => {
                let actions = self
                    .mpn
                    .on_modification_error(subscription_id, property, code, message);
                self.execute_mpn_actions(actions).await;
            }
            ProtocolEvent::ConnectionClosed { cause_code, reason } => {
                debug!(?cause_code, %reason, "server closed the connection");
                self.on_transport_lost(&reason, events_rx).await;
            }
        }
    }

    async fn on_session_created(
        &mut self,
        session_id: String,
        keepalive_ms: Option<u64>,
        control_link: Option<String>,
        server_socket_name: Option<String>,
        client_ip: Option<String>,
    ) {
        let kind = self
            .link
            .as_ref()
            .map(ConnectionHandle::kind)
            .unwrap_or(TransportKind::WsStreaming);
        self.session.session_id = Some(session_id.clone());
        self.session.bound_kind = Some(kind);
        self.session.retry_attempt = 0;
        self.session.retry_at = None;
        self.session.data_counter = 0;
        self.session.record_rx();

        // Fold the server-assigned session properties in, one
        // notification per changed property.
        let mut changed = Vec::new();
        {
            let mut details = self.shared.details.write();
            if details.session_id.as_deref() != Some(session_id.as_str()) {
                details.session_id = Some(session_id);
                changed.push(Property::SessionId);
            }
            if control_link.is_some() && details.server_instance_address != control_link {
                details.server_instance_address = control_link;
                changed.push(Property::ServerInstanceAddress);
            }
            if server_socket_name.is_some() && details.server_socket_name != server_socket_name {
                details.server_socket_name = server_socket_name;
                changed.push(Property::ServerSocketName);
            }
            if client_ip.is_some() && details.client_ip != client_ip {
                details.client_ip = client_ip;
                changed.push(Property::ClientIp);
            }
        }
        if let Some(keepalive) = keepalive_ms {
            let mut options = self.shared.options.write();
            if options.keepalive_interval != keepalive {
                options.keepalive_interval = keepalive;
                changed.push(Property::KeepaliveInterval);
            }
        }
        for property in changed {
            self.notify_property(property);
        }

        let forced = self.options().forced_transport;
        if !kind.is_streaming() || forced == Some(kind) {
            // Polling binds report themselves immediately; a forced
            // transport skips stream-sensing.
            self.set_status(ClientStatus::Connected(kind));
        } else {
            self.set_status(ClientStatus::StreamSensing);
        }

        // A new session starts from a clean slate: resubscribe active
        // subscriptions, flush held messages, re-register the device.
        let actions = self.registry.resubscribe_all();
        self.execute_registry_actions(actions).await;
        self.flush_unsent_messages().await;
        let actions = self.mpn.on_session_established();
        self.execute_mpn_actions(actions).await;
    }

    async fn flush_unsent_messages(&mut self) {
        for send in self.sequencer.unsent() {
            let request = ClientRequest::Message {
                sequence: send.sequence.clone(),
                prog: send.prog,
                payload: send.payload.clone(),
                delay_timeout_ms: send.delay_timeout_ms,
                ack: send.ack,
            };
            if self.send_request(request).await {
                self.sequencer.mark_sent(&send.sequence, send.prog);
            }
        }
    }

    /// Re-issue whatever was accepted while the link was down: subscribe
    /// requests without an ack, held messages, pending MPN subscribes.
    async fn flush_deferred_work(&mut self) {
        for request in self.registry.pending_subscribes() {
            self.send_request(request).await;
        }
        self.flush_unsent_messages().await;
        let actions = self.mpn.flush_pending();
        self.execute_mpn_actions(actions).await;
    }

    fn on_property_update(&mut self, key: &str, value: Option<String>) {
        let Ok(property) = Property::parse(key) else {
            debug!(key, "unknown property update");
            return;
        };
        match property {
            Property::RealMaxBandwidth => {
                self.shared.options.write().real_max_bandwidth = value;
            }
            Property::KeepaliveInterval => {
                if let Some(millis) = value.as_deref().and_then(|value| value.parse().ok()) {
                    self.shared.options.write().keepalive_interval = millis;
                }
            }
            Property::IdleTimeout => {
                if let Some(millis) = value.as_deref().and_then(|value| value.parse().ok()) {
                    self.shared.options.write().idle_timeout = millis;
                }
            }
            Property::PollingInterval => {
                if let Some(millis) = value.as_deref().and_then(|value| value.parse().ok()) {
                    self.shared.options.write().polling_interval = millis;
                }
            }
            Property::ClientIp => {
                self.shared.details.write().client_ip = value;
            }
            Property::ServerInstanceAddress => {
                self.shared.details.write().server_instance_address = value;
            }
            Property::ServerSocketName => {
                self.shared.details.write().server_socket_name = value;
            }
            other => {
                debug!(key = other.as_key(), "server pushed a client-side property");
                return;
            }
        }
        self.notify_property(property);
    }

    async fn on_transport_lost(&mut self, reason: &str, events_rx: &mut EventsRx) {
        if self.user_disconnect || self.session.status == ClientStatus::Disconnected {
            self.drop_link(events_rx);
            return;
        }
        debug!(reason, "transport lost");
        self.drop_link(events_rx);

        if self.session.status == ClientStatus::TryingRecovery {
            // The recovery attempt itself failed; back off and try again
            // until the recovery budget runs out.
            let options = self.options();
            self.session.schedule_retry(&options);
            return;
        }

        let options = self.options();
        if self.session.session_id.is_some() && options.session_recovery_timeout > 0 {
            self.begin_recovery(events_rx).await;
        } else {
            self.enter_will_retry(events_rx, reason);
        }
    }

    /// Attempt to rebind the same session after an interruption.
    async fn begin_recovery(&mut self, events_rx: &mut EventsRx) {
        if self.session.recovery_started.is_none() {
            self.session.recovery_started = Some(tokio::time::Instant::now());
        }
        self.set_status(ClientStatus::TryingRecovery);
        self.attempt_recovery(events_rx).await;
    }

    async fn attempt_recovery(&mut self, events_rx: &mut EventsRx) {
        let Some(session_id) = self.session.session_id.clone() else {
            self.enter_will_retry(events_rx, "no session to recover");
            return;
        };
        let kind = self
            .session
            .bound_kind
            .or_else(|| self.candidate_kinds().first().copied());
        let Some(kind) = kind else {
            self.enter_will_retry(events_rx, "no transport available");
            return;
        };
        self.drop_link(events_rx);
        if self.open_link(kind, events_rx).await {
            let recovery_from = self.session.data_counter;
            if self
                .send_request(ClientRequest::RecoverSession {
                    session_id,
                    recovery_from,
                })
                .await
            {
                return;
            }
        }
        // Connect failed; back off within the recovery budget.
        let options = self.options();
        self.session.schedule_retry(&options);
    }

    async fn handle_timer(&mut self, timer: Timer, events_rx: &mut EventsRx) {
        match timer {
            Timer::StreamSense => {
                // The streaming probe stayed silent: fall back to the
                // corresponding polling flavor on a fresh bind.
                let current = self.link.as_ref().map(ConnectionHandle::kind);
                let fallback = match current {
                    Some(TransportKind::WsStreaming) => TransportKind::WsPolling,
                    Some(TransportKind::HttpStreaming) => TransportKind::HttpPolling,
                    _ => {
                        // A polling bind is already in flight; push the
                        // deadline instead of spinning on it.
                        self.session.record_rx();
                        return;
                    }
                };
                debug!(?fallback, "stream sensing failed; falling back to polling");
                let Some(session_id) = self.session.session_id.clone() else {
                    self.enter_will_retry(events_rx, "stream sensing without a session");
                    return;
                };
                self.drop_link(events_rx);
                if self.open_link(fallback, events_rx).await {
                    self.session.bound_kind = Some(fallback);
                    self.send_request(ClientRequest::BindSession {
                        session_id,
                        polling: true,
                    })
                    .await;
                } else {
                    self.on_transport_lost("polling fallback failed", events_rx).await;
                }
            }
            Timer::Stalled => {
                if let ClientStatus::Connected(kind) = self.session.status {
                    self.session.pre_stall_kind = Some(kind);
                    self.set_status(ClientStatus::Stalled);
                }
            }
            Timer::Reconnect => {
                // Silence persisted past the reconnect budget.
                let options = self.options();
                if self.session.session_id.is_some() && options.session_recovery_timeout > 0 {
                    self.drop_link(events_rx);
                    self.begin_recovery(events_rx).await;
                } else {
                    self.enter_will_retry(events_rx, "stalled beyond reconnect timeout");
                }
            }
            Timer::Retry => {
                self.session.retry_at = None;
                if self.session.status == ClientStatus::TryingRecovery {
                    self.attempt_recovery(events_rx).await;
                } else {
                    self.start_connecting(events_rx).await;
                }
            }
            Timer::RecoveryLimit => {
                debug!("session recovery timed out; requesting a fresh session");
                self.enter_will_retry(events_rx, "recovery timeout");
            }
            Timer::Heartbeat => {
                self.send_request(ClientRequest::Heartbeat).await;
            }
        }
    }
}
