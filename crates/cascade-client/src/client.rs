//! Public client facade.
//!
//! `CascadeClient` holds identity/config state and hands every operation
//! to the engine task; no public mutator blocks on network I/O. Inquiry
//! getters read a snapshot of shared state and may legitimately observe
//! the pre-command state right after a mutator returns.
use cascade_transport::{DefaultTransportFactory, TransportConfig, TransportFactory};
use cascade_wire::{ClientStatus, Property, TransportKind};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::{ConnectionDetails, ConnectionOptions, MaxBandwidth};
use crate::dispatch;
use crate::engine::{self, Command, EngineSeed, Notifier, Shared};
use crate::error::{ClientError, Result};
use crate::events::{ClientEvent, ClientListener, MessageListener};
use crate::mpn::{
    MpnDevice, MpnFilter, MpnRecords, MpnSubShared, MpnSubState, MpnSubscription,
};
use crate::subscription::{FieldAddressing, ItemAddressing, Subscription};

fn validate_server_address(address: &str) -> Result<()> {
    let ok = ["http://", "https://", "ws://", "wss://"]
        .iter()
        .any(|scheme| address.starts_with(scheme));
    if ok {
        Ok(())
    } else {
        Err(ClientError::argument(format!(
            "server address must be an http(s) or ws(s) URL: {address}"
        )))
    }
}

fn validate_sequence_name(sequence: &str) -> Result<()> {
    if sequence.is_empty() {
        return Err(ClientError::argument("sequence name must not be empty"));
    }
    if sequence.chars().any(char::is_whitespace) {
        return Err(ClientError::argument(format!(
            "sequence name must not contain whitespace: {sequence:?}"
        )));
    }
    Ok(())
}

/// One logical session against a push server.
///
/// Must be created inside a Tokio runtime: the constructor spawns the
/// protocol worker and the notification dispatcher.
pub struct CascadeClient {
    shared: Arc<Shared>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    client_listeners: Arc<RwLock<Vec<Arc<dyn ClientListener>>>>,
    subscriptions: RwLock<Vec<Subscription>>,
    mpn_records: MpnRecords,
    mpn_device: RwLock<Option<MpnDevice>>,
}

impl CascadeClient {
    /// Client over the default WebSocket/HTTP transports.
    pub fn new(server_address: Option<&str>, adapter_set: Option<&str>) -> Result<Self> {
        Self::with_transport(Arc::new(DefaultTransportFactory), server_address, adapter_set)
    }

    /// Client over a caller-supplied transport factory (tests substitute
    /// an in-process fake here).
    pub fn with_transport(
        factory: Arc<dyn TransportFactory>,
        server_address: Option<&str>,
        adapter_set: Option<&str>,
    ) -> Result<Self> {
        Self::with_options(
            factory,
            server_address,
            adapter_set,
            ConnectionOptions::default(),
        )
    }

    pub fn with_options(
        factory: Arc<dyn TransportFactory>,
        server_address: Option<&str>,
        adapter_set: Option<&str>,
        options: ConnectionOptions,
    ) -> Result<Self> {
        if let Some(address) = server_address {
            validate_server_address(address)?;
        }
        let details = ConnectionDetails {
            server_address: server_address.map(str::to_string),
            adapter_set: adapter_set.map(str::to_string),
            ..ConnectionDetails::default()
        };
        let shared = Arc::new(Shared::new(details, options));
        let client_listeners: Arc<RwLock<Vec<Arc<dyn ClientListener>>>> =
            Arc::new(RwLock::new(Vec::new()));
        let mpn_records: MpnRecords = Arc::new(RwLock::new(HashMap::new()));

        let (dispatcher, _dispatcher_task) = dispatch::spawn();
        let cmd_tx = engine::spawn(EngineSeed {
            shared: Arc::clone(&shared),
            notifier: Notifier::new(dispatcher, Arc::clone(&client_listeners)),
            factory,
            transport_config: TransportConfig::default(),
            mpn_records: Arc::clone(&mpn_records),
        });

        Ok(Self {
            shared,
            cmd_tx,
            client_listeners,
            subscriptions: RwLock::new(Vec::new()),
            mpn_records,
            mpn_device: RwLock::new(None),
        })
    }

    fn send_command(&self, command: Command) -> Result<()> {
        self.cmd_tx
            .send(command)
            .map_err(|_| ClientError::EngineGone)
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Open (or resume opening) a session. A no-op while connected.
    pub fn connect(&self) -> Result<()> {
        if self.shared.details.read().server_address.is_none() {
            return Err(ClientError::state(
                "connect requires a server address",
            ));
        }
        self.send_command(Command::Connect)
    }

    /// Close the session and the transport. A no-op while disconnected.
    /// Active subscriptions stay registered for the next session; pending
    /// messages are aborted.
    pub fn disconnect(&self) -> Result<()> {
        self.send_command(Command::Disconnect)
    }

    /// Current status, as one of the exact external tokens via
    /// `ClientStatus::as_str`.
    pub fn status(&self) -> ClientStatus {
        *self.shared.status.read()
    }

    // ── Listeners ───────────────────────────────────────────────────────

    pub fn add_listener(&self, listener: Arc<dyn ClientListener>) {
        self.client_listeners.write().push(Arc::clone(&listener));
        listener.on_event(&ClientEvent::ListenStart);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ClientListener>) {
        let mut listeners = self.client_listeners.write();
        if let Some(index) = listeners
            .iter()
            .position(|existing| Arc::ptr_eq(existing, listener))
        {
            let removed = listeners.swap_remove(index);
            drop(listeners);
            removed.on_event(&ClientEvent::ListenEnd);
        }
    }

    // ── Subscriptions ───────────────────────────────────────────────────

    /// Activate a subscription. The subscribe request rides the current
    /// session, or waits for one if none exists yet.
    pub fn subscribe(&self, subscription: &Subscription) -> Result<()> {
        {
            let mut state = subscription.inner.state.lock();
            if state.active {
                return Err(ClientError::state("subscription is already active"));
            }
            if state.items.is_none() {
                return Err(ClientError::argument(
                    "subscription needs an item list or group",
                ));
            }
            if state.fields.is_none() {
                return Err(ClientError::argument(
                    "subscription needs a field list or schema",
                ));
            }
            state.active = true;
        }
        *subscription.inner.engine.lock() = Some(self.cmd_tx.clone());
        self.subscriptions.write().push(subscription.clone());
        self.send_command(Command::Subscribe {
            shared: Arc::clone(&subscription.inner),
        })
    }

    /// Deactivate a subscription. Raises a state error if it is not
    /// active; performs no mutation in that case.
    pub fn unsubscribe(&self, subscription: &Subscription) -> Result<()> {
        {
            let mut state = subscription.inner.state.lock();
            if !state.active {
                return Err(ClientError::state("subscription is not active"));
            }
            state.active = false;
        }
        *subscription.inner.engine.lock() = None;
        self.subscriptions
            .write()
            .retain(|existing| !Arc::ptr_eq(&existing.inner, &subscription.inner));
        self.send_command(Command::Unsubscribe {
            shared: Arc::clone(&subscription.inner),
        })
    }

    /// The currently active subscriptions.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.subscriptions.read().clone()
    }

    // ── Messages ────────────────────────────────────────────────────────

    /// Fire-and-forget send on the unordered sequence.
    pub fn send_message(&self, payload: &str) -> Result<()> {
        self.send_message_with(payload, None, None, None, false)
    }

    /// Full-control send: named sequence, delay-timeout, outcome
    /// listener, and the hold-while-disconnected flag.
    pub fn send_message_with(
        &self,
        payload: &str,
        sequence: Option<&str>,
        delay_timeout_ms: Option<u64>,
        listener: Option<Arc<dyn MessageListener>>,
        enqueue_while_disconnected: bool,
    ) -> Result<()> {
        if let Some(sequence) = sequence {
            validate_sequence_name(sequence)?;
        }
        self.send_command(Command::SendMessage {
            payload: payload.to_string(),
            sequence: sequence.map(str::to_string),
            delay_timeout_ms,
            listener,
            enqueue_while_disconnected,
        })
    }

    // ── Connection details ──────────────────────────────────────────────

    pub fn server_address(&self) -> Option<String> {
        self.shared.details.read().server_address.clone()
    }

    pub fn set_server_address(&self, address: Option<&str>) -> Result<()> {
        if let Some(address) = address {
            validate_server_address(address)?;
        }
        if !self.status().is_disconnected() {
            return Err(ClientError::state(
                "server address can change only while disconnected",
            ));
        }
        let changed = {
            let mut details = self.shared.details.write();
            let next = address.map(str::to_string);
            if details.server_address == next {
                false
            } else {
                details.server_address = next;
                true
            }
        };
        if changed {
            self.send_command(Command::PropertyChanged {
                property: Property::ServerAddress,
            })?;
        }
        Ok(())
    }

    pub fn adapter_set(&self) -> Option<String> {
        self.shared.details.read().adapter_set.clone()
    }

    pub fn set_adapter_set(&self, adapter_set: Option<&str>) -> Result<()> {
        if !self.status().is_disconnected() {
            return Err(ClientError::state(
                "adapter set can change only while disconnected",
            ));
        }
        self.update_detail(Property::AdapterSet, |details| {
            let next = adapter_set.map(str::to_string);
            if details.adapter_set == next {
                false
            } else {
                details.adapter_set = next;
                true
            }
        })
    }

    pub fn user(&self) -> Option<String> {
        self.shared.details.read().user.clone()
    }

    /// Credential used at the next session creation.
    pub fn set_user(&self, user: Option<&str>) -> Result<()> {
        self.update_detail(Property::User, |details| {
            let next = user.map(str::to_string);
            if details.user == next {
                false
            } else {
                details.user = next;
                true
            }
        })
    }

    pub fn set_password(&self, password: Option<&str>) -> Result<()> {
        self.update_detail(Property::Password, |details| {
            let next = password.map(str::to_string);
            if details.password == next {
                false
            } else {
                details.password = next;
                true
            }
        })
    }

    /// Server-assigned session id, unset while disconnected.
    pub fn session_id(&self) -> Option<String> {
        self.shared.details.read().session_id.clone()
    }

    pub fn server_instance_address(&self) -> Option<String> {
        self.shared.details.read().server_instance_address.clone()
    }

    pub fn server_socket_name(&self) -> Option<String> {
        self.shared.details.read().server_socket_name.clone()
    }

    pub fn client_ip(&self) -> Option<String> {
        self.shared.details.read().client_ip.clone()
    }

    fn update_detail(
        &self,
        property: Property,
        mutate: impl FnOnce(&mut ConnectionDetails) -> bool,
    ) -> Result<()> {
        let changed = mutate(&mut self.shared.details.write());
        if changed {
            self.send_command(Command::PropertyChanged { property })?;
        }
        Ok(())
    }

    // ── Connection options ──────────────────────────────────────────────

    pub fn options(&self) -> ConnectionOptions {
        self.shared.options.read().clone()
    }

    fn update_option(
        &self,
        property: Property,
        mutate: impl FnOnce(&mut ConnectionOptions) -> bool,
    ) -> Result<()> {
        let changed = mutate(&mut self.shared.options.write());
        if changed {
            self.send_command(Command::PropertyChanged { property })?;
        }
        Ok(())
    }

    pub fn set_retry_delay(&self, millis: u64) -> Result<()> {
        if millis == 0 {
            return Err(ClientError::argument("retry delay must be positive"));
        }
        self.update_option(Property::RetryDelay, |options| {
            if options.retry_delay == millis {
                false
            } else {
                options.retry_delay = millis;
                true
            }
        })
    }

    pub fn set_first_retry_max_delay(&self, millis: u64) -> Result<()> {
        if millis == 0 {
            return Err(ClientError::argument("delay must be positive"));
        }
        self.update_option(Property::FirstRetryMaxDelay, |options| {
            if options.first_retry_max_delay == millis {
                false
            } else {
                options.first_retry_max_delay = millis;
                true
            }
        })
    }

    pub fn set_stalled_timeout(&self, millis: u64) -> Result<()> {
        if millis == 0 {
            return Err(ClientError::argument("stalled timeout must be positive"));
        }
        self.update_option(Property::StalledTimeout, |options| {
            if options.stalled_timeout == millis {
                false
            } else {
                options.stalled_timeout = millis;
                true
            }
        })
    }

    pub fn set_reconnect_timeout(&self, millis: u64) -> Result<()> {
        if millis == 0 {
            return Err(ClientError::argument("reconnect timeout must be positive"));
        }
        self.update_option(Property::ReconnectTimeout, |options| {
            if options.reconnect_timeout == millis {
                false
            } else {
                options.reconnect_timeout = millis;
                true
            }
        })
    }

    /// Zero disables session recovery entirely.
    pub fn set_session_recovery_timeout(&self, millis: u64) -> Result<()> {
        self.update_option(Property::SessionRecoveryTimeout, |options| {
            if options.session_recovery_timeout == millis {
                false
            } else {
                options.session_recovery_timeout = millis;
                true
            }
        })
    }

    pub fn set_reverse_heartbeat_interval(&self, millis: u64) -> Result<()> {
        self.update_option(Property::ReverseHeartbeatInterval, |options| {
            if options.reverse_heartbeat_interval == millis {
                false
            } else {
                options.reverse_heartbeat_interval = millis;
                true
            }
        })
    }

    pub fn set_content_length(&self, bytes: u64) -> Result<()> {
        if bytes == 0 {
            return Err(ClientError::argument("content length must be positive"));
        }
        self.update_option(Property::ContentLength, |options| {
            if options.content_length == bytes {
                false
            } else {
                options.content_length = bytes;
                true
            }
        })
    }

    pub fn set_polling_interval(&self, millis: u64) -> Result<()> {
        self.update_option(Property::PollingInterval, |options| {
            if options.polling_interval == millis {
                false
            } else {
                options.polling_interval = millis;
                true
            }
        })
    }

    pub fn set_slowing_enabled(&self, enabled: bool) -> Result<()> {
        self.update_option(Property::SlowingEnabled, |options| {
            if options.slowing_enabled == enabled {
                false
            } else {
                options.slowing_enabled = enabled;
                true
            }
        })
    }

    pub fn set_server_instance_address_ignored(&self, ignored: bool) -> Result<()> {
        self.update_option(Property::ServerInstanceAddressIgnored, |options| {
            if options.server_instance_address_ignored == ignored {
                false
            } else {
                options.server_instance_address_ignored = ignored;
                true
            }
        })
    }

    pub fn set_cookie_handling_required(&self, required: bool) -> Result<()> {
        self.update_option(Property::CookieHandlingRequired, |options| {
            if options.cookie_handling_required == required {
                false
            } else {
                options.cookie_handling_required = required;
                true
            }
        })
    }

    pub fn set_proxy(&self, proxy: Option<&str>) -> Result<()> {
        self.update_option(Property::Proxy, |options| {
            let next = proxy.map(str::to_string);
            if options.proxy == next {
                false
            } else {
                options.proxy = next;
                true
            }
        })
    }

    pub fn set_certificate_pins(&self, pins: &[&str]) -> Result<()> {
        let next: Vec<String> = pins.iter().map(|pin| pin.to_string()).collect();
        self.update_option(Property::CertificatePins, |options| {
            if options.certificate_pins == next {
                false
            } else {
                options.certificate_pins = next;
                true
            }
        })
    }

    pub fn set_http_extra_headers(&self, headers: &[(&str, &str)], on_creation_only: bool) -> Result<()> {
        let next: Vec<(String, String)> = headers
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();
        self.update_option(Property::HttpExtraHeaders, |options| {
            let mut changed = false;
            if options.http_extra_headers != next {
                options.http_extra_headers = next;
                changed = true;
            }
            if options.http_extra_headers_on_session_creation_only != on_creation_only {
                options.http_extra_headers_on_session_creation_only = on_creation_only;
                changed = true;
            }
            changed
        })
    }

    /// Pin the transport flavor; `None` restores full stream-sensing.
    /// Applies from the next session.
    pub fn set_forced_transport(&self, transport: Option<TransportKind>) -> Result<()> {
        self.update_option(Property::ForcedTransport, |options| {
            if options.forced_transport == transport {
                false
            } else {
                options.forced_transport = transport;
                true
            }
        })
    }

    /// Renegotiate bandwidth; forwarded live when a session is up. The
    /// authoritative value comes back as the `realMaxBandwidth` property.
    pub fn set_requested_max_bandwidth(&self, bandwidth: MaxBandwidth) -> Result<()> {
        self.update_option(Property::RequestedMaxBandwidth, |options| {
            if options.requested_max_bandwidth == bandwidth {
                false
            } else {
                options.requested_max_bandwidth = bandwidth;
                true
            }
        })
    }

    pub fn real_max_bandwidth(&self) -> Option<String> {
        self.shared.options.read().real_max_bandwidth.clone()
    }

    // ── MPN ─────────────────────────────────────────────────────────────

    /// Adopt a device for push notifications. Legal at any time; the
    /// registration request goes out once a session is available.
    pub fn register_for_mpn(&self, device: &MpnDevice) -> Result<()> {
        *self.mpn_device.write() = Some(device.clone());
        self.send_command(Command::RegisterMpnDevice {
            shared: Arc::clone(&device.inner),
        })
    }

    pub fn mpn_device(&self) -> Option<MpnDevice> {
        self.mpn_device.read().clone()
    }

    /// Activate an MPN subscription. With `coalescing`, an equivalent
    /// pre-existing server-side subscription is reused instead of
    /// creating a new entity.
    pub fn subscribe_mpn(&self, subscription: &MpnSubscription, coalescing: bool) -> Result<()> {
        if self.mpn_device.read().is_none() {
            return Err(ClientError::state("no MPN device is registered"));
        }
        {
            let mut state = subscription.inner.state.lock();
            if state.active {
                return Err(ClientError::state("MPN subscription is already active"));
            }
            if state.items.is_none() {
                return Err(ClientError::argument(
                    "MPN subscription needs an item list or group",
                ));
            }
            if state.fields.is_none() {
                return Err(ClientError::argument(
                    "MPN subscription needs a field list or schema",
                ));
            }
            state.active = true;
        }
        *subscription.inner.engine.lock() = Some(self.cmd_tx.clone());
        self.send_command(Command::MpnSubscribe {
            shared: Arc::clone(&subscription.inner),
            coalescing,
        })
    }

    pub fn unsubscribe_mpn(&self, subscription: &MpnSubscription) -> Result<()> {
        if !subscription.is_active() {
            return Err(ClientError::state("MPN subscription is not active"));
        }
        self.send_command(Command::MpnUnsubscribe {
            shared: Arc::clone(&subscription.inner),
        })
    }

    /// Bulk unsubscription; filter is `None`/"ALL", "SUBSCRIBED" or
    /// "TRIGGERED".
    pub fn unsubscribe_mpn_subscriptions(&self, filter: Option<&str>) -> Result<()> {
        let filter = MpnFilter::parse(filter)?;
        self.send_command(Command::MpnUnsubscribeFiltered { filter })
    }

    /// Handles onto the server-side MPN subscription collection. Each
    /// handle resolves through the shared record for its subscription id.
    pub fn mpn_subscriptions(&self, filter: Option<&str>) -> Result<Vec<MpnSubscription>> {
        let filter = MpnFilter::parse(filter)?;
        let mut handles = Vec::new();
        let mut records = self.mpn_records.write();
        let ids: Vec<String> = records
            .iter()
            .filter(|(_, record)| filter.matches(record.status))
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            let record = records.get_mut(&id).expect("record just listed");
            let shared = Arc::new(MpnSubShared {
                state: parking_lot::Mutex::new(MpnSubState {
                    mode: record.mode,
                    items: Some(ItemAddressing::Group(record.group.clone())),
                    fields: Some(FieldAddressing::Schema(record.schema.clone())),
                    data_adapter: record.data_adapter.clone(),
                    requested_format: record.format.clone(),
                    requested_trigger: record.trigger.clone(),
                    status: record.status,
                    status_timestamp: record.status_timestamp,
                    subscription_id: Some(id.clone()),
                    active: true,
                }),
                listeners: RwLock::new(Vec::new()),
                engine: parking_lot::Mutex::new(Some(self.cmd_tx.clone())),
                records: parking_lot::Mutex::new(Some(Arc::clone(&self.mpn_records))),
            });
            record.handles.push(Arc::downgrade(&shared));
            handles.push(MpnSubscription { inner: shared });
        }
        Ok(handles)
    }

    /// Resolve one MPN subscription by its server-assigned id.
    pub fn find_mpn_subscription(&self, subscription_id: &str) -> Option<MpnSubscription> {
        let mut records = self.mpn_records.write();
        let record = records.get_mut(subscription_id)?;
        let shared = Arc::new(MpnSubShared {
            state: parking_lot::Mutex::new(MpnSubState {
                mode: record.mode,
                items: Some(ItemAddressing::Group(record.group.clone())),
                fields: Some(FieldAddressing::Schema(record.schema.clone())),
                data_adapter: record.data_adapter.clone(),
                requested_format: record.format.clone(),
                requested_trigger: record.trigger.clone(),
                status: record.status,
                status_timestamp: record.status_timestamp,
                subscription_id: Some(subscription_id.to_string()),
                active: true,
            }),
            listeners: RwLock::new(Vec::new()),
            engine: parking_lot::Mutex::new(Some(self.cmd_tx.clone())),
            records: parking_lot::Mutex::new(Some(Arc::clone(&self.mpn_records))),
        });
        record.handles.push(Arc::downgrade(&shared));
        Some(MpnSubscription { inner: shared })
    }
}

impl Drop for CascadeClient {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
    }
}

#[cfg(test)]
mod facade_tests {
    use super::*;
    use cascade_transport::mock::MockFactory;
    use cascade_wire::SubscriptionMode;

    fn client() -> CascadeClient {
        let (factory, _servers) = MockFactory::new(vec![TransportKind::WsStreaming]);
        CascadeClient::with_transport(factory, Some("http://push.example.com"), Some("DEMO"))
            .expect("client")
    }

    #[tokio::test]
    async fn rejects_bad_server_addresses() {
        let (factory, _servers) = MockFactory::new(vec![TransportKind::WsStreaming]);
        assert!(matches!(
            CascadeClient::with_transport(factory, Some("push.example.com"), None),
            Err(ClientError::IllegalArgument(_))
        ));
    }

    #[tokio::test]
    async fn connect_requires_a_server_address() {
        let (factory, _servers) = MockFactory::new(vec![TransportKind::WsStreaming]);
        let client = CascadeClient::with_transport(factory, None, None).expect("client");
        assert!(matches!(client.connect(), Err(ClientError::IllegalState(_))));
    }

    #[tokio::test]
    async fn double_subscribe_is_a_state_error() {
        let client = client();
        let subscription =
            Subscription::with_items(SubscriptionMode::Merge, &["item1"], &["field1"])
                .expect("subscription");
        client.subscribe(&subscription).expect("first subscribe");
        assert!(matches!(
            client.subscribe(&subscription),
            Err(ClientError::IllegalState(_))
        ));
    }

    #[tokio::test]
    async fn unsubscribe_of_inactive_subscription_is_a_state_error() {
        let client = client();
        let subscription =
            Subscription::with_items(SubscriptionMode::Merge, &["item1"], &["field1"])
                .expect("subscription");
        assert!(matches!(
            client.unsubscribe(&subscription),
            Err(ClientError::IllegalState(_))
        ));
        assert!(!subscription.is_active());
    }

    #[tokio::test]
    async fn subscribe_requires_addressing() {
        let client = client();
        let incomplete = Subscription::new(SubscriptionMode::Merge);
        incomplete.set_items(&["item1"]).expect("items");
        assert!(matches!(
            client.subscribe(&incomplete),
            Err(ClientError::IllegalArgument(_))
        ));
        assert!(!incomplete.is_active());
    }

    #[tokio::test]
    async fn mpn_subscribe_requires_a_device() {
        let client = client();
        let subscription = MpnSubscription::new(SubscriptionMode::Merge).expect("mpn");
        subscription.set_items(&["item1"]).expect("items");
        subscription.set_fields(&["field1"]).expect("fields");
        assert!(matches!(
            client.subscribe_mpn(&subscription, false),
            Err(ClientError::IllegalState(_))
        ));
    }

    #[tokio::test]
    async fn invalid_mpn_filter_is_an_argument_error() {
        let client = client();
        assert!(matches!(
            client.unsubscribe_mpn_subscriptions(Some("NEITHER")),
            Err(ClientError::IllegalArgument(_))
        ));
    }

    #[tokio::test]
    async fn sequence_names_are_validated() {
        let client = client();
        assert!(client
            .send_message_with("payload", Some("bad seq"), None, None, false)
            .is_err());
        client
            .send_message_with("payload", Some("orders"), None, None, false)
            .expect("valid sequence");
    }

    #[tokio::test]
    async fn property_setters_round_trip() {
        let client = client();
        client.set_retry_delay(9_000).expect("retry delay");
        assert_eq!(client.options().retry_delay, 9_000);
        client.set_user(Some("alice")).expect("user");
        assert_eq!(client.user(), Some("alice".to_string()));
        assert!(client.set_retry_delay(0).is_err());
    }
}
