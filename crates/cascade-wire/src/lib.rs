// Wire grammar for the cascade push protocol: framing, session/control
// requests, server-pushed events, and the string tokens marshaled at the
// engine boundary.
use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

pub const MAGIC: u32 = 0x43534331;
pub const VERSION: u16 = 1;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid magic number")]
    InvalidMagic,
    #[error("unsupported version {0}")]
    UnsupportedVersion(u16),
    #[error("frame too large")]
    FrameTooLarge,
    #[error("incomplete frame")]
    Incomplete,
    #[error("failed to serialize message")]
    Serialize(serde_json::Error),
    #[error("failed to deserialize message")]
    Deserialize(serde_json::Error),
    #[error("unknown token: {0}")]
    UnknownToken(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u32,
    pub version: u16,
    pub flags: u16,
    pub length: u32,
}

impl FrameHeader {
    pub const LEN: usize = 12;

    pub fn new(flags: u16, length: u32) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            flags,
            length,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        // Network byte order throughout.
        buf.extend_from_slice(&self.magic.to_be_bytes());
        buf.extend_from_slice(&self.version.to_be_bytes());
        buf.extend_from_slice(&self.flags.to_be_bytes());
        buf.extend_from_slice(&self.length.to_be_bytes());
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        if buf.remaining() < Self::LEN {
            return Err(Error::Incomplete);
        }
        let magic = buf.get_u32();
        if magic != MAGIC {
            return Err(Error::InvalidMagic);
        }
        let version = buf.get_u16();
        if version != VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let flags = buf.get_u16();
        let length = buf.get_u32();
        Ok(Self {
            magic,
            version,
            flags,
            length,
        })
    }
}

/// Frame containing a header and payload.
///
/// ```
/// use bytes::Bytes;
/// use cascade_wire::Frame;
///
/// let frame = Frame::new(0, Bytes::from_static(b"hello")).expect("frame");
/// let encoded = frame.encode();
/// let decoded = Frame::decode(encoded).expect("decode");
/// assert_eq!(decoded.payload, Bytes::from_static(b"hello"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(flags: u16, payload: Bytes) -> Result<Self> {
        if payload.len() > u32::MAX as usize {
            return Err(Error::FrameTooLarge);
        }
        Ok(Self {
            header: FrameHeader::new(flags, payload.len() as u32),
            payload,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FrameHeader::LEN + self.payload.len());
        self.header.encode(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(input: Bytes) -> Result<Self> {
        if input.len() < FrameHeader::LEN {
            return Err(Error::Incomplete);
        }
        let header = FrameHeader::decode(input.slice(0..FrameHeader::LEN))?;
        let length = header.length as usize;
        if input.len() < FrameHeader::LEN + length {
            return Err(Error::Incomplete);
        }
        let payload = input.slice(FrameHeader::LEN..FrameHeader::LEN + length);
        Ok(Self { header, payload })
    }
}

/// Subscription mode, marshaled to the external "MERGE"/"DISTINCT"/"RAW"/
/// "COMMAND" tokens only at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionMode {
    Merge,
    Distinct,
    Raw,
    Command,
}

impl SubscriptionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionMode::Merge => "MERGE",
            SubscriptionMode::Distinct => "DISTINCT",
            SubscriptionMode::Raw => "RAW",
            SubscriptionMode::Command => "COMMAND",
        }
    }

    pub fn parse(token: &str) -> Result<Self> {
        match token {
            "MERGE" => Ok(SubscriptionMode::Merge),
            "DISTINCT" => Ok(SubscriptionMode::Distinct),
            "RAW" => Ok(SubscriptionMode::Raw),
            "COMMAND" => Ok(SubscriptionMode::Command),
            other => Err(Error::UnknownToken(other.to_string())),
        }
    }
}

/// Transport flavor bound to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    WsStreaming,
    HttpStreaming,
    WsPolling,
    HttpPolling,
}

impl TransportKind {
    pub fn is_streaming(&self) -> bool {
        matches!(self, TransportKind::WsStreaming | TransportKind::HttpStreaming)
    }

    /// External token as used in the forced-transport setting.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::WsStreaming => "WS-STREAMING",
            TransportKind::HttpStreaming => "HTTP-STREAMING",
            TransportKind::WsPolling => "WS-POLLING",
            TransportKind::HttpPolling => "HTTP-POLLING",
        }
    }

    pub fn parse(token: &str) -> Result<Self> {
        match token {
            "WS-STREAMING" => Ok(TransportKind::WsStreaming),
            "HTTP-STREAMING" => Ok(TransportKind::HttpStreaming),
            "WS-POLLING" => Ok(TransportKind::WsPolling),
            "HTTP-POLLING" => Ok(TransportKind::HttpPolling),
            other => Err(Error::UnknownToken(other.to_string())),
        }
    }
}

/// Client status, produced for consumers as the exact external tokens.
///
/// ```
/// use cascade_wire::{ClientStatus, TransportKind};
///
/// let status = ClientStatus::Connected(TransportKind::WsStreaming);
/// assert_eq!(status.as_str(), "CONNECTED:WS-STREAMING");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    Disconnected,
    WillRetry,
    TryingRecovery,
    Connecting,
    StreamSensing,
    Connected(TransportKind),
    Stalled,
}

impl ClientStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientStatus::Disconnected => "DISCONNECTED",
            ClientStatus::WillRetry => "DISCONNECTED:WILL-RETRY",
            ClientStatus::TryingRecovery => "DISCONNECTED:TRYING-RECOVERY",
            ClientStatus::Connecting => "CONNECTING",
            ClientStatus::StreamSensing => "CONNECTED:STREAM-SENSING",
            ClientStatus::Connected(TransportKind::WsStreaming) => "CONNECTED:WS-STREAMING",
            ClientStatus::Connected(TransportKind::HttpStreaming) => "CONNECTED:HTTP-STREAMING",
            ClientStatus::Connected(TransportKind::WsPolling) => "CONNECTED:WS-POLLING",
            ClientStatus::Connected(TransportKind::HttpPolling) => "CONNECTED:HTTP-POLLING",
            ClientStatus::Stalled => "STALLED",
        }
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(
            self,
            ClientStatus::Disconnected | ClientStatus::WillRetry | ClientStatus::TryingRecovery
        )
    }
}

impl std::fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session/connection property keys, marshaled to their canonical names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Property {
    AdapterSet,
    ServerAddress,
    User,
    Password,
    ContentLength,
    RequestedMaxBandwidth,
    ReverseHeartbeatInterval,
    HttpExtraHeaders,
    HttpExtraHeadersOnSessionCreationOnly,
    ForcedTransport,
    RetryDelay,
    FirstRetryMaxDelay,
    SessionRecoveryTimeout,
    StalledTimeout,
    ReconnectTimeout,
    SlowingEnabled,
    ServerInstanceAddressIgnored,
    CookieHandlingRequired,
    Proxy,
    ServerInstanceAddress,
    ServerSocketName,
    ClientIp,
    SessionId,
    RealMaxBandwidth,
    IdleTimeout,
    KeepaliveInterval,
    PollingInterval,
    CertificatePins,
}

impl Property {
    pub fn as_key(&self) -> &'static str {
        match self {
            Property::AdapterSet => "adapterSet",
            Property::ServerAddress => "serverAddress",
            Property::User => "user",
            Property::Password => "password",
            Property::ContentLength => "contentLength",
            Property::RequestedMaxBandwidth => "requestedMaxBandwidth",
            Property::ReverseHeartbeatInterval => "reverseHeartbeatInterval",
            Property::HttpExtraHeaders => "httpExtraHeaders",
            Property::HttpExtraHeadersOnSessionCreationOnly => {
                "httpExtraHeadersOnSessionCreationOnly"
            }
            Property::ForcedTransport => "forcedTransport",
            Property::RetryDelay => "retryDelay",
            Property::FirstRetryMaxDelay => "firstRetryMaxDelay",
            Property::SessionRecoveryTimeout => "sessionRecoveryTimeout",
            Property::StalledTimeout => "stalledTimeout",
            Property::ReconnectTimeout => "reconnectTimeout",
            Property::SlowingEnabled => "slowingEnabled",
            Property::ServerInstanceAddressIgnored => "serverInstanceAddressIgnored",
            Property::CookieHandlingRequired => "cookieHandlingRequired",
            Property::Proxy => "proxy",
            Property::ServerInstanceAddress => "serverInstanceAddress",
            Property::ServerSocketName => "serverSocketName",
            Property::ClientIp => "clientIp",
            Property::SessionId => "sessionId",
            Property::RealMaxBandwidth => "realMaxBandwidth",
            Property::IdleTimeout => "idleTimeout",
            Property::KeepaliveInterval => "keepaliveInterval",
            Property::PollingInterval => "pollingInterval",
            Property::CertificatePins => "certificatePins",
        }
    }

    pub fn parse(key: &str) -> Result<Self> {
        // Inverse of as_key; unknown keys are a protocol error.
        const ALL: &[Property] = &[
            Property::AdapterSet,
            Property::ServerAddress,
            Property::User,
            Property::Password,
            Property::ContentLength,
            Property::RequestedMaxBandwidth,
            Property::ReverseHeartbeatInterval,
            Property::HttpExtraHeaders,
            Property::HttpExtraHeadersOnSessionCreationOnly,
            Property::ForcedTransport,
            Property::RetryDelay,
            Property::FirstRetryMaxDelay,
            Property::SessionRecoveryTimeout,
            Property::StalledTimeout,
            Property::ReconnectTimeout,
            Property::SlowingEnabled,
            Property::ServerInstanceAddressIgnored,
            Property::CookieHandlingRequired,
            Property::Proxy,
            Property::ServerInstanceAddress,
            Property::ServerSocketName,
            Property::ClientIp,
            Property::SessionId,
            Property::RealMaxBandwidth,
            Property::IdleTimeout,
            Property::KeepaliveInterval,
            Property::PollingInterval,
            Property::CertificatePins,
        ];
        ALL.iter()
            .find(|property| property.as_key() == key)
            .copied()
            .ok_or_else(|| Error::UnknownToken(key.to_string()))
    }
}

/// MPN device status tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MpnDeviceStatus {
    Unknown,
    Registered,
    Suspended,
}

impl MpnDeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MpnDeviceStatus::Unknown => "UNKNOWN",
            MpnDeviceStatus::Registered => "REGISTERED",
            MpnDeviceStatus::Suspended => "SUSPENDED",
        }
    }
}

/// MPN subscription status tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MpnSubscriptionStatus {
    Unknown,
    Active,
    Subscribed,
    Triggered,
}

impl MpnSubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MpnSubscriptionStatus::Unknown => "UNKNOWN",
            MpnSubscriptionStatus::Active => "ACTIVE",
            MpnSubscriptionStatus::Subscribed => "SUBSCRIBED",
            MpnSubscriptionStatus::Triggered => "TRIGGERED",
        }
    }
}

/// One field delta inside an update event. Fields not mentioned by an
/// update are unchanged. A `json_patch` travels alongside the full value
/// and is surfaced to consumers verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: u32,
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub json_patch: Option<String>,
}

/// Terminal outcome of a sequenced message, as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutcomeKind {
    Processed {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        response: Option<String>,
    },
    Deny {
        code: i32,
        message: String,
    },
    Error,
    Discarded,
}

/// Server-side snapshot of one MPN subscription, pushed on registration
/// and on list refreshes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MpnSnapshot {
    pub subscription_id: String,
    pub mode: SubscriptionMode,
    pub group: String,
    pub schema: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data_adapter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub trigger: Option<String>,
    pub status: MpnSubscriptionStatus,
}

/// Events pushed by the server over a bound session.
///
/// ```
/// use cascade_wire::ProtocolEvent;
///
/// let event = ProtocolEvent::Sync { age_ms: 0 };
/// let frame = event.encode().expect("encode");
/// assert_eq!(ProtocolEvent::decode(frame).expect("decode"), event);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProtocolEvent {
    // Session acceptance for a create request.
    SessionCreated {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        keepalive_ms: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        control_link: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        server_socket_name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        client_ip: Option<String>,
    },
    // Rebind acceptance for an existing session.
    SessionBound {
        session_id: String,
    },
    // Keepalive/liveness tick; also the stream-sense probe answer.
    Sync {
        age_ms: u64,
    },
    // Server asks the client to rebind (end of polling cycle).
    LoopHint {
        expected_delay_ms: u64,
    },
    // Field-level delta for one item of one subscription.
    Update {
        subscription: u32,
        item: u32,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        key: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        command: Option<CommandVerb>,
        snapshot: bool,
        changes: Vec<FieldChange>,
    },
    EndOfSnapshot {
        subscription: u32,
        item: u32,
    },
    ClearSnapshot {
        subscription: u32,
        item: u32,
    },
    // Filtered-dispatch buffer pressure: the server dropped updates.
    Overflow {
        subscription: u32,
        item: u32,
        lost: u32,
    },
    SubscriptionAck {
        subscription: u32,
        items: u32,
        fields: u32,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        key_position: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        command_position: Option<u32>,
    },
    SubscriptionError {
        subscription: u32,
        code: i32,
        message: String,
    },
    UnsubscriptionAck {
        subscription: u32,
    },
    // The server's authoritative frequency cap for a subscription.
    RealMaxFrequency {
        subscription: u32,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        frequency: Option<String>,
    },
    MessageOutcome {
        sequence: String,
        prog: u32,
        outcome: OutcomeKind,
    },
    // Server-pushed session property change (realMaxBandwidth, ...).
    PropertyUpdate {
        key: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        value: Option<String>,
    },
    ServerError {
        code: i32,
        message: String,
    },
    RecoveryAck {
        session_id: String,
    },
    RecoveryRejected {
        code: i32,
        message: String,
    },
    MpnRegisterAck {
        device_id: String,
    },
    MpnRegisterError {
        code: i32,
        message: String,
    },
    MpnSubscriptionAck {
        requested: u32,
        subscription_id: String,
    },
    MpnSubscriptionError {
        requested: u32,
        code: i32,
        message: String,
    },
    MpnUnsubscriptionAck {
        subscription_id: String,
    },
    MpnDeviceStatusChange {
        status: MpnDeviceStatus,
        timestamp: u64,
    },
    MpnStatusChange {
        subscription_id: String,
        status: MpnSubscriptionStatus,
        timestamp: u64,
    },
    MpnSubscriptionList {
        subscriptions: Vec<MpnSnapshot>,
    },
    // Server-confirmed value after an MPN property modification.
    MpnPropertyChanged {
        subscription_id: String,
        property: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        value: Option<String>,
    },
    MpnModificationError {
        subscription_id: String,
        property: String,
        code: i32,
        message: String,
    },
    // Orderly transport closure initiated by the server.
    ConnectionClosed {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        cause_code: Option<i32>,
        reason: String,
    },
}

/// COMMAND-mode verbs carried by update events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandVerb {
    Add,
    Update,
    Delete,
}

/// Requests sent by the client over the control path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    CreateSession {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        adapter_set: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        user: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        password: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        requested_max_bandwidth: Option<String>,
        polling: bool,
    },
    BindSession {
        session_id: String,
        polling: bool,
    },
    // Rebind to a session interrupted mid-stream; `recovery_from` is the
    // count of data events the client has already consumed.
    RecoverSession {
        session_id: String,
        recovery_from: u64,
    },
    ForceRebind {
        session_id: String,
    },
    Destroy {
        session_id: String,
    },
    Subscribe {
        subscription: u32,
        mode: SubscriptionMode,
        group: String,
        schema: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        data_adapter: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        selector: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        snapshot: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        buffer_size: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        max_frequency: Option<String>,
    },
    Unsubscribe {
        subscription: u32,
    },
    ChangeFrequency {
        subscription: u32,
        max_frequency: String,
    },
    // Bandwidth renegotiation on a live session.
    Constrain {
        requested_max_bandwidth: String,
    },
    Message {
        sequence: String,
        prog: u32,
        payload: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        delay_timeout_ms: Option<u64>,
        // When false the server does not report an outcome.
        ack: bool,
    },
    Heartbeat,
    MpnRegister {
        platform: String,
        application_id: String,
        device_token: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        previous_device_token: Option<String>,
    },
    MpnSubscribe {
        requested: u32,
        device_id: String,
        coalescing: bool,
        mode: SubscriptionMode,
        group: String,
        schema: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        data_adapter: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        format: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        trigger: Option<String>,
    },
    MpnUnsubscribe {
        device_id: String,
        subscription_id: String,
    },
    MpnChangeFormat {
        device_id: String,
        subscription_id: String,
        format: String,
    },
    MpnChangeTrigger {
        device_id: String,
        subscription_id: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        trigger: Option<String>,
    },
}

impl ProtocolEvent {
    pub fn encode(&self) -> Result<Frame> {
        let payload = serde_json::to_vec(self).map_err(Error::Serialize)?;
        Frame::new(0, Bytes::from(payload))
    }

    pub fn decode(frame: Frame) -> Result<Self> {
        serde_json::from_slice(&frame.payload).map_err(Error::Deserialize)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(Error::Deserialize)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Error::Serialize)
    }
}

impl ClientRequest {
    pub fn encode(&self) -> Result<Frame> {
        let payload = serde_json::to_vec(self).map_err(Error::Serialize)?;
        Frame::new(0, Bytes::from(payload))
    }

    pub fn decode(frame: Frame) -> Result<Self> {
        serde_json::from_slice(&frame.payload).map_err(Error::Deserialize)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(Error::Deserialize)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Error::Serialize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let frame = Frame::new(0, Bytes::from_static(b"payload")).expect("frame");
        let decoded = Frame::decode(frame.encode()).expect("decode");
        assert_eq!(decoded.payload, Bytes::from_static(b"payload"));
    }

    #[test]
    fn decode_rejects_invalid_magic() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&0xDEADBEEFu32.to_be_bytes());
        buf.extend_from_slice(&VERSION.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        let err = FrameHeader::decode(buf.freeze()).expect_err("invalid magic");
        assert!(matches!(err, Error::InvalidMagic));
    }

    #[test]
    fn decode_rejects_truncated_payload() {
        let header = FrameHeader::new(0, 10);
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        buf.extend_from_slice(b"short");
        let err = Frame::decode(buf.freeze()).expect_err("incomplete");
        assert!(matches!(err, Error::Incomplete));
    }

    #[test]
    fn status_tokens_are_exact() {
        let cases = [
            (ClientStatus::Disconnected, "DISCONNECTED"),
            (ClientStatus::WillRetry, "DISCONNECTED:WILL-RETRY"),
            (ClientStatus::TryingRecovery, "DISCONNECTED:TRYING-RECOVERY"),
            (ClientStatus::Connecting, "CONNECTING"),
            (ClientStatus::StreamSensing, "CONNECTED:STREAM-SENSING"),
            (
                ClientStatus::Connected(TransportKind::WsStreaming),
                "CONNECTED:WS-STREAMING",
            ),
            (
                ClientStatus::Connected(TransportKind::HttpStreaming),
                "CONNECTED:HTTP-STREAMING",
            ),
            (
                ClientStatus::Connected(TransportKind::WsPolling),
                "CONNECTED:WS-POLLING",
            ),
            (
                ClientStatus::Connected(TransportKind::HttpPolling),
                "CONNECTED:HTTP-POLLING",
            ),
            (ClientStatus::Stalled, "STALLED"),
        ];
        for (status, token) in cases {
            assert_eq!(status.as_str(), token);
        }
    }

    #[test]
    fn mode_tokens_round_trip() {
        for mode in [
            SubscriptionMode::Merge,
            SubscriptionMode::Distinct,
            SubscriptionMode::Raw,
            SubscriptionMode::Command,
        ] {
            assert_eq!(SubscriptionMode::parse(mode.as_str()).expect("parse"), mode);
        }
        assert!(SubscriptionMode::parse("STREAM").is_err());
    }

    #[test]
    fn property_keys_round_trip() {
        for key in [
            "adapterSet",
            "serverAddress",
            "sessionId",
            "realMaxBandwidth",
            "httpExtraHeadersOnSessionCreationOnly",
            "certificatePins",
        ] {
            assert_eq!(Property::parse(key).expect("parse").as_key(), key);
        }
        assert!(Property::parse("unknownKey").is_err());
    }

    #[test]
    fn update_event_round_trip() {
        let event = ProtocolEvent::Update {
            subscription: 3,
            item: 1,
            key: Some("k1".to_string()),
            command: Some(CommandVerb::Add),
            snapshot: true,
            changes: vec![
                FieldChange {
                    field: 1,
                    value: Some("k1".to_string()),
                    json_patch: None,
                },
                FieldChange {
                    field: 3,
                    value: None,
                    json_patch: None,
                },
            ],
        };
        let frame = event.encode().expect("encode");
        assert_eq!(ProtocolEvent::decode(frame).expect("decode"), event);
    }

    #[test]
    fn unchanged_fields_are_absent_from_json() {
        let event = ProtocolEvent::Update {
            subscription: 1,
            item: 1,
            key: None,
            command: None,
            snapshot: false,
            changes: vec![FieldChange {
                field: 2,
                value: Some("v".to_string()),
                json_patch: None,
            }],
        };
        let json = event.to_json().expect("json");
        assert!(!json.contains("json_patch"));
        assert!(!json.contains("\"key\""));
    }

    #[test]
    fn message_request_round_trip() {
        let request = ClientRequest::Message {
            sequence: "orders".to_string(),
            prog: 7,
            payload: "buy 100".to_string(),
            delay_timeout_ms: Some(0),
            ack: true,
        };
        let frame = request.encode().expect("encode");
        assert_eq!(ClientRequest::decode(frame).expect("decode"), request);
    }

    #[test]
    fn outcome_kinds_round_trip() {
        for outcome in [
            OutcomeKind::Processed { response: None },
            OutcomeKind::Deny {
                code: -3,
                message: "refused".to_string(),
            },
            OutcomeKind::Error,
            OutcomeKind::Discarded,
        ] {
            let event = ProtocolEvent::MessageOutcome {
                sequence: "seq".to_string(),
                prog: 1,
                outcome: outcome.clone(),
            };
            let decoded = ProtocolEvent::decode(event.encode().expect("encode")).expect("decode");
            match decoded {
                ProtocolEvent::MessageOutcome { outcome: got, .. } => assert_eq!(got, outcome),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }
}
