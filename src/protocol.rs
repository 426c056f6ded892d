//! Event-bus protocol shared by the cast bridge and the local player.
//!
//! The bridge publishes cast notifications and local-player intents as
//! `Message` values on a `tokio::sync::broadcast` bus; the local player and
//! UI layers subscribe to the variants they care about.

/// Top-level envelope for all bus traffic.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Cast(CastMessage),
    Playback(PlaybackMessage),
}

/// Connection lifecycle of one cast session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CastConnectionState {
    #[default]
    Idle,
    Discovering,
    Connecting,
    Connected,
    Disconnecting,
}

/// A cast receiver found on the local network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CastDeviceInfo {
    /// Stable receiver id (mDNS `id` TXT record, or host/address fallback).
    pub id: String,
    /// Human-readable name shown to the user.
    pub name: String,
    pub model: String,
    pub host: String,
    pub address: String,
    pub port: u16,
}

/// Cast-domain notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum CastMessage {
    DevicesUpdated(Vec<CastDeviceInfo>),
    ConnectionStateChanged {
        state: CastConnectionState,
        device: Option<CastDeviceInfo>,
        reason: Option<String>,
    },
    /// A new window of items was pushed to the receiver.
    QueueMirrored {
        item_ids: Vec<String>,
        current_index: usize,
    },
    /// Sampling failed repeatedly; the session is no longer trustworthy.
    ReceiverUnreachable {
        reason: String,
    },
    /// Loading an item onto the receiver failed; the caller decides the fallback.
    LoadFailed {
        item_id: String,
        reason: String,
    },
}

/// Intents addressed to the local player, originated by the remote receiver.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackMessage {
    Play,
    Pause,
    SeekMs(u64),
    SkipToItem(String),
}
