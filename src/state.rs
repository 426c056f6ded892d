//! Observable cast state published upward to view-model layers.
//!
//! Each field is an independent `watch` cell so consumers can subscribe to
//! exactly the values they render. Connection fields are written only by the
//! session manager, transport fields only by the poller (and optimistic
//! volume updates).

use tokio::sync::watch;

use crate::protocol::CastConnectionState;

/// Last sampled remote transport state; overwritten by every poll.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RemoteTransportSnapshot {
    pub position_ms: u64,
    pub duration_ms: u64,
    pub is_playing: bool,
    pub is_buffering: bool,
    pub volume: f32,
}

pub struct CastState {
    connection_state: watch::Sender<CastConnectionState>,
    is_connected: watch::Sender<bool>,
    is_connecting: watch::Sender<bool>,
    device_name: watch::Sender<Option<String>>,
    position_ms: watch::Sender<u64>,
    duration_ms: watch::Sender<u64>,
    is_playing: watch::Sender<bool>,
    is_buffering: watch::Sender<bool>,
    volume: watch::Sender<f32>,
}

impl Default for CastState {
    fn default() -> Self {
        Self::new()
    }
}

fn set_if_changed<T: PartialEq>(cell: &watch::Sender<T>, value: T) {
    cell.send_if_modified(|current| {
        if *current == value {
            false
        } else {
            *current = value;
            true
        }
    });
}

impl CastState {
    pub fn new() -> Self {
        Self {
            connection_state: watch::Sender::new(CastConnectionState::Idle),
            is_connected: watch::Sender::new(false),
            is_connecting: watch::Sender::new(false),
            device_name: watch::Sender::new(None),
            position_ms: watch::Sender::new(0),
            duration_ms: watch::Sender::new(0),
            is_playing: watch::Sender::new(false),
            is_buffering: watch::Sender::new(false),
            volume: watch::Sender::new(1.0),
        }
    }

    pub fn connection_state(&self) -> CastConnectionState {
        *self.connection_state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        *self.is_connected.borrow()
    }

    pub fn is_connecting(&self) -> bool {
        *self.is_connecting.borrow()
    }

    pub fn device_name(&self) -> Option<String> {
        self.device_name.borrow().clone()
    }

    pub fn position_ms(&self) -> u64 {
        *self.position_ms.borrow()
    }

    pub fn duration_ms(&self) -> u64 {
        *self.duration_ms.borrow()
    }

    pub fn is_playing(&self) -> bool {
        *self.is_playing.borrow()
    }

    pub fn is_buffering(&self) -> bool {
        *self.is_buffering.borrow()
    }

    pub fn volume(&self) -> f32 {
        *self.volume.borrow()
    }

    pub fn subscribe_connection_state(&self) -> watch::Receiver<CastConnectionState> {
        self.connection_state.subscribe()
    }

    pub fn subscribe_connected(&self) -> watch::Receiver<bool> {
        self.is_connected.subscribe()
    }

    pub fn subscribe_connecting(&self) -> watch::Receiver<bool> {
        self.is_connecting.subscribe()
    }

    pub fn subscribe_device_name(&self) -> watch::Receiver<Option<String>> {
        self.device_name.subscribe()
    }

    pub fn subscribe_position(&self) -> watch::Receiver<u64> {
        self.position_ms.subscribe()
    }

    pub fn subscribe_duration(&self) -> watch::Receiver<u64> {
        self.duration_ms.subscribe()
    }

    pub fn subscribe_playing(&self) -> watch::Receiver<bool> {
        self.is_playing.subscribe()
    }

    pub fn subscribe_buffering(&self) -> watch::Receiver<bool> {
        self.is_buffering.subscribe()
    }

    pub fn subscribe_volume(&self) -> watch::Receiver<f32> {
        self.volume.subscribe()
    }

    pub fn snapshot(&self) -> RemoteTransportSnapshot {
        RemoteTransportSnapshot {
            position_ms: self.position_ms(),
            duration_ms: self.duration_ms(),
            is_playing: self.is_playing(),
            is_buffering: self.is_buffering(),
            volume: self.volume(),
        }
    }

    pub(crate) fn set_connection_state(&self, state: CastConnectionState) {
        set_if_changed(&self.connection_state, state);
        set_if_changed(&self.is_connected, state == CastConnectionState::Connected);
        set_if_changed(
            &self.is_connecting,
            matches!(
                state,
                CastConnectionState::Discovering | CastConnectionState::Connecting
            ),
        );
    }

    pub(crate) fn set_device_name(&self, name: Option<String>) {
        set_if_changed(&self.device_name, name);
    }

    pub(crate) fn set_volume(&self, volume: f32) {
        set_if_changed(&self.volume, volume);
    }

    pub(crate) fn publish_snapshot(&self, snapshot: &RemoteTransportSnapshot) {
        set_if_changed(&self.position_ms, snapshot.position_ms);
        set_if_changed(&self.duration_ms, snapshot.duration_ms);
        set_if_changed(&self.is_playing, snapshot.is_playing);
        set_if_changed(&self.is_buffering, snapshot.is_buffering);
        set_if_changed(&self.volume, snapshot.volume);
    }

    /// Resets transport fields; volume keeps its last known value.
    pub(crate) fn clear_transport(&self) {
        set_if_changed(&self.position_ms, 0);
        set_if_changed(&self.duration_ms, 0);
        set_if_changed(&self.is_playing, false);
        set_if_changed(&self.is_buffering, false);
    }
}
