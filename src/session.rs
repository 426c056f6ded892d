//! Cast session manager: the public handler the rest of the player talks to.
//!
//! Owns the connection lifecycle (`Idle -> Discovering -> Connecting ->
//! Connected -> Disconnecting -> Idle`), routes transport commands through the
//! playback bridge, drives the queue mirror and keeps the transport poller
//! running while a receiver is connected. Connection state is written only
//! here; transport state only by the poller.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, warn};
use tokio::sync::broadcast::Sender;
use tokio_util::sync::CancellationToken;

use crate::anti_echo::{AntiEchoFlag, EchoOrigin};
use crate::bridge::{LocalChange, PlaybackBridge, TransportCommand};
use crate::config::CastConfig;
use crate::errors::CastError;
use crate::media::MediaMetadataProvider;
use crate::poller::TransportPoller;
use crate::protocol::{CastConnectionState, CastDeviceInfo, CastMessage, Message};
use crate::queue_mirror::{LoadOutcome, MirroredQueue, QueueMirror, SkipDirection, SkipOutcome};
use crate::receiver::{CastTransport, ReceiverSession, RemoteStatus};
use crate::state::CastState;
use crate::token::TokenGenerator;

struct ActiveSession {
    serial: u64,
    device: CastDeviceInfo,
    receiver: Arc<dyn ReceiverSession>,
    scope: CancellationToken,
}

#[derive(Default)]
struct SessionSlot {
    known_devices: Vec<CastDeviceInfo>,
    next_serial: u64,
    attempt: Option<(u64, CancellationToken)>,
    active: Option<ActiveSession>,
}

/// Marks one reload in progress; sampling resumes only once none remain.
struct LoadInFlight<'a> {
    counter: &'a AtomicUsize,
    left: bool,
}

impl<'a> LoadInFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self {
            counter,
            left: false,
        }
    }

    /// Leaves the count; true when this was the last reload running.
    fn finish(mut self) -> bool {
        self.left = true;
        self.counter.fetch_sub(1, Ordering::AcqRel) == 1
    }
}

impl Drop for LoadInFlight<'_> {
    fn drop(&mut self) {
        if !self.left {
            self.counter.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl SessionSlot {
    fn next_serial(&mut self) -> u64 {
        self.next_serial += 1;
        self.next_serial
    }
}

pub struct CastSessionManager {
    config: CastConfig,
    transport: Arc<dyn CastTransport>,
    state: Arc<CastState>,
    bus_producer: Sender<Message>,
    mirror: Arc<QueueMirror>,
    bridge: Arc<PlaybackBridge>,
    poller: TransportPoller,
    loads_in_flight: AtomicUsize,
    slot: Mutex<SessionSlot>,
    /// Serializes connect, disconnect and discovery; never held by commands.
    lifecycle: tokio::sync::Mutex<()>,
    scope: CancellationToken,
    released: AtomicBool,
}

impl CastSessionManager {
    pub fn new(
        config: CastConfig,
        transport: Arc<dyn CastTransport>,
        provider: Arc<dyn MediaMetadataProvider>,
        bus_producer: Sender<Message>,
    ) -> Self {
        let state = Arc::new(CastState::new());
        let poller = TransportPoller::new(
            config.poll_interval(),
            config.status_timeout(),
            config.max_poll_failures,
            Arc::clone(&state),
            bus_producer.clone(),
        );
        Self {
            mirror: Arc::new(QueueMirror::new(provider, bus_producer.clone())),
            bridge: Arc::new(PlaybackBridge::new(
                AntiEchoFlag::new(config.echo_grace()),
                bus_producer.clone(),
            )),
            poller,
            loads_in_flight: AtomicUsize::new(0),
            state,
            config,
            transport,
            bus_producer,
            slot: Mutex::new(SessionSlot::default()),
            lifecycle: tokio::sync::Mutex::new(()),
            scope: CancellationToken::new(),
            released: AtomicBool::new(false),
        }
    }

    fn slot(&self) -> MutexGuard<'_, SessionSlot> {
        match self.slot.lock() {
            Ok(locked) => locked,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn ensure_live(&self) -> Result<(), CastError> {
        if self.released.load(Ordering::Acquire) {
            Err(CastError::Released)
        } else {
            Ok(())
        }
    }

    /// Observable connection and transport state.
    pub fn state(&self) -> Arc<CastState> {
        Arc::clone(&self.state)
    }

    pub fn connected_device(&self) -> Option<CastDeviceInfo> {
        self.slot()
            .active
            .as_ref()
            .map(|active| active.device.clone())
    }

    pub fn known_devices(&self) -> Vec<CastDeviceInfo> {
        self.slot().known_devices.clone()
    }

    pub fn mirrored_queue(&self) -> Option<MirroredQueue> {
        self.mirror.snapshot()
    }

    /// True while a remote-originated change is being applied to the local player.
    pub fn is_syncing_from_cast(&self) -> bool {
        !self.released.load(Ordering::Acquire) && self.bridge.is_syncing_from_remote()
    }

    /// Attaches the generator used to authorize stream urls; `None` detaches it.
    pub fn set_stream_session(
        &self,
        generator: Option<Arc<TokenGenerator>>,
        session_id: Option<String>,
    ) {
        self.mirror.set_stream_authorization(generator, session_id);
    }

    fn transition(
        &self,
        state: CastConnectionState,
        device: Option<&CastDeviceInfo>,
        reason: Option<String>,
    ) {
        debug!("CastSession: connection state -> {:?}", state);
        self.state.set_connection_state(state);
        let _ = self
            .bus_producer
            .send(Message::Cast(CastMessage::ConnectionStateChanged {
                state,
                device: device.cloned(),
                reason,
            }));
    }

    async fn discover_until_cancelled(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<CastDeviceInfo>, CastError> {
        let devices = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CastError::Cancelled),
            devices = self.transport.discover() => devices?,
        };
        info!("CastSession: discovered {} cast device(s)", devices.len());
        self.slot().known_devices = devices.clone();
        let _ = self
            .bus_producer
            .send(Message::Cast(CastMessage::DevicesUpdated(devices.clone())));
        Ok(devices)
    }

    pub async fn discover_devices(&self) -> Result<Vec<CastDeviceInfo>, CastError> {
        self.ensure_live()?;
        let _lifecycle = self.lifecycle.lock().await;
        let was_idle = self.state.connection_state() == CastConnectionState::Idle;
        if was_idle {
            self.transition(CastConnectionState::Discovering, None, None);
        }
        let result = self.discover_until_cancelled(&self.scope).await;
        if was_idle {
            self.transition(CastConnectionState::Idle, None, None);
        }
        result
    }

    fn begin_attempt(&self) -> (u64, CancellationToken) {
        let token = self.scope.child_token();
        let mut slot = self.slot();
        let serial = slot.next_serial();
        if let Some((_, previous)) = slot.attempt.replace((serial, token.clone())) {
            debug!("CastSession: superseding in-flight connection attempt");
            previous.cancel();
        }
        (serial, token)
    }

    fn finish_attempt(&self, serial: u64) {
        let mut slot = self.slot();
        if slot.attempt.as_ref().is_some_and(|(current, _)| *current == serial) {
            slot.attempt = None;
        }
    }

    fn cancel_attempt(&self) {
        if let Some((_, attempt)) = self.slot().attempt.take() {
            attempt.cancel();
        }
    }

    /// Connects to `device_id`; a no-op when already connected to it, a
    /// disconnect-then-connect when connected elsewhere.
    pub async fn connect_to_route(&self, device_id: &str) -> Result<(), CastError> {
        self.ensure_live()?;
        let (serial, attempt) = self.begin_attempt();
        let result = self.connect_with_attempt(device_id, &attempt).await;
        self.finish_attempt(serial);
        result
    }

    async fn connect_with_attempt(
        &self,
        device_id: &str,
        attempt: &CancellationToken,
    ) -> Result<(), CastError> {
        let _lifecycle = tokio::select! {
            biased;
            _ = attempt.cancelled() => return Err(CastError::Cancelled),
            guard = self.lifecycle.lock() => guard,
        };
        if let Some(current) = self.connected_device() {
            if current.id == device_id {
                debug!("CastSession: already connected to '{}'", current.name);
                return Ok(());
            }
            info!(
                "CastSession: switching cast target from '{}' to {}",
                current.name, device_id
            );
            self.teardown(Some("Switching cast device.".to_string()))
                .await;
        }
        self.establish(device_id, attempt).await
    }

    fn fail_connect(&self, err: CastError) -> CastError {
        warn!("CastSession: connect failed: {}", err);
        self.transition(
            CastConnectionState::Idle,
            None,
            Some(format!("Failed to connect: {}", err)),
        );
        err
    }

    async fn resolve_device(
        &self,
        device_id: &str,
        attempt: &CancellationToken,
    ) -> Result<CastDeviceInfo, CastError> {
        let cached = self
            .slot()
            .known_devices
            .iter()
            .find(|device| device.id == device_id)
            .cloned();
        if let Some(device) = cached {
            return Ok(device);
        }
        self.discover_until_cancelled(attempt)
            .await?
            .into_iter()
            .find(|device| device.id == device_id)
            .ok_or_else(|| CastError::DeviceNotFound(device_id.to_string()))
    }

    async fn establish(&self, device_id: &str, attempt: &CancellationToken) -> Result<(), CastError> {
        self.transition(CastConnectionState::Discovering, None, None);
        let device = match self.resolve_device(device_id, attempt).await {
            Ok(device) => device,
            Err(err) => return Err(self.fail_connect(err)),
        };

        self.transition(CastConnectionState::Connecting, Some(&device), None);
        let timeout = self.config.connect_timeout();
        let connected = tokio::select! {
            biased;
            _ = attempt.cancelled() => Err(CastError::Cancelled),
            result = tokio::time::timeout(timeout, self.transport.connect(&device)) => {
                result.unwrap_or_else(|_| {
                    Err(CastError::Connection(format!("timed out after {:?}", timeout)))
                })
            }
        };
        let receiver = match connected {
            Ok(receiver) => receiver,
            Err(err) => return Err(self.fail_connect(err)),
        };
        if attempt.is_cancelled() {
            receiver.close().await;
            return Err(self.fail_connect(CastError::Cancelled));
        }

        match tokio::time::timeout(self.config.status_timeout(), receiver.status()).await {
            Ok(Ok(status)) => self.state.set_volume(status.volume.clamp(0.0, 1.0)),
            Ok(Err(err)) => debug!("CastSession: initial status unavailable: {}", err),
            Err(_) => debug!("CastSession: initial status timed out"),
        }

        let scope = self.scope.child_token();
        {
            let mut slot = self.slot();
            let serial = slot.next_serial();
            slot.active = Some(ActiveSession {
                serial,
                device: device.clone(),
                receiver: Arc::clone(&receiver),
                scope: scope.clone(),
            });
        }
        self.state.set_device_name(Some(device.name.clone()));
        self.transition(CastConnectionState::Connected, Some(&device), None);
        info!(
            "CastSession: connected to cast target '{}' ({})",
            device.name, device.address
        );
        self.start_poller(receiver, &scope);
        Ok(())
    }

    fn start_poller(&self, receiver: Arc<dyn ReceiverSession>, scope: &CancellationToken) {
        let bridge = Arc::clone(&self.bridge);
        let mirror = Arc::clone(&self.mirror);
        self.poller.start(
            receiver,
            scope,
            Arc::new(move |status: &RemoteStatus| bridge.apply_remote_status(status, &mirror)),
        );
    }

    /// Restarts sampling if session `serial` is still the connected one.
    fn resume_polling(&self, serial: u64) {
        let slot = self.slot();
        let Some(active) = slot.active.as_ref() else {
            return;
        };
        if active.serial != serial || active.scope.is_cancelled() {
            return;
        }
        self.start_poller(Arc::clone(&active.receiver), &active.scope);
    }

    async fn teardown(&self, reason: Option<String>) {
        let Some(active) = self.slot().active.take() else {
            return;
        };
        self.transition(CastConnectionState::Disconnecting, Some(&active.device), None);
        active.scope.cancel();
        self.poller.stop_position_updates().await;
        self.bridge.reset();
        self.mirror.clear();
        self.state.clear_transport();
        active.receiver.close().await;
        self.state.set_device_name(None);
        self.transition(CastConnectionState::Idle, None, reason);
        info!("CastSession: disconnected from '{}'", active.device.name);
    }

    /// Cancels any in-flight attempt and closes the connected session.
    pub async fn disconnect(&self) {
        if self.released.load(Ordering::Acquire) {
            return;
        }
        self.cancel_attempt();
        let _lifecycle = self.lifecycle.lock().await;
        self.teardown(Some("Cast session closed.".to_string()))
            .await;
    }

    /// Terminal teardown; every later call fails with `CastError::Released`.
    pub async fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel_attempt();
        self.scope.cancel();
        let _lifecycle = self.lifecycle.lock().await;
        self.teardown(Some("Cast session released.".to_string()))
            .await;
        self.bridge.reset();
        info!("CastSession: released");
    }

    fn connected_receiver(&self) -> Result<Arc<dyn ReceiverSession>, CastError> {
        self.connected_session().map(|(_, receiver, _)| receiver)
    }

    fn connected_session(
        &self,
    ) -> Result<(u64, Arc<dyn ReceiverSession>, CancellationToken), CastError> {
        self.ensure_live()?;
        self.slot()
            .active
            .as_ref()
            .map(|active| {
                (
                    active.serial,
                    Arc::clone(&active.receiver),
                    active.scope.clone(),
                )
            })
            .ok_or(CastError::NotConnected)
    }

    async fn send_command(&self, command: TransportCommand) -> Result<(), CastError> {
        let receiver = self.connected_receiver()?;
        self.bridge.send_command(receiver.as_ref(), command).await
    }

    pub async fn play(&self) -> Result<(), CastError> {
        self.send_command(TransportCommand::Play).await
    }

    pub async fn pause(&self) -> Result<(), CastError> {
        self.send_command(TransportCommand::Pause).await
    }

    pub async fn seek_to(&self, position_ms: u64) -> Result<(), CastError> {
        self.send_command(TransportCommand::SeekMs(position_ms))
            .await
    }

    /// Sets the receiver volume, clamped to `0.0..=1.0`; NaN is rejected.
    pub async fn set_volume(&self, volume: f32) -> Result<(), CastError> {
        self.ensure_live()?;
        if volume.is_nan() {
            return Err(CastError::InvalidVolume(volume));
        }
        let volume = volume.clamp(0.0, 1.0);
        let receiver = self.connected_receiver()?;
        receiver.set_volume(volume).await?;
        self.state.set_volume(volume);
        Ok(())
    }

    /// Mirrors the window around `item_id` to the receiver, pausing sampling
    /// until the last overlapping reload is done. Disconnecting cancels it.
    pub async fn load_media(&self, item_id: &str) -> Result<LoadOutcome, CastError> {
        let (serial, receiver, scope) = self.connected_session()?;
        let in_flight = LoadInFlight::enter(&self.loads_in_flight);
        self.poller.stop_position_updates().await;
        self.bridge.reset();
        let result = tokio::select! {
            biased;
            _ = scope.cancelled() => Err(CastError::Cancelled),
            result = self.mirror.load_media(receiver.as_ref(), item_id) => result,
        };
        if in_flight.finish() {
            self.resume_polling(serial);
        } else {
            debug!("CastSession: another reload is in flight, sampling stays paused");
        }
        match &result {
            Err(CastError::Cancelled) => {
                debug!("CastSession: load of {} cancelled by disconnect", item_id)
            }
            Err(err) => {
                warn!("CastSession: failed to load {} on receiver: {}", item_id, err);
                let _ = self
                    .bus_producer
                    .send(Message::Cast(CastMessage::LoadFailed {
                        item_id: item_id.to_string(),
                        reason: err.to_string(),
                    }));
            }
            Ok(_) => {}
        }
        result
    }

    async fn jump_if_mirrored(
        &self,
        receiver: &dyn ReceiverSession,
        item_id: &str,
    ) -> Result<bool, CastError> {
        let anti_echo = self.bridge.anti_echo();
        self.mirror
            .navigate_to_media_if_in_queue(receiver, item_id, || {
                anti_echo.raise(EchoOrigin::Local)
            })
            .await
    }

    /// Jumps to `item_id` when it is mirrored; `false` means the caller must load it.
    pub async fn navigate_to_media_if_in_queue(&self, item_id: &str) -> bool {
        let Ok(receiver) = self.connected_receiver() else {
            return false;
        };
        match self.jump_if_mirrored(receiver.as_ref(), item_id).await {
            Ok(navigated) => navigated,
            Err(err) => {
                warn!("CastSession: in-queue navigation to {} failed: {}", item_id, err);
                false
            }
        }
    }

    async fn skip(&self, direction: SkipDirection) -> Result<SkipOutcome, CastError> {
        let receiver = self.connected_receiver()?;
        let Some(target) = self.mirror.skip_target(direction)? else {
            debug!("CastSession: skip {:?} at playlist boundary", direction);
            return Ok(SkipOutcome::AtBoundary);
        };
        if self.jump_if_mirrored(receiver.as_ref(), &target).await? {
            return Ok(SkipOutcome::Navigated);
        }
        self.load_media(&target).await?;
        Ok(SkipOutcome::Reloaded)
    }

    pub async fn skip_to_next(&self) -> Result<SkipOutcome, CastError> {
        self.skip(SkipDirection::Next).await
    }

    pub async fn skip_to_previous(&self) -> Result<SkipOutcome, CastError> {
        self.skip(SkipDirection::Previous).await
    }

    /// Forwards a change reported by the local player, unless it echoes a remote change.
    pub async fn on_local_change(&self, change: LocalChange) -> Result<(), CastError> {
        let receiver = self.connected_receiver()?;
        if !self.bridge.should_forward_local_change(&change) {
            return Ok(());
        }
        match change {
            LocalChange::PlayState(true) => {
                self.bridge
                    .send_command(receiver.as_ref(), TransportCommand::Play)
                    .await
            }
            LocalChange::PlayState(false) => {
                self.bridge
                    .send_command(receiver.as_ref(), TransportCommand::Pause)
                    .await
            }
            LocalChange::Seek(position_ms) => {
                self.bridge
                    .send_command(receiver.as_ref(), TransportCommand::SeekMs(position_ms))
                    .await
            }
            LocalChange::Item(item_id) => {
                if self.navigate_to_media_if_in_queue(&item_id).await {
                    Ok(())
                } else {
                    self.load_media(&item_id).await.map(|_| ())
                }
            }
        }
    }
}
