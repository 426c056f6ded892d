//! Two-way translation between local transport intents and the receiver.
//!
//! Local commands go out through `send_command`, which raises the anti-echo
//! flag with `EchoOrigin::Local` so the transitional states the poller sees
//! next are not pushed back into the local player. Remote changes found by
//! the poller are turned into `PlaybackMessage` intents for the local player
//! under `EchoOrigin::Remote`; while that flag is up, local notifications that
//! merely confirm the remote state are not forwarded back. The flag is lowered
//! once every pushed intent has been confirmed, or by its grace timer.

use std::sync::{Mutex, MutexGuard};

use log::debug;
use tokio::sync::broadcast::Sender;

use crate::anti_echo::{AntiEchoFlag, EchoOrigin};
use crate::errors::CastError;
use crate::protocol::{Message, PlaybackMessage};
use crate::queue_mirror::QueueMirror;
use crate::receiver::{ReceiverSession, RemoteStatus};

/// Remote position moves larger than this between two samples count as a seek.
const SEEK_JUMP_THRESHOLD_MS: u64 = 5_000;
/// Local seeks this close to the last remote position are treated as echoes.
const SEEK_ECHO_TOLERANCE_MS: u64 = 2_000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransportCommand {
    Play,
    Pause,
    SeekMs(u64),
}

/// Change reported by the local player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalChange {
    PlayState(bool),
    Seek(u64),
    Item(String),
}

#[derive(Default)]
struct RemoteSync {
    last: Option<RemoteStatus>,
    /// Intents pushed to the local player and not yet confirmed by it.
    pending_echoes: usize,
}

pub struct PlaybackBridge {
    anti_echo: AntiEchoFlag,
    bus_producer: Sender<Message>,
    sync: Mutex<RemoteSync>,
}

impl PlaybackBridge {
    pub fn new(anti_echo: AntiEchoFlag, bus_producer: Sender<Message>) -> Self {
        Self {
            anti_echo,
            bus_producer,
            sync: Mutex::new(RemoteSync::default()),
        }
    }

    fn sync(&self) -> MutexGuard<'_, RemoteSync> {
        match self.sync.lock() {
            Ok(locked) => locked,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn anti_echo(&self) -> &AntiEchoFlag {
        &self.anti_echo
    }

    pub fn is_syncing_from_remote(&self) -> bool {
        self.anti_echo.origin() == Some(EchoOrigin::Remote)
    }

    pub async fn send_command(
        &self,
        receiver: &dyn ReceiverSession,
        command: TransportCommand,
    ) -> Result<(), CastError> {
        self.anti_echo.raise(EchoOrigin::Local);
        debug!("PlaybackBridge: forwarding {:?} to receiver", command);
        match command {
            TransportCommand::Play => receiver.play().await,
            TransportCommand::Pause => receiver.pause().await,
            TransportCommand::SeekMs(position_ms) => receiver.seek(position_ms).await,
        }
    }

    /// Whether a local change should be sent to the receiver, or is an echo of
    /// a remote change the bridge just applied.
    pub fn should_forward_local_change(&self, change: &LocalChange) -> bool {
        if self.anti_echo.origin() != Some(EchoOrigin::Remote) {
            return true;
        }
        let mut sync = self.sync();
        let Some(remote) = sync.last.as_ref() else {
            return true;
        };
        let is_echo = match change {
            LocalChange::PlayState(is_playing) => remote.is_playing == *is_playing,
            LocalChange::Seek(position_ms) => {
                remote.position_ms.abs_diff(*position_ms) <= SEEK_ECHO_TOLERANCE_MS
            }
            LocalChange::Item(item_id) => remote.current_item_id.as_deref() == Some(item_id),
        };
        if !is_echo {
            return true;
        }
        debug!("PlaybackBridge: suppressed local echo {:?}", change);
        sync.pending_echoes = sync.pending_echoes.saturating_sub(1);
        if sync.pending_echoes == 0 {
            self.anti_echo.clear_if(EchoOrigin::Remote);
        }
        false
    }

    /// Diffs a new sample against the previous one and drives the local player.
    pub fn apply_remote_status(&self, status: &RemoteStatus, mirror: &QueueMirror) {
        let previous = self.sync().last.replace(status.clone());
        let Some(previous) = previous else {
            return;
        };
        if self.anti_echo.origin() == Some(EchoOrigin::Local) {
            debug!("PlaybackBridge: local command in flight, not applying remote sample");
            return;
        }

        let mut intents = Vec::new();
        let item_changed = status.current_item_id != previous.current_item_id;
        if item_changed {
            if let Some(item_id) = status.current_item_id.as_deref() {
                if mirror.follow_remote_item(item_id) {
                    intents.push(PlaybackMessage::SkipToItem(item_id.to_string()));
                }
            }
        }
        if status.is_playing != previous.is_playing && !status.is_buffering {
            intents.push(if status.is_playing {
                PlaybackMessage::Play
            } else {
                PlaybackMessage::Pause
            });
        }
        if !item_changed
            && status.position_ms.abs_diff(previous.position_ms) > SEEK_JUMP_THRESHOLD_MS
        {
            intents.push(PlaybackMessage::SeekMs(status.position_ms));
        }

        if intents.is_empty() {
            return;
        }
        self.sync().pending_echoes = intents.len();
        self.anti_echo.raise(EchoOrigin::Remote);
        for intent in intents {
            debug!("PlaybackBridge: applying remote change locally: {:?}", intent);
            let _ = self.bus_producer.send(Message::Playback(intent));
        }
    }

    /// Drops the sample baseline and lowers the flag; used on reload and teardown.
    pub fn reset(&self) {
        *self.sync() = RemoteSync::default();
        self.anti_echo.clear();
    }
}
