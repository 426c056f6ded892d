//! Bounded mirror of the local play queue on the receiver.
//!
//! The receiver holds at most five items around the current one (two before,
//! the current item, two after), clamped at playlist boundaries. Navigation
//! inside that window is a lightweight jump; anything else reloads a window
//! centred on the target.
//!
//! Loads and navigations are last-writer-wins: each call takes a generation
//! number up front and only commits to the receiver if no newer call started
//! in the meantime.

use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, warn};
use tokio::sync::broadcast::Sender;

use crate::errors::CastError;
use crate::media::{MediaItem, MediaMetadataProvider, QueueEntry};
use crate::protocol::{CastMessage, Message};
use crate::receiver::ReceiverSession;
use crate::token::TokenGenerator;

pub const WINDOW_BEFORE: usize = 2;
pub const WINDOW_AFTER: usize = 2;

/// Items currently pushed to the receiver, in playlist order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirroredQueue {
    item_ids: Vec<String>,
    current_index: usize,
}

impl MirroredQueue {
    pub fn item_ids(&self) -> &[String] {
        &self.item_ids
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn current_item_id(&self) -> &str {
        &self.item_ids[self.current_index]
    }

    pub fn index_of(&self, item_id: &str) -> Option<usize> {
        self.item_ids.iter().position(|id| id == item_id)
    }

    pub fn contains(&self, item_id: &str) -> bool {
        self.index_of(item_id).is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded,
    /// A newer load or navigation started before this one reached the receiver.
    Superseded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipDirection {
    Next,
    Previous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipOutcome {
    /// The target was already mirrored; the receiver jumped to it.
    Navigated,
    /// The target was outside the window; a new window was loaded.
    Reloaded,
    /// There is no item in that direction.
    AtBoundary,
}

/// Playlist slice mirrored around `position`: up to two items on each side.
pub fn window_range(len: usize, position: usize) -> Range<usize> {
    let start = position.saturating_sub(WINDOW_BEFORE);
    let end = len.min(position + WINDOW_AFTER + 1);
    start..end
}

fn authorized_url(uri: &str, token: &str) -> String {
    let separator = if uri.contains('?') { '&' } else { '?' };
    format!("{uri}{separator}pot={}", urlencoding::encode(token))
}

struct StreamAuthorization {
    generator: Arc<TokenGenerator>,
    session_id: String,
}

pub struct QueueMirror {
    provider: Arc<dyn MediaMetadataProvider>,
    bus_producer: Sender<Message>,
    window: Mutex<Option<MirroredQueue>>,
    authorization: Mutex<Option<StreamAuthorization>>,
    generation: AtomicU64,
    /// Bumped only by `clear`; a load spanning a clear must not commit.
    epoch: AtomicU64,
    commit: tokio::sync::Mutex<()>,
}

impl QueueMirror {
    pub fn new(provider: Arc<dyn MediaMetadataProvider>, bus_producer: Sender<Message>) -> Self {
        Self {
            provider,
            bus_producer,
            window: Mutex::new(None),
            authorization: Mutex::new(None),
            generation: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
            commit: tokio::sync::Mutex::new(()),
        }
    }

    fn window_lock(&self) -> MutexGuard<'_, Option<MirroredQueue>> {
        match self.window.lock() {
            Ok(locked) => locked,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn snapshot(&self) -> Option<MirroredQueue> {
        self.window_lock().clone()
    }

    pub fn current_item_id(&self) -> Option<String> {
        self.window_lock()
            .as_ref()
            .map(|window| window.current_item_id().to_string())
    }

    /// Appends a stream token to every entry pushed from now on; `None` disables it.
    pub fn set_stream_authorization(
        &self,
        generator: Option<Arc<TokenGenerator>>,
        session_id: Option<String>,
    ) {
        let mut locked = match self.authorization.lock() {
            Ok(locked) => locked,
            Err(poisoned) => poisoned.into_inner(),
        };
        *locked = match (generator, session_id) {
            (Some(generator), Some(session_id)) => Some(StreamAuthorization {
                generator,
                session_id,
            }),
            _ => None,
        };
    }

    fn authorization(&self) -> Option<(Arc<TokenGenerator>, String)> {
        let locked = match self.authorization.lock() {
            Ok(locked) => locked,
            Err(poisoned) => poisoned.into_inner(),
        };
        locked
            .as_ref()
            .map(|auth| (Arc::clone(&auth.generator), auth.session_id.clone()))
    }

    /// Forgets the window and supersedes any load still in flight.
    pub fn clear(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.generation.fetch_add(1, Ordering::AcqRel);
        *self.window_lock() = None;
    }

    fn begin(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn is_latest(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }

    async fn build_entries(
        &self,
        items: &[MediaItem],
        current_offset: usize,
    ) -> Result<Vec<QueueEntry>, CastError> {
        let Some((generator, session_id)) = self.authorization() else {
            return Ok(items
                .iter()
                .map(|item| QueueEntry::from_item(item, item.uri.clone()))
                .collect());
        };

        let mut entries = Vec::with_capacity(items.len());
        for (offset, item) in items.iter().enumerate() {
            let url = match generator.get_token(&item.id, &session_id).await {
                Ok(Some(token)) => authorized_url(&item.uri, token.as_str()),
                Ok(None) => item.uri.clone(),
                Err(err) if offset == current_offset => return Err(err.into()),
                Err(err) => {
                    warn!(
                        "QueueMirror: no stream token for neighbour {}, keeping plain uri: {}",
                        item.id, err
                    );
                    item.uri.clone()
                }
            };
            entries.push(QueueEntry::from_item(item, url));
        }
        Ok(entries)
    }

    /// Pushes the window around `item_id` to the receiver as a fresh queue.
    pub async fn load_media(
        &self,
        receiver: &dyn ReceiverSession,
        item_id: &str,
    ) -> Result<LoadOutcome, CastError> {
        let generation = self.begin();
        let epoch = self.epoch.load(Ordering::Acquire);
        let playlist = self.provider.playlist();
        if playlist.is_empty() {
            warn!("QueueMirror: load of {} requested with an empty playlist", item_id);
            return Err(CastError::EmptyPlaylist);
        }
        let position = playlist
            .iter()
            .position(|item| item.id == item_id)
            .ok_or_else(|| CastError::ItemNotInPlaylist(item_id.to_string()))?;
        let range = window_range(playlist.len(), position);
        let current_offset = position - range.start;
        let entries = self
            .build_entries(&playlist[range], current_offset)
            .await?;

        let _commit = self.commit.lock().await;
        if !self.is_latest(generation) {
            debug!("QueueMirror: load of {} superseded before commit", item_id);
            return Ok(LoadOutcome::Superseded);
        }
        receiver.load_queue(&entries, current_offset).await?;
        if self.epoch.load(Ordering::Acquire) != epoch {
            debug!("QueueMirror: mirror cleared while loading {}, dropping window", item_id);
            return Ok(LoadOutcome::Superseded);
        }

        let window = MirroredQueue {
            item_ids: entries.into_iter().map(|entry| entry.item_id).collect(),
            current_index: current_offset,
        };
        info!(
            "QueueMirror: mirrored {} item(s) around {} (current index {})",
            window.item_ids.len(),
            item_id,
            current_offset
        );
        let _ = self
            .bus_producer
            .send(Message::Cast(CastMessage::QueueMirrored {
                item_ids: window.item_ids.clone(),
                current_index: window.current_index,
            }));
        *self.window_lock() = Some(window);
        Ok(LoadOutcome::Loaded)
    }

    /// Jumps to `item_id` if it is mirrored; `false` means a full load is needed
    /// and nothing was touched. `before_jump` runs only when a jump is about to be sent.
    pub async fn navigate_to_media_if_in_queue(
        &self,
        receiver: &dyn ReceiverSession,
        item_id: &str,
        before_jump: impl FnOnce() + Send,
    ) -> Result<bool, CastError> {
        if !self.window_lock().as_ref().is_some_and(|window| window.contains(item_id)) {
            return Ok(false);
        }

        let generation = self.begin();
        let _commit = self.commit.lock().await;
        let Some((index, current_index)) = self
            .window_lock()
            .as_ref()
            .and_then(|window| window.index_of(item_id).map(|index| (index, window.current_index)))
        else {
            return Ok(false);
        };
        if !self.is_latest(generation) {
            debug!("QueueMirror: navigation to {} superseded before commit", item_id);
            return Ok(true);
        }
        if index != current_index {
            before_jump();
            receiver.jump_to_index(index).await?;
        }
        if let Some(window) = self.window_lock().as_mut() {
            window.current_index = index;
        }
        debug!("QueueMirror: navigated in place to {} (index {})", item_id, index);
        Ok(true)
    }

    /// Playlist neighbour of the mirrored current item; `None` at a playlist boundary.
    pub fn skip_target(&self, direction: SkipDirection) -> Result<Option<String>, CastError> {
        let playlist = self.provider.playlist();
        if playlist.is_empty() {
            return Err(CastError::EmptyPlaylist);
        }
        let current_id = self.current_item_id().ok_or(CastError::NothingMirrored)?;
        let position = playlist
            .iter()
            .position(|item| item.id == current_id)
            .ok_or(CastError::ItemNotInPlaylist(current_id))?;
        let target = match direction {
            SkipDirection::Next => position.checked_add(1),
            SkipDirection::Previous => position.checked_sub(1),
        };
        Ok(target
            .and_then(|target| playlist.get(target))
            .map(|item| item.id.clone()))
    }

    /// Follows a queue move made on the receiver itself; returns whether the marker moved.
    pub fn follow_remote_item(&self, item_id: &str) -> bool {
        let mut locked = self.window_lock();
        let Some(window) = locked.as_mut() else {
            return false;
        };
        match window.index_of(item_id) {
            Some(index) if index != window.current_index => {
                window.current_index = index;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        authorized_url, window_range, LoadOutcome, QueueMirror, SkipDirection,
    };
    use crate::errors::CastError;
    use crate::media::{MediaItem, StaticPlaylist};
    use crate::protocol::{CastMessage, Message};
    use crate::receiver::fake::{FakeReceiver, ReceiverCall};
    use crate::token::fake::FakeHost;
    use crate::token::TokenGenerator;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::broadcast;

    fn playlist(ids: &[&str]) -> StaticPlaylist {
        StaticPlaylist::new(
            ids.iter()
                .map(|id| MediaItem::from_uri(*id, format!("http://media/{id}.mp3")))
                .collect(),
        )
    }

    fn mirror(ids: &[&str]) -> (QueueMirror, broadcast::Receiver<Message>) {
        let (bus_sender, bus_receiver) = broadcast::channel(64);
        (
            QueueMirror::new(Arc::new(playlist(ids)), bus_sender),
            bus_receiver,
        )
    }

    fn window_ids(mirror: &QueueMirror) -> Vec<String> {
        mirror.snapshot().expect("window").item_ids().to_vec()
    }

    #[test]
    fn test_window_range_is_clamped_and_never_wraps() {
        assert_eq!(window_range(6, 2), 0..5);
        assert_eq!(window_range(6, 0), 0..3);
        assert_eq!(window_range(6, 1), 0..4);
        assert_eq!(window_range(6, 5), 3..6);
        assert_eq!(window_range(6, 4), 2..6);
        assert_eq!(window_range(1, 0), 0..1);
        for len in 1..9 {
            for position in 0..len {
                let range = window_range(len, position);
                let expected = position.min(2) + 1 + (len - 1 - position).min(2);
                assert_eq!(range.len(), expected);
                assert!(range.contains(&position));
            }
        }
    }

    #[test]
    fn test_authorized_url_appends_encoded_token() {
        assert_eq!(authorized_url("http://h/a", "x/y"), "http://h/a?pot=x%2Fy");
        assert_eq!(authorized_url("http://h/a?b=1", "t"), "http://h/a?b=1&pot=t");
    }

    #[tokio::test]
    async fn test_load_media_mirrors_window_around_item() {
        let (mirror, mut bus) = mirror(&["A", "B", "C", "D", "E", "F"]);
        let receiver = FakeReceiver::new();

        let outcome = mirror.load_media(&receiver, "C").await.expect("load");

        assert_eq!(outcome, LoadOutcome::Loaded);
        assert_eq!(window_ids(&mirror), vec!["A", "B", "C", "D", "E"]);
        assert_eq!(mirror.current_item_id().as_deref(), Some("C"));
        assert_eq!(
            receiver.calls(),
            vec![ReceiverCall::LoadQueue {
                item_ids: vec!["A".into(), "B".into(), "C".into(), "D".into(), "E".into()],
                start_index: 2,
            }]
        );
        assert_eq!(
            bus.try_recv().expect("queue notification"),
            Message::Cast(CastMessage::QueueMirrored {
                item_ids: vec!["A".into(), "B".into(), "C".into(), "D".into(), "E".into()],
                current_index: 2,
            })
        );
    }

    #[tokio::test]
    async fn test_load_media_at_playlist_end_is_boundary_shortened() {
        let (mirror, _bus) = mirror(&["A", "B", "C", "D", "E", "F"]);
        let receiver = FakeReceiver::new();

        mirror.load_media(&receiver, "E").await.expect("load");
        assert_eq!(window_ids(&mirror), vec!["C", "D", "E", "F"]);
        assert_eq!(mirror.snapshot().expect("window").current_index(), 2);

        mirror.load_media(&receiver, "A").await.expect("load");
        assert_eq!(window_ids(&mirror), vec!["A", "B", "C"]);
        assert_eq!(mirror.snapshot().expect("window").current_index(), 0);
    }

    #[tokio::test]
    async fn test_load_media_with_empty_playlist_is_precondition_failure() {
        let (mirror, _bus) = mirror(&[]);
        let receiver = FakeReceiver::new();

        assert_eq!(
            mirror.load_media(&receiver, "A").await,
            Err(CastError::EmptyPlaylist)
        );
        assert!(receiver.calls().is_empty());
        assert!(mirror.snapshot().is_none());
    }

    #[tokio::test]
    async fn test_navigate_in_window_jumps_without_reload() {
        let (mirror, _bus) = mirror(&["A", "B", "C", "D", "E", "F"]);
        let receiver = FakeReceiver::new();
        mirror.load_media(&receiver, "C").await.expect("load");
        receiver.clear_calls();
        let mut jumps = 0;

        assert!(mirror
            .navigate_to_media_if_in_queue(&receiver, "E", || jumps += 1)
            .await
            .expect("navigate"));
        assert_eq!(receiver.calls(), vec![ReceiverCall::Jump(4)]);
        assert_eq!(mirror.current_item_id().as_deref(), Some("E"));

        assert!(!mirror
            .navigate_to_media_if_in_queue(&receiver, "F", || jumps += 1)
            .await
            .expect("navigate"));
        assert_eq!(receiver.calls(), vec![ReceiverCall::Jump(4)]);
        assert_eq!(mirror.current_item_id().as_deref(), Some("E"));
        assert_eq!(jumps, 1);
    }

    #[tokio::test]
    async fn test_navigate_to_current_item_sends_nothing() {
        let (mirror, _bus) = mirror(&["A", "B", "C"]);
        let receiver = FakeReceiver::new();
        mirror.load_media(&receiver, "B").await.expect("load");
        receiver.clear_calls();
        let mut jumps = 0;

        assert!(mirror
            .navigate_to_media_if_in_queue(&receiver, "B", || jumps += 1)
            .await
            .expect("navigate"));
        assert!(receiver.calls().is_empty());
        assert_eq!(jumps, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_during_load_leaves_mirror_empty() {
        let (mirror, mut bus) = mirror(&["A", "B", "C"]);
        let mirror = Arc::new(mirror);
        let receiver = FakeReceiver::new();
        receiver.set_load_delay(Some(Duration::from_millis(500)));

        let loading = {
            let mirror = Arc::clone(&mirror);
            let receiver = receiver.clone();
            tokio::spawn(async move { mirror.load_media(&receiver, "B").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        mirror.clear();

        assert_eq!(loading.await.expect("join"), Ok(LoadOutcome::Superseded));
        assert!(mirror.snapshot().is_none());
        assert!(bus.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_skip_target_walks_playlist_not_window() {
        let (mirror, _bus) = mirror(&["A", "B", "C", "D", "E", "F"]);
        let receiver = FakeReceiver::new();
        mirror.load_media(&receiver, "E").await.expect("load");

        assert_eq!(
            mirror.skip_target(SkipDirection::Next),
            Ok(Some("F".to_string()))
        );
        assert_eq!(
            mirror.skip_target(SkipDirection::Previous),
            Ok(Some("D".to_string()))
        );

        mirror.load_media(&receiver, "F").await.expect("load");
        assert_eq!(mirror.skip_target(SkipDirection::Next), Ok(None));
    }

    #[tokio::test]
    async fn test_skip_target_previous_at_first_item_is_boundary() {
        let (mirror, _bus) = mirror(&["A", "B"]);
        let receiver = FakeReceiver::new();
        mirror.load_media(&receiver, "A").await.expect("load");

        assert_eq!(mirror.skip_target(SkipDirection::Previous), Ok(None));
        assert_eq!(
            mirror.skip_target(SkipDirection::Next),
            Ok(Some("B".to_string()))
        );
    }

    #[test]
    fn test_skip_target_without_mirrored_queue_fails() {
        let (mirror, _bus) = mirror(&["A"]);
        assert_eq!(
            mirror.skip_target(SkipDirection::Next),
            Err(CastError::NothingMirrored)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_load_supersedes_one_in_flight() {
        let (mirror, _bus) = mirror(&["A", "B", "C", "D", "E", "F", "G", "H"]);
        let mirror = Arc::new(mirror);
        let receiver = FakeReceiver::new();
        receiver.set_load_delay(Some(Duration::from_millis(100)));

        let first = {
            let mirror = Arc::clone(&mirror);
            let receiver = receiver.clone();
            tokio::spawn(async move { mirror.load_media(&receiver, "B").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = {
            let mirror = Arc::clone(&mirror);
            let receiver = receiver.clone();
            tokio::spawn(async move { mirror.load_media(&receiver, "G").await })
        };
        let third = {
            let mirror = Arc::clone(&mirror);
            let receiver = receiver.clone();
            tokio::spawn(async move { mirror.load_media(&receiver, "H").await })
        };

        let first = first.await.expect("join");
        let second = second.await.expect("join");
        let third = third.await.expect("join");

        // The first load already reached the receiver; the second never did.
        assert_eq!(first, Ok(LoadOutcome::Loaded));
        assert_eq!(second, Ok(LoadOutcome::Superseded));
        assert_eq!(third, Ok(LoadOutcome::Loaded));
        assert_eq!(mirror.current_item_id().as_deref(), Some("H"));
        let loaded_tails: Vec<_> = receiver
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                ReceiverCall::LoadQueue { item_ids, .. } => item_ids.last().cloned(),
                _ => None,
            })
            .collect();
        assert_eq!(loaded_tails, vec!["D".to_string(), "H".to_string()]);
    }

    #[tokio::test]
    async fn test_follow_remote_item_moves_marker_only_inside_window() {
        let (mirror, _bus) = mirror(&["A", "B", "C", "D", "E", "F"]);
        let receiver = FakeReceiver::new();
        mirror.load_media(&receiver, "C").await.expect("load");

        assert!(mirror.follow_remote_item("D"));
        assert!(!mirror.follow_remote_item("D"));
        assert!(!mirror.follow_remote_item("F"));
        assert_eq!(mirror.current_item_id().as_deref(), Some("D"));
    }

    #[tokio::test]
    async fn test_stream_tokens_are_attached_to_entries() {
        let (mirror, _bus) = mirror(&["A", "B", "C"]);
        let host = Arc::new(FakeHost::new());
        mirror.set_stream_authorization(
            Some(Arc::new(TokenGenerator::new(host.clone()))),
            Some("visitor".to_string()),
        );
        let receiver = FakeReceiver::new();

        mirror.load_media(&receiver, "B").await.expect("load");

        assert_eq!(host.created(), 1);
        assert_eq!(host.generated(), 3);
    }

    #[tokio::test]
    async fn test_token_failure_for_current_item_fails_load() {
        let (mirror, _bus) = mirror(&["A"]);
        let host = Arc::new(FakeHost::with_failures(vec![true]));
        mirror.set_stream_authorization(
            Some(Arc::new(TokenGenerator::new(host))),
            Some("visitor".to_string()),
        );
        let receiver = FakeReceiver::new();

        let result = mirror.load_media(&receiver, "A").await;

        assert!(matches!(result, Err(CastError::Token(_))));
        assert_eq!(receiver.load_count(), 0);
        assert!(mirror.snapshot().is_none());
    }
}
