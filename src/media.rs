//! Media descriptors and the playlist source the queue mirror reads from.

use std::sync::{Arc, Mutex};

/// One playable item of the local playlist, as supplied by the metadata provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaItem {
    /// Stable item identifier, also used as the video id for stream tokens.
    pub id: String,
    pub title: String,
    pub artist: Option<String>,
    pub artwork_url: Option<String>,
    pub duration_ms: Option<u64>,
    /// URI the receiver fetches the stream from.
    pub uri: String,
    pub content_type: String,
}

impl MediaItem {
    /// Builds a bare item whose title and content type are inferred from the uri.
    pub fn from_uri(id: impl Into<String>, uri: impl Into<String>) -> Self {
        let uri = uri.into();
        let title = uri
            .rsplit('/')
            .next()
            .map(|segment| segment.split('?').next().unwrap_or(segment))
            .filter(|segment| !segment.is_empty())
            .unwrap_or("Unknown Title")
            .to_string();
        Self {
            id: id.into(),
            title,
            artist: None,
            artwork_url: None,
            duration_ms: None,
            content_type: content_type_for_uri(&uri),
            uri,
        }
    }
}

/// Media descriptor pushed to the receiver as one queue item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub item_id: String,
    pub title: String,
    pub artist: Option<String>,
    pub artwork_url: Option<String>,
    pub duration_ms: Option<u64>,
    /// Playback uri, with the stream authorization appended when available.
    pub content_url: String,
    pub content_type: String,
}

impl QueueEntry {
    pub fn from_item(item: &MediaItem, content_url: String) -> Self {
        Self {
            item_id: item.id.clone(),
            title: item.title.clone(),
            artist: item.artist.clone(),
            artwork_url: item.artwork_url.clone(),
            duration_ms: item.duration_ms,
            content_url,
            content_type: item.content_type.clone(),
        }
    }
}

/// Supplies the ordered local playlist the queue window is cut from.
pub trait MediaMetadataProvider: Send + Sync {
    fn playlist(&self) -> Vec<MediaItem>;
}

/// In-memory playlist, replaced wholesale by the local player.
#[derive(Debug, Clone, Default)]
pub struct StaticPlaylist {
    items: Arc<Mutex<Vec<MediaItem>>>,
}

impl StaticPlaylist {
    pub fn new(items: Vec<MediaItem>) -> Self {
        Self {
            items: Arc::new(Mutex::new(items)),
        }
    }

    pub fn replace(&self, items: Vec<MediaItem>) {
        let mut locked = match self.items.lock() {
            Ok(locked) => locked,
            Err(poisoned) => poisoned.into_inner(),
        };
        *locked = items;
    }
}

impl MediaMetadataProvider for StaticPlaylist {
    fn playlist(&self) -> Vec<MediaItem> {
        match self.items.lock() {
            Ok(locked) => locked.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

fn content_type_for_uri(uri: &str) -> String {
    let path = uri.split(['?', '#']).next().unwrap_or(uri);
    let ext = path
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "flac" => "audio/flac",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" | "opus" => "audio/ogg",
        "m4a" | "mp4" => "audio/mp4",
        "aac" => "audio/aac",
        "webm" => "audio/webm",
        _ => "application/octet-stream",
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::{MediaItem, MediaMetadataProvider, StaticPlaylist};

    #[test]
    fn test_from_uri_infers_title_and_content_type() {
        let item = MediaItem::from_uri("a", "http://host/music/song.FLAC?sig=1");
        assert_eq!(item.title, "song.FLAC");
        assert_eq!(item.content_type, "audio/flac");

        let opaque = MediaItem::from_uri("b", "http://host/stream");
        assert_eq!(opaque.content_type, "application/octet-stream");
    }

    #[test]
    fn test_static_playlist_replace_is_visible_to_readers() {
        let playlist = StaticPlaylist::new(vec![MediaItem::from_uri("a", "http://h/a.mp3")]);
        let reader = playlist.clone();
        playlist.replace(vec![
            MediaItem::from_uri("b", "http://h/b.mp3"),
            MediaItem::from_uri("c", "http://h/c.mp3"),
        ]);
        let ids: Vec<_> = reader.playlist().into_iter().map(|item| item.id).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }
}
