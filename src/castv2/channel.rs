//! Blocking Cast v2 control channel to one receiver.
//!
//! Connects over TLS, launches the default media receiver and speaks the
//! connection/heartbeat/receiver/media namespaces. Every call blocks the
//! current thread; `super::CastV2Receiver` runs them on the blocking pool.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use log::{debug, info};
use serde_json::{json, Value};

use super::frame::{CastFrame, MAX_FRAME_LEN};
use super::status::{
    launched_app, media_sample, message_type, queue_load_reply, receiver_volume, seconds_to_ms,
};
use crate::media::QueueEntry;
use crate::protocol::CastDeviceInfo;
use crate::receiver::RemoteStatus;

pub(crate) const DEFAULT_MEDIA_RECEIVER_APP_ID: &str = "CC1AD845";
const NAMESPACE_CONNECTION: &str = "urn:x-cast:com.google.cast.tp.connection";
const NAMESPACE_HEARTBEAT: &str = "urn:x-cast:com.google.cast.tp.heartbeat";
const NAMESPACE_RECEIVER: &str = "urn:x-cast:com.google.cast.receiver";
const NAMESPACE_MEDIA: &str = "urn:x-cast:com.google.cast.media";

const READ_TIMEOUT: Duration = Duration::from_millis(180);
const WRITE_TIMEOUT: Duration = Duration::from_millis(1500);
const RECEIVER_ID: &str = "receiver-0";

pub(crate) struct ReceiverChannel {
    stream: native_tls::TlsStream<TcpStream>,
    sender_id: String,
    media_transport_id: String,
    app_session_id: Option<String>,
    media_session_id: Option<i64>,
    next_request_id: i64,
    /// Media ids of the last loaded queue, in receiver order.
    queue_media_ids: Vec<String>,
    queue_index: Option<usize>,
    volume: f32,
}

impl ReceiverChannel {
    pub fn connect(device: &CastDeviceInfo, timeout: Duration) -> Result<Self, String> {
        let address = format!("{}:{}", device.address, device.port);
        let socket_addr = address
            .parse()
            .map_err(|err| format!("invalid cast target address '{}': {err}", address))?;
        let tcp = TcpStream::connect_timeout(&socket_addr, timeout)
            .map_err(|err| format!("failed to connect to cast target {}: {err}", address))?;
        tcp.set_read_timeout(Some(READ_TIMEOUT))
            .map_err(|err| format!("failed to set cast read timeout: {err}"))?;
        tcp.set_write_timeout(Some(WRITE_TIMEOUT))
            .map_err(|err| format!("failed to set cast write timeout: {err}"))?;

        // Receivers present self-signed device certificates.
        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
            .map_err(|err| format!("failed to create cast tls connector: {err}"))?;
        let stream = connector
            .connect(&device.host, tcp)
            .map_err(|err| format!("failed cast tls handshake: {err}"))?;

        let mut channel = Self {
            stream,
            sender_id: format!("sender-{}", uuid::Uuid::new_v4().simple()),
            media_transport_id: RECEIVER_ID.to_string(),
            app_session_id: None,
            media_session_id: None,
            next_request_id: 1,
            queue_media_ids: Vec::new(),
            queue_index: None,
            volume: 1.0,
        };
        channel.send_json(NAMESPACE_CONNECTION, RECEIVER_ID, json!({"type":"CONNECT","origin":{}}))?;
        let request_id = channel.alloc_request_id();
        channel.send_json(
            NAMESPACE_RECEIVER,
            RECEIVER_ID,
            json!({"type":"LAUNCH","appId":DEFAULT_MEDIA_RECEIVER_APP_ID,"requestId":request_id}),
        )?;
        let (transport_id, app_session_id) = channel.await_app_launch(timeout)?;
        channel.media_transport_id = transport_id;
        channel.app_session_id = Some(app_session_id);
        let transport_id = channel.media_transport_id.clone();
        channel.send_json(
            NAMESPACE_CONNECTION,
            &transport_id,
            json!({"type":"CONNECT","origin":{}}),
        )?;
        info!(
            "CastChannel: media receiver launched on '{}' (transport {})",
            device.name, channel.media_transport_id
        );
        Ok(channel)
    }

    fn alloc_request_id(&mut self) -> i64 {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }

    fn send_json(&mut self, namespace: &str, destination_id: &str, payload: Value) -> Result<(), String> {
        let frame =
            CastFrame::new(&self.sender_id, destination_id, namespace, payload.to_string()).encode()?;
        self.stream
            .write_all(&frame)
            .map_err(|err| format!("failed to send cast frame: {err}"))
    }

    fn send_media(&mut self, mut payload: Value) -> Result<(), String> {
        let request_id = self.alloc_request_id();
        payload["requestId"] = json!(request_id);
        if let Some(media_session_id) = self.media_session_id {
            payload["mediaSessionId"] = json!(media_session_id);
        }
        let transport_id = self.media_transport_id.clone();
        self.send_json(NAMESPACE_MEDIA, &transport_id, payload)
    }

    /// Next frame as `(namespace, payload)`; `None` when nothing arrived within the read timeout.
    fn read_next_message(&mut self) -> Result<Option<(String, String)>, String> {
        let mut len_buf = [0u8; 4];
        match self.stream.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return Ok(None),
            Err(err) if err.kind() == std::io::ErrorKind::TimedOut => return Ok(None),
            Err(err) => return Err(format!("failed to read cast frame length: {err}")),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 {
            return Ok(None);
        }
        if len > MAX_FRAME_LEN {
            return Err(format!("cast frame length {len} exceeds limit"));
        }
        let mut payload = vec![0u8; len];
        self.stream
            .read_exact(&mut payload)
            .map_err(|err| format!("failed to read cast frame payload: {err}"))?;
        let frame = CastFrame::decode(&payload)?;
        Ok(Some((frame.namespace, frame.payload_utf8)))
    }

    /// Reads one non-heartbeat JSON message, answering PINGs on the way.
    fn next_json(&mut self) -> Result<Option<(String, Value)>, String> {
        let Some((namespace, payload)) = self.read_next_message()? else {
            return Ok(None);
        };
        let Ok(value) = serde_json::from_str::<Value>(&payload) else {
            debug!("CastChannel: ignoring non-json payload on {}", namespace);
            return Ok(None);
        };
        if namespace == NAMESPACE_HEARTBEAT {
            if message_type(&value) == Some("PING") {
                self.send_json(NAMESPACE_HEARTBEAT, RECEIVER_ID, json!({"type":"PONG"}))?;
            }
            return Ok(None);
        }
        Ok(Some((namespace, value)))
    }

    fn await_app_launch(&mut self, timeout: Duration) -> Result<(String, String), String> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            let Some((namespace, value)) = self.next_json()? else {
                continue;
            };
            if namespace != NAMESPACE_RECEIVER {
                continue;
            }
            if let Some(volume) = receiver_volume(&value) {
                self.volume = volume;
            }
            if let Some(launched) = launched_app(&value, DEFAULT_MEDIA_RECEIVER_APP_ID) {
                return Ok(launched);
            }
        }
        Err("timed out waiting for media receiver launch".to_string())
    }

    /// Loads a fresh queue and waits up to `timeout` for the media session it creates.
    pub fn load_queue(
        &mut self,
        entries: &[QueueEntry],
        start_index: usize,
        timeout: Duration,
    ) -> Result<(), String> {
        let previous_session = self.media_session_id;
        let items: Vec<Value> = entries.iter().map(queue_item_json).collect();
        self.send_media(json!({
            "type": "QUEUE_LOAD",
            "items": items,
            "startIndex": start_index,
            "repeatMode": "REPEAT_OFF",
        }))?;
        self.queue_media_ids = entries.iter().map(|entry| entry.item_id.clone()).collect();
        self.queue_index = Some(start_index);
        self.await_media_session(previous_session, timeout)
    }

    fn await_media_session(&mut self, previous: Option<i64>, timeout: Duration) -> Result<(), String> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            let Some((namespace, value)) = self.next_json()? else {
                continue;
            };
            if namespace != NAMESPACE_MEDIA {
                continue;
            }
            match queue_load_reply(&value, previous) {
                Some(Ok(session_id)) => {
                    debug!("CastChannel: queue loaded into media session {}", session_id);
                    self.media_session_id = Some(session_id);
                    return Ok(());
                }
                Some(Err(err)) => return Err(err),
                None => {}
            }
        }
        debug!(
            "CastChannel: no media session announced within {:?}, keeping {:?}",
            timeout, previous
        );
        Ok(())
    }

    /// Moves to `index` of the loaded queue with a relative `QUEUE_UPDATE` jump.
    pub fn jump_to_index(&mut self, index: usize) -> Result<(), String> {
        if index >= self.queue_media_ids.len() {
            return Err(format!("queue index {index} out of range"));
        }
        let current = self
            .queue_index
            .ok_or_else(|| "receiver queue position is unknown".to_string())?;
        let delta = index as i64 - current as i64;
        if delta != 0 {
            self.send_media(json!({"type":"QUEUE_UPDATE","jump":delta}))?;
        }
        self.queue_index = Some(index);
        Ok(())
    }

    pub fn play(&mut self) -> Result<(), String> {
        self.send_media(json!({"type":"PLAY"}))
    }

    pub fn pause(&mut self) -> Result<(), String> {
        self.send_media(json!({"type":"PAUSE"}))
    }

    pub fn seek_ms(&mut self, position_ms: u64) -> Result<(), String> {
        self.send_media(json!({
            "type": "SEEK",
            "currentTime": position_ms as f64 / 1000.0,
        }))
    }

    pub fn set_volume(&mut self, volume: f32) -> Result<(), String> {
        let request_id = self.alloc_request_id();
        let level = volume.clamp(0.0, 1.0);
        self.send_json(
            NAMESPACE_RECEIVER,
            RECEIVER_ID,
            json!({"type":"SET_VOLUME","requestId":request_id,"volume":{"level":level}}),
        )?;
        self.volume = level;
        Ok(())
    }

    /// Requests media and receiver status and waits for the media reply.
    pub fn sample_status(&mut self, timeout: Duration) -> Result<RemoteStatus, String> {
        let request_id = self.alloc_request_id();
        self.send_json(
            NAMESPACE_RECEIVER,
            RECEIVER_ID,
            json!({"type":"GET_STATUS","requestId":request_id}),
        )?;
        self.send_media(json!({"type":"GET_STATUS"}))?;

        let deadline = Instant::now() + timeout;
        let mut sample = None;
        let mut media_answered = false;
        while Instant::now() < deadline && !media_answered {
            let Some((namespace, value)) = self.next_json()? else {
                continue;
            };
            match message_type(&value) {
                Some("RECEIVER_STATUS") if namespace == NAMESPACE_RECEIVER => {
                    if let Some(volume) = receiver_volume(&value) {
                        self.volume = volume;
                    }
                }
                Some("MEDIA_STATUS") if namespace == NAMESPACE_MEDIA => {
                    media_answered = true;
                    sample = media_sample(&value);
                }
                _ => {}
            }
        }
        if !media_answered {
            return Err("timed out waiting for media status".to_string());
        }

        let Some(sample) = sample else {
            return Ok(RemoteStatus {
                volume: self.volume,
                ..RemoteStatus::default()
            });
        };
        if sample.media_session_id.is_some() {
            self.media_session_id = sample.media_session_id;
        }
        if let Some(media_id) = sample.media_id.as_deref() {
            if let Some(index) = self.queue_media_ids.iter().position(|id| id == media_id) {
                self.queue_index = Some(index);
            }
        }
        Ok(RemoteStatus {
            position_ms: seconds_to_ms(sample.current_time_s),
            duration_ms: sample.duration_s.map(seconds_to_ms).unwrap_or(0),
            is_playing: sample.is_playing(),
            is_buffering: sample.is_buffering(),
            volume: self.volume,
            current_item_id: sample.media_id.clone(),
        })
    }

    /// Stops playback, the receiver app and both virtual connections; errors are logged only.
    pub fn shutdown(&mut self) {
        if let Err(err) = self.send_media(json!({"type":"STOP"})) {
            debug!("CastChannel: media STOP during disconnect failed: {}", err);
        }
        if let Some(session_id) = self.app_session_id.take() {
            let request_id = self.alloc_request_id();
            if let Err(err) = self.send_json(
                NAMESPACE_RECEIVER,
                RECEIVER_ID,
                json!({"type":"STOP","requestId":request_id,"sessionId":session_id}),
            ) {
                debug!("CastChannel: receiver app STOP during disconnect failed: {}", err);
            }
        }
        let transport_id = self.media_transport_id.clone();
        for destination in [transport_id.as_str(), RECEIVER_ID] {
            if let Err(err) = self.send_json(NAMESPACE_CONNECTION, destination, json!({"type":"CLOSE"})) {
                debug!("CastChannel: CLOSE to {} failed: {}", destination, err);
            }
        }
        let _ = self.stream.shutdown();
        self.queue_media_ids.clear();
        self.queue_index = None;
        self.media_session_id = None;
    }
}

fn queue_item_json(entry: &QueueEntry) -> Value {
    let mut metadata = json!({
        "metadataType": 3,
        "title": entry.title,
    });
    if let Some(artist) = &entry.artist {
        metadata["artist"] = json!(artist);
    }
    if let Some(artwork_url) = &entry.artwork_url {
        metadata["images"] = json!([{"url": artwork_url}]);
    }
    let mut media = json!({
        "contentId": entry.content_url,
        "contentUrl": entry.content_url,
        "streamType": "BUFFERED",
        "contentType": entry.content_type,
        "metadata": metadata,
        "customData": {"mediaId": entry.item_id},
    });
    if let Some(duration_ms) = entry.duration_ms {
        media["duration"] = json!(duration_ms as f64 / 1000.0);
    }
    json!({
        "autoplay": true,
        "preloadTime": 10,
        "media": media,
    })
}

#[cfg(test)]
mod tests {
    use super::queue_item_json;
    use crate::media::{MediaItem, QueueEntry};

    #[test]
    fn test_queue_item_carries_media_id_and_metadata() {
        let mut item = MediaItem::from_uri("track-7", "http://media/song.mp3");
        item.artist = Some("Band".to_string());
        item.duration_ms = Some(90_500);
        let entry = QueueEntry::from_item(&item, "http://media/song.mp3?pot=abc".to_string());

        let value = queue_item_json(&entry);

        assert_eq!(value["media"]["customData"]["mediaId"], "track-7");
        assert_eq!(value["media"]["contentId"], "http://media/song.mp3?pot=abc");
        assert_eq!(value["media"]["contentType"], "audio/mpeg");
        assert_eq!(value["media"]["duration"], 90.5);
        assert_eq!(value["media"]["metadata"]["title"], "song.mp3");
        assert_eq!(value["media"]["metadata"]["artist"], "Band");
        assert!(value["media"]["metadata"].get("images").is_none());
        assert_eq!(value["autoplay"], true);
    }
}
