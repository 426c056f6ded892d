//! Parsing of receiver and media status payloads.

use serde_json::Value;

/// The fields of one `MEDIA_STATUS` entry the bridge cares about.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct MediaSample {
    pub media_session_id: Option<i64>,
    pub player_state: String,
    pub current_time_s: f64,
    pub duration_s: Option<f64>,
    /// Local item id carried in `customData.mediaId` of the current queue item.
    pub media_id: Option<String>,
}

impl MediaSample {
    pub fn is_playing(&self) -> bool {
        self.player_state == "PLAYING"
    }

    pub fn is_buffering(&self) -> bool {
        matches!(self.player_state.as_str(), "BUFFERING" | "LOADING")
    }
}

pub(crate) fn message_type(value: &Value) -> Option<&str> {
    value.get("type").and_then(Value::as_str)
}

fn custom_media_id(media: &Value) -> Option<String> {
    media
        .get("customData")
        .and_then(|custom| custom.get("mediaId"))
        .and_then(Value::as_str)
        .map(ToString::to_string)
}

/// First entry of a `MEDIA_STATUS` message; `None` when the receiver has no media session.
pub(crate) fn media_sample(value: &Value) -> Option<MediaSample> {
    let status = value.get("status")?.as_array()?.first()?;
    let media_id = status
        .get("media")
        .and_then(custom_media_id)
        .or_else(|| {
            let current_item_id = status.get("currentItemId").and_then(Value::as_i64)?;
            status
                .get("items")?
                .as_array()?
                .iter()
                .find(|item| item.get("itemId").and_then(Value::as_i64) == Some(current_item_id))
                .and_then(|item| item.get("media"))
                .and_then(custom_media_id)
        });
    Some(MediaSample {
        media_session_id: status.get("mediaSessionId").and_then(Value::as_i64),
        player_state: status
            .get("playerState")
            .and_then(Value::as_str)
            .unwrap_or("UNKNOWN")
            .to_string(),
        current_time_s: status
            .get("currentTime")
            .and_then(Value::as_f64)
            .unwrap_or(0.0),
        duration_s: status
            .get("media")
            .and_then(|media| media.get("duration"))
            .and_then(Value::as_f64),
        media_id,
    })
}

/// Reply to a `QUEUE_LOAD`: the id of the new media session, an error when
/// the receiver refused the load, or `None` for unrelated traffic.
pub(crate) fn queue_load_reply(
    value: &Value,
    previous_session: Option<i64>,
) -> Option<Result<i64, String>> {
    match message_type(value)? {
        "MEDIA_STATUS" => media_sample(value)?
            .media_session_id
            .filter(|session_id| Some(*session_id) != previous_session)
            .map(Ok),
        kind @ ("LOAD_FAILED" | "LOAD_CANCELLED" | "INVALID_REQUEST") => {
            Some(Err(format!("receiver rejected queue load ({kind})")))
        }
        _ => None,
    }
}

pub(crate) fn receiver_volume(value: &Value) -> Option<f32> {
    value
        .get("status")?
        .get("volume")?
        .get("level")?
        .as_f64()
        .map(|level| level.clamp(0.0, 1.0) as f32)
}

/// Transport and session id of `app_id` in a `RECEIVER_STATUS` message.
pub(crate) fn launched_app(value: &Value, app_id: &str) -> Option<(String, String)> {
    value
        .get("status")?
        .get("applications")?
        .as_array()?
        .iter()
        .filter(|app| app.get("appId").and_then(Value::as_str) == Some(app_id))
        .find_map(|app| {
            let transport_id = app.get("transportId").and_then(Value::as_str)?;
            let session_id = app.get("sessionId").and_then(Value::as_str)?;
            Some((transport_id.to_string(), session_id.to_string()))
        })
}

pub(crate) fn seconds_to_ms(seconds: f64) -> u64 {
    if seconds.is_finite() && seconds > 0.0 {
        (seconds * 1000.0).round() as u64
    } else {
        0
    }
}
