//! Boundary traits for the cast protocol stack.
//!
//! `CastTransport` finds and opens receivers; `ReceiverSession` is the control
//! channel of one open receiver. The Cast v2 implementation lives in
//! `crate::castv2`; tests use the in-memory fake from `fake`.

use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::CastError;
use crate::media::QueueEntry;
use crate::protocol::CastDeviceInfo;

/// One sample of the receiver's transport state.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RemoteStatus {
    pub position_ms: u64,
    pub duration_ms: u64,
    pub is_playing: bool,
    pub is_buffering: bool,
    pub volume: f32,
    /// Media id of the queue item the receiver is currently on.
    pub current_item_id: Option<String>,
}

#[async_trait]
pub trait CastTransport: Send + Sync {
    async fn discover(&self) -> Result<Vec<CastDeviceInfo>, CastError>;
    async fn connect(&self, device: &CastDeviceInfo) -> Result<Arc<dyn ReceiverSession>, CastError>;
}

#[async_trait]
pub trait ReceiverSession: Send + Sync {
    async fn load_queue(&self, entries: &[QueueEntry], start_index: usize) -> Result<(), CastError>;
    async fn jump_to_index(&self, index: usize) -> Result<(), CastError>;
    async fn play(&self) -> Result<(), CastError>;
    async fn pause(&self) -> Result<(), CastError>;
    async fn seek(&self, position_ms: u64) -> Result<(), CastError>;
    async fn set_volume(&self, volume: f32) -> Result<(), CastError>;
    async fn status(&self) -> Result<RemoteStatus, CastError>;
    /// Stops the receiver app and closes the channel; never fails.
    async fn close(&self);
}
