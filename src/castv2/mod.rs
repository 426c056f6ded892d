//! Google Cast v2 implementation of the receiver boundary.
//!
//! - discovers cast targets via mDNS (`mdns-sd`)
//! - connects over TLS to the cast control channel
//! - launches the default media receiver and mirrors queues with `QUEUE_LOAD`
//!
//! The channel is blocking socket I/O; each call runs on tokio's blocking pool
//! behind a mutex so commands and status samples never interleave on the wire.

mod channel;
mod discovery;
mod frame;
mod status;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::debug;

use crate::config::CastConfig;
use crate::errors::CastError;
use crate::media::QueueEntry;
use crate::protocol::CastDeviceInfo;
use crate::receiver::{CastTransport, ReceiverSession, RemoteStatus};

use channel::ReceiverChannel;

async fn run_blocking<T, F>(task: F) -> Result<T, CastError>
where
    F: FnOnce() -> Result<T, String> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|err| CastError::channel(format!("cast channel task failed: {err}")))?
        .map_err(CastError::Channel)
}

/// Finds receivers on the LAN and opens control channels to them.
pub struct CastV2Transport {
    discovery_window: Duration,
    connect_timeout: Duration,
    status_timeout: Duration,
}

impl CastV2Transport {
    pub fn new(config: &CastConfig) -> Self {
        Self {
            discovery_window: config.discovery_window(),
            connect_timeout: config.connect_timeout(),
            status_timeout: config.status_timeout(),
        }
    }
}

#[async_trait]
impl CastTransport for CastV2Transport {
    async fn discover(&self) -> Result<Vec<CastDeviceInfo>, CastError> {
        let window = self.discovery_window;
        run_blocking(move || discovery::discover_cast_devices(window)).await
    }

    async fn connect(&self, device: &CastDeviceInfo) -> Result<Arc<dyn ReceiverSession>, CastError> {
        let target = device.clone();
        let timeout = self.connect_timeout;
        let channel = run_blocking(move || ReceiverChannel::connect(&target, timeout))
            .await
            .map_err(|err| match err {
                CastError::Channel(reason) => CastError::Connection(reason),
                other => other,
            })?;
        Ok(Arc::new(CastV2Receiver {
            channel: Arc::new(Mutex::new(channel)),
            status_timeout: self.status_timeout,
        }))
    }
}

/// One connected receiver running the default media receiver app.
pub struct CastV2Receiver {
    channel: Arc<Mutex<ReceiverChannel>>,
    status_timeout: Duration,
}

impl CastV2Receiver {
    async fn with_channel<T, F>(&self, op: F) -> Result<T, CastError>
    where
        F: FnOnce(&mut ReceiverChannel) -> Result<T, String> + Send + 'static,
        T: Send + 'static,
    {
        let channel = Arc::clone(&self.channel);
        run_blocking(move || {
            let mut locked = match channel.lock() {
                Ok(locked) => locked,
                Err(poisoned) => poisoned.into_inner(),
            };
            op(&mut locked)
        })
        .await
    }
}

#[async_trait]
impl ReceiverSession for CastV2Receiver {
    async fn load_queue(&self, entries: &[QueueEntry], start_index: usize) -> Result<(), CastError> {
        let entries = entries.to_vec();
        let timeout = self.status_timeout;
        self.with_channel(move |channel| channel.load_queue(&entries, start_index, timeout))
            .await
    }

    async fn jump_to_index(&self, index: usize) -> Result<(), CastError> {
        self.with_channel(move |channel| channel.jump_to_index(index))
            .await
    }

    async fn play(&self) -> Result<(), CastError> {
        self.with_channel(ReceiverChannel::play).await
    }

    async fn pause(&self) -> Result<(), CastError> {
        self.with_channel(ReceiverChannel::pause).await
    }

    async fn seek(&self, position_ms: u64) -> Result<(), CastError> {
        self.with_channel(move |channel| channel.seek_ms(position_ms))
            .await
    }

    async fn set_volume(&self, volume: f32) -> Result<(), CastError> {
        self.with_channel(move |channel| channel.set_volume(volume))
            .await
    }

    async fn status(&self) -> Result<RemoteStatus, CastError> {
        let timeout = self.status_timeout;
        self.with_channel(move |channel| channel.sample_status(timeout))
            .await
    }

    async fn close(&self) {
        let result = self
            .with_channel(|channel| {
                channel.shutdown();
                Ok(())
            })
            .await;
        if let Err(err) = result {
            debug!("CastV2Receiver: close failed: {}", err);
        }
    }
}
