use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::{info, warn};
use tokio::sync::broadcast::{self, error::RecvError, Receiver};

use castbridge::castv2::CastV2Transport;
use castbridge::config::{default_config_path, load_or_create, Config};
use castbridge::media::{MediaItem, StaticPlaylist};
use castbridge::protocol::{CastMessage, Message};
use castbridge::{CastSessionManager, CastState};

#[derive(Parser, Debug)]
#[clap(about = "Mirror a list of media URIs onto a Google Cast receiver")]
struct CliArgs {
    /// Name or id fragment of the receiver to connect to.
    device: String,

    /// Media URIs forming the play queue, in order.
    #[clap(required = true)]
    uris: Vec<String>,

    /// 1-based position of the item to start playback from.
    #[clap(long, default_value_t = 1)]
    start: usize,

    /// Path to TOML configuration file.
    #[clap(long)]
    config: Option<PathBuf>,
}

async fn log_bus(mut bus_receiver: Receiver<Message>) {
    loop {
        match bus_receiver.recv().await {
            Ok(Message::Cast(CastMessage::DevicesUpdated(devices))) => {
                for device in devices {
                    info!("Found cast device '{}' ({}, {})", device.name, device.model, device.id);
                }
            }
            Ok(Message::Cast(CastMessage::ConnectionStateChanged {
                state,
                reason: Some(reason),
                ..
            })) => info!("Cast connection {:?}: {}", state, reason),
            Ok(Message::Cast(CastMessage::QueueMirrored {
                item_ids,
                current_index,
            })) => info!("Receiver queue {:?}, current index {}", item_ids, current_index),
            Ok(Message::Cast(CastMessage::ReceiverUnreachable { reason })) => {
                warn!("Cast receiver unreachable: {}", reason)
            }
            Ok(Message::Cast(CastMessage::LoadFailed { item_id, reason })) => {
                warn!("Failed to load {} on receiver: {}", item_id, reason)
            }
            Ok(Message::Playback(intent)) => info!("Receiver-side change: {:?}", intent),
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => warn!("Bus lagged by {} messages", skipped),
            Err(RecvError::Closed) => break,
        }
    }
}

async fn log_state(state: Arc<CastState>) {
    let mut connection = state.subscribe_connection_state();
    let mut playing = state.subscribe_playing();
    let mut volume = state.subscribe_volume();
    loop {
        tokio::select! {
            changed = connection.changed() => {
                if changed.is_err() {
                    break;
                }
                info!("Cast state: {:?}", *connection.borrow_and_update());
            }
            changed = playing.changed() => {
                if changed.is_err() {
                    break;
                }
                info!(
                    "Cast playing={} position={}ms duration={}ms",
                    *playing.borrow_and_update(),
                    state.position_ms(),
                    state.duration_ms()
                );
            }
            changed = volume.changed() => {
                if changed.is_err() {
                    break;
                }
                info!("Cast volume: {:.2}", *volume.borrow_and_update());
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();
    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    let (config, config_error) = match load_or_create(&config_path) {
        Ok(config) => (config, None),
        Err(err) => (Config::default(), Some(err)),
    };

    let mut clog = colog::default_builder();
    clog.filter(None, config.logging.level.to_level_filter());
    clog.init();

    std::panic::set_hook(Box::new(|panic_info| {
        let current_thread = std::thread::current();
        let thread_name = current_thread.name().unwrap_or("unnamed");
        log::error!("panic in thread '{}': {}", thread_name, panic_info);
    }));

    if let Some(err) = config_error {
        warn!("Using default config: {}", err);
    }

    let items: Vec<MediaItem> = args
        .uris
        .iter()
        .enumerate()
        .map(|(index, uri)| MediaItem::from_uri(format!("item-{}", index + 1), uri.as_str()))
        .collect();
    let start_id = items
        .get(args.start.saturating_sub(1))
        .map(|item| item.id.clone())
        .ok_or_else(|| format!("--start {} is outside the {} given uris", args.start, items.len()))?;

    let (bus_sender, bus_receiver) = broadcast::channel(1024);
    let manager = Arc::new(CastSessionManager::new(
        config.cast.clone(),
        Arc::new(CastV2Transport::new(&config.cast)),
        Arc::new(StaticPlaylist::new(items)),
        bus_sender,
    ));
    tokio::spawn(log_bus(bus_receiver));
    tokio::spawn(log_state(manager.state()));

    let devices = manager.discover_devices().await?;
    let needle = args.device.to_lowercase();
    let device = devices
        .iter()
        .find(|device| {
            device.name.to_lowercase().contains(&needle) || device.id.to_lowercase().contains(&needle)
        })
        .ok_or_else(|| {
            format!(
                "no cast device matching '{}' among {} discovered",
                args.device,
                devices.len()
            )
        })?;

    manager.connect_to_route(&device.id).await?;
    manager.load_media(&start_id).await?;
    info!("Casting to '{}', press Ctrl-C to stop", device.name);

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, releasing cast session");
    manager.release().await;
    Ok(())
}
