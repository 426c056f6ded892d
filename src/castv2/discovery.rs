//! mDNS discovery of cast receivers (`mdns-sd`, no system daemon dependency).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::{debug, warn};
use mdns_sd::{ServiceDaemon, ServiceEvent};

use crate::protocol::CastDeviceInfo;

const CAST_SERVICE_TYPE: &str = "_googlecast._tcp.local.";
const DISCOVERY_POLL: Duration = Duration::from_millis(250);

fn instance_name_from_fullname(fullname: &str) -> String {
    let suffix = "._googlecast._tcp.local.";
    fullname
        .trim()
        .strip_suffix(suffix)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(fullname)
        .trim_matches('.')
        .to_string()
}

fn txt_value(service: &mdns_sd::ResolvedService, key: &str) -> Option<String> {
    service
        .get_property_val_str(key)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}

fn device_from_resolved_service(service: &mdns_sd::ResolvedService) -> Option<CastDeviceInfo> {
    let mut v4_addresses: Vec<_> = service.get_addresses_v4().iter().copied().collect();
    v4_addresses.sort();
    let address = v4_addresses.first().map(ToString::to_string)?;

    let host = service.get_hostname().trim_end_matches('.').to_string();
    let port = service.get_port();
    let name = txt_value(service, "fn")
        .unwrap_or_else(|| instance_name_from_fullname(service.get_fullname()));
    let model = txt_value(service, "md").unwrap_or_default();
    let id = txt_value(service, "id").unwrap_or_else(|| format!("{}:{}:{}", host, address, port));
    Some(CastDeviceInfo {
        id,
        name,
        model,
        host,
        address,
        port,
    })
}

/// Browses for cast receivers for `window`; blocking.
pub(crate) fn discover_cast_devices(window: Duration) -> Result<Vec<CastDeviceInfo>, String> {
    let mdns = ServiceDaemon::new()
        .map_err(|err| format!("failed to start mDNS discovery daemon: {err}"))?;
    let browse_receiver = match mdns.browse(CAST_SERVICE_TYPE) {
        Ok(receiver) => receiver,
        Err(err) => {
            let _ = mdns.shutdown();
            return Err(format!("failed to browse cast mDNS service: {err}"));
        }
    };

    let deadline = Instant::now() + window;
    let mut devices_by_id: HashMap<String, CastDeviceInfo> = HashMap::new();
    while Instant::now() < deadline {
        let timeout = deadline
            .saturating_duration_since(Instant::now())
            .min(DISCOVERY_POLL);
        let Ok(event) = browse_receiver.recv_timeout(timeout) else {
            continue;
        };
        if let ServiceEvent::ServiceResolved(service) = event {
            match device_from_resolved_service(&service) {
                Some(device) => {
                    debug!("CastDiscovery: resolved '{}' at {}", device.name, device.address);
                    devices_by_id.insert(device.id.clone(), device);
                }
                None => warn!(
                    "CastDiscovery: ignoring {} without an IPv4 address",
                    service.get_fullname()
                ),
            }
        }
    }

    if let Err(err) = mdns.stop_browse(CAST_SERVICE_TYPE) {
        debug!("CastDiscovery: failed to stop mDNS browse cleanly: {}", err);
    }
    let _ = mdns.shutdown();

    Ok(sorted_devices(devices_by_id))
}

fn sorted_devices(devices_by_id: HashMap<String, CastDeviceInfo>) -> Vec<CastDeviceInfo> {
    let mut devices: Vec<CastDeviceInfo> = devices_by_id.into_values().collect();
    devices.sort_by(|a, b| {
        a.name
            .to_lowercase()
            .cmp(&b.name.to_lowercase())
            .then_with(|| a.id.cmp(&b.id))
    });
    devices
}
