//! mDNS advertiser for the TNP face.
//!
//! Publishes the bridge as `KICKR BIKE PRO <serial>` of type
//! `_wahoo-fitness-tnp._tcp` with the TXT records Zwift expects:
//! `ble-service-uuids` (comma-separated 16-bit hex short UUIDs),
//! `mac-address` (dash-separated), and `serial-number`. The UUID list starts
//! empty and grows as services register.

use std::sync::Mutex;

use log::{debug, info};
use mdns_sd::{ServiceDaemon, ServiceInfo};

pub const SERVICE_TYPE: &str = "_wahoo-fitness-tnp._tcp.local.";

pub struct MdnsAdvertiser {
    daemon: ServiceDaemon,
    instance: String,
    hostname: String,
    port: u16,
    mac_address: String,
    serial_number: String,
    service_uuids: Mutex<Vec<String>>,
}

impl MdnsAdvertiser {
    /// Create the daemon and publish the initial (empty UUID list) record.
    pub fn new(
        instance: &str,
        mac_address: &str,
        serial_number: &str,
        port: u16,
    ) -> Result<Self, mdns_sd::Error> {
        let advertiser = MdnsAdvertiser {
            daemon: ServiceDaemon::new()?,
            instance: instance.to_string(),
            hostname: format!("kickr-bridge-{}.local.", serial_number.to_lowercase()),
            port,
            mac_address: mac_address.to_string(),
            serial_number: serial_number.to_string(),
            service_uuids: Mutex::new(Vec::new()),
        };
        advertiser.publish()?;
        info!(
            "Advertising {} as {} on port {}",
            SERVICE_TYPE, instance, port
        );
        Ok(advertiser)
    }

    /// Append a 16-bit short UUID (4 hex chars) to the TXT list and
    /// re-publish. Idempotent.
    pub fn add_service_uuid(&self, short: &str) -> Result<(), mdns_sd::Error> {
        {
            let mut uuids = self.lock_uuids();
            if uuids.iter().any(|u| u == short) {
                return Ok(());
            }
            uuids.push(short.to_string());
        }
        debug!("Adding BLE service UUID {} to mDNS TXT", short);
        self.publish()
    }

    pub fn shutdown(&self) {
        let _ = self.daemon.shutdown();
    }

    fn publish(&self) -> Result<(), mdns_sd::Error> {
        let uuid_list = self.lock_uuids().join(",");
        let txt = [
            ("ble-service-uuids", uuid_list.as_str()),
            ("mac-address", self.mac_address.as_str()),
            ("serial-number", self.serial_number.as_str()),
        ];
        let info = ServiceInfo::new(
            SERVICE_TYPE,
            &self.instance,
            &self.hostname,
            "",
            self.port,
            &txt[..],
        )?
        .enable_addr_auto();

        // Re-registering the same fullname replaces the published record;
        // drop the old one first so stale TXT data never lingers.
        let fullname = format!("{}.{}", self.instance, SERVICE_TYPE);
        let _ = self.daemon.unregister(&fullname);
        self.daemon.register(info)
    }

    fn lock_uuids(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        match self.service_uuids.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Daemon construction binds multicast sockets, so these tests exercise
    // only the TXT bookkeeping via the public API against a real daemon and
    // tolerate environments without multicast by skipping.

    fn advertiser() -> Option<MdnsAdvertiser> {
        MdnsAdvertiser::new("KICKR BIKE PRO TEST01", "AA-BB-CC-00-11-22", "TEST01", 36867).ok()
    }

    #[test]
    fn test_add_service_uuid_idempotent() {
        let Some(adv) = advertiser() else {
            return;
        };
        adv.add_service_uuid("1826").unwrap();
        adv.add_service_uuid("FC82").unwrap();
        adv.add_service_uuid("1826").unwrap();
        assert_eq!(adv.lock_uuids().as_slice(), &["1826", "FC82"]);
        adv.shutdown();
    }

    #[test]
    fn test_uuid_list_starts_empty() {
        let Some(adv) = advertiser() else {
            return;
        };
        assert!(adv.lock_uuids().is_empty());
        adv.shutdown();
    }
}
