//! Local BLE peripheral face of the bridge.
//!
//! Instantiates the mirror's service tree as a bluer GATT application:
//! central reads come from the mirror's value store, central writes go
//! through `Mirror::write`, and mirror notifications are relayed to the
//! central by a single router task so writes to the link are serialized.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bluer::adv::Advertisement;
use bluer::gatt::local::{
    Application, Characteristic, CharacteristicNotifier, CharacteristicNotify,
    CharacteristicNotifyMethod, CharacteristicRead, CharacteristicWrite,
    CharacteristicWriteMethod, ReqError, Service,
};
use futures::FutureExt;
use log::{debug, info, warn};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::mirror::{GattMirror, MirrorError, Props, SessionId, NOTIFY_QUEUE_DEPTH};
use crate::protocol::{
    CSC_SERVICE_UUID, CYCLING_POWER_SERVICE_UUID, FTMS_SERVICE_UUID, HEART_RATE_SERVICE_UUID,
};

type NotifierMap = Arc<Mutex<HashMap<Uuid, CharacteristicNotifier>>>;

/// Address of the default adapter, used to derive the device identity.
pub async fn adapter_mac() -> bluer::Result<String> {
    let session = bluer::Session::new().await?;
    let adapter = session.default_adapter().await?;
    Ok(adapter.address().await?.to_string())
}

/// Run the BLE peripheral. Advertises, serves the GATT tree, and routes
/// notifications until the session ends.
pub async fn run(mirror: Arc<GattMirror>, device_name: String) -> bluer::Result<()> {
    let session = bluer::Session::new().await?;
    let adapter = session.default_adapter().await?;
    adapter.set_powered(true).await?;

    info!(
        "BLE peripheral using adapter {} ({})",
        adapter.name(),
        adapter.address().await?
    );

    // The Zwift Ride service stays out of the advertisement: Zwift finds it
    // via mDNS/TCP, and the remaining payload space goes to the services a
    // generic fitness app scans for.
    let adv = Advertisement {
        advertisement_type: bluer::adv::Type::Peripheral,
        service_uuids: vec![
            CYCLING_POWER_SERVICE_UUID,
            CSC_SERVICE_UUID,
            HEART_RATE_SERVICE_UUID,
            FTMS_SERVICE_UUID,
        ]
        .into_iter()
        .collect(),
        local_name: Some(device_name.clone()),
        discoverable: Some(true),
        // Connection interval hints: 160-250 x 1.25 ms
        min_interval: Some(Duration::from_millis(200)),
        max_interval: Some(Duration::from_millis(312)),
        ..Default::default()
    };
    let _adv_handle = adapter.advertise(adv).await?;
    info!("Advertising as '{}'", device_name);

    let (notif_tx, mut notif_rx) = mpsc::channel(NOTIFY_QUEUE_DEPTH);
    let ble_session = mirror.attach(notif_tx);
    let notifiers: NotifierMap = Arc::new(Mutex::new(HashMap::new()));

    // Build the GATT application from the mirror tree.
    let mut services = Vec::new();
    for service_uuid in mirror.services() {
        let characteristics = mirror
            .characteristics(&service_uuid)
            .unwrap_or_default()
            .into_iter()
            .map(|(uuid, props)| {
                build_characteristic(uuid, props, mirror.clone(), ble_session, notifiers.clone())
            })
            .collect();
        services.push(Service {
            uuid: service_uuid,
            primary: true,
            characteristics,
            ..Default::default()
        });
    }
    let app = Application {
        services,
        ..Default::default()
    };
    let _app_handle = adapter.serve_gatt_application(app).await?;
    info!("BLE GATT application registered");

    // Router: one task pulls mirror fanout and writes to the central, so
    // notifications per characteristic stay ordered and link writes never
    // interleave.
    while let Some(notification) = notif_rx.recv().await {
        let mut map = notifiers.lock().await;
        let Some(notifier) = map.get_mut(&notification.uuid) else {
            continue;
        };
        if notifier.is_stopped() {
            map.remove(&notification.uuid);
            let _ = mirror.unsubscribe(ble_session, &notification.uuid);
            continue;
        }
        if let Err(e) = notifier.notify(notification.value).await {
            warn!("BLE notify error on {}: {}", notification.uuid, e);
            map.remove(&notification.uuid);
            let _ = mirror.unsubscribe(ble_session, &notification.uuid);
        }
    }

    mirror.drop_session(ble_session);
    Ok(())
}

fn build_characteristic(
    uuid: Uuid,
    props: Props,
    mirror: Arc<GattMirror>,
    ble_session: SessionId,
    notifiers: NotifierMap,
) -> Characteristic {
    let mut characteristic = Characteristic {
        uuid,
        ..Default::default()
    };

    if props.readable() {
        let mirror = mirror.clone();
        characteristic.read = Some(CharacteristicRead {
            read: true,
            fun: Box::new(move |_req| {
                let mirror = mirror.clone();
                async move {
                    debug!("BLE read of {}", uuid);
                    mirror.value(&uuid).map_err(|_| ReqError::Failed)
                }
                .boxed()
            }),
            ..Default::default()
        });
    }

    if props.writable() {
        let mirror = mirror.clone();
        characteristic.write = Some(CharacteristicWrite {
            write: true,
            method: CharacteristicWriteMethod::Fun(Box::new(move |value, _req| {
                let mirror = mirror.clone();
                async move {
                    debug!("BLE write of {} bytes to {}", value.len(), uuid);
                    match mirror.write(&uuid, &value) {
                        Ok(()) => Ok(()),
                        Err(MirrorError::NotWritable) => Err(ReqError::NotSupported),
                        Err(e) => {
                            warn!("BLE write to {} failed: {}", uuid, e);
                            Err(ReqError::Failed)
                        }
                    }
                }
                .boxed()
            })),
            ..Default::default()
        });
    }

    if props.subscribable() {
        let mirror = mirror.clone();
        characteristic.notify = Some(CharacteristicNotify {
            notify: props.notifiable(),
            indicate: props.indicatable(),
            method: CharacteristicNotifyMethod::Fun(Box::new(move |notifier| {
                let mirror = mirror.clone();
                let notifiers = notifiers.clone();
                async move {
                    info!("BLE central subscribed to {}", uuid);
                    if mirror.subscribe(ble_session, &uuid).is_ok() {
                        notifiers.lock().await.insert(uuid, notifier);
                    }
                }
                .boxed()
            })),
            ..Default::default()
        });
    }

    characteristic
}
