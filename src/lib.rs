//! Bridge that presents an FTMS-only smart trainer to Zwift as a Wahoo
//! KICKR BIKE, so a Zwift Ride style handlebar controller can drive virtual
//! shifting and incline control.
//!
//! One synthetic GATT tree (the [`mirror::GattMirror`]) is served over two
//! transports at once: a local BLE peripheral (bluer) and Wahoo's TNP
//! BLE-over-TCP encapsulation on port 36867, discovered via mDNS.

pub mod ble_service;
pub mod config;
pub mod debug_server;
pub mod ftms;
pub mod gears;
pub mod mdns;
pub mod mirror;
pub mod protocol;
pub mod server;
pub mod session;
pub mod tnp;
pub mod trainer;
pub mod zwift_ride;
