//! Device layer: connection validation, fusion, and the device directory.

mod connection;
mod fused;
mod manager;

pub use connection::{DeviceConnection, DeviceEvent};
pub use fused::FusedDevice;
pub use manager::{ConnectionManager, DirectoryEvent};
