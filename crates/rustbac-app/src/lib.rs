//! Application-layer transaction bookkeeping and routing for BACnet nodes:
//! the Segmentation State Machines (SSM), the Application Service Access
//! Point (ASAP) that owns them, and the Network Service Access Point (NSAP)
//! that routes their PDUs onto the right adapter.

#![allow(async_fn_in_trait)]

pub mod asap;
pub mod config;
pub mod device_info;
pub mod error;
pub mod nsap;
pub mod ssm;

pub use asap::{Application, ApplicationServiceAccessPoint};
pub use config::SapConfig;
pub use device_info::{DeviceInfo, DeviceInfoCache};
pub use error::{AbortReason, AsapError, NsapError, SsmError};
pub use nsap::NetworkServiceAccessPoint;
