//! # ewelink
//!
//! Asynchronous registry for eWeLink (Sonoff) devices, controlled over the
//! eWeLink Cloud WebSocket and over the LAN zeroconf API.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ewelink::{Config, Registry};
//!
//! # async fn run() -> ewelink::error::Result<()> {
//! let registry = Registry::new(Config::from_file("ewelink.json")?);
//! registry.start().await?;
//! // registry.send("1000abcdef", SendRequest::new(params)).await;
//! # Ok(())
//! # }
//! ```
//!
#[macro_use]
pub mod macros;
pub mod cache;
pub mod cloud;
pub mod config;
pub mod crypto;
pub mod device;
pub mod dispatcher;
pub mod entities;
pub mod error;
pub mod local;
pub mod protocol;
pub mod registry;

#[cfg(test)]
mod testing;

pub use cloud::{CloudClient, Region};
pub use config::{Config, DeviceConfig, Mode};
pub use device::XDevice;
pub use dispatcher::Dispatcher;
pub use error::EwelinkError;
pub use local::LocalClient;
pub use protocol::Outcome;
pub use registry::{Registry, SendRequest};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn version() -> &'static str {
    VERSION
}
