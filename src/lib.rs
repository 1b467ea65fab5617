//! Rust library for controlling IntesisBox air-conditioning gateways
//!
//! IntesisBox gateways expose the AC unit they are wired to over "WMP", a
//! line-oriented ASCII protocol on TCP port 3310. This library provides an
//! async client for it:
//!
//! - Handshake and function discovery on connect
//! - Reads and writes of any discovered function, correlated with the
//!   gateway's replies and bounded by a timeout
//! - Push updates applied to a local state cache, with change subscriptions
//! - Keepalive and periodic polling
//! - Automatic reconnect with exponential backoff
//! - Climate helpers for power, mode, setpoint, fan speed and vanes
//!
//! # Quick Start
//!
//! ```no_run
//! use intesisbox_wmp::{ClientConfig, DeviceEvent, IntesisBox, Mode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let ac = IntesisBox::new(ClientConfig::new("192.168.1.50"))?;
//!     let mut events = ac.subscribe();
//!     ac.connect().await?;
//!
//!     println!("Connected to {:?}", ac.model());
//!     ac.set_mode(Mode::Heat).await?;
//!     ac.set_temperature(21.0).await?;
//!
//!     while let Ok(event) = events.recv().await {
//!         if let DeviceEvent::StateChanged { function, new, .. } = event {
//!             println!("{} = {}", function, new);
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **Client**: per-gateway handle and climate helpers
//! - **Session**: handshake, discovery, request correlation, reconnect policy
//! - **State**: last known values and the event channel
//! - **Connection**: TCP socket with separate reader and writer tasks
//! - **Protocol**: WMP line codec
//! - **Types**: function descriptors, values and status enums

mod client;
mod climate;
mod config;
mod connection;
mod error;
mod protocol;
mod session;
mod state;
mod subscription;
mod types;

// Public exports
pub use client::IntesisBox;
pub use config::{ClientConfig, DEFAULT_PORT};
pub use error::{ParseError, Result, WmpError};
pub use protocol::{decode, Command, Message, WmpCodec, MAX_LINE_LENGTH};
pub use state::DeviceState;
pub use subscription::{DeviceEvent, EventReceiver};
pub use types::{
    AllowedValues, ConnectionStatus, DataType, DeviceInfo, FunctionDescriptor, FunctionId, Mode,
    SessionPhase, Value, FUNCTION_AMBTEMP, FUNCTION_ERRCODE, FUNCTION_ERRSTATUS, FUNCTION_FANSP,
    FUNCTION_MODE, FUNCTION_ONOFF, FUNCTION_SETPOINT, FUNCTION_VANELR, FUNCTION_VANEUD,
    LIMIT_FUNCTIONS, NULL_VALUES, POWER_OFF, POWER_ON, VANE_SWING,
};
