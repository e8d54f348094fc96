//! ZigBee ZCL OTA Upgrade engine library.
//!
//! Pure protocol logic for both ends of the OTA Upgrade cluster, exposed
//! for the simulator binary, integration tests and fuzzing.  Nothing here
//! touches a real radio or flash part: engines reach the outside world
//! through the port traits in [`app::ports`].

#![deny(unused_must_use)]

pub mod adapters;
pub mod app;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod protocol;
pub mod retry;
pub mod server;
pub mod sim;
pub mod timers;
