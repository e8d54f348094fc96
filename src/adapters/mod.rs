//! Adapters: concrete implementations of the port traits.
//!
//! | Adapter       | Implements                 | Connects to                 |
//! |---------------|----------------------------|-----------------------------|
//! | `device`      | DevicePort                 | Simulated RNG, poll, reset  |
//! | `flash`       | StagingPort                | Any `NorFlash` / `MemFlash` |
//! | `image_store` | FileProvider               | OTA files held in memory    |
//! | `log_sink`    | EventSink                  | `log` facade / recorder     |
//! | `loopback`    | ZclTransport, NetworkPort  | In-process network          |

pub mod device;
pub mod flash;
pub mod image_store;
pub mod log_sink;
pub mod loopback;
