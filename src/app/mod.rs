//! Application core: the seams between the engines and the outside world.
//!
//! The engines never own a radio, a flash part or a file store.  All
//! interaction happens through the **port traits** defined in [`ports`],
//! keeping protocol logic fully testable without real peripherals.

pub(crate) mod dispatch;
pub mod events;
pub mod ports;
