//! Integration test driver for `tests/integration/` submodule.
//!
//! Each `mod` below maps to a file that exercises one engine against
//! scripted peers.  All tests run on the host with no radio required.

mod client_flow_tests;
mod mock_ports;
mod server_flow_tests;
