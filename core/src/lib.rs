// Mockall triggers this warning for every mocked trait. This is fixed in Mockall master but not
// released.
#![cfg_attr(test, allow(clippy::unused_unit))]

#[macro_use]
pub mod macros;

pub mod benchmark;
pub mod config;
pub mod cost_tracker;
pub mod destroyer;
pub mod error;
pub mod http;
pub mod http_server;
pub mod inventory;
pub mod keys;
pub mod lifecycle;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod provider;
pub mod provisioner;
pub mod store;
pub mod util;
pub mod verifier;

#[cfg(any(test, feature = "test-util"))]
pub mod testutil;
