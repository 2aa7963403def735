//! Client for the subset of the TrueNAS REST API used by the CSI driver.
//!
//! [`NasApi`] is the seam the driver programs against. [`HttpNasClient`]
//! talks to a real NAS; `memory::MemoryNas` (behind the `test-util`
//! feature) keeps everything in process for tests.

pub mod client;
pub mod error;
pub mod http;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod models;

pub use client::NasApi;
pub use error::{NasError, Result};
pub use http::{Credentials, HttpNasClient};
