// SPDX-License-Identifier: MIT OR Apache-2.0

//! File and environment configuration for resilient clients.
//!
//! A YAML file holds one profile per downstream service plus the name of
//! the active one. Profiles convert into [`crate::client::ClientConfig`].
//!
//! # Environment Variables
//!
//! The following environment variables are supported:
//!
//! - `RESILIENT_API_CONFIG` - Path to the config file
//!   (default: `<config dir>/resilient-api/config.yaml`)
//! - `RESILIENT_API_SERVICE` - Override the active profile
//! - `RESILIENT_API_BASE_URL` - Override the active profile's base URL
//!
//! # Example
//!
//! ```no_run
//! use resilient_api_rs::client::ResilientClient;
//! use resilient_api_rs::config::ServiceConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ServiceConfig::load_with_env()?;
//!
//! if let Some(profile) = config.active_profile() {
//!     let client = ResilientClient::new(profile.to_client_config())?;
//!     println!("Calling {}", client.config().base_url);
//! }
//! # Ok(())
//! # }
//! ```

mod service;

pub use service::{
    BreakerProfile, ServiceConfig, ServiceProfile, ENV_BASE_URL, ENV_CONFIG_PATH, ENV_SERVICE,
};
