//! HKUST VPN - automated SSO login and split-tunnel session keeper
//!
//! Logs in to the HKUST VPN portal through a real browser (password plus
//! TOTP second factor), hands the resulting session cookie to OpenConnect
//! with vpn-slice for split tunneling, and reconnects whenever the gateway
//! ends the session.
//!
//! # Architecture
//!
//! - `config`: Configuration file handling (TOML)
//! - `credentials`: Stored login secrets and first-run setup
//! - `totp`: One-time codes for the MFA step
//! - `login`: SSO page state machine and the Chromium backend
//! - `openconnect`: OpenConnect command line and process supervision
//! - `vpn`: Post-connect DNS, hosts file and route fix-up
//! - `platform`: Privileged commands and per-OS routing
//! - `session`: One-shot and reconnect-loop runners
//! - `stop`: Ctrl+C as a cooperative stop signal
//!
//! # Usage
//!
//! ```bash
//! hkust-vpn                          # log in and keep reconnecting
//! hkust-vpn --hosts a.ust.hk b.ust.hk
//! hkust-vpn --cookie <DSID>          # skip the browser login
//! ```

pub mod config;
pub mod credentials;
pub mod login;
pub mod openconnect;
pub mod platform;
pub mod session;
pub mod stop;
pub mod totp;
pub mod vpn;

pub use config::Config;
pub use credentials::{CredentialBundle, CredentialStore};
pub use session::{Exit, ReconnectLoop};
pub use stop::StopFlag;
