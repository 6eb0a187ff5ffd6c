//! OpenConnect integration
//!
//! The tunnel itself is openconnect's job; this module builds its command
//! line and supervises the process for one session:
//!
//! ```bash
//! sudo -S -p '' openconnect --protocol=nc https://remote.ust.hk/mfa \
//!   --cookie=DSID=<token> -s 'vpn-slice superpod.ust.hk' [--proxy <url>]
//! ```
//!
//! vpn-slice, run by openconnect as its connect script, sets up the split
//! tunnel for the listed hosts.

pub mod command;
pub mod supervisor;

pub use command::{TunnelCommand, locate_tool};
pub use supervisor::{DnsFixSettings, OpenConnectTunnel};
