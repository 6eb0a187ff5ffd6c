//! Split-tunnel fix-ups: direct DNS, hosts file pinning, tunnel routes

pub mod dns;
pub mod hosts;
pub mod reconcile;

pub use dns::{DnsError, DnsResolver};
pub use hosts::{HostsError, HostsManager};
pub use reconcile::{DnsFixReport, Reconciler, RetryPolicy};
