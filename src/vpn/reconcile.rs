//! Post-connect DNS and route fix-up
//!
//! A local proxy can intercept DNS while the tunnel comes up and hand back
//! public addresses for VPN-only names. The reconciler resolves each host
//! against the VPN-side resolver directly, pins the answer in the hosts file
//! and routes it through the tunnel interface.
//!
//! It runs on its own thread and only ever talks back through a one-way
//! report channel; nothing it does can fail the tunnel.

use crate::platform::RoutingManager;
use crate::stop::StopFlag;
use crate::vpn::dns::DnsResolver;
use crate::vpn::hosts::HostsManager;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

/// Bounded retry over the whole host list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

/// Outcome notices sent back to the tunnel supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsFixReport {
    Fixed { host: String, ip: Ipv4Addr },
    /// Resolved, but the hosts file or route could not be updated.
    /// The host stays pending for the next round.
    ApplyFailed { host: String, ip: Ipv4Addr, error: String },
    GaveUp { unresolved: Vec<String> },
}

pub struct Reconciler {
    resolver: DnsResolver,
    hosts: HostsManager,
    routes: Box<dyn RoutingManager>,
    interface: String,
    policy: RetryPolicy,
}

impl Reconciler {
    pub fn new(
        resolver: DnsResolver,
        hosts: HostsManager,
        routes: Box<dyn RoutingManager>,
        interface: String,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            resolver,
            hosts,
            routes,
            interface,
            policy,
        }
    }

    /// Start on a detached thread. `cancel` ends the retry loop early, e.g.
    /// once the tunnel it was fixing has gone away.
    pub fn spawn(
        self,
        hosts: Vec<String>,
        reports: UnboundedSender<DnsFixReport>,
        cancel: StopFlag,
    ) -> io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("dns-fix".to_string())
            .spawn(move || self.run(hosts, &reports, &cancel))
    }

    /// Resolve and apply every host, retrying the pending ones each round
    ///
    /// Each round waits one interval first so the tunnel interface has a
    /// chance to come up.
    pub fn run(self, hosts: Vec<String>, reports: &UnboundedSender<DnsFixReport>, cancel: &StopFlag) {
        let mut pending = hosts;

        for round in 1..=self.policy.attempts {
            if pending.is_empty() || cancel.sleep_blocking(self.policy.interval).is_err() {
                return;
            }
            debug!("DNS fix round {}/{}: {:?}", round, self.policy.attempts, pending);

            pending.retain(|host| {
                let ip = match self.resolver.resolve(host) {
                    Ok(ip) => ip,
                    Err(e) => {
                        debug!("DNS fix: {} not resolved yet: {}", host, e);
                        return true;
                    }
                };

                // Reports are fire-and-forget; the receiver may be gone
                match self.apply(host, ip) {
                    Ok(()) => {
                        let _ = reports.send(DnsFixReport::Fixed {
                            host: host.clone(),
                            ip,
                        });
                        false
                    }
                    Err(error) => {
                        let _ = reports.send(DnsFixReport::ApplyFailed {
                            host: host.clone(),
                            ip,
                            error,
                        });
                        true
                    }
                }
            });
        }

        if !pending.is_empty() {
            warn!("DNS fix gave up on {:?}", pending);
            let _ = reports.send(DnsFixReport::GaveUp { unresolved: pending });
        }
    }

    fn apply(&self, host: &str, ip: Ipv4Addr) -> Result<(), String> {
        self.hosts
            .upsert_entry(host, IpAddr::V4(ip))
            .map_err(|e| e.to_string())?;
        self.routes
            .replace_route(&ip.to_string(), &self.interface)
            .map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::PlatformError;
    use crate::vpn::dns::build_query;
    use std::fs;
    use std::net::{SocketAddr, UdpSocket};
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    #[derive(Clone, Default)]
    struct RecordingRoutes {
        calls: Arc<Mutex<Vec<(String, String)>>>,
        fail: bool,
    }

    impl RoutingManager for RecordingRoutes {
        fn replace_route(&self, destination: &str, interface: &str) -> Result<(), PlatformError> {
            if self.fail {
                return Err(PlatformError::RouteError("no such device".to_string()));
            }
            self.calls
                .lock()
                .unwrap()
                .push((destination.to_string(), interface.to_string()));
            Ok(())
        }
    }

    /// Loopback resolver: answers known names with an A record and anything
    /// else with NXDOMAIN, until the socket is idle for a second
    fn spawn_responder(table: Vec<(&'static str, [u8; 4])>) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(1)))
            .unwrap();
        let addr = socket.local_addr().unwrap();

        std::thread::spawn(move || {
            let mut buf = [0u8; 512];
            while let Ok((len, peer)) = socket.recv_from(&mut buf) {
                let id = u16::from_be_bytes([buf[0], buf[1]]);
                let mut response = buf[..len].to_vec();
                response[2] = 0x81;

                let answer = table
                    .iter()
                    .find(|(name, _)| build_query(id, name).unwrap() == buf[..len]);
                match answer {
                    Some((_, ip)) => {
                        response[3] = 0x80;
                        response[7] = 1;
                        response.extend_from_slice(&[0xC0, 0x0C, 0, 1, 0, 1, 0, 0, 0, 60, 0, 4]);
                        response.extend_from_slice(ip);
                    }
                    None => response[3] = 0x83,
                }
                let _ = socket.send_to(&response, peer);
            }
        });

        addr
    }

    fn reconciler(
        dns: SocketAddr,
        hosts_path: &std::path::Path,
        routes: RecordingRoutes,
        attempts: u32,
    ) -> Reconciler {
        Reconciler::new(
            DnsResolver::new(dns, Duration::from_millis(300)),
            HostsManager::with_path(hosts_path.to_path_buf()),
            Box::new(routes),
            "tun0".to_string(),
            RetryPolicy {
                attempts,
                interval: Duration::from_millis(10),
            },
        )
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<DnsFixReport>) -> Vec<DnsFixReport> {
        let mut reports = Vec::new();
        while let Ok(report) = rx.try_recv() {
            reports.push(report);
        }
        reports
    }

    #[test]
    fn test_resolved_host_is_pinned_and_routed() {
        let temp_dir = TempDir::new().unwrap();
        let hosts_path = temp_dir.path().join("hosts");
        fs::write(&hosts_path, "127.0.0.1\tlocalhost\n").unwrap();

        let dns = spawn_responder(vec![("superpod.ust.hk", [10, 120, 0, 5])]);
        let routes = RecordingRoutes::default();
        let (tx, mut rx) = mpsc::unbounded_channel();

        reconciler(dns, &hosts_path, routes.clone(), 3).run(
            vec!["superpod.ust.hk".to_string()],
            &tx,
            &StopFlag::new(),
        );

        assert_eq!(drain(&mut rx), vec![DnsFixReport::Fixed {
            host: "superpod.ust.hk".to_string(),
            ip: Ipv4Addr::new(10, 120, 0, 5),
        }]);
        assert_eq!(
            *routes.calls.lock().unwrap(),
            vec![("10.120.0.5".to_string(), "tun0".to_string())]
        );
        let content = fs::read_to_string(&hosts_path).unwrap();
        assert!(content.contains("10.120.0.5\tsuperpod.ust.hk\t# hkust-vpn"));
    }

    #[test]
    fn test_gives_up_after_bounded_rounds() {
        let temp_dir = TempDir::new().unwrap();
        let hosts_path = temp_dir.path().join("hosts");
        fs::write(&hosts_path, "").unwrap();

        let dns = spawn_responder(vec![("known.ust.hk", [10, 0, 0, 1])]);
        let routes = RecordingRoutes::default();
        let (tx, mut rx) = mpsc::unbounded_channel();

        reconciler(dns, &hosts_path, routes.clone(), 2).run(
            vec!["known.ust.hk".to_string(), "missing.ust.hk".to_string()],
            &tx,
            &StopFlag::new(),
        );

        let reports = drain(&mut rx);
        assert_eq!(reports.len(), 2);
        assert!(matches!(&reports[0], DnsFixReport::Fixed { host, .. } if host == "known.ust.hk"));
        assert_eq!(reports[1], DnsFixReport::GaveUp {
            unresolved: vec!["missing.ust.hk".to_string()],
        });
        assert_eq!(routes.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_apply_failure_keeps_host_pending() {
        let temp_dir = TempDir::new().unwrap();
        let hosts_path = temp_dir.path().join("hosts");
        fs::write(&hosts_path, "").unwrap();

        let dns = spawn_responder(vec![("a.ust.hk", [10, 0, 0, 2])]);
        let routes = RecordingRoutes {
            fail: true,
            ..Default::default()
        };
        let (tx, mut rx) = mpsc::unbounded_channel();

        reconciler(dns, &hosts_path, routes, 2).run(
            vec!["a.ust.hk".to_string()],
            &tx,
            &StopFlag::new(),
        );

        let reports = drain(&mut rx);
        assert_eq!(reports.len(), 3);
        assert!(matches!(&reports[0], DnsFixReport::ApplyFailed { host, .. } if host == "a.ust.hk"));
        assert!(matches!(&reports[1], DnsFixReport::ApplyFailed { .. }));
        assert!(matches!(&reports[2], DnsFixReport::GaveUp { unresolved } if unresolved.len() == 1));
    }

    #[test]
    fn test_cancel_ends_quietly() {
        let temp_dir = TempDir::new().unwrap();
        let hosts_path = temp_dir.path().join("hosts");
        let cancel = StopFlag::new();
        cancel.trigger();

        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        reconciler(silent.local_addr().unwrap(), &hosts_path, RecordingRoutes::default(), 5)
            .run(vec!["a.ust.hk".to_string()], &tx, &cancel);

        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_closed_channel_does_not_panic() {
        let temp_dir = TempDir::new().unwrap();
        let hosts_path = temp_dir.path().join("hosts");
        fs::write(&hosts_path, "").unwrap();

        let dns = spawn_responder(vec![("a.ust.hk", [10, 0, 0, 3])]);
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);

        let handle = reconciler(dns, &hosts_path, RecordingRoutes::default(), 1)
            .spawn(vec!["a.ust.hk".to_string()], tx, StopFlag::new())
            .unwrap();
        handle.join().unwrap();
    }
}
