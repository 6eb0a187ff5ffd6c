//! openconnect child process supervision
//!
//! One [`OpenConnectTunnel::run`] call is one tunnel session: spawn
//! openconnect with the session cookie, feed sudo its password, start the
//! DNS fix-up thread, then wait for the process to exit or for a stop.

use super::command::TunnelCommand;
use crate::config::DnsConfig;
use crate::login::SessionToken;
use crate::platform::{Privileged, get_routing_manager};
use crate::session::{Tunnel, TunnelError, TunnelExit};
use crate::stop::StopFlag;
use crate::vpn::{DnsFixReport, DnsResolver, HostsManager, Reconciler, RetryPolicy};
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

/// How long openconnect gets to log off after SIGTERM
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct DnsFixSettings {
    pub server: SocketAddr,
    pub interface: String,
    pub query_timeout: Duration,
    pub policy: RetryPolicy,
}

impl DnsFixSettings {
    /// `None` when the fix-up is disabled or the resolver address is unusable
    pub fn from_config(config: &DnsConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }

        let server = match config.server.parse::<SocketAddr>() {
            Ok(addr) => addr,
            Err(_) => match config.server.parse::<IpAddr>() {
                Ok(ip) => SocketAddr::new(ip, 53),
                Err(_) => {
                    warn!("Ignoring invalid DNS server {:?}; DNS fix disabled", config.server);
                    return None;
                }
            },
        };

        Some(Self {
            server,
            interface: config.interface.clone(),
            query_timeout: Duration::from_secs(config.timeout_secs),
            policy: RetryPolicy {
                attempts: config.attempts,
                interval: Duration::from_secs(config.interval_secs),
            },
        })
    }
}

pub struct OpenConnectTunnel {
    command: TunnelCommand,
    privileged: Privileged,
    dns_fix: Option<DnsFixSettings>,
}

impl OpenConnectTunnel {
    pub fn new(command: TunnelCommand, privileged: Privileged, dns_fix: Option<DnsFixSettings>) -> Self {
        Self {
            command,
            privileged,
            dns_fix,
        }
    }

    async fn spawn_child(&self, token: &SessionToken) -> Result<Child, TunnelError> {
        let program = self.command.program();
        let (exe, args) = self.privileged.wrap(&program, &self.command.args(token));
        debug!("Launching {} (cookie {})", program, token.preview());

        let secret = self.privileged.stdin_line();
        let stdin = if secret.is_some() {
            Stdio::piped()
        } else {
            Stdio::inherit()
        };

        let mut child = Command::new(&exe)
            .args(&args)
            .stdin(stdin)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TunnelError::Spawn {
                program: exe.clone(),
                source,
            })?;

        // Written once; closing stdin afterwards makes a wrong secret fail fast
        if let (Some(line), Some(mut pipe)) = (secret, child.stdin.take()) {
            pipe.write_all(line.as_bytes()).await?;
            pipe.flush().await?;
        }

        Ok(child)
    }

    fn start_dns_fix(&self, fix: &DnsFixSettings, reports: UnboundedSender<DnsFixReport>, cancel: StopFlag) {
        let routes = match get_routing_manager(self.privileged.clone()) {
            Ok(routes) => routes,
            Err(e) => {
                warn!("DNS fix unavailable: {}", e);
                return;
            }
        };

        let reconciler = Reconciler::new(
            DnsResolver::new(fix.server, fix.query_timeout),
            HostsManager::new(self.privileged.clone()),
            routes,
            fix.interface.clone(),
            fix.policy,
        );
        if let Err(e) = reconciler.spawn(self.command.hosts.clone(), reports, cancel) {
            warn!("Could not start DNS fix thread: {}", e);
        }
    }

    async fn supervise(
        child: &mut Child,
        reports: &mut UnboundedReceiver<DnsFixReport>,
        stop: &StopFlag,
    ) -> Result<TunnelExit, TunnelError> {
        loop {
            tokio::select! {
                status = child.wait() => {
                    let status = status?;
                    info!("openconnect exited: {}", status);
                    return Ok(TunnelExit::Exited { code: status.code() });
                }
                _ = stop.stopped() => {
                    info!("Stopping tunnel");
                    shutdown(child).await;
                    return Ok(TunnelExit::Stopped);
                }
                Some(report) = reports.recv() => log_report(&report),
            }
        }
    }
}

impl Tunnel for OpenConnectTunnel {
    async fn run(&mut self, token: SessionToken, stop: &StopFlag) -> Result<TunnelExit, TunnelError> {
        println!(
            "[*] Connecting VPN (split tunnel: {})",
            self.command.hosts.join(", ")
        );

        let mut child = self.spawn_child(&token).await?;
        drop(token);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel_fix = StopFlag::new();
        match &self.dns_fix {
            Some(fix) => self.start_dns_fix(fix, tx, cancel_fix.clone()),
            None => drop(tx),
        }

        let exit = Self::supervise(&mut child, &mut rx, stop).await;
        // The fix-up belongs to this tunnel only
        cancel_fix.trigger();
        exit
    }
}

fn log_report(report: &DnsFixReport) {
    match report {
        DnsFixReport::Fixed { host, ip } => info!("DNS fix: {} -> {} via tunnel", host, ip),
        DnsFixReport::ApplyFailed { host, ip, error } => {
            warn!("DNS fix: resolved {} -> {} but could not apply: {}", host, ip, error)
        }
        DnsFixReport::GaveUp { unresolved } => {
            warn!("DNS fix: gave up resolving {}", unresolved.join(", "))
        }
    }
}

/// Ask the process to exit, then kill it if it lingers
async fn shutdown(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;
        // sudo relays SIGTERM to openconnect, which then logs off the session
        if let Some(pid) = child.id() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    let _ = child.start_kill();

    match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
        Ok(_) => debug!("Tunnel process reaped"),
        Err(_) => {
            warn!("Tunnel did not exit within {:?}, killing it", SHUTDOWN_GRACE);
            let _ = child.start_kill();
            let _ = tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_dns_fix_settings_from_defaults() {
        let settings = DnsFixSettings::from_config(&DnsConfig::default()).unwrap();
        assert_eq!(settings.server, "143.89.14.7:53".parse().unwrap());
        assert_eq!(settings.interface, "tun0");
        assert_eq!(settings.policy.attempts, 20);
        assert_eq!(settings.policy.interval, Duration::from_secs(3));
    }

    #[test]
    fn test_dns_fix_settings_disabled_or_invalid() {
        let disabled = DnsConfig {
            enabled: false,
            ..DnsConfig::default()
        };
        assert!(DnsFixSettings::from_config(&disabled).is_none());

        let invalid = DnsConfig {
            server: "not-an-address".to_string(),
            ..DnsConfig::default()
        };
        assert!(DnsFixSettings::from_config(&invalid).is_none());

        let with_port = DnsConfig {
            server: "10.0.0.53:5353".to_string(),
            ..DnsConfig::default()
        };
        assert_eq!(
            DnsFixSettings::from_config(&with_port).unwrap().server,
            "10.0.0.53:5353".parse().unwrap()
        );
    }

    #[cfg(unix)]
    fn fake_openconnect(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.path().join("openconnect");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    fn tunnel_with(openconnect: PathBuf) -> OpenConnectTunnel {
        let command = TunnelCommand {
            openconnect,
            vpn_slice: PathBuf::from("vpn-slice"),
            protocol: "nc".to_string(),
            url: "https://vpn.example.com".to_string(),
            cookie_name: "DSID".to_string(),
            hosts: vec!["a.example.com".to_string()],
            proxy: None,
        };
        OpenConnectTunnel::new(command, Privileged::direct(), None)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_code_is_reported() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut tunnel = tunnel_with(fake_openconnect(&dir, "exit 3"));

        let exit = tunnel
            .run(SessionToken::new("tok"), &StopFlag::new())
            .await
            .unwrap();

        assert_eq!(exit, TunnelExit::Exited { code: Some(3) });
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_terminates_child() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut tunnel = tunnel_with(fake_openconnect(&dir, "exec sleep 30"));
        let stop = StopFlag::new();

        let trigger = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.trigger();
        });

        let started = std::time::Instant::now();
        let exit = tunnel.run(SessionToken::new("tok"), &stop).await.unwrap();

        assert_eq!(exit, TunnelExit::Stopped);
        assert!(started.elapsed() < SHUTDOWN_GRACE);
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let command = TunnelCommand {
            openconnect: PathBuf::from("/nonexistent/openconnect"),
            vpn_slice: PathBuf::from("vpn-slice"),
            protocol: "nc".to_string(),
            url: "https://vpn.example.com".to_string(),
            cookie_name: "DSID".to_string(),
            hosts: vec![],
            proxy: None,
        };
        let mut tunnel = OpenConnectTunnel::new(command, Privileged::direct(), None);

        let result = tunnel.run(SessionToken::new("tok"), &StopFlag::new()).await;
        assert!(matches!(result, Err(TunnelError::Spawn { .. })));
    }
}
