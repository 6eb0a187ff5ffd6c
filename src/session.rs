//! Connection sessions: login, tunnel, and the reconnect loop
//!
//! A session is one login followed by one tunnel run with the token it
//! produced. [`ReconnectLoop`] repeats sessions until the user stops it,
//! backing off between them based on how long the last one lasted.

use crate::config::ReconnectConfig;
use crate::login::{
    BrowserSettings, ChromePage, LoginCredentials, LoginError, LoginTarget, LoginTimings,
    PageError, SessionToken, obtain_session_token,
};
use crate::stop::StopFlag;
use std::io;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, warn};

/// The gateway's absolute session limit, shown in the banner
const SESSION_LIMIT_MINUTES: u64 = 240;

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("Tunnel I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("{0} not found (install it or set its path in the config file)")]
    ToolNotFound(String),
}

/// How a tunnel run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelExit {
    /// The tunnel process exited on its own
    Exited { code: Option<i32> },
    /// The user asked to stop and the tunnel was torn down
    Stopped,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Login failed: {0}")]
    Login(#[from] LoginError),
    #[error("Tunnel failed: {0}")]
    Tunnel(#[from] TunnelError),
}

/// Outcome of a single-session run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Disconnected { code: Option<i32> },
    Stopped,
}

/// Produces a fresh gateway session token
#[allow(async_fn_in_trait)]
pub trait Authenticator {
    async fn authenticate(&mut self, stop: &StopFlag) -> Result<SessionToken, LoginError>;
}

/// Runs the tunnel for one token until it exits or a stop is requested
///
/// The token is taken by value: it is good for exactly one launch.
#[allow(async_fn_in_trait)]
pub trait Tunnel {
    async fn run(&mut self, token: SessionToken, stop: &StopFlag) -> Result<TunnelExit, TunnelError>;
}

/// Browser-driven SSO login
pub struct BrowserAuthenticator {
    settings: BrowserSettings,
    target: LoginTarget,
    credentials: LoginCredentials,
    timings: LoginTimings,
}

impl BrowserAuthenticator {
    pub fn new(
        settings: BrowserSettings,
        target: LoginTarget,
        credentials: LoginCredentials,
        timings: LoginTimings,
    ) -> Self {
        Self {
            settings,
            target,
            credentials,
            timings,
        }
    }
}

impl Authenticator for BrowserAuthenticator {
    async fn authenticate(&mut self, stop: &StopFlag) -> Result<SessionToken, LoginError> {
        let settings = self.settings.clone();
        let target = self.target.clone();
        let credentials = self.credentials.clone();
        let timings = self.timings.clone();
        let stop = stop.clone();

        // The DevTools client is blocking; the browser closes when `page` drops
        tokio::task::spawn_blocking(move || {
            let mut page = ChromePage::launch(&settings)?;
            obtain_session_token(&mut page, &target, &credentials, &timings, &stop)
        })
        .await
        .map_err(|e| LoginError::Page(PageError::Browser(format!("login task failed: {}", e))))?
    }
}

/// Why a connection attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCause {
    LoginFailed,
    TunnelExited { code: Option<i32> },
    TunnelFailed,
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectionAttempt {
    pub started: Instant,
    pub ended: Instant,
    pub cause: ExitCause,
}

impl ConnectionAttempt {
    pub fn elapsed(&self) -> Duration {
        self.ended.saturating_duration_since(self.started)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Sessions shorter than this count as immediate failures
    pub short_session_threshold: Duration,
    pub long_backoff: Duration,
    pub short_backoff: Duration,
}

/// Which wait follows a finished attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Login failed or the session died almost at once
    Long,
    /// A normal session that the gateway ended
    Short,
}

impl Backoff {
    /// Line shown to the user before waiting `delay`
    pub fn notice(self, delay: Duration) -> String {
        match self {
            Backoff::Long => format!(
                "[!] Session too short. Waiting {}s before retry...",
                delay.as_secs()
            ),
            Backoff::Short => format!(
                "[*] Reconnecting in {}s... (Ctrl+C to stop)",
                delay.as_secs()
            ),
        }
    }
}

impl BackoffPolicy {
    pub fn decide(&self, attempt: &ConnectionAttempt) -> Backoff {
        if attempt.cause == ExitCause::LoginFailed
            || attempt.elapsed() < self.short_session_threshold
        {
            Backoff::Long
        } else {
            Backoff::Short
        }
    }

    pub fn delay(&self, backoff: Backoff) -> Duration {
        match backoff {
            Backoff::Long => self.long_backoff,
            Backoff::Short => self.short_backoff,
        }
    }

    pub fn delay_after(&self, attempt: &ConnectionAttempt) -> Duration {
        self.delay(self.decide(attempt))
    }
}

impl From<&ReconnectConfig> for BackoffPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            short_session_threshold: config.short_session(),
            long_backoff: config.long_backoff(),
            short_backoff: config.short_backoff(),
        }
    }
}

/// Run the tunnel with an already obtained token
pub async fn connect_with_token<T: Tunnel>(
    tunnel: &mut T,
    token: SessionToken,
    stop: &StopFlag,
) -> Result<Exit, SessionError> {
    if stop.is_stopped() {
        return Ok(Exit::Stopped);
    }

    match tunnel.run(token, stop).await? {
        TunnelExit::Stopped => Ok(Exit::Stopped),
        // Ctrl+C also reaches the tunnel process directly and may win the race
        TunnelExit::Exited { .. } if stop.is_stopped() => Ok(Exit::Stopped),
        TunnelExit::Exited { code } => {
            info!("Tunnel exited (code {:?})", code);
            Ok(Exit::Disconnected { code })
        }
    }
}

/// Log in once and run one tunnel session
pub async fn run_once<A: Authenticator, T: Tunnel>(
    auth: &mut A,
    tunnel: &mut T,
    stop: &StopFlag,
) -> Result<Exit, SessionError> {
    let token = match auth.authenticate(stop).await {
        Ok(token) => token,
        Err(_) if stop.is_stopped() => return Ok(Exit::Stopped),
        Err(e) => return Err(e.into()),
    };
    connect_with_token(tunnel, token, stop).await
}

/// Process exit status for a single-session run
pub fn exit_status(result: &Result<Exit, SessionError>) -> u8 {
    match result {
        Ok(_) => 0,
        Err(_) => 1,
    }
}

/// Keeps the VPN up across gateway session limits
pub struct ReconnectLoop<A, T> {
    auth: A,
    tunnel: T,
    policy: BackoffPolicy,
    sessions: u32,
}

impl<A: Authenticator, T: Tunnel> ReconnectLoop<A, T> {
    pub fn new(auth: A, tunnel: T, policy: BackoffPolicy) -> Self {
        Self {
            auth,
            tunnel,
            policy,
            sessions: 0,
        }
    }

    /// Number of sessions started so far
    pub fn sessions(&self) -> u32 {
        self.sessions
    }

    /// Run sessions until the user stops; there is no retry limit
    pub async fn run(&mut self, stop: &StopFlag) {
        while !stop.is_stopped() {
            self.sessions += 1;
            print_banner(self.sessions);

            let Some(attempt) = self.cycle(stop).await else {
                break;
            };

            let backoff = self.policy.decide(&attempt);
            let delay = self.policy.delay(backoff);
            println!(
                "\n[!] VPN disconnected after {:.1} minutes.",
                attempt.elapsed().as_secs_f64() / 60.0
            );
            println!("{}", backoff.notice(delay));

            if stop.sleep(delay).await.is_err() {
                break;
            }
        }
        info!("Stopped by user after {} session(s)", self.sessions);
    }

    /// One login plus tunnel run; `None` once the user has asked to stop
    async fn cycle(&mut self, stop: &StopFlag) -> Option<ConnectionAttempt> {
        let started = Instant::now();

        let cause = match self.auth.authenticate(stop).await {
            Ok(token) => match self.tunnel.run(token, stop).await {
                Ok(TunnelExit::Stopped) => return None,
                Ok(TunnelExit::Exited { code }) => ExitCause::TunnelExited { code },
                Err(e) => {
                    warn!("Tunnel failed: {}", e);
                    ExitCause::TunnelFailed
                }
            },
            Err(LoginError::Stopped) => return None,
            Err(e) => {
                if !stop.is_stopped() {
                    error!("Could not obtain session cookie: {}", e);
                }
                ExitCause::LoginFailed
            }
        };

        if stop.is_stopped() {
            return None;
        }

        Some(ConnectionAttempt {
            started,
            ended: Instant::now(),
            cause,
        })
    }
}

fn print_banner(session: u32) {
    println!("\n{}", "=".repeat(50));
    println!(
        "[*] VPN session #{} starting at {}",
        session,
        chrono::Local::now().format("%H:%M:%S")
    );
    println!(
        "[*] Session will expire in ~4 hours ({} min)",
        SESSION_LIMIT_MINUTES
    );
    println!("{}\n", "=".repeat(50));
}
