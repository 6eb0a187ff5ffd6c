use clap::{Parser, Subcommand};
use hkust_vpn::config::{self, Config};
use hkust_vpn::credentials::{self, CredentialBundle, CredentialStore, Prompter, TerminalPrompter};
use hkust_vpn::login::{BrowserSettings, LoginCredentials, LoginTarget, LoginTimings, SessionToken};
use hkust_vpn::openconnect::{DnsFixSettings, OpenConnectTunnel, TunnelCommand, locate_tool};
use hkust_vpn::platform::{Privileged, is_root};
use hkust_vpn::session::{
    self, BackoffPolicy, BrowserAuthenticator, Exit, ReconnectLoop, TunnelError,
};
use hkust_vpn::stop::StopFlag;
use hkust_vpn::totp::Totp;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "hkust-vpn")]
#[command(about = "Automated HKUST VPN login with split tunneling and auto-reconnect")]
#[command(version)]
#[command(after_help = "Examples:
  hkust-vpn                             Connect with auto-reconnect (default)
  hkust-vpn --headless                  No browser window
  hkust-vpn --no-reconnect              Single session, no auto-reconnect
  hkust-vpn --hosts a.ust.hk b.ust.hk   Multiple hosts through VPN
  hkust-vpn --setup                     Re-enter credentials
  hkust-vpn --cookie DSID_VALUE         Skip login, use cookie directly")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Login identity, e.g. someone@connect.ust.hk
    #[arg(short, long)]
    user: Option<String>,

    /// HTTP proxy for the browser and openconnect
    #[arg(long, conflicts_with = "no_proxy")]
    proxy: Option<String>,

    /// Connect without any proxy, even if one is configured
    #[arg(long)]
    no_proxy: bool,

    /// Hosts to route through the VPN
    #[arg(long, num_args = 1..)]
    hosts: Vec<String>,

    /// Skip login and use this session cookie
    #[arg(long)]
    cookie: Option<String>,

    /// Re-enter stored credentials
    #[arg(long)]
    setup: bool,

    /// Run the login browser without a window
    #[arg(long)]
    headless: bool,

    /// Single session, no auto-reconnect
    #[arg(long)]
    no_reconnect: bool,

    /// Config file (default: <config dir>/hkust-vpn/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate default config file
    Init,
}

type BoxError = Box<dyn std::error::Error>;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Logs go to stderr so they never interleave with openconnect's stdout
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set up logging: {}", e);
    }

    let stop = StopFlag::new();
    let handler_stop = stop.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        if handler_stop.trigger() {
            eprintln!("\n[*] Stopping... (Ctrl+C again to force quit)");
        } else {
            std::process::exit(130);
        }
    }) {
        error!("Failed to install Ctrl+C handler: {}", e);
    }

    match run(cli, &stop).await {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, stop: &StopFlag) -> Result<ExitCode, BoxError> {
    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => config::default_config_path().ok_or("Could not determine config directory")?,
    };

    if let Some(Commands::Init) = cli.command {
        info!("Generating default config...");
        Config::default().save(&config_path)?;
        println!("Created default config: {}", config_path.display());
        return Ok(ExitCode::SUCCESS);
    }

    let config = Config::load_or_default(&config_path)?;

    let proxy = config::resolve_proxy(cli.proxy.as_deref(), cli.no_proxy, &config.vpn);
    let hosts = config::resolve_hosts(&cli.hosts, &config.vpn)?;

    let store = CredentialStore::default_location()?;
    let mut prompter = TerminalPrompter;

    if let Some(cookie) = &cli.cookie {
        // Only the sudo password is needed when the cookie is supplied
        let stored = store.load()?.unwrap_or_default();
        let privileged = Privileged::new(Some(elevation_secret(&stored, &mut prompter)?));
        let mut tunnel = OpenConnectTunnel::new(
            tunnel_command(&config, hosts, proxy)?,
            privileged,
            DnsFixSettings::from_config(&config.dns),
        );
        let result =
            session::connect_with_token(&mut tunnel, SessionToken::new(cookie.trim()), stop).await;
        return Ok(finish(result));
    }

    let bundle = load_or_setup(&cli, &config, &store, &mut prompter)?;
    let totp = Totp::from_seed(&bundle.totp_seed).map_err(credentials::CredentialError::from)?;
    let privileged = Privileged::new(Some(elevation_secret(&bundle, &mut prompter)?));
    // Located only now, so --setup works before the tools are installed
    let command = tunnel_command(&config, hosts, proxy.clone())?;

    let mut authenticator = BrowserAuthenticator::new(
        BrowserSettings {
            headless: cli.headless || config.browser.headless,
            proxy,
            user_agent: config.browser.user_agent.clone(),
        },
        LoginTarget {
            url: config.vpn.url.clone(),
            cookie_name: config.vpn.cookie_name.clone(),
        },
        LoginCredentials {
            identity: bundle.identity.clone(),
            password: bundle.password.clone(),
            totp,
        },
        LoginTimings::default(),
    );
    let mut tunnel = OpenConnectTunnel::new(
        command,
        privileged,
        DnsFixSettings::from_config(&config.dns),
    );

    if cli.no_reconnect {
        let result = session::run_once(&mut authenticator, &mut tunnel, stop).await;
        return Ok(finish(result));
    }

    let mut reconnect = ReconnectLoop::new(
        authenticator,
        tunnel,
        BackoffPolicy::from(&config.reconnect),
    );
    reconnect.run(stop).await;
    println!("\n[*] User interrupted. Exiting.");
    Ok(ExitCode::SUCCESS)
}

fn tunnel_command(
    config: &Config,
    hosts: Vec<String>,
    proxy: Option<String>,
) -> Result<TunnelCommand, TunnelError> {
    Ok(TunnelCommand {
        openconnect: locate_tool(&config.vpn.openconnect)
            .ok_or_else(|| TunnelError::ToolNotFound(config.vpn.openconnect.clone()))?,
        vpn_slice: locate_tool(&config.vpn.vpn_slice)
            .ok_or_else(|| TunnelError::ToolNotFound(config.vpn.vpn_slice.clone()))?,
        protocol: config.vpn.protocol.clone(),
        url: config.vpn.url.clone(),
        cookie_name: config.vpn.cookie_name.clone(),
        hosts,
        proxy,
    })
}

/// Report a single-session outcome and turn it into the exit status
fn finish(result: Result<Exit, session::SessionError>) -> ExitCode {
    match &result {
        Ok(Exit::Stopped) => println!("\n[*] VPN disconnected."),
        Ok(Exit::Disconnected { code }) => info!("VPN session ended (code {:?})", code),
        Err(e) => error!("{}", e),
    }
    ExitCode::from(session::exit_status(&result))
}

/// Stored credentials, running setup when asked or when they are incomplete
fn load_or_setup(
    cli: &Cli,
    config: &Config,
    store: &CredentialStore,
    prompter: &mut dyn Prompter,
) -> Result<CredentialBundle, BoxError> {
    let stored = store.load()?;

    if !cli.setup {
        if let Some(mut bundle) = stored.clone().filter(CredentialBundle::is_complete) {
            if let Some(user) = &cli.user {
                bundle.identity = user.clone();
            }
            return Ok(bundle);
        }
    }

    let identity = match config::resolve_identity(
        cli.user.as_deref(),
        stored.as_ref().map(|b| b.identity.as_str()),
        &config.vpn,
    ) {
        Some(identity) => identity,
        None => prompter.line("HKUST login (e.g. someone@connect.ust.hk): ")?,
    };

    Ok(credentials::setup(store, &identity, prompter)?)
}

/// The stored sudo password, or one prompted for this run only
fn elevation_secret(bundle: &CredentialBundle, prompter: &mut dyn Prompter) -> Result<String, BoxError> {
    if !bundle.elevation_secret.is_empty() || is_root() {
        return Ok(bundle.elevation_secret.clone());
    }
    Ok(prompter.secret("sudo password: ")?)
}
