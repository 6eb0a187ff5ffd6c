//! Local credential bundle
//!
//! Identity, password, TOTP seed and the local sudo password live in one JSON
//! file under the per-user config directory. The file is replaced atomically
//! and readable by the owner only.

use crate::totp::{Totp, TotpError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info};

const CREDENTIALS_FILENAME: &str = "credentials.json";

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("Could not determine config directory")]
    NoConfigDir,
    #[error("Credential file I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("Credential file is malformed: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("No TOTP seed entered")]
    MissingSeed,
    #[error("TOTP seed rejected: {0}")]
    InvalidSeed(#[from] TotpError),
    #[error("No password entered")]
    MissingPassword,
}

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialBundle {
    #[serde(rename = "user")]
    pub identity: String,
    pub password: String,
    #[serde(rename = "totp_secret")]
    pub totp_seed: String,
    /// Local sudo password, fed to the elevation prompt
    #[serde(rename = "sudo_password", default)]
    pub elevation_secret: String,
}

impl CredentialBundle {
    /// Password and seed present; enough to log in without prompting
    pub fn is_complete(&self) -> bool {
        !self.password.is_empty() && !self.totp_seed.is_empty()
    }
}

impl std::fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialBundle")
            .field("identity", &self.identity)
            .field("password", &"<redacted>")
            .field("totp_seed", &"<redacted>")
            .field("elevation_secret", &"<redacted>")
            .finish()
    }
}

pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    /// Store at `<config_dir>/hkust-vpn/credentials.json`
    pub fn default_location() -> Result<Self, CredentialError> {
        let dir = crate::config::app_dir().ok_or(CredentialError::NoConfigDir)?;
        Ok(Self::at(dir.join(CREDENTIALS_FILENAME)))
    }

    pub fn at(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<CredentialBundle>, CredentialError> {
        if !self.path.exists() {
            debug!("Credentials file does not exist: {:?}", self.path);
            return Ok(None);
        }

        let content = fs::read_to_string(&self.path)?;
        let bundle: CredentialBundle = serde_json::from_str(&content)?;
        debug!("Loaded credentials for {}", bundle.identity);
        Ok(Some(bundle))
    }

    /// Write the bundle via a temp file and rename, mode 0600
    pub fn save(&self, bundle: &CredentialBundle) -> Result<(), CredentialError> {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent)?;

        let content = serde_json::to_string_pretty(bundle)?;

        // Created exclusively with a random name and mode 0600
        let mut staged = NamedTempFile::new_in(parent)?;
        staged.write_all(content.as_bytes())?;
        staged.as_file().sync_all()?;

        staged.persist(&self.path).map_err(|e| e.error)?;
        info!("Credentials saved to {:?}", self.path);
        Ok(())
    }
}

/// Source of interactive answers during setup
pub trait Prompter {
    /// Prompt without echo
    fn secret(&mut self, prompt: &str) -> io::Result<String>;
    /// Prompt with echo
    fn line(&mut self, prompt: &str) -> io::Result<String>;
}

/// Reads from the controlling terminal
pub struct TerminalPrompter;

impl Prompter for TerminalPrompter {
    fn secret(&mut self, prompt: &str) -> io::Result<String> {
        rpassword::prompt_password(prompt)
    }

    fn line(&mut self, prompt: &str) -> io::Result<String> {
        print!("{}", prompt);
        io::stdout().flush()?;
        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        Ok(input.trim().to_string())
    }
}

/// Interactive first-run setup
///
/// Collects password, TOTP seed and sudo password, proves the seed by
/// generating one code, then persists the bundle. Nothing is written when
/// the seed is missing or malformed.
pub fn setup(
    store: &CredentialStore,
    identity: &str,
    prompter: &mut dyn Prompter,
) -> Result<CredentialBundle, CredentialError> {
    println!("First-time setup: enter your credentials.");

    let password = prompter.secret(&format!("Password for {}: ", identity))?;
    if password.is_empty() {
        return Err(CredentialError::MissingPassword);
    }

    let totp_seed = prompter.line("TOTP secret key (Base32): ")?.trim().to_string();
    if totp_seed.is_empty() {
        return Err(CredentialError::MissingSeed);
    }

    let elevation_secret = prompter.secret("sudo password (local machine): ")?;

    let code = Totp::from_seed(&totp_seed)?.code_now()?;
    println!("TOTP test: current code = {} (looks good)", code);

    let bundle = CredentialBundle {
        identity: identity.to_string(),
        password,
        totp_seed,
        elevation_secret,
    };
    store.save(&bundle)?;
    Ok(bundle)
}
