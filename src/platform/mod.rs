//! Platform-specific implementations

#[cfg(target_os = "macos")]
pub mod mac;

#[cfg(target_os = "linux")]
pub mod linux;

use std::io::Write;
use std::process::{Command, Output, Stdio};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("Failed to replace route: {0}")]
    RouteError(String),
    #[error("Failed to run {program}: {message}")]
    CommandError { program: String, message: String },
    #[error("Unsupported platform")]
    UnsupportedPlatform,
}

/// Platform-agnostic routing interface
pub trait RoutingManager: Send {
    /// Route `destination` (a single host) through `interface`, replacing
    /// any existing route for it
    fn replace_route(&self, destination: &str, interface: &str) -> Result<(), PlatformError>;
}

/// Runs commands as root, through `sudo -S` unless already root
///
/// The elevation secret is written to the command's stdin for sudo's
/// password prompt.
#[derive(Clone, Default)]
pub struct Privileged {
    secret: Option<String>,
    as_root: bool,
}

impl Privileged {
    pub fn new(secret: Option<String>) -> Self {
        Self {
            secret: secret.filter(|s| !s.is_empty()),
            as_root: is_root(),
        }
    }

    /// Runs commands as-is, as if already root
    #[cfg(test)]
    pub(crate) fn direct() -> Self {
        Self {
            secret: None,
            as_root: true,
        }
    }

    /// Program and arguments to execute for `program args...` with privileges
    pub fn wrap(&self, program: &str, args: &[String]) -> (String, Vec<String>) {
        if self.as_root {
            return (program.to_string(), args.to_vec());
        }

        let mut wrapped = vec![
            "-S".to_string(),
            "-p".to_string(),
            String::new(),
            program.to_string(),
        ];
        wrapped.extend(args.iter().cloned());
        ("sudo".to_string(), wrapped)
    }

    /// Newline-terminated secret for sudo's stdin, if sudo is in play
    pub fn stdin_line(&self) -> Option<String> {
        if self.as_root {
            return None;
        }
        self.secret.as_ref().map(|s| format!("{}\n", s))
    }

    /// Run to completion and capture output
    pub fn run(&self, program: &str, args: &[String]) -> Result<Output, PlatformError> {
        let (exe, argv) = self.wrap(program, args);
        debug!("Running privileged: {} {:?}", program, args);

        let command_error = |message: String| PlatformError::CommandError {
            program: program.to_string(),
            message,
        };

        let mut child = Command::new(&exe)
            .args(&argv)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| command_error(e.to_string()))?;

        if let Some(mut stdin) = child.stdin.take() {
            if let Some(line) = self.stdin_line() {
                stdin
                    .write_all(line.as_bytes())
                    .map_err(|e| command_error(e.to_string()))?;
            }
            // Dropping stdin closes it, so a wrong secret fails fast
        }

        let output = child
            .wait_with_output()
            .map_err(|e| command_error(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(command_error(stderr.trim().to_string()));
        }

        Ok(output)
    }
}

/// Whether this process already runs with an effective uid of root
#[cfg(unix)]
pub fn is_root() -> bool {
    nix::unistd::Uid::effective().is_root()
}

#[cfg(not(unix))]
pub fn is_root() -> bool {
    false
}

/// Get the appropriate routing manager for the current platform
pub fn get_routing_manager(
    privileged: Privileged,
) -> Result<Box<dyn RoutingManager>, PlatformError> {
    #[cfg(target_os = "macos")]
    {
        Ok(Box::new(mac::MacRoutingManager::new(privileged)))
    }

    #[cfg(target_os = "linux")]
    {
        Ok(Box::new(linux::LinuxRoutingManager::new(privileged)))
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        let _ = privileged;
        Err(PlatformError::UnsupportedPlatform)
    }
}
