//! /etc/hosts file management for VPN hostnames
//!
//! Each managed mapping is a single line carrying a trailing tag, so it can
//! be found and replaced in place on the next run:
//!
//! ```text
//! 10.0.0.1	superpod.ust.hk	# hkust-vpn
//! ```

use crate::platform::{PlatformError, Privileged};
use std::fs;
use std::io::{self, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum HostsError {
    #[error("Failed to access hosts file: {0}")]
    IoError(#[from] io::Error),
    #[error("Privileged hosts file write failed: {0}")]
    PrivilegedWrite(#[from] PlatformError),
}

const HOSTS_TAG: &str = "# hkust-vpn";

pub struct HostsManager {
    path: PathBuf,
    privileged: Option<Privileged>,
}

impl HostsManager {
    pub fn new(privileged: Privileged) -> Self {
        Self {
            path: PathBuf::from(if cfg!(windows) {
                r"C:\Windows\System32\drivers\etc\hosts"
            } else {
                "/etc/hosts"
            }),
            privileged: Some(privileged),
        }
    }

    /// Manage a file the current user can write directly
    pub fn with_path(path: PathBuf) -> Self {
        Self {
            path,
            privileged: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Insert or update the tagged mapping for `hostname`
    pub fn upsert_entry(&self, hostname: &str, ip: IpAddr) -> Result<(), HostsError> {
        let content = fs::read_to_string(&self.path)?;
        let updated = upsert_content(&content, hostname, ip);
        if updated == content {
            debug!("Hosts entry for {} already current", hostname);
            return Ok(());
        }
        self.write(&updated)?;
        info!("Hosts entry set: {} -> {}", hostname, ip);
        Ok(())
    }

    fn write(&self, content: &str) -> Result<(), HostsError> {
        match fs::write(&self.path, content) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => match &self.privileged {
                Some(privileged) => self.write_privileged(privileged, content),
                None => Err(e.into()),
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Stage the new content in a private temp file and copy it over the
    /// hosts file as root; `cp` keeps the target's owner and mode.
    fn write_privileged(&self, privileged: &Privileged, content: &str) -> Result<(), HostsError> {
        let mut staged = NamedTempFile::new()?;
        staged.write_all(content.as_bytes())?;
        staged.flush()?;

        privileged.run(
            "cp",
            &[
                staged.path().to_string_lossy().to_string(),
                self.path.to_string_lossy().to_string(),
            ],
        )?;
        Ok(())
    }
}

fn is_tagged_for(line: &str, hostname: &str) -> bool {
    let Some(entry) = line.trim_end().strip_suffix(HOSTS_TAG) else {
        return false;
    };
    entry.split_whitespace().nth(1) == Some(hostname)
}

fn entry_line(hostname: &str, ip: IpAddr) -> String {
    format!("{}\t{}\t{}", ip, hostname, HOSTS_TAG)
}

/// Hosts file content with exactly one tagged line mapping `hostname` to `ip`
///
/// An existing tagged line for the host is replaced where it stands; any
/// duplicates are dropped. Untagged lines are never touched.
pub fn upsert_content(content: &str, hostname: &str, ip: IpAddr) -> String {
    let mut result = String::with_capacity(content.len() + 64);
    let mut written = false;

    for line in content.lines() {
        if is_tagged_for(line, hostname) {
            if !written {
                result.push_str(&entry_line(hostname, ip));
                result.push('\n');
                written = true;
            }
            continue;
        }
        result.push_str(line);
        result.push('\n');
    }

    if !written {
        result.push_str(&entry_line(hostname, ip));
        result.push('\n');
    }

    result
}
