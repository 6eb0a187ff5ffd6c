//! OpenConnect command line construction and tool lookup

use crate::login::SessionToken;
use std::path::{Path, PathBuf};
use which::which;

/// Directories sudo's `secure_path` usually covers but a user's PATH may not
const SBIN_DIRS: &[&str] = &["/sbin", "/usr/sbin", "/usr/local/sbin"];

/// Find an executable given as a path or a bare program name
///
/// Tries the literal path, then PATH, then the sbin directories. The result
/// is absolute when found via PATH, so it still resolves under sudo.
pub fn locate_tool(name: &str) -> Option<PathBuf> {
    let candidate = Path::new(name);
    if candidate.components().count() > 1 && candidate.is_file() {
        return Some(candidate.to_path_buf());
    }

    if let Ok(found) = which(name) {
        return Some(found);
    }

    SBIN_DIRS
        .iter()
        .map(|dir| Path::new(dir).join(name))
        .find(|path| path.is_file())
}

/// Everything needed to launch openconnect except the session token
#[derive(Debug, Clone)]
pub struct TunnelCommand {
    pub openconnect: PathBuf,
    pub vpn_slice: PathBuf,
    pub protocol: String,
    pub url: String,
    pub cookie_name: String,
    pub hosts: Vec<String>,
    pub proxy: Option<String>,
}

impl TunnelCommand {
    pub fn program(&self) -> String {
        self.openconnect.to_string_lossy().to_string()
    }

    /// `vpn-slice host...`, run by openconnect once the tunnel is up
    pub fn slice_script(&self) -> String {
        let mut script = self.vpn_slice.to_string_lossy().to_string();
        for host in &self.hosts {
            script.push(' ');
            script.push_str(host);
        }
        script
    }

    /// openconnect arguments for one connection with `token`
    pub fn args(&self, token: &SessionToken) -> Vec<String> {
        let mut args = vec![
            format!("--protocol={}", self.protocol),
            self.url.clone(),
            format!("--cookie={}={}", self.cookie_name, token.as_str()),
            "-s".to_string(),
            self.slice_script(),
        ];
        if let Some(proxy) = &self.proxy {
            args.push("--proxy".to_string());
            args.push(proxy.clone());
        }
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn sample_command() -> TunnelCommand {
        TunnelCommand {
            openconnect: PathBuf::from("/usr/sbin/openconnect"),
            vpn_slice: PathBuf::from("/usr/local/bin/vpn-slice"),
            protocol: "nc".to_string(),
            url: "https://remote.ust.hk/mfa".to_string(),
            cookie_name: "DSID".to_string(),
            hosts: vec!["superpod.ust.hk".to_string(), "hpc.ust.hk".to_string()],
            proxy: Some("http://127.0.0.1:7890".to_string()),
        }
    }

    #[test]
    fn test_args_with_proxy() {
        let args = sample_command().args(&SessionToken::new("abc123"));
        assert_eq!(args, vec![
            "--protocol=nc",
            "https://remote.ust.hk/mfa",
            "--cookie=DSID=abc123",
            "-s",
            "/usr/local/bin/vpn-slice superpod.ust.hk hpc.ust.hk",
            "--proxy",
            "http://127.0.0.1:7890",
        ]);
    }

    #[test]
    fn test_args_without_proxy() {
        let command = TunnelCommand {
            proxy: None,
            ..sample_command()
        };
        let args = command.args(&SessionToken::new("abc123"));
        assert_eq!(args.len(), 5);
        assert!(!args.iter().any(|a| a == "--proxy"));
    }

    #[test]
    fn test_locate_tool_by_path() {
        let temp_dir = TempDir::new().unwrap();
        let tool = temp_dir.path().join("vpn-slice");
        fs::write(&tool, "#!/bin/sh\n").unwrap();

        assert_eq!(locate_tool(tool.to_str().unwrap()), Some(tool));
    }

    #[test]
    fn test_locate_tool_missing() {
        assert_eq!(locate_tool("definitely-not-a-real-tool-7f3a"), None);
    }
}
