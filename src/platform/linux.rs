//! Linux-specific routing implementation

use super::{PlatformError, Privileged, RoutingManager};

pub struct LinuxRoutingManager {
    privileged: Privileged,
}

impl LinuxRoutingManager {
    pub fn new(privileged: Privileged) -> Self {
        Self { privileged }
    }

    fn replace_args(destination: &str, interface: &str) -> Vec<String> {
        ["route", "replace", destination, "dev", interface]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }
}

impl RoutingManager for LinuxRoutingManager {
    fn replace_route(&self, destination: &str, interface: &str) -> Result<(), PlatformError> {
        self.privileged
            .run("ip", &Self::replace_args(destination, interface))
            .map_err(|e| PlatformError::RouteError(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace_args() {
        assert_eq!(
            LinuxRoutingManager::replace_args("10.1.2.3", "tun0"),
            vec!["route", "replace", "10.1.2.3", "dev", "tun0"]
        );
    }
}
