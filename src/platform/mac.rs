//! macOS-specific routing implementation

use super::{PlatformError, Privileged, RoutingManager};
use tracing::debug;

pub struct MacRoutingManager {
    privileged: Privileged,
}

impl MacRoutingManager {
    pub fn new(privileged: Privileged) -> Self {
        Self { privileged }
    }

    fn route_args(verb: &str, destination: &str, interface: &str) -> Vec<String> {
        ["-n", verb, "-host", destination, "-interface", interface]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }
}

impl RoutingManager for MacRoutingManager {
    fn replace_route(&self, destination: &str, interface: &str) -> Result<(), PlatformError> {
        // `route change` only works on an existing entry
        if let Err(e) = self
            .privileged
            .run("route", &Self::route_args("change", destination, interface))
        {
            debug!("route change failed ({}), adding instead", e);
            self.privileged
                .run("route", &Self::route_args("add", destination, interface))
                .map_err(|e| PlatformError::RouteError(e.to_string()))?;
        }
        Ok(())
    }
}
