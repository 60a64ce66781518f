use log::{debug, warn};

use crate::constants::APP_NAME;

/// Check if the process is running as root
pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Warn once about what an unprivileged run will miss.
pub fn check_privileges() -> bool {
    let root = is_root();
    if root {
        debug!("Running as root");
    } else {
        warn!("Not running as root, many files and commands will be inaccessible");
    }
    root
}

/// Get instructions for elevating privileges
pub fn get_elevation_instructions() -> String {
    format!("Run with sudo: 'sudo {}'", APP_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_check_is_consistent() {
        assert_eq!(check_privileges(), is_root());
        assert!(get_elevation_instructions().contains("sudo"));
    }
}
