//! Device boundary
//!
//! Every call may block and may fail at the transport level with a
//! [`DeviceError`]. Package-manager outcomes are not transport failures and
//! come back as an [`InstallResult`]. Nothing here retries.

pub mod adb;
pub mod install;

pub use adb::AdbChannel;
pub use install::{parse_install_output, InstallResult, InstallStatus};

use crate::core::error::DeviceError;

/// Operations against a single remote device
pub trait DeviceChannel: Send + Sync {
    /// Write `data` to `remote_path`, replacing any existing file
    fn push(&self, data: &[u8], remote_path: &str) -> Result<(), DeviceError>;

    /// Run `command`, feeding `stdin` if given, and return its stdout
    fn shell(&self, command: &str, stdin: Option<&[u8]>) -> Result<Vec<u8>, DeviceError>;

    /// Install already-pushed packages (remote paths) as one atomic unit
    fn install(&self, packages: &[String], options: &[String])
        -> Result<InstallResult, DeviceError>;

    /// Remove `package_id`; true when the package manager reports success
    fn uninstall(&self, package_id: &str) -> Result<bool, DeviceError>;
}

/// Quote one argument for the device shell
pub(crate) fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@,+".contains(c))
    {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/data/local/tmp/a.apk"), "/data/local/tmp/a.apk");
        assert_eq!(shell_quote("has space"), "'has space'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }
}
