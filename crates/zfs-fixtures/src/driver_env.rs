//! Environment shared between provisioned fixtures, the program under test
//! and the command shims.

use std::fmt;
use std::str::FromStr;

/// Directory the `zpool` shim adds to its default import search path.
pub const ENV_POOL_DIR: &str = "TEST_POOL_DIR";
/// Dataset the `zfs` shim reports as mounted on `/`.
pub const ENV_CURRENT_ROOT_DATASET: &str = "TEST_MOCKZFS_CURRENT_ROOT_DATASET";
/// Firmware state the `mokutil` shim reports.
pub const ENV_SECUREBOOT: &str = "TEST_MOKUTIL_SECUREBOOT";

/// Firmware configuration a test case runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecureBootState {
    /// EFI firmware with secure boot on.
    EfiSecureBoot,
    /// EFI firmware with secure boot off.
    EfiNoSecureBoot,
    /// BIOS firmware, no EFI variables.
    Legacy,
}

impl SecureBootState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecureBootState::EfiSecureBoot => "efi-sb",
            SecureBootState::EfiNoSecureBoot => "efi-nosb",
            SecureBootState::Legacy => "legacy",
        }
    }
}

impl fmt::Display for SecureBootState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SecureBootState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "efi-sb" => Ok(SecureBootState::EfiSecureBoot),
            "efi-nosb" => Ok(SecureBootState::EfiNoSecureBoot),
            "legacy" => Ok(SecureBootState::Legacy),
            other => Err(format!("Unknown value: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secure_boot_states_parse_their_own_names() {
        for state in [
            SecureBootState::EfiSecureBoot,
            SecureBootState::EfiNoSecureBoot,
            SecureBootState::Legacy,
        ] {
            assert_eq!(state.as_str().parse::<SecureBootState>(), Ok(state));
        }
        assert_eq!(
            "bios".parse::<SecureBootState>(),
            Err("Unknown value: bios".to_string())
        );
    }
}
