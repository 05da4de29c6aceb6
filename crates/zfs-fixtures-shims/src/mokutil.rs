//! `mokutil` shim: secure boot state comes from the test environment.

use zfs_fixtures::driver_env::ENV_SECUREBOOT;
use zfs_fixtures::SecureBootState;

use crate::Reply;

/// Answer for the configured state, `None` meaning the variable is unset.
/// Errors carry no trailing newline, as the real tool prints them.
pub fn reply(state: Option<&str>) -> Reply {
    match state.unwrap_or_default().parse::<SecureBootState>() {
        Ok(SecureBootState::EfiSecureBoot) => Reply::out("SecureBoot enabled"),
        Ok(SecureBootState::EfiNoSecureBoot) => Reply::out("SecureBoot disabled"),
        Ok(SecureBootState::Legacy) => Reply::fail_raw(1, "EFI variables are not supported on this system"),
        Err(message) => Reply::fail_raw(255, message),
    }
}

/// Answer from the process environment.
pub fn reply_from_env() -> Reply {
    reply(std::env::var(ENV_SECUREBOOT).ok().as_deref())
}
