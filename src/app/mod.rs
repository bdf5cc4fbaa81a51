pub mod adb;
pub mod commands;
pub mod config;
pub mod error;
pub mod logging;
pub mod mirror;
pub mod models;
pub mod reconcile;
pub mod recording;
pub mod registry;
pub mod state;

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::{Mutex, MutexGuard};

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    /// Serializes tests that redirect the config or registry file through
    /// `MIRROR_DESK_*` environment variables.
    pub fn env_guard() -> MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
