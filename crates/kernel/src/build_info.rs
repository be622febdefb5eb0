// Baked build information, surfaced in the boot banner and panic dumps.

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Short commit hash, stamped by CI via NPK_GIT_HASH.
pub const GIT_HASH: &str = match option_env!("NPK_GIT_HASH") {
    Some(hash) => hash,
    None => "unknown",
};

pub const TARGET_ARCH: &str = if cfg!(target_arch = "x86_64") {
    "x86_64"
} else if cfg!(target_arch = "aarch64") {
    "aarch64"
} else {
    "host"
};

pub const PROFILE: &str = if cfg!(debug_assertions) { "debug" } else { "release" };
