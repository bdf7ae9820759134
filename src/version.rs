// Build-time version from Cargo.toml

/// Package version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Package name (from Cargo.toml).
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Script API level. Bumped when the variables injected into scripts, or the
/// returned-variable marker, change shape.
pub const API_LEVEL: u32 = 2;
