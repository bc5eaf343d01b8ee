// Build-time version from Cargo.toml

/// Package version (from Cargo.toml at build time).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Package name (from Cargo.toml at build time).
pub const NAME: &str = env!("CARGO_PKG_NAME");
