/// Build constants for the testfork binaries. Values come from compile-time
/// environment variables with defaults.

/// Source control information.
pub struct Source;

impl Source {
    /// The commit hash from which this binary was built.
    /// Set via the `TESTFORK_COMMIT_HASH` env var at compile time, or "N/A".
    pub const COMMIT_HASH: &'static str = match option_env!("TESTFORK_COMMIT_HASH") {
        Some(h) => h,
        None => "N/A",
    };
}

/// Package metadata reported by the dispatcher and the worker at startup.
#[derive(Debug, Clone)]
pub struct WorkerPackage;

impl WorkerPackage {
    /// The semantic version, taken from `Cargo.toml`.
    pub const VERSION: &'static str = env!("CARGO_PKG_VERSION");

    /// The protocol revision spoken over the worker channel. Bumped whenever
    /// the frame layout or message bodies change incompatibly.
    pub const PROTOCOL_VERSION: u32 = 1;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_not_empty() {
        assert!(!WorkerPackage::VERSION.is_empty());
    }

    #[test]
    fn commit_hash_has_default() {
        assert!(!Source::COMMIT_HASH.is_empty());
    }
}
