//! Shared CLI plumbing: environment-variable fallbacks and volume-map
//! argument assembly used by both binaries.

use std::env;

/// Read `name`, falling back to the `SLURM_SPANK_`-prefixed counterpart
/// SPANK plugins set when this runs inside a Slurm prolog.
pub fn env_or_spank(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .or_else(|| env::var(format!("SLURM_SPANK_{name}")).ok())
}

/// Join repeated `-V/--volume` occurrences (each possibly itself
/// containing `;`-separated entries) into one volume-map string.
pub fn join_volume_args(volumes: &[String]) -> String {
    volumes.join(";")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_repeated_volume_flags() {
        assert_eq!(join_volume_args(&["/a:/b".to_string(), "/c:/d:ro".to_string()]), "/a:/b;/c:/d:ro");
    }
}
