use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// WebGPU's guaranteed `maxComputeWorkgroupsPerDimension`.
pub const MAX_DISPATCH_WORKGROUPS: u32 = 65_535;

pub const ENV_PROGRAM_CACHE: &str = "OPFORGE_PROGRAM_CACHE";
pub const ENV_SHADER_DUMP_DIR: &str = "OPFORGE_SHADER_DUMP_DIR";
pub const ENV_MAX_DISPATCH: &str = "OPFORGE_MAX_DISPATCH";

/// Knobs shared by every executor that drives the generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorOptions {
    /// Reuse generated programs keyed by operator, attributes and input signature.
    pub cache_enabled: bool,
    /// When set, every newly generated program is written here as `<hash>.wgsl`
    /// plus a `<hash>.json` metadata record.
    pub dump_dir: Option<PathBuf>,
    /// Per-dimension workgroup limit used when folding large dispatches.
    pub max_dispatch_workgroups: u32,
}

impl Default for GeneratorOptions {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            dump_dir: None,
            max_dispatch_workgroups: MAX_DISPATCH_WORKGROUPS,
        }
    }
}

static ENV_OPTIONS: Lazy<GeneratorOptions> = Lazy::new(GeneratorOptions::from_env);

impl GeneratorOptions {
    /// Defaults overridden by `OPFORGE_*` environment variables. Unparseable values
    /// are ignored.
    pub fn from_env() -> Self {
        let mut opts = Self::default();
        if let Ok(raw) = std::env::var(ENV_PROGRAM_CACHE) {
            match parse_bool(&raw) {
                Some(enabled) => opts.cache_enabled = enabled,
                None => log::warn!("{ENV_PROGRAM_CACHE}='{raw}' not recognized; keeping cache enabled"),
            }
        }
        if let Ok(raw) = std::env::var(ENV_SHADER_DUMP_DIR) {
            if !raw.trim().is_empty() {
                opts.dump_dir = Some(PathBuf::from(raw.trim()));
            }
        }
        if let Ok(raw) = std::env::var(ENV_MAX_DISPATCH) {
            match raw.trim().parse::<u32>() {
                Ok(limit) if limit > 0 => opts.max_dispatch_workgroups = limit,
                _ => log::warn!(
                    "{ENV_MAX_DISPATCH}='{raw}' is not a positive integer; using {MAX_DISPATCH_WORKGROUPS}"
                ),
            }
        }
        opts
    }

    /// Process-wide options read from the environment on first use.
    pub fn global() -> &'static GeneratorOptions {
        &ENV_OPTIONS
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert_eq!(parse_bool("OFF"), Some(false));
        assert_eq!(parse_bool(" 1 "), Some(true));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let opts: GeneratorOptions =
            serde_json::from_str(r#"{"dump_dir": "/tmp/shaders"}"#).expect("json");
        assert!(opts.cache_enabled);
        assert_eq!(opts.dump_dir, Some(PathBuf::from("/tmp/shaders")));
        assert_eq!(opts.max_dispatch_workgroups, MAX_DISPATCH_WORKGROUPS);
    }
}
