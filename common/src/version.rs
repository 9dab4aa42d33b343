// build identification printed by `--build-info` and embedded in JSON summaries

use serde::{Deserialize, Serialize};

/// Build information for the running binary
///
/// The semantic version always comes from Cargo.toml. Git information is captured by build.rs
/// and is absent when the crate was built outside a git checkout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildInfo {
    pub semantic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_describe: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_hash: Option<String>,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            semantic: env!("CARGO_PKG_VERSION").to_string(),
            git_describe: option_env!("AZREPLICA_GIT_DESCRIBE").map(String::from),
            git_hash: option_env!("AZREPLICA_GIT_HASH").map(String::from),
        }
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl std::fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.semantic)?;
        if let Some(describe) = &self.git_describe {
            write!(f, " ({describe})")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_omits_missing_git_fields() {
        let info = BuildInfo {
            semantic: "0.1.0".to_string(),
            git_describe: None,
            git_hash: None,
        };
        assert_eq!(info.to_json().unwrap(), r#"{"semantic":"0.1.0"}"#);
        assert_eq!(info.to_string(), "0.1.0");
    }

    #[test]
    fn current_uses_package_version() {
        assert_eq!(BuildInfo::current().semantic, env!("CARGO_PKG_VERSION"));
    }
}
