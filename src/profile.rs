//! Repository allow-lists.
//!
//! A profile is a named list of `registry/repository` patterns from the
//! `[profiles]` table of the config file. Patterns are globs, so
//! `registry.example.io/ubi8/*` selects every repository under `ubi8/`.

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::config::Config;

/// Decides which catalog repositories are in scope for a run.
#[derive(Debug, Clone)]
pub struct ProfileFilter {
    name: Option<String>,
    patterns: Option<GlobSet>,
}

impl ProfileFilter {
    /// A filter that admits every repository.
    pub fn all() -> Self {
        Self {
            name: None,
            patterns: None,
        }
    }

    /// Build a filter from explicit patterns.
    pub fn from_patterns(name: &str, patterns: &[String]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let glob = Glob::new(pattern)
                .with_context(|| format!("Invalid pattern '{}' in profile '{}'", pattern, name))?;
            builder.add(glob);
        }

        Ok(Self {
            name: Some(name.to_string()),
            patterns: Some(builder.build()?),
        })
    }

    /// Resolve the profile to use for a run.
    ///
    /// `requested` (from the command line) wins over `sync.profile`; with
    /// neither set every repository is in scope.
    pub fn from_config(config: &Config, requested: Option<&str>) -> Result<Self> {
        let name = match requested.or(config.sync.profile.as_deref()) {
            Some(name) => name,
            None => return Ok(Self::all()),
        };

        let patterns = config
            .profiles
            .get(name)
            .with_context(|| format!("Unknown profile: '{}'", name))?;

        Self::from_patterns(name, patterns)
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn includes(&self, registry: &str, repository: &str) -> bool {
        match &self.patterns {
            Some(set) => set.is_match(format!("{}/{}", registry, repository)),
            None => true,
        }
    }
}

/// Print the configured profiles.
pub fn list_profiles(config: &Config) -> Result<()> {
    if config.profiles.is_empty() {
        println!("No profiles configured (every repository is in scope).");
        return Ok(());
    }

    println!("{:<20} {:<8} PATTERNS", "PROFILE", "DEFAULT");
    for (name, patterns) in &config.profiles {
        let is_default = config.sync.profile.as_deref() == Some(name.as_str());
        println!(
            "{:<20} {:<8} {}",
            name,
            if is_default { "yes" } else { "" },
            patterns.join(", ")
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(patterns: &[&str]) -> ProfileFilter {
        let patterns: Vec<String> = patterns.iter().map(|p| p.to_string()).collect();
        ProfileFilter::from_patterns("test", &patterns).unwrap()
    }

    #[test]
    fn no_profile_includes_everything() {
        let f = ProfileFilter::all();
        assert!(f.includes("reg1", "repoA"));
        assert!(f.name().is_none());
    }

    #[test]
    fn exact_entries_match_only_themselves() {
        let f = filter(&["reg1/repoA"]);
        assert!(f.includes("reg1", "repoA"));
        assert!(!f.includes("reg1", "repoB"));
        assert!(!f.includes("reg2", "repoA"));
    }

    #[test]
    fn globs_match_nested_repositories() {
        let f = filter(&["registry.example.io/ubi8/*"]);
        assert!(f.includes("registry.example.io", "ubi8/ubi"));
        assert!(f.includes("registry.example.io", "ubi8/ubi-minimal"));
        assert!(!f.includes("registry.example.io", "ubi9/ubi"));
    }

    #[test]
    fn empty_profile_includes_nothing() {
        let f = filter(&[]);
        assert!(!f.includes("reg1", "repoA"));
    }

    #[test]
    fn requested_profile_overrides_config_default() {
        let mut config = Config::minimal("/tmp/x.sqlite", "http://localhost");
        config
            .profiles
            .insert("a".to_string(), vec!["reg1/repoA".to_string()]);
        config
            .profiles
            .insert("b".to_string(), vec!["reg1/repoB".to_string()]);
        config.sync.profile = Some("a".to_string());

        let f = ProfileFilter::from_config(&config, Some("b")).unwrap();
        assert_eq!(f.name(), Some("b"));
        assert!(f.includes("reg1", "repoB"));
        assert!(!f.includes("reg1", "repoA"));

        assert!(ProfileFilter::from_config(&config, Some("zzz")).is_err());
    }
}
