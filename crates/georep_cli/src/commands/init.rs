//! Init command implementation.

use georep_core::ReplicationConfig;
use georep_engine::{SelectiveSync, SiteRole, SiteSettings};
use std::path::{Path, PathBuf};

/// Site description given on the command line.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// Site name.
    pub name: String,
    /// Site role.
    pub role: SiteRole,
    /// Directory for this site's copies.
    pub storage_root: PathBuf,
    /// Transfer signing secret.
    pub secret: String,
    /// Scopes a secondary replicates; empty means all.
    pub scopes: Vec<String>,
    /// Disables verification.
    pub no_verification: bool,
}

/// Runs the init command, writing site settings to `site`.
pub fn run(site: &Path, options: InitOptions) -> Result<(), Box<dyn std::error::Error>> {
    if site.exists() {
        return Err(format!("{} already exists", site.display()).into());
    }
    std::fs::create_dir_all(&options.storage_root)?;

    let selective_sync = if options.scopes.is_empty() {
        SelectiveSync::All
    } else {
        SelectiveSync::scopes(options.scopes)
    };
    let config = ReplicationConfig::new().with_verification_enabled(!options.no_verification);
    let settings = SiteSettings::new(options.name, options.role, options.storage_root)
        .with_secret(options.secret)
        .with_selective_sync(selective_sync)
        .with_config(config);
    settings.save(site)?;

    println!("Initialized {} site '{}' at {}", settings.role, settings.name, site.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(root: PathBuf) -> InitOptions {
        InitOptions {
            name: "eu".into(),
            role: SiteRole::Secondary,
            storage_root: root,
            secret: "k".into(),
            scopes: vec!["group-a".into()],
            no_verification: false,
        }
    }

    #[test]
    fn writes_loadable_settings() {
        let dir = tempfile::tempdir().unwrap();
        let site = dir.path().join("eu.json");
        run(&site, options(dir.path().join("data"))).unwrap();

        let settings = SiteSettings::load(&site).unwrap();
        assert_eq!(settings.role, SiteRole::Secondary);
        assert!(settings.selective_sync.includes(Some("group-a")));
        assert!(!settings.selective_sync.includes(Some("group-b")));
        assert!(dir.path().join("data").is_dir());
    }

    #[test]
    fn refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let site = dir.path().join("eu.json");
        run(&site, options(dir.path().join("data"))).unwrap();
        assert!(run(&site, options(dir.path().join("data"))).is_err());
    }
}
