//! Status command implementation.

use super::work::replay;
use super::{Target, Workspace};

/// Runs the status command.
pub fn run(target: &Target, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let workspace = Workspace::open(target)?;
    replay(&workspace)?;
    let status = workspace.replicator.status()?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        _ => {
            println!("Site: {} ({})", workspace.settings.name, workspace.settings.role);
            println!("{status}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::TwoSites;
    use crate::commands::{resources, Layout};
    use georep_engine::SelectiveSync;

    #[test]
    fn status_serializes_registry_counts() {
        let sites = TwoSites::new(Layout::Blob, SelectiveSync::All);
        resources::add(&sites.primary, 1, "uploads/missing.bin", None).unwrap();
        run(&sites.secondary, "json").unwrap();
        run(&sites.primary, "text").unwrap();

        let workspace = Workspace::open(&sites.secondary).unwrap();
        let status = workspace.replicator.status().unwrap();
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["kind"], "upload");
        assert_eq!(json["role"], "secondary");
        assert_eq!(json["registry"]["pending"], 1);
    }
}
