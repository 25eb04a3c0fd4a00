//! Resource commands, run on the primary.

use super::{Target, Workspace};
use georep_core::{Clock, RecordId, Resource, SystemClock};

/// Runs the add-resource command.
pub fn add(
    target: &Target,
    id: RecordId,
    locator: &str,
    scope: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let workspace = Workspace::open(target)?;
    let mut resource = Resource::new(id, locator, SystemClock.now());
    resource.scope = scope.map(str::to_string);

    if workspace.replicator.create_resource(resource)? {
        println!("Added {} {id} at {locator}", target.kind);
    } else {
        println!("{} {id} already exists", target.kind);
    }
    Ok(())
}

/// Runs the update-resource command.
pub fn update(target: &Target, id: RecordId) -> Result<(), Box<dyn std::error::Error>> {
    let workspace = Workspace::open(target)?;
    if workspace.replicator.update_resource(id)? {
        println!("Updated {} {id}", target.kind);
        Ok(())
    } else {
        Err(format!("{} {id} not found", target.kind).into())
    }
}

/// Runs the remove-resource command.
pub fn remove(target: &Target, id: RecordId) -> Result<(), Box<dyn std::error::Error>> {
    let workspace = Workspace::open(target)?;
    if workspace.replicator.destroy_resource(id)? {
        println!("Removed {} {id}", target.kind);
        Ok(())
    } else {
        Err(format!("{} {id} not found", target.kind).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::TwoSites;
    use crate::commands::Layout;
    use georep_engine::SelectiveSync;

    #[test]
    fn resources_are_journaled() {
        let sites = TwoSites::new(Layout::Blob, SelectiveSync::All);
        add(&sites.primary, 1, "uploads/1.bin", Some("group-a")).unwrap();
        update(&sites.primary, 1).unwrap();
        remove(&sites.primary, 1).unwrap();

        let workspace = Workspace::open(&sites.primary).unwrap();
        assert_eq!(workspace.journal.entries_after(0).unwrap().len(), 3);
        assert!(update(&sites.primary, 1).is_err());
    }

    #[test]
    fn secondaries_cannot_add() {
        let sites = TwoSites::new(Layout::Blob, SelectiveSync::All);
        assert!(add(&sites.secondary, 1, "uploads/1.bin", None).is_err());
    }
}
