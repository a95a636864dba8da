// ABOUTME: Selection rules deciding which databases and objects take part in a run
// ABOUTME: Handles database and object include/exclude lists plus the access-control toggle

use anyhow::{bail, Result};

use crate::unit::{MigrationUnit, UnitKind};

/// Represents migration selection rules
#[derive(Debug, Clone)]
pub struct MigrationFilter {
    include_databases: Option<Vec<String>>,
    exclude_databases: Option<Vec<String>>,
    include_objects: Option<Vec<String>>, // Format: "db.object"
    exclude_objects: Option<Vec<String>>, // Format: "db.object"
    access_control: bool,
}

impl Default for MigrationFilter {
    fn default() -> Self {
        Self {
            include_databases: None,
            exclude_databases: None,
            include_objects: None,
            exclude_objects: None,
            access_control: true,
        }
    }
}

impl MigrationFilter {
    /// Creates a filter from config and CLI lists
    pub fn new(
        include_databases: Option<Vec<String>>,
        exclude_databases: Option<Vec<String>>,
        include_objects: Option<Vec<String>>,
        exclude_objects: Option<Vec<String>>,
        access_control: bool,
    ) -> Result<Self> {
        if include_databases.is_some() && exclude_databases.is_some() {
            bail!("Cannot use both include_databases and exclude_databases");
        }
        if include_objects.is_some() && exclude_objects.is_some() {
            bail!("Cannot use both include_tables and exclude_tables");
        }

        for object in include_objects
            .iter()
            .chain(exclude_objects.iter())
            .flatten()
        {
            match object.split_once('.') {
                Some((db, name)) if !db.is_empty() && !name.is_empty() => {}
                _ => bail!(
                    "Object must be specified as 'database.object', got '{}'",
                    object
                ),
            }
        }

        Ok(Self {
            include_databases,
            exclude_databases,
            include_objects,
            exclude_objects,
            access_control,
        })
    }

    /// Creates an empty filter (migrate everything)
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.include_databases.is_none()
            && self.exclude_databases.is_none()
            && self.include_objects.is_none()
            && self.exclude_objects.is_none()
    }

    pub fn includes_access_control(&self) -> bool {
        self.access_control
    }

    pub fn should_migrate_database(&self, db_name: &str) -> bool {
        if let Some(ref include) = self.include_databases {
            if !include.iter().any(|db| db == db_name) {
                return false;
            }
        }
        if let Some(ref exclude) = self.exclude_databases {
            if exclude.iter().any(|db| db == db_name) {
                return false;
            }
        }
        true
    }

    pub fn should_migrate_object(&self, db_name: &str, object: &str) -> bool {
        if !self.should_migrate_database(db_name) {
            return false;
        }

        let full_name = format!("{}.{}", db_name, object);
        if let Some(ref include) = self.include_objects {
            if !include.contains(&full_name) {
                return false;
            }
        }
        if let Some(ref exclude) = self.exclude_objects {
            if exclude.contains(&full_name) {
                return false;
            }
        }
        true
    }

    /// Whether a classified unit takes part in the run
    pub fn selects(&self, unit: &MigrationUnit) -> bool {
        match unit.kind {
            UnitKind::AccessControlBundle => self.access_control,
            UnitKind::Database => self.should_migrate_database(&unit.name.namespace),
            _ => self.should_migrate_object(&unit.name.namespace, &unit.name.name),
        }
    }
}
