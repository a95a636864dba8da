// ABOUTME: Access-control entity kinds and their fixed replay order
// ABOUTME: Roles, settings profiles, quotas, users and grants

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AccessEntity {
    Role,
    Profile,
    Quota,
    User,
    Grant,
}

impl AccessEntity {
    /// Replay order: grants reference users and roles, which must exist first
    pub const REPLAY_ORDER: [AccessEntity; 5] = [
        AccessEntity::Role,
        AccessEntity::Profile,
        AccessEntity::Quota,
        AccessEntity::User,
        AccessEntity::Grant,
    ];

    /// File holding this entity's statements under `access_control/`
    pub fn file_name(self) -> &'static str {
        match self {
            AccessEntity::Role => "roles.sql",
            AccessEntity::Profile => "profiles.sql",
            AccessEntity::Quota => "quotas.sql",
            AccessEntity::User => "users.sql",
            AccessEntity::Grant => "grants.sql",
        }
    }

    /// Entities the server creates on its own and that must not be replayed
    pub fn builtin_names(self) -> &'static [&'static str] {
        match self {
            AccessEntity::Role => &[],
            AccessEntity::Profile => &["default", "readonly"],
            AccessEntity::Quota => &["default"],
            AccessEntity::User => &["default"],
            AccessEntity::Grant => &[],
        }
    }
}

impl fmt::Display for AccessEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AccessEntity::Role => "roles",
            AccessEntity::Profile => "settings profiles",
            AccessEntity::Quota => "quotas",
            AccessEntity::User => "users",
            AccessEntity::Grant => "grants",
        };
        f.write_str(label)
    }
}
