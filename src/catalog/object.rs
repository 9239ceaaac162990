// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Sentinel component matching any database or object during privilege
/// lookup.
pub const WILDCARD_ID: i32 = -1;

bitflags::bitflags! {
    /// Grantable privilege bits. Union defines a grant; "requested is a
    /// subset of effective" defines a check.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct AccessPrivileges: u64 {
        const SELECT          = 1 << 0;
        const INSERT          = 1 << 1;
        const UPDATE          = 1 << 2;
        const DELETE          = 1 << 3;
        const TRUNCATE        = 1 << 4;
        const ALTER           = 1 << 5;
        const DROP            = 1 << 6;
        const CREATE          = 1 << 7;
        const CREATE_TABLE    = 1 << 8;
        const CREATE_VIEW     = 1 << 9;
        const CREATE_DATABASE = 1 << 10;
        const ACCESS          = 1 << 11;
    }
}

impl AccessPrivileges {
    pub fn has_any(&self) -> bool {
        !self.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PermissionType {
    Database,
    Table,
    View,
}

/// Key of a privilege entry. `db_id` or `object_id` of [`WILDCARD_ID`]
/// matches any narrower key during lookup.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DBObjectKey {
    pub permission_type: PermissionType,
    pub db_id: i32,
    pub object_id: i32,
}

impl DBObjectKey {
    pub fn new(permission_type: PermissionType, db_id: i32, object_id: i32) -> Self {
        DBObjectKey {
            permission_type,
            db_id,
            object_id,
        }
    }

    /// Keys probed during lookup: exact, then any-object, then any-database.
    /// The widening is cumulative.
    pub fn widening_sequence(&self) -> impl Iterator<Item = DBObjectKey> {
        let mut keys = vec![*self];
        let mut key = *self;
        if key.object_id != WILDCARD_ID {
            key.object_id = WILDCARD_ID;
            keys.push(key);
        }
        if key.db_id != WILDCARD_ID {
            key.db_id = WILDCARD_ID;
            keys.push(key);
        }
        keys.into_iter()
    }
}

impl fmt::Debug for DBObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}({},{})",
            self.permission_type, self.db_id, self.object_id
        )
    }
}

/// A privilege entry: the target object plus the granted bitset.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DBObject {
    key: DBObjectKey,
    name: String,
    owner: i32,
    privileges: AccessPrivileges,
}

impl DBObject {
    pub fn new(
        key: DBObjectKey,
        name: impl Into<String>,
        owner: i32,
        privileges: AccessPrivileges,
    ) -> Self {
        DBObject {
            key,
            name: name.into(),
            owner,
            privileges,
        }
    }

    pub fn key(&self) -> DBObjectKey {
        self.key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn owner(&self) -> i32 {
        self.owner
    }

    pub fn set_owner(&mut self, owner: i32) {
        self.owner = owner;
    }

    pub fn privileges(&self) -> AccessPrivileges {
        self.privileges
    }

    /// ORs `privileges` into the entry.
    pub fn grant(&mut self, privileges: AccessPrivileges) {
        self.privileges |= privileges;
    }

    /// Subtracts `privileges` from the entry.
    pub fn revoke(&mut self, privileges: AccessPrivileges) {
        self.privileges -= privileges;
    }

    pub fn reset_privileges(&mut self) {
        self.privileges = AccessPrivileges::empty();
    }
}
