// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! The grantee graph: users and roles, role-inheritance edges, and cached
//! transitive privileges.
//!
//! All grantees live in one arena keyed by [`GranteeId`]; edges are id
//! pairs, so the role/grantee cycle of ownership never materializes as
//! object references. Every mutation recomputes the affected effective
//! privilege maps before it returns, walking the outbound edges of the
//! mutated node, so readers under the catalog read lock always observe a
//! consistent closure.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use itertools::Itertools;
use tracing::debug;

use super::object::{DBObject, DBObjectKey};
use super::{CatalogError, CatalogResult};

pub type GranteeId = u32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GranteeKind {
    User,
    Role,
}

struct GranteeNode {
    name: String,
    kind: GranteeKind,
    /// Inbound edges: roles granted to this grantee.
    roles: BTreeSet<GranteeId>,
    /// Outbound edges: who this role is granted to. Always empty for users.
    grantees: BTreeSet<GranteeId>,
    /// Grants applied straight to this grantee.
    direct: BTreeMap<DBObjectKey, DBObject>,
    /// `direct` unioned with the effective privileges of every inbound role.
    effective: BTreeMap<DBObjectKey, DBObject>,
}

impl GranteeNode {
    fn new(name: String, kind: GranteeKind) -> Self {
        GranteeNode {
            name,
            kind,
            roles: BTreeSet::new(),
            grantees: BTreeSet::new(),
            direct: BTreeMap::new(),
            effective: BTreeMap::new(),
        }
    }

    fn objects(&self, only_direct: bool) -> &BTreeMap<DBObjectKey, DBObject> {
        if only_direct {
            &self.direct
        } else {
            &self.effective
        }
    }
}

/// Authoritative answer to "may principal P perform privilege set S on
/// object O?".
#[derive(Default)]
pub struct PrivilegeGraph {
    nodes: HashMap<GranteeId, GranteeNode>,
    /// Names are unique across users and roles, case preserved.
    by_name: HashMap<String, GranteeId>,
    next_id: GranteeId,
}

impl PrivilegeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert_node(&mut self, name: &str, kind: GranteeKind) -> CatalogResult<GranteeId> {
        if self.by_name.contains_key(name) {
            return Err(CatalogError::Duplicated("grantee", name.into()));
        }
        let id = self.next_id;
        self.next_id += 1;
        self.nodes
            .insert(id, GranteeNode::new(name.to_string(), kind));
        self.by_name.insert(name.to_string(), id);
        Ok(id)
    }

    pub fn create_user(&mut self, name: &str) -> CatalogResult<GranteeId> {
        self.insert_node(name, GranteeKind::User)
    }

    pub fn create_role(&mut self, name: &str) -> CatalogResult<GranteeId> {
        self.insert_node(name, GranteeKind::Role)
    }

    fn node(&self, id: GranteeId) -> CatalogResult<&GranteeNode> {
        self.nodes
            .get(&id)
            .ok_or_else(|| CatalogError::NotFound("grantee", id.to_string()))
    }

    fn node_mut(&mut self, id: GranteeId) -> CatalogResult<&mut GranteeNode> {
        self.nodes
            .get_mut(&id)
            .ok_or_else(|| CatalogError::NotFound("grantee", id.to_string()))
    }

    pub fn grantee_id(&self, name: &str) -> Option<GranteeId> {
        self.by_name.get(name).copied()
    }

    pub fn name(&self, id: GranteeId) -> CatalogResult<&str> {
        Ok(&self.node(id)?.name)
    }

    pub fn is_user(&self, id: GranteeId) -> CatalogResult<bool> {
        Ok(self.node(id)?.kind == GranteeKind::User)
    }

    pub fn rename_grantee(&mut self, id: GranteeId, name: &str) -> CatalogResult<()> {
        if self.by_name.contains_key(name) {
            return Err(CatalogError::Duplicated("grantee", name.into()));
        }
        let node = self.node_mut(id)?;
        let old = std::mem::replace(&mut node.name, name.to_string());
        self.by_name.remove(&old);
        self.by_name.insert(name.to_string(), id);
        Ok(())
    }

    /// Detaches the grantee from every edge and removes it. Descendants of a
    /// dropped role lose its privileges before this returns.
    pub fn drop_grantee(&mut self, id: GranteeId) -> CatalogResult<()> {
        let node = self
            .nodes
            .remove(&id)
            .ok_or_else(|| CatalogError::NotFound("grantee", id.to_string()))?;
        self.by_name.remove(&node.name);
        for role_id in &node.roles {
            if let Some(role) = self.nodes.get_mut(role_id) {
                role.grantees.remove(&id);
            }
        }
        for grantee_id in &node.grantees {
            if let Some(grantee) = self.nodes.get_mut(grantee_id) {
                grantee.roles.remove(&id);
            }
        }
        // former members recompute without the dropped role
        for grantee_id in node.grantees {
            self.update_privileges(grantee_id);
        }
        Ok(())
    }

    /// ORs `object`'s privileges into the grantee's direct map, then
    /// recomputes effective privileges here and in every descendant.
    pub fn grant_privileges(&mut self, id: GranteeId, object: &DBObject) -> CatalogResult<()> {
        let node = self.node_mut(id)?;
        match node.direct.entry(object.key()) {
            Entry::Occupied(mut entry) => entry.get_mut().grant(object.privileges()),
            Entry::Vacant(entry) => {
                entry.insert(object.clone());
            }
        }
        self.update_privileges(id);
        Ok(())
    }

    /// Subtracts `object`'s privileges from the direct entry, erasing it if
    /// nothing remains. Returns the residual entry, or `None` when it was
    /// fully removed. Fails if the grantee never had the entry.
    pub fn revoke_privileges(
        &mut self,
        id: GranteeId,
        object: &DBObject,
    ) -> CatalogResult<Option<DBObject>> {
        let name = self.node(id)?.name.clone();
        let node = self.node_mut(id)?;
        let entry = node.direct.get_mut(&object.key()).ok_or_else(|| {
            CatalogError::NotFound(
                "privileges",
                format!("{} on {:?} for {}", object.name(), object.key(), name),
            )
        })?;
        entry.revoke(object.privileges());
        let residual = if entry.privileges().has_any() {
            Some(entry.clone())
        } else {
            node.direct.remove(&object.key());
            None
        };
        self.update_privileges(id);
        Ok(residual)
    }

    /// Grants `role` to `grantee`. Refuses a duplicate edge and any edge
    /// that would close a cycle.
    pub fn grant_role(&mut self, grantee: GranteeId, role: GranteeId) -> CatalogResult<()> {
        if self.node(role)?.kind != GranteeKind::Role {
            return Err(CatalogError::NotARole(self.node(role)?.name.clone()));
        }
        if self.node(grantee)?.roles.contains(&role) {
            return Err(CatalogError::Duplicated(
                "role grant",
                format!(
                    "{} to {}",
                    self.node(role)?.name,
                    self.node(grantee)?.name
                ),
            ));
        }
        self.check_cycles(grantee, role)?;
        self.node_mut(grantee)?.roles.insert(role);
        self.node_mut(role)?.grantees.insert(grantee);
        debug!(
            role = %self.nodes[&role].name,
            grantee = %self.nodes[&grantee].name,
            "granted role"
        );
        self.update_privileges(grantee);
        Ok(())
    }

    /// Removes the `role -> grantee` edge and recomputes downstream.
    pub fn revoke_role(&mut self, grantee: GranteeId, role: GranteeId) -> CatalogResult<()> {
        if !self.node(grantee)?.roles.contains(&role) {
            return Err(CatalogError::NotFound(
                "role grant",
                format!(
                    "{} to {}",
                    self.node(role)?.name,
                    self.node(grantee)?.name
                ),
            ));
        }
        self.node_mut(grantee)?.roles.remove(&role);
        self.node_mut(role)?.grantees.remove(&grantee);
        self.update_privileges(grantee);
        Ok(())
    }

    /// Rejects the edge `role -> grantee` if `role` is reachable in the
    /// descendant closure of `grantee` (the grantee itself included). Users
    /// have no descendants, so the walk never enters them.
    fn check_cycles(&self, grantee: GranteeId, new_role: GranteeId) -> CatalogResult<()> {
        let mut stack = vec![grantee];
        while let Some(id) = stack.pop() {
            let node = &self.nodes[&id];
            if node.kind == GranteeKind::Role {
                if id == new_role {
                    return Err(CatalogError::CycleDetected(
                        self.nodes[&new_role].name.clone(),
                        self.nodes[&grantee].name.clone(),
                    ));
                }
                stack.extend(node.grantees.iter().copied());
            }
        }
        Ok(())
    }

    /// Recomputes the effective privileges of `start` from its direct map
    /// and inbound roles, then walks every outbound path so all reachable
    /// descendants are consistent before this returns. Terminates because
    /// the graph is a DAG.
    fn update_privileges(&mut self, start: GranteeId) {
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            self.recompute_effective(id);
            let node = &self.nodes[&id];
            if node.kind == GranteeKind::Role {
                stack.extend(node.grantees.iter().copied());
            }
        }
    }

    fn recompute_effective(&mut self, id: GranteeId) {
        let (mut effective, roles) = {
            let node = &self.nodes[&id];
            (
                node.direct.clone(),
                node.roles.iter().copied().collect::<Vec<_>>(),
            )
        };
        for role_id in roles {
            for (key, object) in &self.nodes[&role_id].effective {
                match effective.entry(*key) {
                    Entry::Occupied(mut entry) => entry.get_mut().grant(object.privileges()),
                    Entry::Vacant(entry) => {
                        entry.insert(object.clone());
                    }
                }
            }
        }
        // empty entries are purged rather than cached
        effective.retain(|_, object| object.privileges().has_any());
        self.nodes.get_mut(&id).unwrap().effective = effective;
    }

    fn find_object(
        node: &GranteeNode,
        key: &DBObjectKey,
        only_direct: bool,
    ) -> Option<DBObject> {
        node.objects(only_direct).get(key).cloned()
    }

    /// True iff every requested privilege bit is covered by some entry in
    /// the widening sequence of the requested key.
    pub fn check_privileges(&self, id: GranteeId, requested: &DBObject) -> CatalogResult<bool> {
        let node = self.node(id)?;
        Ok(requested.key().widening_sequence().any(|key| {
            Self::find_object(node, &key, false)
                .map(|found| found.privileges().contains(requested.privileges()))
                .unwrap_or(false)
        }))
    }

    /// [`PrivilegeGraph::check_privileges`] as an error for `?` callers.
    pub fn ensure_privileges(&self, id: GranteeId, requested: &DBObject) -> CatalogResult<()> {
        if self.check_privileges(id, requested)? {
            Ok(())
        } else {
            Err(CatalogError::PermissionDenied(
                self.node(id)?.name.clone(),
                requested.name().to_string(),
            ))
        }
    }

    /// True iff the held and requested bitsets intersect on some widening
    /// of the key.
    pub fn has_any_privileges(
        &self,
        id: GranteeId,
        requested: &DBObject,
        only_direct: bool,
    ) -> CatalogResult<bool> {
        let node = self.node(id)?;
        Ok(requested.key().widening_sequence().any(|key| {
            Self::find_object(node, &key, only_direct)
                .map(|found| found.privileges().intersects(requested.privileges()))
                .unwrap_or(false)
        }))
    }

    pub fn has_any_privileges_on_db(
        &self,
        id: GranteeId,
        db_id: i32,
        only_direct: bool,
    ) -> CatalogResult<bool> {
        let node = self.node(id)?;
        Ok(node
            .objects(only_direct)
            .keys()
            .any(|key| key.db_id == db_id))
    }

    /// The grantee's entry at exactly `key`, direct or effective.
    pub fn get_privileges(
        &self,
        id: GranteeId,
        key: &DBObjectKey,
        only_direct: bool,
    ) -> CatalogResult<DBObject> {
        let node = self.node(id)?;
        Self::find_object(node, key, only_direct).ok_or_else(|| {
            CatalogError::NotFound(
                "privileges",
                format!("{:?} for {}", key, node.name),
            )
        })
    }

    pub fn db_objects(
        &self,
        id: GranteeId,
        only_direct: bool,
    ) -> CatalogResult<&BTreeMap<DBObjectKey, DBObject>> {
        Ok(self.node(id)?.objects(only_direct))
    }

    /// Drops every entry scoped to `db_id` from both maps, here and (for a
    /// role) in every descendant.
    pub fn revoke_all_on_database(&mut self, id: GranteeId, db_id: i32) -> CatalogResult<()> {
        self.node(id)?;
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let node = self.nodes.get_mut(&current).unwrap();
            node.direct.retain(|key, _| key.db_id != db_id);
            node.effective.retain(|key, _| key.db_id != db_id);
            self.update_privileges(current);
            let node = &self.nodes[&current];
            if node.kind == GranteeKind::Role {
                stack.extend(node.grantees.iter().copied());
            }
        }
        Ok(())
    }

    /// Updates the cached object name in both maps, recursing through a
    /// role's descendants.
    pub fn rename_db_object(&mut self, id: GranteeId, renamed: &DBObject) -> CatalogResult<()> {
        self.node(id)?;
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let node = self.nodes.get_mut(&current).unwrap();
            if let Some(entry) = node.direct.get_mut(&renamed.key()) {
                entry.set_name(renamed.name());
            }
            if let Some(entry) = node.effective.get_mut(&renamed.key()) {
                entry.set_name(renamed.name());
            }
            if node.kind == GranteeKind::Role {
                stack.extend(node.grantees.iter().copied());
            }
        }
        Ok(())
    }

    /// Rewrites `owner` on every concrete (non-wildcard) entry of `db_id`
    /// whose owner is in `old_owner_ids`.
    pub fn reassign_object_owners(
        &mut self,
        id: GranteeId,
        old_owner_ids: &BTreeSet<i32>,
        new_owner_id: i32,
        db_id: i32,
    ) -> CatalogResult<()> {
        let node = self.node_mut(id)?;
        for map in [&mut node.direct, &mut node.effective] {
            for (key, object) in map.iter_mut() {
                if key.object_id != super::object::WILDCARD_ID
                    && key.db_id == db_id
                    && old_owner_ids.contains(&object.owner())
                {
                    object.set_owner(new_owner_id);
                }
            }
        }
        Ok(())
    }

    /// Rewrites `owner` on the entry at exactly `key` in both maps.
    pub fn reassign_object_owner(
        &mut self,
        id: GranteeId,
        key: &DBObjectKey,
        new_owner_id: i32,
    ) -> CatalogResult<()> {
        let node = self.node_mut(id)?;
        for map in [&mut node.direct, &mut node.effective] {
            if let Some(object) = map.get_mut(key) {
                object.set_owner(new_owner_id);
            }
        }
        Ok(())
    }

    /// Role names granted to the grantee: exactly the direct ones, or the
    /// full transitive closure. Sorted for human readers.
    pub fn get_roles(&self, id: GranteeId, only_direct: bool) -> CatalogResult<Vec<String>> {
        let node = self.node(id)?;
        if only_direct {
            return Ok(node
                .roles
                .iter()
                .map(|role| self.nodes[role].name.clone())
                .sorted()
                .collect());
        }
        let mut names = BTreeSet::new();
        let mut stack: Vec<GranteeId> = node.roles.iter().copied().collect();
        while let Some(role) = stack.pop() {
            if names.insert(self.nodes[&role].name.clone()) {
                stack.extend(self.nodes[&role].roles.iter().copied());
            }
        }
        Ok(names.into_iter().collect())
    }

    /// Whether `role` is granted to the grantee, directly or transitively.
    pub fn has_role(
        &self,
        id: GranteeId,
        role: GranteeId,
        only_direct: bool,
    ) -> CatalogResult<bool> {
        let node = self.node(id)?;
        if only_direct {
            return Ok(node.roles.contains(&role));
        }
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if current == role {
                return Ok(true);
            }
            stack.extend(self.nodes[&current].roles.iter().copied());
        }
        Ok(false)
    }

    /// Members of the role, one edge out.
    pub fn grantees_of(&self, role: GranteeId) -> CatalogResult<Vec<GranteeId>> {
        Ok(self.node(role)?.grantees.iter().copied().collect())
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        use super::object::AccessPrivileges;
        for (id, node) in &self.nodes {
            // bidirectional edge consistency
            for role in &node.roles {
                assert!(self.nodes[role].grantees.contains(id));
            }
            for grantee in &node.grantees {
                assert_eq!(node.kind, GranteeKind::Role);
                assert!(self.nodes[grantee].roles.contains(id));
            }
            // effective = direct union over inbound roles, per key
            let mut expected: BTreeMap<DBObjectKey, AccessPrivileges> = BTreeMap::new();
            for (key, object) in &node.direct {
                *expected
                    .entry(*key)
                    .or_insert(AccessPrivileges::empty()) |= object.privileges();
            }
            for role in &node.roles {
                for (key, object) in &self.nodes[role].effective {
                    *expected
                        .entry(*key)
                        .or_insert(AccessPrivileges::empty()) |= object.privileges();
                }
            }
            expected.retain(|_, privileges| privileges.has_any());
            let actual: BTreeMap<DBObjectKey, AccessPrivileges> = node
                .effective
                .iter()
                .map(|(key, object)| (*key, object.privileges()))
                .collect();
            assert_eq!(actual, expected, "effective map of {} diverged", node.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::object::{AccessPrivileges, PermissionType, WILDCARD_ID};
    use super::*;

    fn table_object(db_id: i32, object_id: i32, privileges: AccessPrivileges) -> DBObject {
        DBObject::new(
            DBObjectKey::new(PermissionType::Table, db_id, object_id),
            format!("table_{}", object_id),
            0,
            privileges,
        )
    }

    #[test]
    fn test_transitive_grant_and_revoke() {
        let mut graph = PrivilegeGraph::new();
        let reader = graph.create_role("reader").unwrap();
        let alice = graph.create_user("alice").unwrap();

        let select_t = table_object(1, 7, AccessPrivileges::SELECT);
        graph.grant_privileges(reader, &select_t).unwrap();
        graph.grant_role(alice, reader).unwrap();
        assert!(graph.check_privileges(alice, &select_t).unwrap());
        graph.assert_consistent();

        graph.revoke_role(alice, reader).unwrap();
        assert!(!graph.check_privileges(alice, &select_t).unwrap());
        graph.assert_consistent();
    }

    #[test]
    fn test_wildcard_covers_narrower_key() {
        let mut graph = PrivilegeGraph::new();
        let bob = graph.create_user("bob").unwrap();
        graph
            .grant_privileges(bob, &table_object(1, WILDCARD_ID, AccessPrivileges::SELECT))
            .unwrap();
        assert!(graph
            .check_privileges(bob, &table_object(1, 42, AccessPrivileges::SELECT))
            .unwrap());
        assert!(!graph
            .check_privileges(bob, &table_object(2, 42, AccessPrivileges::SELECT))
            .unwrap());
        // subset semantics: asking for more bits fails
        assert!(!graph
            .check_privileges(
                bob,
                &table_object(1, 42, AccessPrivileges::SELECT | AccessPrivileges::INSERT)
            )
            .unwrap());
    }

    #[test]
    fn test_self_grant_is_a_cycle() {
        let mut graph = PrivilegeGraph::new();
        let role = graph.create_role("r").unwrap();
        assert!(matches!(
            graph.grant_role(role, role),
            Err(CatalogError::CycleDetected(..))
        ));
    }

    #[test]
    fn test_three_role_cycle_rejected_and_state_unchanged() {
        let mut graph = PrivilegeGraph::new();
        let r1 = graph.create_role("r1").unwrap();
        let r2 = graph.create_role("r2").unwrap();
        let r3 = graph.create_role("r3").unwrap();
        graph.grant_role(r2, r1).unwrap();
        graph.grant_role(r3, r2).unwrap();
        assert!(matches!(
            graph.grant_role(r1, r3),
            Err(CatalogError::CycleDetected(..))
        ));
        // the failed grant left no half-inserted edge behind
        assert!(!graph.has_role(r1, r3, true).unwrap());
        assert!(graph.grantees_of(r3).unwrap().is_empty());
        graph.assert_consistent();
    }

    #[test]
    fn test_duplicate_role_grant_fails() {
        let mut graph = PrivilegeGraph::new();
        let role = graph.create_role("r").unwrap();
        let user = graph.create_user("u").unwrap();
        graph.grant_role(user, role).unwrap();
        assert!(matches!(
            graph.grant_role(user, role),
            Err(CatalogError::Duplicated(..))
        ));
    }

    #[test]
    fn test_user_cannot_be_granted_as_role() {
        let mut graph = PrivilegeGraph::new();
        let u1 = graph.create_user("u1").unwrap();
        let u2 = graph.create_user("u2").unwrap();
        assert!(matches!(
            graph.grant_role(u1, u2),
            Err(CatalogError::NotARole(_))
        ));
    }

    #[test]
    fn test_grant_revoke_is_identity() {
        let mut graph = PrivilegeGraph::new();
        let user = graph.create_user("u").unwrap();
        let before_direct = graph.db_objects(user, true).unwrap().clone();
        let before_effective = graph.db_objects(user, false).unwrap().clone();

        let object = table_object(1, 7, AccessPrivileges::SELECT | AccessPrivileges::INSERT);
        graph.grant_privileges(user, &object).unwrap();
        assert_eq!(graph.revoke_privileges(user, &object).unwrap(), None);

        assert_eq!(*graph.db_objects(user, true).unwrap(), before_direct);
        assert_eq!(*graph.db_objects(user, false).unwrap(), before_effective);
        graph.assert_consistent();
    }

    #[test]
    fn test_partial_revoke_returns_residual() {
        let mut graph = PrivilegeGraph::new();
        let user = graph.create_user("u").unwrap();
        graph
            .grant_privileges(
                user,
                &table_object(1, 7, AccessPrivileges::SELECT | AccessPrivileges::INSERT),
            )
            .unwrap();
        let residual = graph
            .revoke_privileges(user, &table_object(1, 7, AccessPrivileges::INSERT))
            .unwrap()
            .unwrap();
        assert_eq!(residual.privileges(), AccessPrivileges::SELECT);
    }

    #[test]
    fn test_revoke_absent_entry_fails() {
        let mut graph = PrivilegeGraph::new();
        let user = graph.create_user("u").unwrap();
        assert!(matches!(
            graph.revoke_privileges(user, &table_object(1, 7, AccessPrivileges::SELECT)),
            Err(CatalogError::NotFound(..))
        ));
    }

    #[test]
    fn test_diamond_inheritance_unions_bits() {
        let mut graph = PrivilegeGraph::new();
        let top = graph.create_role("top").unwrap();
        let left = graph.create_role("left").unwrap();
        let right = graph.create_role("right").unwrap();
        let user = graph.create_user("u").unwrap();

        graph.grant_role(left, top).unwrap();
        graph.grant_role(right, top).unwrap();
        graph.grant_role(user, left).unwrap();
        graph.grant_role(user, right).unwrap();

        graph
            .grant_privileges(top, &table_object(1, 7, AccessPrivileges::SELECT))
            .unwrap();
        graph
            .grant_privileges(left, &table_object(1, 7, AccessPrivileges::INSERT))
            .unwrap();
        graph
            .grant_privileges(right, &table_object(1, 7, AccessPrivileges::DELETE))
            .unwrap();

        let effective = graph
            .get_privileges(
                user,
                &DBObjectKey::new(PermissionType::Table, 1, 7),
                false,
            )
            .unwrap();
        assert_eq!(
            effective.privileges(),
            AccessPrivileges::SELECT | AccessPrivileges::INSERT | AccessPrivileges::DELETE
        );
        graph.assert_consistent();

        // removing the top grant drains through both paths
        graph
            .revoke_privileges(top, &table_object(1, 7, AccessPrivileges::SELECT))
            .unwrap();
        assert!(!graph
            .check_privileges(user, &table_object(1, 7, AccessPrivileges::SELECT))
            .unwrap());
        graph.assert_consistent();
    }

    #[test]
    fn test_revoke_all_on_database_recurses() {
        let mut graph = PrivilegeGraph::new();
        let role = graph.create_role("r").unwrap();
        let user = graph.create_user("u").unwrap();
        graph.grant_role(user, role).unwrap();
        graph
            .grant_privileges(role, &table_object(1, 7, AccessPrivileges::SELECT))
            .unwrap();
        graph
            .grant_privileges(user, &table_object(1, 8, AccessPrivileges::INSERT))
            .unwrap();
        graph
            .grant_privileges(user, &table_object(2, 1, AccessPrivileges::SELECT))
            .unwrap();

        graph.revoke_all_on_database(role, 1).unwrap();
        // NB: the role's descendants lose db 1 entirely, even direct grants
        assert!(!graph
            .check_privileges(user, &table_object(1, 8, AccessPrivileges::INSERT))
            .unwrap());
        assert!(graph
            .check_privileges(user, &table_object(2, 1, AccessPrivileges::SELECT))
            .unwrap());
        graph.assert_consistent();
    }

    #[test]
    fn test_rename_db_object_reaches_descendants() {
        let mut graph = PrivilegeGraph::new();
        let role = graph.create_role("r").unwrap();
        let user = graph.create_user("u").unwrap();
        graph.grant_role(user, role).unwrap();
        graph
            .grant_privileges(role, &table_object(1, 7, AccessPrivileges::SELECT))
            .unwrap();

        let mut renamed = table_object(1, 7, AccessPrivileges::SELECT);
        renamed.set_name("renamed_table");
        graph.rename_db_object(role, &renamed).unwrap();

        let key = DBObjectKey::new(PermissionType::Table, 1, 7);
        assert_eq!(
            graph.get_privileges(user, &key, false).unwrap().name(),
            "renamed_table"
        );
    }

    #[test]
    fn test_reassign_object_owner() {
        let mut graph = PrivilegeGraph::new();
        let user = graph.create_user("u").unwrap();
        let mut object = table_object(1, 7, AccessPrivileges::SELECT);
        object.set_owner(3);
        graph.grant_privileges(user, &object).unwrap();

        graph
            .reassign_object_owners(user, &BTreeSet::from([3]), 9, 1)
            .unwrap();
        let key = DBObjectKey::new(PermissionType::Table, 1, 7);
        assert_eq!(graph.get_privileges(user, &key, true).unwrap().owner(), 9);
        assert_eq!(graph.get_privileges(user, &key, false).unwrap().owner(), 9);
    }

    #[test]
    fn test_get_roles_direct_vs_transitive() {
        let mut graph = PrivilegeGraph::new();
        let outer = graph.create_role("outer").unwrap();
        let inner = graph.create_role("inner").unwrap();
        let user = graph.create_user("u").unwrap();
        graph.grant_role(inner, outer).unwrap();
        graph.grant_role(user, inner).unwrap();

        assert_eq!(graph.get_roles(user, true).unwrap(), vec!["inner"]);
        assert_eq!(
            graph.get_roles(user, false).unwrap(),
            vec!["inner", "outer"]
        );
        assert!(graph.has_role(user, outer, false).unwrap());
        assert!(!graph.has_role(user, outer, true).unwrap());
    }

    #[test]
    fn test_drop_role_detaches_members() {
        let mut graph = PrivilegeGraph::new();
        let role = graph.create_role("r").unwrap();
        let user = graph.create_user("u").unwrap();
        graph.grant_role(user, role).unwrap();
        graph
            .grant_privileges(role, &table_object(1, 7, AccessPrivileges::SELECT))
            .unwrap();
        assert!(graph
            .check_privileges(user, &table_object(1, 7, AccessPrivileges::SELECT))
            .unwrap());

        graph.drop_grantee(role).unwrap();
        assert_eq!(graph.grantee_id("r"), None);
        assert!(!graph
            .check_privileges(user, &table_object(1, 7, AccessPrivileges::SELECT))
            .unwrap());
        assert!(graph.get_roles(user, false).unwrap().is_empty());
        graph.assert_consistent();
    }

    #[test]
    fn test_has_any_privileges_direct_flag() {
        let mut graph = PrivilegeGraph::new();
        let role = graph.create_role("r").unwrap();
        let user = graph.create_user("u").unwrap();
        graph.grant_role(user, role).unwrap();
        graph
            .grant_privileges(role, &table_object(1, 7, AccessPrivileges::SELECT))
            .unwrap();

        let probe = table_object(1, 7, AccessPrivileges::SELECT | AccessPrivileges::DELETE);
        // inherited privileges show up effective-only
        assert!(graph.has_any_privileges(user, &probe, false).unwrap());
        assert!(!graph.has_any_privileges(user, &probe, true).unwrap());
        // no overlap with the held bits at all
        let disjoint = table_object(1, 7, AccessPrivileges::DELETE);
        assert!(!graph.has_any_privileges(user, &disjoint, false).unwrap());
        assert!(graph.has_any_privileges_on_db(user, 1, false).unwrap());
        assert!(!graph.has_any_privileges_on_db(user, 2, false).unwrap());
    }

    #[test]
    fn test_ensure_privileges_denies() {
        let mut graph = PrivilegeGraph::new();
        let user = graph.create_user("u").unwrap();
        let err = graph
            .ensure_privileges(user, &table_object(1, 7, AccessPrivileges::SELECT))
            .unwrap_err();
        assert!(matches!(err, CatalogError::PermissionDenied(..)));
    }
}
