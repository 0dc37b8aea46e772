//! Namespace registry and ACL checks (§4.7). "default" is universally
//! accessible and needs no registration; any other namespace referenced by
//! a write auto-creates with the writer as admin and all-permissive reads.

use std::collections::BTreeMap;

use crate::error::{CResult, Error};
use crate::value::{default_namespace, Action, Namespace, Permissions};

pub struct NamespaceManager {
    namespaces: BTreeMap<String, Namespace>,
}

impl Default for NamespaceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl NamespaceManager {
    pub fn new() -> Self {
        let mut namespaces = BTreeMap::new();
        let default = Namespace::default_namespace();
        namespaces.insert(default.id.clone(), default);
        NamespaceManager { namespaces }
    }

    pub fn create(&mut self, namespace: Namespace) -> CResult<()> {
        if self.namespaces.contains_key(&namespace.id) {
            return Err(Error::ValidationError(format!(
                "namespace '{}' already exists",
                namespace.id
            )));
        }
        self.namespaces.insert(namespace.id.clone(), namespace);
        Ok(())
    }

    /// Auto-create path used by the manager facade on write to an unknown
    /// namespace: creator gets admin, reads are all-permissive (empty read
    /// list means "anyone" per [`NamespaceManager::check`]).
    pub fn auto_create(&mut self, id: &str, creator: &str) -> &Namespace {
        self.namespaces.entry(id.to_string()).or_insert_with(|| {
            let mut permissions = Permissions::default();
            permissions.admin.insert(creator.to_string());
            permissions.write.insert(creator.to_string());
            permissions.delete.insert(creator.to_string());
            Namespace {
                id: id.to_string(),
                name: id.to_string(),
                description: None,
                permissions,
            }
        })
    }

    pub fn list(&self) -> Vec<Namespace> {
        self.namespaces.values().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<&Namespace> {
        self.namespaces.get(id)
    }

    pub fn rename(&mut self, id: &str, new_name: &str) -> CResult<()> {
        let ns = self
            .namespaces
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("namespace '{id}'")))?;
        ns.name = new_name.to_string();
        Ok(())
    }

    /// `has_items` is supplied by the caller (the manager, which owns the
    /// backend) since this registry tracks only namespace metadata.
    pub fn delete(&mut self, id: &str, force: bool, has_items: bool) -> CResult<()> {
        if id == default_namespace() {
            return Err(Error::PermissionDenied(
                "the default namespace cannot be deleted".into(),
            ));
        }
        if !self.namespaces.contains_key(id) {
            return Err(Error::NotFound(format!("namespace '{id}'")));
        }
        if has_items && !force {
            return Err(Error::ValidationError(format!(
                "namespace '{id}' still has items; pass force to delete anyway"
            )));
        }
        self.namespaces.remove(id);
        Ok(())
    }

    /// "default" is universally accessible. For any other namespace, an
    /// empty role list is treated as all-permissive (matches the
    /// auto-create policy's "all-permissive reads"); a non-empty list
    /// requires `principal` to be present, with admin implying every
    /// other action.
    pub fn check(&self, principal: &str, action: Action, namespace: &str) -> bool {
        if namespace == default_namespace() {
            return true;
        }
        let ns = match self.namespaces.get(namespace) {
            Some(ns) => ns,
            None => return true, // unknown namespace: permissive until auto-created
        };
        let roles = match action {
            Action::Read => &ns.permissions.read,
            Action::Write => &ns.permissions.write,
            Action::Delete => &ns.permissions.delete,
            Action::Admin => &ns.permissions.admin,
        };
        if roles.is_empty() || roles.contains(principal) {
            return true;
        }
        ns.permissions.admin.contains(principal)
    }
}
