//! Handle registry: interned identity tokens for contacts, lists and groups.
//!
//! For one connection, every (type, natural key) pair maps to exactly one
//! [`Handle`]. Handles are shared via `Arc`; the registry keeps one clone
//! and [`HandleRegistry::sweep`] drops entries nobody else holds and no
//! client has asked to keep.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use imgate_account::ContactKey;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{GatewayError, GatewayResult};

/// The kinds of entity a handle can name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleType {
    None,
    Contact,
    List,
    Group,
}

impl HandleType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Contact => "contact",
            Self::List => "list",
            Self::Group => "group",
        }
    }
}

impl FromStr for HandleType {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "contact" => Ok(Self::Contact),
            "list" => Ok(Self::List),
            "group" => Ok(Self::Group),
            other => Err(GatewayError::invalid_argument(format!(
                "unknown handle type '{other}'"
            ))),
        }
    }
}

/// Numeric handle id. Zero stands for "no handle".
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct HandleId(pub u32);

impl HandleId {
    pub const NONE: HandleId = HandleId(0);
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server-side contact lists exposed as channels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ListName {
    /// Contacts whose presence we receive.
    Subscribe,
    /// Contacts who receive our presence.
    Publish,
    /// Blocked contacts.
    Deny,
}

impl ListName {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Publish => "publish",
            Self::Deny => "deny",
        }
    }
}

impl FromStr for ListName {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "subscribe" => Ok(Self::Subscribe),
            "publish" => Ok(Self::Publish),
            "deny" => Ok(Self::Deny),
            other => Err(GatewayError::InvalidHandle(format!("unknown list '{other}'"))),
        }
    }
}

/// Natural key a handle is interned under.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum HandleKey {
    Contact(ContactKey),
    List(ListName),
    /// Lowercased group name; groups match case-insensitively.
    Group(String),
}

impl HandleKey {
    pub fn handle_type(&self) -> HandleType {
        match self {
            Self::Contact(_) => HandleType::Contact,
            Self::List(_) => HandleType::List,
            Self::Group(_) => HandleType::Group,
        }
    }
}

#[derive(Debug)]
struct HandleData {
    id: HandleId,
    key: HandleKey,
    name: String,
}

/// An interned identity token.
#[derive(Clone, Debug)]
pub struct Handle(Arc<HandleData>);

impl Handle {
    pub fn id(&self) -> HandleId {
        self.0.id
    }

    pub fn handle_type(&self) -> HandleType {
        self.0.key.handle_type()
    }

    /// Display name: contact id, list name or group name as first seen.
    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn key(&self) -> &HandleKey {
        &self.0.key
    }

    pub fn contact_key(&self) -> Option<&ContactKey> {
        match &self.0.key {
            HandleKey::Contact(key) => Some(key),
            _ => None,
        }
    }

    pub fn list_name(&self) -> Option<ListName> {
        match self.0.key {
            HandleKey::List(list) => Some(list),
            _ => None,
        }
    }
}

impl PartialEq for Handle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Handle {}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.handle_type().as_str(), self.0.name)
    }
}

/// Interns handles for one connection.
pub struct HandleRegistry {
    next_id: u32,
    by_key: HashMap<HandleKey, Handle>,
    by_id: HashMap<(HandleType, HandleId), HandleKey>,
    /// Explicit holds taken by clients through `request_handles`.
    holds: HashMap<(HandleType, HandleId), u32>,
    /// Contact ids named in presence, alias or capability signals. They
    /// stay resolvable until the connection drops.
    published: HashSet<HandleId>,
    self_handle: Handle,
}

impl HandleRegistry {
    /// Create a registry whose self handle names `account`.
    pub fn new(account: ContactKey) -> Self {
        let mut by_key = HashMap::new();
        let mut by_id = HashMap::new();
        let key = HandleKey::Contact(account.clone());
        let self_handle = Handle(Arc::new(HandleData {
            id: HandleId(1),
            key: key.clone(),
            name: account.to_string(),
        }));
        by_id.insert((HandleType::Contact, HandleId(1)), key.clone());
        by_key.insert(key, self_handle.clone());
        Self {
            next_id: 2,
            by_key,
            by_id,
            holds: HashMap::new(),
            published: HashSet::new(),
            self_handle,
        }
    }

    pub fn self_handle(&self) -> Handle {
        self.self_handle.clone()
    }

    pub fn is_self(&self, handle: &Handle) -> bool {
        *handle == self.self_handle
    }

    /// Return the handle for `key`, creating it on first reference.
    pub fn handle_for(&mut self, key: HandleKey) -> Handle {
        let name = match &key {
            HandleKey::Contact(contact) => contact.to_string(),
            HandleKey::List(list) => list.as_str().to_string(),
            HandleKey::Group(name) => name.clone(),
        };
        self.intern(key, name)
    }

    fn intern(&mut self, key: HandleKey, name: String) -> Handle {
        if let Some(handle) = self.by_key.get(&key) {
            return handle.clone();
        }
        let id = HandleId(self.next_id);
        self.next_id += 1;
        let kind = key.handle_type();
        debug!(handle = %id, kind = kind.as_str(), name = %name, "handle created");
        let handle = Handle(Arc::new(HandleData {
            id,
            key: key.clone(),
            name,
        }));
        self.by_id.insert((kind, id), key.clone());
        self.by_key.insert(key, handle.clone());
        handle
    }

    pub fn contact(&mut self, key: &ContactKey) -> Handle {
        self.handle_for(HandleKey::Contact(key.clone()))
    }

    pub fn list(&mut self, list: ListName) -> Handle {
        self.handle_for(HandleKey::List(list))
    }

    /// Group handles match case-insensitively but keep the first spelling.
    pub fn group(&mut self, name: &str) -> Handle {
        self.intern(HandleKey::Group(name.to_lowercase()), name.to_string())
    }

    /// Contact handle whose id is about to reach observers.
    pub fn published_contact(&mut self, key: &ContactKey) -> Handle {
        let handle = self.contact(key);
        self.published.insert(handle.id());
        handle
    }

    /// Let published contacts be swept again.
    pub fn forget_published(&mut self) {
        self.published.clear();
    }

    /// Look up a contact handle without creating one.
    pub fn find_contact(&self, key: &ContactKey) -> Option<Handle> {
        self.by_key.get(&HandleKey::Contact(key.clone())).cloned()
    }

    /// Intern a handle from its client-visible name.
    pub fn parse(&mut self, kind: HandleType, name: &str) -> GatewayResult<Handle> {
        match kind {
            HandleType::Contact => {
                let key: ContactKey = name.parse()?;
                Ok(self.contact(&key))
            }
            HandleType::List => Ok(self.list(name.parse()?)),
            HandleType::Group => {
                let name = name.trim();
                if name.is_empty() {
                    return Err(GatewayError::InvalidHandle("empty group name".into()));
                }
                Ok(self.group(name))
            }
            HandleType::None => Err(GatewayError::invalid_argument(
                "handles of type none cannot be requested",
            )),
        }
    }

    /// Resolve a client-supplied id.
    pub fn resolve(&self, kind: HandleType, id: HandleId) -> GatewayResult<Handle> {
        self.by_id
            .get(&(kind, id))
            .and_then(|key| self.by_key.get(key))
            .cloned()
            .ok_or_else(|| GatewayError::InvalidHandle(format!("{} handle {id}", kind.as_str())))
    }

    /// Keep `handle` alive on behalf of a client.
    pub fn hold(&mut self, handle: &Handle) {
        *self
            .holds
            .entry((handle.handle_type(), handle.id()))
            .or_insert(0) += 1;
    }

    /// Drop one client hold. The handle is reclaimed once unreferenced.
    pub fn release(&mut self, kind: HandleType, id: HandleId) -> GatewayResult<()> {
        let slot = (kind, id);
        match self.holds.get_mut(&slot) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                self.holds.remove(&slot);
            }
            None => {
                return Err(GatewayError::not_available(format!(
                    "{} handle {id} is not held",
                    kind.as_str()
                )));
            }
        }
        if let Some(key) = self.by_id.get(&slot).cloned() {
            let unused = self
                .by_key
                .get(&key)
                .is_some_and(|handle| self.reclaimable(handle));
            if unused {
                self.by_key.remove(&key);
                self.by_id.remove(&slot);
                debug!(handle = %id, "handle reclaimed");
            }
        }
        Ok(())
    }

    fn reclaimable(&self, handle: &Handle) -> bool {
        handle.id() != self.self_handle.id()
            && Arc::strong_count(&handle.0) == 1
            && !self.holds.contains_key(&(handle.handle_type(), handle.id()))
            && !(handle.handle_type() == HandleType::Contact
                && self.published.contains(&handle.id()))
    }

    /// Drop every handle that is neither held by a client, published, nor
    /// referenced outside the registry. Returns how many were reclaimed.
    pub fn sweep(&mut self) -> usize {
        let doomed: Vec<HandleKey> = self
            .by_key
            .iter()
            .filter(|(_, handle)| self.reclaimable(handle))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            if let Some(handle) = self.by_key.remove(key) {
                self.by_id.remove(&(handle.handle_type(), handle.id()));
                debug!(handle = %handle.id(), "handle reclaimed");
            }
        }
        doomed.len()
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> HandleRegistry {
        HandleRegistry::new(ContactKey::native("me@example.com"))
    }

    #[test]
    fn equal_keys_intern_to_one_handle() {
        let mut reg = registry();
        let a = reg.contact(&ContactKey::native("bob@example.com"));
        let b = reg.parse(HandleType::Contact, "Bob@Example.com").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn different_keys_never_collide() {
        let mut reg = registry();
        let native = reg.contact(&ContactKey::native("bob@example.com"));
        let external = reg.parse(HandleType::Contact, "bob@example.com#32").unwrap();
        let group = reg.group("bob@example.com");
        assert_ne!(native.id(), external.id());
        assert_ne!(native.id(), group.id());
        assert_ne!(reg.self_handle().id(), native.id());
    }

    #[test]
    fn groups_match_case_insensitively_and_keep_spelling() {
        let mut reg = registry();
        let first = reg.group("Friends");
        let second = reg.group("FRIENDS");
        assert_eq!(first.id(), second.id());
        assert_eq!(second.name(), "Friends");
    }

    #[test]
    fn resolve_unknown_id_is_invalid_handle() {
        let reg = registry();
        let err = reg.resolve(HandleType::Contact, HandleId(999)).unwrap_err();
        assert_eq!(err.error_code(), "invalid_handle");
    }

    #[test]
    fn resolve_checks_type() {
        let mut reg = registry();
        let list = reg.list(ListName::Subscribe);
        assert!(reg.resolve(HandleType::List, list.id()).is_ok());
        assert!(reg.resolve(HandleType::Group, list.id()).is_err());
    }

    #[test]
    fn unknown_list_name_is_rejected() {
        let mut reg = registry();
        assert!(reg.parse(HandleType::List, "stored").is_err());
        assert!(reg.parse(HandleType::None, "x").is_err());
    }

    #[test]
    fn unreferenced_handles_are_swept() {
        let mut reg = registry();
        let kept = reg.contact(&ContactKey::native("kept@example.com"));
        let id = reg.contact(&ContactKey::native("gone@example.com")).id();
        assert_eq!(reg.sweep(), 1);
        assert!(reg.resolve(HandleType::Contact, id).is_err());
        assert!(reg.resolve(HandleType::Contact, kept.id()).is_ok());
        assert!(reg.resolve(HandleType::Contact, reg.self_handle().id()).is_ok());
    }

    #[test]
    fn held_handles_survive_until_released() {
        let mut reg = registry();
        let handle = reg.contact(&ContactKey::native("bob@example.com"));
        let id = handle.id();
        reg.hold(&handle);
        drop(handle);
        assert_eq!(reg.sweep(), 0);
        reg.release(HandleType::Contact, id).unwrap();
        assert!(reg.resolve(HandleType::Contact, id).is_err());
        assert!(reg.release(HandleType::Contact, id).is_err());
    }

    #[test]
    fn release_only_reclaims_the_released_handle() {
        let mut reg = registry();
        let bob = reg.contact(&ContactKey::native("bob@example.com"));
        let bob_id = bob.id();
        reg.hold(&bob);
        drop(bob);
        let stray = reg.contact(&ContactKey::native("stray@example.com")).id();

        reg.release(HandleType::Contact, bob_id).unwrap();
        assert!(reg.resolve(HandleType::Contact, bob_id).is_err());
        assert!(reg.resolve(HandleType::Contact, stray).is_ok());
    }

    #[test]
    fn published_contacts_outlive_release_until_forgotten() {
        let mut reg = registry();
        let key = ContactKey::native("carol@example.com");
        let carol = reg.published_contact(&key);
        let id = carol.id();
        reg.hold(&carol);
        drop(carol);

        reg.release(HandleType::Contact, id).unwrap();
        assert!(reg.resolve(HandleType::Contact, id).is_ok());
        assert_eq!(reg.sweep(), 0);

        reg.forget_published();
        assert_eq!(reg.sweep(), 1);
        assert!(reg.resolve(HandleType::Contact, id).is_err());
    }
}
