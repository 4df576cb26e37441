//! Channel membership roster.
//!
//! A roster keeps three sets (members, local-pending, remote-pending) and
//! only changes through [`Roster::apply`], which moves every handle of a
//! [`MembersDelta`] to its new place and reports the effective change. A
//! handle is in at most one set at any time.

use std::collections::BTreeMap;

use serde::Serialize;

use super::handle::{Handle, HandleId};

/// Why a membership change happened.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeReason {
    #[default]
    None,
    Offline,
    Kicked,
    Busy,
    Invited,
    Banned,
    Error,
    InvalidContact,
    NoAnswer,
    Renamed,
    PermissionDenied,
    Separated,
}

/// Where a handle sits in a roster.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Placement {
    Member,
    /// Waiting for the local user to accept.
    LocalPending,
    /// Waiting for the remote side to accept.
    RemotePending,
}

/// A requested roster mutation.
#[derive(Clone, Debug, Default)]
pub struct MembersDelta {
    pub added: Vec<Handle>,
    pub removed: Vec<Handle>,
    pub local_pending: Vec<Handle>,
    pub remote_pending: Vec<Handle>,
    pub actor: Option<Handle>,
    pub reason: ChangeReason,
    pub message: String,
}

impl MembersDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, handle: Handle) -> Self {
        self.added.push(handle);
        self
    }

    pub fn add_all(mut self, handles: impl IntoIterator<Item = Handle>) -> Self {
        self.added.extend(handles);
        self
    }

    pub fn remove(mut self, handle: Handle) -> Self {
        self.removed.push(handle);
        self
    }

    pub fn local_pending(mut self, handle: Handle) -> Self {
        self.local_pending.push(handle);
        self
    }

    pub fn remote_pending(mut self, handle: Handle) -> Self {
        self.remote_pending.push(handle);
        self
    }

    /// Put `handle` wherever `placement` says, or remove it.
    pub fn place(self, handle: Handle, placement: Option<Placement>) -> Self {
        match placement {
            Some(Placement::Member) => self.add(handle),
            Some(Placement::LocalPending) => self.local_pending(handle),
            Some(Placement::RemotePending) => self.remote_pending(handle),
            None => self.remove(handle),
        }
    }

    pub fn actor(mut self, actor: Handle) -> Self {
        self.actor = Some(actor);
        self
    }

    pub fn reason(mut self, reason: ChangeReason) -> Self {
        self.reason = reason;
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.local_pending.is_empty()
            && self.remote_pending.is_empty()
    }
}

/// The effective result of applying a delta, as observers see it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MembersChange {
    pub message: String,
    pub added: Vec<HandleId>,
    pub removed: Vec<HandleId>,
    pub local_pending: Vec<HandleId>,
    pub remote_pending: Vec<HandleId>,
    pub actor: HandleId,
    pub reason: ChangeReason,
}

impl MembersChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.local_pending.is_empty()
            && self.remote_pending.is_empty()
    }
}

#[derive(Clone, Debug, Default)]
pub struct Roster {
    members: BTreeMap<HandleId, Handle>,
    local_pending: BTreeMap<HandleId, Handle>,
    remote_pending: BTreeMap<HandleId, Handle>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn placement(&self, id: HandleId) -> Option<Placement> {
        if self.members.contains_key(&id) {
            Some(Placement::Member)
        } else if self.local_pending.contains_key(&id) {
            Some(Placement::LocalPending)
        } else if self.remote_pending.contains_key(&id) {
            Some(Placement::RemotePending)
        } else {
            None
        }
    }

    pub fn is_member(&self, id: HandleId) -> bool {
        self.members.contains_key(&id)
    }

    pub fn members(&self) -> impl Iterator<Item = &Handle> {
        self.members.values()
    }

    pub fn local_pending(&self) -> impl Iterator<Item = &Handle> {
        self.local_pending.values()
    }

    pub fn remote_pending(&self) -> impl Iterator<Item = &Handle> {
        self.remote_pending.values()
    }

    /// Every handle in any of the three sets.
    pub fn everyone(&self) -> impl Iterator<Item = &Handle> {
        self.members()
            .chain(self.local_pending())
            .chain(self.remote_pending())
    }

    pub fn member_ids(&self) -> Vec<HandleId> {
        self.members.keys().copied().collect()
    }

    pub fn local_pending_ids(&self) -> Vec<HandleId> {
        self.local_pending.keys().copied().collect()
    }

    pub fn remote_pending_ids(&self) -> Vec<HandleId> {
        self.remote_pending.keys().copied().collect()
    }

    fn take(&mut self, id: HandleId) {
        self.members.remove(&id);
        self.local_pending.remove(&id);
        self.remote_pending.remove(&id);
    }

    fn put(&mut self, handle: &Handle, placement: Option<Placement>) {
        let id = handle.id();
        self.take(id);
        let set = match placement {
            Some(Placement::Member) => &mut self.members,
            Some(Placement::LocalPending) => &mut self.local_pending,
            Some(Placement::RemotePending) => &mut self.remote_pending,
            None => return,
        };
        set.insert(id, handle.clone());
    }

    /// Apply `delta` atomically.
    ///
    /// Removals are applied first, then additions, then the pending sets,
    /// so a handle named twice ends up where its last mention puts it.
    /// Handles whose placement did not change are left out of the result.
    pub fn apply(&mut self, delta: MembersDelta) -> MembersChange {
        let mut touched: Vec<(Handle, Option<Placement>)> = Vec::new();
        let steps = [
            (delta.removed, None),
            (delta.added, Some(Placement::Member)),
            (delta.local_pending, Some(Placement::LocalPending)),
            (delta.remote_pending, Some(Placement::RemotePending)),
        ];
        for (handles, placement) in steps {
            for handle in handles {
                if !touched.iter().any(|(seen, _)| *seen == handle) {
                    touched.push((handle.clone(), self.placement(handle.id())));
                }
                self.put(&handle, placement);
            }
        }

        let mut change = MembersChange {
            message: delta.message,
            actor: delta.actor.map_or(HandleId::NONE, |a| a.id()),
            reason: delta.reason,
            ..MembersChange::default()
        };
        for (handle, before) in touched {
            let after = self.placement(handle.id());
            if before == after {
                continue;
            }
            let list = match after {
                Some(Placement::Member) => &mut change.added,
                Some(Placement::LocalPending) => &mut change.local_pending,
                Some(Placement::RemotePending) => &mut change.remote_pending,
                None => &mut change.removed,
            };
            list.push(handle.id());
        }
        change
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::handle::HandleRegistry;
    use imgate_account::ContactKey;

    fn handles(n: usize) -> (HandleRegistry, Vec<Handle>) {
        let mut reg = HandleRegistry::new(ContactKey::native("me@example.com"));
        let hs = (0..n)
            .map(|i| reg.contact(&ContactKey::native(format!("c{i}@example.com"))))
            .collect();
        (reg, hs)
    }

    fn assert_disjoint(roster: &Roster) {
        for h in roster.everyone() {
            let count = [
                roster.is_member(h.id()),
                roster.local_pending_ids().contains(&h.id()),
                roster.remote_pending_ids().contains(&h.id()),
            ]
            .iter()
            .filter(|b| **b)
            .count();
            assert_eq!(count, 1, "{h} appears in {count} sets");
        }
    }

    #[test]
    fn pending_then_member_moves_handle() {
        let (_reg, hs) = handles(1);
        let mut roster = Roster::new();
        let change = roster.apply(MembersDelta::new().remote_pending(hs[0].clone()));
        assert_eq!(change.remote_pending, vec![hs[0].id()]);

        let change = roster.apply(MembersDelta::new().add(hs[0].clone()));
        assert_eq!(change.added, vec![hs[0].id()]);
        assert!(change.remote_pending.is_empty());
        assert_eq!(roster.placement(hs[0].id()), Some(Placement::Member));
        assert!(roster.remote_pending_ids().is_empty());
    }

    #[test]
    fn no_op_delta_is_empty() {
        let (_reg, hs) = handles(2);
        let mut roster = Roster::new();
        roster.apply(MembersDelta::new().add(hs[0].clone()));
        let change = roster.apply(
            MembersDelta::new()
                .add(hs[0].clone())
                .remove(hs[1].clone()),
        );
        assert!(change.is_empty());
    }

    #[test]
    fn last_mention_wins() {
        let (_reg, hs) = handles(1);
        let mut roster = Roster::new();
        let change = roster.apply(
            MembersDelta::new()
                .add(hs[0].clone())
                .local_pending(hs[0].clone()),
        );
        assert_eq!(change.local_pending, vec![hs[0].id()]);
        assert!(change.added.is_empty());
        assert_disjoint(&roster);
    }

    #[test]
    fn actor_and_reason_are_reported() {
        let (reg, hs) = handles(1);
        let mut roster = Roster::new();
        let change = roster.apply(
            MembersDelta::new()
                .add(hs[0].clone())
                .actor(reg.self_handle())
                .reason(ChangeReason::Invited)
                .message("welcome"),
        );
        assert_eq!(change.actor, reg.self_handle().id());
        assert_eq!(change.reason, ChangeReason::Invited);
        assert_eq!(change.message, "welcome");
    }

    #[test]
    fn sets_stay_disjoint_under_mixed_deltas() {
        let (_reg, hs) = handles(4);
        let mut roster = Roster::new();
        let placements = [
            Some(Placement::Member),
            Some(Placement::LocalPending),
            Some(Placement::RemotePending),
            None,
        ];
        for round in 0..12 {
            let mut delta = MembersDelta::new();
            for (i, h) in hs.iter().enumerate() {
                delta = delta.place(h.clone(), placements[(round + i) % placements.len()]);
            }
            roster.apply(delta);
            assert_disjoint(&roster);
        }
    }

    #[test]
    fn default_change_is_empty() {
        let change = MembersChange::default();
        assert!(change.is_empty());
        assert_eq!(change.actor, HandleId::default());
        assert_eq!(change.reason, ChangeReason::default());
    }
}
