//! Contact and self aliases.
//!
//! The account only stores aliases for contacts on the forward list, so an
//! alias set for anyone else is parked until their memberships change.

use std::collections::HashMap;

use imgate_account::{AccountClient, Contact, ContactKey, Memberships, Profile};
use tracing::debug;

/// Alias shown for the local user.
pub fn self_alias(profile: &Profile) -> String {
    if !profile.display_name.is_empty() {
        return profile.display_name.clone();
    }
    let local = profile
        .account
        .split_once('@')
        .map_or(profile.account.as_str(), |(local, _)| local);
    local.replace('_', " ")
}

/// Alias shown for a contact: nickname, then display name, then the id.
pub fn contact_alias(key: &ContactKey, contact: Option<&Contact>) -> String {
    contact
        .and_then(|c| {
            c.nickname
                .clone()
                .filter(|n| !n.is_empty())
                .or_else(|| Some(c.display_name.clone()).filter(|n| !n.is_empty()))
        })
        .unwrap_or_else(|| key.to_string())
}

#[derive(Debug, Default)]
pub struct Aliasing {
    pending: HashMap<ContactKey, String>,
}

impl Aliasing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a contact alias, or park it until the contact is on the forward
    /// list. An alias equal to the contact id clears the alias.
    pub fn set_contact(&mut self, account: &mut dyn AccountClient, key: &ContactKey, alias: &str) {
        let alias = if alias == key.to_string() { "" } else { alias };
        let forward = account
            .contact(key)
            .is_some_and(|c| c.memberships.contains(Memberships::FORWARD));
        if forward {
            self.pending.remove(key);
            account.set_contact_alias(key, alias);
        } else {
            debug!(contact = %key, "alias parked until contact is on the forward list");
            self.pending.insert(key.clone(), alias.to_string());
        }
    }

    /// Apply a parked alias once the contact reached the forward list.
    pub fn memberships_changed(&mut self, account: &mut dyn AccountClient, key: &ContactKey) {
        let forward = account
            .contact(key)
            .is_some_and(|c| c.memberships.contains(Memberships::FORWARD));
        if forward && let Some(alias) = self.pending.remove(key) {
            debug!(contact = %key, "applying parked alias");
            account.set_contact_alias(key, &alias);
        }
    }

    pub fn is_pending(&self, key: &ContactKey) -> bool {
        self.pending.contains_key(key)
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imgate_account::{MemoryAccount, Outbound};

    #[test]
    fn self_alias_falls_back_to_local_part() {
        let profile = Profile {
            account: "john_smith@example.com".into(),
            ..Profile::default()
        };
        assert_eq!(self_alias(&profile), "john smith");
    }

    #[test]
    fn contact_alias_prefers_nickname() {
        let key = ContactKey::native("bob@example.com");
        let mut contact = Contact::new(key.clone()).with_display_name("Bobby");
        assert_eq!(contact_alias(&key, Some(&contact)), "Bobby");
        contact.nickname = Some("Bob the builder".into());
        assert_eq!(contact_alias(&key, Some(&contact)), "Bob the builder");
        assert_eq!(contact_alias(&key, None), "bob@example.com");
    }

    #[test]
    fn alias_is_parked_until_forward() {
        let memory = MemoryAccount::new("me@example.com");
        let mut account = memory.clone();
        let key = ContactKey::native("bob@example.com");
        let mut aliasing = Aliasing::new();

        aliasing.set_contact(&mut account, &key, "Bob");
        assert!(aliasing.is_pending(&key));
        assert!(memory.outbound().is_empty());

        memory.insert_contact(Contact::new(key.clone()).with_memberships(Memberships::FORWARD));
        aliasing.memberships_changed(&mut account, &key);
        assert!(!aliasing.is_pending(&key));
        assert_eq!(
            memory.outbound(),
            vec![Outbound::SetContactAlias {
                contact: key,
                alias: "Bob".into(),
            }]
        );
    }

    #[test]
    fn alias_equal_to_id_clears() {
        let memory = MemoryAccount::new("me@example.com");
        let mut account = memory.clone();
        let key = ContactKey::native("bob@example.com");
        memory.insert_contact(Contact::new(key.clone()).with_memberships(Memberships::FORWARD));

        Aliasing::new().set_contact(&mut account, &key, "bob@example.com");
        assert_eq!(
            memory.outbound(),
            vec![Outbound::SetContactAlias {
                contact: key,
                alias: String::new(),
            }]
        );
    }
}
