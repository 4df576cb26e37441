//! Integration tests for contact-list and group channels.
//!
//! Rosters here follow the address book: local edits go out as account
//! commands and the roster only moves when the echoed events come back.

mod common;

use std::collections::BTreeSet;

use common::TestConnection;
use imgate::state::channels::ChannelKind;
use imgate::state::roster::MembersChange;
use imgate::state::{ChannelId, HandleId, HandleType, Signal};
use imgate_account::{
    AccountClient, AccountEvent, Contact, Group, GroupId, Memberships, Outbound, Presence,
};

const ALICE: &str = "alice@example.com";
const BOB: &str = "bob@example.com";
const CAROL: &str = "carol@example.com";

fn list_channel(t: &mut TestConnection, kind: HandleType, name: &str) -> ChannelId {
    let handle = t.handle(kind, name);
    t.conn
        .request_channel(ChannelKind::ContactList, kind, handle)
        .expect("list channel")
}

fn members_changed(signals: &[Signal], channel: ChannelId) -> Vec<MembersChange> {
    signals
        .iter()
        .filter_map(|s| match s {
            Signal::MembersChanged { channel: c, change } if *c == channel => Some(change.clone()),
            _ => None,
        })
        .collect()
}

/// A connection whose address book already holds one contact per list.
fn populated() -> TestConnection {
    let t = TestConnection::new();
    t.add_contact(
        ALICE,
        Presence::Online,
        Memberships::FORWARD | Memberships::ALLOW | Memberships::REVERSE,
    );
    t.add_contact(BOB, Presence::Online, Memberships::PENDING);
    t.add_contact(CAROL, Presence::Offline, Memberships::BLOCK);
    t
}

#[test]
fn lists_reflect_memberships_at_login() {
    let mut t = populated();
    t.connect();
    let signals = t.take_signals();

    let subscribe = list_channel(&mut t, HandleType::List, "subscribe");
    let publish = list_channel(&mut t, HandleType::List, "publish");
    let alice = t.contact(ALICE);
    let bob = t.contact(BOB);

    // Each list reports its initial roster exactly once.
    assert_eq!(members_changed(&signals, subscribe).len(), 1);
    assert_eq!(members_changed(&signals, publish).len(), 1);

    let members = t.conn.get_members(subscribe).unwrap();
    assert_eq!(members.members, vec![alice]);

    let members = t.conn.get_members(publish).unwrap();
    assert_eq!(members.members, vec![alice]);
    assert_eq!(members.local_pending, vec![bob]);
}

#[test]
fn deny_list_is_created_on_request() {
    let mut t = populated();
    t.connect();
    assert_eq!(t.conn.get_channels().unwrap().len(), 2);
    t.take_signals();

    let deny = list_channel(&mut t, HandleType::List, "deny");
    let carol = t.contact(CAROL);
    let signals = t.pump();
    assert_eq!(TestConnection::announced(&signals).len(), 1);
    assert_eq!(t.conn.get_members(deny).unwrap().members, vec![carol]);

    t.conn.remove_members(deny, &[carol], "").unwrap();
    let signals = t.pump();
    assert!(t
        .take_outbound()
        .contains(&Outbound::UnblockContact(TestConnection::key(CAROL))));
    assert_eq!(members_changed(&signals, deny)[0].removed, vec![carol]);
}

#[test]
fn adding_to_subscribe_follows_the_echo() {
    let mut t = TestConnection::connected();
    let subscribe = list_channel(&mut t, HandleType::List, "subscribe");
    let dave = t.contact("dave@example.com");
    t.take_signals();
    t.take_outbound();

    t.conn.add_members(subscribe, &[dave], "").unwrap();
    assert_eq!(
        t.take_outbound(),
        vec![Outbound::AddContact(TestConnection::key("dave@example.com"))]
    );
    let signals = t.pump();
    let changes = members_changed(&signals, subscribe);
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].added, vec![dave]);

    // Subscribed contacts can be messaged.
    let caps = t.conn.get_capabilities(&[dave]).unwrap();
    assert!(caps.iter().any(|c| c.channel_type == ChannelKind::Text));

    t.conn.remove_members(subscribe, &[dave], "").unwrap();
    let signals = t.pump();
    assert_eq!(members_changed(&signals, subscribe)[0].removed, vec![dave]);
}

#[test]
fn accepting_a_publish_request() {
    let mut t = populated();
    t.connect();
    let publish = list_channel(&mut t, HandleType::List, "publish");
    let bob = t.contact(BOB);
    t.take_signals();
    t.take_outbound();

    t.conn.add_members(publish, &[bob], "").unwrap();
    let signals = t.pump();
    assert_eq!(
        t.take_outbound(),
        vec![Outbound::AcceptInvitation(TestConnection::key(BOB))]
    );
    let changes = members_changed(&signals, publish);
    assert_eq!(changes[0].added, vec![bob]);
    assert!(t.conn.get_members(publish).unwrap().local_pending.is_empty());
}

#[test]
fn publish_only_accepts_people_who_asked() {
    let mut t = populated();
    t.connect();
    let publish = list_channel(&mut t, HandleType::List, "publish");
    let stranger = t.contact("mallory@example.com");

    let err = t.conn.add_members(publish, &[stranger], "").unwrap_err();
    assert_eq!(err.error_code(), "permission_denied");
}

#[test]
fn declining_a_publish_request_blocks() {
    let mut t = populated();
    t.connect();
    let publish = list_channel(&mut t, HandleType::List, "publish");
    let bob = t.contact(BOB);
    t.take_signals();
    t.take_outbound();

    t.conn.remove_members(publish, &[bob], "").unwrap();
    let signals = t.pump();
    assert_eq!(
        t.take_outbound(),
        vec![Outbound::DeclineInvitation(TestConnection::key(BOB))]
    );
    assert_eq!(members_changed(&signals, publish)[0].removed, vec![bob]);
}

#[test]
fn the_local_user_cannot_be_listed() {
    let mut t = TestConnection::connected();
    let subscribe = list_channel(&mut t, HandleType::List, "subscribe");
    let me = t.conn.self_handle();
    let err = t.conn.add_members(subscribe, &[me], "").unwrap_err();
    assert_eq!(err.error_code(), "permission_denied");
}

#[test]
fn list_members_must_be_contacts() {
    let mut t = TestConnection::connected();
    let subscribe = list_channel(&mut t, HandleType::List, "subscribe");
    let publish_handle: HandleId = t.handle(HandleType::List, "publish");
    let err = t
        .conn
        .add_members(subscribe, &[publish_handle], "")
        .unwrap_err();
    assert_eq!(err.error_code(), "invalid_handle");
}

#[test]
fn new_group_channel_creates_the_group() {
    let mut t = TestConnection::connected();
    t.online_contact(ALICE);
    let alice = t.contact(ALICE);
    t.take_signals();
    t.take_outbound();

    let friends = list_channel(&mut t, HandleType::Group, "Friends");
    // Members requested before the group exists are queued.
    t.conn.add_members(friends, &[alice], "").unwrap();
    let signals = t.pump();

    let group = t
        .account
        .groups()
        .into_iter()
        .find(|g| g.name == "Friends")
        .expect("group created");
    let outbound = t.take_outbound();
    assert_eq!(outbound[0], Outbound::AddGroup("Friends".to_string()));
    assert!(outbound.contains(&Outbound::AddToGroup {
        group: group.id.clone(),
        contact: TestConnection::key(ALICE),
    }));

    // The GroupAdded echo is adopted rather than announced again.
    assert_eq!(TestConnection::announced(&signals).len(), 1);
    assert_eq!(t.conn.get_members(friends).unwrap().members, vec![alice]);

    let signals = t.emit(AccountEvent::GroupContactDeleted {
        group: group.id.clone(),
        contact: TestConnection::key(ALICE),
    });
    assert!(signals.is_empty(), "roster follows the address book, not the event");

    t.conn.remove_members(friends, &[alice], "").unwrap();
    let signals = t.pump();
    assert_eq!(members_changed(&signals, friends)[0].removed, vec![alice]);
}

#[test]
fn existing_groups_are_announced_at_login() {
    let mut t = TestConnection::new();
    let work = GroupId("g-work".to_string());
    t.account.insert_group(Group {
        id: work.clone(),
        name: "Work".to_string(),
    });
    t.account.insert_contact(Contact {
        groups: BTreeSet::from([work.clone()]),
        ..Contact::new(TestConnection::key(ALICE))
            .with_memberships(Memberships::FORWARD)
            .with_presence(Presence::Online)
    });
    t.connect();
    let signals = t.take_signals();

    let announced = TestConnection::announced(&signals);
    let names: Vec<&str> = announced.iter().map(|c| c.target_id.as_str()).collect();
    assert_eq!(names, vec!["subscribe", "publish", "Work"]);
    let group_channel = announced[2].id;
    assert_eq!(announced[2].target_type, HandleType::Group);

    let alice = t.contact(ALICE);
    assert_eq!(
        t.conn.get_members(group_channel).unwrap().members,
        vec![alice]
    );

    // A group deleted elsewhere takes its channel with it.
    t.account.remove_group(&work);
    let signals = t.emit(AccountEvent::GroupDeleted(Group {
        id: work,
        name: "Work".to_string(),
    }));
    assert_eq!(
        signals,
        vec![Signal::Closed {
            channel: group_channel
        }]
    );
}

#[test]
fn group_added_elsewhere_gets_a_channel() {
    let mut t = TestConnection::connected();
    t.take_signals();
    let group = Group {
        id: GroupId("g-new".to_string()),
        name: "Family".to_string(),
    };
    t.account.insert_group(group.clone());

    let signals = t.emit(AccountEvent::GroupAdded(group));
    let announced = TestConnection::announced(&signals);
    assert_eq!(announced.len(), 1);
    assert_eq!(announced[0].target_id, "Family");
    assert!(!announced[0].requested);
}

#[test]
fn parked_alias_is_applied_once_subscribed() {
    let mut t = TestConnection::connected();
    let subscribe = list_channel(&mut t, HandleType::List, "subscribe");
    let dave = t.contact("dave@example.com");
    t.take_outbound();

    t.conn.set_aliases(&[(dave, "Dave D".to_string())]).unwrap();
    assert!(t.take_outbound().is_empty());

    t.conn.add_members(subscribe, &[dave], "").unwrap();
    let signals = t.pump();
    assert!(t.take_outbound().contains(&Outbound::SetContactAlias {
        contact: TestConnection::key("dave@example.com"),
        alias: "Dave D".to_string(),
    }));
    assert!(signals.contains(&Signal::AliasesChanged(vec![(dave, "Dave D".to_string())])));
}
