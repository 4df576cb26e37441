//! Integration tests for multi-party text: conferences built from existing
//! channels, conversations that grow a third participant, and sessions
//! that move between channels.

mod common;

use std::time::{Duration, Instant};

use common::TestConnection;
use imgate::state::channels::ChannelKind;
use imgate::state::channels::text::{ChatState, MessageKind};
use imgate::state::managers::{RequestProperties, props};
use imgate::state::roster::ChangeReason;
use imgate::state::{ChannelId, HandleType, Signal};
use imgate_account::{AccountEvent, ConversationId, Outbound};

const ALICE: &str = "alice@example.com";
const BOB: &str = "bob@example.com";

/// A 1:1 channel with a live session, via the first message sent.
fn open_session(t: &mut TestConnection, name: &str) -> (ChannelId, ConversationId) {
    let contact = t.online_contact(name);
    let channel = t
        .conn
        .request_channel(ChannelKind::Text, HandleType::Contact, contact)
        .unwrap();
    t.conn.send(channel, MessageKind::Normal, "hi").unwrap();
    t.pump();
    let conversation = t
        .take_outbound()
        .into_iter()
        .find_map(|c| match c {
            Outbound::CreateConversation { id, .. } => Some(id),
            _ => None,
        })
        .expect("session opened");
    (channel, conversation)
}

fn conference(props: RequestProperties) -> RequestProperties {
    props.with(props::CHANNEL_TYPE, "text")
}

#[test]
fn merging_two_chats_keeps_the_first_session() {
    let mut t = TestConnection::connected();
    let (with_alice, first) = open_session(&mut t, ALICE);
    let (with_bob, second) = open_session(&mut t, BOB);
    t.take_signals();

    let request = conference(
        RequestProperties::new().with(props::INITIAL_CHANNELS, vec![with_alice.0, with_bob.0]),
    );
    let (created, summary) = t.conn.ensure_channel(&request).unwrap();
    t.pump();

    assert!(created);
    assert_eq!(summary.kind, ChannelKind::Text);
    assert_eq!(summary.target_type, HandleType::None);
    assert!(summary.requested);

    let outbound = t.take_outbound();
    assert!(outbound.contains(&Outbound::LeaveConversation(second)));
    assert!(outbound.contains(&Outbound::InviteUser {
        conversation: first,
        contact: TestConnection::key(BOB),
    }));
    assert!(!outbound.contains(&Outbound::LeaveConversation(first)));

    let members = t.conn.get_members(summary.id).unwrap();
    let alice = t.contact(ALICE);
    let bob = t.contact(BOB);
    assert!(members.members.contains(&alice));
    assert!(members.members.contains(&bob));
    assert_eq!(members.members.len(), 3);

    // Donors stay open, addressed at their own peer.
    assert_eq!(t.conn.get_channels().unwrap().len(), 5);

    // Traffic in the stolen session lands in the conference.
    let signals = t.emit(AccountEvent::MessageReceived {
        conversation: first,
        sender: TestConnection::key(ALICE),
        text: "all here?".to_string(),
    });
    assert!(signals.iter().any(|s| matches!(
        s,
        Signal::Received { channel, .. } if *channel == summary.id
    )));

    // The donor opens a fresh session of its own.
    t.conn.send(with_alice, MessageKind::Normal, "just us").unwrap();
    let reopened = t
        .take_outbound()
        .into_iter()
        .any(|c| matches!(c, Outbound::CreateConversation { id, .. } if id != first));
    assert!(reopened);
}

#[test]
fn conference_from_invitees_creates_a_session() {
    let mut t = TestConnection::connected();
    let alice = t.online_contact(ALICE);
    t.take_signals();

    let request = conference(
        RequestProperties::new().with(props::INITIAL_INVITEE_IDS, vec![ALICE.to_string()]),
    );
    let (_, summary) = t.conn.ensure_channel(&request).unwrap();
    let signals = t.pump();

    assert!(t.take_outbound().iter().any(|c| matches!(
        c,
        Outbound::CreateConversation { participants, .. }
            if participants == &vec![TestConnection::key(ALICE)]
    )));
    assert!(matches!(&signals[0], Signal::NewChannels(new) if new[0].id == summary.id));
    let members = t.conn.get_members(summary.id).unwrap();
    assert!(members.members.contains(&alice));
}

#[test]
fn conference_rejects_non_text_donors() {
    let mut t = TestConnection::connected();
    let list = t.conn.get_channels().unwrap()[0].id;
    let request = conference(RequestProperties::new().with(props::INITIAL_CHANNELS, vec![list.0]));
    let err = t.conn.ensure_channel(&request).unwrap_err();
    assert_eq!(err.error_code(), "invalid_argument");
}

#[test]
fn inviting_into_a_conference() {
    let mut t = TestConnection::connected();
    t.online_contact(ALICE);
    let bob = t.online_contact(BOB);
    let request = conference(
        RequestProperties::new().with(props::INITIAL_INVITEE_IDS, vec![ALICE.to_string()]),
    );
    let (_, summary) = t.conn.ensure_channel(&request).unwrap();
    t.pump();
    let conversation = t
        .take_outbound()
        .into_iter()
        .find_map(|c| match c {
            Outbound::CreateConversation { id, .. } => Some(id),
            _ => None,
        })
        .unwrap();
    t.take_signals();

    t.conn.add_members(summary.id, &[bob], "join us").unwrap();
    let signals = t.pump();

    assert!(t.take_outbound().contains(&Outbound::InviteUser {
        conversation,
        contact: TestConnection::key(BOB),
    }));
    match &signals[..] {
        [Signal::MembersChanged { channel, change }] => {
            assert_eq!(*channel, summary.id);
            assert_eq!(change.added, vec![bob]);
            assert_eq!(change.reason, ChangeReason::Invited);
            assert_eq!(change.message, "join us");
            assert_eq!(change.actor, t.conn.self_handle());
        }
        other => panic!("unexpected signals {other:?}"),
    }
}

#[test]
fn third_party_joining_splits_off_a_conference() {
    let mut t = TestConnection::connected();
    let (with_alice, conversation) = open_session(&mut t, ALICE);
    let bob = t.online_contact(BOB);
    t.take_signals();

    t.account.set_participants(
        conversation,
        vec![TestConnection::key(ALICE), TestConnection::key(BOB)],
    );
    let signals = t.emit(AccountEvent::UserJoined {
        conversation,
        contact: TestConnection::key(BOB),
    });

    let announced = TestConnection::announced(&signals);
    assert_eq!(announced.len(), 1);
    let split = announced[0].id;
    assert_ne!(split, with_alice);
    assert_eq!(announced[0].target_type, HandleType::None);
    assert_eq!(announced[0].initiator, bob);
    assert!(!announced[0].requested);

    let members = t.conn.get_members(split).unwrap();
    assert_eq!(members.members.len(), 3);

    // The session now belongs to the conference.
    let signals = t.emit(AccountEvent::MessageReceived {
        conversation,
        sender: TestConnection::key(BOB),
        text: "hey both".to_string(),
    });
    assert!(signals.iter().any(|s| matches!(
        s,
        Signal::Received { channel, .. } if *channel == split
    )));

    // The old channel remains, now without a session.
    t.take_outbound();
    t.conn.send(with_alice, MessageKind::Normal, "private").unwrap();
    assert!(t
        .take_outbound()
        .iter()
        .any(|c| matches!(c, Outbound::CreateConversation { id, .. } if *id != conversation)));
}

#[test]
fn invitation_attaches_to_existing_channel() {
    let mut t = TestConnection::connected();
    let alice = t.online_contact(ALICE);
    let channel = t
        .conn
        .request_channel(ChannelKind::Text, HandleType::Contact, alice)
        .unwrap();
    t.take_signals();

    let conversation = t.account.open_conversation(vec![TestConnection::key(ALICE)]);
    let signals = t.emit(AccountEvent::ConversationInvited(conversation));
    assert!(TestConnection::announced(&signals).is_empty());

    t.take_outbound();
    t.conn.send(channel, MessageKind::Normal, "you called?").unwrap();
    assert_eq!(
        t.take_outbound(),
        vec![Outbound::SendText {
            conversation,
            text: "you called?".to_string(),
        }]
    );
}

#[test]
fn new_session_replaces_the_old_one() {
    let mut t = TestConnection::connected();
    let (channel, old) = open_session(&mut t, ALICE);

    let fresh = t.account.open_conversation(vec![TestConnection::key(ALICE)]);
    let signals = t.emit(AccountEvent::ConversationInvited(fresh));
    assert!(TestConnection::announced(&signals).is_empty());
    assert!(t.take_outbound().contains(&Outbound::LeaveConversation(old)));

    t.conn.send(channel, MessageKind::Normal, "moved").unwrap();
    assert_eq!(
        t.take_outbound(),
        vec![Outbound::SendText {
            conversation: fresh,
            text: "moved".to_string(),
        }]
    );
}

#[test]
fn incoming_group_conversation_is_a_conference() {
    let mut t = TestConnection::connected();
    t.take_signals();
    let conversation = t
        .account
        .open_conversation(vec![TestConnection::key(ALICE), TestConnection::key(BOB)]);

    let signals = t.emit(AccountEvent::ConversationInvited(conversation));
    let announced = TestConnection::announced(&signals);
    assert_eq!(announced.len(), 1);
    assert_eq!(announced[0].target_type, HandleType::None);
    let alice = t.contact(ALICE);
    assert_eq!(announced[0].initiator, alice);

    let members = t.conn.get_members(announced[0].id).unwrap();
    assert_eq!(members.members.len(), 3);
}

#[test]
fn leaving_member_is_removed_from_conference() {
    let mut t = TestConnection::connected();
    t.take_signals();
    let conversation = t
        .account
        .open_conversation(vec![TestConnection::key(ALICE), TestConnection::key(BOB)]);
    let signals = t.emit(AccountEvent::ConversationInvited(conversation));
    let channel = TestConnection::announced(&signals)[0].id;
    let bob = t.contact(BOB);

    let signals = t.emit(AccountEvent::UserLeft {
        conversation,
        contact: TestConnection::key(BOB),
    });
    match &signals[..] {
        [Signal::MembersChanged { change, .. }] => {
            assert_eq!(change.removed, vec![bob]);
            assert_eq!(change.actor, bob);
        }
        other => panic!("unexpected signals {other:?}"),
    }

    // Alice is the last peer: the session dies and Gone is reported.
    let alice = t.contact(ALICE);
    let signals = t.emit(AccountEvent::UserLeft {
        conversation,
        contact: TestConnection::key(ALICE),
    });
    assert_eq!(
        signals,
        vec![Signal::ChatStateChanged {
            channel,
            contact: alice,
            state: ChatState::Gone,
        }]
    );
}

#[test]
fn conference_without_session_closes_after_timeout() {
    let mut t = TestConnection::connected();
    let (_, summary) = t.conn.ensure_channel(&conference(RequestProperties::new())).unwrap();
    t.take_signals();
    assert!(t.conn.next_deadline().is_some());

    let me = t.conn.self_handle();
    let err = t.conn.add_members(summary.id, &[me], "").unwrap_err();
    assert_eq!(err.error_code(), "not_available");

    t.conn.fire_timers(Instant::now() + Duration::from_secs(3600));
    assert_eq!(t.pump(), vec![Signal::Closed { channel: summary.id }]);
    assert!(t
        .conn
        .get_channels()
        .unwrap()
        .iter()
        .all(|c| c.id != summary.id));
}
