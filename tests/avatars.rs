//! Integration tests for display pictures and contact attributes.

mod common;

use common::TestConnection;
use imgate::state::channels::ChannelKind;
use imgate::state::contacts::ContactInterface;
use imgate::state::{HandleType, Signal};
use imgate_account::{AccountEvent, Contact, Memberships, Outbound, Presence, picture_token};

const ALICE: &str = "alice@example.com";
const BOB: &str = "bob@example.com";

const GIF: &[u8] = b"GIF89a\x01\x00\x01\x00";
const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\x00\x00\x00\x0dIHDR";

/// Alice has a picture, bob has none.
fn with_pictures() -> (TestConnection, String) {
    let mut t = TestConnection::new();
    t.account.insert_contact(
        Contact::new(TestConnection::key(ALICE))
            .with_presence(Presence::Online)
            .with_memberships(Memberships::FORWARD | Memberships::ALLOW)
            .with_display_name("Alice"),
    );
    t.add_contact(BOB, Presence::Online, Memberships::FORWARD);
    let token = t
        .account
        .set_contact_picture(&TestConnection::key(ALICE), GIF.to_vec());
    t.connect();
    t.take_signals();
    t.take_outbound();
    (t, token)
}

#[test]
fn tokens_for_contacts_without_pictures_appear_once_own_is_known() {
    let (mut t, token) = with_pictures();
    let alice = t.contact(ALICE);
    let bob = t.contact(BOB);
    let me = t.conn.self_handle();

    let tokens = t.conn.get_known_avatar_tokens(&[alice, bob, me]).unwrap();
    assert_eq!(tokens, vec![(alice, token.clone())]);

    t.conn.clear_avatar().unwrap();
    assert_eq!(t.take_outbound(), vec![Outbound::ClearAvatar]);
    assert_eq!(
        t.pump(),
        vec![Signal::AvatarUpdated {
            contact: me,
            token: String::new(),
        }]
    );

    let tokens = t.conn.get_known_avatar_tokens(&[alice, bob, me]).unwrap();
    assert_eq!(
        tokens,
        vec![(alice, token), (bob, String::new()), (me, String::new())]
    );
}

#[test]
fn requested_pictures_arrive_as_signals() {
    let (mut t, token) = with_pictures();
    let alice = t.contact(ALICE);
    let bob = t.contact(BOB);

    t.conn.request_avatars(&[alice, bob]).unwrap();
    assert_eq!(
        t.take_outbound(),
        vec![Outbound::RequestAvatar {
            contact: TestConnection::key(ALICE),
            token: token.clone(),
        }]
    );
    assert_eq!(
        t.pump(),
        vec![Signal::AvatarRetrieved {
            contact: alice,
            token,
            data: GIF.to_vec(),
            mime_type: "image/gif".to_string(),
        }]
    );
}

#[test]
fn own_picture_is_published_and_served_locally() {
    let mut t = TestConnection::connected();
    let me = t.conn.self_handle();
    t.take_signals();
    t.take_outbound();

    let token = t.conn.set_avatar(PNG.to_vec(), "image/png").unwrap();
    assert_eq!(token, picture_token(PNG));
    assert_eq!(t.take_outbound(), vec![Outbound::SetAvatar(token.clone())]);
    let retrieved = Signal::AvatarRetrieved {
        contact: me,
        token: token.clone(),
        data: PNG.to_vec(),
        mime_type: "image/png".to_string(),
    };
    assert_eq!(
        t.pump(),
        vec![
            Signal::AvatarUpdated {
                contact: me,
                token: token.clone(),
            },
            retrieved.clone(),
        ]
    );
    assert_eq!(
        t.conn.get_known_avatar_tokens(&[me]).unwrap(),
        vec![(me, token)]
    );

    // The local picture never goes through the account.
    t.conn.request_avatars(&[me]).unwrap();
    assert!(t.take_outbound().is_empty());
    assert_eq!(t.pump(), vec![retrieved]);
}

#[test]
fn unsupported_pictures_are_refused() {
    let mut t = TestConnection::connected();
    let err = t.conn.set_avatar(PNG.to_vec(), "image/bmp").unwrap_err();
    assert_eq!(err.error_code(), "invalid_argument");
    let err = t.conn.set_avatar(Vec::new(), "image/png").unwrap_err();
    assert_eq!(err.error_code(), "invalid_argument");
    assert!(t.take_outbound().iter().all(|c| !matches!(c, Outbound::SetAvatar(_))));
}

#[test]
fn avatars_need_a_connection() {
    let mut t = TestConnection::new();
    let err = t.conn.set_avatar(PNG.to_vec(), "image/png").unwrap_err();
    assert_eq!(err.error_code(), "disconnected");
    assert_eq!(t.conn.avatar_requirements().max_width, 192);
}

#[test]
fn remote_picture_change_is_reported() {
    let (mut t, _) = with_pictures();
    let alice = t.contact(ALICE);
    let token = t
        .account
        .set_contact_picture(&TestConnection::key(ALICE), PNG.to_vec());

    let signals = t.emit(AccountEvent::ContactAvatarChanged(TestConnection::key(ALICE)));
    assert_eq!(
        signals,
        vec![Signal::AvatarUpdated {
            contact: alice,
            token,
        }]
    );

    t.account
        .update_contact(&TestConnection::key(ALICE), |c| c.avatar_token = None);
    let signals = t.emit(AccountEvent::ContactAvatarChanged(TestConnection::key(ALICE)));
    assert_eq!(
        signals,
        vec![Signal::AvatarUpdated {
            contact: alice,
            token: String::new(),
        }]
    );
}

#[test]
fn contact_attributes_gather_every_interface() {
    let (mut t, token) = with_pictures();
    let alice = t.contact(ALICE);

    let attrs = t
        .conn
        .get_contact_attributes(&[alice], &ContactInterface::ALL, false)
        .unwrap();
    let alice_attrs = &attrs[0];
    assert_eq!(alice_attrs.handle, alice);
    assert_eq!(alice_attrs.contact_id, ALICE);
    assert_eq!(alice_attrs.alias.as_deref(), Some("Alice"));
    assert_eq!(alice_attrs.avatar_token, Some(token));
    assert!(alice_attrs.presence.is_some());
    assert!(alice_attrs
        .capabilities
        .as_ref()
        .unwrap()
        .iter()
        .any(|c| c.channel_type == ChannelKind::Text));
}

#[test]
fn contact_id_is_always_reported() {
    let (mut t, _) = with_pictures();
    let bob = t.contact(BOB);

    let attrs = t.conn.get_contact_attributes(&[bob], &[], false).unwrap();
    assert_eq!(attrs[0].contact_id, BOB);
    assert_eq!(attrs[0].alias, None);
    assert_eq!(attrs[0].presence, None);
    assert_eq!(attrs[0].avatar_token, None);
    assert_eq!(attrs[0].capabilities, None);
}

#[test]
fn contact_attributes_can_hold_handles() {
    let (mut t, _) = with_pictures();
    let bob = t.contact(BOB);

    t.conn
        .get_contact_attributes(&[bob], &[ContactInterface::Aliasing], true)
        .unwrap();
    // One hold from the lookup above, one from the attributes call.
    t.conn.release_handles(HandleType::Contact, &[bob]).unwrap();
    t.conn.release_handles(HandleType::Contact, &[bob]).unwrap();
    let err = t
        .conn
        .release_handles(HandleType::Contact, &[bob])
        .unwrap_err();
    assert_eq!(err.error_code(), "not_available");
}

#[test]
fn contact_attributes_reject_non_contacts() {
    let mut t = TestConnection::connected();
    let subscribe = t.handle(HandleType::List, "subscribe");
    let err = t
        .conn
        .get_contact_attributes(&[subscribe], &[ContactInterface::Presence], false)
        .unwrap_err();
    assert_eq!(err.error_code(), "invalid_handle");
}
