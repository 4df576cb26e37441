//! Integration tests for streamed media channels: outgoing and incoming
//! calls, stream bookkeeping and hang-up paths.

mod common;

use common::TestConnection;
use imgate::state::channels::ChannelKind;
use imgate::state::channels::media::{CallPhase, PendingSend, StreamState};
use imgate::state::managers::{RequestProperties, props};
use imgate::state::{ChannelId, HandleId, HandleType, Signal};
use imgate_account::{
    AccountEvent, CallId, MediaKind, MediaStreamId, Memberships, Outbound, Presence,
    StreamDirection,
};

const ALICE: &str = "alice@example.com";

fn media_channel(t: &mut TestConnection, peer: HandleId) -> ChannelId {
    t.conn
        .request_channel(ChannelKind::StreamedMedia, HandleType::Contact, peer)
        .expect("media channel")
}

fn created_call(outbound: &[Outbound]) -> CallId {
    outbound
        .iter()
        .find_map(|c| match c {
            Outbound::CreateCall { id, .. } => Some(*id),
            _ => None,
        })
        .expect("call created")
}

fn created_stream(outbound: &[Outbound]) -> MediaStreamId {
    outbound
        .iter()
        .find_map(|c| match c {
            Outbound::CreateStream { id, .. } => Some(*id),
            _ => None,
        })
        .expect("stream created")
}

/// An outgoing audio call to alice with one stream, ringing.
fn ringing_call(t: &mut TestConnection) -> (ChannelId, CallId, MediaStreamId, u32) {
    let alice = t.online_contact(ALICE);
    let channel = media_channel(t, alice);
    let streams = t
        .conn
        .request_streams(channel, alice, &[MediaKind::Audio])
        .unwrap();
    t.pump();
    let outbound = t.take_outbound();
    t.take_signals();
    (
        channel,
        created_call(&outbound),
        created_stream(&outbound),
        streams[0].id,
    )
}

#[test]
fn outgoing_call_starts_with_peer_remote_pending() {
    let mut t = TestConnection::connected();
    let alice = t.online_contact(ALICE);
    let me = t.conn.self_handle();
    t.take_signals();

    let channel = media_channel(&mut t, alice);
    let signals = t.pump();
    assert!(matches!(&signals[0], Signal::NewChannels(new) if new[0].kind == ChannelKind::StreamedMedia));
    match &signals[1] {
        Signal::MembersChanged { change, .. } => {
            assert_eq!(change.added, vec![me]);
            assert_eq!(change.remote_pending, vec![alice]);
        }
        other => panic!("unexpected signal {other:?}"),
    }

    // No call exists until streams are requested.
    assert!(t
        .take_outbound()
        .iter()
        .all(|c| !matches!(c, Outbound::CreateCall { .. })));
    assert_eq!(media_channel(&mut t, alice), channel);
}

#[test]
fn first_stream_request_places_the_call() {
    let mut t = TestConnection::connected();
    let alice = t.online_contact(ALICE);
    let channel = media_channel(&mut t, alice);
    t.take_signals();
    t.take_outbound();

    let streams = t
        .conn
        .request_streams(channel, alice, &[MediaKind::Audio])
        .unwrap();
    assert_eq!(streams.len(), 1);
    assert_eq!(streams[0].direction, StreamDirection::Bidirectional);
    assert_eq!(streams[0].pending_send, PendingSend::REMOTE_SEND);
    assert_eq!(streams[0].contact, alice);

    let signals = t.pump();
    let phases: Vec<CallPhase> = signals
        .iter()
        .filter_map(|s| match s {
            Signal::CallStateChanged { state, .. } => Some(*state),
            _ => None,
        })
        .collect();
    assert_eq!(phases, vec![CallPhase::Outgoing, CallPhase::Ringing]);
    assert!(signals.contains(&Signal::StreamAdded {
        channel,
        stream: streams[0].id,
        contact: alice,
        kind: MediaKind::Audio,
    }));

    let outbound = t.take_outbound();
    assert!(matches!(&outbound[0], Outbound::CreateCall { peer, .. } if *peer == TestConnection::key(ALICE)));
    assert!(matches!(&outbound[1], Outbound::CreateStream { kind: MediaKind::Audio, .. }));
}

#[test]
fn initial_audio_requests_a_stream_on_creation() {
    let mut t = TestConnection::connected();
    t.online_contact(ALICE);
    let request = RequestProperties::new()
        .with(props::CHANNEL_TYPE, "streamed_media")
        .with(props::TARGET_HANDLE_TYPE, "contact")
        .with(props::TARGET_ID, ALICE)
        .with(props::INITIAL_AUDIO, true);

    let (_, summary) = t.conn.ensure_channel(&request).unwrap();
    let streams = t.conn.list_streams(summary.id).unwrap();
    assert_eq!(streams.len(), 1);
    assert_eq!(streams[0].kind, MediaKind::Audio);
}

#[test]
fn remote_accept_makes_the_peer_a_member() {
    let mut t = TestConnection::connected();
    let (channel, call, remote, stream) = ringing_call(&mut t);
    let alice = t.contact(ALICE);

    let signals = t.emit(AccountEvent::CallAccepted(call));
    match &signals[..] {
        [Signal::MembersChanged { change, .. }, Signal::CallStateChanged { state, .. }] => {
            assert_eq!(change.added, vec![alice]);
            assert_eq!(*state, CallPhase::Accepted);
        }
        other => panic!("unexpected signals {other:?}"),
    }

    // The peer confirming the direction clears the pending send.
    let signals = t.emit(AccountEvent::StreamDirectionChanged {
        call,
        stream: remote,
        direction: StreamDirection::Bidirectional,
    });
    assert_eq!(
        signals,
        vec![Signal::StreamDirectionChanged {
            channel,
            stream,
            direction: StreamDirection::Bidirectional,
            pending_send: PendingSend::NONE,
        }]
    );

    let signals = t.emit(AccountEvent::StreamStateChanged {
        call,
        stream: remote,
        connected: true,
    });
    assert_eq!(
        signals,
        vec![Signal::StreamStateChanged {
            channel,
            stream,
            state: StreamState::Connected,
        }]
    );
}

#[test]
fn closing_an_outgoing_call_hangs_up() {
    let mut t = TestConnection::connected();
    let (channel, call, _, _) = ringing_call(&mut t);
    let alice = t.contact(ALICE);

    t.conn.close_channel(channel).unwrap();
    assert_eq!(
        t.pump(),
        vec![
            Signal::CallStateChanged {
                channel,
                contact: alice,
                state: CallPhase::Ended,
            },
            Signal::Closed { channel },
        ]
    );
    assert_eq!(t.take_outbound(), vec![Outbound::EndCall(call)]);
}

#[test]
fn remote_hang_up_closes_without_ending_again() {
    let mut t = TestConnection::connected();
    let (channel, call, _, _) = ringing_call(&mut t);
    let alice = t.contact(ALICE);

    let signals = t.emit(AccountEvent::CallEnded(call));
    assert_eq!(
        signals,
        vec![
            Signal::CallStateChanged {
                channel,
                contact: alice,
                state: CallPhase::Ended,
            },
            Signal::Closed { channel },
        ]
    );
    assert!(t.take_outbound().is_empty());
}

#[test]
fn rejected_call_closes() {
    let mut t = TestConnection::connected();
    let (channel, call, _, _) = ringing_call(&mut t);
    let signals = t.emit(AccountEvent::CallRejected(call));
    assert!(signals.contains(&Signal::Closed { channel }));
    assert!(signals.iter().any(|s| matches!(
        s,
        Signal::CallStateChanged { state: CallPhase::Rejected, .. }
    )));
}

#[test]
fn removing_the_last_stream_ends_the_call() {
    let mut t = TestConnection::connected();
    let (channel, call, remote, stream) = ringing_call(&mut t);

    let err = t.conn.remove_streams(channel, &[stream + 10]).unwrap_err();
    assert_eq!(err.error_code(), "invalid_argument");

    t.conn.remove_streams(channel, &[stream]).unwrap();
    let signals = t.pump();
    assert_eq!(signals[0], Signal::StreamRemoved { channel, stream });
    assert_eq!(signals.last(), Some(&Signal::Closed { channel }));
    assert_eq!(
        t.take_outbound(),
        vec![
            Outbound::RemoveStream {
                call,
                stream: remote,
            },
            Outbound::EndCall(call),
        ]
    );
}

#[test]
fn changing_direction_is_forwarded() {
    let mut t = TestConnection::connected();
    let (channel, call, remote, stream) = ringing_call(&mut t);

    t.conn
        .request_stream_direction(channel, stream, StreamDirection::Send)
        .unwrap();
    assert_eq!(
        t.take_outbound(),
        vec![Outbound::SetStreamDirection {
            call,
            stream: remote,
            direction: StreamDirection::Send,
        }]
    );
    assert_eq!(
        t.conn.list_streams(channel).unwrap()[0].direction,
        StreamDirection::Send
    );

    let err = t
        .conn
        .request_stream_direction(channel, stream + 1, StreamDirection::Send)
        .unwrap_err();
    assert_eq!(err.error_code(), "invalid_argument");
}

#[test]
fn streams_for_another_contact_are_rejected() {
    let mut t = TestConnection::connected();
    let alice = t.online_contact(ALICE);
    let bob = t.online_contact("bob@example.com");
    let channel = media_channel(&mut t, alice);

    let err = t
        .conn
        .request_streams(channel, bob, &[MediaKind::Video])
        .unwrap_err();
    assert_eq!(err.error_code(), "invalid_argument");
}

#[test]
fn calling_an_offline_contact_is_not_available() {
    let mut t = TestConnection::connected();
    t.add_contact(ALICE, Presence::Offline, Memberships::FORWARD);
    let alice = t.contact(ALICE);
    let err = t
        .conn
        .request_channel(ChannelKind::StreamedMedia, HandleType::Contact, alice)
        .unwrap_err();
    assert_eq!(err.error_code(), "not_available");
}

fn incoming_call(t: &mut TestConnection) -> (ChannelId, CallId) {
    let call = CallId(500);
    t.take_signals();
    t.take_outbound();
    let signals = t.emit(AccountEvent::CallInvited {
        call,
        peer: TestConnection::key(ALICE),
    });
    (TestConnection::announced(&signals)[0].id, call)
}

#[test]
fn incoming_call_waits_for_local_accept() {
    let mut t = TestConnection::connected();
    t.online_contact(ALICE);
    let me = t.conn.self_handle();
    let alice = t.contact(ALICE);
    t.take_signals();
    t.take_outbound();

    let call = CallId(500);
    let signals = t.emit(AccountEvent::CallInvited {
        call,
        peer: TestConnection::key(ALICE),
    });
    let channel = match &signals[..] {
        [Signal::NewChannels(new), Signal::MembersChanged { change, .. }, Signal::CallStateChanged { state, .. }] =>
        {
            assert!(!new[0].requested);
            assert_eq!(new[0].initiator, alice);
            assert_eq!(change.added, vec![alice]);
            assert_eq!(change.local_pending, vec![me]);
            assert_eq!(*state, CallPhase::Incoming);
            new[0].id
        }
        other => panic!("unexpected signals {other:?}"),
    };

    let signals = t.emit(AccountEvent::StreamCreated {
        call,
        stream: MediaStreamId(900),
        kind: MediaKind::Audio,
        direction: StreamDirection::Bidirectional,
    });
    assert!(matches!(signals[0], Signal::StreamAdded { kind: MediaKind::Audio, .. }));
    assert!(matches!(
        signals[1],
        Signal::StreamDirectionChanged {
            pending_send: PendingSend::LOCAL_SEND,
            ..
        }
    ));

    let stream = t.conn.list_streams(channel).unwrap()[0].id;
    t.conn.add_members(channel, &[me], "").unwrap();
    let signals = t.pump();
    assert!(signals.contains(&Signal::CallStateChanged {
        channel,
        contact: alice,
        state: CallPhase::Accepted,
    }));
    // Accepting drops the pending local send and says so.
    assert!(signals.contains(&Signal::StreamDirectionChanged {
        channel,
        stream,
        direction: StreamDirection::Bidirectional,
        pending_send: PendingSend::NONE,
    }));
    assert_eq!(t.take_outbound(), vec![Outbound::AcceptCall(call)]);
    assert_eq!(
        t.conn.list_streams(channel).unwrap()[0].pending_send,
        PendingSend::NONE
    );
    assert!(t.conn.get_members(channel).unwrap().members.contains(&me));
}

#[test]
fn requesting_media_reuses_the_incoming_call() {
    let mut t = TestConnection::connected();
    let alice = t.online_contact(ALICE);
    let (incoming, _) = incoming_call(&mut t);

    assert_eq!(media_channel(&mut t, alice), incoming);
    let media: Vec<ChannelId> = t
        .conn
        .get_channels()
        .unwrap()
        .into_iter()
        .filter(|c| c.kind == ChannelKind::StreamedMedia)
        .map(|c| c.id)
        .collect();
    assert_eq!(media, vec![incoming]);

    // Once the call channel is gone a fresh request builds a new one.
    t.conn.close_channel(incoming).unwrap();
    t.pump();
    assert_ne!(media_channel(&mut t, alice), incoming);
}

#[test]
fn closing_an_unanswered_call_rejects_it() {
    let mut t = TestConnection::connected();
    t.online_contact(ALICE);
    let (channel, call) = incoming_call(&mut t);

    t.conn.close_channel(channel).unwrap();
    let signals = t.pump();
    assert!(signals.iter().any(|s| matches!(
        s,
        Signal::CallStateChanged { state: CallPhase::Rejected, .. }
    )));
    assert_eq!(signals.last(), Some(&Signal::Closed { channel }));
    assert_eq!(t.take_outbound(), vec![Outbound::RejectCall(call)]);
}

#[test]
fn only_self_may_join_a_call() {
    let mut t = TestConnection::connected();
    t.online_contact(ALICE);
    let bob = t.online_contact("bob@example.com");
    let (channel, _) = incoming_call(&mut t);

    let err = t.conn.add_members(channel, &[bob], "").unwrap_err();
    assert_eq!(err.error_code(), "permission_denied");
}

#[test]
fn media_operations_on_text_channels_are_unimplemented() {
    let mut t = TestConnection::connected();
    let alice = t.online_contact(ALICE);
    let text = t
        .conn
        .request_channel(ChannelKind::Text, HandleType::Contact, alice)
        .unwrap();
    let err = t.conn.list_streams(text).unwrap_err();
    assert_eq!(err.error_code(), "not_implemented");
}
