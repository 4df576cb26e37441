//! In-memory account client.
//!
//! `MemoryAccount` keeps an address book, conversations and a mailbox in
//! process memory and records every command it receives as an
//! [`Outbound`] entry. Handles are cheap clones sharing one state, so a
//! test can keep a handle to inspect commands and inject events while the
//! gateway owns another.
//!
//! Display pictures are kept by token, so a loopback avatar request for a
//! known picture is answered with its bytes.
//!
//! In loopback mode the client also answers its own commands with the
//! events a live service would send (login walks every [`ClientState`],
//! adding a contact reports `ContactAdded`, and so on).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tracing::debug;

use crate::client::{AccountClient, EventSink, LoginParams};
use crate::event::AccountEvent;
use crate::state::ClientState;
use crate::types::{
    CallId, Contact, ContactKey, ConversationId, DisplayPicture, Group, GroupId, InboxUrl,
    MediaKind, MediaStreamId, Memberships, Presence, Profile, StreamDirection, TransferId,
};

/// A command received by the in-memory client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    Login { account: String },
    Logout,
    SetPresence { presence: Presence, message: String },
    SetDisplayName(String),
    AddContact(ContactKey),
    DeleteContact(ContactKey),
    BlockContact(ContactKey),
    UnblockContact(ContactKey),
    AcceptInvitation(ContactKey),
    DeclineInvitation(ContactKey),
    SetContactAlias { contact: ContactKey, alias: String },
    AddGroup(String),
    RenameGroup { group: GroupId, name: String },
    DeleteGroup(GroupId),
    AddToGroup { group: GroupId, contact: ContactKey },
    RemoveFromGroup { group: GroupId, contact: ContactKey },
    CreateConversation { id: ConversationId, participants: Vec<ContactKey> },
    SendText { conversation: ConversationId, text: String },
    SendNudge(ConversationId),
    SendTyping(ConversationId),
    InviteUser { conversation: ConversationId, contact: ContactKey },
    LeaveConversation(ConversationId),
    SendOfflineMessage { recipient: ContactKey, text: String },
    DeleteOfflineMessages(Vec<String>),
    CreateCall { id: CallId, peer: ContactKey },
    AcceptCall(CallId),
    RejectCall(CallId),
    EndCall(CallId),
    CreateStream { call: CallId, id: MediaStreamId, kind: MediaKind, direction: StreamDirection },
    RemoveStream { call: CallId, stream: MediaStreamId },
    SetStreamDirection { call: CallId, stream: MediaStreamId, direction: StreamDirection },
    SendFile { id: TransferId, peer: ContactKey, filename: String, size: u64 },
    AcceptTransfer(TransferId),
    CancelTransfer(TransferId),
    AttachTransferSocket(TransferId),
    RequestInboxUrl,
    RequestAvatar { contact: ContactKey, token: String },
    SetAvatar(String),
    ClearAvatar,
}

#[derive(Default)]
struct MemoryState {
    loopback: bool,
    sink: Option<EventSink>,
    profile: Profile,
    contacts: BTreeMap<ContactKey, Contact>,
    groups: BTreeMap<GroupId, Group>,
    conversations: HashMap<ConversationId, Vec<ContactKey>>,
    unread_mail: u32,
    inbox_url: Option<InboxUrl>,
    /// Display pictures by token.
    pictures: HashMap<String, Vec<u8>>,
    next_id: u64,
    outbound: Vec<Outbound>,
    transfer_sockets: Vec<(TransferId, TcpStream)>,
}

impl MemoryState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn emit(&self, event: AccountEvent) {
        match &self.sink {
            Some(sink) => {
                if sink.send(event).is_err() {
                    debug!("event sink closed; dropping account event");
                }
            }
            None => debug!(event = event.name(), "no event sink attached"),
        }
    }

    /// Emit only when answering our own commands.
    fn reflect(&self, event: AccountEvent) {
        if self.loopback {
            self.emit(event);
        }
    }

    fn update_memberships(
        &mut self,
        key: &ContactKey,
        apply: impl FnOnce(&mut Memberships),
    ) -> bool {
        if !self.loopback {
            return false;
        }
        let contact = self
            .contacts
            .entry(key.clone())
            .or_insert_with(|| Contact::new(key.clone()));
        apply(&mut contact.memberships);
        true
    }
}

/// Shared handle onto an in-memory account.
#[derive(Clone, Default)]
pub struct MemoryAccount {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryAccount {
    /// An empty account that only records commands.
    pub fn new(account: impl Into<String>) -> Self {
        let account = account.into();
        let this = Self::default();
        {
            let mut state = this.state.lock();
            state.profile.account = account;
            state.profile.email_enabled = true;
        }
        this
    }

    /// An account that answers its own commands like a live service.
    pub fn loopback(account: impl Into<String>) -> Self {
        let this = Self::new(account);
        this.state.lock().loopback = true;
        this
    }

    pub fn is_loopback(&self) -> bool {
        self.state.lock().loopback
    }

    pub fn insert_contact(&self, contact: Contact) {
        self.state.lock().contacts.insert(contact.key.clone(), contact);
    }

    /// Mutate a stored contact. Returns false when it is not in the book.
    pub fn update_contact(&self, key: &ContactKey, apply: impl FnOnce(&mut Contact)) -> bool {
        match self.state.lock().contacts.get_mut(key) {
            Some(contact) => {
                apply(contact);
                true
            }
            None => false,
        }
    }

    pub fn remove_contact(&self, key: &ContactKey) -> Option<Contact> {
        self.state.lock().contacts.remove(key)
    }

    pub fn insert_group(&self, group: Group) {
        self.state.lock().groups.insert(group.id.clone(), group);
    }

    pub fn remove_group(&self, id: &GroupId) -> Option<Group> {
        self.state.lock().groups.remove(id)
    }

    pub fn update_profile(&self, apply: impl FnOnce(&mut Profile)) {
        apply(&mut self.state.lock().profile);
    }

    /// Give a stored contact a display picture; returns its token.
    pub fn set_contact_picture(&self, key: &ContactKey, data: Vec<u8>) -> String {
        let picture = DisplayPicture::new(data);
        let mut state = self.state.lock();
        if let Some(contact) = state.contacts.get_mut(key) {
            contact.avatar_token = Some(picture.token.clone());
        }
        state.pictures.insert(picture.token.clone(), picture.data);
        picture.token
    }

    pub fn set_unread_mail(&self, count: u32) {
        self.state.lock().unread_mail = count;
    }

    pub fn set_inbox_url(&self, url: InboxUrl) {
        self.state.lock().inbox_url = Some(url);
    }

    /// Register a conversation opened by the remote side.
    pub fn open_conversation(&self, participants: Vec<ContactKey>) -> ConversationId {
        let mut state = self.state.lock();
        let id = ConversationId(state.next_id());
        state.conversations.insert(id, participants);
        id
    }

    pub fn set_participants(&self, conversation: ConversationId, participants: Vec<ContactKey>) {
        self.state.lock().conversations.insert(conversation, participants);
    }

    /// Push an event to the attached sink.
    pub fn emit(&self, event: AccountEvent) {
        self.state.lock().emit(event);
    }

    /// Every command recorded so far.
    pub fn outbound(&self) -> Vec<Outbound> {
        self.state.lock().outbound.clone()
    }

    /// Drain the recorded commands.
    pub fn take_outbound(&self) -> Vec<Outbound> {
        std::mem::take(&mut self.state.lock().outbound)
    }

    pub fn take_transfer_sockets(&self) -> Vec<(TransferId, TcpStream)> {
        std::mem::take(&mut self.state.lock().transfer_sockets)
    }

    fn record(&self, command: Outbound) {
        self.state.lock().outbound.push(command);
    }
}

impl AccountClient for MemoryAccount {
    fn set_event_sink(&mut self, sink: EventSink) {
        self.state.lock().sink = Some(sink);
    }

    fn login(&mut self, params: &LoginParams) {
        let mut state = self.state.lock();
        state.outbound.push(Outbound::Login {
            account: params.account.clone(),
        });
        if state.profile.account.is_empty() {
            state.profile.account = params.account.clone();
        }
        for step in [
            ClientState::Connecting,
            ClientState::Authenticating,
            ClientState::Synchronizing,
            ClientState::Synchronized,
            ClientState::Open,
        ] {
            state.reflect(AccountEvent::StateChanged(step));
        }
    }

    fn logout(&mut self) {
        let mut state = self.state.lock();
        state.outbound.push(Outbound::Logout);
        state.reflect(AccountEvent::StateChanged(ClientState::Closed));
    }

    fn profile(&self) -> Profile {
        self.state.lock().profile.clone()
    }

    fn contacts(&self) -> Vec<Contact> {
        self.state.lock().contacts.values().cloned().collect()
    }

    fn contact(&self, key: &ContactKey) -> Option<Contact> {
        self.state.lock().contacts.get(key).cloned()
    }

    fn groups(&self) -> Vec<Group> {
        self.state.lock().groups.values().cloned().collect()
    }

    fn conversation_participants(&self, conversation: ConversationId) -> Vec<ContactKey> {
        self.state
            .lock()
            .conversations
            .get(&conversation)
            .cloned()
            .unwrap_or_default()
    }

    fn unread_mail_count(&self) -> u32 {
        self.state.lock().unread_mail
    }

    fn set_presence(&mut self, presence: Presence, message: &str) {
        let mut state = self.state.lock();
        state.outbound.push(Outbound::SetPresence {
            presence,
            message: message.to_string(),
        });
        if state.loopback {
            state.profile.presence = presence;
            state.profile.personal_message = message.to_string();
            state.emit(AccountEvent::ProfilePresenceChanged);
        }
    }

    fn set_display_name(&mut self, name: &str) {
        let mut state = self.state.lock();
        state.outbound.push(Outbound::SetDisplayName(name.to_string()));
        if state.loopback {
            state.profile.display_name = name.to_string();
        }
    }

    fn add_contact(&mut self, contact: &ContactKey) {
        let mut state = self.state.lock();
        state.outbound.push(Outbound::AddContact(contact.clone()));
        if state.update_memberships(contact, |m| m.insert(Memberships::FORWARD | Memberships::ALLOW))
        {
            state.emit(AccountEvent::ContactAdded(contact.clone()));
        }
    }

    fn delete_contact(&mut self, contact: &ContactKey) {
        let mut state = self.state.lock();
        state.outbound.push(Outbound::DeleteContact(contact.clone()));
        if state.loopback && state.contacts.remove(contact).is_some() {
            state.emit(AccountEvent::ContactDeleted(contact.clone()));
        }
    }

    fn block_contact(&mut self, contact: &ContactKey) {
        let mut state = self.state.lock();
        state.outbound.push(Outbound::BlockContact(contact.clone()));
        if state.update_memberships(contact, |m| {
            m.remove(Memberships::ALLOW);
            m.insert(Memberships::BLOCK);
        }) {
            state.emit(AccountEvent::ContactBlocked(contact.clone()));
        }
    }

    fn unblock_contact(&mut self, contact: &ContactKey) {
        let mut state = self.state.lock();
        state.outbound.push(Outbound::UnblockContact(contact.clone()));
        if state.update_memberships(contact, |m| {
            m.remove(Memberships::BLOCK);
            m.insert(Memberships::ALLOW);
        }) {
            state.emit(AccountEvent::ContactUnblocked(contact.clone()));
        }
    }

    fn accept_contact_invitation(&mut self, contact: &ContactKey) {
        let mut state = self.state.lock();
        state.outbound.push(Outbound::AcceptInvitation(contact.clone()));
        if state.update_memberships(contact, |m| {
            m.remove(Memberships::PENDING);
            m.insert(Memberships::ALLOW | Memberships::REVERSE);
        }) {
            state.emit(AccountEvent::ContactMembershipsChanged(contact.clone()));
        }
    }

    fn decline_contact_invitation(&mut self, contact: &ContactKey) {
        let mut state = self.state.lock();
        state.outbound.push(Outbound::DeclineInvitation(contact.clone()));
        if state.update_memberships(contact, |m| {
            m.remove(Memberships::PENDING);
            m.insert(Memberships::BLOCK);
        }) {
            state.emit(AccountEvent::ContactMembershipsChanged(contact.clone()));
        }
    }

    fn set_contact_alias(&mut self, contact: &ContactKey, alias: &str) {
        let mut state = self.state.lock();
        state.outbound.push(Outbound::SetContactAlias {
            contact: contact.clone(),
            alias: alias.to_string(),
        });
        if !state.loopback {
            return;
        }
        if let Some(entry) = state.contacts.get_mut(contact) {
            entry.nickname = (!alias.is_empty()).then(|| alias.to_string());
            state.emit(AccountEvent::ContactAliasChanged(contact.clone()));
        }
    }

    fn add_group(&mut self, name: &str) {
        let mut state = self.state.lock();
        state.outbound.push(Outbound::AddGroup(name.to_string()));
        if state.loopback {
            let id = GroupId(format!("group-{}", state.next_id()));
            let group = Group {
                id: id.clone(),
                name: name.to_string(),
            };
            state.groups.insert(id, group.clone());
            state.emit(AccountEvent::GroupAdded(group));
        }
    }

    fn rename_group(&mut self, group: &GroupId, name: &str) {
        let mut state = self.state.lock();
        state.outbound.push(Outbound::RenameGroup {
            group: group.clone(),
            name: name.to_string(),
        });
        if !state.loopback {
            return;
        }
        if let Some(entry) = state.groups.get_mut(group) {
            entry.name = name.to_string();
            let renamed = entry.clone();
            state.emit(AccountEvent::GroupRenamed(renamed));
        }
    }

    fn delete_group(&mut self, group: &GroupId) {
        let mut state = self.state.lock();
        state.outbound.push(Outbound::DeleteGroup(group.clone()));
        if !state.loopback {
            return;
        }
        if let Some(removed) = state.groups.remove(group) {
            for contact in state.contacts.values_mut() {
                contact.groups.remove(group);
            }
            state.emit(AccountEvent::GroupDeleted(removed));
        }
    }

    fn add_contact_to_group(&mut self, group: &GroupId, contact: &ContactKey) {
        let mut state = self.state.lock();
        state.outbound.push(Outbound::AddToGroup {
            group: group.clone(),
            contact: contact.clone(),
        });
        if !state.loopback {
            return;
        }
        if let Some(entry) = state.contacts.get_mut(contact) {
            entry.groups.insert(group.clone());
            state.emit(AccountEvent::GroupContactAdded {
                group: group.clone(),
                contact: contact.clone(),
            });
        }
    }

    fn remove_contact_from_group(&mut self, group: &GroupId, contact: &ContactKey) {
        let mut state = self.state.lock();
        state.outbound.push(Outbound::RemoveFromGroup {
            group: group.clone(),
            contact: contact.clone(),
        });
        if !state.loopback {
            return;
        }
        if let Some(entry) = state.contacts.get_mut(contact)
            && entry.groups.remove(group)
        {
            state.emit(AccountEvent::GroupContactDeleted {
                group: group.clone(),
                contact: contact.clone(),
            });
        }
    }

    fn create_conversation(&mut self, participants: &[ContactKey]) -> ConversationId {
        let mut state = self.state.lock();
        let id = ConversationId(state.next_id());
        state.conversations.insert(id, participants.to_vec());
        state.outbound.push(Outbound::CreateConversation {
            id,
            participants: participants.to_vec(),
        });
        for contact in participants {
            state.reflect(AccountEvent::UserJoined {
                conversation: id,
                contact: contact.clone(),
            });
        }
        id
    }

    fn send_text(&mut self, conversation: ConversationId, text: &str) {
        self.record(Outbound::SendText {
            conversation,
            text: text.to_string(),
        });
    }

    fn send_nudge(&mut self, conversation: ConversationId) {
        self.record(Outbound::SendNudge(conversation));
    }

    fn send_typing(&mut self, conversation: ConversationId) {
        self.record(Outbound::SendTyping(conversation));
    }

    fn invite_user(&mut self, conversation: ConversationId, contact: &ContactKey) {
        let mut state = self.state.lock();
        state.outbound.push(Outbound::InviteUser {
            conversation,
            contact: contact.clone(),
        });
        if let Some(participants) = state.conversations.get_mut(&conversation)
            && !participants.contains(contact)
        {
            participants.push(contact.clone());
        }
        state.reflect(AccountEvent::UserJoined {
            conversation,
            contact: contact.clone(),
        });
    }

    fn leave_conversation(&mut self, conversation: ConversationId) {
        let mut state = self.state.lock();
        state.outbound.push(Outbound::LeaveConversation(conversation));
        state.conversations.remove(&conversation);
    }

    fn send_offline_message(&mut self, recipient: &ContactKey, text: &str) {
        self.record(Outbound::SendOfflineMessage {
            recipient: recipient.clone(),
            text: text.to_string(),
        });
    }

    fn delete_offline_messages(&mut self, ids: &[String]) {
        self.record(Outbound::DeleteOfflineMessages(ids.to_vec()));
    }

    fn create_call(&mut self, peer: &ContactKey) -> CallId {
        let mut state = self.state.lock();
        let id = CallId(state.next_id());
        state.outbound.push(Outbound::CreateCall {
            id,
            peer: peer.clone(),
        });
        state.reflect(AccountEvent::CallRinging(id));
        id
    }

    fn accept_call(&mut self, call: CallId) {
        self.record(Outbound::AcceptCall(call));
    }

    fn reject_call(&mut self, call: CallId) {
        self.record(Outbound::RejectCall(call));
    }

    fn end_call(&mut self, call: CallId) {
        self.record(Outbound::EndCall(call));
    }

    fn create_stream(
        &mut self,
        call: CallId,
        kind: MediaKind,
        direction: StreamDirection,
    ) -> MediaStreamId {
        let mut state = self.state.lock();
        let id = MediaStreamId(state.next_id());
        state.outbound.push(Outbound::CreateStream {
            call,
            id,
            kind,
            direction,
        });
        id
    }

    fn remove_stream(&mut self, call: CallId, stream: MediaStreamId) {
        self.record(Outbound::RemoveStream { call, stream });
    }

    fn set_stream_direction(
        &mut self,
        call: CallId,
        stream: MediaStreamId,
        direction: StreamDirection,
    ) {
        self.record(Outbound::SetStreamDirection {
            call,
            stream,
            direction,
        });
    }

    fn send_file(&mut self, peer: &ContactKey, filename: &str, size: u64) -> TransferId {
        let mut state = self.state.lock();
        let id = TransferId(state.next_id());
        state.outbound.push(Outbound::SendFile {
            id,
            peer: peer.clone(),
            filename: filename.to_string(),
            size,
        });
        id
    }

    fn accept_transfer(&mut self, transfer: TransferId) {
        let mut state = self.state.lock();
        state.outbound.push(Outbound::AcceptTransfer(transfer));
        state.reflect(AccountEvent::TransferAccepted(transfer));
    }

    fn cancel_transfer(&mut self, transfer: TransferId) {
        self.record(Outbound::CancelTransfer(transfer));
    }

    fn attach_transfer_socket(&mut self, transfer: TransferId, socket: TcpStream) {
        let mut state = self.state.lock();
        state.outbound.push(Outbound::AttachTransferSocket(transfer));
        state.transfer_sockets.push((transfer, socket));
    }

    fn request_inbox_url(&mut self) {
        let mut state = self.state.lock();
        state.outbound.push(Outbound::RequestInboxUrl);
        if state.loopback {
            let url = state.inbox_url.clone().unwrap_or_else(|| InboxUrl {
                post_url: "https://mail.example.invalid/login".to_string(),
                form_data: vec![("account".to_string(), state.profile.account.clone())],
            });
            state.emit(AccountEvent::InboxUrlReady(url));
        }
    }

    fn request_avatar(&mut self, contact: &ContactKey, token: &str) {
        let mut state = self.state.lock();
        state.outbound.push(Outbound::RequestAvatar {
            contact: contact.clone(),
            token: token.to_string(),
        });
        if let Some(data) = state.pictures.get(token).cloned() {
            state.reflect(AccountEvent::AvatarRetrieved {
                contact: contact.clone(),
                picture: DisplayPicture {
                    token: token.to_string(),
                    data,
                },
            });
        }
    }

    fn set_avatar(&mut self, data: &[u8]) -> String {
        let picture = DisplayPicture::new(data.to_vec());
        let mut state = self.state.lock();
        state.outbound.push(Outbound::SetAvatar(picture.token.clone()));
        state.profile.avatar_token = Some(picture.token.clone());
        state.pictures.insert(picture.token.clone(), picture.data);
        picture.token
    }

    fn clear_avatar(&mut self) {
        let mut state = self.state.lock();
        state.outbound.push(Outbound::ClearAvatar);
        state.profile.avatar_token = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn key(s: &str) -> ContactKey {
        ContactKey::native(s)
    }

    #[test]
    fn records_commands_without_reflecting() {
        let account = MemoryAccount::new("me@example.com");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut client = account.clone();
        client.set_event_sink(tx);

        client.add_contact(&key("bob@example.com"));
        assert_eq!(
            account.outbound(),
            vec![Outbound::AddContact(key("bob@example.com"))]
        );
        assert!(rx.try_recv().is_err());
        assert!(account.contact(&key("bob@example.com")).is_none());
    }

    #[test]
    fn loopback_login_walks_every_state() {
        let account = MemoryAccount::loopback("me@example.com");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut client = account.clone();
        client.set_event_sink(tx);

        client.login(&LoginParams {
            account: "me@example.com".to_string(),
            ..Default::default()
        });

        let mut states = Vec::new();
        while let Ok(AccountEvent::StateChanged(state)) = rx.try_recv() {
            states.push(state);
        }
        assert_eq!(states.first(), Some(&ClientState::Connecting));
        assert_eq!(states.last(), Some(&ClientState::Open));
    }

    #[test]
    fn loopback_add_contact_updates_book() {
        let account = MemoryAccount::loopback("me@example.com");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut client = account.clone();
        client.set_event_sink(tx);

        client.add_contact(&key("bob@example.com"));
        let contact = account.contact(&key("bob@example.com")).unwrap();
        assert!(contact.memberships.contains(Memberships::FORWARD));
        assert_eq!(
            rx.try_recv().unwrap(),
            AccountEvent::ContactAdded(key("bob@example.com"))
        );
    }

    #[test]
    fn ids_are_unique_across_kinds() {
        let mut account = MemoryAccount::new("me@example.com");
        let conversation = account.create_conversation(&[key("a@example.com")]);
        let call = account.create_call(&key("a@example.com"));
        assert_ne!(conversation.0, call.0);
        assert_eq!(
            account.conversation_participants(conversation),
            vec![key("a@example.com")]
        );
    }

    #[test]
    fn loopback_answers_known_pictures() {
        let account = MemoryAccount::loopback("me@example.com");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut client = account.clone();
        client.set_event_sink(tx);
        account.insert_contact(Contact::new(key("bob@example.com")));
        let token = account.set_contact_picture(&key("bob@example.com"), b"GIF89a..".to_vec());
        assert_eq!(
            account.contact(&key("bob@example.com")).unwrap().avatar_token,
            Some(token.clone())
        );

        client.request_avatar(&key("bob@example.com"), "unknown");
        assert!(rx.try_recv().is_err());

        client.request_avatar(&key("bob@example.com"), &token);
        match rx.try_recv().unwrap() {
            AccountEvent::AvatarRetrieved { contact, picture } => {
                assert_eq!(contact, key("bob@example.com"));
                assert_eq!(picture.token, token);
                assert_eq!(picture.data, b"GIF89a..".to_vec());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn own_picture_lands_in_the_profile() {
        let mut account = MemoryAccount::new("me@example.com");
        let token = account.set_avatar(b"picture");
        assert_eq!(token, crate::types::picture_token(b"picture"));
        assert_eq!(account.profile().avatar_token, Some(token.clone()));
        account.clear_avatar();
        assert_eq!(account.profile().avatar_token, None);
        assert_eq!(
            account.take_outbound(),
            vec![Outbound::SetAvatar(token), Outbound::ClearAvatar]
        );
    }
}
