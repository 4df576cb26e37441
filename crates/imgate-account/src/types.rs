//! Address-book and session data types shared by every account client.

use std::collections::BTreeSet;
use std::fmt;
use std::ops::BitOr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::error::AccountError;

/// Network a contact account lives on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NetworkId(pub u32);

impl NetworkId {
    /// The account's own network.
    pub const NATIVE: NetworkId = NetworkId(1);
    /// Federated contacts reached through an interop bridge.
    pub const EXTERNAL: NetworkId = NetworkId(32);
}

/// Natural key of a contact: the account string plus its network.
///
/// Accounts compare case-insensitively; the key stores the lowercased form.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ContactKey {
    account: String,
    network: NetworkId,
}

impl ContactKey {
    pub fn new(account: impl AsRef<str>, network: NetworkId) -> Self {
        Self {
            account: account.as_ref().trim().to_lowercase(),
            network,
        }
    }

    /// Key for a contact on the native network.
    pub fn native(account: impl AsRef<str>) -> Self {
        Self::new(account, NetworkId::NATIVE)
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn network(&self) -> NetworkId {
        self.network
    }
}

/// Native contacts print as their account; others carry a `#<network>` suffix.
impl fmt::Display for ContactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.network == NetworkId::NATIVE {
            f.write_str(&self.account)
        } else {
            write!(f, "{}#{}", self.account, self.network.0)
        }
    }
}

impl FromStr for ContactKey {
    type Err = AccountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (account, network) = match s.rsplit_once('#') {
            Some((account, network)) => {
                let id = network
                    .parse::<u32>()
                    .map_err(|_| AccountError::InvalidNetwork(network.to_string()))?;
                (account, NetworkId(id))
            }
            None => (s, NetworkId::NATIVE),
        };
        let account = account.trim();
        if account.is_empty() {
            return Err(AccountError::EmptyAccount);
        }
        if account.chars().any(char::is_whitespace) {
            return Err(AccountError::InvalidAccount(account.to_string()));
        }
        Ok(Self::new(account, network))
    }
}

/// Presence states of the account protocol.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Presence {
    Online,
    Busy,
    Idle,
    BeRightBack,
    Away,
    OnThePhone,
    OutToLunch,
    Invisible,
    #[default]
    Offline,
}

/// Address-book membership flags of a contact.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Memberships(u8);

impl Memberships {
    pub const NONE: Self = Self(0);
    /// We subscribe to the contact's presence.
    pub const FORWARD: Self = Self(1);
    pub const ALLOW: Self = Self(2);
    pub const BLOCK: Self = Self(4);
    /// The contact has us on their list.
    pub const REVERSE: Self = Self(8);
    /// The contact asked to be added and awaits our answer.
    pub const PENDING: Self = Self(16);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl BitOr for Memberships {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Client features advertised by a contact's messenger client.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ClientCapabilities {
    pub sip_invite: bool,
    pub webcam: bool,
}

/// Group identifier assigned by the address-book service.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GroupId(pub String);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Group {
    pub id: GroupId,
    pub name: String,
}

/// Snapshot of one address-book entry.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Contact {
    pub key: ContactKey,
    pub display_name: String,
    /// Nickname annotation set by the local user.
    pub nickname: Option<String>,
    pub presence: Presence,
    pub personal_message: String,
    pub memberships: Memberships,
    pub groups: BTreeSet<GroupId>,
    pub capabilities: ClientCapabilities,
    /// Token of the contact's current display picture.
    pub avatar_token: Option<String>,
}

impl Contact {
    /// An offline contact with no memberships.
    pub fn new(key: ContactKey) -> Self {
        Self {
            display_name: key.account().to_string(),
            key,
            nickname: None,
            presence: Presence::Offline,
            personal_message: String::new(),
            memberships: Memberships::NONE,
            groups: BTreeSet::new(),
            capabilities: ClientCapabilities::default(),
            avatar_token: None,
        }
    }

    pub fn with_memberships(mut self, memberships: Memberships) -> Self {
        self.memberships = memberships;
        self
    }

    pub fn with_presence(mut self, presence: Presence) -> Self {
        self.presence = presence;
        self
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn in_group(mut self, group: GroupId) -> Self {
        self.groups.insert(group);
        self
    }

    pub fn with_avatar_token(mut self, token: impl Into<String>) -> Self {
        self.avatar_token = Some(token.into());
        self
    }
}

/// The local user's own profile.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Profile {
    pub account: String,
    pub display_name: String,
    pub presence: Presence,
    pub personal_message: String,
    pub email_enabled: bool,
    pub avatar_token: Option<String>,
}

/// Image data together with the token that names it.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DisplayPicture {
    pub token: String,
    pub data: Vec<u8>,
}

impl DisplayPicture {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            token: picture_token(&data),
            data,
        }
    }
}

/// Content token of a display picture: hex SHA-256 of the image bytes.
pub fn picture_token(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

macro_rules! session_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

session_id!(
    /// A conversation (switchboard) owned by the account client.
    ConversationId
);
session_id!(
    /// A call owned by the account client.
    CallId
);
session_id!(MediaStreamId);
session_id!(TransferId);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum MediaKind {
    Audio,
    Video,
}

/// Media stream direction, as a two-bit send/receive mask.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum StreamDirection {
    None,
    Send,
    Receive,
    #[default]
    Bidirectional,
}

impl StreamDirection {
    pub const fn bits(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Send => 1,
            Self::Receive => 2,
            Self::Bidirectional => 3,
        }
    }

    pub const fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::None),
            1 => Some(Self::Send),
            2 => Some(Self::Receive),
            3 => Some(Self::Bidirectional),
            _ => None,
        }
    }

    pub const fn sends(self) -> bool {
        self.bits() & 1 != 0
    }
}

/// Description of a file transfer offered or requested.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TransferInfo {
    pub id: TransferId,
    pub peer: ContactKey,
    pub filename: String,
    pub size: u64,
    pub incoming: bool,
}

/// A mail notification delivered by the mailbox service.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MailMessage {
    pub sender_name: String,
    pub sender_address: String,
    pub subject: String,
    pub post_url: String,
    pub form_data: Vec<(String, String)>,
}

/// Login URL of the web inbox: POST target plus form fields.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct InboxUrl {
    pub post_url: String,
    pub form_data: Vec<(String, String)>,
}

/// A message stored by the service while we were offline.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OfflineMessage {
    pub id: String,
    pub sender: ContactKey,
    pub text: String,
    pub date: DateTime<Utc>,
}
