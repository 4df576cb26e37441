//! Channel request properties and their classification.
//!
//! A request is a flat property map. [`classify`] matches it against
//! [`REQUEST_CLASSES`] in order; the first entry whose channel type and
//! target handle type match, and whose required and allowed property names
//! fit, decides what gets built.

use std::collections::BTreeMap;

use imgate_account::MediaKind;
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};
use crate::state::channels::{ChannelId, ChannelKind};
use crate::state::handle::{Handle, HandleId, HandleRegistry, HandleType};

pub mod props {
    pub const CHANNEL_TYPE: &str = "channel_type";
    pub const TARGET_HANDLE_TYPE: &str = "target_handle_type";
    pub const TARGET_HANDLE: &str = "target_handle";
    pub const TARGET_ID: &str = "target_id";
    pub const INITIAL_CHANNELS: &str = "initial_channels";
    pub const INITIAL_INVITEE_HANDLES: &str = "initial_invitee_handles";
    pub const INITIAL_INVITEE_IDS: &str = "initial_invitee_ids";
    pub const INITIAL_AUDIO: &str = "initial_audio";
    pub const INITIAL_VIDEO: &str = "initial_video";
    pub const FILENAME: &str = "filename";
    pub const SIZE: &str = "size";
    pub const CONTENT_TYPE: &str = "content_type";
    pub const DESCRIPTION: &str = "description";
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    UInt(u64),
    Str(String),
    UIntList(Vec<u64>),
    StrList(Vec<String>),
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<u64> for PropertyValue {
    fn from(v: u64) -> Self {
        Self::UInt(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<Vec<u64>> for PropertyValue {
    fn from(v: Vec<u64>) -> Self {
        Self::UIntList(v)
    }
}

impl From<Vec<String>> for PropertyValue {
    fn from(v: Vec<String>) -> Self {
        Self::StrList(v)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestProperties(BTreeMap<String, PropertyValue>);

impl RequestProperties {
    pub fn new() -> Self {
        Self::default()
    }

    /// A plain `(kind, target)` request, as `request_channel` makes.
    pub fn targeted(kind: ChannelKind, target_type: HandleType, target: HandleId) -> Self {
        let props = Self::new()
            .with(props::CHANNEL_TYPE, kind.as_str())
            .with(props::TARGET_HANDLE_TYPE, target_type.as_str());
        if target_type == HandleType::None {
            props
        } else {
            props.with(props::TARGET_HANDLE, u64::from(target.0))
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<PropertyValue>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn str(&self, key: &str) -> GatewayResult<Option<&str>> {
        match self.0.get(key) {
            None => Ok(None),
            Some(PropertyValue::Str(s)) => Ok(Some(s)),
            Some(_) => Err(wrong_type(key, "a string")),
        }
    }

    pub fn uint(&self, key: &str) -> GatewayResult<Option<u64>> {
        match self.0.get(key) {
            None => Ok(None),
            Some(PropertyValue::UInt(v)) => Ok(Some(*v)),
            Some(_) => Err(wrong_type(key, "an unsigned integer")),
        }
    }

    pub fn bool(&self, key: &str) -> GatewayResult<bool> {
        match self.0.get(key) {
            None => Ok(false),
            Some(PropertyValue::Bool(v)) => Ok(*v),
            Some(_) => Err(wrong_type(key, "a boolean")),
        }
    }

    /// Empty lists deserialize as integer lists, so both shapes are
    /// accepted when empty.
    pub fn uint_list(&self, key: &str) -> GatewayResult<Vec<u64>> {
        match self.0.get(key) {
            None => Ok(Vec::new()),
            Some(PropertyValue::UIntList(v)) => Ok(v.clone()),
            Some(PropertyValue::StrList(v)) if v.is_empty() => Ok(Vec::new()),
            Some(_) => Err(wrong_type(key, "a list of unsigned integers")),
        }
    }

    pub fn str_list(&self, key: &str) -> GatewayResult<Vec<String>> {
        match self.0.get(key) {
            None => Ok(Vec::new()),
            Some(PropertyValue::StrList(v)) => Ok(v.clone()),
            Some(PropertyValue::UIntList(v)) if v.is_empty() => Ok(Vec::new()),
            Some(_) => Err(wrong_type(key, "a list of strings")),
        }
    }
}

fn wrong_type(key: &str, expected: &str) -> GatewayError {
    GatewayError::invalid_argument(format!("property '{key}' must be {expected}"))
}

/// What a request class builds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Shape {
    ContactList,
    Text,
    Conference,
    Media,
    FileTransfer,
}

/// One row of the classification table.
#[derive(Debug)]
pub struct RequestClass {
    pub kind: ChannelKind,
    pub target_type: HandleType,
    pub required: &'static [&'static str],
    pub allowed: &'static [&'static str],
    pub shape: Shape,
}

const TARGET: &[&str] = &[props::TARGET_HANDLE, props::TARGET_ID];

pub const REQUEST_CLASSES: &[RequestClass] = &[
    RequestClass {
        kind: ChannelKind::ContactList,
        target_type: HandleType::List,
        required: &[],
        allowed: TARGET,
        shape: Shape::ContactList,
    },
    RequestClass {
        kind: ChannelKind::ContactList,
        target_type: HandleType::Group,
        required: &[],
        allowed: TARGET,
        shape: Shape::ContactList,
    },
    RequestClass {
        kind: ChannelKind::Text,
        target_type: HandleType::Contact,
        required: &[],
        allowed: TARGET,
        shape: Shape::Text,
    },
    RequestClass {
        kind: ChannelKind::Text,
        target_type: HandleType::None,
        required: &[],
        allowed: &[
            props::INITIAL_CHANNELS,
            props::INITIAL_INVITEE_HANDLES,
            props::INITIAL_INVITEE_IDS,
        ],
        shape: Shape::Conference,
    },
    RequestClass {
        kind: ChannelKind::StreamedMedia,
        target_type: HandleType::Contact,
        required: &[],
        allowed: &[
            props::TARGET_HANDLE,
            props::TARGET_ID,
            props::INITIAL_AUDIO,
            props::INITIAL_VIDEO,
        ],
        shape: Shape::Media,
    },
    RequestClass {
        kind: ChannelKind::FileTransfer,
        target_type: HandleType::Contact,
        required: &[props::FILENAME, props::SIZE],
        allowed: &[
            props::TARGET_HANDLE,
            props::TARGET_ID,
            props::FILENAME,
            props::SIZE,
            props::CONTENT_TYPE,
            props::DESCRIPTION,
        ],
        shape: Shape::FileTransfer,
    },
];

fn fits(class: &RequestClass, props: &RequestProperties) -> bool {
    class.required.iter().all(|key| props.contains(key))
        && props.keys().all(|key| {
            key == props::CHANNEL_TYPE
                || key == props::TARGET_HANDLE_TYPE
                || class.allowed.contains(&key)
        })
}

/// Find the first table row the request matches.
pub fn find_class(props: &RequestProperties) -> GatewayResult<&'static RequestClass> {
    let kind: ChannelKind = props
        .str(props::CHANNEL_TYPE)?
        .ok_or_else(|| GatewayError::invalid_argument("request has no channel type"))?
        .parse()?;
    let target_type = match props.str(props::TARGET_HANDLE_TYPE)? {
        Some(name) => name.parse()?,
        None => HandleType::None,
    };
    REQUEST_CLASSES
        .iter()
        .find(|class| class.kind == kind && class.target_type == target_type && fits(class, props))
        .ok_or_else(|| {
            GatewayError::unimplemented(format!(
                "no {} channel for {} targets with these properties",
                kind.as_str(),
                target_type.as_str()
            ))
        })
}

/// A classified request with its handles resolved.
#[derive(Clone, Debug)]
pub enum ChannelRequest {
    List(Handle),
    Text(Handle),
    Conference {
        donors: Vec<ChannelId>,
        invitees: Vec<Handle>,
    },
    Media {
        peer: Handle,
        initial: Vec<MediaKind>,
    },
    FileTransfer {
        peer: Handle,
        filename: String,
        size: u64,
        content_type: String,
        description: String,
    },
}

impl ChannelRequest {
    pub fn kind(&self) -> ChannelKind {
        match self {
            Self::List(_) => ChannelKind::ContactList,
            Self::Text(_) | Self::Conference { .. } => ChannelKind::Text,
            Self::Media { .. } => ChannelKind::StreamedMedia,
            Self::FileTransfer { .. } => ChannelKind::FileTransfer,
        }
    }
}

fn resolve_target(
    handles: &mut HandleRegistry,
    props: &RequestProperties,
    target_type: HandleType,
) -> GatewayResult<Handle> {
    let by_handle = props.uint(props::TARGET_HANDLE)?;
    let by_id = props.str(props::TARGET_ID)?;
    match (by_handle, by_id) {
        (Some(_), Some(_)) => Err(GatewayError::invalid_argument(
            "target_handle and target_id are mutually exclusive",
        )),
        (Some(raw), None) => {
            let id = u32::try_from(raw)
                .map_err(|_| GatewayError::InvalidHandle(format!("handle {raw}")))?;
            handles.resolve(target_type, HandleId(id))
        }
        (None, Some(name)) => handles.parse(target_type, name),
        (None, None) => Err(GatewayError::invalid_argument(format!(
            "a {} target is required",
            target_type.as_str()
        ))),
    }
}

/// Classify `props` and resolve every handle it names.
pub fn classify(
    handles: &mut HandleRegistry,
    props: &RequestProperties,
) -> GatewayResult<ChannelRequest> {
    let class = find_class(props)?;
    match class.shape {
        Shape::ContactList => Ok(ChannelRequest::List(resolve_target(
            handles,
            props,
            class.target_type,
        )?)),
        Shape::Text => Ok(ChannelRequest::Text(resolve_target(
            handles,
            props,
            class.target_type,
        )?)),
        Shape::Conference => {
            let donors = props
                .uint_list(props::INITIAL_CHANNELS)?
                .into_iter()
                .map(ChannelId)
                .collect();
            let mut invitees = Vec::new();
            for raw in props.uint_list(props::INITIAL_INVITEE_HANDLES)? {
                let id = u32::try_from(raw)
                    .map_err(|_| GatewayError::InvalidHandle(format!("handle {raw}")))?;
                invitees.push(handles.resolve(HandleType::Contact, HandleId(id))?);
            }
            for name in props.str_list(props::INITIAL_INVITEE_IDS)? {
                invitees.push(handles.parse(HandleType::Contact, &name)?);
            }
            Ok(ChannelRequest::Conference { donors, invitees })
        }
        Shape::Media => {
            let peer = resolve_target(handles, props, class.target_type)?;
            let mut initial = Vec::new();
            if props.bool(props::INITIAL_AUDIO)? {
                initial.push(MediaKind::Audio);
            }
            if props.bool(props::INITIAL_VIDEO)? {
                initial.push(MediaKind::Video);
            }
            Ok(ChannelRequest::Media { peer, initial })
        }
        Shape::FileTransfer => {
            let peer = resolve_target(handles, props, class.target_type)?;
            let filename = props
                .str(props::FILENAME)?
                .filter(|name| !name.is_empty())
                .ok_or_else(|| GatewayError::invalid_argument("filename must not be empty"))?
                .to_string();
            let size = props.uint(props::SIZE)?.unwrap_or_default();
            Ok(ChannelRequest::FileTransfer {
                peer,
                filename,
                size,
                content_type: props
                    .str(props::CONTENT_TYPE)?
                    .unwrap_or("application/octet-stream")
                    .to_string(),
                description: props.str(props::DESCRIPTION)?.unwrap_or_default().to_string(),
            })
        }
    }
}
