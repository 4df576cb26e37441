//! Display pictures.
//!
//! Tokens name a picture by content. A contact without a picture reports no
//! token until the local user has set or cleared their own picture during
//! this session; after that an empty token means "no picture".

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use imgate_account::DisplayPicture;
use serde::{Serialize, Serializer};

use crate::error::{GatewayError, GatewayResult};

pub const MIME_TYPES: [&str; 3] = ["image/png", "image/jpeg", "image/gif"];

/// Size limits a new picture has to fit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AvatarRequirements {
    pub mime_types: Vec<String>,
    pub min_width: u32,
    pub min_height: u32,
    pub max_width: u32,
    pub max_height: u32,
    pub max_bytes: usize,
}

impl Default for AvatarRequirements {
    fn default() -> Self {
        Self {
            mime_types: MIME_TYPES.iter().map(|m| m.to_string()).collect(),
            min_width: 96,
            min_height: 96,
            max_width: 192,
            max_height: 192,
            max_bytes: 500 * 1024,
        }
    }
}

/// Guess the image type from its magic bytes; unknown data is JPEG.
pub fn sniff_mime_type(data: &[u8]) -> &'static str {
    if data.starts_with(b"\x89PNG\r\n\x1a\n") {
        "image/png"
    } else if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
        "image/gif"
    } else {
        "image/jpeg"
    }
}

/// Picture bytes travel as base64 on the control surface.
pub(crate) fn serialize_bytes<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(data))
}

#[derive(Debug, Default)]
pub struct Avatars {
    known: bool,
    own: Option<DisplayPicture>,
}

impl Avatars {
    pub fn new() -> Self {
        Self::default()
    }

    /// The token reported for a handle whose picture token is `token`.
    pub fn known_token(&self, token: Option<String>) -> Option<String> {
        token.or_else(|| self.known.then(String::new))
    }

    pub fn validate(&self, data: &[u8], mime_type: &str) -> GatewayResult<()> {
        let requirements = AvatarRequirements::default();
        if data.is_empty() {
            return Err(GatewayError::invalid_argument("avatar is empty"));
        }
        if data.len() > requirements.max_bytes {
            return Err(GatewayError::invalid_argument(format!(
                "avatar is {} bytes, at most {} allowed",
                data.len(),
                requirements.max_bytes
            )));
        }
        if !MIME_TYPES.contains(&mime_type) {
            return Err(GatewayError::invalid_argument(format!(
                "unsupported avatar type '{mime_type}'"
            )));
        }
        Ok(())
    }

    pub fn set_own(&mut self, picture: DisplayPicture) {
        self.known = true;
        self.own = Some(picture);
    }

    pub fn clear_own(&mut self) {
        self.known = true;
        self.own = None;
    }

    pub fn own(&self) -> Option<&DisplayPicture> {
        self.own.as_ref()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
