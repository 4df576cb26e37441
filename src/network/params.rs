//! Connection parameters.
//!
//! Parameters arrive as a loose name → value map (from the control surface
//! or an `[[accounts]]` block) and are checked against a fixed table.

use std::collections::BTreeMap;
use std::fmt;

use imgate_account::{LoginParams, ProxyInfo, ProxyScheme};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{GatewayError, GatewayResult};

/// The only protocol this gateway speaks.
pub const PROTOCOL: &str = "msn";

pub const DEFAULT_SERVER: &str = "messenger.hotmail.com";
pub const DEFAULT_PORT: u16 = 1863;

/// A parameter value as written by the caller.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Str(String),
    UInt(u64),
    Bool(bool),
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<u64> for ParamValue {
    fn from(value: u64) -> Self {
        Self::UInt(value)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    Str,
    UInt,
}

/// Parameter flags.
pub const REQUIRED: u32 = 1;
pub const REGISTER: u32 = 2;
pub const HAS_DEFAULT: u32 = 4;
pub const SECRET: u32 = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ParamDefault {
    Str(&'static str),
    UInt(u64),
}

/// Description of one accepted parameter.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub flags: u32,
    pub default: Option<ParamDefault>,
}

impl ParamSpec {
    const fn new(name: &'static str, kind: ParamKind, flags: u32) -> Self {
        Self {
            name,
            kind,
            flags,
            default: None,
        }
    }

    const fn with_default(mut self, default: ParamDefault) -> Self {
        self.flags |= HAS_DEFAULT;
        self.default = Some(default);
        self
    }

    pub fn is_secret(&self) -> bool {
        self.flags & SECRET != 0
    }
}

const PARAMETERS: &[ParamSpec] = &[
    ParamSpec::new("account", ParamKind::Str, REQUIRED | REGISTER),
    ParamSpec::new("password", ParamKind::Str, REQUIRED | REGISTER | SECRET),
    ParamSpec::new("server", ParamKind::Str, 0).with_default(ParamDefault::Str(DEFAULT_SERVER)),
    ParamSpec::new("port", ParamKind::UInt, 0)
        .with_default(ParamDefault::UInt(DEFAULT_PORT as u64)),
    ParamSpec::new("http-proxy-server", ParamKind::Str, 0),
    ParamSpec::new("http-proxy-port", ParamKind::UInt, 0),
    ParamSpec::new("http-proxy-username", ParamKind::Str, 0),
    ParamSpec::new("http-proxy-password", ParamKind::Str, SECRET),
    ParamSpec::new("https-proxy-server", ParamKind::Str, 0),
    ParamSpec::new("https-proxy-port", ParamKind::UInt, 0),
    ParamSpec::new("https-proxy-username", ParamKind::Str, 0),
    ParamSpec::new("https-proxy-password", ParamKind::Str, SECRET),
];

/// Parameters accepted by `protocol`.
pub fn parameters(protocol: &str) -> GatewayResult<&'static [ParamSpec]> {
    if protocol == PROTOCOL {
        Ok(PARAMETERS)
    } else {
        Err(GatewayError::unimplemented(format!(
            "unknown protocol '{protocol}'"
        )))
    }
}

#[derive(Clone)]
struct Proxy {
    host: String,
    port: u16,
    username: Option<String>,
    password: Option<Zeroizing<String>>,
}

/// Validated connection parameters.
#[derive(Clone)]
pub struct ConnectionParams {
    pub account: String,
    password: Zeroizing<String>,
    pub server: String,
    pub port: u16,
    http_proxy: Option<Proxy>,
    https_proxy: Option<Proxy>,
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("account", &self.account)
            .field("password", &"<redacted>")
            .field("server", &self.server)
            .field("port", &self.port)
            .field("http_proxy", &self.http_proxy.as_ref().map(|p| (&p.host, p.port)))
            .field("https_proxy", &self.https_proxy.as_ref().map(|p| (&p.host, p.port)))
            .finish()
    }
}

struct Reader<'a> {
    map: &'a BTreeMap<String, ParamValue>,
}

impl Reader<'_> {
    fn str(&self, name: &str) -> Option<String> {
        match self.map.get(name) {
            Some(ParamValue::Str(s)) => Some(s.clone()),
            _ => None,
        }
    }

    fn uint(&self, name: &str) -> GatewayResult<Option<u16>> {
        match self.map.get(name) {
            Some(ParamValue::UInt(n)) => u16::try_from(*n)
                .map(Some)
                .map_err(|_| GatewayError::invalid_argument(format!("{name} out of range: {n}"))),
            _ => Ok(None),
        }
    }

    fn proxy(&self, prefix: &str) -> GatewayResult<Option<Proxy>> {
        let host = self.str(&format!("{prefix}-server"));
        let port = self.uint(&format!("{prefix}-port"))?;
        let (Some(host), Some(port)) = (host, port) else {
            return Ok(None);
        };
        Ok(Some(Proxy {
            host,
            port,
            username: self.str(&format!("{prefix}-username")),
            password: self.str(&format!("{prefix}-password")).map(Zeroizing::new),
        }))
    }
}

impl ConnectionParams {
    /// Check `map` against the parameter table: unknown names, wrong types
    /// and missing required values are rejected.
    pub fn from_map(map: &BTreeMap<String, ParamValue>) -> GatewayResult<Self> {
        for (name, value) in map {
            let spec = PARAMETERS
                .iter()
                .find(|s| s.name == name)
                .ok_or_else(|| GatewayError::invalid_argument(format!("unknown parameter '{name}'")))?;
            let ok = matches!(
                (spec.kind, value),
                (ParamKind::Str, ParamValue::Str(_)) | (ParamKind::UInt, ParamValue::UInt(_))
            );
            if !ok {
                return Err(GatewayError::invalid_argument(format!(
                    "parameter '{name}' has the wrong type"
                )));
            }
        }
        for spec in PARAMETERS.iter().filter(|s| s.flags & REQUIRED != 0) {
            if !map.contains_key(spec.name) {
                return Err(GatewayError::invalid_argument(format!(
                    "missing required parameter '{}'",
                    spec.name
                )));
            }
        }

        let reader = Reader { map };
        let account = reader.str("account").unwrap_or_default();
        if account.is_empty() {
            return Err(GatewayError::invalid_argument("account must not be empty"));
        }
        Ok(Self {
            account,
            password: Zeroizing::new(reader.str("password").unwrap_or_default()),
            server: reader
                .str("server")
                .unwrap_or_else(|| DEFAULT_SERVER.to_string()),
            port: reader.uint("port")?.unwrap_or(DEFAULT_PORT),
            http_proxy: reader.proxy("http-proxy")?,
            https_proxy: reader.proxy("https-proxy")?,
        })
    }

    /// What the account client needs to log in.
    pub fn login_params(&self) -> LoginParams {
        let proxies = [
            (ProxyScheme::Http, &self.http_proxy),
            (ProxyScheme::Https, &self.https_proxy),
        ]
        .into_iter()
        .filter_map(|(scheme, proxy)| {
            proxy.as_ref().map(|p| ProxyInfo {
                scheme,
                host: p.host.clone(),
                port: p.port,
                username: p.username.clone(),
                password: p.password.as_ref().map(|s| s.to_string()),
            })
        })
        .collect();
        LoginParams {
            account: self.account.clone(),
            password: self.password.to_string(),
            server: self.server.clone(),
            port: self.port,
            proxies,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> BTreeMap<String, ParamValue> {
        BTreeMap::from([
            ("account".to_string(), ParamValue::from("me@example.com")),
            ("password".to_string(), ParamValue::from("hunter2")),
        ])
    }

    #[test]
    fn defaults_fill_server_and_port() {
        let params = ConnectionParams::from_map(&base()).unwrap();
        assert_eq!(params.server, DEFAULT_SERVER);
        assert_eq!(params.port, DEFAULT_PORT);
        assert!(params.login_params().proxies.is_empty());
    }

    #[test]
    fn missing_unknown_and_mistyped_are_rejected() {
        let mut map = base();
        map.remove("password");
        assert!(ConnectionParams::from_map(&map).is_err());

        let mut map = base();
        map.insert("colour".into(), ParamValue::from("blue"));
        assert!(ConnectionParams::from_map(&map).is_err());

        let mut map = base();
        map.insert("port".into(), ParamValue::from("1863"));
        let err = ConnectionParams::from_map(&map).unwrap_err();
        assert_eq!(err.error_code(), "invalid_argument");
    }

    #[test]
    fn proxy_needs_server_and_port() {
        let mut map = base();
        map.insert("http-proxy-server".into(), ParamValue::from("proxy.local"));
        let params = ConnectionParams::from_map(&map).unwrap();
        assert!(params.login_params().proxies.is_empty());

        map.insert("http-proxy-port".into(), ParamValue::from(3128));
        map.insert("http-proxy-password".into(), ParamValue::from("pw"));
        let proxies = ConnectionParams::from_map(&map).unwrap().login_params().proxies;
        assert_eq!(proxies.len(), 1);
        assert_eq!(proxies[0].scheme, ProxyScheme::Http);
        assert_eq!(proxies[0].port, 3128);
        assert_eq!(proxies[0].password.as_deref(), Some("pw"));
    }

    #[test]
    fn debug_never_shows_the_password() {
        let params = ConnectionParams::from_map(&base()).unwrap();
        let rendered = format!("{params:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn only_one_protocol_is_known() {
        assert!(parameters(PROTOCOL).unwrap().iter().any(|p| p.name == "password" && p.is_secret()));
        assert_eq!(parameters("irc").unwrap_err().error_code(), "not_implemented");
    }
}
