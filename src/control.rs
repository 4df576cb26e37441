//! JSON-lines control surface.
//!
//! Each input line is one request object:
//!
//! ```json
//! {"id": 3, "method": "send", "connection": "…", "channel": 4, "kind": "normal", "text": "hi"}
//! ```
//!
//! Every request gets exactly one reply line carrying the same `id`, either
//! `{"kind":"reply","id":3,"result":…}` or
//! `{"kind":"error","id":3,"code":"…","message":"…"}`. Signals from every
//! connection are written as `{"kind":"signal","connection":"…",…}` lines as
//! they happen.

use std::collections::BTreeMap;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use imgate_account::{MediaKind, StreamDirection};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tracing::{Instrument, debug, info, warn};

use crate::error::{GatewayError, GatewayResult};
use crate::network::{Gateway, ParamValue};
use crate::state::avatars::AvatarRequirements;
use crate::state::channels::text::{ChatState, MessageKind};
use crate::state::contacts::ContactInterface;
use crate::state::managers::RequestProperties;
use crate::state::presence;
use crate::state::{
    ChannelId, ChannelKind, ConnectionHandle, ConnectionId, HandleId, HandleType, Signal,
};
use crate::telemetry::{CallTimer, spans};

/// One request line.
#[derive(Debug, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: u64,
    #[serde(flatten)]
    pub call: Call,
}

/// Every method the control surface understands.
#[derive(Debug, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Call {
    // Connection manager
    Parameters {
        protocol: String,
    },
    RequestConnection {
        protocol: String,
        #[serde(default)]
        params: BTreeMap<String, ParamValue>,
    },
    ListConnections,
    Quit,

    // Lifecycle
    Connect {
        connection: String,
    },
    Disconnect {
        connection: String,
    },
    Status {
        connection: String,
    },
    SelfHandle {
        connection: String,
    },

    // Handles
    RequestHandles {
        connection: String,
        handle_type: HandleType,
        names: Vec<String>,
    },
    InspectHandles {
        connection: String,
        handle_type: HandleType,
        handles: Vec<HandleId>,
    },
    ReleaseHandles {
        connection: String,
        handle_type: HandleType,
        handles: Vec<HandleId>,
    },

    // Channels
    RequestChannel {
        connection: String,
        channel_type: ChannelKind,
        handle_type: HandleType,
        handle: HandleId,
    },
    EnsureChannel {
        connection: String,
        properties: RequestProperties,
    },
    GetChannels {
        connection: String,
    },
    Close {
        connection: String,
        channel: ChannelId,
    },

    // Text
    Send {
        connection: String,
        channel: ChannelId,
        #[serde(default = "default_message_kind")]
        kind: MessageKind,
        text: String,
    },
    SetChatState {
        connection: String,
        channel: ChannelId,
        state: ChatState,
    },
    AcknowledgePending {
        connection: String,
        channel: ChannelId,
        ids: Vec<u32>,
    },
    ListPending {
        connection: String,
        channel: ChannelId,
        #[serde(default)]
        clear: bool,
    },

    // Membership
    GetMembers {
        connection: String,
        channel: ChannelId,
    },
    AddMembers {
        connection: String,
        channel: ChannelId,
        handles: Vec<HandleId>,
        #[serde(default)]
        message: String,
    },
    RemoveMembers {
        connection: String,
        channel: ChannelId,
        handles: Vec<HandleId>,
        #[serde(default)]
        message: String,
    },

    // Media
    ListStreams {
        connection: String,
        channel: ChannelId,
    },
    RequestStreams {
        connection: String,
        channel: ChannelId,
        contact: HandleId,
        types: Vec<MediaKind>,
    },
    RemoveStreams {
        connection: String,
        channel: ChannelId,
        streams: Vec<u32>,
    },
    RequestStreamDirection {
        connection: String,
        channel: ChannelId,
        stream: u32,
        direction: StreamDirection,
    },

    // File transfer
    TransferDetails {
        connection: String,
        channel: ChannelId,
    },
    AcceptFile {
        connection: String,
        channel: ChannelId,
        #[serde(default)]
        offset: u64,
    },
    ProvideFile {
        connection: String,
        channel: ChannelId,
    },

    // Presence, aliases, capabilities
    GetStatuses,
    SetPresence {
        connection: String,
        status: String,
        #[serde(default)]
        message: String,
    },
    GetPresences {
        connection: String,
        handles: Vec<HandleId>,
    },
    GetAliases {
        connection: String,
        handles: Vec<HandleId>,
    },
    SetAliases {
        connection: String,
        aliases: Vec<(HandleId, String)>,
    },
    GetCapabilities {
        connection: String,
        handles: Vec<HandleId>,
    },

    // Avatars and contact attributes
    GetAvatarRequirements,
    GetKnownAvatarTokens {
        connection: String,
        handles: Vec<HandleId>,
    },
    RequestAvatars {
        connection: String,
        handles: Vec<HandleId>,
    },
    SetAvatar {
        connection: String,
        /// Base64 image bytes.
        data: String,
        mime_type: String,
    },
    ClearAvatar {
        connection: String,
    },
    GetContactAttributeInterfaces,
    GetContactAttributes {
        connection: String,
        handles: Vec<HandleId>,
        #[serde(default)]
        interfaces: Vec<String>,
        #[serde(default)]
        hold: bool,
    },

    // Mail
    MailCapabilities {
        connection: String,
    },
    UnreadMailCount {
        connection: String,
    },
    RequestInboxUrl {
        connection: String,
    },
    RequestMailUrl {
        connection: String,
        mail_id: String,
        url_data: String,
    },
}

fn default_message_kind() -> MessageKind {
    MessageKind::Normal
}

impl Call {
    /// Method name, for spans and timing.
    pub fn method(&self) -> &'static str {
        match self {
            Self::Parameters { .. } => "parameters",
            Self::RequestConnection { .. } => "request_connection",
            Self::ListConnections => "list_connections",
            Self::Quit => "quit",
            Self::Connect { .. } => "connect",
            Self::Disconnect { .. } => "disconnect",
            Self::Status { .. } => "status",
            Self::SelfHandle { .. } => "self_handle",
            Self::RequestHandles { .. } => "request_handles",
            Self::InspectHandles { .. } => "inspect_handles",
            Self::ReleaseHandles { .. } => "release_handles",
            Self::RequestChannel { .. } => "request_channel",
            Self::EnsureChannel { .. } => "ensure_channel",
            Self::GetChannels { .. } => "get_channels",
            Self::Close { .. } => "close",
            Self::Send { .. } => "send",
            Self::SetChatState { .. } => "set_chat_state",
            Self::AcknowledgePending { .. } => "acknowledge_pending",
            Self::ListPending { .. } => "list_pending",
            Self::GetMembers { .. } => "get_members",
            Self::AddMembers { .. } => "add_members",
            Self::RemoveMembers { .. } => "remove_members",
            Self::ListStreams { .. } => "list_streams",
            Self::RequestStreams { .. } => "request_streams",
            Self::RemoveStreams { .. } => "remove_streams",
            Self::RequestStreamDirection { .. } => "request_stream_direction",
            Self::TransferDetails { .. } => "transfer_details",
            Self::AcceptFile { .. } => "accept_file",
            Self::ProvideFile { .. } => "provide_file",
            Self::GetStatuses => "get_statuses",
            Self::SetPresence { .. } => "set_presence",
            Self::GetPresences { .. } => "get_presences",
            Self::GetAliases { .. } => "get_aliases",
            Self::SetAliases { .. } => "set_aliases",
            Self::GetCapabilities { .. } => "get_capabilities",
            Self::GetAvatarRequirements => "get_avatar_requirements",
            Self::GetKnownAvatarTokens { .. } => "get_known_avatar_tokens",
            Self::RequestAvatars { .. } => "request_avatars",
            Self::SetAvatar { .. } => "set_avatar",
            Self::ClearAvatar { .. } => "clear_avatar",
            Self::GetContactAttributeInterfaces => "get_contact_attribute_interfaces",
            Self::GetContactAttributes { .. } => "get_contact_attributes",
            Self::MailCapabilities { .. } => "mail_capabilities",
            Self::UnreadMailCount { .. } => "unread_mail_count",
            Self::RequestInboxUrl { .. } => "request_inbox_url",
            Self::RequestMailUrl { .. } => "request_mail_url",
        }
    }

    fn connection(&self) -> Option<&str> {
        match self {
            Self::Parameters { .. }
            | Self::RequestConnection { .. }
            | Self::ListConnections
            | Self::Quit
            | Self::GetStatuses
            | Self::GetAvatarRequirements
            | Self::GetContactAttributeInterfaces => None,
            Self::Connect { connection }
            | Self::Disconnect { connection }
            | Self::Status { connection }
            | Self::SelfHandle { connection }
            | Self::RequestHandles { connection, .. }
            | Self::InspectHandles { connection, .. }
            | Self::ReleaseHandles { connection, .. }
            | Self::RequestChannel { connection, .. }
            | Self::EnsureChannel { connection, .. }
            | Self::GetChannels { connection }
            | Self::Close { connection, .. }
            | Self::Send { connection, .. }
            | Self::SetChatState { connection, .. }
            | Self::AcknowledgePending { connection, .. }
            | Self::ListPending { connection, .. }
            | Self::GetMembers { connection, .. }
            | Self::AddMembers { connection, .. }
            | Self::RemoveMembers { connection, .. }
            | Self::ListStreams { connection, .. }
            | Self::RequestStreams { connection, .. }
            | Self::RemoveStreams { connection, .. }
            | Self::RequestStreamDirection { connection, .. }
            | Self::TransferDetails { connection, .. }
            | Self::AcceptFile { connection, .. }
            | Self::ProvideFile { connection, .. }
            | Self::SetPresence { connection, .. }
            | Self::GetPresences { connection, .. }
            | Self::GetAliases { connection, .. }
            | Self::SetAliases { connection, .. }
            | Self::GetCapabilities { connection, .. }
            | Self::GetKnownAvatarTokens { connection, .. }
            | Self::RequestAvatars { connection, .. }
            | Self::SetAvatar { connection, .. }
            | Self::ClearAvatar { connection }
            | Self::GetContactAttributes { connection, .. }
            | Self::MailCapabilities { connection }
            | Self::UnreadMailCount { connection }
            | Self::RequestInboxUrl { connection }
            | Self::RequestMailUrl { connection, .. } => Some(connection),
        }
    }
}

/// One output line.
#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Line {
    Reply {
        id: u64,
        result: Value,
    },
    Error {
        id: u64,
        code: &'static str,
        message: String,
    },
    Signal {
        connection: String,
        #[serde(flatten)]
        signal: Signal,
    },
}

impl Line {
    fn from_result(id: u64, result: GatewayResult<Value>) -> Self {
        match result {
            Ok(result) => Self::Reply { id, result },
            Err(err) => Self::Error {
                id,
                code: err.error_code(),
                message: err.to_string(),
            },
        }
    }
}

fn encode<T: Serialize>(value: T) -> GatewayResult<Value> {
    serde_json::to_value(value)
        .map_err(|e| GatewayError::not_available(format!("cannot encode reply: {e}")))
}

/// The control adapter: parses requests, drives the gateway and writes
/// replies and signals to one output queue.
#[derive(Clone)]
pub struct Control {
    gateway: Gateway,
    out: mpsc::UnboundedSender<Line>,
}

impl Control {
    /// Returns the adapter and the receiving end of its output queue.
    pub fn new(gateway: Gateway) -> (Self, mpsc::UnboundedReceiver<Line>) {
        let (out, rx) = mpsc::unbounded_channel();
        (Self { gateway, out }, rx)
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    /// Forward every signal of `handle` to the output queue.
    pub fn watch(&self, handle: &ConnectionHandle) {
        let mut signals = handle.subscribe();
        let out = self.out.clone();
        let connection = handle.id().to_string();
        tokio::spawn(async move {
            loop {
                match signals.recv().await {
                    Ok(signal) => {
                        let line = Line::Signal {
                            connection: connection.clone(),
                            signal,
                        };
                        if out.send(line).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(%connection, skipped, "signal observer lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!(%connection, "signal forwarding stopped");
        });
    }

    fn connection(&self, id: &str) -> GatewayResult<ConnectionHandle> {
        let id = ConnectionId::from_str(id)?;
        self.gateway
            .get(&id)
            .ok_or_else(|| GatewayError::invalid_argument(format!("no connection '{id}'")))
    }

    /// Handle one request line. Returns false once the client asked to quit.
    pub async fn handle_line(&self, line: &str) -> bool {
        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(e) => {
                self.emit(Line::Error {
                    id: 0,
                    code: "invalid_argument",
                    message: format!("malformed request: {e}"),
                });
                return true;
            }
        };
        let id = value.get("id").and_then(Value::as_u64).unwrap_or(0);
        let request: Request = match serde_json::from_value(value) {
            Ok(request) => request,
            Err(e) => {
                self.emit(Line::Error {
                    id,
                    code: "invalid_argument",
                    message: format!("bad request: {e}"),
                });
                return true;
            }
        };

        let quit = matches!(request.call, Call::Quit);
        let span = spans::control(request.call.method(), request.call.connection());
        let _timer = CallTimer::new(request.call.method());
        match request.call {
            // Answered whenever the account delivers the URL.
            Call::RequestInboxUrl { connection } => {
                let this = self.clone();
                tokio::spawn(
                    async move {
                        let result = match this.connection(&connection) {
                            Ok(handle) => handle.request_inbox_url().await.and_then(encode),
                            Err(err) => Err(err),
                        };
                        this.emit(Line::from_result(id, result));
                    }
                    .instrument(span),
                );
            }
            call => {
                let result = self.dispatch(call).instrument(span).await;
                self.emit(Line::from_result(request.id, result));
            }
        }
        !quit
    }

    fn emit(&self, line: Line) {
        if self.out.send(line).is_err() {
            debug!("control output closed");
        }
    }

    async fn dispatch(&self, call: Call) -> GatewayResult<Value> {
        match call {
            Call::Parameters { protocol } => encode(self.gateway.parameters(&protocol)?),
            Call::RequestConnection { protocol, params } => {
                let handle = self.gateway.request_connection(&protocol, &params)?;
                self.watch(&handle);
                Ok(json!({
                    "connection": handle.id().to_string(),
                    "account": handle.account(),
                }))
            }
            Call::ListConnections => {
                let connections: Vec<Value> = self
                    .gateway
                    .connections()
                    .iter()
                    .map(|handle| {
                        json!({
                            "connection": handle.id().to_string(),
                            "account": handle.account(),
                        })
                    })
                    .collect();
                Ok(Value::Array(connections))
            }
            Call::Quit => {
                self.gateway.quit().await;
                Ok(Value::Null)
            }
            Call::GetStatuses => {
                let statuses: Vec<Value> = presence::STATUSES
                    .iter()
                    .map(|spec| {
                        json!({
                            "name": spec.name,
                            "type": spec.kind,
                            "may_set_on_self": spec.may_set_on_self,
                            "can_have_message": spec.can_have_message,
                        })
                    })
                    .collect();
                Ok(Value::Array(statuses))
            }
            Call::Connect { connection } => encode(self.connection(&connection)?.connect().await?),
            Call::Disconnect { connection } => {
                encode(self.connection(&connection)?.disconnect().await?)
            }
            Call::Status { connection } => encode(self.connection(&connection)?.status().await?),
            Call::SelfHandle { connection } => {
                encode(self.connection(&connection)?.self_handle().await?)
            }
            Call::RequestHandles {
                connection,
                handle_type,
                names,
            } => encode(
                self.connection(&connection)?
                    .request_handles(handle_type, names)
                    .await?,
            ),
            Call::InspectHandles {
                connection,
                handle_type,
                handles,
            } => encode(
                self.connection(&connection)?
                    .inspect_handles(handle_type, handles)
                    .await?,
            ),
            Call::ReleaseHandles {
                connection,
                handle_type,
                handles,
            } => encode(
                self.connection(&connection)?
                    .release_handles(handle_type, handles)
                    .await?,
            ),
            Call::RequestChannel {
                connection,
                channel_type,
                handle_type,
                handle,
            } => encode(
                self.connection(&connection)?
                    .request_channel(channel_type, handle_type, handle)
                    .await?,
            ),
            Call::EnsureChannel {
                connection,
                properties,
            } => {
                let (created, channel) = self
                    .connection(&connection)?
                    .ensure_channel(properties)
                    .await?;
                Ok(json!({ "yours": created, "channel": encode(channel)? }))
            }
            Call::GetChannels { connection } => {
                encode(self.connection(&connection)?.get_channels().await?)
            }
            Call::Close {
                connection,
                channel,
            } => encode(self.connection(&connection)?.close(channel).await?),
            Call::Send {
                connection,
                channel,
                kind,
                text,
            } => encode(
                self.connection(&connection)?
                    .send(channel, kind, text)
                    .await?,
            ),
            Call::SetChatState {
                connection,
                channel,
                state,
            } => encode(
                self.connection(&connection)?
                    .set_chat_state(channel, state)
                    .await?,
            ),
            Call::AcknowledgePending {
                connection,
                channel,
                ids,
            } => encode(
                self.connection(&connection)?
                    .acknowledge_pending(channel, ids)
                    .await?,
            ),
            Call::ListPending {
                connection,
                channel,
                clear,
            } => encode(
                self.connection(&connection)?
                    .list_pending(channel, clear)
                    .await?,
            ),
            Call::GetMembers {
                connection,
                channel,
            } => encode(self.connection(&connection)?.get_members(channel).await?),
            Call::AddMembers {
                connection,
                channel,
                handles,
                message,
            } => encode(
                self.connection(&connection)?
                    .add_members(channel, handles, message)
                    .await?,
            ),
            Call::RemoveMembers {
                connection,
                channel,
                handles,
                message,
            } => encode(
                self.connection(&connection)?
                    .remove_members(channel, handles, message)
                    .await?,
            ),
            Call::ListStreams {
                connection,
                channel,
            } => encode(self.connection(&connection)?.list_streams(channel).await?),
            Call::RequestStreams {
                connection,
                channel,
                contact,
                types,
            } => encode(
                self.connection(&connection)?
                    .request_streams(channel, contact, types)
                    .await?,
            ),
            Call::RemoveStreams {
                connection,
                channel,
                streams,
            } => encode(
                self.connection(&connection)?
                    .remove_streams(channel, streams)
                    .await?,
            ),
            Call::RequestStreamDirection {
                connection,
                channel,
                stream,
                direction,
            } => encode(
                self.connection(&connection)?
                    .request_stream_direction(channel, stream, direction)
                    .await?,
            ),
            Call::TransferDetails {
                connection,
                channel,
            } => encode(
                self.connection(&connection)?
                    .transfer_details(channel)
                    .await?,
            ),
            Call::AcceptFile {
                connection,
                channel,
                offset,
            } => encode(
                self.connection(&connection)?
                    .accept_file(channel, offset)
                    .await?,
            ),
            Call::ProvideFile {
                connection,
                channel,
            } => encode(self.connection(&connection)?.provide_file(channel).await?),
            Call::SetPresence {
                connection,
                status,
                message,
            } => encode(
                self.connection(&connection)?
                    .set_presence(status, message)
                    .await?,
            ),
            Call::GetPresences {
                connection,
                handles,
            } => encode(self.connection(&connection)?.get_presences(handles).await?),
            Call::GetAliases {
                connection,
                handles,
            } => encode(self.connection(&connection)?.get_aliases(handles).await?),
            Call::SetAliases {
                connection,
                aliases,
            } => encode(self.connection(&connection)?.set_aliases(aliases).await?),
            Call::GetCapabilities {
                connection,
                handles,
            } => encode(
                self.connection(&connection)?
                    .get_capabilities(handles)
                    .await?,
            ),
            Call::GetAvatarRequirements => encode(AvatarRequirements::default()),
            Call::GetKnownAvatarTokens {
                connection,
                handles,
            } => encode(
                self.connection(&connection)?
                    .get_known_avatar_tokens(handles)
                    .await?,
            ),
            Call::RequestAvatars {
                connection,
                handles,
            } => encode(self.connection(&connection)?.request_avatars(handles).await?),
            Call::SetAvatar {
                connection,
                data,
                mime_type,
            } => {
                let data = STANDARD
                    .decode(data.as_bytes())
                    .map_err(|e| GatewayError::invalid_argument(format!("avatar data: {e}")))?;
                encode(
                    self.connection(&connection)?
                        .set_avatar(data, mime_type)
                        .await?,
                )
            }
            Call::ClearAvatar { connection } => {
                encode(self.connection(&connection)?.clear_avatar().await?)
            }
            Call::GetContactAttributeInterfaces => encode(ContactInterface::ALL),
            Call::GetContactAttributes {
                connection,
                handles,
                interfaces,
                hold,
            } => {
                let interfaces = interfaces
                    .iter()
                    .map(|name| name.parse())
                    .collect::<GatewayResult<Vec<ContactInterface>>>()?;
                encode(
                    self.connection(&connection)?
                        .get_contact_attributes(handles, interfaces, hold)
                        .await?,
                )
            }
            Call::MailCapabilities { connection } => {
                encode(self.connection(&connection)?.mail_capabilities().await?)
            }
            Call::UnreadMailCount { connection } => {
                encode(self.connection(&connection)?.unread_mail_count().await?)
            }
            Call::RequestInboxUrl { connection } => {
                encode(self.connection(&connection)?.request_inbox_url().await?)
            }
            Call::RequestMailUrl {
                connection,
                mail_id,
                url_data,
            } => encode(
                self.connection(&connection)?
                    .request_mail_url(mail_id, url_data)
                    .await?,
            ),
        }
    }

    /// Serve requests from `input` until it ends or a `quit` arrives, and
    /// write every output line to `output`. All connections are shut down
    /// on the way out.
    pub async fn run<R, W>(
        self,
        mut lines_out: mpsc::UnboundedReceiver<Line>,
        input: R,
        mut output: W,
    ) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let writer = tokio::spawn(async move {
            while let Some(line) = lines_out.recv().await {
                let mut encoded = match serde_json::to_vec(&line) {
                    Ok(encoded) => encoded,
                    Err(e) => {
                        warn!(error = %e, "cannot encode output line");
                        continue;
                    }
                };
                encoded.push(b'\n');
                output.write_all(&encoded).await?;
                output.flush().await?;
            }
            Ok::<_, std::io::Error>(())
        });

        let mut lines = input.lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if !self.handle_line(line).await {
                break;
            }
        }
        info!("control input closed");
        self.gateway.quit().await;

        // Let the writer drain whatever is queued, then stop it.
        drop(self);
        match writer.await {
            Ok(result) => result,
            Err(e) => Err(std::io::Error::other(e)),
        }
    }
}
