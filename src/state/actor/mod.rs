//! Actor model for connection state.
//!
//! Each connection runs in its own Tokio task that owns the sans-IO
//! [`Connection`] core.
//!
//! # Architecture
//!
//! - **State ownership**: the actor owns the core and every transfer
//!   listener task it started.
//! - **Message passing**: control calls arrive as [`ConnectionCommand`]s
//!   carrying a oneshot reply channel.
//! - **One queue**: commands, account events, accepted transfer sockets and
//!   timer deadlines are multiplexed by a single `select!`, so a handler
//!   always runs to completion before the next one starts.
//! - **Observers**: signals are drained after every handler and broadcast
//!   in emission order.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info};

use super::channels::ChannelId;
use super::connection::{AccountEvents, Connection};
use super::lifecycle::ConnectionStatus;
use super::mail::MailUrl;
use super::signal::Signal;
use crate::error::{GatewayError, GatewayResult};
use crate::network::transfer::{AcceptedSocket, TransferListener};
use crate::telemetry::spans;

mod handle;
mod types;

pub use handle::ConnectionHandle;
pub use types::*;

const COMMAND_QUEUE: usize = 64;
const SIGNAL_BUFFER: usize = 1024;

/// The connection actor.
pub struct ConnectionActor {
    id: ConnectionId,
    core: Connection,
    signals: broadcast::Sender<Signal>,
    sockets_tx: mpsc::Sender<AcceptedSocket>,
    listeners: HashMap<ChannelId, Vec<JoinHandle<()>>>,
    transfer_ip: IpAddr,
    /// Set once a connect was issued; the actor stops after the
    /// disconnect that follows.
    started: bool,
}

impl ConnectionActor {
    /// Spawn an actor around `core` and return its handle plus the task.
    pub fn spawn(
        id: ConnectionId,
        core: Connection,
        events: AccountEvents,
        transfer_ip: IpAddr,
    ) -> (ConnectionHandle, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);
        let (signals, _) = broadcast::channel(SIGNAL_BUFFER);
        let (sockets_tx, sockets_rx) = mpsc::channel(8);
        let handle = ConnectionHandle::new(
            id,
            core.account_name().to_string(),
            commands_tx,
            signals.clone(),
        );
        let span = spans::connection(&id.to_string(), core.account_name());
        let actor = Self {
            id,
            core,
            signals,
            sockets_tx,
            listeners: HashMap::new(),
            transfer_ip,
            started: false,
        };
        let task = tokio::spawn(actor.run(commands_rx, events, sockets_rx).instrument(span));
        (handle, task)
    }

    /// The main actor loop.
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<ConnectionCommand>,
        mut events: AccountEvents,
        mut sockets: mpsc::Receiver<AcceptedSocket>,
    ) {
        info!(connection = %self.id, "connection actor started");
        loop {
            let deadline = self.core.next_deadline();
            let wake = tokio::time::Instant::from_std(
                deadline.unwrap_or_else(std::time::Instant::now),
            );
            tokio::select! {
                command = commands.recv() => match command {
                    Some(ConnectionCommand::Shutdown { reply_tx }) => {
                        self.stop();
                        let _ = reply_tx.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!(connection = %self.id, "all handles dropped");
                        self.stop();
                        break;
                    }
                },
                Some(event) = events.recv() => self.core.handle_account_event(event),
                Some(accepted) = sockets.recv() => {
                    debug!(channel = %accepted.channel, peer = %accepted.peer, "transfer socket");
                    self.core.transfer_socket(accepted.channel, accepted.socket);
                }
                _ = tokio::time::sleep_until(wake), if deadline.is_some() => {
                    self.core.fire_timers(std::time::Instant::now());
                }
            }
            if self.flush() {
                break;
            }
        }
        for (_, tasks) in self.listeners.drain() {
            tasks.iter().for_each(JoinHandle::abort);
        }
        info!(connection = %self.id, "connection actor stopped");
    }

    fn stop(&mut self) {
        if let Err(err) = self.core.disconnect() {
            debug!(error = %err, "disconnect during shutdown failed");
        }
        self.flush();
    }

    /// Broadcast pending signals. Returns true once a started connection
    /// has reported DISCONNECTED.
    fn flush(&mut self) -> bool {
        let mut finished = false;
        for signal in self.core.drain_signals() {
            match &signal {
                Signal::Closed { channel } => {
                    if let Some(tasks) = self.listeners.remove(channel) {
                        tasks.iter().for_each(JoinHandle::abort);
                    }
                }
                Signal::StatusChanged {
                    status: ConnectionStatus::Disconnected,
                    ..
                } => finished = self.started,
                _ => {}
            }
            // No observers is not an error.
            let _ = self.signals.send(signal);
        }
        finished
    }

    async fn bind_listener(ip: IpAddr) -> GatewayResult<TransferListener> {
        TransferListener::bind(ip)
            .await
            .map_err(|e| GatewayError::not_available(format!("cannot bind transfer socket: {e}")))
    }

    fn keep_listener(&mut self, channel: ChannelId, listener: TransferListener) {
        let task = listener.spawn(channel, self.sockets_tx.clone());
        self.listeners.entry(channel).or_default().push(task);
    }

    /// Bind first so the core can announce the real address; the listener
    /// is dropped if the core refuses.
    async fn accept_file(&mut self, channel: ChannelId, offset: u64) -> GatewayResult<SocketAddr> {
        let listener = Self::bind_listener(self.transfer_ip).await?;
        let address = self.core.accept_file(channel, offset, listener.address())?;
        self.keep_listener(channel, listener);
        Ok(address)
    }

    async fn provide_file(&mut self, channel: ChannelId) -> GatewayResult<SocketAddr> {
        let listener = Self::bind_listener(self.transfer_ip).await?;
        let address = self.core.provide_file(channel, listener.address())?;
        self.keep_listener(channel, listener);
        Ok(address)
    }

    async fn handle_command(&mut self, command: ConnectionCommand) {
        let core = &mut self.core;
        match command {
            ConnectionCommand::Connect { reply_tx } => {
                self.started = true;
                let _ = reply_tx.send(self.core.connect());
            }
            ConnectionCommand::Disconnect { reply_tx } => {
                let _ = reply_tx.send(core.disconnect());
            }
            ConnectionCommand::Status { reply_tx } => {
                let _ = reply_tx.send(Ok(core.status()));
            }
            ConnectionCommand::SelfHandle { reply_tx } => {
                let _ = reply_tx.send(Ok(core.self_handle()));
            }
            ConnectionCommand::RequestHandles {
                kind,
                names,
                reply_tx,
            } => {
                let _ = reply_tx.send(core.request_handles(kind, &names));
            }
            ConnectionCommand::InspectHandles { kind, ids, reply_tx } => {
                let _ = reply_tx.send(core.inspect_handles(kind, &ids));
            }
            ConnectionCommand::ReleaseHandles { kind, ids, reply_tx } => {
                let _ = reply_tx.send(core.release_handles(kind, &ids));
            }
            ConnectionCommand::RequestChannel {
                kind,
                target_type,
                target,
                reply_tx,
            } => {
                let _ = reply_tx.send(core.request_channel(kind, target_type, target));
            }
            ConnectionCommand::EnsureChannel { props, reply_tx } => {
                let _ = reply_tx.send(core.ensure_channel(&props));
            }
            ConnectionCommand::GetChannels { reply_tx } => {
                let _ = reply_tx.send(core.get_channels());
            }
            ConnectionCommand::Close { channel, reply_tx } => {
                let _ = reply_tx.send(core.close_channel(channel));
            }
            ConnectionCommand::Send {
                channel,
                kind,
                text,
                reply_tx,
            } => {
                let _ = reply_tx.send(core.send(channel, kind, &text));
            }
            ConnectionCommand::SetChatState {
                channel,
                state,
                reply_tx,
            } => {
                let _ = reply_tx.send(core.set_chat_state(channel, state));
            }
            ConnectionCommand::AcknowledgePending {
                channel,
                ids,
                reply_tx,
            } => {
                let _ = reply_tx.send(core.acknowledge_pending(channel, &ids));
            }
            ConnectionCommand::ListPending {
                channel,
                clear,
                reply_tx,
            } => {
                let _ = reply_tx.send(core.list_pending(channel, clear));
            }
            ConnectionCommand::GetMembers { channel, reply_tx } => {
                let _ = reply_tx.send(core.get_members(channel));
            }
            ConnectionCommand::AddMembers {
                channel,
                handles,
                message,
                reply_tx,
            } => {
                let _ = reply_tx.send(core.add_members(channel, &handles, &message));
            }
            ConnectionCommand::RemoveMembers {
                channel,
                handles,
                message,
                reply_tx,
            } => {
                let _ = reply_tx.send(core.remove_members(channel, &handles, &message));
            }
            ConnectionCommand::ListStreams { channel, reply_tx } => {
                let _ = reply_tx.send(core.list_streams(channel));
            }
            ConnectionCommand::RequestStreams {
                channel,
                contact,
                kinds,
                reply_tx,
            } => {
                let _ = reply_tx.send(core.request_streams(channel, contact, &kinds));
            }
            ConnectionCommand::RemoveStreams {
                channel,
                streams,
                reply_tx,
            } => {
                let _ = reply_tx.send(core.remove_streams(channel, &streams));
            }
            ConnectionCommand::RequestStreamDirection {
                channel,
                stream,
                direction,
                reply_tx,
            } => {
                let _ = reply_tx.send(core.request_stream_direction(channel, stream, direction));
            }
            ConnectionCommand::TransferDetails { channel, reply_tx } => {
                let _ = reply_tx.send(core.transfer_details(channel));
            }
            ConnectionCommand::AcceptFile {
                channel,
                offset,
                reply_tx,
            } => {
                let _ = reply_tx.send(self.accept_file(channel, offset).await);
            }
            ConnectionCommand::ProvideFile { channel, reply_tx } => {
                let _ = reply_tx.send(self.provide_file(channel).await);
            }
            ConnectionCommand::SetPresence {
                status,
                message,
                reply_tx,
            } => {
                let _ = reply_tx.send(core.set_presence(&status, &message));
            }
            ConnectionCommand::GetPresences { handles, reply_tx } => {
                let _ = reply_tx.send(core.get_presences(&handles));
            }
            ConnectionCommand::GetAliases { handles, reply_tx } => {
                let _ = reply_tx.send(core.get_aliases(&handles));
            }
            ConnectionCommand::SetAliases { aliases, reply_tx } => {
                let _ = reply_tx.send(core.set_aliases(&aliases));
            }
            ConnectionCommand::GetCapabilities { handles, reply_tx } => {
                let _ = reply_tx.send(core.get_capabilities(&handles));
            }
            ConnectionCommand::GetKnownAvatarTokens { handles, reply_tx } => {
                let _ = reply_tx.send(core.get_known_avatar_tokens(&handles));
            }
            ConnectionCommand::RequestAvatars { handles, reply_tx } => {
                let _ = reply_tx.send(core.request_avatars(&handles));
            }
            ConnectionCommand::SetAvatar {
                data,
                mime_type,
                reply_tx,
            } => {
                let _ = reply_tx.send(core.set_avatar(data, &mime_type));
            }
            ConnectionCommand::ClearAvatar { reply_tx } => {
                let _ = reply_tx.send(core.clear_avatar());
            }
            ConnectionCommand::GetContactAttributes {
                handles,
                interfaces,
                hold,
                reply_tx,
            } => {
                let _ = reply_tx.send(core.get_contact_attributes(&handles, &interfaces, hold));
            }
            ConnectionCommand::MailCapabilities { reply_tx } => {
                let _ = reply_tx.send(core.mail_capabilities());
            }
            ConnectionCommand::UnreadMailCount { reply_tx } => {
                let _ = reply_tx.send(core.unread_mail_count());
            }
            ConnectionCommand::RequestInboxUrl { reply_tx } => {
                let (url_tx, url_rx) = oneshot::channel::<MailUrl>();
                match core.request_inbox_url(url_tx) {
                    Ok(()) => {
                        tokio::spawn(async move {
                            let result = url_rx.await.map_err(|_| GatewayError::Disconnected);
                            let _ = reply_tx.send(result);
                        });
                    }
                    Err(err) => {
                        let _ = reply_tx.send(Err(err));
                    }
                }
            }
            ConnectionCommand::RequestMailUrl {
                id,
                url_data,
                reply_tx,
            } => {
                let _ = reply_tx.send(core.request_mail_url(&id, &url_data));
            }
            ConnectionCommand::Shutdown { reply_tx } => {
                // Handled by the run loop; answer anyway.
                let _ = reply_tx.send(());
            }
        }
    }
}
