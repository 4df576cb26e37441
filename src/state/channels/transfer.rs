//! File-transfer channels.
//!
//! ```text
//!   PENDING ──(local accept)──▶ ACCEPTED ──(remote ready)──▶ OPEN ──▶ COMPLETED
//!      │                                                      │
//!      └──────────────────────────▶ CANCELLED ◀───────────────┘
//! ```
//!
//! Bytes never pass through the channel. The connection binds a loopback
//! listener for the client; the accepted socket is handed to the account
//! client, which reports progress back as cumulative byte counts.

use std::net::SocketAddr;

use imgate_account::{TransferId, TransferInfo};
use serde::Serialize;
use tokio::net::TcpStream;
use tracing::{debug, info};

use super::{ChannelBase, ChannelCtx, GroupFlags, Groupable};
use crate::error::{GatewayError, GatewayResult};
use crate::state::handle::Handle;
use crate::state::roster::MembersDelta;
use crate::state::signal::Signal;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    None,
    #[default]
    Pending,
    Accepted,
    Open,
    Completed,
    Cancelled,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStateReason {
    #[default]
    None,
    Requested,
    LocalStopped,
    RemoteStopped,
    LocalError,
    RemoteError,
}

/// Static and live properties of a transfer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TransferDetails {
    pub filename: String,
    pub size: u64,
    pub content_type: String,
    pub description: String,
    pub incoming: bool,
    pub state: TransferState,
    pub reason: TransferStateReason,
    pub transferred: u64,
    pub initial_offset: u64,
    pub address: Option<SocketAddr>,
}

#[derive(Debug)]
pub struct FileTransferChannel {
    pub(super) base: ChannelBase,
    transfer: TransferId,
    peer: Handle,
    details: TransferDetails,
    local_ready: bool,
    remote_ready: bool,
}

impl FileTransferChannel {
    pub fn new(
        base: ChannelBase,
        peer: Handle,
        info: &TransferInfo,
        content_type: String,
        description: String,
    ) -> Self {
        Self {
            base,
            transfer: info.id,
            peer,
            details: TransferDetails {
                filename: info.filename.clone(),
                size: info.size,
                content_type,
                description,
                incoming: info.incoming,
                state: TransferState::Pending,
                reason: TransferStateReason::None,
                transferred: 0,
                initial_offset: 0,
                address: None,
            },
            local_ready: false,
            remote_ready: false,
        }
    }

    pub fn transfer(&self) -> TransferId {
        self.transfer
    }

    pub fn details(&self) -> &TransferDetails {
        &self.details
    }

    pub fn state(&self) -> TransferState {
        self.details.state
    }

    pub fn transferred(&self) -> u64 {
        self.details.transferred
    }

    pub(super) fn populate(&mut self, ctx: &mut ChannelCtx<'_>) {
        ctx.routes.bind_transfer(self.transfer, self.base.id);
        let delta = if self.details.incoming {
            MembersDelta::new()
                .add(self.peer.clone())
                .actor(self.peer.clone())
        } else {
            let me = ctx.self_handle();
            MembersDelta::new()
                .add(me.clone())
                .remote_pending(self.peer.clone())
                .actor(me)
        };
        self.base.apply(ctx, delta);
    }

    /// Re-entering the current state emits nothing.
    fn set_state(&mut self, ctx: &mut ChannelCtx<'_>, state: TransferState, reason: TransferStateReason) {
        if self.details.state == state {
            return;
        }
        debug!(channel = %self.base.id, from = ?self.details.state, to = ?state, "transfer state");
        self.details.state = state;
        self.details.reason = reason;
        ctx.emit(Signal::FileTransferStateChanged {
            channel: self.base.id,
            state,
            reason,
        });
    }

    fn try_open(&mut self, ctx: &mut ChannelCtx<'_>) {
        if self.local_ready
            && self.remote_ready
            && matches!(
                self.details.state,
                TransferState::Pending | TransferState::Accepted
            )
        {
            self.set_state(ctx, TransferState::Open, TransferStateReason::None);
        }
    }

    /// Accept an incoming offer; the client reads the file from `address`.
    pub fn accept_file(
        &mut self,
        ctx: &mut ChannelCtx<'_>,
        offset: u64,
        address: SocketAddr,
    ) -> GatewayResult<SocketAddr> {
        if !self.details.incoming {
            return Err(GatewayError::permission_denied(
                "outgoing transfers are provided, not accepted",
            ));
        }
        if self.details.state != TransferState::Pending {
            return Err(GatewayError::not_available(format!(
                "transfer is {:?}",
                self.details.state
            )));
        }
        if offset > self.details.size {
            return Err(GatewayError::invalid_argument(format!(
                "offset {offset} is past the end of the file"
            )));
        }
        self.local_ready = true;
        self.details.address = Some(address);
        self.details.initial_offset = offset;
        ctx.account.accept_transfer(self.transfer);
        ctx.emit(Signal::InitialOffsetDefined {
            channel: self.base.id,
            offset,
        });
        self.set_state(ctx, TransferState::Accepted, TransferStateReason::Requested);
        self.try_open(ctx);
        Ok(address)
    }

    /// Offer the file of an outgoing transfer at `address`.
    pub fn provide_file(
        &mut self,
        ctx: &mut ChannelCtx<'_>,
        address: SocketAddr,
    ) -> GatewayResult<SocketAddr> {
        if self.details.incoming {
            return Err(GatewayError::permission_denied(
                "incoming transfers are accepted, not provided",
            ));
        }
        if self.local_ready {
            return Err(GatewayError::not_available("file is already provided"));
        }
        if self.details.state.is_terminal() {
            return Err(GatewayError::not_available(format!(
                "transfer is {:?}",
                self.details.state
            )));
        }
        self.local_ready = true;
        self.details.address = Some(address);
        self.try_open(ctx);
        Ok(address)
    }

    pub fn on_remote_accepted(&mut self, ctx: &mut ChannelCtx<'_>) {
        if self.details.state.is_terminal() || self.remote_ready {
            return;
        }
        self.remote_ready = true;
        if !self.details.incoming {
            let delta = MembersDelta::new()
                .add(self.peer.clone())
                .actor(self.peer.clone());
            self.base.apply(ctx, delta);
        }
        if self.local_ready {
            self.try_open(ctx);
        } else {
            self.set_state(ctx, TransferState::Accepted, TransferStateReason::None);
        }
    }

    /// Cumulative progress; counts past the file size are clamped and a
    /// count below the last one is ignored.
    pub fn on_progress(&mut self, ctx: &mut ChannelCtx<'_>, transferred: u64) {
        if self.details.state.is_terminal() {
            return;
        }
        let count = transferred.min(self.details.size);
        if count <= self.details.transferred {
            return;
        }
        self.details.transferred = count;
        ctx.emit(Signal::TransferredBytesChanged {
            channel: self.base.id,
            count,
        });
    }

    pub fn on_completed(&mut self, ctx: &mut ChannelCtx<'_>) {
        if self.details.state.is_terminal() {
            return;
        }
        if self.details.transferred < self.details.size {
            self.details.transferred = self.details.size;
            ctx.emit(Signal::TransferredBytesChanged {
                channel: self.base.id,
                count: self.details.size,
            });
        }
        info!(channel = %self.base.id, file = %self.details.filename, "transfer completed");
        self.set_state(ctx, TransferState::Completed, TransferStateReason::None);
    }

    pub fn on_remote_cancelled(&mut self, ctx: &mut ChannelCtx<'_>) {
        if self.details.state.is_terminal() {
            return;
        }
        self.set_state(ctx, TransferState::Cancelled, TransferStateReason::RemoteStopped);
    }

    /// The client connected to our listener.
    pub fn socket_connected(&mut self, ctx: &mut ChannelCtx<'_>, socket: TcpStream) {
        if self.details.state.is_terminal() {
            debug!(channel = %self.base.id, "dropping socket for finished transfer");
            return;
        }
        ctx.account.attach_transfer_socket(self.transfer, socket);
    }

    /// Stop a transfer that has not finished yet.
    pub(super) fn cancel(&mut self, ctx: &mut ChannelCtx<'_>) {
        if self.details.state.is_terminal() {
            return;
        }
        ctx.account.cancel_transfer(self.transfer);
        self.set_state(ctx, TransferState::Cancelled, TransferStateReason::LocalStopped);
    }
}

impl Groupable for FileTransferChannel {
    fn base(&self) -> &ChannelBase {
        &self.base
    }

    fn group_flags(&self) -> GroupFlags {
        GroupFlags::NONE
    }

    fn add_members(
        &mut self,
        _ctx: &mut ChannelCtx<'_>,
        _handles: &[Handle],
        _message: &str,
    ) -> GatewayResult<()> {
        Err(GatewayError::permission_denied(
            "file transfers have a fixed membership",
        ))
    }

    fn remove_members(
        &mut self,
        _ctx: &mut ChannelCtx<'_>,
        _handles: &[Handle],
        _message: &str,
    ) -> GatewayResult<()> {
        Err(GatewayError::permission_denied(
            "file transfers have a fixed membership",
        ))
    }
}
