//! Streamed media (audio/video call) channels.
//!
//! Outgoing calls are created lazily by the first `request_streams`; the
//! peer waits in remote-pending until the call is accepted. Incoming calls
//! put the local user in local-pending until `add_members([self])`.

use std::collections::BTreeMap;

use imgate_account::{CallId, MediaKind, MediaStreamId, StreamDirection};
use serde::Serialize;
use tracing::debug;

use super::{ChannelBase, ChannelCtx, GroupFlags, Groupable};
use crate::error::{GatewayError, GatewayResult};
use crate::state::handle::{Handle, HandleId};
use crate::state::roster::{MembersDelta, Placement};
use crate::state::signal::Signal;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallPhase {
    Incoming,
    Outgoing,
    Ringing,
    Accepted,
    Rejected,
    Ended,
}

impl CallPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::Ended)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Which side still has to agree before a stream starts sending.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct PendingSend(u8);

impl PendingSend {
    pub const NONE: Self = Self(0);
    pub const LOCAL_SEND: Self = Self(1);
    pub const REMOTE_SEND: Self = Self(2);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for PendingSend {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// One stream as reported by `list_streams` and `request_streams`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StreamInfo {
    pub id: u32,
    pub contact: HandleId,
    pub kind: MediaKind,
    pub state: StreamState,
    pub direction: StreamDirection,
    pub pending_send: PendingSend,
}

#[derive(Debug)]
struct Stream {
    info: StreamInfo,
    remote: MediaStreamId,
}

fn receives(direction: StreamDirection) -> bool {
    matches!(
        direction,
        StreamDirection::Receive | StreamDirection::Bidirectional
    )
}

#[derive(Debug)]
pub struct MediaChannel {
    pub(super) base: ChannelBase,
    peer: Handle,
    call: Option<CallId>,
    phase: CallPhase,
    streams: BTreeMap<u32, Stream>,
    next_stream_id: u32,
    initial: Vec<MediaKind>,
}

impl MediaChannel {
    /// A locally requested call towards `peer`. `initial` streams are
    /// requested as soon as the channel is announced.
    pub fn outgoing(base: ChannelBase, peer: Handle, initial: Vec<MediaKind>) -> Self {
        Self {
            base,
            peer,
            call: None,
            phase: CallPhase::Outgoing,
            streams: BTreeMap::new(),
            next_stream_id: 1,
            initial,
        }
    }

    /// A call the peer placed to us.
    pub fn incoming(base: ChannelBase, peer: Handle, call: CallId) -> Self {
        Self {
            base,
            peer,
            call: Some(call),
            phase: CallPhase::Incoming,
            streams: BTreeMap::new(),
            next_stream_id: 1,
            initial: Vec::new(),
        }
    }

    pub fn call(&self) -> Option<CallId> {
        self.call
    }

    pub fn phase(&self) -> CallPhase {
        self.phase
    }

    pub fn peer(&self) -> &Handle {
        &self.peer
    }

    pub(super) fn populate(&mut self, ctx: &mut ChannelCtx<'_>) {
        let me = ctx.self_handle();
        let delta = match self.phase {
            CallPhase::Incoming => {
                if let Some(call) = self.call {
                    ctx.routes.bind_call(call, self.base.id);
                }
                MembersDelta::new()
                    .add(self.peer.clone())
                    .local_pending(me)
                    .actor(self.peer.clone())
            }
            _ => MembersDelta::new()
                .add(me.clone())
                .remote_pending(self.peer.clone())
                .actor(me),
        };
        self.base.apply(ctx, delta);
        if self.phase == CallPhase::Incoming {
            self.emit_phase(ctx);
        }

        let initial = std::mem::take(&mut self.initial);
        if !initial.is_empty() {
            let peer = self.peer.clone();
            if let Err(err) = self.request_streams(ctx, &peer, &initial) {
                debug!(channel = %self.base.id, error = %err, "initial streams not requested");
            }
        }
    }

    fn emit_phase(&self, ctx: &mut ChannelCtx<'_>) {
        ctx.emit(Signal::CallStateChanged {
            channel: self.base.id,
            contact: self.peer.id(),
            state: self.phase,
        });
    }

    fn set_phase(&mut self, ctx: &mut ChannelCtx<'_>, phase: CallPhase) {
        if self.phase != phase {
            self.phase = phase;
            self.emit_phase(ctx);
        }
    }

    fn ensure_call(&mut self, ctx: &mut ChannelCtx<'_>) -> GatewayResult<CallId> {
        if let Some(call) = self.call {
            return Ok(call);
        }
        let key = self
            .peer
            .contact_key()
            .ok_or_else(|| GatewayError::InvalidHandle(self.peer.to_string()))?;
        let call = ctx.account.create_call(key);
        ctx.routes.bind_call(call, self.base.id);
        self.call = Some(call);
        debug!(channel = %self.base.id, call = %call, "call created");
        self.emit_phase(ctx);
        Ok(call)
    }

    fn stream_by_remote(&mut self, remote: MediaStreamId) -> Option<&mut Stream> {
        self.streams.values_mut().find(|s| s.remote == remote)
    }

    fn allocate_stream_id(&mut self) -> u32 {
        let id = self.next_stream_id;
        self.next_stream_id += 1;
        id
    }

    pub fn list_streams(&self) -> Vec<StreamInfo> {
        self.streams.values().map(|s| s.info.clone()).collect()
    }

    pub fn request_streams(
        &mut self,
        ctx: &mut ChannelCtx<'_>,
        contact: &Handle,
        kinds: &[MediaKind],
    ) -> GatewayResult<Vec<StreamInfo>> {
        if *contact != self.peer {
            return Err(GatewayError::invalid_argument(format!(
                "{contact} is not the peer of this call"
            )));
        }
        if self.phase.is_terminal() {
            return Err(GatewayError::not_available("call has ended"));
        }
        let call = self.ensure_call(ctx)?;
        let mut created = Vec::with_capacity(kinds.len());
        for &kind in kinds {
            let remote = ctx
                .account
                .create_stream(call, kind, StreamDirection::Bidirectional);
            let info = StreamInfo {
                id: self.allocate_stream_id(),
                contact: self.peer.id(),
                kind,
                state: StreamState::Disconnected,
                direction: StreamDirection::Bidirectional,
                pending_send: PendingSend::REMOTE_SEND,
            };
            ctx.emit(Signal::StreamAdded {
                channel: self.base.id,
                stream: info.id,
                contact: info.contact,
                kind,
            });
            self.streams.insert(
                info.id,
                Stream {
                    info: info.clone(),
                    remote,
                },
            );
            created.push(info);
        }
        Ok(created)
    }

    /// Tear down the given streams. The call ends with the last one.
    pub fn remove_streams(&mut self, ctx: &mut ChannelCtx<'_>, ids: &[u32]) -> GatewayResult<()> {
        if let Some(unknown) = ids.iter().find(|id| !self.streams.contains_key(id)) {
            return Err(GatewayError::invalid_argument(format!(
                "no stream {unknown}"
            )));
        }
        for id in ids {
            let Some(stream) = self.streams.remove(id) else {
                continue;
            };
            if let Some(call) = self.call {
                ctx.account.remove_stream(call, stream.remote);
            }
            ctx.emit(Signal::StreamRemoved {
                channel: self.base.id,
                stream: *id,
            });
        }
        if self.streams.is_empty() {
            ctx.routes.request_close(self.base.id);
        }
        Ok(())
    }

    pub fn request_stream_direction(
        &mut self,
        ctx: &mut ChannelCtx<'_>,
        id: u32,
        direction: StreamDirection,
    ) -> GatewayResult<()> {
        let call = self.call;
        let channel = self.base.id;
        let stream = self
            .streams
            .get_mut(&id)
            .ok_or_else(|| GatewayError::invalid_argument(format!("no stream {id}")))?;
        if stream.info.direction == direction {
            return Ok(());
        }
        if receives(direction) && !receives(stream.info.direction) {
            stream.info.pending_send = stream.info.pending_send | PendingSend::REMOTE_SEND;
        }
        if direction.sends() {
            stream.info.pending_send.remove(PendingSend::LOCAL_SEND);
        }
        stream.info.direction = direction;
        if let Some(call) = call {
            ctx.account.set_stream_direction(call, stream.remote, direction);
        }
        ctx.emit(Signal::StreamDirectionChanged {
            channel,
            stream: id,
            direction,
            pending_send: stream.info.pending_send,
        });
        Ok(())
    }

    pub fn on_ringing(&mut self, ctx: &mut ChannelCtx<'_>) {
        if self.phase == CallPhase::Outgoing {
            self.set_phase(ctx, CallPhase::Ringing);
        }
    }

    pub fn on_accepted(&mut self, ctx: &mut ChannelCtx<'_>) {
        if self.phase.is_terminal() {
            return;
        }
        let delta = MembersDelta::new()
            .add(self.peer.clone())
            .actor(self.peer.clone());
        self.base.apply(ctx, delta);
        self.set_phase(ctx, CallPhase::Accepted);
    }

    pub fn on_rejected(&mut self, ctx: &mut ChannelCtx<'_>) {
        self.call = None;
        self.set_phase(ctx, CallPhase::Rejected);
        ctx.routes.request_close(self.base.id);
    }

    pub fn on_ended(&mut self, ctx: &mut ChannelCtx<'_>) {
        self.call = None;
        self.set_phase(ctx, CallPhase::Ended);
        ctx.routes.request_close(self.base.id);
    }

    /// A stream the remote side created, or the echo of one of ours.
    pub fn on_stream_created(
        &mut self,
        ctx: &mut ChannelCtx<'_>,
        remote: MediaStreamId,
        kind: MediaKind,
        direction: StreamDirection,
    ) {
        if self.stream_by_remote(remote).is_some() {
            return;
        }
        let pending_send = if self.phase == CallPhase::Incoming && direction.sends() {
            PendingSend::LOCAL_SEND
        } else {
            PendingSend::NONE
        };
        let info = StreamInfo {
            id: self.allocate_stream_id(),
            contact: self.peer.id(),
            kind,
            state: StreamState::Disconnected,
            direction,
            pending_send,
        };
        ctx.emit(Signal::StreamAdded {
            channel: self.base.id,
            stream: info.id,
            contact: info.contact,
            kind,
        });
        ctx.emit(Signal::StreamDirectionChanged {
            channel: self.base.id,
            stream: info.id,
            direction,
            pending_send,
        });
        self.streams.insert(info.id, Stream { info, remote });
    }

    pub fn on_stream_removed(&mut self, ctx: &mut ChannelCtx<'_>, remote: MediaStreamId) {
        let Some(id) = self.stream_by_remote(remote).map(|s| s.info.id) else {
            return;
        };
        self.streams.remove(&id);
        ctx.emit(Signal::StreamRemoved {
            channel: self.base.id,
            stream: id,
        });
    }

    /// The remote side confirmed or changed a stream's direction.
    pub fn on_stream_direction(
        &mut self,
        ctx: &mut ChannelCtx<'_>,
        remote: MediaStreamId,
        direction: StreamDirection,
    ) {
        let channel = self.base.id;
        let Some(stream) = self.stream_by_remote(remote) else {
            return;
        };
        let mut pending = stream.info.pending_send;
        pending.remove(PendingSend::REMOTE_SEND);
        if stream.info.direction == direction && stream.info.pending_send == pending {
            return;
        }
        stream.info.direction = direction;
        stream.info.pending_send = pending;
        ctx.emit(Signal::StreamDirectionChanged {
            channel,
            stream: stream.info.id,
            direction,
            pending_send: pending,
        });
    }

    pub fn on_stream_state(&mut self, ctx: &mut ChannelCtx<'_>, remote: MediaStreamId, connected: bool) {
        let channel = self.base.id;
        let Some(stream) = self.stream_by_remote(remote) else {
            return;
        };
        let state = if connected {
            StreamState::Connected
        } else {
            StreamState::Disconnected
        };
        if stream.info.state == state {
            return;
        }
        stream.info.state = state;
        ctx.emit(Signal::StreamStateChanged {
            channel,
            stream: stream.info.id,
            state,
        });
    }

    /// Hang up, or refuse the call if it was never accepted.
    pub(super) fn end_call(&mut self, ctx: &mut ChannelCtx<'_>) {
        self.streams.clear();
        let Some(call) = self.call.take() else {
            return;
        };
        if self.phase == CallPhase::Incoming {
            ctx.account.reject_call(call);
            self.set_phase(ctx, CallPhase::Rejected);
        } else {
            ctx.account.end_call(call);
            self.set_phase(ctx, CallPhase::Ended);
        }
    }
}

impl Groupable for MediaChannel {
    fn base(&self) -> &ChannelBase {
        &self.base
    }

    fn group_flags(&self) -> GroupFlags {
        GroupFlags::CAN_ADD | GroupFlags::CAN_REMOVE
    }

    fn add_members(
        &mut self,
        ctx: &mut ChannelCtx<'_>,
        handles: &[Handle],
        message: &str,
    ) -> GatewayResult<()> {
        let me = ctx.self_handle();
        if handles.iter().any(|h| *h != me) {
            return Err(GatewayError::permission_denied(
                "only the local user can join a call",
            ));
        }
        if handles.is_empty() || self.base.roster.is_member(me.id()) {
            return Ok(());
        }
        if self.base.roster.placement(me.id()) != Some(Placement::LocalPending) {
            return Err(GatewayError::permission_denied("there is no call to accept"));
        }
        let call = self
            .call
            .ok_or_else(|| GatewayError::not_available("call has ended"))?;
        ctx.account.accept_call(call);
        let delta = MembersDelta::new().add(me.clone()).actor(me).message(message);
        self.base.apply(ctx, delta);
        self.set_phase(ctx, CallPhase::Accepted);
        let channel = self.base.id;
        for stream in self.streams.values_mut() {
            if !stream.info.pending_send.contains(PendingSend::LOCAL_SEND) {
                continue;
            }
            stream.info.pending_send.remove(PendingSend::LOCAL_SEND);
            ctx.emit(Signal::StreamDirectionChanged {
                channel,
                stream: stream.info.id,
                direction: stream.info.direction,
                pending_send: stream.info.pending_send,
            });
        }
        Ok(())
    }

    fn remove_members(
        &mut self,
        ctx: &mut ChannelCtx<'_>,
        handles: &[Handle],
        _message: &str,
    ) -> GatewayResult<()> {
        let me = ctx.self_handle();
        if handles.iter().any(|h| *h != me && *h != self.peer) {
            return Err(GatewayError::permission_denied(
                "only the call participants can be removed",
            ));
        }
        if !handles.is_empty() {
            ctx.routes.request_close(self.base.id);
        }
        Ok(())
    }
}
