//! Operation registry
//!
//! Maps every [`EdgeKind`] of the transition table to the local operation
//! crossing it. The keeper refuses to start unless each legal edge has one.

use crate::common::error::{Error, Result};
use crate::common::fsm::{EdgeKind, NodeState, TransitionTable};
use crate::common::protocol::{NodeEndpoint, QuorumDescription};
use crate::keeper::controller::{NodeController, Outcome};
use futures_util::future::BoxFuture;
use std::collections::HashMap;

/// Everything an operation may need from the monitor's last answer.
pub struct TransitionContext<'a> {
    pub controller: &'a dyn NodeController,
    pub from: NodeState,
    pub to: NodeState,
    pub upstream: Option<&'a NodeEndpoint>,
    pub standbys: &'a [NodeEndpoint],
    pub quorum: &'a QuorumDescription,
}

impl<'a> TransitionContext<'a> {
    fn upstream(&self) -> Result<&'a NodeEndpoint> {
        self.upstream.ok_or_else(|| Error::OperationFailed {
            operation: format!("{} -> {}", self.from, self.to),
            reason: "monitor did not name an upstream node".into(),
        })
    }

    /// Synchronous standby names the target state runs with.
    pub fn synchronous_standby_names(&self) -> String {
        match self.to {
            NodeState::Primary | NodeState::ApplySettings | NodeState::JoinPrimary => {
                self.quorum.synchronous_standby_names()
            }
            _ => String::new(),
        }
    }
}

pub type Operation = for<'a> fn(&'a TransitionContext<'a>) -> BoxFuture<'a, Outcome>;

fn noop<'a>(_ctx: &'a TransitionContext<'a>) -> BoxFuture<'a, Outcome> {
    Box::pin(async { Ok(None) })
}

fn init_primary<'a>(ctx: &'a TransitionContext<'a>) -> BoxFuture<'a, Outcome> {
    ctx.controller.init_primary()
}

fn init_standby<'a>(ctx: &'a TransitionContext<'a>) -> BoxFuture<'a, Outcome> {
    Box::pin(async move { ctx.controller.init_standby(ctx.upstream()?).await })
}

fn add_standby_access<'a>(ctx: &'a TransitionContext<'a>) -> BoxFuture<'a, Outcome> {
    ctx.controller.update_access(ctx.standbys)
}

fn set_synchronous_standbys<'a>(ctx: &'a TransitionContext<'a>) -> BoxFuture<'a, Outcome> {
    Box::pin(async move {
        let names = ctx.synchronous_standby_names();
        ctx.controller.set_synchronous_standbys(&names).await
    })
}

fn disable_sync_rep<'a>(ctx: &'a TransitionContext<'a>) -> BoxFuture<'a, Outcome> {
    ctx.controller.set_synchronous_standbys("")
}

fn drain<'a>(ctx: &'a TransitionContext<'a>) -> BoxFuture<'a, Outcome> {
    ctx.controller.drain()
}

fn stop<'a>(ctx: &'a TransitionContext<'a>) -> BoxFuture<'a, Outcome> {
    ctx.controller.stop()
}

fn rewind<'a>(ctx: &'a TransitionContext<'a>) -> BoxFuture<'a, Outcome> {
    Box::pin(async move { ctx.controller.rewind(ctx.upstream()?).await })
}

fn follow_primary<'a>(ctx: &'a TransitionContext<'a>) -> BoxFuture<'a, Outcome> {
    Box::pin(async move { ctx.controller.start_following(ctx.upstream()?).await })
}

fn pause_replication<'a>(ctx: &'a TransitionContext<'a>) -> BoxFuture<'a, Outcome> {
    ctx.controller.pause_replication()
}

fn fast_forward<'a>(ctx: &'a TransitionContext<'a>) -> BoxFuture<'a, Outcome> {
    Box::pin(async move { ctx.controller.fast_forward(ctx.upstream()?).await })
}

fn prepare_promotion<'a>(ctx: &'a TransitionContext<'a>) -> BoxFuture<'a, Outcome> {
    ctx.controller.prepare_promotion()
}

fn stop_replication<'a>(ctx: &'a TransitionContext<'a>) -> BoxFuture<'a, Outcome> {
    ctx.controller.stop_replication()
}

/// Promote, then start with the relaxed synchronous setting of wait_primary.
fn promote<'a>(ctx: &'a TransitionContext<'a>) -> BoxFuture<'a, Outcome> {
    Box::pin(async move {
        let diagnostic = ctx.controller.promote().await?;
        ctx.controller.set_synchronous_standbys("").await?;
        Ok(diagnostic)
    })
}

#[derive(Clone)]
pub struct Operations {
    ops: HashMap<EdgeKind, Operation>,
}

impl Operations {
    pub fn empty() -> Self {
        Self {
            ops: HashMap::new(),
        }
    }

    pub fn standard() -> Self {
        let mut ops = Self::empty();
        ops.register(EdgeKind::InitPrimary, init_primary);
        ops.register(EdgeKind::InitStandby, init_standby);
        ops.register(EdgeKind::AddStandbyAccess, add_standby_access);
        ops.register(EdgeKind::EnableSyncRep, set_synchronous_standbys);
        ops.register(EdgeKind::DisableSyncRep, disable_sync_rep);
        ops.register(EdgeKind::ApplySettings, set_synchronous_standbys);
        ops.register(EdgeKind::Drain, drain);
        ops.register(EdgeKind::Demote, stop);
        ops.register(EdgeKind::Rewind, rewind);
        ops.register(EdgeKind::FollowPrimary, follow_primary);
        ops.register(EdgeKind::PauseReplication, pause_replication);
        ops.register(EdgeKind::FastForward, fast_forward);
        ops.register(EdgeKind::PreparePromotion, prepare_promotion);
        ops.register(EdgeKind::StopReplication, stop_replication);
        ops.register(EdgeKind::Promote, promote);
        ops.register(EdgeKind::StopLocal, stop);
        ops.register(EdgeKind::Noop, noop);
        ops
    }

    pub fn register(&mut self, kind: EdgeKind, op: Operation) {
        self.ops.insert(kind, op);
    }

    pub fn unregister(&mut self, kind: EdgeKind) {
        self.ops.remove(&kind);
    }

    /// Every legal edge must have an operation.
    pub fn verify(&self, table: &TransitionTable) -> Result<()> {
        let mut missing: Vec<String> = table
            .edges()
            .filter(|(_, _, kind)| !self.ops.contains_key(kind))
            .map(|(from, to, kind)| format!("{} -> {} ({})", from, to, kind))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        missing.sort();
        Err(Error::InvalidConfig(format!(
            "no operation registered for: {}",
            missing.join(", ")
        )))
    }

    pub async fn run(&self, kind: EdgeKind, ctx: &TransitionContext<'_>) -> Outcome {
        let op = self.ops.get(&kind).ok_or_else(|| {
            Error::InvalidConfig(format!("no operation registered for {}", kind))
        })?;
        op(ctx).await
    }
}

impl Default for Operations {
    fn default() -> Self {
        Self::standard()
    }
}
