//! Request-handling logic shared by all non-leader roles.
//!
//! Each handler returns its response together with a transition marker;
//! the replica actor moves to the follower role after sending the response
//! whenever the marker is set. Handlers persist term and vote changes
//! through the context before building the response, so the metadata store
//! is always flushed ahead of the reply.

use crate::error::{RaftError, Result};
use crate::metrics;
use crate::raft::entry::Entry;
use crate::raft::message::{
    PingRequest, PingResponse, PollRequest, PollResponse, SyncRequest, SyncResponse,
};
use crate::raft::replica::{ReplicaContext, ReplicaEvent};

// Adopt a greater term, or learn the leader at the current term when none
// is known. Returns the transition marker.
fn update_term_and_leader(
    ctx: &mut ReplicaContext,
    term: u64,
    leader: Option<&String>,
) -> Result<bool> {
    if term > ctx.current_term() || (term == ctx.current_term() && ctx.current_leader().is_none()) {
        ctx.set_current_term(term)?;
        ctx.set_current_leader(leader.cloned());
        return Ok(true);
    }
    Ok(false)
}

/// Handles a leader heartbeat.
pub fn ping(ctx: &mut ReplicaContext, req: &PingRequest) -> Result<(PingResponse, bool)> {
    let transition = update_term_and_leader(ctx, req.term, req.leader.as_ref())?;

    if req.term < ctx.current_term() {
        log::debug!(
            "rejecting ping at term {} below local term {}",
            req.term,
            ctx.current_term()
        );
        return Ok((ping_response(ctx, req.id, false), transition));
    }

    // Consistency probe: only meaningful when the leader supplied one.
    let accepted = if req.log_index > 0 && req.log_term > 0 {
        if req.log_index > ctx.log.last_index() {
            false
        } else {
            match ctx.log.get(req.log_index)? {
                Some(entry) => entry.term() == req.log_term,
                None => false,
            }
        }
    } else {
        true
    };

    Ok((ping_response(ctx, req.id, accepted), transition))
}

fn ping_response(ctx: &ReplicaContext, id: u64, accepted: bool) -> PingResponse {
    PingResponse {
        id,
        term: ctx.current_term(),
        accepted,
    }
}

/// Handles a log replication request.
pub fn sync(ctx: &mut ReplicaContext, req: &SyncRequest) -> Result<(SyncResponse, bool)> {
    let transition = update_term_and_leader(ctx, req.term, req.leader.as_ref())?;

    if req.term < ctx.current_term() {
        return Ok((sync_response(ctx, req.id, false), transition));
    }

    if req.prev_log_index > 0 && req.prev_log_term > 0 {
        let matches = if req.prev_log_index > ctx.log.last_index() {
            false
        } else {
            match ctx.log.get(req.prev_log_index)? {
                Some(entry) => entry.term() == req.prev_log_term,
                None => false,
            }
        };
        if !matches {
            log::debug!(
                "log inconsistent at index {} term {}",
                req.prev_log_index,
                req.prev_log_term
            );
            return Ok((sync_response(ctx, req.id, false), transition));
        }
    }

    // Conflict resolution: entries matching by term stay in place; the
    // first conflicting entry truncates the tail, and everything from
    // there on is appended in one call.
    let mut pending = Vec::new();
    for (i, entry) in req.entries.iter().enumerate() {
        let index = req.prev_log_index + i as u64 + 1;
        // Entries at or below the applied prefix are immutable; a correct
        // leader never conflicts there.
        if index <= ctx.last_applied() {
            continue;
        }
        if !pending.is_empty() {
            pending.push(entry.clone());
            continue;
        }
        match ctx.log.get(index)? {
            Some(existing) if existing.term() == entry.term() => {}
            Some(_) => {
                ctx.log.truncate(index - 1)?;
                pending.push(entry.clone());
            }
            None => pending.push(entry.clone()),
        }
    }
    if !pending.is_empty() {
        ctx.log.append(pending)?;
    }

    let commit = req
        .commit_index
        .max(ctx.commit_index())
        .min(ctx.log.last_index());
    ctx.set_commit_index(commit);
    apply_pending(ctx)?;
    compact_if_needed(ctx)?;

    Ok((sync_response(ctx, req.id, true), transition))
}

fn sync_response(ctx: &ReplicaContext, id: u64, accepted: bool) -> SyncResponse {
    SyncResponse {
        id,
        term: ctx.current_term(),
        accepted,
        last_index: ctx.log.last_index(),
    }
}

/// Handles a vote request. The first matching clause wins.
pub fn poll(ctx: &mut ReplicaContext, req: &PollRequest) -> Result<(PollResponse, bool)> {
    let mut transition = false;
    if req.term > ctx.current_term() {
        ctx.set_current_term(req.term)?;
        transition = true;
    }

    let granted = if req.term < ctx.current_term() {
        false
    } else if req.candidate == ctx.local_id() {
        record_vote(ctx, &req.candidate)?;
        true
    } else if !ctx.cluster().contains(&req.candidate) {
        log::debug!("rejecting poll from unknown candidate {}", req.candidate);
        false
    } else if ctx
        .last_voted_for()
        .map_or(false, |vote| vote != req.candidate)
    {
        false
    } else {
        // Up-to-date check against the local log's last entry.
        let last_index = ctx.log.last_index();
        let (local_index, local_term) = match ctx.log.get(last_index)? {
            Some(entry) => (last_index, entry.term()),
            None => (0, 0),
        };
        if req.last_log_index >= local_index && req.last_log_term >= local_term {
            record_vote(ctx, &req.candidate)?;
            true
        } else {
            ctx.set_last_voted_for(None)?;
            false
        }
    };

    Ok((
        PollResponse {
            id: req.id,
            term: ctx.current_term(),
            granted,
        },
        transition,
    ))
}

fn record_vote(ctx: &mut ReplicaContext, candidate: &str) -> Result<()> {
    ctx.set_last_voted_for(Some(candidate.to_string()))?;
    ctx.emit(ReplicaEvent::VoteCast {
        term: ctx.current_term(),
        candidate: candidate.to_string(),
    });
    Ok(())
}

/// Applies committed entries up to the commit index, one index at a time.
/// A hole at the expected index is fatal.
pub fn apply_pending(ctx: &mut ReplicaContext) -> Result<()> {
    while ctx.last_applied() < ctx.commit_index() {
        let index = ctx.last_applied() + 1;
        let entry = ctx.log.get(index)?.ok_or_else(|| {
            RaftError::Corrupt(format!("missing committed entry at index {}", index))
        })?;
        match entry {
            Entry::Command { command, .. } => {
                ctx.state_machine.apply_command(index, &command);
                metrics::APPLIED_ENTRIES.inc();
            }
            Entry::Configuration { cluster, .. } => {
                ctx.set_cluster(cluster)?;
            }
            Entry::Snapshot {
                term,
                cluster,
                data,
            } => {
                ctx.state_machine.install_snapshot(index, &data)?;
                ctx.set_cluster(cluster)?;
                ctx.set_current_term(term)?;
            }
            Entry::NoOp { .. } => {}
        }
        ctx.set_last_applied(index);
    }
    Ok(())
}

/// Compacts the log behind the applied prefix once it outgrows the
/// configured size. Compaction failures are fatal.
pub fn compact_if_needed(ctx: &mut ReplicaContext) -> Result<()> {
    if !ctx.log.is_compactable()
        || ctx.last_applied() == 0
        || ctx.log.size() <= ctx.max_log_size()
    {
        return Ok(());
    }
    let data = match ctx.state_machine.snapshot()? {
        Some(data) => data,
        None => return Ok(()),
    };
    let entry = Entry::Snapshot {
        term: ctx.current_term(),
        cluster: ctx.cluster().clone(),
        data,
    };
    let index = ctx.last_applied();
    ctx.log
        .compact(index, entry)
        .map_err(|e| RaftError::Compaction(e.to_string()))?;
    metrics::SNAPSHOTS.inc();
    log::info!("compacted log at index {}", index);
    Ok(())
}
