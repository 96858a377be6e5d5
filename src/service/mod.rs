//! Replicated service runtime.
//!
//! Services are deterministic state machines layered over the replica:
//! they consume committed commands, replicated time and session lifecycle
//! callbacks, all delivered on the apply thread. The runtime routes
//! commands to services by name, owns the replicated clock and the timer
//! scheduler, and turns the whole service set into one snapshot for log
//! compaction.

pub mod lock;
pub mod session;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::clock::{ReplicatedClock, Scheduler};
use crate::error::Result;
use crate::raft::entry::Command;
use crate::raft::StateMachine;
use crate::service::session::{ServiceEvent, SessionState, Sessions};

/// A deterministic replicated service.
///
/// Everything a service observes — command arguments, the clock, timer
/// fires, session deaths — arrives through these methods in the same order
/// on every replica.
pub trait Service: Send {
    /// Applies one committed operation.
    fn apply(&mut self, ctx: &mut ServiceContext<'_>, args: &[u8]);

    /// Serializes the service state for a snapshot.
    fn backup(&self) -> Result<Vec<u8>>;

    /// Restores state written by `backup` and rebuilds timers from it.
    fn restore(&mut self, data: &[u8], ctx: &mut ServiceContext<'_>) -> Result<()>;

    /// A timer scheduled by this service fired.
    fn on_timer(&mut self, ctx: &mut ServiceContext<'_>, id: u64);

    /// A session was expired by the cluster.
    fn on_expire(&mut self, ctx: &mut ServiceContext<'_>, session: u64);

    /// A session was closed by the client.
    fn on_close(&mut self, ctx: &mut ServiceContext<'_>, session: u64);
}

pub type ServiceFactory = fn() -> Box<dyn Service>;

/// Ambient state handed to a service for one callback.
pub struct ServiceContext<'a> {
    index: u64,
    session: u64,
    service: &'a str,
    clock: &'a ReplicatedClock,
    scheduler: &'a mut Scheduler,
    sessions: &'a mut Sessions,
}

impl<'a> ServiceContext<'a> {
    pub(crate) fn new(
        index: u64,
        session: u64,
        service: &'a str,
        clock: &'a ReplicatedClock,
        scheduler: &'a mut Scheduler,
        sessions: &'a mut Sessions,
    ) -> ServiceContext<'a> {
        ServiceContext {
            index,
            session,
            service,
            clock,
            scheduler,
            sessions,
        }
    }

    /// Log index of the command being applied.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Session that issued the command being applied; 0 for timer and
    /// lifecycle callbacks.
    pub fn session(&self) -> u64 {
        self.session
    }

    /// Replicated clock reading, milliseconds.
    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    /// Schedules (or reschedules) a timer at an absolute replicated
    /// timestamp.
    pub fn schedule_at(&mut self, id: u64, fire_at: u64) {
        self.scheduler.schedule_at(self.service, id, fire_at);
    }

    /// Schedules a timer `delay` milliseconds from now.
    pub fn schedule_after(&mut self, id: u64, delay: u64) {
        self.scheduler
            .schedule_after(self.service, id, delay, self.clock.now());
    }

    /// Cancels a timer; cancelling an unknown id is a no-op.
    pub fn cancel_timer(&mut self, id: u64) {
        self.scheduler.cancel(self.service, id);
    }

    pub fn is_active(&self, session: u64) -> bool {
        self.sessions.is_active(session)
    }

    /// Publishes an event to a session's side channel. Delivery happens
    /// after the current command finishes applying.
    pub fn publish(&mut self, session: u64, payload: Vec<u8>) {
        self.sessions.publish(ServiceEvent {
            session,
            service: self.service.to_string(),
            payload,
        });
    }
}

#[derive(Serialize, Deserialize)]
struct RuntimeSnapshot {
    clock: ReplicatedClock,
    sessions: BTreeMap<u64, SessionState>,
    services: BTreeMap<String, Vec<u8>>,
}

/// The state machine hosting all registered services.
#[derive(Default)]
pub struct ServiceRuntime {
    services: BTreeMap<String, Box<dyn Service>>,
    sessions: Sessions,
    clock: ReplicatedClock,
    scheduler: Scheduler,
}

impl ServiceRuntime {
    pub fn new() -> ServiceRuntime {
        ServiceRuntime::default()
    }

    /// Instantiates a service under its stable name.
    pub fn register(&mut self, name: &str, factory: ServiceFactory) {
        log::info!("registered service {}", name);
        self.services.insert(name.to_string(), factory());
    }

    pub fn sessions_mut(&mut self) -> &mut Sessions {
        &mut self.sessions
    }

    pub fn clock(&self) -> &ReplicatedClock {
        &self.clock
    }

    pub fn open_session(&mut self, session: u64) {
        self.sessions.ensure_open(session);
    }

    // Run every timer that became due, in deadline order. Timer fires are
    // drained before the triggering command applies, and never interleave
    // with it.
    fn fire_due(&mut self, index: u64) {
        loop {
            let due = self.scheduler.due(self.clock.now());
            if due.is_empty() {
                return;
            }
            for (name, id) in due {
                if let Some(service) = self.services.get_mut(&name) {
                    let mut ctx = ServiceContext::new(
                        index,
                        0,
                        &name,
                        &self.clock,
                        &mut self.scheduler,
                        &mut self.sessions,
                    );
                    service.on_timer(&mut ctx, id);
                }
            }
        }
    }

    fn fan_out_session_death(&mut self, session: u64, expired: bool) {
        for (name, service) in self.services.iter_mut() {
            let mut ctx = ServiceContext::new(
                0,
                session,
                name,
                &self.clock,
                &mut self.scheduler,
                &mut self.sessions,
            );
            if expired {
                service.on_expire(&mut ctx, session);
            } else {
                service.on_close(&mut ctx, session);
            }
        }
        self.sessions.flush();
    }
}

impl StateMachine for ServiceRuntime {
    fn apply_command(&mut self, index: u64, command: &Command) {
        self.clock.advance(command.timestamp);
        self.sessions.ensure_open(command.session);
        self.fire_due(index);

        match self.services.get_mut(&command.service) {
            Some(service) => {
                let mut ctx = ServiceContext::new(
                    index,
                    command.session,
                    &command.service,
                    &self.clock,
                    &mut self.scheduler,
                    &mut self.sessions,
                );
                service.apply(&mut ctx, &command.args);
            }
            None => log::warn!("command at index {} for unknown service {}", index, command.service),
        }

        self.sessions.flush();
    }

    fn snapshot(&self) -> Result<Option<Vec<u8>>> {
        let mut services = BTreeMap::new();
        for (name, service) in &self.services {
            services.insert(name.clone(), service.backup()?);
        }
        let snapshot = RuntimeSnapshot {
            clock: self.clock,
            sessions: self.sessions.states(),
            services,
        };
        Ok(Some(bincode::serialize(&snapshot)?))
    }

    fn install_snapshot(&mut self, index: u64, data: &[u8]) -> Result<()> {
        let snapshot: RuntimeSnapshot = bincode::deserialize(data)?;
        self.clock.advance(snapshot.clock.now());
        self.sessions.restore(snapshot.sessions);
        // Drop the previous timer set wholesale; services rebuild theirs
        // from the restored state.
        self.scheduler.clear();

        for (name, data) in &snapshot.services {
            match self.services.get_mut(name) {
                Some(service) => {
                    let mut ctx = ServiceContext::new(
                        index,
                        0,
                        name,
                        &self.clock,
                        &mut self.scheduler,
                        &mut self.sessions,
                    );
                    service.restore(data, &mut ctx)?;
                }
                None => log::warn!("snapshot carries unknown service {}", name),
            }
        }
        log::info!("installed snapshot at index {}", index);
        Ok(())
    }

    fn session_expired(&mut self, session: u64) {
        if self.sessions.expire(session) {
            self.fan_out_session_death(session, true);
        }
    }

    fn session_closed(&mut self, session: u64) {
        if self.sessions.close(session) {
            self.fan_out_session_death(session, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::lock::{LockEvent, LockHolder, LockRequest, LockService, LOCK_SERVICE};
    use super::*;

    fn lock_command(session: u64, timestamp: u64, request: &LockRequest) -> Command {
        Command {
            session,
            timestamp,
            service: LOCK_SERVICE.to_string(),
            args: bincode::serialize(request).unwrap(),
        }
    }

    fn runtime() -> ServiceRuntime {
        let mut runtime = ServiceRuntime::new();
        runtime.register(LOCK_SERVICE, LockService::factory);
        runtime
    }

    fn events(runtime: &mut ServiceRuntime) -> Vec<(u64, LockEvent)> {
        runtime
            .sessions_mut()
            .take_delivered()
            .into_iter()
            .map(|e| (e.session, LockEvent::decode(&e.payload).unwrap()))
            .collect()
    }

    fn lock_state(runtime: &ServiceRuntime) -> (Option<LockHolder>, Vec<LockHolder>) {
        let data = runtime.snapshot().unwrap().unwrap();
        let snapshot: RuntimeSnapshot = bincode::deserialize(&data).unwrap();
        let (holder, queue): (Option<LockHolder>, std::collections::VecDeque<LockHolder>) =
            bincode::deserialize(&snapshot.services[LOCK_SERVICE]).unwrap();
        (holder, queue.into_iter().collect())
    }

    #[test]
    fn free_lock_is_granted_immediately() {
        let mut rt = runtime();
        rt.apply_command(
            100,
            &lock_command(7, 1000, &LockRequest::Lock { id: 1, timeout: 5000 }),
        );

        assert_eq!(
            events(&mut rt),
            vec![(7, LockEvent::Locked { id: 1, index: 100 })]
        );
        let (holder, queue) = lock_state(&rt);
        assert_eq!(
            holder,
            Some(LockHolder {
                id: 1,
                index: 100,
                session: 7,
                expire: 0
            })
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn try_lock_on_free_lock_succeeds() {
        let mut rt = runtime();
        rt.apply_command(
            10,
            &lock_command(3, 500, &LockRequest::Lock { id: 9, timeout: 0 }),
        );

        assert_eq!(
            events(&mut rt),
            vec![(3, LockEvent::Locked { id: 9, index: 10 })]
        );
    }

    #[test]
    fn try_lock_on_held_lock_fails_immediately() {
        let mut rt = runtime();
        rt.apply_command(
            10,
            &lock_command(1, 500, &LockRequest::Lock { id: 1, timeout: -1 }),
        );
        rt.apply_command(
            11,
            &lock_command(2, 600, &LockRequest::Lock { id: 2, timeout: 0 }),
        );

        let all = events(&mut rt);
        assert_eq!(all[1], (2, LockEvent::Failed { id: 2, index: 11 }));
        let (_, queue) = lock_state(&rt);
        assert!(queue.is_empty());
    }

    #[test]
    fn waiter_times_out_on_the_replicated_clock() {
        let mut rt = runtime();
        rt.apply_command(
            100,
            &lock_command(7, 1000, &LockRequest::Lock { id: 1, timeout: 5000 }),
        );
        rt.apply_command(
            101,
            &lock_command(8, 1500, &LockRequest::Lock { id: 2, timeout: 2000 }),
        );
        let (_, queue) = lock_state(&rt);
        assert_eq!(
            queue,
            vec![LockHolder {
                id: 2,
                index: 101,
                session: 8,
                expire: 3500
            }]
        );
        events(&mut rt); // discard the grant to session 7

        // a later command moves the clock past the deadline
        rt.apply_command(
            102,
            &lock_command(9, 3500, &LockRequest::Unlock { id: 99 }),
        );

        assert_eq!(
            events(&mut rt),
            vec![(8, LockEvent::Failed { id: 2, index: 101 })]
        );
        let (_, queue) = lock_state(&rt);
        assert!(queue.is_empty());
    }

    #[test]
    fn unlock_grants_the_earliest_live_waiter() {
        let mut rt = runtime();
        rt.apply_command(
            1,
            &lock_command(1, 100, &LockRequest::Lock { id: 1, timeout: -1 }),
        );
        rt.apply_command(
            2,
            &lock_command(2, 110, &LockRequest::Lock { id: 2, timeout: -1 }),
        );
        rt.apply_command(
            3,
            &lock_command(3, 120, &LockRequest::Lock { id: 3, timeout: -1 }),
        );
        events(&mut rt);

        rt.apply_command(4, &lock_command(1, 130, &LockRequest::Unlock { id: 1 }));

        // FIFO: session 2 enqueued first, so it wins; the grant carries
        // the unlocking command's index
        assert_eq!(
            events(&mut rt),
            vec![(2, LockEvent::Locked { id: 2, index: 4 })]
        );
        let (holder, queue) = lock_state(&rt);
        assert_eq!(holder.unwrap().session, 2);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn unlock_by_non_holder_is_ignored() {
        let mut rt = runtime();
        rt.apply_command(
            1,
            &lock_command(1, 100, &LockRequest::Lock { id: 1, timeout: -1 }),
        );
        events(&mut rt);

        // wrong session
        rt.apply_command(2, &lock_command(2, 110, &LockRequest::Unlock { id: 1 }));
        // right session, wrong id
        rt.apply_command(3, &lock_command(1, 120, &LockRequest::Unlock { id: 5 }));

        assert!(events(&mut rt).is_empty());
        let (holder, _) = lock_state(&rt);
        assert_eq!(holder.unwrap().session, 1);
    }

    #[test]
    fn closing_the_holding_session_grants_the_next_waiter() {
        let mut rt = runtime();
        rt.apply_command(
            100,
            &lock_command(7, 1000, &LockRequest::Lock { id: 1, timeout: 5000 }),
        );
        rt.apply_command(
            101,
            &lock_command(8, 1100, &LockRequest::Lock { id: 2, timeout: -1 }),
        );
        events(&mut rt);

        rt.session_closed(7);

        // the grant on a session release carries the waiter's enqueue index
        assert_eq!(
            events(&mut rt),
            vec![(8, LockEvent::Locked { id: 2, index: 101 })]
        );
        let (holder, queue) = lock_state(&rt);
        assert_eq!(
            holder,
            Some(LockHolder {
                id: 2,
                index: 101,
                session: 8,
                expire: 0
            })
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn expired_session_waiters_are_purged() {
        let mut rt = runtime();
        rt.apply_command(
            1,
            &lock_command(1, 100, &LockRequest::Lock { id: 1, timeout: -1 }),
        );
        rt.apply_command(
            2,
            &lock_command(2, 110, &LockRequest::Lock { id: 2, timeout: 9000 }),
        );
        rt.apply_command(
            3,
            &lock_command(3, 120, &LockRequest::Lock { id: 3, timeout: -1 }),
        );
        events(&mut rt);

        rt.session_expired(2);
        rt.apply_command(4, &lock_command(1, 130, &LockRequest::Unlock { id: 1 }));

        // session 2 left the queue without an event; session 3 wins
        assert_eq!(
            events(&mut rt),
            vec![(3, LockEvent::Locked { id: 3, index: 4 })]
        );
    }

    #[test]
    fn dead_waiters_are_skipped_on_release() {
        let mut rt = runtime();
        rt.apply_command(
            1,
            &lock_command(1, 100, &LockRequest::Lock { id: 1, timeout: -1 }),
        );
        rt.apply_command(
            2,
            &lock_command(2, 110, &LockRequest::Lock { id: 2, timeout: -1 }),
        );
        rt.apply_command(
            3,
            &lock_command(3, 120, &LockRequest::Lock { id: 3, timeout: -1 }),
        );
        events(&mut rt);

        // mark session 2 dead behind the service's back so its queue entry
        // survives until the release has to step over it
        rt.sessions_mut().expire(2);
        rt.apply_command(4, &lock_command(1, 130, &LockRequest::Unlock { id: 1 }));

        assert_eq!(
            events(&mut rt),
            vec![(3, LockEvent::Locked { id: 3, index: 4 })]
        );
        let (holder, queue) = lock_state(&rt);
        assert_eq!(holder.unwrap().session, 3);
        assert!(queue.is_empty());
    }

    #[test]
    fn snapshot_round_trip_preserves_behavior_and_timers() {
        let mut rt = runtime();
        rt.apply_command(
            100,
            &lock_command(7, 1000, &LockRequest::Lock { id: 1, timeout: 5000 }),
        );
        rt.apply_command(
            101,
            &lock_command(8, 1500, &LockRequest::Lock { id: 2, timeout: 2000 }),
        );
        events(&mut rt);

        let data = rt.snapshot().unwrap().unwrap();

        let mut restored = runtime();
        restored.install_snapshot(101, &data).unwrap();

        let (holder, queue) = lock_state(&restored);
        assert_eq!(holder.unwrap().session, 7);
        assert_eq!(queue[0].expire, 3500);

        // the rebuilt timer fires at the original deadline
        restored.apply_command(
            102,
            &lock_command(9, 4000, &LockRequest::Unlock { id: 99 }),
        );
        assert_eq!(
            events(&mut restored),
            vec![(8, LockEvent::Failed { id: 2, index: 101 })]
        );
    }

    #[test]
    fn unknown_service_commands_are_skipped() {
        let mut rt = runtime();
        rt.apply_command(
            1,
            &Command {
                session: 1,
                timestamp: 100,
                service: "CONSISTENT_MAP".into(),
                args: vec![1, 2, 3],
            },
        );
        assert!(events(&mut rt).is_empty());
        // the clock still advanced with the command
        assert_eq!(rt.clock().now(), 100);
    }
}
