//! Replicated distributed lock.
//!
//! At most one session holds the lock at any instant; waiters queue in
//! arrival (log index) order. Request expirations run on the replicated
//! clock so every replica agrees on them, and the absolute expiration
//! stamps carried by queued holders are the canonical source for
//! rebuilding timers after a snapshot restore.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::service::{Service, ServiceContext};

pub const LOCK_SERVICE: &str = "LOCK";

/// Lock operations, bincode-encoded into command arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LockRequest {
    /// `timeout` in milliseconds: 0 tries once, a positive value waits
    /// that long, a negative value waits forever.
    Lock { id: u32, timeout: i64 },
    Unlock { id: u32 },
}

/// Events published to client sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LockEvent {
    Locked { id: u32, index: u64 },
    Failed { id: u32, index: u64 },
}

impl LockEvent {
    pub fn decode(payload: &[u8]) -> Result<LockEvent> {
        Ok(bincode::deserialize(payload)?)
    }

    fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap()
    }
}

/// Who owns, or waits for, the lock. `expire == 0` means no expiration;
/// otherwise it is an absolute replicated timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockHolder {
    pub id: u32,
    pub index: u64,
    pub session: u64,
    pub expire: u64,
}

#[derive(Debug, Default)]
pub struct LockService {
    holder: Option<LockHolder>,
    queue: VecDeque<LockHolder>,
}

impl LockService {
    pub fn factory() -> Box<dyn Service> {
        Box::<LockService>::default()
    }

    fn lock(&mut self, ctx: &mut ServiceContext<'_>, id: u32, timeout: i64) {
        if self.holder.is_none() {
            // Free lock: grant immediately. The event still goes out so the
            // client observes the grant on its side channel.
            self.holder = Some(LockHolder {
                id,
                index: ctx.index(),
                session: ctx.session(),
                expire: 0,
            });
            ctx.publish(
                ctx.session(),
                LockEvent::Locked {
                    id,
                    index: ctx.index(),
                }
                .encode(),
            );
        } else if timeout == 0 {
            // A zero timeout is a single attempt; fail it right away.
            ctx.publish(
                ctx.session(),
                LockEvent::Failed {
                    id,
                    index: ctx.index(),
                }
                .encode(),
            );
        } else if timeout > 0 {
            let expire = ctx.now() + timeout as u64;
            self.queue.push_back(LockHolder {
                id,
                index: ctx.index(),
                session: ctx.session(),
                expire,
            });
            ctx.schedule_at(ctx.index(), expire);
        } else {
            self.queue.push_back(LockHolder {
                id,
                index: ctx.index(),
                session: ctx.session(),
                expire: 0,
            });
        }
    }

    fn unlock(&mut self, ctx: &mut ServiceContext<'_>, id: u32) {
        let Some(holder) = &self.holder else {
            return;
        };
        // Releases from a session that is not the holder are ignored, as
        // are releases naming a lock id the holder never acquired.
        if holder.session != ctx.session() {
            return;
        }
        if holder.id != id {
            return;
        }
        self.grant_next(ctx, Some(ctx.index()));
    }

    // Hand the lock to the earliest waiter whose session is still alive.
    // `event_index` overrides the index carried by the grant event; session
    // releases keep the waiter's own enqueue index.
    fn grant_next(&mut self, ctx: &mut ServiceContext<'_>, event_index: Option<u64>) {
        loop {
            let next = match self.queue.pop_front() {
                Some(next) => next,
                None => {
                    self.holder = None;
                    return;
                }
            };
            ctx.cancel_timer(next.index);
            if ctx.is_active(next.session) {
                ctx.publish(
                    next.session,
                    LockEvent::Locked {
                        id: next.id,
                        index: event_index.unwrap_or(next.index),
                    }
                    .encode(),
                );
                self.holder = Some(next);
                return;
            }
            log::debug!("skipping dead waiter from session {}", next.session);
        }
    }

    fn release_session(&mut self, ctx: &mut ServiceContext<'_>, session: u64) {
        let stale: Vec<u64> = self
            .queue
            .iter()
            .filter(|w| w.session == session)
            .map(|w| w.index)
            .collect();
        for index in stale {
            ctx.cancel_timer(index);
        }
        self.queue.retain(|w| w.session != session);

        if self.holder.as_ref().map_or(false, |h| h.session == session) {
            self.grant_next(ctx, None);
        }
    }
}

impl Service for LockService {
    fn apply(&mut self, ctx: &mut ServiceContext<'_>, args: &[u8]) {
        match bincode::deserialize::<LockRequest>(args) {
            Ok(LockRequest::Lock { id, timeout }) => self.lock(ctx, id, timeout),
            Ok(LockRequest::Unlock { id }) => self.unlock(ctx, id),
            Err(e) => log::warn!("failed to decode lock request: {}", e),
        }
    }

    fn backup(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&(&self.holder, &self.queue))?)
    }

    fn restore(&mut self, data: &[u8], ctx: &mut ServiceContext<'_>) -> Result<()> {
        let (holder, queue): (Option<LockHolder>, VecDeque<LockHolder>) =
            bincode::deserialize(data)?;
        self.holder = holder;
        self.queue = queue;
        // The previous timer set is gone; every queued request with an
        // expiration gets its timer back at the original absolute deadline.
        for waiter in &self.queue {
            if waiter.expire > 0 {
                ctx.schedule_at(waiter.index, waiter.expire);
            }
        }
        Ok(())
    }

    fn on_timer(&mut self, ctx: &mut ServiceContext<'_>, id: u64) {
        if let Some(pos) = self.queue.iter().position(|w| w.index == id) {
            let waiter = self.queue.remove(pos).expect("position is in range");
            if ctx.is_active(waiter.session) {
                ctx.publish(
                    waiter.session,
                    LockEvent::Failed {
                        id: waiter.id,
                        index: waiter.index,
                    }
                    .encode(),
                );
            }
        }
    }

    fn on_expire(&mut self, ctx: &mut ServiceContext<'_>, session: u64) {
        self.release_session(ctx, session);
    }

    fn on_close(&mut self, ctx: &mut ServiceContext<'_>, session: u64) {
        self.release_session(ctx, session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ReplicatedClock, Scheduler};
    use crate::service::session::Sessions;

    struct Fixture {
        clock: ReplicatedClock,
        scheduler: Scheduler,
        sessions: Sessions,
    }

    impl Fixture {
        fn new() -> Fixture {
            Fixture {
                clock: ReplicatedClock::default(),
                scheduler: Scheduler::new(),
                sessions: Sessions::new(),
            }
        }

        fn ctx(&mut self, index: u64, session: u64) -> ServiceContext<'_> {
            self.sessions.ensure_open(session);
            ServiceContext::new(
                index,
                session,
                LOCK_SERVICE,
                &self.clock,
                &mut self.scheduler,
                &mut self.sessions,
            )
        }
    }

    #[test]
    fn waiters_queue_in_index_order() {
        let mut fx = Fixture::new();
        let mut svc = LockService::default();

        svc.lock(&mut fx.ctx(1, 1), 1, -1);
        svc.lock(&mut fx.ctx(2, 2), 2, -1);
        svc.lock(&mut fx.ctx(3, 3), 3, -1);

        assert_eq!(svc.holder.as_ref().unwrap().session, 1);
        let order: Vec<u64> = svc.queue.iter().map(|w| w.index).collect();
        assert_eq!(order, vec![2, 3]);
    }

    #[test]
    fn timed_waiter_schedules_its_expiration() {
        let mut fx = Fixture::new();
        fx.clock.advance(1000);
        let mut svc = LockService::default();

        svc.lock(&mut fx.ctx(1, 1), 1, -1);
        svc.lock(&mut fx.ctx(2, 2), 2, 500);

        assert_eq!(svc.queue[0].expire, 1500);
        assert_eq!(fx.scheduler.len(), 1);

        // granting the waiter cancels its timer
        svc.unlock(&mut fx.ctx(3, 1), 1);
        assert!(fx.scheduler.is_empty());
        assert_eq!(svc.holder.as_ref().unwrap().session, 2);
    }

    #[test]
    fn release_session_purges_queue_and_holder() {
        let mut fx = Fixture::new();
        let mut svc = LockService::default();

        svc.lock(&mut fx.ctx(1, 1), 1, -1);
        svc.lock(&mut fx.ctx(2, 1), 2, 900);
        svc.lock(&mut fx.ctx(3, 2), 3, -1);

        svc.on_close(&mut fx.ctx(0, 0), 1);

        assert_eq!(svc.holder.as_ref().unwrap().session, 2);
        assert!(svc.queue.is_empty());
        assert!(fx.scheduler.is_empty());
    }

    #[test]
    fn restore_rebuilds_timers_only_for_expiring_waiters() {
        let mut fx = Fixture::new();
        let mut svc = LockService::default();
        svc.holder = Some(LockHolder {
            id: 1,
            index: 10,
            session: 1,
            expire: 0,
        });
        svc.queue.push_back(LockHolder {
            id: 2,
            index: 11,
            session: 2,
            expire: 4000,
        });
        svc.queue.push_back(LockHolder {
            id: 3,
            index: 12,
            session: 3,
            expire: 0,
        });

        let data = svc.backup().unwrap();
        let mut restored = LockService::default();
        restored.restore(&data, &mut fx.ctx(12, 0)).unwrap();

        assert_eq!(restored.holder, svc.holder);
        assert_eq!(restored.queue, svc.queue);
        assert_eq!(fx.scheduler.len(), 1);
        assert_eq!(fx.scheduler.due(4000), vec![(LOCK_SERVICE.to_string(), 11)]);
    }

    #[test]
    fn timer_fire_for_a_granted_waiter_is_harmless() {
        let mut fx = Fixture::new();
        let mut svc = LockService::default();

        svc.lock(&mut fx.ctx(1, 1), 1, -1);
        svc.lock(&mut fx.ctx(2, 2), 2, 800);
        svc.unlock(&mut fx.ctx(3, 1), 1);

        // a stray fire for an index no longer queued does nothing
        svc.on_timer(&mut fx.ctx(4, 0), 2);
        assert_eq!(svc.holder.as_ref().unwrap().session, 2);
    }
}
