//! Reclaim scheduler.
//!
//! Each sweep soft-reclaims expired ACTIVE leases into ORPHANED with a
//! per-site grace window, hard-reclaims orphans whose grace has elapsed, and
//! expires STOP/DRAIN intents that were never acknowledged. Every step is a
//! conditional update, so a sweep racing a renewal or an acquisition simply
//! loses.

use tokio::sync::watch;
use tracing::{debug, info, warn};

use vigil_core::SharedClock;
use vigil_core::clock::secs;
use vigil_core::config::ReclaimConfig;

use crate::dispatch::Dispatcher;
use crate::lease::LeaseStore;
use crate::storage::{ControlDatabase, DatabaseError, IntentKind};

/// What one sweep changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub orphaned: usize,
    pub reclaimed: usize,
    pub expired_intents: usize,
}

impl SweepReport {
    pub const fn is_empty(&self) -> bool {
        self.orphaned == 0 && self.reclaimed == 0 && self.expired_intents == 0
    }
}

pub struct ReclaimScheduler {
    db: ControlDatabase,
    clock: SharedClock,
    leases: LeaseStore,
    dispatcher: Dispatcher,
    config: ReclaimConfig,
}

impl ReclaimScheduler {
    pub fn new(
        db: ControlDatabase,
        clock: SharedClock,
        leases: LeaseStore,
        dispatcher: Dispatcher,
        config: ReclaimConfig,
    ) -> Self {
        Self {
            db,
            clock,
            leases,
            dispatcher,
            config,
        }
    }

    /// Run one sweep.
    pub async fn sweep(&self) -> Result<SweepReport, DatabaseError> {
        let now = self.clock.now();
        let mut report = SweepReport::default();

        for expired in self.db.expired_active_leases(now).await? {
            let grace = self.config.grace_for(&expired.site_id);
            let reclaim_at = now + secs(grace);
            if self
                .db
                .orphan_lease(&expired.camera_id, expired.generation, reclaim_at, now)
                .await?
            {
                report.orphaned += 1;
                info!(
                    camera_id = %expired.camera_id,
                    generation = expired.generation,
                    worker_id = expired.worker_id.as_deref().unwrap_or_default(),
                    reclaim_at,
                    "Lease expired, orphaned"
                );
            }
        }

        let reclaimed = self.db.hard_reclaim(now).await?;
        for lease in &reclaimed {
            info!(camera_id = %lease.camera_id, generation = lease.generation, "Lease hard-reclaimed");
        }
        report.reclaimed = reclaimed.len();

        let issued_before = now - secs(self.dispatcher.drain_ack_timeout());
        let expired = self.db.expire_stale_intents(issued_before, now).await?;
        report.expired_intents = expired.len();
        for intent in expired {
            match intent.kind() {
                Some(IntentKind::Stop) => {
                    self.leases
                        .release_held(
                            &intent.camera_id,
                            intent.generation,
                            &intent.worker_id,
                            "stop ack timeout",
                        )
                        .await?;
                }
                Some(IntentKind::Drain) => {
                    self.dispatcher
                        .release_all(&intent.worker_id, "drain ack timeout")
                        .await?;
                }
                _ => {}
            }
        }

        if !report.is_empty() {
            debug!(?report, "Reclaim sweep finished");
        }
        Ok(report)
    }

    /// Sweep on every tick until `shutdown` flips to true. Store failures
    /// are logged and retried on the next tick.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.tick());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(tick_secs = self.config.tick_secs, "Reclaim scheduler started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.sweep().await {
                        Ok(_) => {}
                        Err(e) if e.is_unavailable() => {
                            warn!(error = %e, "Lease store unavailable, retrying next tick");
                        }
                        Err(e) => warn!(error = %e, "Reclaim sweep failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Reclaim scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use vigil_core::{Clock, ManualClock};
    use vigil_core::protocol::LeaseState;

    use super::*;
    use crate::registry::ConnectionRegistry;

    struct Fixture {
        db: ControlDatabase,
        clock: ManualClock,
        leases: LeaseStore,
        scheduler: ReclaimScheduler,
    }

    async fn fixture(config: ReclaimConfig) -> Fixture {
        let db = ControlDatabase::open_in_memory().await.unwrap();
        db.upsert_camera("cam-1", "t1", "lobby", "rtsp", "rtsp://cam-1", 0)
            .await
            .unwrap();
        db.upsert_camera("cam-2", "t1", "garage", "rtsp", "rtsp://cam-2", 0)
            .await
            .unwrap();
        let clock = ManualClock::new(100_000);
        let shared: SharedClock = Arc::new(clock.clone());
        let leases = LeaseStore::new(db.clone(), Arc::clone(&shared), Duration::from_secs(90));
        let dispatcher = Dispatcher::new(
            db.clone(),
            Arc::clone(&shared),
            leases.clone(),
            ConnectionRegistry::new(),
            Duration::from_secs(8),
            "m".into(),
        );
        let scheduler =
            ReclaimScheduler::new(db.clone(), shared, leases.clone(), dispatcher, config);
        Fixture {
            db,
            clock,
            leases,
            scheduler,
        }
    }

    #[tokio::test]
    async fn live_leases_are_untouched() {
        let f = fixture(ReclaimConfig::default()).await;
        f.leases.try_acquire("cam-1", "w1", 0, 2).await.unwrap();
        f.clock.advance(Duration::from_secs(60));

        let report = f.scheduler.sweep().await.unwrap();
        assert!(report.is_empty());
    }

    #[tokio::test]
    async fn grace_window_is_per_site() {
        let mut config = ReclaimConfig::default();
        config.site_grace_secs.insert("lobby".into(), 10);
        let f = fixture(config).await;
        f.leases.try_acquire("cam-1", "w1", 0, 2).await.unwrap();
        f.leases.try_acquire("cam-2", "w1", 0, 2).await.unwrap();

        f.clock.advance(Duration::from_secs(91));
        let report = f.scheduler.sweep().await.unwrap();
        assert_eq!(report.orphaned, 2);

        let lobby = f.leases.get("cam-1").await.unwrap().unwrap();
        let garage = f.leases.get("cam-2").await.unwrap().unwrap();
        assert_eq!(lobby.reclaim_at, Some(f.clock.now() + 10));
        assert_eq!(garage.reclaim_at, Some(f.clock.now() + 90));

        f.clock.advance(Duration::from_secs(10));
        let report = f.scheduler.sweep().await.unwrap();
        assert_eq!(report.reclaimed, 1);
        assert!(f.leases.get("cam-1").await.unwrap().unwrap().worker_id.is_none());
        assert_eq!(
            f.leases.get("cam-2").await.unwrap().unwrap().worker_id.as_deref(),
            Some("w1")
        );
    }

    #[tokio::test]
    async fn renewal_inside_grace_survives_sweep() {
        let f = fixture(ReclaimConfig::default()).await;
        f.leases.try_acquire("cam-1", "w1", 0, 1).await.unwrap();
        f.clock.advance(Duration::from_secs(91));
        f.scheduler.sweep().await.unwrap();

        f.clock.advance(Duration::from_secs(30));
        assert!(f.leases.renew("cam-1", 1, "w1").await.unwrap());

        f.clock.advance(Duration::from_secs(70));
        let report = f.scheduler.sweep().await.unwrap();
        assert!(report.is_empty());
        assert_eq!(
            f.leases.get("cam-1").await.unwrap().unwrap().state(),
            LeaseState::Active
        );
    }

    #[tokio::test]
    async fn unacked_stop_releases_lease() {
        let f = fixture(ReclaimConfig::default()).await;
        f.leases.try_acquire("cam-1", "w1", 0, 1).await.unwrap();
        f.db.record_intent("stop-1", "cam-1", 1, "w1", IntentKind::Stop, f.clock.now())
            .await
            .unwrap();

        f.clock.advance(Duration::from_secs(9));
        let report = f.scheduler.sweep().await.unwrap();
        assert_eq!(report.expired_intents, 1);

        let lease = f.leases.get("cam-1").await.unwrap().unwrap();
        assert_eq!(lease.state(), LeaseState::Terminated);
        assert_eq!(lease.reason, "stop ack timeout");
    }

    #[tokio::test]
    async fn sweep_fails_closed_on_store_error() {
        let f = fixture(ReclaimConfig::default()).await;
        f.db.close().await;
        assert!(f.scheduler.sweep().await.is_err());
    }

    #[tokio::test]
    async fn run_sweeps_until_shutdown() {
        let f = fixture(ReclaimConfig::default()).await;
        f.leases.try_acquire("cam-1", "w1", 0, 1).await.unwrap();
        f.clock.advance(Duration::from_secs(91));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(f.scheduler.run(rx));

        // The first tick fires immediately
        for _ in 0..50 {
            let state = f.leases.get("cam-1").await.unwrap().unwrap().state();
            if state == LeaseState::Orphaned {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(
            f.leases.get("cam-1").await.unwrap().unwrap().state(),
            LeaseState::Orphaned
        );

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
