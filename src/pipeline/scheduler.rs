// Periodic scheduler
//
// Holds a table of parsed cron expressions, each mapped to a callback that
// queues a batch of items for its phase. The table is rebuilt from scratch
// whenever the stored trigger configs change. The same thread prunes old
// job history.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local, TimeZone};

use crate::db::schema;
use crate::db::Db;
use crate::error::Result;
use crate::jobs::Phase;

use super::cron::CronSchedule;
use super::triggers::{PhaseTracker, TriggerConfig, TriggerType};

const PRUNE_INTERVAL: Duration = Duration::from_secs(3_600);

pub type CronCallback = Box<dyn Fn() + Send>;

struct CronEntry {
    phase: Phase,
    schedule: CronSchedule,
    callback: CronCallback,
    /// Minute (unix seconds / 60) this entry last fired in
    last_fired: Option<i64>,
}

pub struct CronTable {
    source: Vec<TriggerConfig>,
    entries: Vec<CronEntry>,
}

impl CronTable {
    pub fn empty() -> Self {
        Self { source: Vec::new(), entries: Vec::new() }
    }

    /// Build a table for every `scheduled` trigger. Expressions that fail to
    /// parse are logged and skipped.
    pub fn build<F>(configs: &[TriggerConfig], mut make_callback: F) -> Self
    where
        F: FnMut(Phase) -> CronCallback,
    {
        let mut entries = Vec::new();
        for config in configs {
            if config.trigger_type != TriggerType::Scheduled {
                continue;
            }
            let Some(expr) = config.cron_expr.as_deref() else {
                log::warn!("Scheduled trigger for {} has no cron expression", config.phase);
                continue;
            };
            match CronSchedule::parse(expr) {
                Ok(schedule) => entries.push(CronEntry {
                    phase: config.phase,
                    schedule,
                    callback: make_callback(config.phase),
                    last_fired: None,
                }),
                Err(e) => log::warn!("Ignoring schedule for {}: {}", config.phase, e),
            }
        }
        Self { source: configs.to_vec(), entries }
    }

    /// Whether the table was built from exactly these configs.
    pub fn is_current(&self, configs: &[TriggerConfig]) -> bool {
        self.source == configs
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run the callback of every entry matching `now`, at most once per
    /// minute each. Returns the phases fired.
    pub fn fire_due<Tz: TimeZone>(&mut self, now: &DateTime<Tz>) -> Vec<Phase> {
        let minute = now.timestamp().div_euclid(60);
        let mut fired = Vec::new();
        for entry in &mut self.entries {
            if entry.last_fired == Some(minute) || !entry.schedule.matches(now) {
                continue;
            }
            entry.last_fired = Some(minute);
            log::info!("Cron '{}' fired for {}", entry.schedule, entry.phase);
            (entry.callback)();
            fired.push(entry.phase);
        }
        fired
    }
}

pub struct Scheduler {
    db: Db,
    tracker: Arc<PhaseTracker>,
    batch_size: i64,
    retention_days: i64,
    table: CronTable,
    last_prune: Option<Instant>,
}

impl Scheduler {
    pub fn new(db: Db, tracker: Arc<PhaseTracker>, batch_size: i64, retention_days: i64) -> Self {
        Self {
            db,
            tracker,
            batch_size,
            retention_days,
            table: CronTable::empty(),
            last_prune: None,
        }
    }

    /// Rebuild the table if triggers changed since the last tick.
    pub fn refresh(&mut self) -> Result<bool> {
        let configs = self.tracker.triggers()?;
        if self.table.is_current(&configs) {
            return Ok(false);
        }
        let tracker = Arc::clone(&self.tracker);
        let batch_size = self.batch_size;
        self.table = CronTable::build(&configs, |phase| {
            let tracker = Arc::clone(&tracker);
            Box::new(move || {
                if let Err(e) = tracker.schedule_batch(phase, batch_size) {
                    log::error!("Scheduled batch for {} failed: {}", phase, e);
                }
            })
        });
        log::info!("Cron table rebuilt with {} schedule(s)", self.table.len());
        Ok(true)
    }

    /// One scheduler pass at `now`.
    pub fn tick<Tz: TimeZone>(&mut self, now: &DateTime<Tz>) -> Result<Vec<Phase>> {
        self.refresh()?;
        let fired = self.table.fire_due(now);

        let prune_due = self.last_prune.map_or(true, |t| t.elapsed() >= PRUNE_INTERVAL);
        if prune_due && self.retention_days > 0 {
            let pruned = self.db.with(|conn| schema::prune_job_history(conn, self.retention_days))?;
            if pruned > 0 {
                log::info!("Pruned {} job history row(s) older than {} days", pruned, self.retention_days);
            }
            self.last_prune = Some(Instant::now());
        }
        Ok(fired)
    }

    pub fn spawn(mut self, interval: Duration) -> Result<SchedulerHandle> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let handle = thread::Builder::new().name("scheduler".into()).spawn(move || loop {
            if let Err(e) = self.tick(&Local::now()) {
                log::error!("Scheduler tick failed: {}", e);
            }
            counter.fetch_add(1, Ordering::SeqCst);
            match stop_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => continue,
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        })?;
        Ok(SchedulerHandle { stop_tx, handle, ticks })
    }
}

pub struct SchedulerHandle {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
    ticks: Arc<AtomicUsize>,
}

impl SchedulerHandle {
    pub fn ticks(&self) -> usize {
        self.ticks.load(Ordering::SeqCst)
    }

    /// Lets the current tick finish, then joins.
    pub fn stop(self) {
        let _ = self.stop_tx.send(());
        if self.handle.join().is_err() {
            log::error!("Scheduler thread panicked");
        }
    }
}
