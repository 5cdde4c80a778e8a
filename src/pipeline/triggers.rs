// Phase tracker / trigger engine
//
// Decides which phases get queued for an item: on import, after another
// phase completes, on a cron schedule, or on explicit request. Every path
// goes through `enqueue_phase`, the single admission point.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::db::schema;
use crate::db::Db;
use crate::error::{Result, SiftError};
use crate::jobs::Phase;

use super::cron::CronSchedule;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    OnImport,
    AfterJob,
    Scheduled,
    Manual,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::OnImport => "on_import",
            TriggerType::AfterJob => "after_job",
            TriggerType::Scheduled => "scheduled",
            TriggerType::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "on_import" => Ok(TriggerType::OnImport),
            "after_job" => Ok(TriggerType::AfterJob),
            "scheduled" => Ok(TriggerType::Scheduled),
            "manual" => Ok(TriggerType::Manual),
            other => Err(SiftError::Invalid(format!("unknown trigger type '{}'", other))),
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How one phase gets scheduled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub phase: Phase,
    pub trigger_type: TriggerType,
    /// Set for `after_job` triggers
    pub after_phase: Option<Phase>,
    /// Set for `scheduled` triggers
    pub cron_expr: Option<String>,
}

impl TriggerConfig {
    pub fn on_import(phase: Phase) -> Self {
        Self { phase, trigger_type: TriggerType::OnImport, after_phase: None, cron_expr: None }
    }

    pub fn after(phase: Phase, after: Phase) -> Self {
        Self { phase, trigger_type: TriggerType::AfterJob, after_phase: Some(after), cron_expr: None }
    }

    pub fn scheduled(phase: Phase, cron_expr: &str) -> Self {
        Self {
            phase,
            trigger_type: TriggerType::Scheduled,
            after_phase: None,
            cron_expr: Some(cron_expr.to_string()),
        }
    }

    pub fn manual(phase: Phase) -> Self {
        Self { phase, trigger_type: TriggerType::Manual, after_phase: None, cron_expr: None }
    }

    /// Metadata on import; thumbnail and fingerprint after metadata; sprites
    /// after thumbnail.
    pub fn defaults() -> Vec<TriggerConfig> {
        vec![
            TriggerConfig::on_import(Phase::Metadata),
            TriggerConfig::after(Phase::Thumbnail, Phase::Metadata),
            TriggerConfig::after(Phase::Sprites, Phase::Thumbnail),
            TriggerConfig::after(Phase::Fingerprint, Phase::Metadata),
        ]
    }

    /// Field consistency for the trigger type. Cycles are checked separately.
    pub fn validate(&self) -> Result<()> {
        match self.trigger_type {
            TriggerType::AfterJob => {
                if self.after_phase.is_none() {
                    return Err(SiftError::Invalid(format!(
                        "after_job trigger for {} needs an after phase",
                        self.phase
                    )));
                }
            }
            TriggerType::Scheduled => {
                let expr = self.cron_expr.as_deref().ok_or_else(|| {
                    SiftError::Invalid(format!("scheduled trigger for {} needs a cron expression", self.phase))
                })?;
                CronSchedule::parse(expr)?;
            }
            TriggerType::OnImport | TriggerType::Manual => {}
        }
        if self.trigger_type != TriggerType::AfterJob && self.after_phase.is_some() {
            return Err(SiftError::Invalid(format!(
                "{} trigger for {} cannot name an after phase",
                self.trigger_type, self.phase
            )));
        }
        if self.trigger_type != TriggerType::Scheduled && self.cron_expr.is_some() {
            return Err(SiftError::Invalid(format!(
                "{} trigger for {} cannot carry a cron expression",
                self.trigger_type, self.phase
            )));
        }
        Ok(())
    }
}

/// Find a cycle in the `after_phase -> phase` graph. Returns the path with
/// the first node repeated at the end.
pub fn detect_cycle(configs: &[TriggerConfig]) -> Option<Vec<Phase>> {
    let mut edges: BTreeMap<Phase, Vec<Phase>> = BTreeMap::new();
    for config in configs {
        if config.trigger_type != TriggerType::AfterJob {
            continue;
        }
        if let Some(after) = config.after_phase {
            edges.entry(after).or_default().push(config.phase);
        }
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit(
        node: Phase,
        edges: &BTreeMap<Phase, Vec<Phase>>,
        marks: &mut HashMap<Phase, Mark>,
        stack: &mut Vec<Phase>,
    ) -> Option<Vec<Phase>> {
        marks.insert(node, Mark::Visiting);
        stack.push(node);
        for &next in edges.get(&node).map(Vec::as_slice).unwrap_or(&[]) {
            match marks.get(&next) {
                Some(Mark::Visiting) => {
                    let start = stack.iter().position(|p| *p == next).unwrap_or(0);
                    let mut cycle = stack[start..].to_vec();
                    cycle.push(next);
                    return Some(cycle);
                }
                Some(Mark::Done) => {}
                None => {
                    if let Some(cycle) = visit(next, edges, marks, stack) {
                        return Some(cycle);
                    }
                }
            }
        }
        stack.pop();
        marks.insert(node, Mark::Done);
        None
    }

    let mut marks: HashMap<Phase, Mark> = HashMap::new();
    for &start in edges.keys() {
        if marks.contains_key(&start) {
            continue;
        }
        let mut stack = Vec::new();
        if let Some(cycle) = visit(start, &edges, &mut marks, &mut stack) {
            return Some(cycle);
        }
    }
    None
}

fn format_cycle(cycle: &[Phase]) -> String {
    cycle.iter().map(|p| p.as_str()).collect::<Vec<_>>().join(" -> ")
}

/// Outcome of an admission attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Queued,
    /// A pending or running row already exists for (item, phase)
    AlreadyQueued,
}

/// Admit one phase job for an item, subject to prerequisites.
///
/// Fails with `PrerequisiteNotMet` when the item is trashed, when a
/// non-metadata phase runs before a usable duration is stored, or when
/// fingerprinting is requested with duplicate detection disabled.
pub fn enqueue_phase(conn: &Connection, item_id: i64, phase: Phase) -> Result<Admission> {
    let item = schema::get_item(conn, item_id)?
        .ok_or_else(|| SiftError::NotFound(format!("item {}", item_id)))?;
    if item.trashed_at.is_some() {
        return Err(SiftError::PrerequisiteNotMet(format!("item {} is in the trash", item_id)));
    }
    if phase != Phase::Metadata && (!item.metadata_done || item.duration_secs <= 0.0) {
        return Err(SiftError::PrerequisiteNotMet(format!(
            "{} for item {} needs metadata with a positive duration",
            phase, item_id
        )));
    }
    if phase == Phase::Fingerprint && !schema::get_duplication_config(conn)?.enabled {
        return Err(SiftError::PrerequisiteNotMet("duplicate detection is disabled".to_string()));
    }

    let admission = if schema::enqueue_job(conn, item_id, phase, phase.priority())? {
        schema::refresh_processing_status(conn, item_id)?;
        Admission::Queued
    } else {
        Admission::AlreadyQueued
    };
    log::debug!("Item {} phase {}: {:?}", item_id, phase, admission);
    Ok(admission)
}

/// Queue every `after_job` dependent of `completed`. Dependents whose
/// prerequisites fail are skipped. Returns the phases newly queued.
pub fn schedule_dependents(conn: &Connection, item_id: i64, completed: Phase) -> Result<Vec<Phase>> {
    let mut queued = Vec::new();
    for config in schema::list_trigger_configs(conn)? {
        if config.trigger_type != TriggerType::AfterJob || config.after_phase != Some(completed) {
            continue;
        }
        match enqueue_phase(conn, item_id, config.phase) {
            Ok(Admission::Queued) => queued.push(config.phase),
            Ok(Admission::AlreadyQueued) => {}
            Err(SiftError::PrerequisiteNotMet(why)) => {
                log::debug!("Not scheduling {} for item {}: {}", config.phase, item_id, why);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(queued)
}

pub struct PhaseTracker {
    db: Db,
}

impl PhaseTracker {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn triggers(&self) -> Result<Vec<TriggerConfig>> {
        self.db.with(|conn| schema::list_trigger_configs(conn))
    }

    /// Validate and store a trigger. Rejects updates that would close a cycle.
    pub fn update_trigger(&self, config: TriggerConfig) -> Result<()> {
        config.validate()?;
        self.db.with(|conn| {
            let tx = conn.transaction()?;
            let mut configs: Vec<TriggerConfig> = schema::list_trigger_configs(&tx)?
                .into_iter()
                .filter(|c| c.phase != config.phase)
                .collect();
            configs.push(config.clone());
            if let Some(cycle) = detect_cycle(&configs) {
                return Err(SiftError::CycleDetected(format_cycle(&cycle)));
            }
            schema::upsert_trigger_config(&tx, &config)?;
            tx.commit()?;
            log::info!("Trigger for {} set to {}", config.phase, config.trigger_type);
            Ok(())
        })
    }

    /// Queue the `on_import` phases for a new item.
    pub fn on_import(&self, item_id: i64) -> Result<Vec<Phase>> {
        self.db.with(|conn| {
            let mut queued = Vec::new();
            for config in schema::list_trigger_configs(conn)? {
                if config.trigger_type != TriggerType::OnImport {
                    continue;
                }
                match enqueue_phase(conn, item_id, config.phase) {
                    Ok(Admission::Queued) => queued.push(config.phase),
                    Ok(Admission::AlreadyQueued) => {}
                    Err(SiftError::PrerequisiteNotMet(why)) => {
                        log::debug!("Not queuing {} on import of item {}: {}", config.phase, item_id, why);
                    }
                    Err(e) => return Err(e),
                }
            }
            Ok(queued)
        })
    }

    /// Explicit request (manual triggers, reprocess). Errors reach the caller.
    pub fn request(&self, item_id: i64, phase: Phase) -> Result<Admission> {
        self.db.with(|conn| enqueue_phase(conn, item_id, phase))
    }

    pub fn on_completed(&self, item_id: i64, phase: Phase) -> Result<Vec<Phase>> {
        self.db.with(|conn| schedule_dependents(conn, item_id, phase))
    }

    /// Whether `phase` could be admitted for the item right now.
    pub fn is_eligible(&self, item_id: i64, phase: Phase) -> Result<bool> {
        self.db.with(|conn| {
            let Some(item) = schema::get_item(conn, item_id)? else {
                return Ok(false);
            };
            if item.trashed_at.is_some() || schema::queue_depth(conn, item_id, phase)? > 0 {
                return Ok(false);
            }
            if phase != Phase::Metadata && (!item.metadata_done || item.duration_secs <= 0.0) {
                return Ok(false);
            }
            if phase == Phase::Fingerprint {
                return Ok(schema::get_duplication_config(conn)?.enabled);
            }
            Ok(true)
        })
    }

    /// Queue up to `limit` items that still need `phase`. Returns how many
    /// were queued.
    pub fn schedule_batch(&self, phase: Phase, limit: i64) -> Result<usize> {
        self.db.with(|conn| {
            if phase == Phase::Fingerprint && !schema::get_duplication_config(conn)?.enabled {
                return Ok(0);
            }
            let mut queued = 0;
            for item_id in schema::items_needing_phase(conn, phase, limit)? {
                match enqueue_phase(conn, item_id, phase) {
                    Ok(Admission::Queued) => queued += 1,
                    Ok(Admission::AlreadyQueued) => {}
                    Err(SiftError::PrerequisiteNotMet(_)) => {}
                    Err(e) => return Err(e),
                }
            }
            if queued > 0 {
                log::info!("Scheduled {} item(s) for {}", queued, phase);
            }
            Ok(queued)
        })
    }
}
