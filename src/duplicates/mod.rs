// Duplicate detection service
// Finds matches for a freshly fingerprinted item, indexes it, and folds the
// results into duplicate groups. Also owns resolve/dismiss and the group
// bookkeeping needed when an item is permanently deleted.


use std::collections::BTreeMap;
use std::sync::Arc;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::db::schema::{self, DuplicationConfig, Item};
use crate::db::Db;
use crate::error::{Result, SiftError};
use crate::index::FingerprintIndex;
use crate::matching::{self, audio, visual, MatchResult};

pub const GROUP_UNRESOLVED: &str = "unresolved";
pub const GROUP_RESOLVED: &str = "resolved";
pub const GROUP_DISMISSED: &str = "dismissed";

/// Quality score used to pick the variant to keep:
/// `duration * 1000 + width * height + codec bonus + bit_rate / 1000`.
pub fn score_scene(item: &Item, codec_bonus: &BTreeMap<String, i64>) -> f64 {
    let pixels = item.width.unwrap_or(0) * item.height.unwrap_or(0);
    let bonus = item
        .video_codec
        .as_deref()
        .map(|c| c.to_ascii_lowercase())
        .and_then(|c| codec_bonus.get(&c).copied())
        .unwrap_or(0);
    let bit_rate = item.bit_rate.unwrap_or(0);

    item.duration_secs * 1000.0 + pixels as f64 + bonus as f64 + bit_rate as f64 / 1000.0
}

/// Highest score wins, lowest id on ties.
pub fn pick_best(items: &[Item], codec_bonus: &BTreeMap<String, i64>) -> Option<i64> {
    let mut best: Option<(f64, i64)> = None;
    for item in items {
        let score = score_scene(item, codec_bonus);
        best = match best {
            Some((s, id)) if s > score || (s == score && id < item.id) => Some((s, id)),
            _ => Some((score, item.id)),
        };
    }
    best.map(|(_, id)| id)
}

/// A group with its members, for listings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupDetail {
    pub group: schema::DuplicateGroup,
    pub members: Vec<schema::GroupMember>,
}

pub struct DuplicateService {
    db: Db,
    index: Arc<dyn FingerprintIndex>,
}

impl DuplicateService {
    pub fn new(db: Db, index: Arc<dyn FingerprintIndex>) -> Self {
        Self { db, index }
    }

    pub fn index(&self) -> &Arc<dyn FingerprintIndex> {
        &self.index
    }

    /// Match then index each fingerprint type the item carries, and fold the
    /// merged matches into a group. Returns the group touched, if any.
    ///
    /// Lookups for a type always happen before that type is inserted, so an
    /// item never matches itself. Inserts replace the item's earlier rows,
    /// so a failed call can be repeated as a whole.
    pub fn process_item_fingerprints(
        &self,
        item_id: i64,
        audio_fp: Option<&[i32]>,
        visual_fp: Option<&[u64]>,
    ) -> Result<Option<i64>> {
        let config = self.db.with(|conn| schema::get_duplication_config(conn))?;
        if !config.enabled {
            log::debug!("Duplicate detection disabled, skipping item {}", item_id);
            return Ok(None);
        }

        let mut found: Vec<MatchResult> = Vec::new();
        if let Some(fp) = audio_fp.filter(|fp| !fp.is_empty()) {
            found.extend(audio::find_audio_matches(self.index.as_ref(), item_id, fp, &config)?);
            self.index.insert_audio_fingerprints(item_id, fp)?;
        }
        if let Some(fp) = visual_fp.filter(|fp| !fp.is_empty()) {
            found.extend(visual::find_visual_matches(self.index.as_ref(), item_id, fp, &config)?);
            self.index.insert_visual_fingerprints(item_id, fp)?;
        }

        let merged = matching::merge_matches(found);
        if merged.is_empty() {
            return Ok(None);
        }
        log::info!("Item {} matched {} candidate(s)", item_id, merged.len());
        self.process_matches(item_id, &merged, &config)
    }

    /// Fold one item's matches into the group store in a single transaction.
    ///
    /// Touched items are the query plus every live candidate. No open group
    /// among them creates one; several are merged into the lowest id.
    pub fn process_matches(
        &self,
        item_id: i64,
        matches: &[MatchResult],
        config: &DuplicationConfig,
    ) -> Result<Option<i64>> {
        self.db.with(|conn| {
            let tx = conn.transaction()?;

            match schema::get_item(&tx, item_id)? {
                Some(item) if item.trashed_at.is_none() => {}
                _ => {
                    log::debug!("Item {} is gone or trashed, dropping its matches", item_id);
                    return Ok(None);
                }
            }

            let mut live: Vec<&MatchResult> = Vec::with_capacity(matches.len());
            for m in matches {
                if m.candidate == item_id {
                    continue;
                }
                if let Some(candidate) = schema::get_item(&tx, m.candidate)? {
                    if candidate.trashed_at.is_none() {
                        live.push(m);
                    }
                }
            }
            let Some(strongest) = live
                .iter()
                .copied()
                .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
            else {
                return Ok(None);
            };

            let mut touched: Vec<i64> = live.iter().map(|m| m.candidate).collect();
            touched.push(item_id);

            let open = schema::open_groups_for_items(&tx, &touched)?;
            let target = match open.split_first() {
                None => {
                    let id = schema::create_group(&tx)?;
                    log::info!("Created duplicate group {} for item {}", id, item_id);
                    id
                }
                Some((&lowest, rest)) => {
                    for &absorbed in rest {
                        let moved = schema::move_group_members(&tx, absorbed, lowest)?;
                        schema::delete_group(&tx, absorbed)?;
                        log::info!(
                            "Merged duplicate group {} into {} ({} members moved)",
                            absorbed,
                            lowest,
                            moved
                        );
                    }
                    lowest
                }
            };

            schema::upsert_group_member(
                &tx,
                target,
                item_id,
                strongest.confidence,
                strongest.match_type.as_str(),
            )?;
            for m in &live {
                schema::upsert_group_member(&tx, target, m.candidate, m.confidence, m.match_type.as_str())?;
            }
            recompute_group(&tx, target, &config.codec_bonus)?;

            tx.commit()?;
            Ok(Some(target))
        })
    }

    /// Keep `best_item_id`, trash the other members and close the group.
    pub fn resolve_group(&self, group_id: i64, best_item_id: i64, merge_metadata: bool) -> Result<()> {
        self.db.with(|conn| {
            let tx = conn.transaction()?;
            let group = require_unresolved(&tx, group_id)?;
            let members = schema::get_group_members(&tx, group.id)?;
            if !members.iter().any(|m| m.item_id == best_item_id) {
                return Err(SiftError::Invalid(format!(
                    "item {} is not a member of group {}",
                    best_item_id, group_id
                )));
            }

            let others: Vec<i64> = members
                .iter()
                .map(|m| m.item_id)
                .filter(|id| *id != best_item_id)
                .collect();
            if merge_metadata {
                schema::merge_metadata_into(&tx, best_item_id, &others)?;
            }
            schema::set_group_summary(&tx, group_id, members.len() as i64, Some(best_item_id))?;
            for id in &others {
                schema::trash_item(&tx, *id)?;
            }
            schema::close_group(&tx, group_id, GROUP_RESOLVED)?;
            tx.commit()?;

            log::info!(
                "Resolved duplicate group {}: kept item {}, trashed {}",
                group_id,
                best_item_id,
                others.len()
            );
            Ok(())
        })
    }

    /// Close the group without touching its items.
    pub fn dismiss_group(&self, group_id: i64) -> Result<()> {
        self.db.with(|conn| {
            let tx = conn.transaction()?;
            require_unresolved(&tx, group_id)?;
            schema::close_group(&tx, group_id, GROUP_DISMISSED)?;
            tx.commit()?;
            log::info!("Dismissed duplicate group {}", group_id);
            Ok(())
        })
    }

    pub fn list_groups(&self, status: Option<&str>, limit: i64) -> Result<Vec<GroupDetail>> {
        self.db.with(|conn| {
            let groups = schema::list_groups(conn, status, limit)?;
            let mut out = Vec::with_capacity(groups.len());
            for group in groups {
                let members = schema::get_group_members(conn, group.id)?;
                out.push(GroupDetail { group, members });
            }
            Ok(out)
        })
    }

    /// Permanently delete an item: index rows, group membership, queue rows
    /// and the item itself.
    pub fn delete_item(&self, item_id: i64) -> Result<bool> {
        self.index.delete_item_fingerprints(item_id)?;
        self.db.with(|conn| {
            let config = schema::get_duplication_config(conn)?;
            let tx = conn.transaction()?;
            detach_item_from_groups(&tx, item_id, &config.codec_bonus)?;
            schema::delete_queue_rows_for_item(&tx, item_id)?;
            let deleted = schema::delete_item_row(&tx, item_id)?;
            tx.commit()?;
            Ok(deleted)
        })
    }
}

fn require_unresolved(conn: &Connection, group_id: i64) -> Result<schema::DuplicateGroup> {
    let group = schema::get_group(conn, group_id)?
        .ok_or_else(|| SiftError::NotFound(format!("duplicate group {}", group_id)))?;
    if group.status != GROUP_UNRESOLVED {
        return Err(SiftError::Invalid(format!(
            "duplicate group {} is already {}",
            group_id, group.status
        )));
    }
    Ok(group)
}

/// Recount members and re-pick the best variant.
pub fn recompute_group(conn: &Connection, group_id: i64, codec_bonus: &BTreeMap<String, i64>) -> Result<()> {
    let members = schema::get_group_members(conn, group_id)?;
    let mut items = Vec::with_capacity(members.len());
    for m in &members {
        if let Some(item) = schema::get_item(conn, m.item_id)? {
            items.push(item);
        }
    }
    let best = pick_best(&items, codec_bonus);
    schema::set_group_summary(conn, group_id, members.len() as i64, best)
}

/// Remove an item from every group it belongs to.
///
/// An unresolved group left with fewer than two members is deleted. Closed
/// groups keep their history and only lose the member.
pub fn detach_item_from_groups(conn: &Connection, item_id: i64, codec_bonus: &BTreeMap<String, i64>) -> Result<()> {
    for group_id in schema::groups_for_item(conn, item_id)? {
        schema::remove_group_member(conn, group_id, item_id)?;
        let Some(group) = schema::get_group(conn, group_id)? else {
            continue;
        };
        let remaining = schema::get_group_members(conn, group_id)?;

        if group.status == GROUP_UNRESOLVED {
            if remaining.len() < 2 {
                schema::delete_group(conn, group_id)?;
                log::info!("Dropped duplicate group {} after removing item {}", group_id, item_id);
            } else {
                recompute_group(conn, group_id, codec_bonus)?;
            }
        } else {
            let best = group.best_item_id.filter(|id| *id != item_id);
            schema::set_group_summary(conn, group_id, remaining.len() as i64, best)?;
        }
    }
    Ok(())
}
