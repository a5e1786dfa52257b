//! Repairs a subtree after its root changed status.
//!
//! Children outside `allowed_child_statuses(parent)` are pushed to the most
//! conservative legal status. Corrections cascade: each child is judged
//! against its parent's already-corrected status, never the trigger status.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::DomainResult;
use crate::hierarchy::{EntityKind, EntityRecord};
use crate::policy;
use crate::ports::store::HierarchyTx;
use crate::status::Status;

const TARGET_PRIORITY: [Status; 4] = [
    Status::Archived,
    Status::Inactive,
    Status::Draft,
    Status::Published,
];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ImpactOptions {
    pub dry_run: bool,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StatusImpactResult {
    pub updated_count: u64,
    pub affected_ids: Vec<String>,
    pub target_status: Option<Status>,
    pub reason: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cascaded_levels: Vec<CascadeLevelResult>,
}

impl StatusImpactResult {
    fn unchanged(reason: impl Into<String>) -> Self {
        Self {
            updated_count: 0,
            affected_ids: Vec::new(),
            target_status: None,
            reason: reason.into(),
            cascaded_levels: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CascadeLevelResult {
    pub level: u32,
    pub entity_type: EntityKind,
    pub updated_count: u64,
    pub affected_ids: Vec<String>,
    pub target_status: Option<Status>,
}

/// One hierarchy level below the trigger entity, pre-fetched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CascadeLevel {
    pub kind: EntityKind,
    pub children: Vec<EntityRecord>,
}

/// Least "live" status still legal under `parent`.
pub fn determine_target_status(parent: Status) -> Option<Status> {
    let allowed = policy::allowed_child_statuses(parent);
    TARGET_PRIORITY
        .into_iter()
        .find(|status| allowed.contains(status))
        .or_else(|| allowed.first().copied())
}

#[derive(Clone, Copy, Debug, Default)]
pub struct StatusImpactEngine;

impl StatusImpactEngine {
    pub fn new() -> Self {
        Self
    }

    /// Corrects direct children only. `children` must be the persisted
    /// state read inside `tx`.
    pub async fn auto_fix_single_level(
        &self,
        tx: &mut dyn HierarchyTx,
        kind: EntityKind,
        children: &[EntityRecord],
        new_parent_status: Status,
        options: ImpactOptions,
    ) -> DomainResult<StatusImpactResult> {
        if children.is_empty() {
            return Ok(StatusImpactResult::unchanged("No children to update"));
        }

        let affected_ids: Vec<String> = children
            .iter()
            .filter(|child| !policy::is_child_status_allowed(new_parent_status, child.status))
            .map(|child| child.id.clone())
            .collect();
        if affected_ids.is_empty() {
            return Ok(StatusImpactResult::unchanged(
                "All children already have allowed statuses",
            ));
        }

        let Some(target) = determine_target_status(new_parent_status) else {
            tracing::warn!(
                entity_type = %kind,
                parent_status = %new_parent_status,
                children = affected_ids.len(),
                "could not determine target status"
            );
            return Ok(StatusImpactResult::unchanged(
                "Could not determine appropriate target status",
            ));
        };

        if options.dry_run {
            tracing::info!(
                entity_type = %kind,
                target_status = %target,
                would_update = affected_ids.len(),
                "dry run; no children updated"
            );
            return Ok(StatusImpactResult {
                updated_count: 0,
                affected_ids,
                target_status: Some(target),
                reason: "Dry run mode - no actual updates performed".to_string(),
                cascaded_levels: Vec::new(),
            });
        }

        let written = tx.bulk_update_status(kind, &affected_ids, target).await?;
        if written != affected_ids.len() as u64 {
            tracing::warn!(
                entity_type = %kind,
                expected = affected_ids.len(),
                written,
                "bulk status update touched fewer rows than requested"
            );
        }
        let updated_count = affected_ids.len() as u64;
        tracing::debug!(
            entity_type = %kind,
            parent_status = %new_parent_status,
            target_status = %target,
            updated_count,
            "children corrected"
        );

        Ok(StatusImpactResult {
            updated_count,
            affected_ids,
            target_status: Some(target),
            reason: format!("Updated {updated_count} children to {}", target.as_str()),
            cascaded_levels: Vec::new(),
        })
    }

    /// Walks `levels` (children, grandchildren, ...) in order. A child's
    /// effective parent status is its parent's status after correction.
    pub async fn auto_fix_multi_level(
        &self,
        tx: &mut dyn HierarchyTx,
        root_status: Status,
        levels: &[CascadeLevel],
        options: ImpactOptions,
    ) -> DomainResult<StatusImpactResult> {
        if levels.is_empty() {
            return Ok(StatusImpactResult::unchanged("No cascade levels defined"));
        }

        let mut cascaded_levels = Vec::with_capacity(levels.len());
        let mut updated_count = 0u64;
        let mut all_affected = Vec::new();
        let mut effective: HashMap<String, Status> = HashMap::new();
        let mut fallback_status = root_status;

        for (idx, level) in levels.iter().enumerate() {
            let level_number = idx as u32 + 1;
            let mut groups: BTreeMap<Status, Vec<EntityRecord>> = BTreeMap::new();
            for child in &level.children {
                let parent_status = if idx == 0 {
                    root_status
                } else {
                    child
                        .parent_id
                        .as_ref()
                        .and_then(|parent_id| effective.get(parent_id))
                        .copied()
                        .unwrap_or(fallback_status)
                };
                groups.entry(parent_status).or_default().push(child.clone());
            }

            let mut next_effective = HashMap::with_capacity(level.children.len());
            let mut level_result = CascadeLevelResult {
                level: level_number,
                entity_type: level.kind,
                updated_count: 0,
                affected_ids: Vec::new(),
                target_status: None,
            };

            for (parent_status, children) in groups {
                let fix = self
                    .auto_fix_single_level(tx, level.kind, &children, parent_status, options)
                    .await?;
                for child in &children {
                    let status = match fix.target_status {
                        Some(target) if fix.affected_ids.contains(&child.id) => target,
                        _ => child.status,
                    };
                    next_effective.insert(child.id.clone(), status);
                }
                if level_result.target_status.is_none() {
                    level_result.target_status = fix.target_status;
                }
                level_result.updated_count += fix.updated_count;
                level_result.affected_ids.extend(fix.affected_ids);
            }

            if let Some(target) = level_result.target_status {
                fallback_status = target;
            }
            updated_count += level_result.updated_count;
            all_affected.extend(level_result.affected_ids.iter().cloned());
            effective = next_effective;
            cascaded_levels.push(level_result);
        }

        let summary = cascaded_levels
            .iter()
            .map(|level| {
                format!(
                    "L{}({}): {} -> {}",
                    level.level,
                    level.entity_type,
                    level.updated_count,
                    level.target_status.map(|s| s.as_str()).unwrap_or("none")
                )
            })
            .collect::<Vec<_>>()
            .join(", ");
        tracing::info!(
            updated_count,
            levels = cascaded_levels.len(),
            summary = %summary,
            "multi-level cascade applied"
        );

        Ok(StatusImpactResult {
            updated_count,
            affected_ids: all_affected,
            target_status: cascaded_levels.first().and_then(|level| level.target_status),
            reason: format!("Cascaded {} levels: {summary}", levels.len()),
            cascaded_levels,
        })
    }

    /// Loads every level below `root` inside `tx`, starting from its
    /// already-loaded direct children. Stops at the first empty level.
    pub async fn load_subtree(
        &self,
        tx: &mut dyn HierarchyTx,
        root_kind: EntityKind,
        direct_children: Vec<EntityRecord>,
    ) -> DomainResult<Vec<CascadeLevel>> {
        let mut levels = Vec::new();
        let Some(mut kind) = root_kind.child() else {
            return Ok(levels);
        };
        let mut children = direct_children;
        loop {
            if children.is_empty() {
                break;
            }
            let ids: Vec<String> = children.iter().map(|child| child.id.clone()).collect();
            levels.push(CascadeLevel {
                kind,
                children: std::mem::take(&mut children),
            });
            let Some(next_kind) = kind.child() else {
                break;
            };
            children = tx.find_children(kind, &ids).await?;
            kind = next_kind;
        }
        Ok(levels)
    }
}
