//! Status rule tables for the content hierarchy.
//!
//! Every legality question about statuses is answered here. Callers never
//! re-encode a rule; they ask one of these functions.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::status::{Action, Status};

/// `Ok(())` when allowed, otherwise the human readable reason.
pub type Verdict = Result<(), String>;

const DRAFT_ONLY: &[Status] = &[Status::Draft];
const EVERY_STATUS: &[Status] = &[
    Status::Draft,
    Status::Published,
    Status::Inactive,
    Status::Archived,
];
const INACTIVE_OR_ARCHIVED: &[Status] = &[Status::Inactive, Status::Archived];
const ARCHIVED_ONLY: &[Status] = &[Status::Archived];
const PUBLISHED_ONLY: &[Status] = &[Status::Published];

pub fn allowed_transitions(from: Status) -> &'static [Status] {
    match from {
        Status::Draft => PUBLISHED_ONLY,
        Status::Published => INACTIVE_OR_ARCHIVED,
        Status::Inactive => &[Status::Published, Status::Archived],
        Status::Archived => PUBLISHED_ONLY,
    }
}

pub fn is_transition_allowed(from: Status, to: Status) -> bool {
    allowed_transitions(from).contains(&to)
}

pub fn allowed_child_statuses(parent: Status) -> &'static [Status] {
    match parent {
        Status::Draft => DRAFT_ONLY,
        Status::Published => EVERY_STATUS,
        Status::Inactive => INACTIVE_OR_ARCHIVED,
        Status::Archived => ARCHIVED_ONLY,
    }
}

pub fn is_child_status_allowed(parent: Status, child: Status) -> bool {
    allowed_child_statuses(parent).contains(&child)
}

pub fn allowed_actions(status: Status) -> &'static [Action] {
    match status {
        Status::Draft | Status::Published => &[
            Action::Create,
            Action::Update,
            Action::Delete,
            Action::Reorder,
        ],
        Status::Inactive => &[Action::Update, Action::Delete, Action::Restore],
        Status::Archived => &[Action::Restore],
    }
}

/// Whether `action` may be applied to a child in `child` status below a
/// parent in `parent` status. Only update, delete and restore are keyed by
/// the pair; the other actions are decided by [`can_perform_action`].
pub fn child_action_allowed(action: Action, parent: Status, child: Status) -> bool {
    use Status::*;
    match action {
        Action::Update => matches!(
            (parent, child),
            (Draft, Draft)
                | (Published, Draft)
                | (Published, Published)
                | (Published, Inactive)
                | (Inactive, Inactive)
        ),
        Action::Delete | Action::Restore => matches!(
            (parent, child),
            (Draft, Draft) | (Published, Draft) | (Published, Inactive) | (Published, Archived)
        ),
        Action::Create | Action::Reorder => allowed_actions(parent).contains(&action),
    }
}

pub fn validate_action_on_status(status: Status, action: Action, entity_name: &str) -> Verdict {
    if allowed_actions(status).contains(&action) {
        return Ok(());
    }
    let entity = entity_name.to_lowercase();
    let reason = match (status, action) {
        (Status::Archived, Action::Create) => {
            format!("Cannot create child entities in archived {entity}")
        }
        (Status::Archived, Action::Update) => {
            format!("Cannot update archived {entity}. Restore it first.")
        }
        (Status::Archived, Action::Delete) => {
            format!("Cannot delete archived {entity}. It's already archived.")
        }
        (Status::Archived, Action::Reorder) => format!("Cannot reorder archived {entity}"),
        (Status::Inactive, Action::Create) => {
            format!("Cannot create child entities in inactive {entity}. Reactivate it first.")
        }
        (Status::Inactive, Action::Reorder) => {
            format!("Cannot reorder inactive {entity}. Reactivate it first.")
        }
        _ => format!("Cannot {action} {entity} with status {}", status.upper()),
    };
    Err(reason)
}

/// Checks an action against the parent's status and, for actions on an
/// existing child, the parent/child rule matrices.
pub fn can_perform_action(
    parent: Status,
    child: Option<Status>,
    action: Action,
    entity_name: &str,
    parent_name: &str,
) -> Verdict {
    let entity = entity_name.to_lowercase();
    let parent_label = parent_name.to_lowercase();
    match action {
        Action::Create => {
            validate_action_on_status(parent, Action::Create, parent_name)?;
            if parent == Status::Archived {
                return Err(format!("Cannot create {entity} in archived {parent_label}"));
            }
            Ok(())
        }
        Action::Reorder => validate_action_on_status(parent, Action::Reorder, parent_name),
        Action::Update | Action::Delete | Action::Restore => {
            let Some(child) = child else {
                return Err(format!(
                    "{entity_name} status is required for {action} action"
                ));
            };
            if child_action_allowed(action, parent, child) {
                return Ok(());
            }
            let child_label = child.as_str();
            let parent_status = parent.as_str();
            Err(match action {
                Action::Update => format!(
                    "Cannot update {child_label} {entity} in {parent_status} {parent_label}"
                ),
                Action::Delete => format!(
                    "Cannot delete {child_label} {entity} from {parent_status} {parent_label}"
                ),
                _ => format!(
                    "Cannot restore {child_label} {entity} to {parent_status} {parent_label}"
                ),
            })
        }
    }
}

/// Rejection reason for a transition outside [`allowed_transitions`], or
/// `None` when the move is legal (equal statuses are always legal).
pub fn transition_rejection(current: Status, target: Status, entity_name: &str) -> Option<String> {
    if current == target || is_transition_allowed(current, target) {
        return None;
    }
    let lower = entity_name.to_lowercase();
    let reason = match (current, target) {
        (Status::Published, Status::Draft) => format!(
            "{entity_name} cannot be reverted to DRAFT once published. Use INACTIVE to temporarily hide it."
        ),
        (Status::Inactive, Status::Draft) => format!(
            "{entity_name} cannot be reverted to DRAFT. Use PUBLISHED to reactivate it."
        ),
        (Status::Archived, Status::Draft) => {
            format!("Archived {lower} cannot be reverted to DRAFT.")
        }
        (Status::Archived, Status::Inactive) => {
            format!("Archived {lower} can only be republished, not set to INACTIVE.")
        }
        (Status::Draft, Status::Inactive) => {
            format!("{entity_name} must be published before it can be set to INACTIVE.")
        }
        (Status::Draft, Status::Archived) => {
            format!("{entity_name} must be published before it can be archived.")
        }
        _ => format!(
            "Cannot change {lower} status from {} to {}",
            current.upper(),
            target.upper()
        ),
    };
    Some(reason)
}

/// A child "more advanced" than its parent is never valid.
pub fn check_parent_child_consistency(
    parent: Status,
    child: Status,
    entity_name: &str,
    parent_name: &str,
) -> Verdict {
    if parent == Status::Draft && child != Status::Draft {
        return Err(format!(
            "Invalid state: {} {} cannot exist in DRAFT {}",
            child.upper(),
            entity_name.to_lowercase(),
            parent_name.to_lowercase()
        ));
    }
    Ok(())
}

/// Transition check that also accounts for the parent's current status.
pub fn validate_transition_with_parent(
    current: Status,
    target: Status,
    parent: Status,
    entity_name: &str,
    parent_name: &str,
) -> Verdict {
    if current == target {
        return Ok(());
    }
    if let Some(reason) = transition_rejection(current, target, entity_name) {
        return Err(reason);
    }
    check_parent_child_consistency(parent, target, entity_name, parent_name)?;

    let entity = entity_name.to_lowercase();
    let parent_label = parent_name.to_lowercase();
    match (target, parent) {
        (Status::Published, Status::Draft) => Err(format!(
            "Cannot publish {entity} while {parent_label} is still in DRAFT. Publish the {parent_label} first."
        )),
        (Status::Published, Status::Inactive) => Err(format!(
            "Cannot publish {entity} while {parent_label} is INACTIVE. Reactivate the {parent_label} first."
        )),
        (Status::Published, Status::Archived) => Err(format!(
            "Cannot publish {entity} while {parent_label} is ARCHIVED. Restore the {parent_label} first."
        )),
        (Status::Inactive, Status::Draft) => Err(format!(
            "Cannot set {entity} to INACTIVE in DRAFT {parent_label}. Invalid state combination."
        )),
        (Status::Inactive, Status::Archived) => Err(format!(
            "Cannot set {entity} to INACTIVE while {parent_label} is ARCHIVED."
        )),
        (Status::Archived, Status::Draft) => Err(format!(
            "Cannot archive {entity} in DRAFT {parent_label}. Invalid state combination."
        )),
        _ => Ok(()),
    }
}

/// One rule applied to children when a parent moves to a given status.
#[derive(Clone, Copy, Debug)]
pub struct ParentChangeRule {
    pub disallowed: Status,
    reason: fn(&str, &str) -> String,
}

impl ParentChangeRule {
    pub fn reason(&self, parent_name: &str, child_name: &str) -> String {
        (self.reason)(parent_name, child_name)
    }
}

const DRAFT_PARENT_RULES: &[ParentChangeRule] = &[
    ParentChangeRule {
        disallowed: Status::Published,
        reason: |p, c| {
            format!(
                "Cannot set {p} to DRAFT while having PUBLISHED {c}(s). Children cannot be \"more advanced\" than parent."
            )
        },
    },
    ParentChangeRule {
        disallowed: Status::Inactive,
        reason: |p, c| {
            format!("Cannot set {p} to DRAFT while having INACTIVE {c}(s). Invalid state combination.")
        },
    },
    ParentChangeRule {
        disallowed: Status::Archived,
        reason: |p, c| {
            format!("Cannot set {p} to DRAFT while having ARCHIVED {c}(s). Invalid state combination.")
        },
    },
];

/// Rules keyed by the parent's target status.
pub fn parent_change_rules(target: Status) -> &'static [ParentChangeRule] {
    match target {
        Status::Draft => DRAFT_PARENT_RULES,
        Status::Published | Status::Inactive | Status::Archived => &[],
    }
}

/// Counts per status rendered as `2 PUBLISHED, 1 INACTIVE`, in status order.
pub fn status_summary(statuses: impl IntoIterator<Item = Status>) -> String {
    let mut counts: BTreeMap<Status, usize> = BTreeMap::new();
    for status in statuses {
        *counts.entry(status).or_default() += 1;
    }
    counts
        .into_iter()
        .map(|(status, count)| format!("{count} {}", status.upper()))
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct ImpactAnalysis {
    pub will_make_inaccessible: bool,
    pub affected: Vec<Status>,
    pub recommendation: String,
}

pub fn analyze_impact(
    new_parent_status: Status,
    child_statuses: &[Status],
    parent_name: &str,
    child_name: &str,
) -> ImpactAnalysis {
    let affected: Vec<Status> = child_statuses
        .iter()
        .copied()
        .filter(|status| !is_child_status_allowed(new_parent_status, *status))
        .collect();

    if affected.is_empty() {
        return ImpactAnalysis {
            will_make_inaccessible: false,
            affected,
            recommendation: format!(
                "Safe to change {} to {}.",
                parent_name.to_lowercase(),
                new_parent_status.upper()
            ),
        };
    }

    let summary = status_summary(affected.iter().copied());
    let recommendation = match new_parent_status {
        Status::Inactive => format!(
            "Deactivate {summary} {child_name} first, or they will become inaccessible to users."
        ),
        Status::Archived => {
            format!("Archive {summary} {child_name} first to maintain clean state.")
        }
        Status::Draft => format!(
            "Cannot revert to DRAFT with {summary} {child_name}. This would create invalid state."
        ),
        Status::Published => String::new(),
    };

    ImpactAnalysis {
        will_make_inaccessible: true,
        affected,
        recommendation,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draft_is_a_one_way_gate() {
        for from in [Status::Published, Status::Inactive, Status::Archived] {
            assert!(!is_transition_allowed(from, Status::Draft));
        }
        assert!(is_transition_allowed(Status::Draft, Status::Published));
    }

    #[test]
    fn every_illegal_transition_has_a_reason() {
        for from in Status::ALL {
            for to in Status::ALL {
                let rejection = transition_rejection(from, to, "Course");
                let legal = from == to || allowed_transitions(from).contains(&to);
                assert_eq!(rejection.is_none(), legal, "{from} -> {to}");
                if let Some(reason) = rejection {
                    assert!(!reason.is_empty());
                }
            }
        }
    }

    #[test]
    fn transition_reasons_are_specific() {
        assert_eq!(
            transition_rejection(Status::Published, Status::Draft, "Course").as_deref(),
            Some(
                "Course cannot be reverted to DRAFT once published. Use INACTIVE to temporarily hide it."
            )
        );
        assert_eq!(
            transition_rejection(Status::Archived, Status::Inactive, "Chapter").as_deref(),
            Some("Archived chapter can only be republished, not set to INACTIVE.")
        );
    }

    #[test]
    fn archived_only_permits_restore() {
        assert_eq!(allowed_actions(Status::Archived), &[Action::Restore]);
        assert!(!allowed_actions(Status::Inactive).contains(&Action::Create));
        let err = validate_action_on_status(Status::Inactive, Action::Create, "Course")
            .expect_err("inactive blocks create");
        assert_eq!(
            err,
            "Cannot create child entities in inactive course. Reactivate it first."
        );
    }

    #[test]
    fn child_never_more_advanced_than_draft_parent() {
        assert!(check_parent_child_consistency(Status::Draft, Status::Draft, "Lesson", "Chapter").is_ok());
        let err =
            check_parent_child_consistency(Status::Draft, Status::Published, "Lesson", "Chapter")
                .expect_err("published under draft");
        assert!(err.contains("PUBLISHED lesson cannot exist in DRAFT chapter"));
    }

    #[test]
    fn child_action_matrices_follow_parent_status() {
        assert!(child_action_allowed(Action::Update, Status::Published, Status::Inactive));
        assert!(!child_action_allowed(Action::Update, Status::Published, Status::Archived));
        assert!(!child_action_allowed(Action::Delete, Status::Published, Status::Published));
        assert!(child_action_allowed(Action::Restore, Status::Published, Status::Archived));
        assert!(!child_action_allowed(Action::Update, Status::Archived, Status::Archived));

        let err = can_perform_action(Status::Archived, None, Action::Create, "Lesson", "Chapter")
            .expect_err("archived parent");
        assert_eq!(err, "Cannot create child entities in archived chapter");
        let err = can_perform_action(Status::Published, None, Action::Update, "Lesson", "Chapter")
            .expect_err("missing child status");
        assert_eq!(err, "Lesson status is required for update action");
    }

    #[test]
    fn publishing_requires_published_parent() {
        let err = validate_transition_with_parent(
            Status::Draft,
            Status::Published,
            Status::Inactive,
            "Course",
            "Category",
        )
        .expect_err("inactive parent");
        assert_eq!(
            err,
            "Cannot publish course while category is INACTIVE. Reactivate the category first."
        );
        assert!(
            validate_transition_with_parent(
                Status::Published,
                Status::Archived,
                Status::Inactive,
                "Course",
                "Category"
            )
            .is_ok()
        );
    }

    #[test]
    fn parent_change_rules_only_restrict_draft() {
        assert_eq!(parent_change_rules(Status::Draft).len(), 3);
        for status in [Status::Published, Status::Inactive, Status::Archived] {
            assert!(parent_change_rules(status).is_empty());
        }
    }

    #[test]
    fn impact_analysis_recommends_by_target() {
        let analysis = analyze_impact(
            Status::Inactive,
            &[Status::Published, Status::Published, Status::Draft, Status::Archived],
            "Category",
            "courses",
        );
        assert!(analysis.will_make_inaccessible);
        assert_eq!(analysis.affected.len(), 3);
        assert_eq!(
            analysis.recommendation,
            "Deactivate 1 DRAFT, 2 PUBLISHED courses first, or they will become inaccessible to users."
        );

        let safe = analyze_impact(Status::Published, &[Status::Draft], "Category", "courses");
        assert!(!safe.will_make_inaccessible);
        assert_eq!(safe.recommendation, "Safe to change category to PUBLISHED.");
    }
}
