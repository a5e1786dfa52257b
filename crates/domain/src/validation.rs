use crate::error::{PolicyViolation, ViolationKind};
use crate::hierarchy::{EntityKind, EntityRecord};
use crate::policy;
use crate::status::{Action, Status};

/// Pre-flight gate for synchronous status changes. Rejects, never repairs.
#[derive(Clone, Copy, Debug, Default)]
pub struct StatusValidationService;

impl StatusValidationService {
    pub fn new() -> Self {
        Self
    }

    pub fn validate_transition(
        &self,
        kind: EntityKind,
        current: Status,
        target: Status,
    ) -> Result<(), PolicyViolation> {
        match policy::transition_rejection(current, target, kind.label()) {
            None => Ok(()),
            Some(reason) => Err(PolicyViolation::new(
                ViolationKind::InvalidTransition,
                format!(
                    "Cannot transition {kind} from {} to {}: {reason}",
                    current.as_str(),
                    target.as_str()
                ),
            )),
        }
    }

    /// Transition check against the parent's current status. Entities
    /// without a parent only get the plain transition check.
    pub fn validate_transition_with_parent(
        &self,
        kind: EntityKind,
        current: Status,
        target: Status,
        parent_status: Option<Status>,
    ) -> Result<(), PolicyViolation> {
        self.validate_transition(kind, current, target)?;
        let (Some(parent_status), Some(parent_kind)) = (parent_status, kind.parent()) else {
            return Ok(());
        };
        policy::validate_transition_with_parent(
            current,
            target,
            parent_status,
            kind.label(),
            parent_kind.label(),
        )
        .map_err(|reason| PolicyViolation::new(ViolationKind::ParentConstraint, reason))
    }

    pub fn validate_with_children(
        &self,
        entity: &EntityRecord,
        target: Status,
        children: &[EntityRecord],
    ) -> Result<(), PolicyViolation> {
        if children.is_empty() || entity.status == target {
            return Ok(());
        }
        let Some(child_kind) = entity.kind.child() else {
            return Ok(());
        };

        let parent_name = entity.kind.as_str();
        let child_name = child_kind.as_str();
        let rules = policy::parent_change_rules(target);
        let mut offending = Vec::new();
        let mut first_reason = None;
        for child in children {
            for rule in rules.iter().filter(|rule| rule.disallowed == child.status) {
                offending.push(child.status);
                if first_reason.is_none() {
                    first_reason = Some(rule.reason(parent_name, child_name));
                }
            }
        }

        let Some(first_reason) = first_reason else {
            return Ok(());
        };
        let summary = policy::status_summary(offending);
        Err(PolicyViolation::new(
            ViolationKind::ChildConstraint,
            format!(
                "Cannot change {parent_name} status to {}: Cannot change {parent_name} from {} to {}. Has {summary} {child_name}(s). {first_reason}",
                target.as_str(),
                entity.status.upper(),
                target.upper(),
            ),
        ))
    }

    /// The parent must permit updating a child in the entity's status.
    pub fn validate_update(
        &self,
        entity: &EntityRecord,
        parent_status: Option<Status>,
    ) -> Result<(), PolicyViolation> {
        let (Some(parent_status), Some(parent_kind)) = (parent_status, entity.kind.parent()) else {
            return Ok(());
        };
        policy::can_perform_action(
            parent_status,
            Some(entity.status),
            Action::Update,
            entity.kind.label(),
            parent_kind.label(),
        )
        .map_err(|reason| {
            PolicyViolation::new(
                ViolationKind::ActionNotAllowed,
                format!("Cannot update {}: {reason}", entity.kind),
            )
        })
    }

    /// Update permission, transition legality and child compatibility.
    pub fn validate_complete(
        &self,
        entity: &EntityRecord,
        target: Status,
        parent_status: Option<Status>,
        children: &[EntityRecord],
    ) -> Result<(), PolicyViolation> {
        self.validate_update(entity, parent_status)?;
        self.validate_transition(entity.kind, entity.status, target)?;
        self.validate_with_children(entity, target, children)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn course(status: Status) -> EntityRecord {
        EntityRecord::new(EntityKind::Course, "course-1", status).with_parent("cat-1")
    }

    fn chapters(statuses: &[Status]) -> Vec<EntityRecord> {
        statuses
            .iter()
            .enumerate()
            .map(|(idx, status)| {
                EntityRecord::new(EntityKind::Chapter, format!("ch-{idx}"), *status)
                    .with_parent("course-1")
            })
            .collect()
    }

    #[test]
    fn validate_transition_accepts_table_and_rejects_rest() {
        let service = StatusValidationService::new();
        for from in Status::ALL {
            for to in Status::ALL {
                let result = service.validate_transition(EntityKind::Lesson, from, to);
                let legal = from == to || policy::allowed_transitions(from).contains(&to);
                assert_eq!(result.is_ok(), legal, "{from} -> {to}");
                if let Err(err) = result {
                    assert_eq!(err.kind, ViolationKind::InvalidTransition);
                    assert!(!err.message.is_empty());
                }
            }
        }
    }

    #[test]
    fn validate_transition_names_entity_and_statuses() {
        let err = StatusValidationService::new()
            .validate_transition(EntityKind::Course, Status::Published, Status::Draft)
            .expect_err("published to draft");
        assert_eq!(
            err.message,
            "Cannot transition course from published to draft: Course cannot be reverted to DRAFT once published. Use INACTIVE to temporarily hide it."
        );
    }

    #[test]
    fn validate_with_children_summarizes_offending_statuses() {
        let err = StatusValidationService::new()
            .validate_with_children(
                &course(Status::Published),
                Status::Draft,
                &chapters(&[Status::Published, Status::Published, Status::Inactive]),
            )
            .expect_err("draft with live chapters");
        assert_eq!(err.kind, ViolationKind::ChildConstraint);
        assert!(err.message.contains("Has 2 PUBLISHED, 1 INACTIVE chapter(s)."));
        assert!(err.message.contains("Cannot set course to DRAFT while having PUBLISHED chapter(s)."));
    }

    #[test]
    fn validate_with_children_passes_without_children_or_rules() {
        let service = StatusValidationService::new();
        assert!(
            service
                .validate_with_children(&course(Status::Published), Status::Draft, &[])
                .is_ok()
        );
        assert!(
            service
                .validate_with_children(
                    &course(Status::Published),
                    Status::Archived,
                    &chapters(&[Status::Published])
                )
                .is_ok()
        );
    }

    #[test]
    fn validate_update_respects_parent_matrix() {
        let service = StatusValidationService::new();
        assert!(
            service
                .validate_update(&course(Status::Published), Some(Status::Published))
                .is_ok()
        );
        let err = service
            .validate_update(&course(Status::Published), Some(Status::Archived))
            .expect_err("archived parent");
        assert_eq!(
            err.message,
            "Cannot update course: Cannot update published course in archived category"
        );
        let root = EntityRecord::new(EntityKind::Category, "cat-1", Status::Archived);
        assert!(service.validate_update(&root, None).is_ok());
    }

    #[test]
    fn validate_transition_with_parent_blocks_publish_under_inactive() {
        let err = StatusValidationService::new()
            .validate_transition_with_parent(
                EntityKind::Course,
                Status::Inactive,
                Status::Published,
                Some(Status::Inactive),
            )
            .expect_err("inactive parent");
        assert_eq!(err.kind, ViolationKind::ParentConstraint);
    }

    #[test]
    fn validate_complete_runs_every_gate() {
        let service = StatusValidationService::new();
        assert!(
            service
                .validate_complete(
                    &course(Status::Published),
                    Status::Inactive,
                    Some(Status::Published),
                    &chapters(&[Status::Published]),
                )
                .is_ok()
        );
        let err = service
            .validate_complete(
                &course(Status::Draft),
                Status::Archived,
                Some(Status::Published),
                &[],
            )
            .expect_err("draft cannot archive");
        assert_eq!(err.kind, ViolationKind::InvalidTransition);
    }
}
