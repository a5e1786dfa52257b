use syllabus_domain::hierarchy::EntityKind;
use syllabus_domain::ports::jobs::QueueName;
use syllabus_domain::status::Status;
use validator::Validate;

use crate::error::ApiError;

pub fn validate<T: Validate>(value: &T) -> Result<(), ApiError> {
    value
        .validate()
        .map_err(|err| ApiError::Validation(err.to_string()))
}

pub fn entity_type(value: &str) -> Result<EntityKind, ApiError> {
    EntityKind::parse(value)
        .ok_or_else(|| ApiError::Validation(format!("unknown entity type: {value}")))
}

/// Case-insensitive: `archived` and `ARCHIVED` are the same status.
pub fn status(value: &str) -> Result<Status, ApiError> {
    Status::parse(value).ok_or_else(|| ApiError::Validation(format!("unknown status: {value}")))
}

pub fn queue(value: &str) -> Result<QueueName, ApiError> {
    value
        .parse()
        .map_err(|_| ApiError::Validation(format!("unknown queue: {value}")))
}

/// Ids travel inside job ids and redis keys.
pub fn entity_id(value: &str) -> Result<String, ApiError> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ApiError::Validation(format!("invalid entity id: {value:?}")));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_case_insensitive_names() {
        assert_eq!(entity_type("Course").ok(), Some(EntityKind::Course));
        assert_eq!(status("ARCHIVED").ok(), Some(Status::Archived));
        assert_eq!(queue("level").ok(), Some(QueueName::Level));
        assert!(queue("Level").is_err());
    }

    #[test]
    fn entity_ids_are_trimmed_and_single_token() {
        assert_eq!(entity_id("  course-1 ").ok().as_deref(), Some("course-1"));
        assert!(entity_id("course 1").is_err());
        assert!(entity_id("   ").is_err());
    }
}
