use db::models::session::SessionStatus;
use sea_orm::DbErr;

pub type SchedulingResult<T> = Result<T, SchedulingError>;

/// Typed failures for the scheduling and attendance services. Expected
/// steady-state conditions (duplicate slots, code collisions, leave events
/// with no open cycle) are handled internally and never surface here.
#[derive(Debug, thiserror::Error)]
pub enum SchedulingError {
    #[error("Database error: {0}")]
    Database(#[from] DbErr),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Schedule template {0} not found")]
    TemplateNotFound(i64),

    #[error("Session {0} not found")]
    SessionNotFound(i64),

    #[error("No attendance report for participant {participant_id} in session {session_id}")]
    ReportNotFound {
        session_id: i64,
        participant_id: i64,
    },

    #[error("Invalid session transition from {from} to {to}")]
    InvalidTransition {
        from: SessionStatus,
        to: SessionStatus,
    },

    #[error("Operation requires {hours} hours notice before the scheduled start")]
    NoticeWindow { hours: i64 },

    #[error("Subscription gateway error: {0}")]
    Subscription(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_name_the_offender() {
        let err = SchedulingError::TemplateNotFound(42);
        assert_eq!(err.to_string(), "Schedule template 42 not found");

        let err = SchedulingError::InvalidTransition {
            from: SessionStatus::Completed,
            to: SessionStatus::Ongoing,
        };
        assert_eq!(
            err.to_string(),
            "Invalid session transition from completed to ongoing"
        );

        let err = SchedulingError::NoticeWindow { hours: 24 };
        assert_eq!(
            err.to_string(),
            "Operation requires 24 hours notice before the scheduled start"
        );
    }
}
