use chrono::{DateTime, Duration, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::{ConnectionTrait, DeriveActiveEnum, FromJsonQueryResult, PaginatorTrait, QueryFilter};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, serde::Serialize)]
#[sea_orm(table_name = "sessions")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    pub academy_id: i64,
    pub template_id: Option<i64>,
    pub teacher_id: i64,
    pub student_id: Option<i64>,
    pub circle_id: Option<i64>,
    pub subscription_id: Option<i64>,

    pub session_code: String,
    #[sea_orm(column_type = "Json")]
    pub kind: SessionKind,
    pub status: SessionStatus,

    pub scheduled_at: DateTime<Utc>,
    pub duration_minutes: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub actual_duration_minutes: Option<i32>,
    pub credit_consumed: bool,

    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancelled_by: Option<i64>,
    pub cancellation_reason: Option<String>,

    pub rescheduled_from_id: Option<i64>,
    pub rescheduled_to_id: Option<i64>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Display, EnumString, Serialize,
    Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[sea_orm(rs_type = "String", db_type = "Enum", enum_name = "session_status")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum SessionStatus {
    #[sea_orm(string_value = "scheduled")]
    Scheduled,

    #[sea_orm(string_value = "ongoing")]
    Ongoing,

    #[sea_orm(string_value = "completed")]
    Completed,

    #[sea_orm(string_value = "cancelled")]
    Cancelled,

    #[sea_orm(string_value = "missed")]
    Missed,

    #[sea_orm(string_value = "rescheduled")]
    Rescheduled,
}

impl SessionStatus {
    /// Terminal states never transition again. `Rescheduled` is terminal for
    /// the original record; its replacement carries the lifecycle forward.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed
                | SessionStatus::Cancelled
                | SessionStatus::Missed
                | SessionStatus::Rescheduled
        )
    }

    pub fn can_transition(self, to: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, to),
            (Scheduled, Ongoing)
                | (Scheduled, Cancelled)
                | (Scheduled, Missed)
                | (Scheduled, Rescheduled)
                | (Ongoing, Completed)
                | (Ongoing, Cancelled)
        )
    }
}

/// Session flavor as a tagged variant. The scheduling and attendance logic
/// only ever touches the shared columns; the variant payload is carried for
/// the course/curriculum collaborators.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, FromJsonQueryResult)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SessionKind {
    Quran,
    Academic {
        subject_id: Option<i64>,
    },
    Interactive {
        course_id: i64,
        lesson_id: Option<i64>,
    },
}

impl SessionKind {
    pub fn code_prefix(&self) -> &'static str {
        match self {
            SessionKind::Quran => "QRN",
            SessionKind::Academic { .. } => "ACD",
            SessionKind::Interactive { .. } => "INT",
        }
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::schedule_template::Entity",
        from = "Column::TemplateId",
        to = "super::schedule_template::Column::Id"
    )]
    Template,

    #[sea_orm(has_many = "super::meeting_attendance::Entity")]
    Attendance,

    #[sea_orm(has_many = "super::attendance_report::Entity")]
    Reports,
}

impl Related<super::schedule_template::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Template.def()
    }
}

impl Related<super::meeting_attendance::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Attendance.def()
    }
}

impl Related<super::attendance_report::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Reports.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Nominal end of the scheduled window.
    pub fn scheduled_end(&self) -> DateTime<Utc> {
        self.scheduled_at + Duration::minutes(self.duration_minutes as i64)
    }

    pub async fn find_by_code<C: ConnectionTrait>(
        db: &C,
        code: &str,
    ) -> Result<Option<Model>, DbErr> {
        Entity::find()
            .filter(Column::SessionCode.eq(code))
            .one(db)
            .await
    }

    /// Duplicate guard used by the generator: does any non-cancelled session
    /// already occupy this exact slot for the template?
    pub async fn exists_non_cancelled_at<C: ConnectionTrait>(
        db: &C,
        template_id: i64,
        scheduled_at: DateTime<Utc>,
    ) -> Result<bool, DbErr> {
        let count = Entity::find()
            .filter(Column::TemplateId.eq(template_id))
            .filter(Column::ScheduledAt.eq(scheduled_at))
            .filter(Column::Status.ne(SessionStatus::Cancelled))
            .count(db)
            .await?;
        Ok(count > 0)
    }

    pub async fn count_non_cancelled_for_template<C: ConnectionTrait>(
        db: &C,
        template_id: i64,
    ) -> Result<u64, DbErr> {
        Entity::find()
            .filter(Column::TemplateId.eq(template_id))
            .filter(Column::Status.ne(SessionStatus::Cancelled))
            .count(db)
            .await
    }

    /// Codes already minted for an owner, matched by prefix. Includes every
    /// status so recycled slots never reuse a sequence number.
    pub async fn find_codes_like<C: ConnectionTrait>(
        db: &C,
        pattern: &str,
    ) -> Result<Vec<String>, DbErr> {
        let sessions = Entity::find()
            .filter(Column::SessionCode.like(pattern))
            .all(db)
            .await?;
        Ok(sessions.into_iter().map(|s| s.session_code).collect())
    }

    /// Future auto-generated sessions of a template that have not started.
    pub async fn find_future_scheduled_for_template<C: ConnectionTrait>(
        db: &C,
        template_id: i64,
        after: DateTime<Utc>,
    ) -> Result<Vec<Model>, DbErr> {
        Entity::find()
            .filter(Column::TemplateId.eq(template_id))
            .filter(Column::Status.eq(SessionStatus::Scheduled))
            .filter(Column::ScheduledAt.gt(after))
            .all(db)
            .await
    }

    /// Coarse candidate set for the missed sweep; the caller still checks the
    /// per-session window (duration + buffer) before marking anything.
    pub async fn find_scheduled_before<C: ConnectionTrait>(
        db: &C,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Model>, DbErr> {
        Entity::find()
            .filter(Column::Status.eq(SessionStatus::Scheduled))
            .filter(Column::ScheduledAt.lte(cutoff))
            .all(db)
            .await
    }

    pub async fn find_ongoing_before<C: ConnectionTrait>(
        db: &C,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Model>, DbErr> {
        Entity::find()
            .filter(Column::Status.eq(SessionStatus::Ongoing))
            .filter(Column::ScheduledAt.lte(cutoff))
            .all(db)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduled_can_start_cancel_miss_or_reschedule() {
        use SessionStatus::*;
        assert!(Scheduled.can_transition(Ongoing));
        assert!(Scheduled.can_transition(Cancelled));
        assert!(Scheduled.can_transition(Missed));
        assert!(Scheduled.can_transition(Rescheduled));
        assert!(!Scheduled.can_transition(Completed));
    }

    #[test]
    fn ongoing_can_complete_or_cancel() {
        use SessionStatus::*;
        assert!(Ongoing.can_transition(Completed));
        assert!(Ongoing.can_transition(Cancelled));
        assert!(!Ongoing.can_transition(Missed));
        assert!(!Ongoing.can_transition(Rescheduled));
        assert!(!Ongoing.can_transition(Scheduled));
    }

    #[test]
    fn terminal_states_never_transition() {
        use SessionStatus::*;
        for terminal in [Completed, Cancelled, Missed, Rescheduled] {
            assert!(terminal.is_terminal());
            for target in [Scheduled, Ongoing, Completed, Cancelled, Missed, Rescheduled] {
                assert!(!terminal.can_transition(target));
            }
        }
        assert!(!Scheduled.is_terminal());
        assert!(!Ongoing.is_terminal());
    }

    #[test]
    fn kind_prefixes_are_stable() {
        assert_eq!(SessionKind::Quran.code_prefix(), "QRN");
        assert_eq!(
            SessionKind::Academic { subject_id: None }.code_prefix(),
            "ACD"
        );
        assert_eq!(
            SessionKind::Interactive {
                course_id: 9,
                lesson_id: Some(3)
            }
            .code_prefix(),
            "INT"
        );
    }

    #[test]
    fn kind_serializes_tagged() {
        let json = serde_json::to_value(SessionKind::Quran).unwrap();
        assert_eq!(json, serde_json::json!({ "kind": "quran" }));

        let json =
            serde_json::to_value(SessionKind::Academic { subject_id: Some(4) }).unwrap();
        assert_eq!(json["kind"], "academic");
        assert_eq!(json["subject_id"], 4);
    }
}
