use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::{ConnectionTrait, DeriveActiveEnum, QueryFilter};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, serde::Serialize)]
#[sea_orm(table_name = "attendance_reports")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    pub session_id: i64,
    pub participant_id: i64,

    pub status: AttendanceStatus,
    pub attendance_percentage: f64,
    pub attended_minutes: i32,
    pub is_late: bool,
    pub late_minutes: i32,

    pub manual_override: bool,
    pub override_by: Option<i64>,
    pub override_reason: Option<String>,
    pub overridden_at: Option<DateTime<Utc>>,

    pub finalized: bool,
    pub evaluated_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Display, EnumString, Serialize,
    Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[sea_orm(rs_type = "String", db_type = "Enum", enum_name = "attendance_status")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum AttendanceStatus {
    #[sea_orm(string_value = "attended")]
    Attended,

    #[sea_orm(string_value = "late")]
    Late,

    #[sea_orm(string_value = "partial")]
    Partial,

    #[sea_orm(string_value = "absent")]
    Absent,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::session::Entity",
        from = "Column::SessionId",
        to = "super::session::Column::Id"
    )]
    Session,
}

impl Related<super::session::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Session.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub async fn find_one<C: ConnectionTrait>(
        db: &C,
        session_id: i64,
        participant_id: i64,
    ) -> Result<Option<Model>, DbErr> {
        Entity::find()
            .filter(Column::SessionId.eq(session_id))
            .filter(Column::ParticipantId.eq(participant_id))
            .one(db)
            .await
    }

    pub async fn find_for_session<C: ConnectionTrait>(
        db: &C,
        session_id: i64,
    ) -> Result<Vec<Model>, DbErr> {
        Entity::find()
            .filter(Column::SessionId.eq(session_id))
            .all(db)
            .await
    }
}
