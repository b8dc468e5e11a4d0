use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc};
use sea_orm::ActiveValue::Set;
use sea_orm::entity::prelude::*;
use sea_orm::{Condition, ConnectionTrait, FromJsonQueryResult, QueryFilter};
use serde::{Deserialize, Serialize};

use super::session::SessionKind;

/// One weekly recurrence slot. `weekday` follows the 0 = Sunday .. 6 = Saturday
/// convention; `start_time` is a 24h "HH:MM" time of day interpreted in UTC.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklySlot {
    pub weekday: u8,
    pub start_time: String,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum SlotError {
    #[error("weekday {0} is out of range (expected 0-6)")]
    WeekdayOutOfRange(u8),

    #[error("invalid start time '{0}' (expected HH:MM)")]
    InvalidStartTime(String),
}

impl WeeklySlot {
    pub fn new(weekday: u8, start_time: &str) -> Self {
        Self {
            weekday,
            start_time: start_time.to_owned(),
        }
    }

    pub fn validate(&self) -> Result<(), SlotError> {
        if self.weekday > 6 {
            return Err(SlotError::WeekdayOutOfRange(self.weekday));
        }
        self.start_naive_time()?;
        Ok(())
    }

    pub fn start_naive_time(&self) -> Result<NaiveTime, SlotError> {
        NaiveTime::parse_from_str(&self.start_time, "%H:%M")
            .map_err(|_| SlotError::InvalidStartTime(self.start_time.clone()))
    }
}

/// The ordered slot list stored as a JSON column.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, FromJsonQueryResult)]
pub struct SlotList(pub Vec<WeeklySlot>);

impl SlotList {
    pub fn iter(&self) -> std::slice::Iter<'_, WeeklySlot> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Slots whose weekday matches the given calendar day.
    pub fn for_day(&self, day: NaiveDate) -> impl Iterator<Item = &WeeklySlot> {
        let weekday = day.weekday().num_days_from_sunday() as u8;
        self.0.iter().filter(move |s| s.weekday == weekday)
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "schedule_templates")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    pub academy_id: i64,
    pub teacher_id: i64,
    pub circle_id: Option<i64>,
    pub subscription_id: Option<i64>,

    #[sea_orm(column_type = "Json")]
    pub weekly_slots: SlotList,
    #[sea_orm(column_type = "Json")]
    pub session_kind: SessionKind,

    pub timezone: String,
    pub default_duration_minutes: i32,
    pub is_active: bool,

    pub starts_on: NaiveDate,
    pub ends_on: Option<NaiveDate>,
    pub last_generated_on: Option<NaiveDate>,
    pub generate_ahead_days: i32,
    pub generate_before_hours: i32,
    pub max_sessions: Option<i32>,
    pub cancel_notice_hours: i32,

    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::session::Entity")]
    Sessions,
}

impl Related<super::session::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Sessions.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn slots(&self) -> &[WeeklySlot] {
        &self.weekly_slots.0
    }

    /// A template is eligible for generation when it is active, not soft
    /// deleted, and has not ended. Already-filled templates stay eligible:
    /// every run revisits them and tops the rolling horizon up, and the
    /// generation window math turns a fully covered template into a no-op.
    pub async fn find_due_for_generation<C: ConnectionTrait>(
        db: &C,
        today: NaiveDate,
    ) -> Result<Vec<Model>, DbErr> {
        Entity::find()
            .filter(Column::IsActive.eq(true))
            .filter(Column::DeletedAt.is_null())
            .filter(
                Condition::any()
                    .add(Column::EndsOn.is_null())
                    .add(Column::EndsOn.gte(today)),
            )
            .all(db)
            .await
    }

    pub async fn set_active<C: ConnectionTrait>(
        db: &C,
        template_id: i64,
        active: bool,
    ) -> Result<Model, DbErr> {
        let model = Entity::find_by_id(template_id).one(db).await?;

        let model = match model {
            Some(m) => m,
            None => return Err(DbErr::RecordNotFound("Schedule template not found".to_string())),
        };

        let mut active_model: ActiveModel = model.into();
        active_model.is_active = Set(active);
        active_model.updated_at = Set(Utc::now());
        active_model.update(db).await
    }

    pub async fn set_last_generated<C: ConnectionTrait>(
        db: &C,
        template_id: i64,
        through: NaiveDate,
    ) -> Result<Model, DbErr> {
        let model = Entity::find_by_id(template_id).one(db).await?;

        let model = match model {
            Some(m) => m,
            None => return Err(DbErr::RecordNotFound("Schedule template not found".to_string())),
        };

        let mut active_model: ActiveModel = model.into();
        active_model.last_generated_on = Set(Some(through));
        active_model.updated_at = Set(Utc::now());
        active_model.update(db).await
    }

    pub async fn soft_delete<C: ConnectionTrait>(db: &C, template_id: i64) -> Result<Model, DbErr> {
        let model = Entity::find_by_id(template_id).one(db).await?;

        let model = match model {
            Some(m) => m,
            None => return Err(DbErr::RecordNotFound("Schedule template not found".to_string())),
        };

        let mut active_model: ActiveModel = model.into();
        active_model.is_active = Set(false);
        active_model.deleted_at = Set(Some(Utc::now()));
        active_model.updated_at = Set(Utc::now());
        active_model.update(db).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::setup_test_db;

    async fn insert_template(
        db: &DatabaseConnection,
        is_active: bool,
        ends_on: Option<NaiveDate>,
        last_generated_on: Option<NaiveDate>,
        deleted: bool,
    ) -> Model {
        ActiveModel {
            academy_id: Set(1),
            teacher_id: Set(10),
            circle_id: Set(None),
            subscription_id: Set(None),
            weekly_slots: Set(SlotList(vec![WeeklySlot::new(1, "09:00")])),
            session_kind: Set(SessionKind::Quran),
            timezone: Set("UTC".to_owned()),
            default_duration_minutes: Set(60),
            is_active: Set(is_active),
            starts_on: Set(NaiveDate::from_ymd_opt(2026, 7, 1).unwrap()),
            ends_on: Set(ends_on),
            last_generated_on: Set(last_generated_on),
            generate_ahead_days: Set(30),
            generate_before_hours: Set(1),
            max_sessions: Set(None),
            cancel_notice_hours: Set(24),
            deleted_at: Set(deleted.then(Utc::now)),
            created_at: Set(Utc::now()),
            updated_at: Set(Utc::now()),
            ..Default::default()
        }
        .insert(db)
        .await
        .unwrap()
    }

    #[test]
    fn slot_validate_accepts_well_formed_slots() {
        assert!(WeeklySlot::new(0, "09:00").validate().is_ok());
        assert!(WeeklySlot::new(6, "23:59").validate().is_ok());
    }

    #[test]
    fn slot_validate_rejects_bad_weekday() {
        assert_eq!(
            WeeklySlot::new(7, "09:00").validate(),
            Err(SlotError::WeekdayOutOfRange(7))
        );
    }

    #[test]
    fn slot_validate_rejects_bad_time() {
        assert_eq!(
            WeeklySlot::new(1, "9am").validate(),
            Err(SlotError::InvalidStartTime("9am".to_string()))
        );
        assert_eq!(
            WeeklySlot::new(1, "25:00").validate(),
            Err(SlotError::InvalidStartTime("25:00".to_string()))
        );
    }

    #[test]
    fn for_day_matches_weekday() {
        let slots = SlotList(vec![
            WeeklySlot::new(1, "09:00"), // Monday
            WeeklySlot::new(3, "14:30"), // Wednesday
            WeeklySlot::new(1, "16:00"), // Monday again
        ]);

        // 2026-07-13 is a Monday.
        let monday = NaiveDate::from_ymd_opt(2026, 7, 13).unwrap();
        let matched: Vec<_> = slots.for_day(monday).collect();
        assert_eq!(matched.len(), 2);
        assert!(matched.iter().all(|s| s.weekday == 1));

        let tuesday = NaiveDate::from_ymd_opt(2026, 7, 14).unwrap();
        assert_eq!(slots.for_day(tuesday).count(), 0);
    }

    #[test]
    fn slot_list_round_trips_through_json() {
        let slots = SlotList(vec![WeeklySlot::new(5, "18:45")]);
        let json = serde_json::to_string(&slots).unwrap();
        let back: SlotList = serde_json::from_str(&json).unwrap();
        assert_eq!(slots, back);
    }

    #[tokio::test]
    async fn freshly_filled_template_remains_due() {
        let db = setup_test_db().await;
        let today = NaiveDate::from_ymd_opt(2026, 7, 11).unwrap();

        // Horizon already covered through the 24th; the daily run must still
        // visit this template to keep the window topped up.
        let filled = insert_template(
            &db,
            true,
            None,
            Some(NaiveDate::from_ymd_opt(2026, 7, 24).unwrap()),
            false,
        )
        .await;

        let due = Model::find_due_for_generation(&db, today).await.unwrap();
        assert_eq!(due.iter().map(|t| t.id).collect::<Vec<_>>(), vec![filled.id]);
    }

    #[tokio::test]
    async fn due_set_excludes_inactive_deleted_and_ended_templates() {
        let db = setup_test_db().await;
        let today = NaiveDate::from_ymd_opt(2026, 7, 11).unwrap();

        let live = insert_template(&db, true, None, None, false).await;
        insert_template(&db, false, None, None, false).await;
        insert_template(&db, true, None, None, true).await;
        insert_template(
            &db,
            true,
            Some(NaiveDate::from_ymd_opt(2026, 7, 10).unwrap()),
            None,
            false,
        )
        .await;

        let due = Model::find_due_for_generation(&db, today).await.unwrap();
        assert_eq!(due.iter().map(|t| t.id).collect::<Vec<_>>(), vec![live.id]);
    }
}
