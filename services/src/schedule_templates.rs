use chrono::{DateTime, NaiveDate, Utc};
use log::info;
use sea_orm::ActiveValue::Set;
use sea_orm::{ActiveModelTrait, ConnectionTrait, DatabaseConnection, EntityTrait, TransactionTrait};
use validator::Validate;

use db::models::schedule_template::{self, SlotList, WeeklySlot};
use db::models::session::{self, SessionKind, SessionStatus};

use crate::error::{SchedulingError, SchedulingResult};

#[derive(Debug, Clone, Validate)]
pub struct CreateScheduleTemplate {
    pub academy_id: i64,
    pub teacher_id: i64,
    pub circle_id: Option<i64>,
    pub subscription_id: Option<i64>,

    #[validate(length(min = 1, message = "Schedule must define at least one weekly slot"))]
    pub slots: Vec<WeeklySlot>,
    pub session_kind: SessionKind,
    pub timezone: String,

    #[validate(range(min = 1, message = "Session duration must be at least one minute"))]
    pub default_duration_minutes: i32,

    pub starts_on: NaiveDate,
    pub ends_on: Option<NaiveDate>,

    #[validate(range(min = 1, message = "Generation horizon must be at least one day"))]
    pub generate_ahead_days: i32,
    #[validate(range(min = 0, message = "Generation trigger hours cannot be negative"))]
    pub generate_before_hours: i32,
    #[validate(range(min = 1, message = "Session cap must be at least one"))]
    pub max_sessions: Option<i32>,
    #[validate(range(min = 0, message = "Cancellation notice hours cannot be negative"))]
    pub cancel_notice_hours: i32,
}

impl CreateScheduleTemplate {
    /// Template parameters with the platform defaults filled in.
    pub fn new(
        academy_id: i64,
        teacher_id: i64,
        slots: Vec<WeeklySlot>,
        starts_on: NaiveDate,
    ) -> Self {
        Self {
            academy_id,
            teacher_id,
            circle_id: None,
            subscription_id: None,
            slots,
            session_kind: SessionKind::Quran,
            timezone: "UTC".to_owned(),
            default_duration_minutes: 60,
            starts_on,
            ends_on: None,
            generate_ahead_days: 30,
            generate_before_hours: 1,
            max_sessions: None,
            cancel_notice_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Default, Validate)]
pub struct UpdateScheduleTemplate {
    pub slots: Option<Vec<WeeklySlot>>,
    #[validate(range(min = 1, message = "Session duration must be at least one minute"))]
    pub default_duration_minutes: Option<i32>,
    pub ends_on: Option<NaiveDate>,
    #[validate(range(min = 1, message = "Generation horizon must be at least one day"))]
    pub generate_ahead_days: Option<i32>,
    #[validate(range(min = 1, message = "Session cap must be at least one"))]
    pub max_sessions: Option<i32>,
    #[validate(range(min = 0, message = "Cancellation notice hours cannot be negative"))]
    pub cancel_notice_hours: Option<i32>,
}

fn validate_slots(slots: &[WeeklySlot]) -> SchedulingResult<()> {
    for slot in slots {
        slot.validate()
            .map_err(|e| SchedulingError::Validation(e.to_string()))?;
    }
    Ok(())
}

fn validate_date_range(starts_on: NaiveDate, ends_on: Option<NaiveDate>) -> SchedulingResult<()> {
    if let Some(end) = ends_on {
        if end <= starts_on {
            return Err(SchedulingError::Validation(
                "Schedule end date must be after the start date".to_owned(),
            ));
        }
    }
    Ok(())
}

pub async fn create(
    db: &DatabaseConnection,
    params: CreateScheduleTemplate,
) -> SchedulingResult<schedule_template::Model> {
    params
        .validate()
        .map_err(|e| SchedulingError::Validation(common::format_validation_errors(&e)))?;
    validate_slots(&params.slots)?;
    validate_date_range(params.starts_on, params.ends_on)?;

    let now = Utc::now();
    let active_model = schedule_template::ActiveModel {
        academy_id: Set(params.academy_id),
        teacher_id: Set(params.teacher_id),
        circle_id: Set(params.circle_id),
        subscription_id: Set(params.subscription_id),
        weekly_slots: Set(SlotList(params.slots)),
        session_kind: Set(params.session_kind),
        timezone: Set(params.timezone),
        default_duration_minutes: Set(params.default_duration_minutes),
        is_active: Set(true),
        starts_on: Set(params.starts_on),
        ends_on: Set(params.ends_on),
        last_generated_on: Set(None),
        generate_ahead_days: Set(params.generate_ahead_days),
        generate_before_hours: Set(params.generate_before_hours),
        max_sessions: Set(params.max_sessions),
        cancel_notice_hours: Set(params.cancel_notice_hours),
        deleted_at: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    };

    let template = active_model.insert(db).await?;
    info!(
        "Created schedule template {} for teacher {} ({} slots)",
        template.id,
        template.teacher_id,
        template.slots().len()
    );
    Ok(template)
}

/// Applies edits to a template. A changed slot set cancels the template's
/// future, not-yet-started generated sessions so the next generation run can
/// rematerialize the new pattern.
pub async fn update(
    db: &DatabaseConnection,
    template_id: i64,
    params: UpdateScheduleTemplate,
    now: DateTime<Utc>,
) -> SchedulingResult<schedule_template::Model> {
    params
        .validate()
        .map_err(|e| SchedulingError::Validation(common::format_validation_errors(&e)))?;
    if let Some(ref slots) = params.slots {
        if slots.is_empty() {
            return Err(SchedulingError::Validation(
                "Schedule must define at least one weekly slot".to_owned(),
            ));
        }
        validate_slots(slots)?;
    }

    let txn = db.begin().await?;

    let template = schedule_template::Entity::find_by_id(template_id)
        .one(&txn)
        .await?
        .ok_or(SchedulingError::TemplateNotFound(template_id))?;

    validate_date_range(template.starts_on, params.ends_on.or(template.ends_on))?;

    let slots_changed = params
        .slots
        .as_ref()
        .is_some_and(|s| s != &template.weekly_slots.0);
    if slots_changed {
        let cancelled =
            cancel_future_generated(&txn, template_id, now, "schedule updated").await?;
        if cancelled > 0 {
            info!(
                "Cancelled {} upcoming sessions of template {} after slot change",
                cancelled, template_id
            );
        }
    }

    let mut active_model: schedule_template::ActiveModel = template.into();
    if let Some(slots) = params.slots {
        active_model.weekly_slots = Set(SlotList(slots));
    }
    if let Some(duration) = params.default_duration_minutes {
        active_model.default_duration_minutes = Set(duration);
    }
    if let Some(ends_on) = params.ends_on {
        active_model.ends_on = Set(Some(ends_on));
    }
    if let Some(days) = params.generate_ahead_days {
        active_model.generate_ahead_days = Set(days);
    }
    if let Some(max) = params.max_sessions {
        active_model.max_sessions = Set(Some(max));
    }
    if let Some(hours) = params.cancel_notice_hours {
        active_model.cancel_notice_hours = Set(hours);
    }
    active_model.updated_at = Set(Utc::now());
    let updated = active_model.update(&txn).await?;

    txn.commit().await?;
    Ok(updated)
}

pub async fn activate(
    db: &DatabaseConnection,
    template_id: i64,
) -> SchedulingResult<schedule_template::Model> {
    let template = schedule_template::Entity::find_by_id(template_id)
        .one(db)
        .await?
        .ok_or(SchedulingError::TemplateNotFound(template_id))?;

    if template.deleted_at.is_some() {
        return Err(SchedulingError::Validation(
            "Cannot activate a deleted schedule".to_owned(),
        ));
    }

    let template = schedule_template::Model::set_active(db, template_id, true).await?;
    info!("Activated schedule template {}", template_id);
    Ok(template)
}

/// Deactivation stops future generation and cancels the template's upcoming
/// generated sessions that have not started yet. Historical sessions are
/// untouched.
pub async fn deactivate(
    db: &DatabaseConnection,
    template_id: i64,
    now: DateTime<Utc>,
) -> SchedulingResult<schedule_template::Model> {
    let txn = db.begin().await?;

    schedule_template::Entity::find_by_id(template_id)
        .one(&txn)
        .await?
        .ok_or(SchedulingError::TemplateNotFound(template_id))?;

    let cancelled = cancel_future_generated(&txn, template_id, now, "schedule deactivated").await?;
    let template = schedule_template::Model::set_active(&txn, template_id, false).await?;

    txn.commit().await?;
    info!(
        "Deactivated schedule template {} ({} upcoming sessions cancelled)",
        template_id, cancelled
    );
    Ok(template)
}

/// Soft delete: the template row survives for audit and its history of
/// generated sessions is never removed.
pub async fn soft_delete(
    db: &DatabaseConnection,
    template_id: i64,
    now: DateTime<Utc>,
) -> SchedulingResult<schedule_template::Model> {
    let txn = db.begin().await?;

    schedule_template::Entity::find_by_id(template_id)
        .one(&txn)
        .await?
        .ok_or(SchedulingError::TemplateNotFound(template_id))?;

    let cancelled = cancel_future_generated(&txn, template_id, now, "schedule removed").await?;
    let template = schedule_template::Model::soft_delete(&txn, template_id).await?;

    txn.commit().await?;
    info!(
        "Soft-deleted schedule template {} ({} upcoming sessions cancelled)",
        template_id, cancelled
    );
    Ok(template)
}

async fn cancel_future_generated<C: ConnectionTrait>(
    db: &C,
    template_id: i64,
    now: DateTime<Utc>,
    reason: &str,
) -> SchedulingResult<usize> {
    let upcoming =
        session::Model::find_future_scheduled_for_template(db, template_id, now).await?;
    let count = upcoming.len();

    for session in upcoming {
        let mut active_model: session::ActiveModel = session.into();
        active_model.status = Set(SessionStatus::Cancelled);
        active_model.cancelled_at = Set(Some(now));
        active_model.cancelled_by = Set(None);
        active_model.cancellation_reason = Set(Some(reason.to_owned()));
        active_model.updated_at = Set(Utc::now());
        active_model.update(db).await?;
    }

    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use db::test_utils::setup_test_db;

    fn slots(weekday: u8, time: &str) -> Vec<WeeklySlot> {
        vec![WeeklySlot::new(weekday, time)]
    }

    fn start_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 7, 1).unwrap()
    }

    #[tokio::test]
    async fn create_persists_defaults() {
        let db = setup_test_db().await;

        let template = create(
            &db,
            CreateScheduleTemplate::new(1, 10, slots(1, "09:00"), start_date()),
        )
        .await
        .unwrap();

        assert!(template.is_active);
        assert_eq!(template.default_duration_minutes, 60);
        assert_eq!(template.generate_ahead_days, 30);
        assert_eq!(template.cancel_notice_hours, 24);
        assert_eq!(template.slots().len(), 1);
        assert!(template.last_generated_on.is_none());
    }

    #[tokio::test]
    async fn create_rejects_empty_slot_list() {
        let db = setup_test_db().await;

        let err = create(
            &db,
            CreateScheduleTemplate::new(1, 10, vec![], start_date()),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, SchedulingError::Validation(_)));
    }

    #[tokio::test]
    async fn create_rejects_bad_weekday_and_time() {
        let db = setup_test_db().await;

        let err = create(
            &db,
            CreateScheduleTemplate::new(1, 10, slots(9, "09:00"), start_date()),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SchedulingError::Validation(_)));

        let err = create(
            &db,
            CreateScheduleTemplate::new(1, 10, slots(1, "quarter past"), start_date()),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SchedulingError::Validation(_)));
    }

    #[tokio::test]
    async fn create_rejects_end_before_start() {
        let db = setup_test_db().await;

        let mut params = CreateScheduleTemplate::new(1, 10, slots(1, "09:00"), start_date());
        params.ends_on = Some(NaiveDate::from_ymd_opt(2026, 6, 1).unwrap());

        let err = create(&db, params).await.unwrap_err();
        assert!(matches!(err, SchedulingError::Validation(_)));
    }

    #[tokio::test]
    async fn deactivate_cancels_upcoming_generated_sessions() {
        let db = setup_test_db().await;
        let now = Utc.with_ymd_and_hms(2026, 7, 10, 12, 0, 0).unwrap();

        let template = create(
            &db,
            CreateScheduleTemplate::new(1, 10, slots(1, "09:00"), start_date()),
        )
        .await
        .unwrap();

        let outcome = crate::session_generator::generate_upcoming(
            &db,
            template.id,
            Some(14),
            now,
            &crate::subscriptions::UnlimitedSubscriptions,
        )
        .await
        .unwrap();
        assert!(outcome.created > 0);

        let template = deactivate(&db, template.id, now).await.unwrap();
        assert!(!template.is_active);

        let remaining =
            session::Model::find_future_scheduled_for_template(&db, template.id, now)
                .await
                .unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn slot_change_cancels_future_sessions() {
        let db = setup_test_db().await;
        let now = Utc.with_ymd_and_hms(2026, 7, 10, 12, 0, 0).unwrap();

        let template = create(
            &db,
            CreateScheduleTemplate::new(1, 10, slots(1, "09:00"), start_date()),
        )
        .await
        .unwrap();

        crate::session_generator::generate_upcoming(
            &db,
            template.id,
            Some(14),
            now,
            &crate::subscriptions::UnlimitedSubscriptions,
        )
        .await
        .unwrap();

        let updated = update(
            &db,
            template.id,
            UpdateScheduleTemplate {
                slots: Some(slots(3, "18:30")),
                ..Default::default()
            },
            now,
        )
        .await
        .unwrap();
        assert_eq!(updated.slots()[0].weekday, 3);

        let remaining =
            session::Model::find_future_scheduled_for_template(&db, template.id, now)
                .await
                .unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn soft_delete_marks_and_deactivates() {
        let db = setup_test_db().await;
        let now = Utc.with_ymd_and_hms(2026, 7, 10, 12, 0, 0).unwrap();

        let template = create(
            &db,
            CreateScheduleTemplate::new(1, 10, slots(2, "10:00"), start_date()),
        )
        .await
        .unwrap();

        let deleted = soft_delete(&db, template.id, now).await.unwrap();
        assert!(deleted.deleted_at.is_some());
        assert!(!deleted.is_active);

        let err = activate(&db, template.id).await.unwrap_err();
        assert!(matches!(err, SchedulingError::Validation(_)));
    }

    #[tokio::test]
    async fn update_missing_template_is_not_found() {
        let db = setup_test_db().await;

        let err = update(
            &db,
            999,
            UpdateScheduleTemplate::default(),
            Utc::now(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SchedulingError::TemplateNotFound(999)));
    }
}
