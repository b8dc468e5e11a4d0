use chrono::{DateTime, Duration, Utc};
use log::{error, info, warn};
use sea_orm::ActiveValue::Set;
use sea_orm::{
    ActiveModelTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait, TransactionTrait,
};
use validator::Validate;

use db::models::schedule_template;
use db::models::session::{self, SessionKind, SessionStatus};

use crate::error::{SchedulingError, SchedulingResult};
use crate::subscriptions::SubscriptionGateway;

/// Retries on a session-code collision before falling back to a timestamped
/// code.
const MAX_CODE_ATTEMPTS: usize = 5;

#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Serialize)]
pub struct GenerationOutcome {
    pub created: usize,
    /// Slots skipped because a non-cancelled session already occupied them.
    pub skipped_existing: usize,
    /// Slots skipped because the template cap or subscription credits ran out.
    pub skipped_capacity: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Serialize)]
pub struct BatchGenerationOutcome {
    pub templates: usize,
    pub created: usize,
    pub failed: usize,
}

/// Materializes upcoming sessions for one template.
///
/// The window starts at the later of today, the template start date, and the
/// day after the last generated date; it ends `horizon_days` after today,
/// clamped to the template end date. Every slot occurrence in the window gets
/// a session unless it is already in the past, already occupied, or over
/// capacity. The whole run commits atomically and advances
/// `last_generated_on` so reruns are no-ops.
pub async fn generate_upcoming<S: SubscriptionGateway>(
    db: &DatabaseConnection,
    template_id: i64,
    horizon_days: Option<i64>,
    now: DateTime<Utc>,
    subscriptions: &S,
) -> SchedulingResult<GenerationOutcome> {
    let txn = db.begin().await?;

    let template = schedule_template::Entity::find_by_id(template_id)
        .one(&txn)
        .await?
        .ok_or(SchedulingError::TemplateNotFound(template_id))?;

    if !template.is_active || template.deleted_at.is_some() {
        return Err(SchedulingError::Validation(
            "Cannot generate sessions for an inactive schedule".to_owned(),
        ));
    }

    let today = now.date_naive();
    let horizon = horizon_days.unwrap_or(template.generate_ahead_days as i64);

    let mut start = today.max(template.starts_on);
    if let Some(last) = template.last_generated_on {
        start = start.max(last + Duration::days(1));
    }
    let mut end = today + Duration::days(horizon);
    if let Some(ends_on) = template.ends_on {
        end = end.min(ends_on);
    }

    let mut outcome = GenerationOutcome::default();
    if start > end {
        txn.commit().await?;
        return Ok(outcome);
    }

    let mut credits = match template.subscription_id {
        Some(subscription_id) => subscriptions.sessions_remaining(subscription_id).await?,
        None => None,
    };
    let mut existing =
        session::Model::count_non_cancelled_for_template(&txn, template_id).await?;

    let mut day = start;
    while day <= end {
        for slot in template.weekly_slots.for_day(day) {
            let start_time = match slot.start_naive_time() {
                Ok(t) => t,
                Err(e) => {
                    warn!("Template {} has a malformed slot: {}", template_id, e);
                    continue;
                }
            };
            let scheduled_at = day.and_time(start_time).and_utc();

            // Never materialize a session that would already have started.
            if scheduled_at <= now {
                continue;
            }

            if session::Model::exists_non_cancelled_at(&txn, template_id, scheduled_at).await? {
                outcome.skipped_existing += 1;
                continue;
            }

            if let Some(max) = template.max_sessions {
                if existing >= max as u64 {
                    outcome.skipped_capacity += 1;
                    continue;
                }
            }
            if credits == Some(0) {
                outcome.skipped_capacity += 1;
                continue;
            }

            let row = session::ActiveModel {
                academy_id: Set(template.academy_id),
                template_id: Set(Some(template.id)),
                teacher_id: Set(template.teacher_id),
                student_id: Set(None),
                circle_id: Set(template.circle_id),
                subscription_id: Set(template.subscription_id),
                kind: Set(template.session_kind.clone()),
                status: Set(SessionStatus::Scheduled),
                scheduled_at: Set(scheduled_at),
                duration_minutes: Set(template.default_duration_minutes),
                started_at: Set(None),
                ended_at: Set(None),
                actual_duration_minutes: Set(None),
                credit_consumed: Set(false),
                cancelled_at: Set(None),
                cancelled_by: Set(None),
                cancellation_reason: Set(None),
                rescheduled_from_id: Set(None),
                rescheduled_to_id: Set(None),
                created_at: Set(Utc::now()),
                updated_at: Set(Utc::now()),
                ..Default::default()
            };

            let prefix = template.session_kind.code_prefix();
            match insert_with_code(&txn, row, prefix, template.academy_id).await {
                Ok(_) => {
                    outcome.created += 1;
                    existing += 1;
                    if let Some(ref mut remaining) = credits {
                        *remaining -= 1;
                    }
                }
                Err(e) => {
                    error!(
                        "Failed to create session at {} for template {}: {}",
                        scheduled_at, template_id, e
                    );
                }
            }
        }
        day += Duration::days(1);
    }

    schedule_template::Model::set_last_generated(&txn, template_id, end).await?;
    txn.commit().await?;

    info!(
        "Generated {} sessions for template {} through {} ({} existing, {} over capacity)",
        outcome.created, template_id, end, outcome.skipped_existing, outcome.skipped_capacity
    );
    Ok(outcome)
}

/// Runs generation for every live template, topping each rolling horizon up
/// to today plus its configured lead. Per-template failures are logged and
/// counted, never fatal to the batch.
pub async fn generate_all_due<S: SubscriptionGateway>(
    db: &DatabaseConnection,
    now: DateTime<Utc>,
    subscriptions: &S,
) -> SchedulingResult<BatchGenerationOutcome> {
    let due = schedule_template::Model::find_due_for_generation(db, now.date_naive()).await?;

    let mut outcome = BatchGenerationOutcome {
        templates: due.len(),
        ..Default::default()
    };
    for template in due {
        match generate_upcoming(db, template.id, None, now, subscriptions).await {
            Ok(o) => outcome.created += o.created,
            Err(e) => {
                error!("Generation failed for template {}: {}", template.id, e);
                outcome.failed += 1;
            }
        }
    }

    info!(
        "Generation batch: {} templates due, {} sessions created, {} failed",
        outcome.templates, outcome.created, outcome.failed
    );
    Ok(outcome)
}

#[derive(Debug, Clone, Validate)]
pub struct NewSession {
    pub academy_id: i64,
    pub teacher_id: i64,
    pub student_id: Option<i64>,
    pub circle_id: Option<i64>,
    pub subscription_id: Option<i64>,
    pub kind: SessionKind,
    pub scheduled_at: DateTime<Utc>,
    #[validate(range(min = 1, message = "Session duration must be at least one minute"))]
    pub duration_minutes: i32,
}

/// One-off session outside any template, e.g. a trial or makeup lesson.
pub async fn create_session(
    db: &DatabaseConnection,
    params: NewSession,
) -> SchedulingResult<session::Model> {
    params
        .validate()
        .map_err(|e| SchedulingError::Validation(common::format_validation_errors(&e)))?;

    let txn = db.begin().await?;

    let now = Utc::now();
    let row = session::ActiveModel {
        academy_id: Set(params.academy_id),
        template_id: Set(None),
        teacher_id: Set(params.teacher_id),
        student_id: Set(params.student_id),
        circle_id: Set(params.circle_id),
        subscription_id: Set(params.subscription_id),
        kind: Set(params.kind.clone()),
        status: Set(SessionStatus::Scheduled),
        scheduled_at: Set(params.scheduled_at),
        duration_minutes: Set(params.duration_minutes),
        started_at: Set(None),
        ended_at: Set(None),
        actual_duration_minutes: Set(None),
        credit_consumed: Set(false),
        cancelled_at: Set(None),
        cancelled_by: Set(None),
        cancellation_reason: Set(None),
        rescheduled_from_id: Set(None),
        rescheduled_to_id: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    };

    let session =
        insert_with_code(&txn, row, params.kind.code_prefix(), params.academy_id).await?;
    txn.commit().await?;

    info!(
        "Created session {} ({}) at {}",
        session.id, session.session_code, session.scheduled_at
    );
    Ok(session)
}

/// Inserts a session with a freshly minted `{prefix}-{academy}-{seq}` code.
/// The unique index on `session_code` backstops concurrent mints; collisions
/// bump the sequence, and a persistent collision falls back to a timestamped
/// code rather than failing the insert.
pub(crate) async fn insert_with_code<C: ConnectionTrait>(
    db: &C,
    mut row: session::ActiveModel,
    prefix: &str,
    academy_id: i64,
) -> Result<session::Model, DbErr> {
    let mut seq = next_code_sequence(db, prefix, academy_id).await?;

    for _ in 0..MAX_CODE_ATTEMPTS {
        row.session_code = Set(format!("{}-{}-{:06}", prefix, academy_id, seq));
        match row.clone().insert(db).await {
            Ok(model) => return Ok(model),
            Err(e) if is_unique_violation(&e) => seq += 1,
            Err(e) => return Err(e),
        }
    }

    warn!(
        "Session code sequence for {}-{} is contended, falling back to timestamped code",
        prefix, academy_id
    );
    row.session_code = Set(format!(
        "{}-{}-{:06}-{}",
        prefix,
        academy_id,
        seq,
        Utc::now().timestamp_millis()
    ));
    row.insert(db).await
}

/// Next sequence number for an owner's code series. Counts every existing
/// session, including cancelled and soft-deleted ones, so numbers are never
/// reused.
async fn next_code_sequence<C: ConnectionTrait>(
    db: &C,
    prefix: &str,
    academy_id: i64,
) -> Result<u64, DbErr> {
    let pattern = format!("{}-{}-%", prefix, academy_id);
    let codes = session::Model::find_codes_like(db, &pattern).await?;

    let max = codes
        .iter()
        .filter_map(|code| parse_code_sequence(code))
        .max()
        .unwrap_or(0);
    Ok(max + 1)
}

/// Only plain three-segment codes carry a sequence; timestamped fallback
/// codes never rejoin the series.
fn parse_code_sequence(code: &str) -> Option<u64> {
    match code.split('-').collect::<Vec<_>>().as_slice() {
        [_prefix, _academy, seq] => seq.parse().ok(),
        _ => None,
    }
}

pub(crate) fn is_unique_violation(err: &DbErr) -> bool {
    matches!(
        err.sql_err(),
        Some(sea_orm::SqlErr::UniqueConstraintViolation(_))
    )
}
