use chrono::{DateTime, Duration, Utc};
use log::{error, info, warn};
use sea_orm::ActiveValue::Set;
use sea_orm::{
    ActiveModelTrait, ConnectionTrait, DatabaseConnection, EntityTrait, TransactionTrait,
};

use db::models::meeting_attendance;
use db::models::schedule_template;
use db::models::session::{self, SessionStatus};

use crate::attendance_resolver;
use crate::error::{SchedulingError, SchedulingResult};
use crate::session_generator::insert_with_code;
use crate::subscriptions::SubscriptionGateway;
use crate::{AttendancePolicy, SchedulePolicy};

pub(crate) async fn load_session<C: ConnectionTrait>(
    db: &C,
    session_id: i64,
) -> SchedulingResult<session::Model> {
    session::Entity::find_by_id(session_id)
        .one(db)
        .await?
        .ok_or(SchedulingError::SessionNotFound(session_id))
}

fn guard_transition(from: SessionStatus, to: SessionStatus) -> SchedulingResult<()> {
    if from.can_transition(to) {
        Ok(())
    } else {
        Err(SchedulingError::InvalidTransition { from, to })
    }
}

/// Explicit start, for flows where the platform opens the meeting itself
/// rather than waiting for the first join signal.
pub async fn start_session(
    db: &DatabaseConnection,
    session_id: i64,
    at: DateTime<Utc>,
) -> SchedulingResult<session::Model> {
    let txn = db.begin().await?;
    let session = load_session(&txn, session_id).await?;
    guard_transition(session.status, SessionStatus::Ongoing)?;

    let mut active_model: session::ActiveModel = session.into();
    active_model.status = Set(SessionStatus::Ongoing);
    active_model.started_at = Set(Some(at));
    active_model.updated_at = Set(Utc::now());
    let session = active_model.update(&txn).await?;

    txn.commit().await?;
    info!("Session {} started at {}", session_id, at);
    Ok(session)
}

/// Completes an ongoing session, settles every participant's attendance
/// report, and signals credit consumption to the subscription collaborator.
/// A failing credit signal is logged and retried by the operator, never a
/// reason to unwind the completion.
pub async fn complete_session<S: SubscriptionGateway>(
    db: &DatabaseConnection,
    session_id: i64,
    at: DateTime<Utc>,
    roster: &[i64],
    policy: &AttendancePolicy,
    subscriptions: &S,
) -> SchedulingResult<session::Model> {
    let txn = db.begin().await?;
    let session = load_session(&txn, session_id).await?;
    guard_transition(session.status, SessionStatus::Completed)?;

    let started_at = session.started_at.unwrap_or(session.scheduled_at);
    if at < started_at {
        return Err(SchedulingError::Validation(
            "Session end time precedes its start".to_owned(),
        ));
    }

    let mut active_model: session::ActiveModel = session.into();
    active_model.status = Set(SessionStatus::Completed);
    active_model.ended_at = Set(Some(at));
    active_model.actual_duration_minutes = Set(Some((at - started_at).num_minutes() as i32));
    active_model.updated_at = Set(Utc::now());
    let mut completed = active_model.update(&txn).await?;
    txn.commit().await?;

    attendance_resolver::finalize_session(db, session_id, roster, policy, at).await?;

    if let Some(subscription_id) = completed.subscription_id {
        if !completed.credit_consumed {
            match subscriptions.consume_credit(subscription_id, session_id).await {
                Ok(()) => {
                    let mut active_model: session::ActiveModel = completed.clone().into();
                    active_model.credit_consumed = Set(true);
                    active_model.updated_at = Set(Utc::now());
                    completed = active_model.update(db).await?;
                }
                Err(e) => {
                    warn!(
                        "Credit consumption signal failed for session {}: {}",
                        session_id, e
                    );
                }
            }
        }
    }

    info!(
        "Session {} completed, {} minutes actual",
        session_id,
        completed.actual_duration_minutes.unwrap_or(0)
    );
    Ok(completed)
}

/// Cancels a scheduled or ongoing session. Non-admin callers must respect the
/// notice window (the template's, or the policy default for one-off
/// sessions). A consumed credit is handed back through the gateway.
pub async fn cancel_session<S: SubscriptionGateway>(
    db: &DatabaseConnection,
    session_id: i64,
    reason: &str,
    actor_id: i64,
    is_admin: bool,
    now: DateTime<Utc>,
    policy: &SchedulePolicy,
    subscriptions: &S,
) -> SchedulingResult<session::Model> {
    let txn = db.begin().await?;
    let session = load_session(&txn, session_id).await?;
    guard_transition(session.status, SessionStatus::Cancelled)?;

    if !is_admin {
        let hours = notice_hours(&txn, &session, policy).await?;
        if now + Duration::hours(hours) > session.scheduled_at {
            return Err(SchedulingError::NoticeWindow { hours });
        }
    }

    let mut active_model: session::ActiveModel = session.into();
    active_model.status = Set(SessionStatus::Cancelled);
    active_model.cancelled_at = Set(Some(now));
    active_model.cancelled_by = Set(Some(actor_id));
    active_model.cancellation_reason = Set(Some(reason.to_owned()));
    active_model.updated_at = Set(Utc::now());
    let mut cancelled = active_model.update(&txn).await?;
    txn.commit().await?;

    if cancelled.credit_consumed {
        if let Some(subscription_id) = cancelled.subscription_id {
            match subscriptions.return_credit(subscription_id, session_id).await {
                Ok(()) => {
                    let mut active_model: session::ActiveModel = cancelled.clone().into();
                    active_model.credit_consumed = Set(false);
                    active_model.updated_at = Set(Utc::now());
                    cancelled = active_model.update(db).await?;
                }
                Err(e) => {
                    warn!(
                        "Credit return signal failed for session {}: {}",
                        session_id, e
                    );
                }
            }
        }
    }

    info!("Session {} cancelled by {}", session_id, actor_id);
    Ok(cancelled)
}

/// Moves a scheduled session to a new time by minting a replacement and
/// retiring the original. The two stay linked so makeup lessons remain
/// traceable to what they replace. Any consumed credit follows the
/// replacement.
pub async fn reschedule_session(
    db: &DatabaseConnection,
    session_id: i64,
    new_time: DateTime<Utc>,
    reason: &str,
    actor_id: i64,
    is_admin: bool,
    now: DateTime<Utc>,
    policy: &SchedulePolicy,
) -> SchedulingResult<(session::Model, session::Model)> {
    let txn = db.begin().await?;
    let original = load_session(&txn, session_id).await?;
    guard_transition(original.status, SessionStatus::Rescheduled)?;

    if new_time <= now {
        return Err(SchedulingError::Validation(
            "Rescheduled time must be in the future".to_owned(),
        ));
    }
    if !is_admin {
        let hours = notice_hours(&txn, &original, policy).await?;
        if now + Duration::hours(hours) > original.scheduled_at {
            return Err(SchedulingError::NoticeWindow { hours });
        }
    }
    if let Some(template_id) = original.template_id {
        if session::Model::exists_non_cancelled_at(&txn, template_id, new_time).await? {
            return Err(SchedulingError::Validation(
                "A session already occupies the new time".to_owned(),
            ));
        }
    }

    let created = Utc::now();
    let replacement_row = session::ActiveModel {
        academy_id: Set(original.academy_id),
        template_id: Set(original.template_id),
        teacher_id: Set(original.teacher_id),
        student_id: Set(original.student_id),
        circle_id: Set(original.circle_id),
        subscription_id: Set(original.subscription_id),
        kind: Set(original.kind.clone()),
        status: Set(SessionStatus::Scheduled),
        scheduled_at: Set(new_time),
        duration_minutes: Set(original.duration_minutes),
        started_at: Set(None),
        ended_at: Set(None),
        actual_duration_minutes: Set(None),
        credit_consumed: Set(original.credit_consumed),
        cancelled_at: Set(None),
        cancelled_by: Set(None),
        cancellation_reason: Set(None),
        rescheduled_from_id: Set(Some(original.id)),
        rescheduled_to_id: Set(None),
        created_at: Set(created),
        updated_at: Set(created),
        ..Default::default()
    };
    let replacement = insert_with_code(
        &txn,
        replacement_row,
        original.kind.code_prefix(),
        original.academy_id,
    )
    .await?;

    // The termination metadata columns double as the reschedule audit trail;
    // the status tells the two apart.
    let mut active_model: session::ActiveModel = original.into();
    active_model.status = Set(SessionStatus::Rescheduled);
    active_model.rescheduled_to_id = Set(Some(replacement.id));
    active_model.credit_consumed = Set(false);
    active_model.cancelled_at = Set(Some(now));
    active_model.cancelled_by = Set(Some(actor_id));
    active_model.cancellation_reason = Set(Some(reason.to_owned()));
    active_model.updated_at = Set(Utc::now());
    let original = active_model.update(&txn).await?;

    txn.commit().await?;
    info!(
        "Session {} rescheduled to {} as {}",
        session_id, new_time, replacement.session_code
    );
    Ok((original, replacement))
}

/// Marks scheduled sessions as missed once their window plus the post-session
/// buffer has passed with no join signal at all. Per-session failures are
/// logged and skipped so one bad row cannot stall the sweep.
pub async fn sweep_missed(
    db: &DatabaseConnection,
    now: DateTime<Utc>,
    policy: &AttendancePolicy,
) -> SchedulingResult<usize> {
    let candidates = session::Model::find_scheduled_before(db, now).await?;

    let mut swept = 0;
    for candidate in candidates {
        let deadline =
            candidate.scheduled_end() + Duration::minutes(policy.post_session_buffer_minutes);
        if now <= deadline {
            continue;
        }
        match sweep_one_missed(db, candidate.id).await {
            Ok(true) => swept += 1,
            Ok(false) => {}
            Err(e) => error!("Missed sweep failed for session {}: {}", candidate.id, e),
        }
    }

    if swept > 0 {
        info!("Swept {} never-started sessions to missed", swept);
    }
    Ok(swept)
}

async fn sweep_one_missed(db: &DatabaseConnection, session_id: i64) -> SchedulingResult<bool> {
    let txn = db.begin().await?;
    let session = load_session(&txn, session_id).await?;
    if session.status != SessionStatus::Scheduled {
        return Ok(false);
    }

    // A session with any join signal started; it belongs to the
    // auto-complete sweep, not this one.
    let records = meeting_attendance::Model::find_for_session(&txn, session.id).await?;
    if records.iter().any(|r| r.first_join_at.is_some()) {
        return Ok(false);
    }

    let mut active_model: session::ActiveModel = session.into();
    active_model.status = Set(SessionStatus::Missed);
    active_model.updated_at = Set(Utc::now());
    active_model.update(&txn).await?;
    txn.commit().await?;
    Ok(true)
}

/// Completes ongoing sessions whose teacher never ended them. The end time is
/// pinned to the nominal window end, not the sweep time, so stragglers do not
/// inflate durations.
pub async fn sweep_auto_complete<S: SubscriptionGateway>(
    db: &DatabaseConnection,
    now: DateTime<Utc>,
    policy: &AttendancePolicy,
    subscriptions: &S,
) -> SchedulingResult<usize> {
    let candidates = session::Model::find_ongoing_before(db, now).await?;

    let mut swept = 0;
    for candidate in candidates {
        let deadline =
            candidate.scheduled_end() + Duration::minutes(policy.auto_complete_buffer_minutes);
        if now < deadline {
            continue;
        }

        let ended_at = match candidate.started_at {
            Some(started) => candidate.scheduled_end().max(started),
            None => candidate.scheduled_end(),
        };
        match complete_session(db, candidate.id, ended_at, &[], policy, subscriptions).await {
            Ok(_) => {
                swept += 1;
                info!("Auto-completed session {} at {}", candidate.id, ended_at);
            }
            Err(e) => error!("Auto-complete failed for session {}: {}", candidate.id, e),
        }
    }
    Ok(swept)
}

async fn notice_hours<C: ConnectionTrait>(
    db: &C,
    session: &session::Model,
    policy: &SchedulePolicy,
) -> SchedulingResult<i64> {
    if let Some(template_id) = session.template_id {
        if let Some(template) = schedule_template::Entity::find_by_id(template_id).one(db).await? {
            return Ok(template.cancel_notice_hours as i64);
        }
    }
    Ok(policy.cancel_notice_hours)
}
