use chrono::{DateTime, Utc};
use log::{info, warn};
use sea_orm::ActiveValue::Set;
use sea_orm::{ActiveModelTrait, DatabaseConnection, TransactionTrait};

use db::models::meeting_attendance::{self, ParticipantRole};
use db::models::session::{self, SessionStatus};

use crate::error::SchedulingResult;
use crate::session_generator::is_unique_violation;
use crate::session_lifecycle::load_session;
use crate::AttendancePolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// A new presence cycle was opened.
    Joined,
    /// The participant already had an open cycle; nothing changed.
    AlreadyJoined,
    /// The rejoin landed inside the reconnect window and was merged into the
    /// previous cycle.
    Reconnected,
    /// The session is already in a terminal state; the event was dropped.
    SessionClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    Left { cycle_minutes: i64 },
    /// No open cycle to close; the event was logged and dropped.
    NotJoined,
}

/// Handles a meeting join signal. Idempotent: a second join while a cycle is
/// open changes nothing. The first join of a scheduled session flips it to
/// ongoing.
pub async fn record_join(
    db: &DatabaseConnection,
    session_id: i64,
    participant_id: i64,
    at: DateTime<Utc>,
    policy: &AttendancePolicy,
) -> SchedulingResult<JoinOutcome> {
    let txn = db.begin().await?;
    let session = load_session(&txn, session_id).await?;

    if session.status.is_terminal() {
        warn!(
            "Dropping join for participant {} in session {}: status is {}",
            participant_id, session_id, session.status
        );
        return Ok(JoinOutcome::SessionClosed);
    }

    let record =
        match meeting_attendance::Model::find_one(&txn, session_id, participant_id).await? {
            Some(record) => record,
            None => {
                let role = if participant_id == session.teacher_id {
                    ParticipantRole::Teacher
                } else {
                    ParticipantRole::Student
                };
                match meeting_attendance::Model::create(&txn, session_id, participant_id, role)
                    .await
                {
                    Ok(record) => record,
                    // Lost a create race; the winner's row is the record.
                    Err(e) if is_unique_violation(&e) => {
                        meeting_attendance::Model::find_one(&txn, session_id, participant_id)
                            .await?
                            .ok_or(e)?
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };

    if record.cycles.has_open() {
        return Ok(JoinOutcome::AlreadyJoined);
    }

    let mut cycles = record.cycles.clone();
    let mut join_count = record.join_count;
    let mut leave_count = record.leave_count;

    let merge_into_last = policy.reconnect_threshold_seconds > 0
        && cycles.last().and_then(|c| c.left_at).is_some_and(|left| {
            let gap = (at - left).num_seconds();
            (0..=policy.reconnect_threshold_seconds).contains(&gap)
        });

    let outcome = if merge_into_last && cycles.reopen_last() {
        leave_count = (leave_count - 1).max(0);
        JoinOutcome::Reconnected
    } else {
        cycles.push_open(at);
        join_count += 1;
        JoinOutcome::Joined
    };

    let mut active_model: meeting_attendance::ActiveModel = record.clone().into();
    active_model.cycles = Set(cycles.clone());
    active_model.first_join_at = Set(record.first_join_at.or(Some(at)));
    active_model.last_leave_at = Set(cycles.last_left_at());
    active_model.total_duration_minutes = Set(cycles.total_closed_minutes() as i32);
    active_model.join_count = Set(join_count);
    active_model.leave_count = Set(leave_count);
    active_model.updated_at = Set(Utc::now());
    active_model.update(&txn).await?;

    if session.status == SessionStatus::Scheduled {
        let mut session_model: session::ActiveModel = session.into();
        session_model.status = Set(SessionStatus::Ongoing);
        session_model.started_at = Set(Some(at));
        session_model.updated_at = Set(Utc::now());
        session_model.update(&txn).await?;
        info!("Session {} started by first join at {}", session_id, at);
    }

    txn.commit().await?;
    Ok(outcome)
}

/// Handles a meeting leave signal. A leave with no matching open cycle is a
/// warning, not an error; meeting providers deliver duplicates and reorderings
/// as a matter of course.
pub async fn record_leave(
    db: &DatabaseConnection,
    session_id: i64,
    participant_id: i64,
    at: DateTime<Utc>,
) -> SchedulingResult<LeaveOutcome> {
    let txn = db.begin().await?;
    load_session(&txn, session_id).await?;

    let record =
        match meeting_attendance::Model::find_one(&txn, session_id, participant_id).await? {
            Some(record) => record,
            None => {
                warn!(
                    "Dropping leave for participant {} in session {}: never joined",
                    participant_id, session_id
                );
                return Ok(LeaveOutcome::NotJoined);
            }
        };

    let mut cycles = record.cycles.clone();
    let minutes = match cycles.close_open(at) {
        Some(minutes) => minutes,
        None => {
            warn!(
                "Dropping leave for participant {} in session {}: no open cycle",
                participant_id, session_id
            );
            return Ok(LeaveOutcome::NotJoined);
        }
    };

    let mut active_model: meeting_attendance::ActiveModel = record.clone().into();
    active_model.cycles = Set(cycles.clone());
    active_model.last_leave_at = Set(cycles.last_left_at());
    active_model.total_duration_minutes = Set(cycles.total_closed_minutes() as i32);
    active_model.leave_count = Set(record.leave_count + 1);
    active_model.updated_at = Set(Utc::now());
    active_model.update(&txn).await?;

    txn.commit().await?;
    Ok(LeaveOutcome::Left {
        cycle_minutes: minutes,
    })
}

/// Presence accumulated so far, counting a still-open cycle up to `now`.
/// Zero when the participant never joined.
pub async fn current_duration(
    db: &DatabaseConnection,
    session_id: i64,
    participant_id: i64,
    now: DateTime<Utc>,
) -> SchedulingResult<i64> {
    let record = meeting_attendance::Model::find_one(db, session_id, participant_id).await?;
    Ok(record.map(|r| r.current_duration(now)).unwrap_or(0))
}
