use chrono::{DateTime, Duration, Utc};
use log::{error, info, warn};
use sea_orm::ActiveValue::Set;
use sea_orm::{ActiveModelTrait, ConnectionTrait, DatabaseConnection, TransactionTrait};
use std::collections::BTreeSet;

use db::models::attendance_report::{self, AttendanceStatus};
use db::models::meeting_attendance;
use db::models::session::{self, SessionStatus};

use crate::error::{SchedulingError, SchedulingResult};
use crate::session_lifecycle::load_session;
use crate::AttendancePolicy;

/// Everything the attendance calculation needs, detached from storage so the
/// rule is testable as a plain function.
#[derive(Debug, Clone)]
pub struct ResolveInput {
    pub scheduled_at: DateTime<Utc>,
    pub duration_minutes: i32,
    pub grace_minutes: i64,
    pub first_join_at: Option<DateTime<Utc>>,
    pub total_duration_minutes: i64,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Resolution {
    pub status: AttendanceStatus,
    pub attendance_percentage: f64,
    pub is_late: bool,
    pub late_minutes: i64,
}

/// The attendance rule.
///
/// Presence is the summed cycle minutes over the scheduled duration, capped
/// at 100 and rounded to two decimals. Full presence is attended no matter
/// when the join came. Otherwise a join after the grace window needs 95% for
/// late (80% salvages partial), while an on-time join needs 80% for attended
/// and 30% for partial. No join at all is absent.
pub fn resolve(input: &ResolveInput) -> Resolution {
    let first_join = match input.first_join_at {
        Some(at) => at,
        None => {
            return Resolution {
                status: AttendanceStatus::Absent,
                attendance_percentage: 0.0,
                is_late: false,
                late_minutes: 0,
            }
        }
    };

    let percentage = if input.duration_minutes <= 0 {
        0.0
    } else {
        let raw =
            input.total_duration_minutes as f64 / input.duration_minutes as f64 * 100.0;
        (raw.min(100.0) * 100.0).round() / 100.0
    };

    let grace_cutoff = input.scheduled_at + Duration::minutes(input.grace_minutes);
    let is_late = first_join > grace_cutoff;
    let late_minutes = (first_join - input.scheduled_at).num_minutes().max(0);

    let status = if percentage >= 100.0 {
        AttendanceStatus::Attended
    } else if is_late {
        if percentage >= 95.0 {
            AttendanceStatus::Late
        } else if percentage >= 80.0 {
            AttendanceStatus::Partial
        } else {
            AttendanceStatus::Absent
        }
    } else if percentage >= 80.0 {
        AttendanceStatus::Attended
    } else if percentage >= 30.0 {
        AttendanceStatus::Partial
    } else {
        AttendanceStatus::Absent
    };

    Resolution {
        status,
        attendance_percentage: percentage,
        is_late,
        late_minutes,
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Serialize)]
pub struct FinalizeOutcome {
    pub evaluated: usize,
    pub overridden: usize,
    pub failed: usize,
    /// Whether the session had reached a settled state, making the written
    /// reports final rather than provisional.
    pub settled: bool,
}

/// A session's attendance settles once it is completed or missed, or once an
/// ongoing session has run past its nominal end. Anything earlier yields
/// provisional reports.
fn session_is_settled(session: &session::Model, now: DateTime<Utc>) -> bool {
    match session.status {
        SessionStatus::Completed | SessionStatus::Missed => true,
        SessionStatus::Ongoing => now >= session.scheduled_end(),
        _ => false,
    }
}

fn effective_end(session: &session::Model) -> DateTime<Utc> {
    session.ended_at.unwrap_or_else(|| session.scheduled_end())
}

/// Evaluates one participant's report. A manual override short-circuits the
/// calculation entirely; nothing automated ever touches an overridden report.
pub async fn finalize_participant(
    db: &DatabaseConnection,
    session_id: i64,
    participant_id: i64,
    policy: &AttendancePolicy,
    now: DateTime<Utc>,
) -> SchedulingResult<attendance_report::Model> {
    let txn = db.begin().await?;
    let session = load_session(&txn, session_id).await?;

    if matches!(
        session.status,
        SessionStatus::Cancelled | SessionStatus::Rescheduled
    ) {
        return Err(SchedulingError::Validation(
            "Attendance is not evaluated for cancelled or rescheduled sessions".to_owned(),
        ));
    }

    let existing = attendance_report::Model::find_one(&txn, session_id, participant_id).await?;
    if let Some(ref report) = existing {
        if report.manual_override {
            return Ok(report.clone());
        }
    }

    let settled = session_is_settled(&session, now);
    let mut record =
        meeting_attendance::Model::find_one(&txn, session_id, participant_id).await?;

    // A participant still marked present after the session settled left
    // without a leave signal; close the cycle at the effective end.
    if settled {
        if let Some(ref r) = record {
            if r.cycles.has_open() {
                record =
                    Some(close_stale_cycle(&txn, r.clone(), effective_end(&session)).await?);
            }
        }
    }

    let (first_join_at, attended_minutes) = match record {
        Some(ref r) => (r.first_join_at, r.total_duration_minutes as i64),
        None => (None, 0),
    };

    let resolution = resolve(&ResolveInput {
        scheduled_at: session.scheduled_at,
        duration_minutes: session.duration_minutes,
        grace_minutes: policy.grace_minutes,
        first_join_at,
        total_duration_minutes: attended_minutes,
    });

    let report = upsert_report(
        &txn,
        session_id,
        participant_id,
        &resolution,
        attended_minutes,
        settled,
        now,
        existing,
    )
    .await?;

    if settled {
        if let Some(r) = record {
            if !r.finalized {
                let mut active_model: meeting_attendance::ActiveModel = r.into();
                active_model.finalized = Set(true);
                active_model.updated_at = Set(Utc::now());
                active_model.update(&txn).await?;
            }
        }
    }

    txn.commit().await?;
    Ok(report)
}

/// Evaluates reports for everyone who appeared in the meeting plus everyone
/// expected from the roster, so no-shows surface as absences. Per-participant
/// failures are logged and counted, never fatal.
pub async fn finalize_session(
    db: &DatabaseConnection,
    session_id: i64,
    roster: &[i64],
    policy: &AttendancePolicy,
    now: DateTime<Utc>,
) -> SchedulingResult<FinalizeOutcome> {
    let session = load_session(db, session_id).await?;
    if matches!(
        session.status,
        SessionStatus::Cancelled | SessionStatus::Rescheduled
    ) {
        warn!(
            "Skipping attendance finalization for session {}: status is {}",
            session_id, session.status
        );
        return Ok(FinalizeOutcome::default());
    }

    let mut participants: BTreeSet<i64> = roster.iter().copied().collect();
    for record in meeting_attendance::Model::find_for_session(db, session_id).await? {
        participants.insert(record.participant_id);
    }

    let mut outcome = FinalizeOutcome {
        settled: session_is_settled(&session, now),
        ..Default::default()
    };
    for participant_id in participants {
        match finalize_participant(db, session_id, participant_id, policy, now).await {
            Ok(report) => {
                outcome.evaluated += 1;
                if report.manual_override {
                    outcome.overridden += 1;
                }
            }
            Err(e) => {
                error!(
                    "Failed to finalize participant {} in session {}: {}",
                    participant_id, session_id, e
                );
                outcome.failed += 1;
            }
        }
    }

    info!(
        "Evaluated {} reports for session {} ({} overridden, {} failed, settled: {})",
        outcome.evaluated, session_id, outcome.overridden, outcome.failed, outcome.settled
    );
    Ok(outcome)
}

/// Live attendance standing without touching storage. Counts an open cycle up
/// to `now`, so dashboards can show where a participant stands mid-session.
pub async fn provisional_status(
    db: &DatabaseConnection,
    session_id: i64,
    participant_id: i64,
    policy: &AttendancePolicy,
    now: DateTime<Utc>,
) -> SchedulingResult<Resolution> {
    let session = load_session(db, session_id).await?;
    let record = meeting_attendance::Model::find_one(db, session_id, participant_id).await?;

    let (first_join_at, total) = match record {
        Some(ref r) => (r.first_join_at, r.current_duration(now)),
        None => (None, 0),
    };

    Ok(resolve(&ResolveInput {
        scheduled_at: session.scheduled_at,
        duration_minutes: session.duration_minutes,
        grace_minutes: policy.grace_minutes,
        first_join_at,
        total_duration_minutes: total,
    }))
}

/// Pins a participant's status by hand. The computed percentage and lateness
/// stay on the report for reference; only the status is decreed.
pub async fn override_attendance(
    db: &DatabaseConnection,
    session_id: i64,
    participant_id: i64,
    status: AttendanceStatus,
    reason: &str,
    actor_id: i64,
    now: DateTime<Utc>,
) -> SchedulingResult<attendance_report::Model> {
    let txn = db.begin().await?;
    load_session(&txn, session_id).await?;

    let existing = attendance_report::Model::find_one(&txn, session_id, participant_id).await?;
    let report = match existing {
        Some(report) => {
            let mut active_model: attendance_report::ActiveModel = report.into();
            active_model.status = Set(status);
            active_model.manual_override = Set(true);
            active_model.override_by = Set(Some(actor_id));
            active_model.override_reason = Set(Some(reason.to_owned()));
            active_model.overridden_at = Set(Some(now));
            active_model.finalized = Set(true);
            active_model.updated_at = Set(Utc::now());
            active_model.update(&txn).await?
        }
        None => {
            let created = Utc::now();
            attendance_report::ActiveModel {
                session_id: Set(session_id),
                participant_id: Set(participant_id),
                status: Set(status),
                attendance_percentage: Set(0.0),
                attended_minutes: Set(0),
                is_late: Set(false),
                late_minutes: Set(0),
                manual_override: Set(true),
                override_by: Set(Some(actor_id)),
                override_reason: Set(Some(reason.to_owned())),
                overridden_at: Set(Some(now)),
                finalized: Set(true),
                evaluated_at: Set(Some(now)),
                created_at: Set(created),
                updated_at: Set(created),
                ..Default::default()
            }
            .insert(&txn)
            .await?
        }
    };

    txn.commit().await?;
    info!(
        "Attendance for participant {} in session {} overridden to {} by {}",
        participant_id, session_id, status, actor_id
    );
    Ok(report)
}

/// Lifts a manual override and puts the report back under automated
/// evaluation, recomputing it immediately where the session still allows.
pub async fn revert_override(
    db: &DatabaseConnection,
    session_id: i64,
    participant_id: i64,
    policy: &AttendancePolicy,
    now: DateTime<Utc>,
) -> SchedulingResult<attendance_report::Model> {
    let txn = db.begin().await?;
    let session = load_session(&txn, session_id).await?;

    let report = attendance_report::Model::find_one(&txn, session_id, participant_id)
        .await?
        .ok_or(SchedulingError::ReportNotFound {
            session_id,
            participant_id,
        })?;

    let mut active_model: attendance_report::ActiveModel = report.into();
    active_model.manual_override = Set(false);
    active_model.override_by = Set(None);
    active_model.override_reason = Set(None);
    active_model.overridden_at = Set(None);
    active_model.updated_at = Set(Utc::now());
    let cleared = active_model.update(&txn).await?;
    txn.commit().await?;

    info!(
        "Attendance override lifted for participant {} in session {}",
        participant_id, session_id
    );

    if matches!(
        session.status,
        SessionStatus::Cancelled | SessionStatus::Rescheduled
    ) {
        return Ok(cleared);
    }
    finalize_participant(db, session_id, participant_id, policy, now).await
}

/// Rebuilds every record's aggregates from its raw cycles and re-evaluates
/// the session. The escape hatch for webhook mishaps: the cycle log is the
/// source of truth, everything else is derived.
pub async fn recalculate_session(
    db: &DatabaseConnection,
    session_id: i64,
    roster: &[i64],
    policy: &AttendancePolicy,
    now: DateTime<Utc>,
) -> SchedulingResult<FinalizeOutcome> {
    let records = meeting_attendance::Model::find_for_session(db, session_id).await?;
    let rebuilt = records.len();

    for record in records {
        let cycles = record.cycles.clone();
        let closed = cycles.0.iter().filter(|c| !c.is_open()).count();

        let mut active_model: meeting_attendance::ActiveModel = record.into();
        active_model.first_join_at = Set(cycles.first_joined_at());
        active_model.last_leave_at = Set(cycles.last_left_at());
        active_model.total_duration_minutes = Set(cycles.total_closed_minutes() as i32);
        active_model.join_count = Set(cycles.len() as i32);
        active_model.leave_count = Set(closed as i32);
        active_model.finalized = Set(false);
        active_model.updated_at = Set(Utc::now());
        active_model.update(db).await?;
    }

    info!(
        "Rebuilt {} attendance records for session {}",
        rebuilt, session_id
    );
    finalize_session(db, session_id, roster, policy, now).await
}

async fn close_stale_cycle<C: ConnectionTrait>(
    db: &C,
    record: meeting_attendance::Model,
    end: DateTime<Utc>,
) -> SchedulingResult<meeting_attendance::Model> {
    let mut cycles = record.cycles.clone();
    let close_at = match cycles.open_index() {
        Some(idx) => end.max(cycles.0[idx].joined_at),
        None => return Ok(record),
    };
    cycles.close_open(close_at);

    info!(
        "Closed stale cycle for participant {} in session {} at {}",
        record.participant_id, record.session_id, close_at
    );

    let mut active_model: meeting_attendance::ActiveModel = record.clone().into();
    active_model.cycles = Set(cycles.clone());
    active_model.last_leave_at = Set(cycles.last_left_at());
    active_model.total_duration_minutes = Set(cycles.total_closed_minutes() as i32);
    active_model.leave_count = Set(record.leave_count + 1);
    active_model.updated_at = Set(Utc::now());
    Ok(active_model.update(db).await?)
}

#[allow(clippy::too_many_arguments)]
async fn upsert_report<C: ConnectionTrait>(
    db: &C,
    session_id: i64,
    participant_id: i64,
    resolution: &Resolution,
    attended_minutes: i64,
    settled: bool,
    now: DateTime<Utc>,
    existing: Option<attendance_report::Model>,
) -> SchedulingResult<attendance_report::Model> {
    let report = match existing {
        Some(report) => {
            // Finalized is one-way; a provisional rerun never demotes it.
            let finalized = report.finalized || settled;
            let mut active_model: attendance_report::ActiveModel = report.into();
            active_model.status = Set(resolution.status);
            active_model.attendance_percentage = Set(resolution.attendance_percentage);
            active_model.attended_minutes = Set(attended_minutes as i32);
            active_model.is_late = Set(resolution.is_late);
            active_model.late_minutes = Set(resolution.late_minutes as i32);
            active_model.finalized = Set(finalized);
            active_model.evaluated_at = Set(Some(now));
            active_model.updated_at = Set(Utc::now());
            active_model.update(db).await?
        }
        None => {
            let created = Utc::now();
            attendance_report::ActiveModel {
                session_id: Set(session_id),
                participant_id: Set(participant_id),
                status: Set(resolution.status),
                attendance_percentage: Set(resolution.attendance_percentage),
                attended_minutes: Set(attended_minutes as i32),
                is_late: Set(resolution.is_late),
                late_minutes: Set(resolution.late_minutes as i32),
                manual_override: Set(false),
                override_by: Set(None),
                override_reason: Set(None),
                overridden_at: Set(None),
                finalized: Set(settled),
                evaluated_at: Set(Some(now)),
                created_at: Set(created),
                updated_at: Set(created),
                ..Default::default()
            }
            .insert(db)
            .await?
        }
    };
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use db::models::session::SessionKind;
    use db::test_utils::setup_test_db;

    use crate::attendance_tracker;
    use crate::session_generator::{self, NewSession};

    const TEACHER: i64 = 10;
    const STUDENT: i64 = 55;

    fn ts(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 14, h, m, 0).unwrap()
    }

    fn input(first_join: Option<DateTime<Utc>>, total: i64) -> ResolveInput {
        ResolveInput {
            scheduled_at: ts(10, 0),
            duration_minutes: 60,
            grace_minutes: 15,
            first_join_at: first_join,
            total_duration_minutes: total,
        }
    }

    #[test]
    fn on_time_join_with_most_of_the_hour_is_attended() {
        // Joined five minutes in, present 55 of 60 minutes.
        let r = resolve(&input(Some(ts(10, 5)), 55));
        assert_eq!(r.status, AttendanceStatus::Attended);
        assert_eq!(r.attendance_percentage, 91.67);
        assert!(!r.is_late);
        assert_eq!(r.late_minutes, 5);
    }

    #[test]
    fn late_join_with_low_presence_is_absent() {
        // Joined after grace, present 35 of 60 minutes.
        let r = resolve(&input(Some(ts(10, 20)), 35));
        assert_eq!(r.status, AttendanceStatus::Absent);
        assert_eq!(r.attendance_percentage, 58.33);
        assert!(r.is_late);
        assert_eq!(r.late_minutes, 20);
    }

    #[test]
    fn late_join_with_near_full_presence_is_late() {
        let r = resolve(&input(Some(ts(10, 18)), 58));
        assert_eq!(r.status, AttendanceStatus::Late);
        assert_eq!(r.attendance_percentage, 96.67);
        assert!(r.is_late);
        assert_eq!(r.late_minutes, 18);
    }

    #[test]
    fn overlong_presence_caps_at_one_hundred_percent() {
        // Joined early and stayed past the end: 65 minutes in a 60 minute
        // window.
        let r = resolve(&input(Some(ts(9, 58)), 65));
        assert_eq!(r.status, AttendanceStatus::Attended);
        assert_eq!(r.attendance_percentage, 100.0);
        assert!(!r.is_late);
        assert_eq!(r.late_minutes, 0);
    }

    #[test]
    fn full_presence_outranks_lateness() {
        // Late join but presence still reaches 100%.
        let r = resolve(&input(Some(ts(10, 20)), 75));
        assert_eq!(r.status, AttendanceStatus::Attended);
        assert!(r.is_late);
    }

    #[test]
    fn no_join_is_absent_with_zero_percentage() {
        let r = resolve(&input(None, 0));
        assert_eq!(r.status, AttendanceStatus::Absent);
        assert_eq!(r.attendance_percentage, 0.0);
        assert!(!r.is_late);
        assert_eq!(r.late_minutes, 0);
    }

    #[test]
    fn on_time_partial_band_is_thirty_to_eighty() {
        let r = resolve(&input(Some(ts(10, 0)), 30));
        assert_eq!(r.status, AttendanceStatus::Partial);
        assert_eq!(r.attendance_percentage, 50.0);

        let r = resolve(&input(Some(ts(10, 0)), 17));
        assert_eq!(r.status, AttendanceStatus::Absent);
        assert_eq!(r.attendance_percentage, 28.33);

        let r = resolve(&input(Some(ts(10, 0)), 48));
        assert_eq!(r.status, AttendanceStatus::Attended);
        assert_eq!(r.attendance_percentage, 80.0);
    }

    #[test]
    fn late_partial_band_is_eighty_to_ninety_five() {
        let r = resolve(&input(Some(ts(10, 16)), 50));
        assert_eq!(r.status, AttendanceStatus::Partial);
        assert_eq!(r.attendance_percentage, 83.33);
    }

    #[test]
    fn grace_boundary_join_is_on_time() {
        // Exactly at scheduled_at + grace is still within grace.
        let r = resolve(&input(Some(ts(10, 15)), 45));
        assert!(!r.is_late);
        assert_eq!(r.status, AttendanceStatus::Partial);

        let r = resolve(&input(Some(ts(10, 16)), 45));
        assert!(r.is_late);
    }

    #[test]
    fn zero_duration_session_resolves_absent() {
        let r = resolve(&ResolveInput {
            scheduled_at: ts(10, 0),
            duration_minutes: 0,
            grace_minutes: 15,
            first_join_at: Some(ts(10, 0)),
            total_duration_minutes: 10,
        });
        assert_eq!(r.status, AttendanceStatus::Absent);
        assert_eq!(r.attendance_percentage, 0.0);
    }

    async fn one_session(db: &DatabaseConnection) -> session::Model {
        session_generator::create_session(
            db,
            NewSession {
                academy_id: 1,
                teacher_id: TEACHER,
                student_id: Some(STUDENT),
                circle_id: None,
                subscription_id: None,
                kind: SessionKind::Quran,
                scheduled_at: ts(10, 0),
                duration_minutes: 60,
            },
        )
        .await
        .unwrap()
    }

    async fn force_status(
        db: &DatabaseConnection,
        session: &session::Model,
        status: SessionStatus,
        ended_at: Option<DateTime<Utc>>,
    ) {
        let mut active_model: session::ActiveModel = session.clone().into();
        active_model.status = Set(status);
        active_model.ended_at = Set(ended_at);
        active_model.update(db).await.unwrap();
    }

    async fn report(
        db: &DatabaseConnection,
        session_id: i64,
        participant_id: i64,
    ) -> attendance_report::Model {
        attendance_report::Model::find_one(db, session_id, participant_id)
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn completed_session_settles_reports_from_cycles() {
        let db = setup_test_db().await;
        let policy = AttendancePolicy::default();
        let session = one_session(&db).await;

        attendance_tracker::record_join(&db, session.id, STUDENT, ts(10, 5), &policy)
            .await
            .unwrap();
        attendance_tracker::record_leave(&db, session.id, STUDENT, ts(11, 0)).await.unwrap();
        force_status(&db, &session, SessionStatus::Completed, Some(ts(11, 0))).await;

        let outcome = finalize_session(&db, session.id, &[], &policy, ts(11, 5))
            .await
            .unwrap();
        assert_eq!(outcome.evaluated, 1);
        assert!(outcome.settled);
        assert_eq!(outcome.failed, 0);

        let report = report(&db, session.id, STUDENT).await;
        assert_eq!(report.status, AttendanceStatus::Attended);
        assert_eq!(report.attendance_percentage, 91.67);
        assert_eq!(report.attended_minutes, 55);
        assert!(!report.is_late);
        assert_eq!(report.late_minutes, 5);
        assert!(report.finalized);
        assert_eq!(report.evaluated_at, Some(ts(11, 5)));

        let record = meeting_attendance::Model::find_one(&db, session.id, STUDENT)
            .await
            .unwrap()
            .unwrap();
        assert!(record.finalized);
    }

    #[tokio::test]
    async fn finalize_before_the_end_stays_provisional() {
        let db = setup_test_db().await;
        let policy = AttendancePolicy::default();
        let session = one_session(&db).await;

        attendance_tracker::record_join(&db, session.id, STUDENT, ts(10, 0), &policy)
            .await
            .unwrap();
        attendance_tracker::record_leave(&db, session.id, STUDENT, ts(10, 30)).await.unwrap();

        // Session is ongoing and the hour is not up yet.
        let outcome = finalize_session(&db, session.id, &[], &policy, ts(10, 40))
            .await
            .unwrap();
        assert!(!outcome.settled);

        let report = report(&db, session.id, STUDENT).await;
        assert!(!report.finalized);
        assert_eq!(report.status, AttendanceStatus::Partial);
        assert_eq!(report.attendance_percentage, 50.0);

        let record = meeting_attendance::Model::find_one(&db, session.id, STUDENT)
            .await
            .unwrap()
            .unwrap();
        assert!(!record.finalized);
    }

    #[tokio::test]
    async fn ongoing_session_past_its_end_settles() {
        let db = setup_test_db().await;
        let policy = AttendancePolicy::default();
        let session = one_session(&db).await;

        attendance_tracker::record_join(&db, session.id, STUDENT, ts(10, 0), &policy)
            .await
            .unwrap();

        // Still ongoing at 11:10; the open cycle is closed at the nominal
        // end, not at evaluation time.
        let outcome = finalize_session(&db, session.id, &[], &policy, ts(11, 10))
            .await
            .unwrap();
        assert!(outcome.settled);

        let report = report(&db, session.id, STUDENT).await;
        assert!(report.finalized);
        assert_eq!(report.status, AttendanceStatus::Attended);
        assert_eq!(report.attended_minutes, 60);

        let record = meeting_attendance::Model::find_one(&db, session.id, STUDENT)
            .await
            .unwrap()
            .unwrap();
        assert!(!record.cycles.has_open());
        assert_eq!(record.last_leave_at, Some(ts(11, 0)));
    }

    #[tokio::test]
    async fn roster_members_who_never_joined_are_absent() {
        let db = setup_test_db().await;
        let policy = AttendancePolicy::default();
        let session = one_session(&db).await;

        attendance_tracker::record_join(&db, session.id, STUDENT, ts(10, 0), &policy)
            .await
            .unwrap();
        attendance_tracker::record_leave(&db, session.id, STUDENT, ts(11, 0)).await.unwrap();
        force_status(&db, &session, SessionStatus::Completed, Some(ts(11, 0))).await;

        let outcome = finalize_session(&db, session.id, &[STUDENT, 66], &policy, ts(11, 5))
            .await
            .unwrap();
        assert_eq!(outcome.evaluated, 2);

        let absent = report(&db, session.id, 66).await;
        assert_eq!(absent.status, AttendanceStatus::Absent);
        assert_eq!(absent.attendance_percentage, 0.0);
        assert_eq!(absent.attended_minutes, 0);
        assert!(absent.finalized);
    }

    #[tokio::test]
    async fn missed_session_finalizes_everyone_absent() {
        let db = setup_test_db().await;
        let policy = AttendancePolicy::default();
        let session = one_session(&db).await;
        force_status(&db, &session, SessionStatus::Missed, None).await;

        let outcome = finalize_session(&db, session.id, &[STUDENT], &policy, ts(11, 31))
            .await
            .unwrap();
        assert_eq!(outcome.evaluated, 1);
        assert!(outcome.settled);

        let report = report(&db, session.id, STUDENT).await;
        assert_eq!(report.status, AttendanceStatus::Absent);
        assert!(report.finalized);
    }

    #[tokio::test]
    async fn cancelled_sessions_are_never_evaluated() {
        let db = setup_test_db().await;
        let policy = AttendancePolicy::default();
        let session = one_session(&db).await;
        force_status(&db, &session, SessionStatus::Cancelled, None).await;

        let outcome = finalize_session(&db, session.id, &[STUDENT], &policy, ts(12, 0))
            .await
            .unwrap();
        assert_eq!(outcome, FinalizeOutcome::default());
        assert!(
            attendance_report::Model::find_one(&db, session.id, STUDENT)
                .await
                .unwrap()
                .is_none()
        );

        let err = finalize_participant(&db, session.id, STUDENT, &policy, ts(12, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulingError::Validation(_)));
    }

    #[tokio::test]
    async fn manual_override_survives_re_evaluation() {
        let db = setup_test_db().await;
        let policy = AttendancePolicy::default();
        let session = one_session(&db).await;
        force_status(&db, &session, SessionStatus::Completed, Some(ts(11, 0))).await;

        finalize_session(&db, session.id, &[STUDENT], &policy, ts(11, 5)).await.unwrap();
        let before = report(&db, session.id, STUDENT).await;
        assert_eq!(before.status, AttendanceStatus::Absent);

        override_attendance(
            &db,
            session.id,
            STUDENT,
            AttendanceStatus::Attended,
            "Joined by phone, connectivity outage",
            1,
            ts(12, 0),
        )
        .await
        .unwrap();

        let outcome = finalize_session(&db, session.id, &[STUDENT], &policy, ts(12, 30))
            .await
            .unwrap();
        assert_eq!(outcome.overridden, 1);

        let after = report(&db, session.id, STUDENT).await;
        assert_eq!(after.status, AttendanceStatus::Attended);
        assert!(after.manual_override);
        assert_eq!(after.override_by, Some(1));
        assert_eq!(
            after.override_reason.as_deref(),
            Some("Joined by phone, connectivity outage")
        );
        assert_eq!(after.overridden_at, Some(ts(12, 0)));
    }

    #[tokio::test]
    async fn revert_override_recomputes_from_cycles() {
        let db = setup_test_db().await;
        let policy = AttendancePolicy::default();
        let session = one_session(&db).await;

        attendance_tracker::record_join(&db, session.id, STUDENT, ts(10, 5), &policy)
            .await
            .unwrap();
        attendance_tracker::record_leave(&db, session.id, STUDENT, ts(11, 0)).await.unwrap();
        force_status(&db, &session, SessionStatus::Completed, Some(ts(11, 0))).await;

        override_attendance(
            &db,
            session.id,
            STUDENT,
            AttendanceStatus::Absent,
            "Mistaken identity",
            1,
            ts(12, 0),
        )
        .await
        .unwrap();

        let reverted = revert_override(&db, session.id, STUDENT, &policy, ts(12, 30))
            .await
            .unwrap();
        assert_eq!(reverted.status, AttendanceStatus::Attended);
        assert_eq!(reverted.attendance_percentage, 91.67);
        assert!(!reverted.manual_override);
        assert!(reverted.override_by.is_none());
        assert!(reverted.override_reason.is_none());
        assert!(reverted.overridden_at.is_none());
    }

    #[tokio::test]
    async fn revert_without_a_report_is_not_found() {
        let db = setup_test_db().await;
        let session = one_session(&db).await;

        let err = revert_override(
            &db,
            session.id,
            STUDENT,
            &AttendancePolicy::default(),
            ts(12, 0),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            SchedulingError::ReportNotFound {
                participant_id: STUDENT,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn provisional_status_reads_without_writing() {
        let db = setup_test_db().await;
        let policy = AttendancePolicy::default();
        let session = one_session(&db).await;

        attendance_tracker::record_join(&db, session.id, STUDENT, ts(10, 0), &policy)
            .await
            .unwrap();

        let live = provisional_status(&db, session.id, STUDENT, &policy, ts(10, 30))
            .await
            .unwrap();
        assert_eq!(live.status, AttendanceStatus::Partial);
        assert_eq!(live.attendance_percentage, 50.0);

        assert!(
            attendance_report::Model::find_one(&db, session.id, STUDENT)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn recalculate_rebuilds_aggregates_from_cycles() {
        let db = setup_test_db().await;
        let policy = AttendancePolicy::default();
        let session = one_session(&db).await;

        attendance_tracker::record_join(&db, session.id, STUDENT, ts(10, 0), &policy)
            .await
            .unwrap();
        attendance_tracker::record_leave(&db, session.id, STUDENT, ts(10, 55)).await.unwrap();
        force_status(&db, &session, SessionStatus::Completed, Some(ts(11, 0))).await;

        // Corrupt the derived aggregates; the raw cycles stay intact.
        let record = meeting_attendance::Model::find_one(&db, session.id, STUDENT)
            .await
            .unwrap()
            .unwrap();
        let mut active_model: meeting_attendance::ActiveModel = record.into();
        active_model.total_duration_minutes = Set(3);
        active_model.first_join_at = Set(Some(ts(9, 0)));
        active_model.join_count = Set(9);
        active_model.update(&db).await.unwrap();

        let outcome = recalculate_session(&db, session.id, &[], &policy, ts(11, 5))
            .await
            .unwrap();
        assert_eq!(outcome.evaluated, 1);

        let record = meeting_attendance::Model::find_one(&db, session.id, STUDENT)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.total_duration_minutes, 55);
        assert_eq!(record.first_join_at, Some(ts(10, 0)));
        assert_eq!(record.join_count, 1);

        let report = report(&db, session.id, STUDENT).await;
        assert_eq!(report.attendance_percentage, 91.67);
        assert_eq!(report.status, AttendanceStatus::Attended);
    }
}
