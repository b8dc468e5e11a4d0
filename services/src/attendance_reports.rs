use chrono::{DateTime, Utc};
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder};

use db::models::attendance_report::{self, AttendanceStatus};
use db::models::session;

use crate::error::SchedulingResult;

/// A participant's finalized attendance over a date range, oldest session
/// first. Provisional reports stay out of the history until they settle.
pub async fn for_participant_between(
    db: &DatabaseConnection,
    participant_id: i64,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> SchedulingResult<Vec<(attendance_report::Model, session::Model)>> {
    let rows = attendance_report::Entity::find()
        .filter(attendance_report::Column::ParticipantId.eq(participant_id))
        .filter(attendance_report::Column::Finalized.eq(true))
        .find_also_related(session::Entity)
        .filter(session::Column::ScheduledAt.gte(from))
        .filter(session::Column::ScheduledAt.lte(to))
        .order_by_asc(session::Column::ScheduledAt)
        .all(db)
        .await?;

    Ok(rows
        .into_iter()
        .filter_map(|(report, session)| session.map(|s| (report, s)))
        .collect())
}

#[derive(Debug, Default, Clone, PartialEq, serde::Serialize)]
pub struct SessionAttendanceStats {
    pub participants: usize,
    pub attended: usize,
    pub late: usize,
    pub partial: usize,
    pub absent: usize,
    pub average_percentage: f64,
    pub total_attended_minutes: i64,
}

/// Rollup over a session's finalized reports, for the teacher and academy
/// dashboards.
pub async fn session_statistics(
    db: &DatabaseConnection,
    session_id: i64,
) -> SchedulingResult<SessionAttendanceStats> {
    let reports = attendance_report::Model::find_for_session(db, session_id).await?;

    let mut stats = SessionAttendanceStats::default();
    let mut percentage_sum = 0.0;
    for report in &reports {
        if !report.finalized {
            continue;
        }
        stats.participants += 1;
        match report.status {
            AttendanceStatus::Attended => stats.attended += 1,
            AttendanceStatus::Late => stats.late += 1,
            AttendanceStatus::Partial => stats.partial += 1,
            AttendanceStatus::Absent => stats.absent += 1,
        }
        percentage_sum += report.attendance_percentage;
        stats.total_attended_minutes += report.attended_minutes as i64;
    }

    if stats.participants > 0 {
        stats.average_percentage =
            (percentage_sum / stats.participants as f64 * 100.0).round() / 100.0;
    }
    Ok(stats)
}
