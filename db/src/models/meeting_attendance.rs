use chrono::{DateTime, Utc};
use sea_orm::ActiveValue::Set;
use sea_orm::entity::prelude::*;
use sea_orm::{ConnectionTrait, DeriveActiveEnum, FromJsonQueryResult, QueryFilter};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// One join-to-leave interval. `left_at` is null while the participant is
/// still in the meeting; `duration_minutes` is filled in when the cycle
/// closes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceCycle {
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<i64>,
}

impl AttendanceCycle {
    pub fn is_open(&self) -> bool {
        self.left_at.is_none()
    }
}

/// Ordered cycle list stored as a JSON column. All cycle arithmetic lives
/// here so the "at most one open cycle" invariant is enforced in one place.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, FromJsonQueryResult)]
pub struct CycleList(pub Vec<AttendanceCycle>);

impl CycleList {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Index of the most recent open cycle, scanning backward. Webhook
    /// reordering means the open cycle is almost always the last one, but
    /// the scan keeps this correct even if it is not.
    pub fn open_index(&self) -> Option<usize> {
        self.0.iter().rposition(|c| c.is_open())
    }

    pub fn has_open(&self) -> bool {
        self.open_index().is_some()
    }

    pub fn last(&self) -> Option<&AttendanceCycle> {
        self.0.last()
    }

    /// Appends a new open cycle. Callers must have checked `has_open` first;
    /// this does not guard the invariant itself.
    pub fn push_open(&mut self, at: DateTime<Utc>) {
        self.0.push(AttendanceCycle {
            joined_at: at,
            left_at: None,
            duration_minutes: None,
        });
    }

    /// Closes the most recent open cycle at `at` and returns its duration in
    /// whole minutes (clamped to zero for reordered timestamps). Returns
    /// `None` when no cycle is open.
    pub fn close_open(&mut self, at: DateTime<Utc>) -> Option<i64> {
        let idx = self.open_index()?;
        let cycle = &mut self.0[idx];
        let minutes = (at - cycle.joined_at).num_minutes().max(0);
        cycle.left_at = Some(at);
        cycle.duration_minutes = Some(minutes);
        Some(minutes)
    }

    /// Reopens the last cycle (used when a rejoin lands inside the reconnect
    /// window and the preceding leave should be treated as a network blip).
    /// Returns false when the list is empty or the last cycle is still open.
    pub fn reopen_last(&mut self) -> bool {
        match self.0.last_mut() {
            Some(cycle) if !cycle.is_open() => {
                cycle.left_at = None;
                cycle.duration_minutes = None;
                true
            }
            _ => false,
        }
    }

    /// Exact sum of closed-cycle durations in whole minutes.
    pub fn total_closed_minutes(&self) -> i64 {
        self.0
            .iter()
            .filter(|c| !c.is_open())
            .map(|c| {
                c.duration_minutes
                    .unwrap_or_else(|| match c.left_at {
                        Some(left) => (left - c.joined_at).num_minutes().max(0),
                        None => 0,
                    })
            })
            .sum()
    }

    pub fn first_joined_at(&self) -> Option<DateTime<Utc>> {
        self.0.first().map(|c| c.joined_at)
    }

    /// Most recent closed-cycle leave timestamp.
    pub fn last_left_at(&self) -> Option<DateTime<Utc>> {
        self.0.iter().rev().find_map(|c| c.left_at)
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "meeting_attendance")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    pub session_id: i64,
    pub participant_id: i64,
    pub role: ParticipantRole,

    #[sea_orm(column_type = "Json")]
    pub cycles: CycleList,

    pub first_join_at: Option<DateTime<Utc>>,
    pub last_leave_at: Option<DateTime<Utc>>,
    pub total_duration_minutes: i32,
    pub join_count: i32,
    pub leave_count: i32,
    pub finalized: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Display, EnumString, Serialize,
    Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[sea_orm(rs_type = "String", db_type = "Enum", enum_name = "participant_role")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ParticipantRole {
    #[sea_orm(string_value = "teacher")]
    Teacher,

    #[sea_orm(string_value = "student")]
    Student,
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
    pub async fn create<C: ConnectionTrait>(
        db: &C,
        session_id: i64,
        participant_id: i64,
        role: ParticipantRole,
    ) -> Result<Model, DbErr> {
        let now = Utc::now();

        let active_model = ActiveModel {
            session_id: Set(session_id),
            participant_id: Set(participant_id),
            role: Set(role),
            cycles: Set(CycleList::default()),
            first_join_at: Set(None),
            last_leave_at: Set(None),
            total_duration_minutes: Set(0),
            join_count: Set(0),
            leave_count: Set(0),
            finalized: Set(false),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        };

        active_model.insert(db).await
    }

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

    /// Presence so far: the stored closed-cycle total plus the live open
    /// cycle, if any. Used for dashboards while the meeting is running.
    pub fn current_duration(&self, now: DateTime<Utc>) -> i64 {
        let mut total = self.total_duration_minutes as i64;
        if let Some(idx) = self.cycles.open_index() {
            total += (now - self.cycles.0[idx].joined_at).num_minutes().max(0);
        }
        total
    }
}
