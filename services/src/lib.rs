pub mod attendance_reports;
pub mod attendance_resolver;
pub mod attendance_tracker;
pub mod error;
pub mod schedule_templates;
pub mod session_generator;
pub mod session_lifecycle;
pub mod subscriptions;

pub use error::{SchedulingError, SchedulingResult};

/// Attendance rules threaded explicitly into every tracker/resolver call.
/// Callers resolve these per academy or circle; nothing in this crate reads
/// tenant settings from ambient state.
#[derive(Debug, Clone)]
pub struct AttendancePolicy {
    /// Minutes after the scheduled start during which a join still counts as
    /// on time.
    pub grace_minutes: i64,
    /// A rejoin within this many seconds of the previous leave is merged into
    /// the same cycle (network blip, not a real exit). Zero disables merging.
    pub reconnect_threshold_seconds: i64,
    /// Minutes past the nominal session end before open cycles are force
    /// closed and a never-started session can be swept to missed.
    pub post_session_buffer_minutes: i64,
    /// Minutes past the nominal end before an ongoing session is auto
    /// completed by the sweep.
    pub auto_complete_buffer_minutes: i64,
}

impl Default for AttendancePolicy {
    fn default() -> Self {
        Self {
            grace_minutes: 15,
            reconnect_threshold_seconds: 120,
            post_session_buffer_minutes: 30,
            auto_complete_buffer_minutes: 5,
        }
    }
}

/// Scheduling rules for lifecycle operations on sessions without a template
/// (template-backed sessions carry their own notice window).
#[derive(Debug, Clone)]
pub struct SchedulePolicy {
    pub cancel_notice_hours: i64,
}

impl Default for SchedulePolicy {
    fn default() -> Self {
        Self {
            cancel_notice_hours: 24,
        }
    }
}
