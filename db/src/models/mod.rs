pub mod schedule_template;
pub mod session;
pub mod meeting_attendance;
pub mod attendance_report;

pub use schedule_template::Entity as ScheduleTemplate;
pub use session::Entity as Session;
pub use meeting_attendance::Entity as MeetingAttendance;
pub use attendance_report::Entity as AttendanceReport;
