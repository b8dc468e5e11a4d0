pub mod m202607140001_create_schedule_templates;
pub mod m202607140002_create_sessions;
pub mod m202607140003_create_meeting_attendance;
pub mod m202607140004_create_attendance_reports;
