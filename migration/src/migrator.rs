use sea_orm_migration::prelude::*;

use crate::migrations;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(migrations::m202607140001_create_schedule_templates::Migration),
            Box::new(migrations::m202607140002_create_sessions::Migration),
            Box::new(migrations::m202607140003_create_meeting_attendance::Migration),
            Box::new(migrations::m202607140004_create_attendance_reports::Migration),
        ]
    }
}
