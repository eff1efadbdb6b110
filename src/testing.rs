use std::sync::Arc;

use once_cell::sync::Lazy;
use tempfile::TempDir;

use crate::database::{self, user::{NewUserPayload, User}};
use crate::schema::enum_def::UserRole;
use crate::service::app_state::{AppSettings, AppState};
use crate::service::options::{OptionsCoordinator, RuntimeOptions};
use crate::utils::ID_GENERATOR;

static TEST_DB_DIR: Lazy<TempDir> =
    Lazy::new(|| tempfile::tempdir().expect("failed to create temp dir for test database"));

/// Migrates a throwaway sqlite file shared by every test in the process.
pub fn setup_db() {
    let path = TEST_DB_DIR.path().join("test.db");
    database::init_pool(&path.to_string_lossy());
}

pub fn unique_name(prefix: &str) -> String {
    format!("{}-{}", prefix, ID_GENERATOR.generate_id())
}

pub fn create_user(quota: i64) -> User {
    create_user_with(quota, UserRole::Common, "default")
}

pub fn create_user_with(quota: i64, role: UserRole, group: &str) -> User {
    User::create(&NewUserPayload {
        username: unique_name("user"),
        role,
        group_name: Some(group.to_string()),
        quota,
    })
    .expect("failed to create test user")
}

/// State without redis, with the counter-backed metrics recorder.
pub fn test_state(settings: AppSettings) -> Arc<AppState> {
    test_state_with_options(settings, RuntimeOptions::default())
}

pub fn test_state_with_options(settings: AppSettings, options: RuntimeOptions) -> Arc<AppState> {
    let settings = AppSettings {
        metrics_enabled: true,
        ..settings
    };
    let options = Arc::new(OptionsCoordinator::new(options));
    Arc::new(AppState::new(settings, options, None, ""))
}
