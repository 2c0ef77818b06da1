use std::path::Path;

use once_cell::sync::OnceCell;

use crate::config::ManagerOptions;
use crate::error::{TaskManagerError, TaskManagerResult};
use crate::manager::Manager;

/// Thin global handle over an explicit [`Manager`]. Not part of the core
/// contract — callers that want to hold their own `Manager` can ignore this
/// module entirely.
static DEFAULT_MANAGER: OnceCell<Manager> = OnceCell::new();

/// Builds and installs the crate-level default manager. Panics if called
/// more than once; `Manager::new` itself always returns `Result`.
pub fn start_with_options(db_path: impl AsRef<Path>, table: &str, options: ManagerOptions) -> &'static Manager {
    DEFAULT_MANAGER
        .set(Manager::new(db_path, table, options).expect("invalid task manager configuration"))
        .unwrap_or_else(|_| panic!("default task manager already initialized"));
    default_manager().expect("just initialized")
}

pub fn default_manager() -> TaskManagerResult<&'static Manager> {
    DEFAULT_MANAGER
        .get()
        .ok_or_else(|| TaskManagerError::Config("default manager not started".into()))
}
