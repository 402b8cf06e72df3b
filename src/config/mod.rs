//! Engine configuration.
//!
//! Tiers, merged field by field (later wins):
//! 1. **Defaults** - compiled in
//! 2. **Project** - `$CWD/dedupe/config.yaml`
//! 3. **User** - `~/.dedupe/config.yaml`
//! 4. **Environment** - `DEDUPE_*` variables
//!
//! ## Environment Variables
//! - `DEDUPE_CONFIG_PATH` - Explicit config file (replaces the file tiers)
//! - `DEDUPE_PROJECT_DIR` - Project config dir (default: `./dedupe`)
//! - `DEDUPE_USER_DIR` - User config dir (default: `~/.dedupe`)
//! - `DEDUPE_DB_PATH` - Database path
//! - `DEDUPE_CONFIGURATIONS_PATH` - Matching configurations file
//! - `DEDUPE_THROTTLE_MS` - Store broadcast window
//! - `DEDUPE_POLL_INTERVAL_MS` - Job poll interval

mod loader;
mod merge;
mod types;

pub use loader::{CONFIG_FILE, ConfigLoader, ConfigPaths, ConfigTier, apply_env_overrides};
pub use merge::{deep_merge, deep_merge_all};
pub use types::*;
