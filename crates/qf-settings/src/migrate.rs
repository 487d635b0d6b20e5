//! Settings schema migration.

use crate::SettingsError;
use crate::schema::Settings;

pub const LATEST_VERSION: u32 = 1;

pub fn migrate_to_latest(mut settings: Settings) -> Result<Settings, SettingsError> {
    while settings.version < LATEST_VERSION {
        settings = migrate_one_version(settings)?;
    }
    Ok(settings)
}

fn migrate_one_version(settings: Settings) -> Result<Settings, SettingsError> {
    match settings.version {
        0 => migrate_v0_to_v1(settings),
        v => Err(SettingsError::Migration {
            what: format!("No migration path from version {}", v),
        }),
    }
}

/// v0 stored analysis commands verbatim from a free-text field; v1 keeps them
/// as single-spaced, lowercase-tool command strings and drops blanks.
fn migrate_v0_to_v1(mut settings: Settings) -> Result<Settings, SettingsError> {
    settings.analysis.tools = settings
        .analysis
        .tools
        .iter()
        .filter_map(|raw| normalize_command(raw))
        .collect();
    settings.version = 1;
    Ok(settings)
}

fn normalize_command(raw: &str) -> Option<String> {
    let mut parts = raw.split_whitespace();
    let tool = parts.next()?.to_ascii_lowercase();
    let mut command = tool;
    for part in parts {
        command.push(' ');
        command.push_str(part);
    }
    Some(command)
}
