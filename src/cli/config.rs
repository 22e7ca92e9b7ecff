//! Configuration CLI command handlers

use crate::cli::commands::ConfigArgs;
use crate::core::config::{config_dir, unknown_setting, Settings};
use crate::error::Result;

/// Handle the config command
pub fn handle_config(args: ConfigArgs) -> Result<()> {
    let dir = config_dir()?;
    let mut settings = Settings::load_from(&dir)?;

    match (args.key, args.value, args.reset) {
        (None, _, false) => {
            println!("Settings ({}):", dir.join("config.toml").display());
            for key in Settings::KEYS {
                println!("  {} = {}", key, settings.get(key).unwrap_or_default());
            }
        }
        (None, _, true) => {
            Settings::default().save_to(&dir)?;
            println!("All settings reset to defaults.");
        }
        (Some(key), None, false) => {
            let value = settings.get(&key).ok_or_else(|| unknown_setting(&key))?;
            println!("{}", value);
        }
        (Some(key), Some(value), _) => {
            settings.set(&key, &value)?;
            settings.save_to(&dir)?;
            println!("{} set to: {}", key, settings.get(&key).unwrap_or(value));
        }
        (Some(key), None, true) => {
            let default = Settings::default().get(&key).ok_or_else(|| unknown_setting(&key))?;
            settings.set(&key, &default)?;
            settings.save_to(&dir)?;
            println!("{} reset to: {}", key, default);
        }
    }
    Ok(())
}
