//! `taskmind config`: configuration management commands.

use taskmind_config::AppConfig;

pub async fn init(force: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config_dir = AppConfig::config_dir();
    let config_path = config_dir.join("config.toml");

    if config_path.exists() && !force {
        println!("⚠️  Config already exists at {}", config_path.display());
        println!("   Use --force to overwrite.");
        return Ok(());
    }

    std::fs::create_dir_all(&config_dir)?;
    std::fs::write(&config_path, AppConfig::default_toml())?;

    println!("✅ Wrote default config to {}", config_path.display());
    println!("   Set TASKMIND_API_KEY (or OPENAI_API_KEY) before chatting or detecting tasks.");
    Ok(())
}

pub async fn show() -> Result<(), Box<dyn std::error::Error>> {
    let mut config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    if config.provider.api_key.is_some() {
        config.provider.api_key = Some("***".into());
    }
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    println!("# data_dir = {}", config.data_dir().display());
    Ok(())
}

pub async fn path() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = AppConfig::config_dir().join("config.toml");
    println!("{}", config_path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    #[test]
    fn config_path_is_valid() {
        let path = taskmind_config::AppConfig::config_dir().join("config.toml");
        assert!(path.to_str().unwrap().contains(".taskmind"));
    }

    #[test]
    fn default_toml_round_trips() {
        let parsed: taskmind_config::AppConfig =
            toml::from_str(&taskmind_config::AppConfig::default_toml()).unwrap();
        assert!(parsed.validate().is_ok());
    }
}
