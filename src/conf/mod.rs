pub mod api;

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use rust_embed::RustEmbed;

#[derive(RustEmbed)]
#[folder = "src/conf/"]
#[include = "*.toml"]
struct EmbeddedConfigFS;

/// Default configuration paths searched when the user does not specify one.
const DEFAULT_CONFIG_PATHS: [&str; 2] = ["/etc/waypost/waypost.toml", "./waypost.toml"];

/// Returns the embedded default configuration file contents.
fn default_config() -> Result<String> {
    let config_file = EmbeddedConfigFS::get("default_api_config.toml")
        .context("embedded default configuration file is missing")?;

    let raw = std::str::from_utf8(&config_file.data)
        .context("embedded default configuration file is not valid utf-8")?;

    Ok(raw.to_string())
}

/// Builds the api configuration by layering sources, lowest priority first: the embedded
/// defaults, a configuration file (an explicit path, or the first default path that exists),
/// and finally WAYPOST_* environment variables (e.g. WAYPOST_SERVER__BIND_ADDRESS).
pub fn parse_api_config(path_override: &Option<String>) -> Result<api::Config> {
    let mut figment = Figment::new().merge(Toml::string(&default_config()?));

    match path_override {
        Some(path) => {
            figment = figment.merge(Toml::file(path));
        }
        None => {
            for path in DEFAULT_CONFIG_PATHS {
                figment = figment.merge(Toml::file(path));
            }
        }
    }

    figment
        .merge(Env::prefixed("WAYPOST_").split("__"))
        .extract()
        .context("could not parse configuration")
}
