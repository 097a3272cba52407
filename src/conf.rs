use figment::{providers::Env, Figment};
use serde::Deserialize;
use std::path::PathBuf;

/// Application section of the rocket figment. `secret_key` and the
/// `databases.factshield.url` entry live in the regular rocket config.
#[derive(Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
    #[serde(default = "default_max_upload_mib")]
    pub max_upload_mib: u64,
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("instance/uploads")
}

fn default_max_upload_mib() -> u64 {
    16
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            upload_dir: default_upload_dir(),
            max_upload_mib: default_max_upload_mib(),
        }
    }
}

impl AppConfig {
    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_mib * 1024 * 1024
    }
}

/// Rocket.toml + ROCKET_* env, plus FACTSHIELD_* env overrides for the
/// application keys and a fallback database located under instance/.
pub fn app_figment() -> Figment {
    rocket::Config::figment()
        .merge(Env::prefixed("FACTSHIELD_").global())
        .join(("databases.factshield.url", "instance/factshield.db"))
}
