use anyhow::Context;
use std::path::Path;

use factshield::conf::{self, AppConfig};
use factshield::db;
use factshield::web;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let figment = conf::app_figment();

    // mirror of the instance/ convention: both the sqlite file and the
    // upload directory must exist before the pool and handlers touch them
    let config: AppConfig = figment.extract()?;
    std::fs::create_dir_all(&config.upload_dir).with_context(|| {
        format!(
            "cannot create upload directory {}",
            config.upload_dir.display()
        )
    })?;
    if let Ok(db_url) = figment.extract_inner::<String>("databases.factshield.url") {
        if let Some(parent) = Path::new(&db_url).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("cannot create {}", parent.display()))?;
            }
        }
    }

    let app = web::build_app(figment).ignite().await?;

    let conn = web::DbConn::get_one(&app)
        .await
        .ok_or("Cannot access connection pool")?;
    conn.run(|c| db::run_migrations(c)).await?;

    app.launch().await?;
    Ok(())
}
