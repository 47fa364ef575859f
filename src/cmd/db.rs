//! Database initialisation command: `devflow init-db`.

use std::path::Path;

use anyhow::Result;

use devflow::config::DevflowConfig;
use devflow::server::open_db;

pub fn cmd_init_db(config_path: Option<&Path>, db_path: Option<&Path>) -> Result<()> {
    let config = DevflowConfig::resolve(config_path)?;
    let path = db_path.unwrap_or(&config.server.db_path);
    open_db(path)?;
    println!("Run database initialized at {}", path.display());
    Ok(())
}
