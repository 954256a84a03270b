//! `docmill init` - create the data directory and database.

use console::style;

use crate::config::Settings;
use crate::repository::Repository;

pub async fn cmd_init(settings: &Settings) -> anyhow::Result<i32> {
    settings.ensure_directories()?;
    let repo = Repository::new(&settings.database_path())?;
    let tables = repo.list_tables()?;

    println!(
        "{} Initialized data directory at {}",
        style("✓").green(),
        settings.data_dir.display()
    );
    println!(
        "{} Database {} with {} tables:",
        style("✓").green(),
        settings.database_path().display(),
        tables.len()
    );
    for table in tables {
        println!("    {table}");
    }
    Ok(0)
}
