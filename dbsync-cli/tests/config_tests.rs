use std::io::Write;

use anyhow::Result;
use tempfile::TempDir;

use dbsynccli::config::ConfigLoad;

#[test]
fn test_config_defaults() {
    let config = ConfigLoad::default();

    assert_eq!(config.get_host(), "127.0.0.1");
    assert_eq!(config.get_port(), 7000);
    assert_eq!(config.get_log_level(), "info");
}

#[test]
fn test_config_load_from_file() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("dbsync.toml");
    let mut file = std::fs::File::create(&path)?;
    writeln!(file, "version = 0")?;
    writeln!(file, "host = \"0.0.0.0\"")?;
    writeln!(file, "port = 7007")?;
    writeln!(file, "log_level = \"debug\"")?;

    let config = ConfigLoad::new(path.to_str().unwrap())?;
    assert_eq!(config.get_host(), "0.0.0.0");
    assert_eq!(config.get_port(), 7007);
    assert_eq!(config.get_log_level(), "debug");
    Ok(())
}

#[test]
fn test_missing_file_falls_back_to_defaults() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("absent.toml");

    // confy creates the file with defaults when it is absent
    let config = ConfigLoad::new(path.to_str().unwrap())?;
    assert_eq!(config.get_port(), 7000);
    Ok(())
}

#[test]
fn test_demo_schema_shape() {
    use dbsynccli::demo::demo_schema;

    let schema = demo_schema();
    assert!(schema.has_table("cities"));
    assert!(schema.has_table("houses"));
    let refs = schema.referencing("cities");
    assert_eq!(refs.len(), 1);
    assert_eq!(refs[0].1.column, "city_id");
}
