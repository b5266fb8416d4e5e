use std::time::Duration;

use app_config::AppConfig;

#[test]
fn test_load_config_defaults_and_overrides() {
    let cfg = AppConfig::load().unwrap();
    assert_eq!(cfg.db_port, 5432);
    assert_eq!(cfg.migrations_dir, "migrations");
    assert!(!cfg.lock_no_wait);
    assert_eq!(cfg.settle_timeout(), Some(Duration::from_secs(5)));

    std::env::set_var("DB_HOST", "db.internal");
    std::env::set_var("LOCK_NO_WAIT", "true");
    std::env::set_var("SETTLE_TIMEOUT", "0s");
    let cfg = AppConfig::load().unwrap();
    assert_eq!(cfg.db_host, "db.internal");
    assert!(cfg.lock_no_wait);
    assert_eq!(cfg.settle_timeout(), None);
    assert!(cfg.dsn().contains("host=db.internal"));
}
