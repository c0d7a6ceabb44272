use std::io::Write;

use pg_domain::config::{Config, ConfigSeverity, InterfaceKind};

#[test]
fn default_config_has_no_workers() {
    let config = Config::default();
    assert!(config.workers.is_empty());
    assert_eq!(config.mqtt.port, 1883);
    assert_eq!(config.manager.heartbeat.pong_timeout_secs, 30);
}

#[test]
fn empty_config_only_warns() {
    let issues = Config::default().validate();
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].severity, ConfigSeverity::Warning);
    assert_eq!(issues[0].field, "workers");
}

#[test]
fn parses_workers_table() {
    let toml_str = r#"
[mqtt]
host = "broker.local"

[[workers]]
id = "hue"
executable = "/opt/ns/hue/hue.py"
profile_number = 2

[[workers]]
id = "kodi"
interface = "mqtt"
executable = "/opt/ns/kodi/kodi.py"
configfile = "kodi.yaml"
"#;
    let config: Config = toml::from_str(toml_str).unwrap();
    assert_eq!(config.workers.len(), 2);
    assert_eq!(config.workers[0].profile_number, Some(2));
    assert_eq!(config.workers[1].interface, InterfaceKind::Mqtt);
    assert_eq!(config.mqtt.host, "broker.local");
    assert!(config.validate().is_empty());
}

#[test]
fn colliding_workers_are_errors() {
    let toml_str = r#"
[[workers]]
id = "hue"
executable = "/bin/true"
profile_number = 1

[[workers]]
id = "hue"
executable = "/bin/true"
profile_number = 1

[[workers]]
id = "my_hue"
executable = "/bin/true"
"#;
    let config: Config = toml::from_str(toml_str).unwrap();
    let errors: Vec<String> = config
        .validate()
        .into_iter()
        .filter(|e| e.severity == ConfigSeverity::Error)
        .map(|e| e.field)
        .collect();
    assert!(errors.contains(&"workers[1].id".to_string()));
    assert!(errors.contains(&"workers[1].profile_number".to_string()));
    assert!(errors.contains(&"workers[2].id".to_string()));
}

#[test]
fn stdio_worker_without_executable_is_error() {
    let config: Config = toml::from_str("[[workers]]\nid = \"hue\"\n").unwrap();
    let issues = config.validate();
    assert!(issues
        .iter()
        .any(|e| e.severity == ConfigSeverity::Error && e.field == "workers[0].executable"));
}

#[test]
fn loads_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[controller]\nbase_url = \"http://isy:80\"\nmax_retries = 1").unwrap();
    let config = Config::from_file(file.path()).unwrap();
    assert_eq!(config.controller.base_url, "http://isy:80");
    assert_eq!(config.controller.max_retries, 1);
}

#[test]
fn bad_toml_is_reported() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[manager\n").unwrap();
    assert!(matches!(
        Config::from_file(file.path()),
        Err(pg_domain::Error::Toml(_))
    ));
}
