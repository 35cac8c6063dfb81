use std::path::Path;

use tempfile::TempDir;
use terrace_config::{load_specs, ConfigError};
use terrace_domain::{Address, Reference, Value};

#[test]
fn load_fixture_directory() {
    let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/stack");
    let specs = load_specs(&dir).expect("should load without error");

    let addresses: Vec<String> = specs.iter().map(|s| s.address().to_string()).collect();
    assert_eq!(addresses, vec!["net.main", "host.web", "host.worker"]);

    let web = &specs[1];
    assert_eq!(
        web.attributes["subnet"],
        Value::Reference(Reference::parse("net.main.id").unwrap())
    );
    let worker = &specs[2];
    assert!(worker.depends_on.contains(&Address::new("host", "web")));
    assert_eq!(
        worker.dependencies().into_iter().collect::<Vec<_>>(),
        vec![Address::new("host", "web")]
    );
}

#[test]
fn duplicate_across_files_is_an_error() {
    let dir = TempDir::new().unwrap();
    let doc = "resources:\n  - {type: host, name: a}\n";
    std::fs::write(dir.path().join("a.yml"), doc).unwrap();
    std::fs::write(dir.path().join("b.yml"), doc).unwrap();

    match load_specs(dir.path()) {
        Err(ConfigError::Duplicate { address, first, .. }) => {
            assert_eq!(address, "host.a");
            assert!(first.ends_with("a.yml"));
        }
        other => panic!("expected Duplicate, got {other:?}"),
    }
}

#[test]
fn empty_directory_loads_nothing() {
    let dir = TempDir::new().unwrap();
    assert!(load_specs(dir.path()).unwrap().is_empty());
}

#[test]
fn malformed_yaml_names_the_file() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("bad.yml"), "resources: [").unwrap();
    let err = load_specs(dir.path()).unwrap_err();
    assert!(matches!(err, ConfigError::YamlParse { .. }));
    assert!(err.to_string().contains("bad.yml"));
}

#[test]
fn missing_dir_returns_error() {
    let dir = Path::new("/nonexistent/path/does/not/exist");
    assert!(load_specs(dir).is_err());
}
