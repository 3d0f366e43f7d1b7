use std::io::Write;
use std::path::Path;

use plait_core::config::AppConfig;
use plait_core::error::PlaitError;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
templates_dir = "prompts"

[engine]
default_max_context_tokens = 4000
default_max_output_tokens = 512

[store]
max_finished_runs = 16
finished_grace_secs = 30

[log]
log_dir = "run-logs"
level = 3

[[profiles]]
id = "writer"
provider = "openai"
model_id = "gpt-4o"
max_output_tokens = 800

[profiles.gen_params]
temperature = 0.8
topP = 0.95

[[profiles]]
id = "editor"
model_id = "gpt-4o-mini"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.default_max_context_tokens, 4000);
    assert_eq!(config.engine.default_max_output_tokens, 512);
    assert_eq!(config.store.max_finished_runs, 16);
    assert_eq!(config.store.finished_grace_secs, 30);

    let log = config.log.as_ref().expect("log present");
    assert!(log.enabled);
    assert_eq!(log.level, 3);

    let base = Path::new("/srv/plait");
    assert_eq!(config.templates_path(base), base.join("prompts"));
    assert_eq!(config.log_path(base), Some(base.join("run-logs")));

    assert_eq!(config.profiles.len(), 2);
    let writer = config.profile("writer").expect("writer profile");
    assert_eq!(writer.model_id, "gpt-4o");
    assert_eq!(writer.max_output_tokens, Some(800));
    let params = writer.gen_params.as_ref().expect("gen params");
    assert_eq!(params.temperature, Some(0.8));
    assert_eq!(params.top_p, Some(0.95));
    assert!(config.profile("editor").expect("editor").gen_params.is_none());
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("PLAIT_TEST_MODEL", "expanded-model");

    let toml_content = r#"
[[profiles]]
id = "default"
model_id = "${PLAIT_TEST_MODEL}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.profile("default").unwrap().model_id, "expanded-model");

    std::env::remove_var("PLAIT_TEST_MODEL");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"# nothing configured\n").expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.default_max_context_tokens, 8_192);
    assert_eq!(config.engine.default_max_output_tokens, 1_024);
    assert_eq!(config.store.max_finished_runs, 256);
    assert!(config.log.is_none());
    assert!(config.log_path(Path::new(".")).is_none());
    assert_eq!(config.templates_dir, "templates");
    assert!(config.profiles.is_empty());
}

#[test]
fn test_missing_file_and_bad_toml() {
    let err = AppConfig::load(Path::new("/nonexistent/plait.toml")).unwrap_err();
    assert!(matches!(err, PlaitError::ConfigNotFound(_)));

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[engine\ndefault_max_context_tokens = 1").expect("write toml");
    let err = AppConfig::load(tmp.path()).unwrap_err();
    assert!(matches!(err, PlaitError::Config(_)));
}

#[test]
fn test_default_matches_empty_file() {
    let from_toml = AppConfig::from_toml("").expect("parse");
    let default = AppConfig::default();
    assert_eq!(
        from_toml.engine.default_max_context_tokens,
        default.engine.default_max_context_tokens
    );
    assert_eq!(from_toml.templates_dir, default.templates_dir);
    assert_eq!(
        from_toml.store.finished_grace_secs,
        default.store.finished_grace_secs
    );
}
