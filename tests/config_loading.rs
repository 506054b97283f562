use std::io::Write;

use planwise_core::config::AppConfig;
use planwise_core::types::ThinkingLevel;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[agent]
max_turns = 10
working_dir = "/tmp/planwise-test"

[model]
provider = "anthropic"
model_id = "claude-sonnet-4-20250514"
api_key = "sk-test-key"
max_tokens = 4096
temperature = 0.5

[[fallback_models]]
provider = "openai"
model_id = "gpt-4o"

[agents.planner]
model_id = "claude-opus-4-20250514"
thinking = "high"

[agents.coder]
max_tokens = 16000

[workflow]
max_plan_revisions = 2
artifacts_dir = "./out"
clean_artifacts = false

[tools]
python_bin = "python3.12"
bash_timeout_secs = 30
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.agent.max_turns, 10);
    assert_eq!(config.model.provider, "anthropic");
    assert_eq!(config.model.api_key, Some("sk-test-key".to_string()));
    assert_eq!(config.model.max_tokens, 4096);
    assert_eq!(config.fallback_models.len(), 1);
    assert_eq!(config.fallback_models[0].provider, "openai");

    assert_eq!(config.workflow.max_plan_revisions, 2);
    assert_eq!(config.workflow.artifacts_dir, "./out");
    assert!(!config.workflow.clean_artifacts);
    assert_eq!(config.tools.python_bin, "python3.12");
    assert_eq!(config.tools.bash_timeout_secs, 30);
    assert_eq!(config.tools.python_timeout_secs, 600);

    let planner = config.model_for("planner");
    assert_eq!(planner.model_id, "claude-opus-4-20250514");
    assert_eq!(planner.thinking, ThinkingLevel::High);
    assert_eq!(planner.max_tokens, 4096);

    let coder = config.model_for("coder");
    assert_eq!(coder.model_id, "claude-sonnet-4-20250514");
    assert_eq!(coder.max_tokens, 16000);

    let supervisor = config.model_for("supervisor");
    assert!(supervisor.prompt_cache);
    assert!(supervisor.tool_cache);
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("PLANWISE_TEST_API_KEY", "expanded-key-value");

    let toml_content = r#"
[model]
model_id = "test-model"
api_key = "${PLANWISE_TEST_API_KEY}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.model.api_key, Some("expanded-key-value".to_string()));

    std::env::remove_var("PLANWISE_TEST_API_KEY");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let toml_content = r#"
[model]
model_id = "llama3.2"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.model.provider, "anthropic");
    assert_eq!(config.agent.max_turns, 25);
    assert_eq!(config.workflow.max_plan_revisions, 10);
    assert!(config.workflow.clean_artifacts);
    assert_eq!(config.tools.worker_timeout_secs, 1800);
    assert!(config.agents.is_empty());
    assert!(config.prompts.dir.is_none());
}

#[test]
fn test_missing_file_is_config_not_found() {
    let err = AppConfig::load(std::path::Path::new("/nonexistent/planwise.toml")).unwrap_err();
    assert!(err.to_string().contains("/nonexistent/planwise.toml"));
}

#[test]
fn test_config_round_trips_through_toml() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = planwise_test_utils::test_config(dir.path());
    let rendered = toml::to_string_pretty(&config).expect("serialize");
    let reparsed: AppConfig = toml::from_str(&rendered).expect("parse");
    assert_eq!(reparsed.model.model_id, "mock-model");
    assert_eq!(reparsed.workflow.max_plan_revisions, 3);
}
