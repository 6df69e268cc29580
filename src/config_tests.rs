use super::*;

fn temp_config_path(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join(name);
    (dir, path)
}

#[test]
fn default_config_is_valid() {
    let config = default_config();
    validate_config(&config).expect("defaults validate");
    assert_eq!(config.retry_budget, 2);
    assert_eq!(config.compile_passes, 2);
    assert_eq!(config.sections, SectionId::ALL.to_vec());
    assert_eq!(config.timeout(), Duration::from_secs(900));
}

#[test]
fn stub_round_trips_through_disk() {
    let (_dir, path) = temp_config_path("nested/rpress.json");
    let config = default_config();
    write_config(&path, &config).expect("write config");
    let loaded = load_config(&path).expect("load config");
    assert_eq!(loaded, config);
    assert!(config_stub().expect("stub").contains("\"schema_version\": 1"));
}

#[test]
fn minimal_file_fills_defaults() {
    let (_dir, path) = temp_config_path("rpress.json");
    std::fs::write(
        &path,
        r#"{"schema_version": 1, "retry_budget": 1, "lm": {"kind": "ollama", "endpoint": "http://localhost:11434", "model": "gemma3"}}"#,
    )
    .expect("write config");
    let config = load_config(&path).expect("load config");
    assert_eq!(config.retry_budget, 1);
    assert_eq!(config.compile_passes, 2);
    assert_eq!(
        config.lm,
        LmConfig::Ollama {
            endpoint: "http://localhost:11434".to_string(),
            model: "gemma3".to_string(),
            temperature: 0.1,
        }
    );
    validate_config(&config).expect("validate");
}

#[test]
fn unknown_fields_are_rejected() {
    let (_dir, path) = temp_config_path("rpress.json");
    std::fs::write(&path, r#"{"schema_version": 1, "retries": 4}"#).expect("write config");
    let err = load_config(&path).unwrap_err();
    assert!(format!("{err:#}").contains("retries"), "{err:#}");
}

#[test]
fn rejects_zero_compile_passes() {
    let mut config = default_config();
    config.compile_passes = 0;
    let err = validate_config(&config).unwrap_err();
    assert!(err.to_string().contains("compile_passes"));
}

#[test]
fn rejects_empty_and_duplicate_sections() {
    let mut config = default_config();
    config.sections.clear();
    assert!(validate_config(&config).is_err());

    config.sections = vec![SectionId::Stats, SectionId::Kpis, SectionId::Stats];
    let err = validate_config(&config).unwrap_err();
    assert!(err.to_string().contains("stats more than once"), "{err}");
}

#[test]
fn rejects_unsupported_schema_version() {
    let mut config = default_config();
    config.schema_version = 2;
    assert!(validate_config(&config).is_err());
}

#[test]
fn rejects_compiler_without_source_placeholder() {
    let mut config = default_config();
    config.compiler.command = "pdflatex report.tex".to_string();
    let err = validate_config(&config).unwrap_err();
    assert!(err.to_string().contains("{source}"), "{err}");

    let mut config = default_config();
    config.compiler.jobname = "../escape".to_string();
    assert!(validate_config(&config).is_err());
}

#[test]
fn rejects_bad_ollama_settings() {
    let mut config = default_config();
    config.lm = LmConfig::Ollama {
        endpoint: "localhost:11434".to_string(),
        model: "gemma3".to_string(),
        temperature: 0.1,
    };
    assert!(validate_config(&config).is_err());
}

#[test]
fn env_command_replaces_backend() {
    let mut config = default_config();
    config.lm = LmConfig::Ollama {
        endpoint: DEFAULT_OLLAMA_ENDPOINT.to_string(),
        model: "gemma3".to_string(),
        temperature: 0.1,
    };
    apply_lm_command_override(&mut config, Some("  ".to_string()));
    assert!(matches!(config.lm, LmConfig::Ollama { .. }));

    apply_lm_command_override(&mut config, Some("llm -m local".to_string()));
    assert_eq!(
        config.lm,
        LmConfig::Command {
            command: "llm -m local".to_string()
        }
    );
}
