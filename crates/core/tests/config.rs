use binscope_core::config::{AnalysisConfig, ConfigError, DEFAULT_MAX_DEPTH};
use binscope_core::model::Architecture;

#[test]
fn defaults_are_valid() {
    let config = AnalysisConfig::default();
    config.validate().unwrap();
    assert_eq!(config.max_depth, DEFAULT_MAX_DEPTH);
    assert_eq!(config.decoder, "capstone");
    assert!(config.no_return.iter().any(|n| n == "abort"));
    assert!(config.time_budget().is_none());
}

#[test]
fn yaml_config_overrides_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("binscope.yaml");
    std::fs::write(&path, "max_depth: 3\narch: mips32el\ntime_budget_secs: 30\n").unwrap();
    let config = AnalysisConfig::load(&path).unwrap();

    assert_eq!(config.max_depth, 3);
    assert_eq!(config.arch, Some(Architecture::Mips32El));
    assert_eq!(config.time_budget().map(|d| d.as_secs()), Some(30));
    assert_eq!(config.max_entry_size, AnalysisConfig::default().max_entry_size);
}

#[test]
fn json_config_is_detected_by_extension() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("binscope.json");
    std::fs::write(&path, r#"{"workers": 4, "base_address": 4096}"#).unwrap();
    let config = AnalysisConfig::load(&path).unwrap();
    assert_eq!(config.workers, 4);
    assert_eq!(config.base_address, 0x1000);
}

#[test]
fn invalid_values_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.yaml");
    std::fs::write(&path, "max_depth: 0\n").unwrap();
    assert!(matches!(AnalysisConfig::load(&path), Err(ConfigError::Invalid(_))));

    let config = AnalysisConfig { decoder: " ".into(), ..AnalysisConfig::default() };
    assert!(config.validate().is_err());
}

#[test]
fn architecture_aliases_parse() {
    assert_eq!("amd64".parse::<Architecture>().unwrap(), Architecture::X86_64);
    assert_eq!("aarch64".parse::<Architecture>().unwrap(), Architecture::Arm64);
    assert_eq!("mipsel".parse::<Architecture>().unwrap(), Architecture::Mips32El);
    assert!("sparc".parse::<Architecture>().is_err());
}
