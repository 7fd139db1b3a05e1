use binscope::{parse_address, parse_arch, GlobalOptions};
use binscope_core::model::Architecture;

#[test]
fn addresses_parse_as_hex_or_decimal() {
    assert_eq!(parse_address("0x1000").unwrap(), 0x1000);
    assert_eq!(parse_address("0X20").unwrap(), 0x20);
    assert_eq!(parse_address("4096").unwrap(), 4096);
    assert!(parse_address("0xzz").is_err());
}

#[test]
fn architecture_names_are_validated() {
    assert_eq!(parse_arch("x86_64").unwrap(), Architecture::X86_64);
    let err = parse_arch("vax").unwrap_err().to_string();
    assert!(err.contains("Unknown architecture"), "{err}");
}

#[test]
fn flags_override_config_file_values() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("binscope.yaml");
    std::fs::write(&path, "max_depth: 2\nworkers: 3\n").unwrap();

    let opts = GlobalOptions {
        config: Some(path),
        max_depth: Some(5),
        arch: Some("arm".into()),
        ..GlobalOptions::default()
    };
    let config = opts.analysis_config().unwrap();
    assert_eq!(config.max_depth, 5);
    assert_eq!(config.workers, 3);
    assert_eq!(config.arch, Some(Architecture::Arm));
}

#[test]
fn invalid_flag_values_fail_validation() {
    let opts = GlobalOptions { max_depth: Some(0), ..GlobalOptions::default() };
    assert!(opts.analysis_config().is_err());
}
