use std::io::Write;

use stackjit::config::{JitMode, OnFault, RuntimeConfig, Target};

#[test]
fn test_load_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        "jit_mode = \"off\"\njit_threshold = 5\non_fault = \"halt\"\ntarget = \"x86_64-win64\""
    )
    .unwrap();

    let config = RuntimeConfig::load(file.path()).unwrap();
    assert_eq!(config.jit_mode, JitMode::Off);
    assert_eq!(config.jit_threshold, 5);
    assert_eq!(config.on_fault, OnFault::Halt);
    assert_eq!(config.target, Target::X86_64Win64);
    assert_eq!(config.call_stack_size, RuntimeConfig::default().call_stack_size);
}

#[test]
fn test_missing_file_names_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.toml");
    let err = RuntimeConfig::load(&path).unwrap_err();
    assert!(err.to_string().contains("absent.toml"));
}

#[test]
fn test_bad_value_rejected() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "jit_mode = \"sometimes\"").unwrap();
    assert!(RuntimeConfig::load(file.path()).is_err());
}
