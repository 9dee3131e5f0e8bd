use hourglass::{BlockKind, HeadKind, HourglassConfig, HourglassError};
use std::fs;

#[test]
fn test_default_is_standard() {
    let config = HourglassConfig::default();
    assert_eq!(config, HourglassConfig::standard());
    assert_eq!(config.input_channels, 3);
    assert_eq!(config.stem_width, 64);
    assert_eq!(config.num_feats, 128);
    assert_eq!(config.depth, 4);
    assert_eq!(config.num_stacks, 2);
    assert_eq!(config.num_blocks, 1);
    assert_eq!(config.num_classes, 16);
    assert_eq!(config.block, BlockKind::Bottleneck);
    assert_eq!(config.head, HeadKind::Conv);
}

#[test]
fn test_deserialize_with_inplanes_alias() {
    let json = r#"{
        "input_channels": 1,
        "inplanes": 32,
        "num_feats": 64,
        "block": "bottleneck",
        "head": { "type": "multitask", "groups": [2, 2, 1] },
        "depth": 3,
        "num_stacks": 4,
        "num_blocks": 2,
        "num_classes": 5
    }"#;

    let config = HourglassConfig::from_json(json).unwrap();
    assert_eq!(config.input_channels, 1);
    assert_eq!(config.stem_width, 32);
    assert_eq!(config.channels(), 128);
    assert_eq!(config.resolution_factor(), 32);
    assert_eq!(
        config.head,
        HeadKind::Multitask {
            groups: vec![2, 2, 1]
        }
    );
}

#[test]
fn test_missing_fields_take_defaults() {
    let config = HourglassConfig::from_json(r#"{ "num_stacks": 8 }"#).unwrap();
    assert_eq!(config.num_stacks, 8);
    assert_eq!(config.depth, 4);
    assert_eq!(config.head, HeadKind::Conv);
}

#[test]
fn test_serialize_roundtrip() {
    let config = HourglassConfig {
        num_classes: 9,
        ..HourglassConfig::standard()
    };
    let json = serde_json::to_string(&config).unwrap();
    assert!(json.contains("\"stem_width\":64"));
    assert!(json.contains("\"type\":\"conv\""));
    assert_eq!(HourglassConfig::from_json(&json).unwrap(), config);
}

#[test]
fn test_invalid_values_rejected() {
    let result = HourglassConfig::from_json(r#"{ "depth": 0 }"#);
    assert!(matches!(result, Err(HourglassError::InvalidConfig(_))));

    let result = HourglassConfig::from_json(r#"{ "num_classes": 0 }"#);
    assert!(matches!(result, Err(HourglassError::InvalidConfig(_))));

    let result = HourglassConfig::from_json(r#"{ "depth": "four" }"#);
    assert!(matches!(result, Err(HourglassError::Json(_))));
}

#[test]
fn test_from_file() {
    let test_dir =
        std::env::temp_dir().join(format!("hourglass-config-test-{}", std::process::id()));
    let _ = fs::remove_dir_all(&test_dir);
    fs::create_dir_all(&test_dir).unwrap();

    let path = test_dir.join("hourglass.json");
    fs::write(&path, r#"{ "depth": 2, "num_classes": 3 }"#).unwrap();
    let config = HourglassConfig::from_file(&path).unwrap();
    assert_eq!(config.depth, 2);
    assert_eq!(config.num_classes, 3);

    let missing = HourglassConfig::from_file(test_dir.join("missing.json"));
    assert!(matches!(missing, Err(HourglassError::Io(_))));

    fs::remove_dir_all(&test_dir).ok();
}
