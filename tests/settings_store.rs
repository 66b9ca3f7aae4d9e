use secured_publisher::crypto::generate_secret_hex;
use secured_publisher::settings::MIGRATED_SECRET_LABEL;
use secured_publisher::{JsonFileSettingsStore, Settings, SettingsStore};

#[test]
fn missing_file_loads_as_none() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileSettingsStore::new(dir.path().join("settings.json"));
    assert!(store.load().unwrap().is_none());
}

#[test]
fn save_then_load_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileSettingsStore::new(dir.path().join("nested/settings.json"));

    let mut settings = Settings::default();
    settings.endpoint = "mqtts://broker.example:8883".into();
    settings.timestamp_key = Some("000102030405060708090a0b0c0d0e0f".into());
    settings
        .actions
        .add_secret(1, &generate_secret_hex(), Some("front".into()))
        .unwrap();
    store.save(&settings).unwrap();

    assert_eq!(store.load().unwrap(), Some(settings));
    assert!(!store.path().with_extension("tmp").exists());

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}

#[test]
fn legacy_document_is_migrated_and_rewritten() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.json");
    let key = generate_secret_hex();
    let legacy = format!(
        r#"{{
            "homeTitle": "Home",
            "endpoint": "broker.example",
            "clientID": "SMP Client-1",
            "certificate": "",
            "privateKey": "",
            "isBiometricAuthEnabled": false,
            "isUnusedButtonHidden": true,
            "actions": [
                {{"title": "Door", "topic": "home/door", "message": "open", "nfcSecret": "{key}"}},
                {{"title": "", "topic": "", "message": "", "nfcSecret": ""}},
                {{"title": "", "topic": "", "message": ""}},
                {{"title": "", "topic": "", "message": ""}}
            ]
        }}"#
    );
    std::fs::write(&path, legacy).unwrap();

    let store = JsonFileSettingsStore::new(&path);
    let settings = store.load().unwrap().unwrap();
    assert_eq!(settings.home_title, "Home");
    assert!(settings.root_ca.is_none());
    let door = settings.actions.get(0).unwrap();
    assert_eq!(door.secrets().len(), 1);
    assert_eq!(door.secrets()[0].key_material(), key);
    assert_eq!(door.secrets()[0].label(), Some(MIGRATED_SECRET_LABEL));
    assert!(settings.actions.get(1).unwrap().secrets().is_empty());

    store.save(&settings).unwrap();
    let raw = std::fs::read_to_string(&path).unwrap();
    assert!(!raw.contains("\"nfcSecret\""));
    assert!(raw.contains("\"nfcSecrets\""));
    // The migrated secret keeps its identity on the next load.
    assert_eq!(store.load().unwrap(), Some(settings));
}

#[test]
fn corrupt_document_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.json");
    std::fs::write(&path, "{").unwrap();
    let err = JsonFileSettingsStore::new(&path).load().unwrap_err();
    assert!(err.to_string().contains("invalid settings file"));
}
