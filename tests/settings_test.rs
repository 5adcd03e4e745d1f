use indexmap::IndexMap;
use proptest::prelude::*;
use tempfile::TempDir;

use hop3_agent::env::Env;
use hop3_agent::error::AgentError;
use hop3_agent::settings::{fingerprint, parse_pairs, parse_settings, write_settings};

#[test]
fn test_env_file_with_comments_and_expansion() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ENV");
    std::fs::write(
        &path,
        "# app settings\n\nDATA=/srv/data\nUPLOADS=${DATA}/uploads\nGREETING = hello $NAME\n",
    )
    .unwrap();

    let mut env = Env::from_pairs([("NAME", "world")]);
    env.parse_settings(&path).unwrap();

    assert_eq!(env.get("UPLOADS"), Some("/srv/data/uploads"));
    assert_eq!(env.get("GREETING"), Some("hello world"));
}

#[test]
fn test_malformed_env_file_leaves_env_untouched() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ENV");
    std::fs::write(&path, "A=1\nthis line is broken\nB=2\n").unwrap();

    let mut env = Env::from_pairs([("KEEP", "yes")]);
    let err = env.parse_settings(&path).unwrap_err();

    assert!(matches!(err, AgentError::MalformedSetting { .. }));
    assert_eq!(env.len(), 1);
    assert_eq!(env.get("KEEP"), Some("yes"));
}

#[test]
fn test_missing_env_file_is_noop() {
    let dir = TempDir::new().unwrap();
    let mut env = Env::new();
    env.parse_settings(&dir.path().join("ENV")).unwrap();
    assert!(env.is_empty());
}

#[test]
fn test_scaling_file_uses_colons() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("venv").join("SCALING");

    write_settings(&path, [("web", 2), ("wsgi", 1)], ':').unwrap();
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "web:2\nwsgi:1\n");

    let pairs = parse_pairs(&path, ':').unwrap();
    assert_eq!(pairs.get("web").map(String::as_str), Some("2"));
}

#[test]
fn test_fingerprint_tracks_content() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("SCALING");
    assert_eq!(fingerprint(&path).unwrap(), None);

    std::fs::write(&path, "web:1\n").unwrap();
    let first = fingerprint(&path).unwrap().unwrap();
    assert_eq!(first.len(), 64);

    std::fs::write(&path, "web:2\n").unwrap();
    assert_ne!(fingerprint(&path).unwrap().unwrap(), first);
}

proptest! {
    #[test]
    fn test_env_survives_write_and_reparse(
        pairs in prop::collection::btree_map("[A-Z][A-Z0-9_]{0,8}", "[a-z0-9/._:-]{0,12}", 0..8)
    ) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("LIVE_ENV");

        let env = Env::from_pairs(pairs.clone());
        env.write(&path).unwrap();
        let parsed = parse_settings(&path, &IndexMap::new()).unwrap();

        let expected: IndexMap<String, String> = pairs.into_iter().collect();
        prop_assert_eq!(parsed.len(), expected.len());
        for (key, value) in &expected {
            prop_assert_eq!(parsed.get(key), Some(value));
        }
    }
}
