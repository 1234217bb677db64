//! Integration tests for Warden

mod lifecycle;

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn warden() -> Command {
        cargo_bin_cmd!("warden")
    }

    /// Config file keeping all worker state inside `temp`
    fn isolated_config(temp: &TempDir) -> std::path::PathBuf {
        let config = temp.path().join("config.toml");
        let state = temp.path().join("state");
        std::fs::write(
            &config,
            format!(
                "[worker]\nstate_dir = {:?}\n\n[mounts]\nrequired_free_space_mb = 0\n\n[ports]\ncapacity = 2\n",
                state.display().to_string()
            ),
        )
        .unwrap();
        config
    }

    fn write_directory_cache(state: &Path, name: &str) {
        let location = state.join("caches").join(name);
        std::fs::create_dir_all(&location).unwrap();
        let mut table = serde_json::Map::new();
        table.insert(
            name.to_string(),
            serde_json::json!({
                "created": "2026-01-01T00:00:00Z",
                "location": location,
                "hits": 3,
                "key": name,
                "ownerUsername": "",
                "mounterUID": null,
                "mounterGID": null
            }),
        );
        std::fs::write(
            state.join("directory-caches.json"),
            serde_json::to_string(&table).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn help_displays() {
        warden()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("resource layer"));
    }

    #[test]
    fn version_displays() {
        warden()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("warden"));
    }

    #[test]
    fn config_path() {
        let temp = TempDir::new().unwrap();
        let config = isolated_config(&temp);
        warden()
            .arg("--config")
            .arg(&config)
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show() {
        let temp = TempDir::new().unwrap();
        let config = isolated_config(&temp);
        warden()
            .arg("--config")
            .arg(&config)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[mounts]"))
            .stdout(predicate::str::contains("worker:cache:"));
    }

    #[test]
    fn invalid_config_is_reported() {
        let temp = TempDir::new().unwrap();
        let config = temp.path().join("config.toml");
        std::fs::write(&config, "[ports]\ncapacity = 0\n").unwrap();
        warden()
            .arg("--config")
            .arg(&config)
            .arg("ports")
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid configuration"));
    }

    #[test]
    fn cache_list_empty() {
        let temp = TempDir::new().unwrap();
        let config = isolated_config(&temp);
        warden()
            .arg("--config")
            .arg(&config)
            .args(["cache", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No caches found"));
    }

    #[test]
    fn cache_list_and_evict() {
        let temp = TempDir::new().unwrap();
        let config = isolated_config(&temp);
        let state = temp.path().join("state");
        write_directory_cache(&state, "gradle");

        warden()
            .arg("--config")
            .arg(&config)
            .args(["cache", "list", "--format", "plain"])
            .assert()
            .success()
            .stdout(predicate::str::contains("gradle"));

        warden()
            .arg("--config")
            .arg(&config)
            .args(["cache", "evict", "gradle", "--kind", "directories"])
            .assert()
            .success();

        assert!(!state.join("caches/gradle").exists());
        warden()
            .arg("--config")
            .arg(&config)
            .args(["cache", "list", "--format", "json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("gradle").not());
    }

    #[test]
    fn cache_evict_unknown_key() {
        let temp = TempDir::new().unwrap();
        let config = isolated_config(&temp);
        warden()
            .arg("--config")
            .arg(&config)
            .args(["cache", "evict", "nonexistent"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("No cache with key"));
    }

    #[test]
    fn cache_gc_with_enough_space() {
        let temp = TempDir::new().unwrap();
        let config = isolated_config(&temp);
        warden()
            .arg("--config")
            .arg(&config)
            .args(["cache", "gc", "--dry-run"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Nothing to collect"));
    }

    #[test]
    fn ports_lists_every_slot() {
        let temp = TempDir::new().unwrap();
        let config = isolated_config(&temp);
        warden()
            .arg("--config")
            .arg(&config)
            .args(["ports", "--format", "plain"])
            .assert()
            .success()
            .stdout(predicate::str::contains("60098 60099 53654 34569"))
            .stdout(predicate::str::contains("60102 60103 53658 34573"));
    }
}
