use std::{path::PathBuf, process::Command};

fn exe() -> PathBuf {
    std::env::var_os("CARGO_BIN_EXE_texture-worker")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let mut p = PathBuf::from("target").join("debug");
            p.push(if cfg!(windows) {
                "texture-worker.exe"
            } else {
                "texture-worker"
            });
            p
        })
}

#[test]
fn cli_rejects_zero_concurrency() {
    let out = Command::new(exe())
        .args(["--concurrency", "0"])
        .output()
        .unwrap();
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("concurrency"), "{stderr}");
}

#[test]
fn cli_rejects_unknown_config_fields() {
    let dir = PathBuf::from("target").join("cli_smoke");
    std::fs::create_dir_all(&dir).unwrap();
    let cfg_path = dir.join("bad.json");
    std::fs::write(&cfg_path, r#"{"concurrency": 2, "gputrace": true}"#).unwrap();

    let out = Command::new(exe())
        .arg("--config")
        .arg(&cfg_path)
        .output()
        .unwrap();
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("config error"), "{stderr}");
}
