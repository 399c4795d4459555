#[cfg(unix)]
mod unix_tests {
    // The daemon writes its log and exits cleanly on Ctrl+C (SIGINT).
    use std::process::{Command, Stdio};
    use std::time::{Duration, Instant};

    fn wait_for<F: FnMut() -> bool>(timeout: Duration, mut f: F) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if f() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        false
    }

    #[test]
    fn serve_creates_log_and_exits_on_sigint() {
        let home = std::env::temp_dir()
            .join(format!("ignition-daemon-ux-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&home).unwrap();

        let cfg_path = home.join("config.json");
        let data_dir = home.join("state");
        std::fs::write(
            &cfg_path,
            format!(
                r#"{{
                  "data_dir":"{}",
                  "mirrors":["wss://127.0.0.1:1/wisp/"]
                }}"#,
                data_dir.display()
            ),
        )
        .unwrap();

        let exe = env!("CARGO_BIN_EXE_ignition-hub");
        let mut child = Command::new(exe)
            .arg("-c")
            .arg(&cfg_path)
            .arg("serve")
            .arg("--listen")
            .arg("127.0.0.1:0")
            .stdout(Stdio::null())
            .spawn()
            .expect("spawn daemon");

        let log_path = data_dir.join("logs").join("ignition-hub.log");
        let saw_control_plane = wait_for(Duration::from_secs(5), || {
            std::fs::read_to_string(&log_path)
                .ok()
                .map(|s| s.contains("control plane started") && s.contains("bound_addr="))
                .unwrap_or(false)
        });
        assert!(saw_control_plane, "expected control plane start in log");

        let pid = child.id();
        let status = Command::new("kill")
            .arg("-INT")
            .arg(pid.to_string())
            .status()
            .expect("send SIGINT");
        assert!(status.success());

        let exited = wait_for(Duration::from_secs(3), || {
            child.try_wait().ok().flatten().is_some()
        });
        if !exited {
            let _ = Command::new("kill")
                .arg("-KILL")
                .arg(pid.to_string())
                .status();
            panic!("daemon did not exit after SIGINT");
        }
        let st = child.wait().unwrap();
        assert!(st.success());
    }
}
