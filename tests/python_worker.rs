use batch_redact::{
    config::Config,
    engine::{Detector, PythonDetector},
    error::DetectionError,
};
use image::RgbImage;
use std::path::Path;

fn config_for(scripts_dir: &Path) -> Config {
    let mut cfg = Config::default();
    cfg.paths.scripts_dir = scripts_dir.display().to_string();
    cfg.security.pin_scripts_dir = false;
    cfg
}

#[test]
fn missing_worker_script_is_reported() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = PythonDetector::new(&config_for(dir.path()))
        .err()
        .expect("construction should fail");
    assert!(err.to_string().contains("missing script"));
}

#[test]
fn empty_language_list_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("easyocr_worker.py"), "").expect("write");
    let mut cfg = config_for(dir.path());
    cfg.engine.languages.clear();
    assert!(PythonDetector::new(&cfg).is_err());
}

#[test]
fn pinned_scripts_dir_must_live_under_cwd() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("easyocr_worker.py"), "").expect("write");
    let mut cfg = config_for(dir.path());
    cfg.security.pin_scripts_dir = true;
    let err = PythonDetector::new(&cfg).err().expect("construction should fail");
    assert!(err.to_string().contains("outside cwd"));
}

#[cfg(unix)]
mod fake_worker {
    use super::*;

    // Speaks the worker line protocol from sh so no Python install is needed.
    const ECHO_WORKER: &str = r#"
read hello
echo '{"ok":true,"engine_version":"fake-1"}'
while read line; do
  id=$(printf '%s' "$line" | sed 's/^{"id":\([0-9]*\).*/\1/')
  quad='[[1.0,1.0],[6.0,1.0],[6.9,6.9],[1.0,6.0]]'
  region="{\"quad\":$quad,\"text\":\"hi\",\"confidence\":0.9}"
  echo "{\"id\":$id,\"ok\":true,\"regions\":[$region]}"
done
"#;

    const SLOW_WORKER: &str = r#"
read hello
echo '{"ok":true}'
while read line; do
  sleep 5
done
"#;

    const DYING_WORKER: &str = r#"
read hello
echo '{"ok":true}'
read line
exit 3
"#;

    const REFUSING_WORKER: &str = r#"
read hello
echo '{"ok":false,"error":"no such language: xx"}'
"#;

    fn detector(script: &str, item_timeout: u64) -> (tempfile::TempDir, PythonDetector) {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("easyocr_worker.py"), script).expect("write script");
        let mut cfg = config_for(dir.path());
        cfg.engine.python_exe = "sh".into();
        cfg.engine.startup_timeout_seconds = 10;
        cfg.engine.item_timeout_seconds = item_timeout;
        let detector = PythonDetector::new(&cfg).expect("detector");
        (dir, detector)
    }

    #[test]
    fn persistent_worker_answers_repeated_requests() {
        let (_dir, det) = detector(ECHO_WORKER, 10);
        let img = RgbImage::new(8, 8);
        for _ in 0..3 {
            let regions = det.detect(&img).expect("detect");
            assert_eq!(regions.len(), 1);
            assert_eq!(regions[0].quad.bottom_right.x, 6);
            assert_eq!(regions[0].text.as_deref(), Some("hi"));
            assert!((regions[0].confidence - 0.9).abs() < 1e-6);
        }
    }

    #[test]
    fn slow_worker_times_out() {
        let (_dir, det) = detector(SLOW_WORKER, 1);
        let err = det.detect(&RgbImage::new(4, 4)).unwrap_err();
        assert!(matches!(err, DetectionError::Timeout { seconds: 1 }));
    }

    #[test]
    fn crashed_worker_is_reported_and_respawned() {
        let (_dir, det) = detector(DYING_WORKER, 10);
        let img = RgbImage::new(4, 4);
        let first = det.detect(&img).unwrap_err();
        assert!(matches!(first, DetectionError::Crashed(_)));
        // The next call starts a fresh worker, which dies the same way.
        let second = det.detect(&img).unwrap_err();
        assert!(matches!(second, DetectionError::Crashed(_)));
    }

    #[test]
    fn worker_init_failure_sticks_for_later_items() {
        let (dir, det) = detector(REFUSING_WORKER, 10);
        let err = det.warm_up().unwrap_err();
        assert!(matches!(err, DetectionError::Engine(ref m) if m.contains("no such language")));

        // A respawn would now hang on a worker that never answers.
        std::fs::write(dir.path().join("easyocr_worker.py"), "sleep 30\n").expect("rewrite");
        let started = std::time::Instant::now();
        let later = det.detect(&RgbImage::new(4, 4)).unwrap_err();
        assert!(matches!(
            later,
            DetectionError::Unavailable(ref m) if m.contains("no such language")
        ));
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }
}
