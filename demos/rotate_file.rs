use std::{path::PathBuf, sync::Arc, time::Duration};

use chrono::{Local, TimeZone};
use routelog::{Destination, HookLogger, ManualClock, RotateFile, RotateFileConfig, RouteHook};

fn main() {
    let dir = PathBuf::from("/tmp/routelog_example_rotation");
    let _ = std::fs::remove_dir_all(&dir);

    // Simulated time, so an hour passes between two lines.
    let clock = Arc::new(ManualClock::new(
        Local.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap(),
    ));
    let config = RotateFileConfig {
        rotation_count: Some(3),
        max_age: None,
        ..RotateFileConfig::new(dir.join("app.log"))
            .with_times(Duration::ZERO, Duration::from_secs(3600))
    };
    let file = Arc::new(RotateFile::with_clock(config, clock.clone()).unwrap());

    let logger = Arc::new(HookLogger::new());
    let hook = Arc::new(RouteHook::new(
        Arc::clone(&file) as Arc<dyn Destination>,
        None,
    ));
    hook.apply(&logger);
    let log = logger.with_module("rotation-demo");

    for i in 0..10 {
        log.info(format!("Log message number {i}"));
        clock.advance(Duration::from_secs(3600));
    }
    file.close().unwrap();

    let files: Vec<String> = std::fs::read_dir(&dir)
        .unwrap()
        .flatten()
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|name| name.starts_with("app.log."))
        .collect();

    println!("\n--- Rotation Summary ---");
    println!("Log directory: {}", dir.display());
    println!("Files remaining (rotation_count=3): {}", files.len());
    for f in &files {
        println!("  {f}");
    }
    println!(
        "app.log -> {}",
        std::fs::read_link(dir.join("app.log")).unwrap().display()
    );
    assert!(files.len() <= 3, "rotation_count cleanup should keep at most 3");
}
