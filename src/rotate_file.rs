use std::{
    collections::HashMap,
    ffi::OsString,
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeZone};
use regex::Regex;

use crate::{Destination, Level, config::ROUTELOG_CONFIG};

/// File name suffix appended to the base path, a `chrono` format string.
pub const DEFAULT_PATTERN: &str = "%Y%m%d%H%M";

#[cfg(not(test))]
mod limits {
    pub const MIN_ROTATION_SECS: u64 = 60;
    pub const MIN_FILE_SIZE: u64 = 4_096;
}

#[cfg(test)]
mod limits {
    pub const MIN_ROTATION_SECS: u64 = 1;
    pub const MIN_FILE_SIZE: u64 = 16;
}

/// Source of the current time for rotation decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Local>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Local>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Local>) {
        *self.now.lock().unwrap() = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += chrono::Duration::from_std(by).unwrap_or(chrono::Duration::MAX);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Local> {
        *self.now.lock().unwrap()
    }
}

/// Configuration of a rotating file.
#[derive(Debug, Clone)]
pub struct RotateFileConfig {
    /// Base path. Files are `{path}.{pattern}` and `{path}` itself is kept
    /// as a symlink to the current file.
    pub path: PathBuf,
    pub pattern: String,
    /// Files whose period started longer ago are removed on rotation.
    pub max_age: Option<Duration>,
    /// Length of one period; file names are aligned on period starts.
    pub rotation_time: Duration,
    /// Start a new generation (`{path}.{stamp}.{n}`) once the file would
    /// grow past this many bytes.
    pub max_size: Option<u64>,
    /// Keep at most this many files. Exclusive with `max_age`.
    pub rotation_count: Option<usize>,
    /// Maintain the `{path}` symlink.
    pub link: bool,
    /// Also copy every write to standard output.
    pub stdout: bool,
}

impl RotateFileConfig {
    /// Defaults: seven days retention, daily rotation, unless overridden by
    /// `ROUTELOG_MAX_AGE_HOURS` / `ROUTELOG_ROTATION_HOURS`.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            pattern: DEFAULT_PATTERN.into(),
            max_age: Some(Duration::from_secs(ROUTELOG_CONFIG.MAX_AGE_HOURS * 3600)),
            rotation_time: Duration::from_secs(ROUTELOG_CONFIG.ROTATION_HOURS * 3600),
            max_size: None,
            rotation_count: None,
            link: true,
            stdout: false,
        }
    }

    pub fn with_times(self, max_age: Duration, rotation_time: Duration) -> Self {
        Self {
            max_age: Some(max_age),
            rotation_time,
            ..self
        }
    }
}

struct State {
    file: Option<File>,
    stamp: String,
    generation: u32,
    size: u64,
    current: Option<PathBuf>,
}

/// A destination that switches to a new file every period and prunes files
/// past the retention window.
pub struct RotateFile {
    config: RotateFileConfig,
    clock: Arc<dyn Clock>,
    stdout: AtomicBool,
    matcher: Regex,
    state: Mutex<State>,
}

impl RotateFile {
    /// Rotating file at `path` with default retention and rotation.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, io::Error> {
        Self::new(RotateFileConfig::new(path))
    }

    pub fn new(config: RotateFileConfig) -> Result<Self, io::Error> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: RotateFileConfig, clock: Arc<dyn Clock>) -> Result<Self, io::Error> {
        if config.rotation_time.as_secs() < limits::MIN_ROTATION_SECS {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "rotation_time must be at least {} s",
                    limits::MIN_ROTATION_SECS
                ),
            ));
        }
        if let Some(max_size) = config.max_size
            && max_size < limits::MIN_FILE_SIZE
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("max_size must be at least {} bytes", limits::MIN_FILE_SIZE),
            ));
        }
        if config.max_age.is_some() && config.rotation_count.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "max_age and rotation_count cannot both be set",
            ));
        }
        if config.rotation_count == Some(0) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "rotation_count must be at least 1",
            ));
        }
        if config.pattern.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "pattern must not be empty",
            ));
        }
        let Some(base_name) = config.path.file_name().and_then(|name| name.to_str()) else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} has no usable file name", config.path.display()),
            ));
        };
        let matcher = Regex::new(&format!(
            r"^{}\.(?P<stamp>.+?)(?:\.(?P<generation>\d+))?$",
            regex::escape(base_name)
        ))
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        if let Some(parent) = config.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        Ok(Self {
            stdout: AtomicBool::new(config.stdout),
            config,
            clock,
            matcher,
            state: Mutex::new(State {
                file: None,
                stamp: String::new(),
                generation: 0,
                size: 0,
                current: None,
            }),
        })
    }

    pub fn config(&self) -> &RotateFileConfig {
        &self.config
    }

    pub fn set_stdout(&self, stdout: bool) {
        self.stdout.store(stdout, Ordering::Relaxed);
    }

    /// Whether writes are copied to standard output.
    pub fn stdout(&self) -> bool {
        self.stdout.load(Ordering::Relaxed)
    }

    /// Path of the file currently written to, if one is open.
    pub fn current_path(&self) -> Option<PathBuf> {
        self.state.lock().unwrap().current.clone()
    }

    fn period_stamp(&self, now: DateTime<Local>) -> String {
        let period = self.config.rotation_time.as_secs().max(1) as i64;
        let secs = now.timestamp();
        let start = Local
            .timestamp_opt(secs - secs.rem_euclid(period), 0)
            .single()
            .unwrap_or(now);
        start.format(&self.config.pattern).to_string()
    }

    fn file_name(&self, stamp: &str, generation: u32) -> PathBuf {
        let mut name = OsString::from(self.config.path.as_os_str());
        name.push(".");
        name.push(stamp);
        if generation > 0 {
            name.push(format!(".{generation}"));
        }
        PathBuf::from(name)
    }

    fn rotate(&self, state: &mut State) -> io::Result<()> {
        if let Some(mut file) = state.file.take() {
            file.flush()?;
        }
        let (path, file, size) = loop {
            let path = self.file_name(&state.stamp, state.generation);
            let file = File::options().create(true).append(true).open(&path)?;
            let size = file.metadata()?.len();
            match self.config.max_size {
                Some(max_size) if size >= max_size => state.generation += 1,
                _ => break (path, file, size),
            }
        };
        state.file = Some(file);
        state.size = size;
        state.current = Some(path.clone());
        if self.config.link {
            self.link(&path)?;
        }
        self.cleanup(&path);
        Ok(())
    }

    #[cfg(unix)]
    fn link(&self, target: &Path) -> io::Result<()> {
        let link = &self.config.path;
        let mut tmp = OsString::from(link.as_os_str());
        tmp.push("_symlink");
        let tmp = PathBuf::from(tmp);
        let _ = fs::remove_file(&tmp);
        let target = match target.file_name() {
            Some(name) if target.parent() == link.parent() => PathBuf::from(name),
            _ => target.to_path_buf(),
        };
        std::os::unix::fs::symlink(&target, &tmp)?;
        fs::rename(&tmp, link)
    }

    #[cfg(not(unix))]
    fn link(&self, _target: &Path) -> io::Result<()> {
        Ok(())
    }

    fn parse_stamp(&self, stamp: &str) -> Option<DateTime<Local>> {
        let naive = NaiveDateTime::parse_from_str(stamp, &self.config.pattern)
            .ok()
            .or_else(|| {
                NaiveDate::parse_from_str(stamp, &self.config.pattern)
                    .ok()
                    .and_then(|date| date.and_hms_opt(0, 0, 0))
            })?;
        Local.from_local_datetime(&naive).earliest()
    }

    /// Rotated files of this base path, oldest first.
    fn rotated_files(&self) -> Vec<(DateTime<Local>, u32, PathBuf)> {
        let folder = match self.config.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let Ok(entries) = fs::read_dir(folder) else {
            return Vec::new();
        };
        let mut files: Vec<_> = entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                let captures = self.matcher.captures(&name)?;
                let time = self.parse_stamp(captures.name("stamp")?.as_str())?;
                let generation = captures
                    .name("generation")
                    .and_then(|generation| generation.as_str().parse().ok())
                    .unwrap_or(0);
                Some((time, generation, entry.path()))
            })
            .collect();
        files.sort();
        files
    }

    fn cleanup(&self, current: &Path) {
        let mut files = self.rotated_files();
        files.retain(|(_, _, path)| path.file_name() != current.file_name());
        if let Some(max_age) = self.config.max_age {
            let now = self.clock.now();
            for (time, _, path) in &files {
                if let Ok(age) = (now - *time).to_std()
                    && age > max_age
                {
                    let _ = fs::remove_file(path);
                }
            }
        }
        if let Some(count) = self.config.rotation_count {
            // The current file counts towards the limit.
            let excess = (files.len() + 1).saturating_sub(count);
            for (_, _, path) in files.iter().take(excess) {
                let _ = fs::remove_file(path);
            }
        }
    }
}

impl Destination for RotateFile {
    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        let stamp = self.period_stamp(self.clock.now());
        if state.file.is_none() || state.stamp != stamp {
            if state.stamp != stamp {
                state.stamp = stamp;
                state.generation = 0;
            }
            self.rotate(&mut state)?;
        } else if let Some(max_size) = self.config.max_size
            && state.size > 0
            && state.size + buf.len() as u64 > max_size
        {
            state.generation += 1;
            self.rotate(&mut state)?;
        }
        let Some(file) = state.file.as_mut() else {
            return Err(io::Error::other("rotating file is not open"));
        };
        file.write_all(buf)?;
        state.size += buf.len() as u64;
        drop(state);
        // The bytes are in the file by now, so a failing copy is only reported.
        if self.stdout.load(Ordering::Relaxed) {
            let mut stdout = io::stdout().lock();
            if let Err(err) = stdout.write_all(buf).and_then(|()| stdout.flush()) {
                eprintln!("failed to copy log entry to stdout: {err}");
            }
        }
        Ok(buf.len())
    }

    fn flush(&self) -> io::Result<()> {
        match self.state.lock().unwrap().file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }

    /// Closes the current file. A later write opens it again.
    fn close(&self) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.current = None;
        match state.file.take() {
            Some(mut file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// One rotating file per level.
#[derive(Clone, Default)]
pub struct RotateFileMap {
    files: HashMap<Level, Arc<RotateFile>>,
}

impl RotateFileMap {
    /// Opens `{base}.{level}` for every level with default retention and
    /// rotation.
    pub fn new<P: AsRef<Path>>(base: P) -> Result<Self, io::Error> {
        let mut files = HashMap::new();
        for level in Level::ALL {
            let mut path = OsString::from(base.as_ref().as_os_str());
            path.push(".");
            path.push(level.as_str());
            files.insert(level, Arc::new(RotateFile::open(PathBuf::from(path))?));
        }
        Ok(Self { files })
    }

    pub fn insert(&mut self, level: Level, file: Arc<RotateFile>) {
        self.files.insert(level, file);
    }

    pub fn get(&self, level: Level) -> Option<&Arc<RotateFile>> {
        self.files.get(&level)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Level, &Arc<RotateFile>)> {
        self.files.iter()
    }

    /// Every level writes to standard output as well.
    pub fn set_stdout(&self, stdout: bool) {
        for file in self.files.values() {
            file.set_stdout(stdout);
        }
    }

    /// Closes every file; the first failure is returned.
    pub fn close(&self) -> io::Result<()> {
        let mut result = Ok(());
        for file in self.files.values() {
            if let Err(err) = file.close()
                && result.is_ok()
            {
                result = Err(err);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 5, 1, 10, 5, 0).unwrap()
    }

    fn count_rotated(dir: &Path, base: &str) -> usize {
        fs::read_dir(dir)
            .unwrap()
            .flatten()
            .filter(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                name.starts_with(&format!("{base}.")) && !name.ends_with("_symlink")
            })
            .count()
    }

    #[test]
    fn test_rotation_across_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        let clock = Arc::new(ManualClock::new(start()));
        let config = RotateFileConfig::new(&path)
            .with_times(Duration::from_secs(7 * 24 * 3600), Duration::from_secs(3600));
        let file = RotateFile::with_clock(config, clock.clone()).unwrap();

        file.write(b"first\n").unwrap();
        clock.advance(Duration::from_secs(1));
        file.write(b"second\n").unwrap();
        let first_path = file.current_path().unwrap();
        assert_eq!(count_rotated(dir.path(), "app.log"), 1);
        assert_eq!(fs::read_to_string(&path).unwrap(), "first\nsecond\n");

        clock.advance(Duration::from_secs(3600));
        file.write(b"third\n").unwrap();
        let second_path = file.current_path().unwrap();
        assert_ne!(first_path, second_path);
        assert_eq!(count_rotated(dir.path(), "app.log"), 2);
        assert_eq!(fs::read_to_string(&path).unwrap(), "third\n");
        assert_eq!(
            fs::read_link(&path).unwrap(),
            PathBuf::from(second_path.file_name().unwrap())
        );
        assert_eq!(fs::read_to_string(&first_path).unwrap(), "first\nsecond\n");
    }

    #[test]
    fn test_retention_removes_old_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        let stale = dir.path().join("app.log.202001010000");
        let unrelated = dir.path().join("app.log.error.202001010000");
        fs::write(&stale, "old\n").unwrap();
        fs::write(&unrelated, "other base\n").unwrap();

        let clock = Arc::new(ManualClock::new(start()));
        let config = RotateFileConfig::new(&path)
            .with_times(Duration::from_secs(2 * 3600), Duration::from_secs(3600));
        let file = RotateFile::with_clock(config, clock.clone()).unwrap();
        file.write(b"now\n").unwrap();
        let first_path = file.current_path().unwrap();
        assert!(!stale.exists());
        assert!(unrelated.exists());

        clock.advance(Duration::from_secs(3 * 3600));
        file.write(b"later\n").unwrap();
        assert!(!first_path.exists());
        assert!(file.current_path().unwrap().exists());
    }

    #[test]
    fn test_size_rotation_generations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        let clock = Arc::new(ManualClock::new(start()));
        let config = RotateFileConfig {
            max_size: Some(20),
            ..RotateFileConfig::new(&path).with_times(
                Duration::from_secs(24 * 3600),
                Duration::from_secs(3600),
            )
        };
        let file = RotateFile::with_clock(config, clock).unwrap();
        for i in 0..6 {
            file.write(format!("line number {i}\n").as_bytes()).unwrap();
        }
        assert_eq!(count_rotated(dir.path(), "app.log"), 6);
        let current = file.current_path().unwrap();
        assert!(current.to_string_lossy().ends_with(".5"));
        assert_eq!(fs::read_to_string(&path).unwrap(), "line number 5\n");
    }

    #[test]
    fn test_rotation_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        let clock = Arc::new(ManualClock::new(start()));
        let config = RotateFileConfig {
            max_age: None,
            rotation_count: Some(2),
            ..RotateFileConfig::new(&path).with_times(Duration::ZERO, Duration::from_secs(3600))
        };
        let file = RotateFile::with_clock(config, clock.clone()).unwrap();
        for _ in 0..4 {
            file.write(b"tick\n").unwrap();
            clock.advance(Duration::from_secs(3600));
        }
        assert_eq!(count_rotated(dir.path(), "app.log"), 2);
    }

    #[test]
    fn test_close_then_write_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        let clock = Arc::new(ManualClock::new(start()));
        let file = RotateFile::with_clock(RotateFileConfig::new(&path), clock).unwrap();
        file.write(b"one\n").unwrap();
        file.close().unwrap();
        assert!(file.current_path().is_none());
        file.write(b"two\n").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "one\ntwo\n");
    }

    #[test]
    fn test_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        let too_fast = RotateFileConfig::new(&path).with_times(Duration::ZERO, Duration::ZERO);
        assert_eq!(
            RotateFile::new(too_fast).err().unwrap().kind(),
            io::ErrorKind::InvalidInput
        );
        let both = RotateFileConfig {
            rotation_count: Some(3),
            ..RotateFileConfig::new(&path)
        };
        assert_eq!(
            RotateFile::new(both).err().unwrap().kind(),
            io::ErrorKind::InvalidInput
        );
        let tiny = RotateFileConfig {
            max_size: Some(1),
            ..RotateFileConfig::new(&path)
        };
        assert_eq!(
            RotateFile::new(tiny).err().unwrap().kind(),
            io::ErrorKind::InvalidInput
        );
    }

    #[test]
    fn test_stdout_copy_keeps_file_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        let config = RotateFileConfig {
            stdout: true,
            ..RotateFileConfig::new(&path)
        };
        let file = RotateFile::with_clock(config, Arc::new(ManualClock::new(start()))).unwrap();
        assert!(file.stdout());
        assert_eq!(file.write(b"both\n").unwrap(), 5);
        file.set_stdout(false);
        assert!(!file.stdout());
        file.write(b"file only\n").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "both\nfile only\n");
    }

    #[test]
    fn test_rotate_file_map_stdout_and_insert() {
        let dir = tempfile::tempdir().unwrap();
        let mut map = RotateFileMap::default();
        assert!(map.get(Level::Error).is_none());
        let errors = Arc::new(RotateFile::open(dir.path().join("errors.log")).unwrap());
        map.insert(Level::Error, errors.clone());
        map.insert(Level::Fatal, errors.clone());
        map.set_stdout(true);
        assert!(errors.stdout());
        map.set_stdout(false);
        assert!(map.iter().all(|(_, file)| !file.stdout()));
        map.get(Level::Fatal).unwrap().write(b"down\n").unwrap();
        map.close().unwrap();
        assert!(errors.current_path().is_none());
        assert_eq!(
            fs::read_to_string(dir.path().join("errors.log")).unwrap(),
            "down\n"
        );
    }

    #[test]
    fn test_rotate_file_map() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("svc");
        let map = RotateFileMap::new(&base).unwrap();
        assert_eq!(map.iter().count(), Level::ALL.len());
        map.get(Level::Error).unwrap().write(b"boom\n").unwrap();
        map.close().unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("svc.error")).unwrap(),
            "boom\n"
        );
        assert!(!dir.path().join("svc.info").exists());
    }
}
