use std::{
    fs::File,
    io::{self, Seek, SeekFrom, Write},
    path::Path,
    sync::{Arc, Mutex},
};

/// Append-only byte sink a formatted entry is written to.
///
/// Implementations take `&self` so one destination can serve several levels
/// and several tables at once.
pub trait Destination: Send + Sync {
    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    /// Releases retained resources such as open files.
    fn close(&self) -> io::Result<()> {
        Ok(())
    }
}

/// Wraps any `io::Write` behind a mutex.
pub struct WriterDestination<W> {
    writer: Mutex<W>,
}

impl<W: Write + Send> WriterDestination<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner().unwrap()
    }
}

impl<W: Write + Send> Destination for WriterDestination<W> {
    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut writer = self.writer.lock().unwrap();
        writer.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&self) -> io::Result<()> {
        self.writer.lock().unwrap().flush()
    }
}

/// Standard output, flushed after every entry.
#[derive(Debug, Default, Clone, Copy)]
pub struct Stdout;

impl Destination for Stdout {
    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut stdout = io::stdout().lock();
        stdout.write_all(buf)?;
        stdout.flush()?;
        Ok(buf.len())
    }

    fn flush(&self) -> io::Result<()> {
        io::stdout().flush()
    }
}

/// Drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct Discard;

impl Destination for Discard {
    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        Ok(buf.len())
    }
}

/// File opened in append mode, created if missing.
pub struct LogFile {
    file: Mutex<Option<File>>,
}

impl LogFile {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, io::Error> {
        let mut file = File::options()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        file.seek(SeekFrom::End(0))?;
        Ok(Self {
            file: Mutex::new(Some(file)),
        })
    }
}

impl Destination for LogFile {
    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        match self.file.lock().unwrap().as_mut() {
            Some(file) => {
                file.write_all(buf)?;
                Ok(buf.len())
            }
            None => Err(io::Error::other("log file is closed")),
        }
    }

    fn flush(&self) -> io::Result<()> {
        match self.file.lock().unwrap().as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }

    fn close(&self) -> io::Result<()> {
        if let Some(mut file) = self.file.lock().unwrap().take() {
            file.flush()?;
        }
        Ok(())
    }
}

/// Writes every entry to all of its destinations.
///
/// The first failure is returned after the remaining destinations have been
/// tried.
#[derive(Clone, Default)]
pub struct Tee {
    destinations: Vec<Arc<dyn Destination>>,
}

impl Tee {
    pub fn new(destinations: Vec<Arc<dyn Destination>>) -> Self {
        Self { destinations }
    }

    /// Standard output plus `destination`.
    pub fn stdout_and(destination: Arc<dyn Destination>) -> Self {
        Self::new(vec![Arc::new(Stdout), destination])
    }

    pub fn push(&mut self, destination: Arc<dyn Destination>) {
        self.destinations.push(destination);
    }
}

impl Destination for Tee {
    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut result = Ok(buf.len());
        for destination in &self.destinations {
            if let Err(err) = destination.write(buf)
                && result.is_ok()
            {
                result = Err(err);
            }
        }
        result
    }

    fn flush(&self) -> io::Result<()> {
        let mut result = Ok(());
        for destination in &self.destinations {
            if let Err(err) = destination.flush()
                && result.is_ok()
            {
                result = Err(err);
            }
        }
        result
    }

    fn close(&self) -> io::Result<()> {
        let mut result = Ok(());
        for destination in &self.destinations {
            if let Err(err) = destination.close()
                && result.is_ok()
            {
                result = Err(err);
            }
        }
        result
    }
}

/// In-memory destination, handy to inspect what was routed where.
#[derive(Clone, Default)]
pub struct MemoryDestination {
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every write so far, one element per call.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }

    pub fn lines(&self) -> Vec<String> {
        self.writes()
            .into_iter()
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.writes.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Destination for MemoryDestination {
    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.writes.lock().unwrap().push(buf.to_vec());
        Ok(buf.len())
    }
}

#[test]
fn test_log_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.log");
    std::fs::write(&path, "existing\n").unwrap();
    let log_file = LogFile::new(&path).unwrap();
    log_file.write(b"Hello, world!\n").unwrap();
    log_file.write(b"rust is awesome !\n").unwrap();
    log_file.close().unwrap();
    assert_eq!(
        std::fs::read_to_string(&path).unwrap(),
        "existing\nHello, world!\nrust is awesome !\n"
    );
    assert!(log_file.write(b"late\n").is_err());
}

#[test]
fn test_tee_writes_everywhere() {
    let first = MemoryDestination::new();
    let second = MemoryDestination::new();
    let tee = Tee::new(vec![Arc::new(first.clone()), Arc::new(second.clone())]);
    assert_eq!(tee.write(b"line\n").unwrap(), 5);
    assert_eq!(first.lines(), vec!["line\n"]);
    assert_eq!(second.lines(), vec!["line\n"]);
}

#[test]
fn test_tee_push() {
    let first = MemoryDestination::new();
    let late = MemoryDestination::new();
    let mut tee = Tee::default();
    tee.push(Arc::new(first.clone()));
    tee.write(b"one\n").unwrap();
    tee.push(Arc::new(late.clone()));
    tee.write(b"two\n").unwrap();
    assert_eq!(first.lines(), vec!["one\n", "two\n"]);
    assert_eq!(late.lines(), vec!["two\n"]);
}

#[test]
fn test_tee_reports_first_failure() {
    struct Broken;
    impl Destination for Broken {
        fn write(&self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::other("broken pipe"))
        }
    }
    let after = MemoryDestination::new();
    let tee = Tee::new(vec![Arc::new(Broken), Arc::new(after.clone())]);
    let err = tee.write(b"line\n").unwrap_err();
    assert_eq!(err.to_string(), "broken pipe");
    assert_eq!(after.len(), 1);
}

#[test]
fn test_writer_destination() {
    let destination = WriterDestination::new(Vec::new());
    destination.write(b"a").unwrap();
    destination.write(b"b").unwrap();
    assert_eq!(destination.into_inner(), b"ab");
}
