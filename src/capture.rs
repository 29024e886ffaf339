//! This module contains all the capture plumbing between processes

// The runner does one thing in its hot loop: read raw bytes from the
// acquisition process and copy them, in order, into one named pipe per
// consumer. Everything else here is about making sure the processes and
// pipes involved are always cleaned up.

use std::{
    ffi::CString,
    fs::{self, File, OpenOptions},
    io::{self, Read, Write},
    os::unix::{
        ffi::OsStrExt,
        fs::{FileTypeExt, OpenOptionsExt},
        io::AsRawFd,
    },
    path::{Path, PathBuf},
    process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Bytes copied per tee iteration; bounds stop latency and backpressure granularity
pub const CHUNK_SIZE: usize = 256 * 1024;
/// Time a process gets to exit after SIGTERM before it is killed
pub const TERMINATE_GRACE: Duration = Duration::from_secs(2);
const EXIT_POLL: Duration = Duration::from_millis(20);

/// Anything the tee loop polls once per chunk to decide whether to stop
pub trait StopSource {
    fn should_stop(&self) -> bool;
}

/// In-process stop request, set from a signal handler or another thread
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Route Ctrl-C (SIGINT/SIGTERM) to this flag
    pub fn install_ctrlc(&self) -> Result<()> {
        let flag = self.clone();
        ctrlc::set_handler(move || flag.stop())
            .map_err(|e| Error::Device(format!("failed to install signal handler: {e}")))
    }
}

impl StopSource for StopFlag {
    fn should_stop(&self) -> bool {
        self.is_set()
    }
}

/// Stops when any member does
pub struct AnyStop<'a>(pub Vec<&'a dyn StopSource>);

impl StopSource for AnyStop<'_> {
    fn should_stop(&self) -> bool {
        self.0.iter().any(|s| s.should_stop())
    }
}

fn pipe_err(path: &Path) -> impl FnOnce(io::Error) -> Error + '_ {
    move |source| Error::Pipe {
        path: path.to_path_buf(),
        source,
    }
}

fn mkfifo(path: &Path) -> Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| Error::Pipe {
        path: path.to_path_buf(),
        source: io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"),
    })?;
    // SAFETY: c_path is a valid NUL-terminated string that outlives the call
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
    if rc != 0 {
        return Err(pipe_err(path)(io::Error::last_os_error()));
    }
    Ok(())
}

/// The named pipes of one run. Created together, unlinked on drop.
#[derive(Debug)]
pub struct FifoSet {
    paths: Vec<PathBuf>,
}

impl FifoSet {
    pub fn create<I, P>(paths: I) -> Result<Self>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let mut set = FifoSet { paths: Vec::new() };
        for path in paths {
            let path = path.into();
            // A FIFO left behind by a crashed run is reused after unlinking
            if let Ok(meta) = fs::symlink_metadata(&path) {
                if !meta.file_type().is_fifo() {
                    return Err(pipe_err(&path)(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        "path exists and is not a FIFO",
                    )));
                }
                fs::remove_file(&path).map_err(pipe_err(&path))?;
            }
            mkfifo(&path)?;
            debug!(path = %path.display(), "Created FIFO");
            // Pushed only once created, so drop never unlinks foreign paths
            set.paths.push(path);
        }
        Ok(set)
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn unlink(&mut self) {
        for path in self.paths.drain(..) {
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "Unlinked FIFO"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), "Failed to unlink FIFO: {e}"),
            }
        }
    }
}

impl Drop for FifoSet {
    fn drop(&mut self) {
        self.unlink();
    }
}

fn clear_nonblocking(file: &File) -> io::Result<()> {
    let fd = file.as_raw_fd();
    // SAFETY: fd is owned by `file` and open for the duration of both calls
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Open the read end without waiting for a writer, then switch to blocking reads
pub fn open_fifo_read(path: &Path) -> Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .map_err(pipe_err(path))?;
    clear_nonblocking(&file).map_err(pipe_err(path))?;
    Ok(file)
}

/// Open the write end. Fails immediately (ENXIO) when nobody holds the read
/// end, which is how a consumer that never started is detected.
pub fn open_fifo_write(path: &Path) -> Result<File> {
    let file = OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .map_err(pipe_err(path))?;
    clear_nonblocking(&file).map_err(pipe_err(path))?;
    Ok(file)
}

/// A child process that is always terminated when dropped
#[derive(Debug)]
pub struct ManagedChild {
    name: String,
    child: Option<Child>,
}

impl ManagedChild {
    pub fn spawn(name: impl Into<String>, command: &mut Command) -> Result<Self> {
        let name = name.into();
        let child = command.spawn().map_err(|source| Error::Spawn {
            name: name.clone(),
            source,
        })?;
        info!(name = %name, pid = child.id(), "Started process");
        Ok(Self {
            name,
            child: Some(child),
        })
    }

    /// Start a consumer with its stdin bound to the read end of `fifo`
    pub fn spawn_reading(name: impl Into<String>, command: &mut Command, fifo: &Path) -> Result<Self> {
        let stdin = open_fifo_read(fifo)?;
        Self::spawn(name, command.stdin(Stdio::from(stdin)))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.as_mut()?.stdout.take()
    }

    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.as_mut()?.stdin.take()
    }

    /// Exit status if the process has ended
    pub fn exited(&mut self) -> Option<ExitStatus> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(status) => status,
            Err(e) => {
                warn!(name = %self.name, "Failed to poll process: {e}");
                None
            }
        }
    }

    pub fn is_running(&mut self) -> bool {
        self.child.is_some() && self.exited().is_none()
    }

    /// Give the process up to `timeout` to exit on its own
    pub fn wait_exit(&mut self, timeout: Duration) -> Option<ExitStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.exited() {
                return Some(status);
            }
            if self.child.is_none() || Instant::now() >= deadline {
                return None;
            }
            thread::sleep(EXIT_POLL);
        }
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL. A no-op once exited.
    pub fn terminate(&mut self, grace: Duration) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        if let Ok(Some(status)) = child.try_wait() {
            debug!(name = %self.name, %status, "Process already exited");
            return;
        }
        let pid = child.id() as libc::pid_t;
        // SAFETY: the child has not been reaped, so its pid cannot have been reused
        unsafe { libc::kill(pid, libc::SIGTERM) };
        let deadline = Instant::now() + grace;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    info!(name = %self.name, %status, "Process terminated");
                    return;
                }
                Ok(None) if Instant::now() < deadline => thread::sleep(EXIT_POLL),
                _ => break,
            }
        }
        warn!(name = %self.name, "Process ignored SIGTERM, killing");
        if let Err(e) = child.kill() {
            warn!(name = %self.name, "Failed to kill process: {e}");
        }
        let _ = child.wait();
    }
}

impl Drop for ManagedChild {
    fn drop(&mut self) {
        self.terminate(TERMINATE_GRACE);
    }
}

/// Why the tee loop returned without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeeOutcome {
    EndOfStream,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeeStats {
    pub outcome: TeeOutcome,
    pub bytes: u64,
    pub chunks: u64,
}

/// Copy `src` into every sink, one chunk at a time, until end of stream or a stop request.
///
/// `stop` and `check` are polled before every chunk; `check` reports dead
/// consumers. A write to a consumer whose read end is gone is surfaced as
/// [`Error::ProcessDied`].
pub fn tee_stream<R, W, F>(
    src: &mut R,
    sinks: &mut [(String, W)],
    chunk_size: usize,
    stop: &dyn StopSource,
    mut check: F,
) -> Result<TeeStats>
where
    R: Read,
    W: Write,
    F: FnMut() -> Result<()>,
{
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut stats = TeeStats {
        outcome: TeeOutcome::EndOfStream,
        bytes: 0,
        chunks: 0,
    };
    loop {
        if stop.should_stop() {
            info!("Stop requested, ending tee");
            stats.outcome = TeeOutcome::Stopped;
            return Ok(stats);
        }
        check()?;
        let n = match src.read(&mut buf) {
            Ok(0) => {
                info!(bytes = stats.bytes, "Acquisition stream ended");
                return Ok(stats);
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Device(format!("acquisition stream: {e}"))),
        };
        for (name, sink) in sinks.iter_mut() {
            sink.write_all(&buf[..n]).map_err(|e| match e.kind() {
                io::ErrorKind::BrokenPipe => Error::ProcessDied(name.clone()),
                _ => Error::Device(format!("writing to {name}: {e}")),
            })?;
        }
        stats.bytes += n as u64;
        stats.chunks += 1;
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    struct Never;
    impl StopSource for Never {
        fn should_stop(&self) -> bool {
            false
        }
    }

    struct Broken;
    impl Write for Broken {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::ErrorKind::BrokenPipe.into())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_tee_copies_in_order() {
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let mut src = Cursor::new(data.clone());
        let mut sinks = vec![("a".to_string(), Vec::new()), ("b".to_string(), Vec::new())];
        let stats = tee_stream(&mut src, &mut sinks, 256, &Never, || Ok(())).unwrap();
        assert_eq!(stats.outcome, TeeOutcome::EndOfStream);
        assert_eq!(stats.bytes, 5000);
        assert_eq!(stats.chunks, 20);
        assert_eq!(sinks[0].1, data);
        assert_eq!(sinks[1].1, data);
    }

    #[test]
    fn test_tee_stops_on_flag() {
        let flag = StopFlag::new();
        flag.stop();
        let mut src = Cursor::new(b"data".to_vec());
        let mut sinks = vec![("a".to_string(), Vec::new())];
        let stats = tee_stream(&mut src, &mut sinks, 128, &flag, || Ok(())).unwrap();
        assert_eq!(stats.outcome, TeeOutcome::Stopped);
        assert!(sinks[0].1.is_empty());
    }

    #[test]
    fn test_tee_stops_between_chunks() {
        let flag = StopFlag::new();
        let mut src = Cursor::new(vec![7u8; 1024]);
        let mut sinks = vec![("a".to_string(), Vec::new())];
        let mut polls = 0;
        let stop = AnyStop(vec![&flag, &Never]);
        let stats = tee_stream(&mut src, &mut sinks, 256, &stop, || {
            polls += 1;
            if polls == 2 {
                flag.stop();
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(stats.outcome, TeeOutcome::Stopped);
        assert_eq!(sinks[0].1.len(), 512);
    }

    #[test]
    fn test_tee_surfaces_dead_consumer() {
        let mut src = Cursor::new(vec![1u8; 100]);
        let mut sinks = vec![("psd".to_string(), Broken)];
        let err = tee_stream(&mut src, &mut sinks, 64, &Never, || Ok(())).unwrap_err();
        assert!(matches!(err, Error::ProcessDied(ref name) if name == "psd"));

        let mut sinks = vec![("a".to_string(), Vec::new())];
        let err = tee_stream(&mut src, &mut sinks, 64, &Never, || {
            Err(Error::ProcessDied("demod".into()))
        })
        .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_fifo_set_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let paths = [dir.path().join("fifo1"), dir.path().join("fifo2")];
        {
            let set = FifoSet::create(paths.clone()).unwrap();
            assert_eq!(set.paths().len(), 2);
            for p in &paths {
                assert!(fs::symlink_metadata(p).unwrap().file_type().is_fifo());
            }
            // Stale FIFOs are replaced
            let again = FifoSet::create([paths[0].clone()]).unwrap();
            drop(again);
            assert!(!paths[0].exists());
        }
        assert!(!paths[1].exists());
    }

    #[test]
    fn test_fifo_set_refuses_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain");
        fs::write(&path, b"keep me").unwrap();
        assert!(matches!(FifoSet::create([&path]), Err(Error::Pipe { .. })));
        assert_eq!(fs::read(&path).unwrap(), b"keep me");
    }

    #[test]
    fn test_fifo_write_needs_reader() {
        let dir = tempfile::tempdir().unwrap();
        let set = FifoSet::create([dir.path().join("fifo")]).unwrap();
        let path = &set.paths()[0];
        assert!(matches!(open_fifo_write(path), Err(Error::Pipe { .. })));

        let mut reader = open_fifo_read(path).unwrap();
        let mut writer = open_fifo_write(path).unwrap();
        writer.write_all(b"iq").unwrap();
        drop(writer);
        let mut got = Vec::new();
        reader.read_to_end(&mut got).unwrap();
        assert_eq!(got, b"iq");
    }

    #[test]
    fn test_terminate_running_process() {
        let mut child = ManagedChild::spawn("sleeper", Command::new("sleep").arg("30")).unwrap();
        assert!(child.is_running());
        let start = Instant::now();
        child.terminate(Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(!child.is_running());
        // Second call is a no-op
        child.terminate(Duration::from_secs(5));
    }

    #[test]
    fn test_terminate_exited_process_is_noop() {
        let mut child = ManagedChild::spawn("true", &mut Command::new("true")).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while child.exited().is_none() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        child.terminate(Duration::from_secs(1));
        assert!(!child.is_running());
    }

    #[test]
    fn test_terminate_escalates_to_kill() {
        let mut child = ManagedChild::spawn(
            "stubborn",
            Command::new("sh").args(["-c", "trap '' TERM; while :; do sleep 1; done"]),
        )
        .unwrap();
        thread::sleep(Duration::from_millis(100));
        let start = Instant::now();
        child.terminate(Duration::from_millis(200));
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert!(!child.is_running());
    }

    #[test]
    fn test_consumer_reads_from_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let set = FifoSet::create([dir.path().join("fifo")]).unwrap();
        let out = dir.path().join("out.bin");
        let mut consumer = ManagedChild::spawn_reading(
            "cat",
            Command::new("sh").args(["-c", &format!("cat > {}", out.display())]),
            &set.paths()[0],
        )
        .unwrap();
        let mut writer = open_fifo_write(&set.paths()[0]).unwrap();
        writer.write_all(b"hello").unwrap();
        drop(writer);
        let deadline = Instant::now() + Duration::from_secs(5);
        while consumer.exited().is_none() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(fs::read(&out).unwrap(), b"hello");
    }
}
