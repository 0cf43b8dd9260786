use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;

pub use slog::Logger;
use slog::{Drain, Record};

/// A `slog::Drain` that writes one line per record as
/// `thread[<id>]: YYYY-MM-DD HH:MM:SS <message>\n`, flushing after every
/// write. Optionally mirrors every line to stdout.
pub struct FileLogger {
    file: Mutex<File>,
    mirror_to_terminal: bool,
}

impl FileLogger {
    pub fn create<P: AsRef<Path>>(path: P, mirror_to_terminal: bool) -> io::Result<FileLogger> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(FileLogger {
            file: Mutex::new(file),
            mirror_to_terminal,
        })
    }

    fn write_line(&self, line: &str) -> io::Result<()> {
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        file.write_all(line.as_bytes())?;
        file.flush()?;
        if self.mirror_to_terminal {
            let mut stdout = io::stdout();
            stdout.write_all(line.as_bytes())?;
            stdout.flush()?;
        }
        Ok(())
    }
}

impl Drain for FileLogger {
    type Ok = ();
    type Err = io::Error;

    fn log(&self, record: &Record, _values: &slog::OwnedKVList) -> Result<(), io::Error> {
        let now = chrono::Local::now();
        let line = format!(
            "thread[{:?}]: {} {}\n",
            std::thread::current().id(),
            now.format("%Y-%m-%d %H:%M:%S"),
            record.msg()
        );
        self.write_line(&line)
    }
}

/// Build a root logger rooted at a [`FileLogger`] sink: one sink, one
/// line format, used by `Client`, `Server` and any standalone binary.
pub fn root_logger<P: AsRef<Path>>(path: P, mirror_to_terminal: bool) -> io::Result<Logger> {
    let drain = FileLogger::create(path, mirror_to_terminal)?;
    let drain = Mutex::new(drain).fuse();
    Ok(Logger::root(drain, slog::o!()))
}

/// A logger that discards everything, used where the caller doesn't want
/// to wire up a file (e.g. unit tests).
pub fn discard() -> Logger {
    Logger::root(slog::Discard, slog::o!())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.log");
        let log = root_logger(&path, false).unwrap();

        slog::info!(log, "hello"; "n" => 1);
        slog::info!(log, "world");

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in &lines {
            assert!(line.starts_with("thread["));
            assert!(line.contains("hello") || line.contains("world"));
        }
    }

    #[test]
    fn discard_logger_never_errors() {
        let log = discard();
        slog::info!(log, "swallowed");
    }
}
