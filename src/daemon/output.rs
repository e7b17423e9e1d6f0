//! Destination of the serialized events.

use std::{
    fs::File,
    io::{self, Stdout, Write},
    os::fd::{AsFd, BorrowedFd},
    path::Path,
};

/// The standard output or a file truncated when opened.
pub enum OutputSink {
    Stdout(Stdout),
    File(File),
}

impl OutputSink {
    /// Open `path`, `-` meaning the standard output.
    pub fn open(path: &str) -> io::Result<Self> {
        if path == "-" {
            return Ok(Self::Stdout(io::stdout()));
        }
        File::create(Path::new(path)).map(Self::File)
    }
}

impl Write for OutputSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Stdout(stdout) => stdout.write(buf),
            Self::File(file) => file.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Stdout(stdout) => stdout.flush(),
            Self::File(file) => file.flush(),
        }
    }
}

impl AsFd for OutputSink {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Self::Stdout(stdout) => stdout.as_fd(),
            Self::File(file) => file.as_fd(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn file_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");
        fs::write(&path, "stale content\n").unwrap();

        let mut sink = OutputSink::open(path.to_str().unwrap()).unwrap();
        writeln!(sink, "{{}}").unwrap();
        sink.flush().unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "{}\n");
    }

    #[test]
    fn dash_is_stdout() {
        assert!(matches!(OutputSink::open("-").unwrap(), OutputSink::Stdout(_)));
    }

    #[test]
    fn missing_directory() {
        assert!(OutputSink::open("/nonexistent/dir/events.log").is_err());
    }
}
