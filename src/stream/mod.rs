//! The binary stream abstraction (spec §3): a framed, optionally
//! compressed, byte-order-negotiating file or pipe that IPset and Bag both
//! read and write through.

pub mod compress;
pub mod error;
pub mod header;

use std::fs::{File, OpenOptions};
use std::io::{self, IsTerminal, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::path::{Path, PathBuf};

pub use compress::{codec_for, Codec};
pub use error::StreamError;
pub use header::{CompressionMethod, Endian, FileFormat, FileHeader, HeaderEntryCodec};

/// How a stream is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Read,
    Write,
    Append,
}

/// Whether a stream's payload is framed binary records or free-form text
/// lines. Determines whether [`Stream::read_line`] is usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Binary,
    Text,
}

enum Target {
    Unbound,
    Path(PathBuf),
    Fd(RawFd),
}

/// A bound, openable stream. Binding (`bind_path`/`bind_fd`) and opening
/// (`open`) are separate steps, matching the original's two-phase
/// create-then-open lifecycle: a stream can be fully configured (mode,
/// compression, content type) before any syscall touches the filesystem.
pub struct Stream {
    mode: Mode,
    content_type: ContentType,
    target: Target,
    file: Option<File>,
    header: Option<FileHeader>,
    header_frozen: bool,
    copy_input: Option<Box<dyn Write>>,
    is_pipe: bool,
    comment_prefix: Option<char>,
}

impl Stream {
    pub fn create(mode: Mode, content_type: ContentType) -> Self {
        Self {
            mode,
            content_type,
            target: Target::Unbound,
            file: None,
            header: None,
            header_frozen: false,
            copy_input: None,
            is_pipe: false,
            comment_prefix: None,
        }
    }

    /// Set the marker that begins a comment on a text stream: text from
    /// the first occurrence of `prefix` to end of line is discarded by
    /// [`Stream::read_line`]. Default is `None` (no comment stripping).
    pub fn set_comment_prefix(&mut self, prefix: Option<char>) {
        self.comment_prefix = prefix;
    }

    pub fn bind_path<P: AsRef<Path>>(&mut self, path: P) -> Result<(), StreamError> {
        if self.file.is_some() {
            return Err(StreamError::AlreadyOpen);
        }
        self.target = Target::Path(path.as_ref().to_path_buf());
        Ok(())
    }

    pub fn bind_fd(&mut self, fd: RawFd) -> Result<(), StreamError> {
        if self.file.is_some() {
            return Err(StreamError::AlreadyOpen);
        }
        self.target = Target::Fd(fd);
        Ok(())
    }

    /// Attach a sink that receives a verbatim copy of every byte read,
    /// mirroring the original's `skStreamSetCopyInput` — useful for `-`
    /// style "pass input through while also parsing it" pipelines.
    pub fn set_copy_input(&mut self, sink: Box<dyn Write>) {
        self.copy_input = Some(sink);
    }

    pub fn open(&mut self) -> Result<(), StreamError> {
        if self.file.is_some() {
            return Err(StreamError::AlreadyOpen);
        }
        let (file, is_pipe) = match &self.target {
            Target::Unbound => return Err(StreamError::NotBound),
            Target::Fd(fd) => {
                let file = unsafe { File::from_raw_fd(*fd) };
                let is_pipe = !is_regular_file(&file);
                (file, is_pipe)
            }
            Target::Path(path) => {
                if path.as_os_str() == "-" {
                    return self.open_stdio();
                }
                let file = open_path(path, self.mode)?;
                let is_pipe = !is_regular_file(&file);
                (file, is_pipe)
            }
        };

        if self.content_type == ContentType::Binary
            && self.mode == Mode::Read
            && !is_pipe
            && file.try_clone().map(|f| f.is_terminal()).unwrap_or(false)
        {
            return Err(StreamError::IsTerminal);
        }

        self.file = Some(file);
        self.is_pipe = is_pipe;
        Ok(())
    }

    fn open_stdio(&mut self) -> Result<(), StreamError> {
        let fd: RawFd = match self.mode {
            Mode::Read => 0,
            Mode::Write | Mode::Append => 1,
        };
        let file = unsafe { File::from_raw_fd(fd) };
        if self.content_type == ContentType::Binary && self.mode == Mode::Read && file.is_terminal() {
            std::mem::forget(file);
            return Err(StreamError::IsTerminal);
        }
        self.is_pipe = true;
        self.file = Some(file);
        Ok(())
    }

    fn file_mut(&mut self) -> Result<&mut File, StreamError> {
        self.file.as_mut().ok_or(StreamError::NotOpen)
    }

    fn file_ref(&self) -> Result<&File, StreamError> {
        self.file.as_ref().ok_or(StreamError::NotOpen)
    }

    /// Write the header exactly once. A second call (on this stream or
    /// after a reopen of the same path in write mode) is a programming
    /// error: the header governs byte order and compression for every
    /// record that follows and cannot be renegotiated mid-stream.
    pub fn write_header(&mut self, header: FileHeader) -> Result<(), StreamError> {
        if self.mode == Mode::Read {
            return Err(StreamError::UnsupportedIoMode);
        }
        if self.header_frozen {
            return Err(StreamError::PrevData);
        }
        let bytes = header.write_bytes();
        self.file_mut()?.write_all(&bytes).map_err(StreamError::Write)?;
        self.header = Some(header);
        self.header_frozen = true;
        Ok(())
    }

    /// Read and freeze the header. Subsequent calls return the cached copy
    /// rather than re-reading, so the header can be inspected repeatedly
    /// without rewinding the stream. In [`Mode::Append`], the codec seeks
    /// past the header to end-of-file afterward so the next write lands
    /// after existing records, not immediately after the header.
    pub fn read_header(&mut self) -> Result<&FileHeader, StreamError> {
        if self.header_frozen {
            return Ok(self.header.as_ref().unwrap());
        }
        if self.mode == Mode::Write {
            return Err(StreamError::UnsupportedIoMode);
        }
        let mut prefix = [0u8; header::FIXED_PREFIX_LEN];
        self.read_exact_tracked(&mut prefix)?;

        // The entry table has unknown length up front; grow the buffer
        // until the id=0 terminator parses cleanly.
        let mut buf = prefix.to_vec();
        loop {
            match FileHeader::read_bytes(&buf) {
                Ok((hdr, _consumed)) => {
                    self.header = Some(hdr);
                    self.header_frozen = true;
                    if self.mode == Mode::Append {
                        self.file_mut()?.seek(SeekFrom::End(0)).map_err(StreamError::Lseek)?;
                    }
                    return Ok(self.header.as_ref().unwrap());
                }
                Err(StreamError::ShortRead { expected, .. }) => {
                    let need = expected - buf.len();
                    let mut more = vec![0u8; need.max(8)];
                    self.read_exact_tracked(&mut more)?;
                    buf.extend_from_slice(&more);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn read_exact_tracked(&mut self, buf: &mut [u8]) -> Result<(), StreamError> {
        self.file_mut()?.read_exact(buf).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                StreamError::Eof
            } else {
                StreamError::Read(e)
            }
        })?;
        if let Some(sink) = self.copy_input.as_mut() {
            let _ = sink.write_all(buf);
        }
        Ok(())
    }

    pub fn read_bytes(&mut self, buf: &mut [u8]) -> Result<(), StreamError> {
        self.read_exact_tracked(buf)
    }

    pub fn write_bytes(&mut self, buf: &[u8]) -> Result<(), StreamError> {
        self.file_mut()?.write_all(buf).map_err(StreamError::Write)
    }

    /// Read one logical non-blank, non-comment line of text, stripping the
    /// trailing newline and everything from the first occurrence of the
    /// configured comment prefix (none by default, see
    /// [`Stream::set_comment_prefix`]) to end of line. Blank lines and
    /// lines that are comment-only after stripping are skipped entirely
    /// rather than returned as empty strings. `line_no` is incremented
    /// once per physical line consumed, including skipped ones, so
    /// callers can report accurate line numbers in diagnostics. Lines
    /// exceeding `max_len` return [`StreamError::LongLine`], a
    /// record-level error the caller may recover from by skipping ahead.
    pub fn read_line(&mut self, max_len: usize, line_no: &mut u64) -> Result<Option<String>, StreamError> {
        if self.content_type != ContentType::Text {
            return Err(StreamError::UnsupportedIoMode);
        }
        loop {
            let mut raw = Vec::new();
            let mut byte = [0u8; 1];
            loop {
                match self.file_mut()?.read(&mut byte) {
                    Ok(0) => {
                        if raw.is_empty() {
                            return Ok(None);
                        }
                        break;
                    }
                    Ok(_) => {
                        if let Some(sink) = self.copy_input.as_mut() {
                            let _ = sink.write_all(&byte);
                        }
                        if byte[0] == b'\n' {
                            break;
                        }
                        raw.push(byte[0]);
                        if raw.len() > max_len {
                            *line_no += 1;
                            return Err(StreamError::LongLine);
                        }
                    }
                    Err(e) => return Err(StreamError::Read(e)),
                }
            }
            *line_no += 1;
            let line = String::from_utf8_lossy(&raw);
            let stripped = match self.comment_prefix {
                Some(prefix) => match line.find(prefix) {
                    Some(idx) => &line[..idx],
                    None => &line[..],
                },
                None => &line[..],
            };
            let trimmed = stripped.trim_end().to_string();
            if trimmed.is_empty() {
                continue;
            }
            return Ok(Some(trimmed));
        }
    }

    pub fn flush(&mut self) -> Result<(), StreamError> {
        self.file_mut()?.flush().map_err(StreamError::Write)
    }

    pub fn tell(&mut self) -> Result<u64, StreamError> {
        self.file_mut()?.stream_position().map_err(StreamError::Lseek)
    }

    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64, StreamError> {
        if self.is_pipe {
            return Err(StreamError::UnsupportedIoMode);
        }
        self.file_mut()?.seek(pos).map_err(StreamError::Lseek)
    }

    pub fn truncate(&mut self, len: u64) -> Result<(), StreamError> {
        self.file_mut()?.set_len(len).map_err(StreamError::Ftruncate)
    }

    /// Take an advisory exclusive (write) or shared (read) lock via
    /// `flock(2)`. Best-effort: the lock is released on close or process
    /// exit, never enforced against a non-cooperating writer.
    pub fn lock(&mut self) -> Result<(), StreamError> {
        let fd = self.file_ref()?.as_raw_fd();
        let op = match self.mode {
            Mode::Read => libc::LOCK_SH,
            Mode::Write | Mode::Append => libc::LOCK_EX,
        };
        let rc = unsafe { libc::flock(fd, op) };
        if rc != 0 {
            return Err(StreamError::Lock(io::Error::last_os_error()));
        }
        Ok(())
    }

    pub fn unlock(&mut self) -> Result<(), StreamError> {
        let fd = self.file_ref()?.as_raw_fd();
        let rc = unsafe { libc::flock(fd, libc::LOCK_UN) };
        if rc != 0 {
            return Err(StreamError::Lock(io::Error::last_os_error()));
        }
        Ok(())
    }

    pub fn close(&mut self) -> Result<(), StreamError> {
        if let Some(mut f) = self.file.take() {
            f.flush().map_err(StreamError::Write)?;
        }
        Ok(())
    }

    pub fn is_pipe(&self) -> bool {
        self.is_pipe
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn is_regular_file(f: &File) -> bool {
    f.metadata().map(|m| m.is_file()).unwrap_or(false)
}

fn open_path(path: &Path, mode: Mode) -> Result<File, StreamError> {
    let mut opts = OpenOptions::new();
    match mode {
        Mode::Read => {
            opts.read(true);
        }
        Mode::Write => {
            if path.exists() && !is_fifo_or_char_device(path) {
                return Err(StreamError::FileExists);
            }
            opts.write(true).create(true).truncate(!path.exists());
        }
        Mode::Append => {
            // No `O_APPEND`: the stream must be able to seek (e.g. past
            // the header on open) and then position writes itself, which
            // `O_APPEND`'s "every write lands at EOF" semantics forbid.
            opts.read(true).write(true).create(true);
        }
    }
    opts.open(path).map_err(StreamError::Open)
}

fn is_fifo_or_char_device(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| {
            let ft = m.file_type();
            ft.is_fifo() || ft.is_char_device()
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use header::FileFormat;

    #[test]
    fn write_then_read_header_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.bin");

        let mut w = Stream::create(Mode::Write, ContentType::Binary);
        w.bind_path(&path).unwrap();
        w.open().unwrap();
        w.write_header(FileHeader::new(FileFormat::IpSet, 5, 0)).unwrap();
        w.write_bytes(b"payload").unwrap();
        w.close().unwrap();

        let mut r = Stream::create(Mode::Read, ContentType::Binary);
        r.bind_path(&path).unwrap();
        r.open().unwrap();
        let hdr = r.read_header().unwrap();
        assert_eq!(hdr.file_format, FileFormat::IpSet);
        let mut buf = [0u8; 7];
        r.read_bytes(&mut buf).unwrap();
        assert_eq!(&buf, b"payload");
    }

    #[test]
    fn write_header_twice_is_prev_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.bin");
        let mut w = Stream::create(Mode::Write, ContentType::Binary);
        w.bind_path(&path).unwrap();
        w.open().unwrap();
        w.write_header(FileHeader::new(FileFormat::Bag, 4, 0)).unwrap();
        let err = w.write_header(FileHeader::new(FileFormat::Bag, 4, 0)).unwrap_err();
        assert!(matches!(err, StreamError::PrevData));
    }

    #[test]
    fn refuses_to_clobber_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.bin");
        std::fs::write(&path, b"x").unwrap();
        let mut w = Stream::create(Mode::Write, ContentType::Binary);
        w.bind_path(&path).unwrap();
        assert!(matches!(w.open(), Err(StreamError::FileExists)));
    }

    #[test]
    fn read_line_strips_comment_and_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.txt");
        std::fs::write(&path, b"10.0.0.0/8 # private\nplain line\n").unwrap();

        let mut r = Stream::create(Mode::Read, ContentType::Text);
        r.bind_path(&path).unwrap();
        r.open().unwrap();
        r.set_comment_prefix(Some('#'));
        let mut line_no = 0u64;
        assert_eq!(r.read_line(1024, &mut line_no).unwrap().unwrap(), "10.0.0.0/8");
        assert_eq!(line_no, 1);
        assert_eq!(r.read_line(1024, &mut line_no).unwrap().unwrap(), "plain line");
        assert_eq!(line_no, 2);
        assert_eq!(r.read_line(1024, &mut line_no).unwrap(), None);
    }

    #[test]
    fn read_line_default_has_no_comment_marker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.txt");
        std::fs::write(&path, b"10.0.0.0/8 # not a comment\n").unwrap();

        let mut r = Stream::create(Mode::Read, ContentType::Text);
        r.bind_path(&path).unwrap();
        r.open().unwrap();
        let mut line_no = 0u64;
        assert_eq!(
            r.read_line(1024, &mut line_no).unwrap().unwrap(),
            "10.0.0.0/8 # not a comment"
        );
    }

    #[test]
    fn read_line_skips_blank_and_comment_only_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.txt");
        std::fs::write(&path, b"\n# just a comment\n   \nreal line\n").unwrap();

        let mut r = Stream::create(Mode::Read, ContentType::Text);
        r.bind_path(&path).unwrap();
        r.open().unwrap();
        r.set_comment_prefix(Some('#'));
        let mut line_no = 0u64;
        assert_eq!(r.read_line(1024, &mut line_no).unwrap().unwrap(), "real line");
        // all four physical lines were consumed to reach it.
        assert_eq!(line_no, 4);
        assert_eq!(r.read_line(1024, &mut line_no).unwrap(), None);
    }

    #[test]
    fn read_line_too_long_is_record_level_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.txt");
        std::fs::write(&path, b"aaaaaaaaaaaaaaaaaaaa\n").unwrap();
        let mut r = Stream::create(Mode::Read, ContentType::Text);
        r.bind_path(&path).unwrap();
        r.open().unwrap();
        let mut line_no = 0u64;
        let err = r.read_line(5, &mut line_no).unwrap_err();
        assert!(matches!(err, StreamError::LongLine));
        assert!(!err.is_fatal_to_stream());
    }

    #[test]
    fn append_mode_seeks_past_header_to_eof() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.bin");

        let mut w = Stream::create(Mode::Write, ContentType::Binary);
        w.bind_path(&path).unwrap();
        w.open().unwrap();
        w.write_header(FileHeader::new(FileFormat::Bag, 3, 0)).unwrap();
        w.write_bytes(b"existing").unwrap();
        w.close().unwrap();

        let mut a = Stream::create(Mode::Append, ContentType::Binary);
        a.bind_path(&path).unwrap();
        a.open().unwrap();
        let hdr = a.read_header().unwrap();
        assert_eq!(hdr.file_format, FileFormat::Bag);
        a.write_bytes(b"more").unwrap();
        a.close().unwrap();

        let mut r = Stream::create(Mode::Read, ContentType::Binary);
        r.bind_path(&path).unwrap();
        r.open().unwrap();
        r.read_header().unwrap();
        let mut buf = [0u8; 12];
        r.read_bytes(&mut buf).unwrap();
        assert_eq!(&buf, b"existingmore");
    }

    #[test]
    fn write_mode_allows_fifo_target() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.fifo");
        let c_path = std::ffi::CString::new(path.as_os_str().to_str().unwrap()).unwrap();
        let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
        assert_eq!(rc, 0);

        // A write-mode open against an existing FIFO must not be refused
        // with `FileExists`; it blocks on the reader instead, so pair it
        // with one on another thread.
        let reader_path = path.clone();
        let reader = std::thread::spawn(move || {
            let mut r = Stream::create(Mode::Read, ContentType::Binary);
            r.bind_path(&reader_path).unwrap();
            r.open().unwrap();
            let mut buf = [0u8; 4];
            r.read_bytes(&mut buf).unwrap();
            buf
        });

        let mut w = Stream::create(Mode::Write, ContentType::Binary);
        w.bind_path(&path).unwrap();
        w.open().unwrap();
        w.write_bytes(b"ping").unwrap();
        w.close().unwrap();

        assert_eq!(reader.join().unwrap(), *b"ping");
    }
}
