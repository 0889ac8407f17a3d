//! Raw terminal device: termios discipline, byte-level I/O and the ANSI/VT
//! control sequences the views draw with.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use std::time::Duration;

use crossterm::cursor::{Hide, MoveTo, MoveToNextLine, MoveToPreviousLine, Show};
use crossterm::terminal::{Clear, ClearType, EnterAlternateScreen, LeaveAlternateScreen};
use crossterm::{Command, queue};
use log::{debug, warn};
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

use crate::error::{CursorError, DeviceError};

pub const TTY_PATH: &str = "/dev/tty";
pub const CURSOR_POSITION_TIMEOUT: Duration = Duration::from_secs(3);
const MAX_CURSOR_REPORT_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
    pub pixel_width: u16,
    pub pixel_height: u16,
}

impl WindowSize {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CursorHome;

impl Command for CursorHome {
    fn write_ansi(&self, f: &mut impl fmt::Write) -> fmt::Result {
        f.write_str("\x1b[H")
    }
}

/// `ESC[?1000h`: X10 button press/release reporting only.
#[derive(Debug, Clone, Copy)]
pub struct EnableMouseReporting;

impl Command for EnableMouseReporting {
    fn write_ansi(&self, f: &mut impl fmt::Write) -> fmt::Result {
        f.write_str("\x1b[?1000h")
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DisableMouseReporting;

impl Command for DisableMouseReporting {
    fn write_ansi(&self, f: &mut impl fmt::Write) -> fmt::Result {
        f.write_str("\x1b[?1000l")
    }
}

/// `ESC[6n`, answered by the terminal with `ESC[{row};{col}R`.
#[derive(Debug, Clone, Copy)]
pub struct RequestCursorPosition;

impl Command for RequestCursorPosition {
    fn write_ansi(&self, f: &mut impl fmt::Write) -> fmt::Result {
        f.write_str("\x1b[6n")
    }
}

#[derive(Debug)]
struct Device {
    input: File,
    output_fd: RawFd,
    saved: Option<libc::termios>,
}

/// Output half of the controlling terminal plus its saved discipline.
///
/// Every toggle is idempotent and only emits its control sequence on an
/// actual state change. Dropping the terminal restores it.
pub struct Terminal {
    out: Box<dyn Write + Send>,
    device: Option<Device>,
    fixed_size: WindowSize,
    alt_screen: bool,
    mouse: bool,
    cursor_hidden: bool,
}

impl fmt::Debug for Terminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Terminal")
            .field("device", &self.device)
            .field("alt_screen", &self.alt_screen)
            .field("mouse", &self.mouse)
            .field("cursor_hidden", &self.cursor_hidden)
            .finish_non_exhaustive()
    }
}

impl Terminal {
    /// Opens `path`, switches it to raw mode and returns the output half
    /// together with a non-blocking input half. Must run inside a tokio runtime.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, TtyInput), DeviceError> {
        let path = path.as_ref();
        let open_error = |source| DeviceError::Open {
            path: path.to_path_buf(),
            source,
        };
        let input = OpenOptions::new()
            .read(true)
            .open(path)
            .map_err(open_error)?;
        let output = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(open_error)?;

        let fd = input.as_raw_fd();
        // SAFETY: isatty only inspects the descriptor, which is owned by `input`.
        if unsafe { libc::isatty(fd) } != 1 {
            return Err(DeviceError::NotATerminal {
                path: path.to_path_buf(),
            });
        }

        let saved = get_termios(fd).map_err(|source| DeviceError::Ioctl {
            op: "tcgetattr",
            source,
        })?;
        let mut raw = saved;
        make_raw(&mut raw);
        set_termios(fd, &raw).map_err(|source| DeviceError::Ioctl {
            op: "tcsetattr",
            source,
        })?;

        let output_fd = output.as_raw_fd();
        let mut terminal = Self {
            out: Box::new(BufWriter::new(output)),
            device: Some(Device {
                input,
                output_fd,
                saved: Some(saved),
            }),
            fixed_size: WindowSize::new(0, 0),
            alt_screen: false,
            mouse: false,
            cursor_hidden: false,
        };

        let reader = match terminal.prepare_reader() {
            Ok(reader) => reader,
            Err(err) => {
                let _ = terminal.close();
                return Err(err);
            }
        };

        debug!("opened {} in raw mode", path.display());
        Ok((terminal, reader))
    }

    /// A terminal without a device behind it, drawing into `out` with a fixed
    /// geometry.
    pub fn headless(out: impl Write + Send + 'static, size: WindowSize) -> Self {
        Self {
            out: Box::new(out),
            device: None,
            fixed_size: size,
            alt_screen: false,
            mouse: false,
            cursor_hidden: false,
        }
    }

    fn prepare_reader(&self) -> Result<TtyInput, DeviceError> {
        let Some(device) = &self.device else {
            return Err(DeviceError::Io(io::Error::other("no terminal device")));
        };
        let reader = device.input.try_clone()?;
        set_nonblocking(reader.as_raw_fd()).map_err(|source| DeviceError::Ioctl {
            op: "fcntl(O_NONBLOCK)",
            source,
        })?;
        Ok(TtyInput {
            inner: AsyncFd::new(reader)?,
        })
    }

    /// Leaves every mode this terminal switched on and restores the saved
    /// discipline. Safe to call repeatedly and on a headless terminal.
    pub fn close(&mut self) -> Result<(), DeviceError> {
        let modes = self
            .disable_mouse()
            .and_then(|()| self.show_cursor())
            .and_then(|()| self.disable_alt());

        if let Some(device) = &mut self.device
            && let Some(saved) = device.saved.take()
        {
            set_termios(device.input.as_raw_fd(), &saved).map_err(|source| {
                DeviceError::Ioctl {
                    op: "tcsetattr",
                    source,
                }
            })?;
            debug!("terminal discipline restored");
        }

        modes
    }

    pub fn is_raw(&self) -> bool {
        self.device
            .as_ref()
            .is_some_and(|device| device.saved.is_some())
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<(), DeviceError> {
        self.out.write_all(bytes)?;
        self.out.flush()?;
        Ok(())
    }

    pub fn write_line(&mut self, line: &str) -> Result<(), DeviceError> {
        self.out.write_all(line.as_bytes())?;
        self.out.write_all(b"\r\n")?;
        self.out.flush()?;
        Ok(())
    }

    pub fn size(&self) -> Result<WindowSize, DeviceError> {
        let Some(device) = &self.device else {
            return Ok(self.fixed_size);
        };

        // SAFETY: winsize is plain data; zeroed is a valid value.
        let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
        // SAFETY: TIOCGWINSZ writes a winsize into the pointer we pass.
        let rc = unsafe { libc::ioctl(device.output_fd, libc::TIOCGWINSZ, &mut ws) };
        if rc == -1 {
            return Err(DeviceError::Ioctl {
                op: "TIOCGWINSZ",
                source: io::Error::last_os_error(),
            });
        }

        Ok(WindowSize {
            rows: ws.ws_row,
            cols: ws.ws_col,
            pixel_width: ws.ws_xpixel,
            pixel_height: ws.ws_ypixel,
        })
    }

    pub fn set_fixed_size(&mut self, size: WindowSize) {
        self.fixed_size = size;
    }

    pub fn clear(&mut self) -> Result<(), DeviceError> {
        self.emit(Clear(ClearType::All))?;
        self.emit(CursorHome)
    }

    pub fn clear_line(&mut self) -> Result<(), DeviceError> {
        self.emit(Clear(ClearType::CurrentLine))
    }

    pub fn enable_alt(&mut self) -> Result<(), DeviceError> {
        if self.alt_screen {
            return Ok(());
        }
        self.emit(EnterAlternateScreen)?;
        self.alt_screen = true;
        Ok(())
    }

    pub fn disable_alt(&mut self) -> Result<(), DeviceError> {
        if !self.alt_screen {
            return Ok(());
        }
        self.emit(LeaveAlternateScreen)?;
        self.alt_screen = false;
        Ok(())
    }

    pub fn is_alt(&self) -> bool {
        self.alt_screen
    }

    pub fn enable_mouse(&mut self) -> Result<(), DeviceError> {
        if self.mouse {
            return Ok(());
        }
        self.emit(EnableMouseReporting)?;
        self.mouse = true;
        Ok(())
    }

    pub fn disable_mouse(&mut self) -> Result<(), DeviceError> {
        if !self.mouse {
            return Ok(());
        }
        self.emit(DisableMouseReporting)?;
        self.mouse = false;
        Ok(())
    }

    pub fn is_mouse_enabled(&self) -> bool {
        self.mouse
    }

    pub fn hide_cursor(&mut self) -> Result<(), DeviceError> {
        if self.cursor_hidden {
            return Ok(());
        }
        self.emit(Hide)?;
        self.cursor_hidden = true;
        Ok(())
    }

    pub fn show_cursor(&mut self) -> Result<(), DeviceError> {
        if !self.cursor_hidden {
            return Ok(());
        }
        self.emit(Show)?;
        self.cursor_hidden = false;
        Ok(())
    }

    /// 1-based `row`/`col`.
    pub fn move_cursor(&mut self, row: u16, col: u16) -> Result<(), DeviceError> {
        self.emit(MoveTo(col.saturating_sub(1), row.saturating_sub(1)))
    }

    pub fn next_line(&mut self, n: u16) -> Result<(), DeviceError> {
        for _ in 0..n.max(1) {
            self.emit(MoveToNextLine(1))?;
        }
        Ok(())
    }

    pub fn prev_line(&mut self, n: u16) -> Result<(), DeviceError> {
        for _ in 0..n.max(1) {
            self.emit(MoveToPreviousLine(1))?;
        }
        Ok(())
    }

    pub fn queue(&mut self, command: impl Command) -> Result<(), DeviceError> {
        queue!(self.out, command)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), DeviceError> {
        self.out.flush()?;
        Ok(())
    }

    fn emit(&mut self, command: impl Command) -> Result<(), DeviceError> {
        self.queue(command)?;
        self.flush()
    }
}

impl Drop for Terminal {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!("failed to restore terminal: {err}");
        }
    }
}

/// Non-blocking read half of the terminal, readable from async code.
#[derive(Debug)]
pub struct TtyInput {
    inner: AsyncFd<File>,
}

impl AsyncRead for TtyInput {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = ready!(self.inner.poll_read_ready(cx))?;
            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| {
                let mut file: &File = inner.get_ref();
                file.read(unfilled)
            }) {
                Ok(Ok(len)) => {
                    buf.advance(len);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(err)) => return Poll::Ready(Err(err)),
                Err(_would_block) => continue,
            }
        }
    }
}

/// Decodes a byte stream into Unicode scalars. Bytes that cannot start a
/// UTF-8 sequence come through as Latin-1 scalars. Cancel safe: bytes are only
/// buffered after a read completes.
#[derive(Debug)]
pub struct RuneReader<R> {
    inner: R,
    pending: Vec<u8>,
}

impl<R: AsyncRead + Unpin> RuneReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            pending: Vec::new(),
        }
    }

    pub async fn read_rune(&mut self) -> io::Result<char> {
        loop {
            if let Some(rune) = self.take_rune() {
                return Ok(rune);
            }
            self.fill().await?;
        }
    }

    /// Mouse reports carry raw coordinate bytes that are not UTF-8.
    pub async fn read_byte(&mut self) -> io::Result<u8> {
        if self.pending.is_empty() {
            self.fill().await?;
        }
        Ok(self.pending.remove(0))
    }

    async fn fill(&mut self) -> io::Result<()> {
        let mut chunk = [0u8; 64];
        let n = self.inner.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "terminal input closed",
            ));
        }
        self.pending.extend_from_slice(&chunk[..n]);
        Ok(())
    }

    fn take_rune(&mut self) -> Option<char> {
        let first = *self.pending.first()?;
        let width = utf8_width(first);
        if width == 0 {
            self.pending.remove(0);
            return Some(char::from(first));
        }
        if self.pending.len() < width {
            return None;
        }

        match std::str::from_utf8(&self.pending[..width]) {
            Ok(text) => {
                let rune = text.chars().next()?;
                self.pending.drain(..width);
                Some(rune)
            }
            Err(_) => {
                self.pending.remove(0);
                Some(char::from(first))
            }
        }
    }
}

fn utf8_width(lead: u8) -> usize {
    match lead {
        0x00..=0x7f => 1,
        0xc2..=0xdf => 2,
        0xe0..=0xef => 3,
        0xf0..=0xf4 => 4,
        _ => 0,
    }
}

/// Asks the terminal where the cursor is and waits for the `ESC[row;colR`
/// answer on `input`. The pending read is dropped at the deadline, so later
/// reads are not blocked.
pub async fn cursor_position<R: AsyncRead + Unpin>(
    terminal: &mut Terminal,
    input: &mut RuneReader<R>,
) -> Result<(u16, u16), CursorError> {
    terminal.emit(RequestCursorPosition)?;

    let read = async {
        let mut response = String::new();
        loop {
            let rune = match input.read_rune().await {
                Ok(rune) => rune,
                Err(err) => break Err(CursorError::Io(err)),
            };
            response.push(rune);
            if rune == 'R' {
                break Ok(response);
            }
            if response.chars().count() >= MAX_CURSOR_REPORT_LEN {
                break Err(CursorError::Protocol(response));
            }
        }
    };
    let response = tokio::time::timeout(CURSOR_POSITION_TIMEOUT, read)
        .await
        .map_err(|_| CursorError::Timeout(CURSOR_POSITION_TIMEOUT))??;

    parse_cursor_report(&response)
}

fn parse_cursor_report(report: &str) -> Result<(u16, u16), CursorError> {
    let malformed = || CursorError::Protocol(report.to_owned());
    let start = report.rfind("\x1b[").ok_or_else(malformed)?;
    let body = report[start + 2..].strip_suffix('R').ok_or_else(malformed)?;
    let (row, col) = body.split_once(';').ok_or_else(malformed)?;
    let row = row.parse::<u16>().map_err(|_| malformed())?;
    let col = col.parse::<u16>().map_err(|_| malformed())?;
    Ok((row, col))
}

fn get_termios(fd: RawFd) -> io::Result<libc::termios> {
    let mut termios = MaybeUninit::<libc::termios>::uninit();
    // SAFETY: tcgetattr fully initialises the struct when it returns 0.
    if unsafe { libc::tcgetattr(fd, termios.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: checked the return code above.
    Ok(unsafe { termios.assume_init() })
}

fn set_termios(fd: RawFd, termios: &libc::termios) -> io::Result<()> {
    // SAFETY: the pointer refers to a valid, initialised termios.
    if unsafe { libc::tcsetattr(fd, libc::TCSANOW, termios) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn make_raw(termios: &mut libc::termios) {
    termios.c_iflag &= !(libc::IGNBRK
        | libc::BRKINT
        | libc::PARMRK
        | libc::ISTRIP
        | libc::INLCR
        | libc::IGNCR
        | libc::ICRNL
        | libc::IXON);
    termios.c_oflag &= !libc::OPOST;
    termios.c_lflag &= !(libc::ECHO | libc::ECHONL | libc::ICANON | libc::ISIG | libc::IEXTEN);
    termios.c_cflag &= !(libc::CSIZE | libc::PARENB);
    termios.c_cflag |= libc::CS8;
    termios.c_cc[libc::VMIN] = 1;
    termios.c_cc[libc::VTIME] = 0;
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: F_GETFL/F_SETFL on a descriptor we own.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags == -1 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use std::io::{self, Write};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, Default)]
    pub(crate) struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Capture {
        pub(crate) fn take(&self) -> String {
            let mut bytes = self.0.lock().unwrap();
            String::from_utf8(std::mem::take(&mut *bytes)).unwrap()
        }
    }

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}
