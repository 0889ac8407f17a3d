use std::io;
use std::time::Duration;

use tokio::io::AsyncRead;

use crate::tty::RuneReader;

/// How long a lone `ESC` waits for a follow-up rune before it is reported as
/// the Escape key. Slow links can split a real sequence across this window.
pub const ESCAPE_WINDOW: Duration = Duration::from_millis(10);
const MAX_SEQUENCE_LEN: usize = 32;
const X10_OFFSET: u8 = 32;

pub const ESC: char = '\u{1b}';
pub const CTRL_C: char = '\u{3}';
pub const ENTER: char = '\r';
pub const BACKSPACE: char = '\u{7f}';
pub const CTRL_H: char = '\u{8}';

pub const CURSOR_UP: &str = "\x1b[A";
pub const CURSOR_DOWN: &str = "\x1b[B";
pub const CURSOR_RIGHT: &str = "\x1b[C";
pub const CURSOR_LEFT: &str = "\x1b[D";
pub const PAGE_UP: &str = "\x1b[5~";
pub const PAGE_DOWN: &str = "\x1b[6~";

pub const MOUSE_LEFT: u16 = 0;
pub const MOUSE_RELEASE: u16 = 3;
pub const MOUSE_WHEEL_UP: u16 = 0x40;
pub const MOUSE_WHEEL_DOWN: u16 = 0x41;

/// Button/modifier code and 1-based cell coordinates of a mouse report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MouseEvent {
    pub code: u16,
    pub column: u16,
    pub row: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputEvent {
    Char(char),
    Ctrl(char),
    Escape,
    /// Complete escape sequence, leading `ESC` included.
    Sequence(String),
    Mouse(MouseEvent),
}

impl InputEvent {
    fn from_rune(rune: char) -> Self {
        if rune.is_control() {
            InputEvent::Ctrl(rune)
        } else {
            InputEvent::Char(rune)
        }
    }
}

#[derive(Debug)]
enum DecoderState {
    Ground,
    EscapePending,
    Csi(String),
    MouseX10(Vec<u8>),
}

/// Turns the terminal's rune stream into key, sequence and mouse events.
#[derive(Debug)]
pub struct InputDecoder<R> {
    reader: RuneReader<R>,
    state: DecoderState,
    window: Duration,
}

impl<R: AsyncRead + Unpin> InputDecoder<R> {
    pub fn new(reader: RuneReader<R>) -> Self {
        Self::with_window(reader, ESCAPE_WINDOW)
    }

    pub fn with_window(reader: RuneReader<R>, window: Duration) -> Self {
        Self {
            reader,
            state: DecoderState::Ground,
            window,
        }
    }

    pub async fn next_event(&mut self) -> io::Result<InputEvent> {
        loop {
            let rune = match self.state {
                DecoderState::Ground => self.reader.read_rune().await?,
                DecoderState::EscapePending => {
                    match tokio::time::timeout(self.window, self.reader.read_rune()).await {
                        Ok(rune) => rune?,
                        Err(_) => {
                            self.state = DecoderState::Ground;
                            return Ok(InputEvent::Escape);
                        }
                    }
                }
                DecoderState::Csi(_) => self.reader.read_rune().await?,
                DecoderState::MouseX10(_) => {
                    let byte = match tokio::time::timeout(self.window, self.reader.read_byte()).await
                    {
                        Ok(byte) => byte?,
                        Err(_) => {
                            self.state = DecoderState::Ground;
                            return Ok(InputEvent::Sequence("\x1b[M".to_owned()));
                        }
                    };
                    if let Some(event) = self.feed_mouse_byte(byte) {
                        return Ok(event);
                    }
                    continue;
                }
            };

            if let Some(event) = self.feed(rune) {
                return Ok(event);
            }
        }
    }

    fn feed(&mut self, rune: char) -> Option<InputEvent> {
        match &mut self.state {
            DecoderState::Ground => {
                if rune == ESC {
                    self.state = DecoderState::EscapePending;
                    return None;
                }
                Some(InputEvent::from_rune(rune))
            }
            DecoderState::EscapePending => {
                if rune == ESC {
                    return Some(InputEvent::Escape);
                }
                let mut sequence = String::new();
                sequence.push(rune);
                self.finish_or_accumulate(sequence)
            }
            DecoderState::Csi(sequence) => {
                if rune == ESC {
                    let partial = std::mem::take(sequence);
                    self.state = DecoderState::EscapePending;
                    return Some(InputEvent::Sequence(format!("{ESC}{partial}")));
                }
                let mut sequence = std::mem::take(sequence);
                sequence.push(rune);
                self.finish_or_accumulate(sequence)
            }
            DecoderState::MouseX10(_) => None,
        }
    }

    fn feed_mouse_byte(&mut self, byte: u8) -> Option<InputEvent> {
        let DecoderState::MouseX10(bytes) = &mut self.state else {
            return None;
        };
        bytes.push(byte.saturating_sub(X10_OFFSET));
        if bytes.len() < 3 {
            return None;
        }
        let event = MouseEvent {
            code: u16::from(bytes[0]),
            column: u16::from(bytes[1]),
            row: u16::from(bytes[2]),
        };
        self.state = DecoderState::Ground;
        Some(InputEvent::Mouse(event))
    }

    fn finish_or_accumulate(&mut self, sequence: String) -> Option<InputEvent> {
        if sequence == "[M" {
            self.state = DecoderState::MouseX10(Vec::with_capacity(3));
            return None;
        }

        if sequence_complete(&sequence) || sequence.chars().count() >= MAX_SEQUENCE_LEN {
            self.state = DecoderState::Ground;
            if let Some(mouse) = parse_sgr_mouse(&sequence) {
                return mouse.map(InputEvent::Mouse);
            }
            return Some(InputEvent::Sequence(format!("{ESC}{sequence}")));
        }

        self.state = DecoderState::Csi(sequence);
        None
    }
}

fn sequence_complete(sequence: &str) -> bool {
    match sequence.chars().last() {
        Some(last) if last.is_ascii_alphabetic() => true,
        Some('~') => sequence.starts_with('[') && sequence.len() > 1,
        _ => false,
    }
}

/// `[<b;x;yM` (press) or `[<b;x;ym` (release). `Some(None)` is a well-formed
/// report that carries no event.
fn parse_sgr_mouse(sequence: &str) -> Option<Option<MouseEvent>> {
    let payload = sequence.strip_prefix("[<")?;
    let (params, pressed) = match payload.strip_suffix('M') {
        Some(params) => (params, true),
        None => (payload.strip_suffix('m')?, false),
    };

    let mut parts = params.split(';');
    let cb = parts.next()?.parse::<u16>().ok()?;
    let column = parts.next()?.parse::<u16>().ok()?;
    let row = parts.next()?.parse::<u16>().ok()?;
    if parts.next().is_some() {
        return None;
    }

    let is_motion = (cb & 0b0010_0000) != 0;
    if is_motion {
        return Some(None);
    }

    let code = if pressed { cb } else { MOUSE_RELEASE };
    Some(Some(MouseEvent { code, column, row }))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;

    use super::{
        CURSOR_UP, InputDecoder, InputEvent, MOUSE_LEFT, MOUSE_RELEASE, MOUSE_WHEEL_UP,
        MouseEvent, PAGE_DOWN, parse_sgr_mouse, sequence_complete,
    };
    use crate::tty::RuneReader;

    fn decoder(server: tokio::io::DuplexStream) -> InputDecoder<tokio::io::DuplexStream> {
        InputDecoder::new(RuneReader::new(server))
    }

    #[tokio::test(start_paused = true)]
    async fn csi_without_delay_is_one_control_event() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"\x1b[Ax").await.unwrap();
        let mut decoder = decoder(server);

        assert_eq!(
            decoder.next_event().await.unwrap(),
            InputEvent::Sequence(CURSOR_UP.to_owned())
        );
        assert_eq!(decoder.next_event().await.unwrap(), InputEvent::Char('x'));
    }

    #[tokio::test(start_paused = true)]
    async fn lone_escape_after_pause_is_escape_key() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"\x1b").await.unwrap();
        let mut decoder = decoder(server);

        assert_eq!(decoder.next_event().await.unwrap(), InputEvent::Escape);

        client.write_all(b"k").await.unwrap();
        assert_eq!(decoder.next_event().await.unwrap(), InputEvent::Char('k'));
    }

    #[tokio::test(start_paused = true)]
    async fn escape_then_late_bracket_is_two_events() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"\x1b").await.unwrap();
        let mut decoder = decoder(server);

        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            client.write_all(b"[").await.unwrap();
            client
        });

        assert_eq!(decoder.next_event().await.unwrap(), InputEvent::Escape);
        let _client = writer.await.unwrap();
        assert_eq!(decoder.next_event().await.unwrap(), InputEvent::Char('['));
    }

    #[tokio::test]
    async fn control_and_printable_runes_are_classified() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all("\r\u{7f}\u{3}é ".as_bytes()).await.unwrap();
        let mut decoder = decoder(server);

        assert_eq!(decoder.next_event().await.unwrap(), InputEvent::Ctrl('\r'));
        assert_eq!(decoder.next_event().await.unwrap(), InputEvent::Ctrl('\u{7f}'));
        assert_eq!(decoder.next_event().await.unwrap(), InputEvent::Ctrl('\u{3}'));
        assert_eq!(decoder.next_event().await.unwrap(), InputEvent::Char('é'));
        assert_eq!(decoder.next_event().await.unwrap(), InputEvent::Char(' '));
    }

    #[tokio::test]
    async fn tilde_terminates_page_keys() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"\x1b[6~j").await.unwrap();
        let mut decoder = decoder(server);

        assert_eq!(
            decoder.next_event().await.unwrap(),
            InputEvent::Sequence(PAGE_DOWN.to_owned())
        );
        assert_eq!(decoder.next_event().await.unwrap(), InputEvent::Char('j'));
    }

    #[tokio::test]
    async fn x10_mouse_report_decodes_offset_bytes() {
        let (mut client, server) = tokio::io::duplex(64);
        client
            .write_all(&[0x1b, b'[', b'M', 32, 32 + 12, 32 + 7])
            .await
            .unwrap();
        let mut decoder = decoder(server);

        assert_eq!(
            decoder.next_event().await.unwrap(),
            InputEvent::Mouse(MouseEvent {
                code: MOUSE_LEFT,
                column: 12,
                row: 7
            })
        );
    }

    #[tokio::test]
    async fn x10_mouse_wheel_and_wide_columns() {
        let (mut client, server) = tokio::io::duplex(64);
        client
            .write_all(&[0x1b, b'[', b'M', 32 + 64, 32 + 150, 32 + 3])
            .await
            .unwrap();
        let mut decoder = decoder(server);

        assert_eq!(
            decoder.next_event().await.unwrap(),
            InputEvent::Mouse(MouseEvent {
                code: MOUSE_WHEEL_UP,
                column: 150,
                row: 3
            })
        );
    }

    #[tokio::test]
    async fn x10_coordinates_that_look_like_utf8_stay_separate() {
        let (mut client, server) = tokio::io::duplex(64);
        client
            .write_all(&[0x1b, b'[', b'M', 32, 0xc2, 0xa0, b'j'])
            .await
            .unwrap();
        let mut decoder = decoder(server);

        assert_eq!(
            decoder.next_event().await.unwrap(),
            InputEvent::Mouse(MouseEvent {
                code: MOUSE_LEFT,
                column: 0xc2 - 32,
                row: 0xa0 - 32
            })
        );
        assert_eq!(decoder.next_event().await.unwrap(), InputEvent::Char('j'));
    }

    #[tokio::test]
    async fn sgr_mouse_report_decodes() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"\x1b[<0;12;7M\x1b[<0;12;7m").await.unwrap();
        let mut decoder = decoder(server);

        assert_eq!(
            decoder.next_event().await.unwrap(),
            InputEvent::Mouse(MouseEvent {
                code: MOUSE_LEFT,
                column: 12,
                row: 7
            })
        );
        assert_eq!(
            decoder.next_event().await.unwrap(),
            InputEvent::Mouse(MouseEvent {
                code: MOUSE_RELEASE,
                column: 12,
                row: 7
            })
        );
    }

    #[tokio::test]
    async fn escape_inside_sequence_flushes_partial() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"\x1b[1\x1b[B").await.unwrap();
        let mut decoder = decoder(server);

        assert_eq!(
            decoder.next_event().await.unwrap(),
            InputEvent::Sequence("\x1b[1".to_owned())
        );
        assert_eq!(
            decoder.next_event().await.unwrap(),
            InputEvent::Sequence("\x1b[B".to_owned())
        );
    }

    #[test]
    fn sequence_terminators() {
        assert!(sequence_complete("[A"));
        assert!(sequence_complete("[1;5C"));
        assert!(sequence_complete("[5~"));
        assert!(!sequence_complete("["));
        assert!(!sequence_complete("[1;"));
        assert!(!sequence_complete("~"));
    }

    #[test]
    fn sgr_parser_skips_motion_and_rejects_garbage() {
        assert_eq!(
            parse_sgr_mouse("[<64;3;4M"),
            Some(Some(MouseEvent {
                code: MOUSE_WHEEL_UP,
                column: 3,
                row: 4
            }))
        );
        assert_eq!(parse_sgr_mouse("[<35;12;7M"), Some(None));
        assert_eq!(parse_sgr_mouse("[<0;12M"), None);
        assert_eq!(parse_sgr_mouse("[A"), None);
    }
}
