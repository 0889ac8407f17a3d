use crossterm::style::Color;

const ELLIPSIS: &str = "...";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warn,
    Info,
    Debug,
}

impl Severity {
    const TOKENS: [(&'static str, Severity); 4] = [
        ("ERROR", Severity::Error),
        ("WARN", Severity::Warn),
        ("INFO", Severity::Info),
        ("DEBUG", Severity::Debug),
    ];

    pub fn color(self) -> Color {
        match self {
            Severity::Error => Color::DarkRed,
            Severity::Warn => Color::DarkMagenta,
            Severity::Info => Color::DarkGreen,
            Severity::Debug => Color::DarkBlue,
        }
    }
}

pub fn clip_to_width(text: &str, width: usize) -> String {
    if width == 0 {
        return String::new();
    }

    text.chars().take(width).collect()
}

pub fn clip_with_ellipsis(text: &str, width: usize) -> String {
    if width == 0 {
        return String::new();
    }

    let char_count = text.chars().count();
    if char_count <= width {
        return text.to_owned();
    }

    if width <= ELLIPSIS.len() {
        return ".".repeat(width);
    }

    let mut out = text.chars().take(width - ELLIPSIS.len()).collect::<String>();
    out.push_str(ELLIPSIS);
    out
}

/// Trims the message, turns tabs into spaces and drops control characters
/// other than newlines.
pub fn sanitize_message(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter_map(|ch| match ch {
            '\t' => Some(' '),
            '\n' => Some('\n'),
            ch if ch.is_control() => None,
            ch => Some(ch),
        })
        .collect()
}

/// Single-row form of a message.
pub fn flatten_lines(text: &str) -> String {
    text.replace('\n', " ")
}

/// Splits `text` around the severity tokens it contains.
pub fn severity_segments(text: &str) -> Vec<(&str, Option<Severity>)> {
    let mut segments = Vec::new();
    let mut plain_start = 0;
    let mut index = 0;

    while index < text.len() {
        let rest = &text[index..];
        let token = Severity::TOKENS
            .iter()
            .find(|(token, _)| rest.starts_with(token));

        if let Some((token, severity)) = token {
            if plain_start < index {
                segments.push((&text[plain_start..index], None));
            }
            segments.push((&text[index..index + token.len()], Some(*severity)));
            index += token.len();
            plain_start = index;
            continue;
        }

        index += rest.chars().next().map_or(1, char::len_utf8);
    }

    if plain_start < text.len() {
        segments.push((&text[plain_start..], None));
    }

    segments
}
