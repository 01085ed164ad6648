//! Telegram MarkdownV2 escaping and the command output response builder.

/// Characters reserved by MarkdownV2 outside of code entities.
const PLAINTEXT_RESERVED: &[char] = &[
    '`', '\\', '_', '*', '[', ']', '(', ')', '~', '>', '#', '+', '-', '=', '|', '{', '}', '.', '!',
];

/// Escape text for use as MarkdownV2 plaintext.
pub fn escape_plaintext(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    push_escaped_plaintext(&mut out, s);
    out
}

/// Escape text for use inside a MarkdownV2 code span or code block (only `` ` `` and `\`).
pub fn escape_code_block(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    push_escaped_code(&mut out, s);
    out
}

fn push_escaped_plaintext(out: &mut String, s: &str) {
    for c in s.chars() {
        if PLAINTEXT_RESERVED.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
}

fn push_escaped_code(out: &mut String, s: &str) {
    for c in s.chars() {
        if c == '`' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
}

/// Reusable builder for command output replies.
///
/// `build` writes into an internal buffer and hands back a view of it; the borrow ends
/// before the next call, so the view can never be observed after it is overwritten.
#[derive(Debug, Default)]
pub struct ResponseBuilder {
    buffer: String,
}

impl ResponseBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a reply for raw process output and an optional error.
    ///
    /// Output goes into a fenced code block with `` ` `` and `\` escaped. Non-UTF-8 bytes are
    /// replaced. The error, when present, follows the closing fence as escaped plaintext.
    pub fn build(&mut self, output: &[u8], err: Option<&dyn std::fmt::Display>) -> &str {
        self.buffer.clear();
        let text = String::from_utf8_lossy(output);
        self.buffer.reserve(8 + text.len() + text.len() / 8);

        self.buffer.push_str("```\n");
        push_escaped_code(&mut self.buffer, &text);
        if !text.ends_with('\n') {
            self.buffer.push('\n');
        }
        self.buffer.push_str("```\n");

        if let Some(err) = err {
            push_escaped_plaintext(&mut self.buffer, &err.to_string());
        }

        &self.buffer
    }
}

/// One-shot owned variant of [`ResponseBuilder::build`].
pub fn build_response(output: &[u8], err: Option<&dyn std::fmt::Display>) -> String {
    ResponseBuilder::new().build(output, err).to_string()
}
