//! Tolerant scanner for `module "<name>" { source = "<address>" }` blocks.
//!
//! This is not an HCL parser. It recognises a `module` keyword at the start
//! of a line followed by a quoted name and an opening brace on the same
//! line, then follows brace depth until the block closes. Braces inside
//! strings, comments (`#`, `//`, and `/* */` spanning lines), and heredocs
//! are ignored, and a header inside a block comment or heredoc is not a
//! declaration. The first top-level `source = "..."` assignment inside the
//! block is captured. Blocks without a source are skipped.

/// A `module` block found in the entry file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ModuleDeclaration {
    /// Declared module name.
    pub(crate) name: String,
    /// Source address exactly as written.
    pub(crate) source: String,
    /// One-based line of the `module` keyword.
    pub(crate) line: usize,
}

/// Scans `text` for module declarations in file order.
pub(crate) fn scan(text: &str) -> Vec<ModuleDeclaration> {
    let mut declarations = Vec::new();
    let mut lexer = Lexer::default();
    let mut lines = text.lines().enumerate();

    while let Some((index, line)) = lines.next() {
        let header = if lexer.in_code() {
            parse_header(line)
        } else {
            None
        };
        let Some((name, remainder)) = header else {
            lexer.advance(line, 0);
            continue;
        };

        let mut source = None;
        let mut segment = remainder;
        let mut depth = 1_usize;
        loop {
            if depth == 1 && source.is_none() && lexer.in_code() {
                source = parse_source_assignment(segment);
            }
            depth = lexer.advance(segment, depth);
            if depth == 0 {
                break;
            }
            let Some((_, next)) = lines.next() else {
                break;
            };
            segment = next;
        }

        if let Some(address) = source {
            declarations.push(ModuleDeclaration {
                name: name.to_owned(),
                source: address.to_owned(),
                line: index + 1,
            });
        }
    }

    declarations
}

/// Matches `module "<name>" {` and returns the name and the text after the
/// brace.
fn parse_header(line: &str) -> Option<(&str, &str)> {
    let after_keyword = line.trim_start().strip_prefix("module")?;
    if !after_keyword.starts_with([' ', '\t', '"']) {
        return None;
    }
    let (name, after_name) = parse_quoted(after_keyword.trim_start())?;
    let body = after_name.trim_start().strip_prefix('{')?;
    Some((name, body))
}

/// Matches `source = "<address>"` at the start of `segment`.
fn parse_source_assignment(segment: &str) -> Option<&str> {
    let after_key = segment.trim_start().strip_prefix("source")?;
    let after_equals = after_key.trim_start().strip_prefix('=')?;
    let (value, _) = parse_quoted(after_equals.trim_start())?;
    Some(value)
}

fn parse_quoted(text: &str) -> Option<(&str, &str)> {
    text.strip_prefix('"')?.split_once('"')
}

/// Lexical context carried from one line to the next.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
enum Context {
    #[default]
    Code,
    BlockComment,
    /// Inside a heredoc closed by a line holding only the marker.
    Heredoc(String),
}

#[derive(Debug, Default)]
struct Lexer {
    context: Context,
}

impl Lexer {
    /// Returns `true` when the next line starts outside comments and
    /// heredocs.
    fn in_code(&self) -> bool {
        self.context == Context::Code
    }

    /// Consumes `segment` and returns the brace depth after it. A depth of
    /// zero means no block is being tracked: braces are ignored, and a
    /// tracked block that closes stays at zero while the rest of the line is
    /// still lexed.
    fn advance(&mut self, segment: &str, depth: usize) -> usize {
        if let Context::Heredoc(marker) = &self.context {
            if segment.trim() == marker {
                self.context = Context::Code;
            }
            return depth;
        }

        let mut current = depth;
        let mut in_string = false;
        let mut escaped = false;
        let mut chars = segment.char_indices().peekable();

        while let Some((index, ch)) = chars.next() {
            let next = chars.peek().map(|&(_, peeked)| peeked);
            if self.context == Context::BlockComment {
                if ch == '*' && next == Some('/') {
                    chars.next();
                    self.context = Context::Code;
                }
                continue;
            }
            if in_string {
                match ch {
                    _ if escaped => escaped = false,
                    '\\' => escaped = true,
                    '"' => in_string = false,
                    _ => {}
                }
                continue;
            }
            match ch {
                '"' => in_string = true,
                '#' => break,
                '/' if next == Some('/') => break,
                '/' if next == Some('*') => {
                    chars.next();
                    self.context = Context::BlockComment;
                }
                '<' if next == Some('<') => {
                    let rest = segment.get(index + 2..).unwrap_or_default();
                    if let Some(marker) = heredoc_marker(rest) {
                        self.context = Context::Heredoc(marker);
                        break;
                    }
                }
                '{' if current > 0 => current += 1,
                '}' if current > 0 => current -= 1,
                _ => {}
            }
        }

        current
    }
}

/// Reads the marker of `<<EOF` or `<<-EOF` from the text after `<<`.
fn heredoc_marker(rest: &str) -> Option<String> {
    let name = rest.strip_prefix('-').unwrap_or(rest);
    let marker: String = name
        .chars()
        .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
        .collect();
    (!marker.is_empty()).then_some(marker)
}
