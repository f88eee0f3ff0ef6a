//! Sentinel framing for interactive shells
//!
//! A shell channel is one undelimited byte stream. Each command is wrapped
//! in two `echo`s of a fresh token:
//!
//! ```text
//! echo <TOKEN>
//! <command>
//! echo <TOKEN> $?
//! ```
//!
//! The first echo marks where the command's output starts and the second
//! marks where it ends, carrying the exit status after a space.
//!
//! The leading marker only counts when it fills a whole line. The trailing
//! marker is the next occurrence followed by a space, and it is only parsed
//! once its line is complete. A token that shows up anywhere else in the
//! stream is treated as ordinary output.

use bytes::Bytes;
use uuid::Uuid;

/// Unique per-command marker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentinel {
    token: String,
}

/// A command's output recovered from between its two markers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Framed {
    /// Output between the markers, ASCII whitespace trimmed
    pub output: Bytes,
    /// Parsed exit status
    pub exit_status: Option<i32>,
    /// The status field as it appeared on the wire
    pub raw_status: String,
    /// Bytes consumed through the end of the trailing marker's line
    pub consumed: usize,
}

impl Default for Sentinel {
    fn default() -> Self {
        Self::new()
    }
}

impl Sentinel {
    /// A fresh random token
    pub fn new() -> Self {
        Self {
            token: Uuid::new_v4().simple().to_string(),
        }
    }

    /// Use a fixed token
    pub fn with_token(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }

    /// The token text
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Bytes to write to the shell for `command`
    pub fn frame(&self, command: &str, exit_status_variable: &str) -> Bytes {
        Bytes::from(format!(
            "echo {token}\n{command}\necho {token} {status}\n",
            token = self.token,
            command = command.trim(),
            status = exit_status_variable,
        ))
    }

    /// Offset just past the leading marker's line, if it has arrived
    pub fn output_start(&self, buf: &[u8]) -> Option<usize> {
        let token = self.token.as_bytes();
        find_all(buf, token, 0).find_map(|at| {
            if at > 0 && buf[at - 1] != b'\n' {
                return None;
            }
            match &buf[at + token.len()..] {
                [b'\n', ..] => Some(at + token.len() + 1),
                [b'\r', b'\n', ..] => Some(at + token.len() + 2),
                _ => None,
            }
        })
    }

    /// Output after the leading marker, for a shell that exited before
    /// printing the trailing one
    pub fn output_after_leader(&self, buf: &[u8]) -> Option<Bytes> {
        self.output_start(buf)
            .map(|start| Bytes::copy_from_slice(buf[start..].trim_ascii()))
    }

    /// Recover the command output once both markers are complete
    pub fn parse(&self, buf: &[u8]) -> Option<Framed> {
        let start = self.output_start(buf)?;
        let token = self.token.as_bytes();

        let end = find_all(buf, token, start).find(|at| buf.get(at + token.len()) == Some(&b' '))?;
        let field_start = end + token.len() + 1;
        let newline = buf[field_start..].iter().position(|b| *b == b'\n')? + field_start;

        let raw_status = String::from_utf8_lossy(buf[field_start..newline].trim_ascii()).into_owned();
        Some(Framed {
            output: Bytes::copy_from_slice(buf[start..end].trim_ascii()),
            exit_status: raw_status.parse().ok(),
            raw_status,
            consumed: newline + 1,
        })
    }
}

/// Offsets of every occurrence of `needle` in `haystack` at or after `from`
fn find_all<'a>(haystack: &'a [u8], needle: &'a [u8], from: usize) -> impl Iterator<Item = usize> + 'a {
    let last = haystack.len().checked_sub(needle.len());
    (from..=last.unwrap_or(0))
        .filter(move |_| last.is_some())
        .filter(move |at| haystack[*at..].starts_with(needle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const TOKEN: &str = "5e1f6c0b9a2d4c7e8f3a1b2c3d4e5f60";

    fn sentinel() -> Sentinel {
        Sentinel::with_token(TOKEN)
    }

    fn stream(output: &str, status: &str) -> Vec<u8> {
        format!("{TOKEN}\n{output}{TOKEN} {status}\n").into_bytes()
    }

    #[test]
    fn test_frame_layout() {
        let framed = sentinel().frame("  ls -l \n", "$?");
        assert_eq!(
            framed,
            Bytes::from(format!("echo {TOKEN}\nls -l\necho {TOKEN} $?\n"))
        );
    }

    #[test]
    fn test_fresh_tokens_differ() {
        let a = Sentinel::new();
        let b = Sentinel::new();
        assert_ne!(a, b);
        assert_eq!(a.token().len(), 32);
    }

    #[test]
    fn test_parse_simple() {
        let framed = sentinel().parse(&stream("hello\n", "0")).unwrap();
        assert_eq!(framed.output, Bytes::from_static(b"hello"));
        assert_eq!(framed.exit_status, Some(0));
        assert_eq!(framed.consumed, stream("hello\n", "0").len());
    }

    #[test]
    fn test_parse_output_without_trailing_newline() {
        let framed = sentinel().parse(&stream("A", "3")).unwrap();
        assert_eq!(framed.output, Bytes::from_static(b"A"));
        assert_eq!(framed.exit_status, Some(3));
    }

    #[test]
    fn test_parse_waits_for_status_line() {
        let full = stream("", "42");
        let partial = &full[..full.len() - 2];
        assert_eq!(sentinel().parse(partial), None);
        assert_eq!(sentinel().parse(&full).unwrap().exit_status, Some(42));
    }

    #[test]
    fn test_parse_unparsable_status_is_absent() {
        let framed = sentinel().parse(&stream("x\n", "oops")).unwrap();
        assert_eq!(framed.output, Bytes::from_static(b"x"));
        assert_eq!(framed.exit_status, None);
        assert_eq!(framed.raw_status, "oops");
    }

    #[test]
    fn test_parse_crlf_lines() {
        let buf = format!("{TOKEN}\r\nline\r\n{TOKEN} 7\r\n");
        let framed = sentinel().parse(buf.as_bytes()).unwrap();
        assert_eq!(framed.output, Bytes::from_static(b"line"));
        assert_eq!(framed.exit_status, Some(7));
    }

    #[test]
    fn test_stray_token_is_output() {
        let output = format!("prefix {TOKEN}suffix\n{TOKEN}\n");
        let framed = sentinel().parse(&stream(&output, "0")).unwrap();
        assert_eq!(framed.output, Bytes::from(output.trim().to_string()));
        assert_eq!(framed.exit_status, Some(0));
    }

    #[test]
    fn test_leader_must_fill_a_line() {
        let buf = format!("noise {TOKEN}\n{TOKEN} 0\n");
        assert_eq!(sentinel().output_start(buf.as_bytes()), None);
        assert_eq!(sentinel().parse(buf.as_bytes()), None);
    }

    #[test]
    fn test_output_after_leader() {
        let buf = format!("{TOKEN}\nbye\n");
        assert_eq!(
            sentinel().output_after_leader(buf.as_bytes()),
            Some(Bytes::from_static(b"bye"))
        );
        assert_eq!(sentinel().output_after_leader(b"nothing yet"), None);
    }

    #[test]
    fn test_short_buffers() {
        assert_eq!(sentinel().output_start(b""), None);
        assert_eq!(sentinel().parse(b"abc"), None);
    }

    proptest! {
        #[test]
        fn test_parse_recovers_output_and_status(
            noise in prop::collection::vec("[a-z $#>]{0,20}\n", 0..3),
            output in "[ -~\t\n]{0,200}",
            status in any::<i32>(),
        ) {
            prop_assume!(!output.contains(TOKEN));
            let mut buf = noise.concat().into_bytes();
            buf.extend(stream(&output, &status.to_string()));

            let framed = sentinel().parse(&buf).unwrap();
            prop_assert_eq!(&framed.output[..], output.as_bytes().trim_ascii());
            prop_assert_eq!(framed.exit_status, Some(status));
            prop_assert_eq!(framed.consumed, buf.len());
        }

        #[test]
        fn test_parse_never_completes_early(
            output in "[ -~\n]{0,80}",
            status in any::<i32>(),
        ) {
            let buf = stream(&output, &status.to_string());
            for cut in 0..buf.len() {
                prop_assert_eq!(sentinel().parse(&buf[..cut]), None);
            }
        }
    }
}
