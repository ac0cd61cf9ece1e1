//! Log redaction helpers.
//!
//! Peer ids double as network addresses and cookies are handshake tokens,
//! so neither is written to the log in full.

use std::fmt;

/// Shows the first and last few characters of a peer id.
pub struct RedactedId<'a>(pub &'a str);

impl<'a> fmt::Display for RedactedId<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.0;
        if s.len() > 10 && s.is_ascii() {
            write!(f, "{}..{}", &s[..4], &s[s.len() - 4..])
        } else {
            write!(f, "[id]")
        }
    }
}

impl<'a> fmt::Debug for RedactedId<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Shows only the length of a cookie.
pub struct RedactedCookie<'a>(pub &'a str);

impl<'a> fmt::Display for RedactedCookie<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[cookie:{}]", self.0.len())
    }
}

impl<'a> fmt::Debug for RedactedCookie<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Shows a length instead of raw payload bytes.
pub struct RedactedBytes<'a>(pub &'a [u8]);

impl<'a> fmt::Display for RedactedBytes<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} bytes]", self.0.len())
    }
}

impl<'a> fmt::Debug for RedactedBytes<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacted_id() {
        let shown = format!("{}", RedactedId("abcdefghijklmnop"));
        assert_eq!(shown, "abcd..mnop");
        assert_eq!(format!("{}", RedactedId("short")), "[id]");
    }

    #[test]
    fn test_redacted_cookie() {
        assert_eq!(format!("{}", RedactedCookie("0123456789")), "[cookie:10]");
    }

    #[test]
    fn test_redacted_bytes() {
        assert_eq!(format!("{:?}", RedactedBytes(&[1, 2, 3])), "[3 bytes]");
    }
}
