//! Deterministic bus channel names.
//!
//! A channel name is a `|`-joined list of sanitized parts. Sanitizing keeps
//! `[0-9A-Za-z_]` as is and escapes every other character as `u+` and four
//! lowercase hex digits, or `U+` and eight digits outside the BMP. Because
//! `|` itself is escaped, differently structured inputs never collapse into
//! the same name. Parts that render empty add neither text nor separator.

/// Role suffix of a request channel.
pub const REQUEST_SUFFIX: &str = "REQ";
/// Role suffix of a response channel.
pub const RESPONSE_SUFFIX: &str = "RES";
/// Role suffix of a claim-request channel.
pub const CLAIM_SUFFIX: &str = "CLAIM";
/// Role suffix of a claim-response channel.
pub const CLAIM_RESPONSE_SUFFIX: &str = "RCLAIM";
/// Role suffix of both stream channel variants.
pub const STREAM_SUFFIX: &str = "STR";

const SEPARATOR: char = '|';
const LOWER_HEX: &[u8; 16] = b"0123456789abcdef";

/// One segment of a channel name.
#[derive(Debug, Clone, Copy)]
pub enum ChannelPart<'a> {
    /// A single part.
    Str(&'a str),
    /// A nested list of parts, flattened in order (used for topics).
    List(&'a [String]),
}

impl<'a> From<&'a str> for ChannelPart<'a> {
    fn from(s: &'a str) -> Self {
        ChannelPart::Str(s)
    }
}

impl<'a> From<&'a [String]> for ChannelPart<'a> {
    fn from(parts: &'a [String]) -> Self {
        ChannelPart::List(parts)
    }
}

fn is_channel_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn push_hex(buf: &mut String, value: u32, digits: u32) {
    for i in (0..digits).rev() {
        let nibble = (value >> (i * 4)) & 0xf;
        buf.push(LOWER_HEX[nibble as usize] as char);
    }
}

/// Append the sanitized form of `part` to `buf`.
pub fn append_sanitized(buf: &mut String, part: &str) {
    for c in part.chars() {
        let cp = c as u32;
        if is_channel_char(c) {
            buf.push(c);
        } else if cp < 0x10000 {
            buf.push_str("u+");
            push_hex(buf, cp, 4);
        } else {
            buf.push_str("U+");
            push_hex(buf, cp, 8);
        }
    }
}

/// Sanitize a single part.
pub fn sanitize(part: &str) -> String {
    let mut buf = String::with_capacity(part.len());
    append_sanitized(&mut buf, part);
    buf
}

fn append_parts(buf: &mut String, parts: &[ChannelPart<'_>]) {
    for part in parts {
        match part {
            ChannelPart::Str(s) => append_one(buf, s),
            ChannelPart::List(list) => {
                for s in list.iter() {
                    append_one(buf, s);
                }
            }
        }
    }
}

fn append_one(buf: &mut String, part: &str) {
    if part.is_empty() {
        return;
    }
    if !buf.is_empty() {
        buf.push(SEPARATOR);
    }
    append_sanitized(buf, part);
}

fn parts_len(parts: &[ChannelPart<'_>]) -> usize {
    parts
        .iter()
        .map(|p| match p {
            ChannelPart::Str(s) => s.len() + 1,
            ChannelPart::List(list) => list.iter().map(|s| s.len() + 1).sum(),
        })
        .sum()
}

/// Join parts into a flat channel name.
pub fn format_channel(parts: &[ChannelPart<'_>]) -> String {
    let mut buf = String::with_capacity(4 * parts_len(parts) / 3);
    append_parts(&mut buf, parts);
    buf
}

/// `{service}|{method}|{topic...}|REQ`
pub fn rpc_channel(service: &str, method: &str, topic: &[String]) -> String {
    format_channel(&[
        service.into(),
        method.into(),
        topic.into(),
        REQUEST_SUFFIX.into(),
    ])
}

/// Key a server uses for its handler registry: `{method}|{topic...}`.
pub fn handler_key(method: &str, topic: &[String]) -> String {
    format_channel(&[method.into(), topic.into()])
}

/// `{service}|{client_id}|RES`
pub fn response_channel(service: &str, client_id: &str) -> String {
    format_channel(&[service.into(), client_id.into(), RESPONSE_SUFFIX.into()])
}

/// `{service}|{client_id}|CLAIM`
pub fn claim_request_channel(service: &str, client_id: &str) -> String {
    format_channel(&[service.into(), client_id.into(), CLAIM_SUFFIX.into()])
}

/// `{service}|{method}|{topic...}|RCLAIM`
pub fn claim_response_channel(service: &str, method: &str, topic: &[String]) -> String {
    format_channel(&[
        service.into(),
        method.into(),
        topic.into(),
        CLAIM_RESPONSE_SUFFIX.into(),
    ])
}

/// Client-side stream fan-in: `{service}|{node_id}|STR`
pub fn stream_channel(service: &str, node_id: &str) -> String {
    format_channel(&[service.into(), node_id.into(), STREAM_SUFFIX.into()])
}

/// Server-side stream subscription: `{service}|{method}|{topic...}|STR`
pub fn stream_server_channel(service: &str, method: &str, topic: &[String]) -> String {
    format_channel(&[
        service.into(),
        method.into(),
        topic.into(),
        STREAM_SUFFIX.into(),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn topic(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_plain_parts_pass_through() {
        assert_eq!(
            rpc_channel("Rooms", "Join", &topic(&["eu_west", "42"])),
            "Rooms|Join|eu_west|42|REQ"
        );
    }

    #[test]
    fn test_empty_topic_adds_no_separator() {
        assert_eq!(rpc_channel("Svc", "Send", &[]), "Svc|Send|REQ");
        assert_eq!(rpc_channel("Svc", "Send", &topic(&[""])), "Svc|Send|REQ");
        assert_eq!(handler_key("Send", &[]), "Send");
    }

    #[test]
    fn test_escaping() {
        assert_eq!(sanitize("a.b"), "au+002eb");
        assert_eq!(sanitize("é"), "u+00e9");
        assert_eq!(sanitize("🦀"), "U+0001f980");
        assert_eq!(sanitize("a|b"), "au+007cb");
    }

    #[test]
    fn test_separator_in_part_does_not_collide() {
        let a = format_channel(&["a".into(), "b|c".into()]);
        let b = format_channel(&["a|b".into(), "c".into()]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_role_channels() {
        assert_eq!(response_channel("Svc", "CLI_x"), "Svc|CLI_x|RES");
        assert_eq!(claim_request_channel("Svc", "CLI_x"), "Svc|CLI_x|CLAIM");
        assert_eq!(
            claim_response_channel("Svc", "Send", &topic(&["t"])),
            "Svc|Send|t|RCLAIM"
        );
        assert_eq!(stream_channel("Svc", "CLI_x"), "Svc|CLI_x|STR");
        assert_eq!(
            stream_server_channel("Svc", "Chat", &topic(&["t"])),
            "Svc|Chat|t|STR"
        );
    }

    proptest! {
        #[test]
        fn prop_distinct_non_empty_tuples_differ(
            a in proptest::collection::vec(".{1,6}", 1..4),
            b in proptest::collection::vec(".{1,6}", 1..4),
        ) {
            prop_assume!(a != b);
            let pa: Vec<ChannelPart<'_>> = a.iter().map(|s| s.as_str().into()).collect();
            let pb: Vec<ChannelPart<'_>> = b.iter().map(|s| s.as_str().into()).collect();
            prop_assert_ne!(format_channel(&pa), format_channel(&pb));
        }

        #[test]
        fn prop_sanitized_output_is_channel_safe(s in ".*") {
            let out = sanitize(&s);
            prop_assert!(out.chars().all(|c| is_channel_char(c) || c == '+'));
        }
    }
}
