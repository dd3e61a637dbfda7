use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use uuid::Uuid;

/// Headers and body for one outgoing RFC 5322 message.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub to: String,
    pub subject: String,
    pub html: String,
    pub message_id: String,
    pub in_reply_to: Option<String>,
    pub references: Option<String>,
}

/// A locally generated RFC 5322 Message-ID.
pub fn generate_message_id(domain: &str) -> String {
    format!("<{}@{}>", Uuid::new_v4().simple(), domain)
}

/// RFC 2047 encoded-word form for subjects carrying non-ASCII text;
/// plain ASCII passes through untouched.
pub fn encode_subject(subject: &str) -> String {
    if subject.is_ascii() {
        subject.to_string()
    } else {
        format!("=?UTF-8?B?{}?=", STANDARD.encode(subject.as_bytes()))
    }
}

/// Prefix a reply subject exactly once.
pub fn reply_subject(original: &str) -> String {
    if original.len() >= 3 && original[..3].eq_ignore_ascii_case("re:") {
        original.to_string()
    } else {
        format!("Re: {original}")
    }
}

/// Assemble the wire form of the message with CRLF line endings.
pub fn build_message(message: &OutgoingMessage) -> String {
    let mut out = String::new();
    out.push_str(&format!("To: {}\r\n", message.to));
    out.push_str(&format!("Subject: {}\r\n", encode_subject(&message.subject)));
    out.push_str("Content-Type: text/html; charset=utf-8\r\n");
    out.push_str("MIME-Version: 1.0\r\n");
    out.push_str(&format!("Message-ID: {}\r\n", message.message_id));
    if let Some(in_reply_to) = &message.in_reply_to {
        out.push_str(&format!("In-Reply-To: {in_reply_to}\r\n"));
    }
    if let Some(references) = &message.references {
        out.push_str(&format!("References: {references}\r\n"));
    }
    out.push_str("\r\n");
    out.push_str(&message.html);
    out
}

/// Base64url encoding of the raw message, as Gmail's `raw` field expects.
pub fn encode_raw(message: &OutgoingMessage) -> String {
    encode_raw_str(&build_message(message))
}

pub fn encode_raw_str(message: &str) -> String {
    URL_SAFE_NO_PAD.encode(message.as_bytes())
}

pub fn decode_raw(raw: &str) -> Option<String> {
    let bytes = URL_SAFE_NO_PAD
        .decode(raw)
        .or_else(|_| STANDARD.decode(raw))
        .ok()?;
    String::from_utf8(bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> OutgoingMessage {
        OutgoingMessage {
            to: "a@example.com".to_string(),
            subject: "Hello".to_string(),
            html: "<p>Hi</p>".to_string(),
            message_id: "<id-1@cadence.local>".to_string(),
            in_reply_to: None,
            references: None,
        }
    }

    #[test]
    fn message_id_shape() {
        let id = generate_message_id("cadence.local");
        assert!(id.starts_with('<'));
        assert!(id.ends_with("@cadence.local>"));
    }

    #[test]
    fn ascii_subject_is_untouched() {
        assert_eq!(encode_subject("Quick question"), "Quick question");
    }

    #[test]
    fn non_ascii_subject_is_encoded_word() {
        let encoded = encode_subject("Grüße aus Köln");
        assert!(encoded.starts_with("=?UTF-8?B?"));
        assert!(encoded.ends_with("?="));
    }

    #[test]
    fn reply_subject_prefixes_once() {
        assert_eq!(reply_subject("Hello"), "Re: Hello");
        assert_eq!(reply_subject("Re: Hello"), "Re: Hello");
        assert_eq!(reply_subject("RE: Hello"), "RE: Hello");
    }

    #[test]
    fn builds_plain_message() {
        let wire = build_message(&message());
        assert!(wire.starts_with("To: a@example.com\r\n"));
        assert!(wire.contains("Subject: Hello\r\n"));
        assert!(wire.contains("Content-Type: text/html; charset=utf-8\r\n"));
        assert!(wire.contains("MIME-Version: 1.0\r\n"));
        assert!(wire.contains("Message-ID: <id-1@cadence.local>\r\n"));
        assert!(!wire.contains("In-Reply-To"));
        assert!(wire.ends_with("\r\n\r\n<p>Hi</p>"));
    }

    #[test]
    fn builds_threading_headers() {
        let mut msg = message();
        msg.in_reply_to = Some("<prev@x>".to_string());
        msg.references = Some("<first@x> <prev@x>".to_string());
        let wire = build_message(&msg);
        assert!(wire.contains("In-Reply-To: <prev@x>\r\n"));
        assert!(wire.contains("References: <first@x> <prev@x>\r\n"));
    }

    #[test]
    fn raw_round_trips() {
        let msg = message();
        let raw = encode_raw(&msg);
        assert!(!raw.contains('='));
        assert_eq!(decode_raw(&raw).unwrap(), build_message(&msg));
    }
}
