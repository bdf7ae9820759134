// Text envelope for one credential file: BEGIN/END markers around labeled fields.

pub(super) const BEGIN_MARKER: &str = "-----BEGIN FLEETWATCH CREDENTIAL-----";
pub(super) const END_MARKER: &str = "-----END FLEETWATCH CREDENTIAL-----";

const LABEL: &str = "label";
const ACCOUNT: &str = "account";
const SECRET: &str = "secret";
const PAYLOAD: &str = "payload";

/// Credential fields as stored: label in plaintext, the rest encrypted and base64-encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedRecord {
    pub label: String,
    pub account: String,
    pub secret: String,
    pub payload: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("missing BEGIN marker")]
    MissingBegin,
    #[error("missing END marker")]
    MissingEnd,
    #[error("missing field {0}")]
    MissingField(&'static str),
    #[error("malformed line {0}")]
    MalformedLine(usize),
}

pub fn encode(record: &EncryptedRecord) -> String {
    // Labels are single-line by construction.
    let label = record.label.replace(['\r', '\n'], " ");
    let mut out = String::new();
    out.push_str(BEGIN_MARKER);
    out.push('\n');
    out.push_str(&format!("{}: {}\n", LABEL, label));
    out.push_str(&format!("{}: {}\n", ACCOUNT, record.account));
    out.push_str(&format!("{}: {}\n", SECRET, record.secret));
    if let Some(payload) = &record.payload {
        out.push_str(&format!("{}: {}\n", PAYLOAD, payload));
    }
    out.push_str(END_MARKER);
    out.push('\n');
    out
}

pub fn decode(text: &str) -> Result<EncryptedRecord, EnvelopeError> {
    let mut lines = text.lines().enumerate().skip_while(|(_, l)| l.trim().is_empty());
    match lines.next() {
        Some((_, l)) if l.trim() == BEGIN_MARKER => {}
        _ => return Err(EnvelopeError::MissingBegin),
    }

    let mut label = None;
    let mut account = None;
    let mut secret = None;
    let mut payload = None;
    let mut closed = false;
    for (idx, line) in lines {
        // Only the line terminator is stripped; field values keep trailing blanks.
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.trim_end() == END_MARKER {
            closed = true;
            break;
        }
        if line.trim().is_empty() {
            continue;
        }
        let (key, value) = line
            .split_once(':')
            .ok_or(EnvelopeError::MalformedLine(idx + 1))?;
        let value = value.strip_prefix(' ').unwrap_or(value).to_string();
        match key {
            LABEL => label = Some(value),
            ACCOUNT => account = Some(value),
            SECRET => secret = Some(value),
            PAYLOAD => payload = Some(value),
            other => tracing::debug!(field = other, "unknown credential envelope field, ignored"),
        }
    }
    if !closed {
        return Err(EnvelopeError::MissingEnd);
    }

    Ok(EncryptedRecord {
        label: label.unwrap_or_default(),
        account: account.ok_or(EnvelopeError::MissingField(ACCOUNT))?,
        secret: secret.ok_or(EnvelopeError::MissingField(SECRET))?,
        payload: payload.filter(|p| !p.is_empty()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(payload: Option<&str>) -> EncryptedRecord {
        EncryptedRecord {
            label: "prod web".into(),
            account: "QUJD".into(),
            secret: "REVG".into(),
            payload: payload.map(Into::into),
        }
    }

    #[test]
    fn encode_then_decode_keeps_fields() {
        let r = record(Some("R0hJ"));
        let text = encode(&r);
        assert!(text.starts_with(BEGIN_MARKER));
        assert!(text.trim_end().ends_with(END_MARKER));
        assert_eq!(decode(&text).unwrap(), r);
    }

    #[test]
    fn payload_is_optional() {
        let text = encode(&record(None));
        assert!(!text.contains("payload:"));
        assert_eq!(decode(&text).unwrap().payload, None);
    }

    #[test]
    fn label_newlines_flattened() {
        let mut r = record(None);
        r.label = "a\nb".into();
        assert_eq!(decode(&encode(&r)).unwrap().label, "a b");
    }

    #[test]
    fn label_trailing_blanks_survive() {
        let mut r = record(None);
        r.label = "padded  ".into();
        assert_eq!(decode(&encode(&r)).unwrap().label, "padded  ");
        let crlf = encode(&r).replace('\n', "\r\n");
        assert_eq!(decode(&crlf).unwrap(), r);
    }

    #[test]
    fn rejects_truncated_files() {
        let text = encode(&record(None));
        let truncated = text.replace(END_MARKER, "");
        assert_eq!(decode(&truncated), Err(EnvelopeError::MissingEnd));
        assert_eq!(decode("account: x"), Err(EnvelopeError::MissingBegin));
        let no_secret = format!("{}\naccount: x\n{}\n", BEGIN_MARKER, END_MARKER);
        assert_eq!(decode(&no_secret), Err(EnvelopeError::MissingField("secret")));
    }
}
