//! Response parsing for the IMAP-subset transport.
//!
//! Parsing is tolerant at record granularity: a malformed FETCH record is
//! skipped by the caller (which logs it), never fatal to the whole batch.
//! Only structural failures - a greeting that is not a greeting, a tagged
//! status that never arrives - abort an exchange.

use mailparse::MailHeaderMap;

use crate::transport::RemoteHeader;

/// Tagged/untagged status of one response line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    No,
    Bad,
}

/// One parsed response line.
#[derive(Debug, Clone)]
pub struct Line {
    pub raw: String,
    pub tag: Option<String>,
    pub untagged: bool,
    pub status: Option<Status>,
}

fn status_of(rest: &str) -> Option<Status> {
    if rest.starts_with("OK ") || rest == "OK" {
        Some(Status::Ok)
    } else if rest.starts_with("NO ") || rest == "NO" {
        Some(Status::No)
    } else if rest.starts_with("BAD ") || rest == "BAD" {
        Some(Status::Bad)
    } else {
        None
    }
}

/// Parse "* OK ..." or "A0001 OK ..." shapes.
pub fn parse_line(s: &str) -> Line {
    let raw = s.to_string();
    if let Some(rest) = s.strip_prefix('*') {
        return Line {
            raw,
            tag: None,
            untagged: true,
            status: status_of(rest.trim_start()),
        };
    }
    let mut parts = s.splitn(2, ' ');
    let tag = parts.next().unwrap_or("").to_string();
    let rest = parts.next().unwrap_or("");
    Line {
        raw,
        tag: Some(tag).filter(|t| !t.is_empty()),
        untagged: false,
        status: status_of(rest),
    }
}

/// Size of a trailing literal marker `{N}`, if the line announces one.
pub fn literal_size(line: &str) -> Option<usize> {
    let open = line.rfind('{')?;
    let inner = line[open + 1..].strip_suffix('}')?;
    inner.trim().parse().ok()
}

/// Mailbox state gathered from SELECT responses.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectState {
    pub exists: u32,
    pub uidvalidity: Option<u32>,
    pub uidnext: Option<u32>,
    pub highest_modseq: Option<u64>,
}

fn bracket_value<T: std::str::FromStr>(line: &str, key: &str) -> Option<T> {
    let start = line.find(key)? + key.len();
    line[start..]
        .split_whitespace()
        .next()?
        .trim_end_matches(']')
        .parse()
        .ok()
}

/// Fold one untagged SELECT response line into the state. Returns false for
/// lines the subset does not care about.
pub fn parse_select_line(line: &str, state: &mut SelectState) -> bool {
    let rest = match line.strip_prefix("* ") {
        Some(r) => r.trim_start(),
        None => return false,
    };
    if let Some(count) = rest.strip_suffix(" EXISTS") {
        if let Ok(n) = count.trim().parse() {
            state.exists = n;
            return true;
        }
        return false;
    }
    if rest.starts_with("OK ") || rest.starts_with("FLAGS ") {
        if let Some(v) = bracket_value(rest, "[UIDVALIDITY ") {
            state.uidvalidity = Some(v);
            return true;
        }
        if let Some(v) = bracket_value(rest, "[UIDNEXT ") {
            state.uidnext = Some(v);
            return true;
        }
        if let Some(v) = bracket_value(rest, "[HIGHESTMODSEQ ") {
            state.highest_modseq = Some(v);
            return true;
        }
    }
    false
}

/// Capability list from "* CAPABILITY ..." or a "[CAPABILITY ...]" code.
pub fn parse_capabilities(line: &str) -> Vec<String> {
    let body = line.strip_prefix("* CAPABILITY ").or_else(|| {
        let start = line.find("[CAPABILITY ")? + "[CAPABILITY ".len();
        let rest = &line[start..];
        Some(rest.split(']').next().unwrap_or(rest))
    });
    body.map(|s| s.split_whitespace().map(|w| w.to_uppercase()).collect())
        .unwrap_or_default()
}

/// Fields extracted from one untagged FETCH record.
#[derive(Debug, Clone, Default)]
pub struct FetchRecord {
    pub uid: Option<u32>,
    pub flags: Option<Vec<String>>,
    pub modseq: Option<u64>,
    pub header: Option<Vec<u8>>,
}

fn scan_number<T: std::str::FromStr>(line: &str, key: &str) -> Option<T> {
    let start = line.find(key)? + key.len();
    let rest = line[start..].trim_start_matches('(');
    let end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    rest[..end].parse().ok()
}

/// Parse one "* N FETCH (...)" line. Returns None when the record does not
/// have the FETCH shape at all; missing individual items stay None.
pub fn parse_fetch_line(line: &str, literal: Option<&[u8]>) -> Option<FetchRecord> {
    line.find(" FETCH (")?;
    if !line.starts_with("* ") {
        return None;
    }
    let mut record = FetchRecord {
        uid: scan_number(line, "UID "),
        modseq: scan_number(line, "MODSEQ "),
        header: literal.map(|b| b.to_vec()),
        ..Default::default()
    };
    if let Some(open) = line.find("FLAGS (") {
        let rest = &line[open + "FLAGS (".len()..];
        if let Some(end) = rest.find(')') {
            record.flags = Some(
                rest[..end]
                    .split_whitespace()
                    .map(|s| s.to_string())
                    .collect(),
            );
        }
    }
    Some(record)
}

/// Expand a UID set like "3,5:8,12" into individual UIDs.
pub fn parse_uid_set(s: &str) -> Vec<u32> {
    let mut uids = Vec::new();
    for part in s.split(',') {
        let part = part.trim();
        if let Some((lo, hi)) = part.split_once(':') {
            if let (Ok(lo), Ok(hi)) = (lo.parse::<u32>(), hi.parse::<u32>()) {
                if lo <= hi && hi - lo < 100_000 {
                    uids.extend(lo..=hi);
                }
            }
        } else if let Ok(uid) = part.parse() {
            uids.push(uid);
        }
    }
    uids
}

/// Parse "* VANISHED (EARLIER) 3,5:8" into the expunged UID list.
pub fn parse_vanished(line: &str) -> Option<Vec<u32>> {
    let rest = line.strip_prefix("* VANISHED")?.trim_start();
    let rest = rest.strip_prefix("(EARLIER)").unwrap_or(rest).trim();
    if rest.is_empty() {
        return Some(Vec::new());
    }
    Some(parse_uid_set(rest))
}

/// Extract subject/from/date from raw header bytes. Missing fields default
/// to empty; a parseable date is normalized to RFC3339.
pub fn parse_header_fields(raw: &[u8]) -> (String, String, String) {
    let headers = match mailparse::parse_headers(raw) {
        Ok((headers, _)) => headers,
        Err(_) => return (String::new(), String::new(), String::new()),
    };
    let subject = headers.get_first_value("Subject").unwrap_or_default();
    let from = headers.get_first_value("From").unwrap_or_default();
    let date_raw = headers.get_first_value("Date").unwrap_or_default();
    // dateparse maps unrecognizable input to epoch 0; keep the raw header
    // rather than rewriting garbage to 1970.
    let date = mailparse::dateparse(&date_raw)
        .ok()
        .filter(|&epoch| epoch != 0)
        .and_then(|epoch| chrono::DateTime::from_timestamp(epoch, 0))
        .map(|d| d.to_rfc3339())
        .unwrap_or(date_raw);
    (subject, from, date)
}

/// Build a `RemoteHeader` from a full FETCH record; None when the record is
/// missing its UID (the caller skips and logs it).
pub fn remote_header_from(record: FetchRecord) -> Option<RemoteHeader> {
    let uid = record.uid?;
    let (subject, from, date) = parse_header_fields(record.header.as_deref().unwrap_or(b""));
    Some(RemoteHeader {
        uid,
        subject,
        from,
        date,
        flags: record.flags.unwrap_or_default(),
    })
}

/// Quote a string for the wire (LOGIN arguments, mailbox names).
pub fn quote_string(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tagged_line() {
        let line = parse_line("A0007 OK LOGIN completed");
        assert_eq!(line.tag.as_deref(), Some("A0007"));
        assert!(!line.untagged);
        assert_eq!(line.status, Some(Status::Ok));
    }

    #[test]
    fn test_parse_untagged_no() {
        let line = parse_line("* NO temporary failure");
        assert!(line.untagged);
        assert_eq!(line.status, Some(Status::No));
    }

    #[test]
    fn test_literal_size() {
        assert_eq!(literal_size("* 1 FETCH (BODY[] {310}"), Some(310));
        assert_eq!(literal_size("A0001 OK done"), None);
    }

    #[test]
    fn test_select_state() {
        let mut state = SelectState::default();
        assert!(parse_select_line("* 17 EXISTS", &mut state));
        assert!(parse_select_line(
            "* OK [UIDVALIDITY 852] UIDs valid",
            &mut state
        ));
        assert!(parse_select_line("* OK [UIDNEXT 4392] predicted", &mut state));
        assert!(parse_select_line(
            "* OK [HIGHESTMODSEQ 90060115194045] ok",
            &mut state
        ));
        assert_eq!(state.exists, 17);
        assert_eq!(state.uidvalidity, Some(852));
        assert_eq!(state.uidnext, Some(4392));
        assert_eq!(state.highest_modseq, Some(90060115194045));
    }

    #[test]
    fn test_capabilities_from_greeting_code() {
        let caps = parse_capabilities("* OK [CAPABILITY IMAP4rev1 STARTTLS CONDSTORE] ready");
        assert!(caps.contains(&"STARTTLS".to_string()));
        assert!(caps.contains(&"CONDSTORE".to_string()));
    }

    #[test]
    fn test_parse_fetch_line_full() {
        let record = parse_fetch_line(
            "* 3 FETCH (UID 42 MODSEQ (65402) FLAGS (\\Seen \\Answered) BODY[HEADER.FIELDS (SUBJECT FROM DATE)] {64}",
            Some(b"Subject: hello\r\nFrom: a@b.c\r\nDate: Mon, 7 Feb 1994 21:52:25 -0800\r\n\r\n"),
        )
        .unwrap();
        assert_eq!(record.uid, Some(42));
        assert_eq!(record.modseq, Some(65402));
        assert_eq!(
            record.flags,
            Some(vec!["\\Seen".to_string(), "\\Answered".to_string()])
        );
        let header = remote_header_from(record).unwrap();
        assert_eq!(header.subject, "hello");
        assert_eq!(header.from, "a@b.c");
        assert!(header.date.starts_with("1994-02-0"));
    }

    #[test]
    fn test_malformed_fetch_record_skipped() {
        // Not a FETCH line at all.
        assert!(parse_fetch_line("* 3 EXPUNGE", None).is_none());
        // FETCH shape but no UID: record parses, conversion rejects it.
        let record = parse_fetch_line("* 3 FETCH (FLAGS (\\Seen))", None).unwrap();
        assert!(remote_header_from(record).is_none());
    }

    #[test]
    fn test_parse_vanished_ranges() {
        assert_eq!(
            parse_vanished("* VANISHED (EARLIER) 3,5:8,12").unwrap(),
            vec![3, 5, 6, 7, 8, 12]
        );
        assert_eq!(parse_vanished("* VANISHED 9").unwrap(), vec![9]);
        assert!(parse_vanished("* 3 EXPUNGE").is_none());
    }

    #[test]
    fn test_quote_string_escapes() {
        assert_eq!(quote_string(r#"pa"ss\word"#), r#""pa\"ss\\word""#);
    }

    #[test]
    fn test_header_fields_tolerate_garbage_date() {
        let (subject, from, date) =
            parse_header_fields(b"Subject: x\r\nFrom: y\r\nDate: not a date\r\n\r\n");
        assert_eq!(subject, "x");
        assert_eq!(from, "y");
        assert_eq!(date, "not a date");
    }
}
