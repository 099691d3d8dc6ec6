//! Access-log line parser.
//!
//! Lines follow a fixed, space-separated W3C-style layout:
//!
//! ```text
//! date time s-ip method uri query s-port username c-ip user-agent referrer status substatus win32-status time-taken
//! 2017-01-01 00:00:00 1.2.3.4 GET /index.html - 200 - 8.8.8.8 Mozilla/5.0 http://example.com 200 100 50 10
//! ```
//!
//! The query, user-agent and referrer fields may contain spaces. The regex
//! decides where they stop. The referrer must start with `http`.

use std::sync::LazyLock;

use chrono::NaiveDateTime;
use regex::Regex;

use crate::error::MalformedLine;
use crate::models::DATETIME_FORMAT;

static LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"^(\d+-\d+-\d+) (\d+:\d+:\d+) (\d+\.\d+\.\d+\.\d+) (\S+) (\S+) (.+) ",
        r"(\d+) (\S+) (\d+\.\d+\.\d+\.\d+) (.+) (http.+) ",
        r"(\d+) (\d+) (\d+) (\d+)$",
    ))
    .expect("access-log regex")
});

/// Fields of one access-log line, borrowed from the raw text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine<'a> {
    pub datetime: NaiveDateTime,
    pub server_ip: &'a str,
    pub method: &'a str,
    pub url: &'a str,
    pub body: &'a str,
    pub server_port: &'a str,
    pub username: &'a str,
    pub client_ip: &'a str,
    pub user_agent: &'a str,
    pub referrer: &'a str,
    pub resp_status_code: i64,
    pub substatus: &'a str,
    pub win32_status: &'a str,
    pub time_taken: &'a str,
}

impl LogLine<'_> {
    /// Re-serialise the fields in grammar order.
    pub fn to_line(&self) -> String {
        format!(
            "{} {} {} {} {} {} {} {} {} {} {} {} {} {}",
            self.datetime.format(DATETIME_FORMAT),
            self.server_ip,
            self.method,
            self.url,
            self.body,
            self.server_port,
            self.username,
            self.client_ip,
            self.user_agent,
            self.referrer,
            self.resp_status_code,
            self.substatus,
            self.win32_status,
            self.time_taken
        )
    }
}

/// Parse one raw line. Trailing `\r\n` is ignored.
pub fn parse_line(raw: &str) -> Result<LogLine<'_>, MalformedLine> {
    let line = raw.trim_end_matches(['\r', '\n']);
    let malformed = || MalformedLine {
        line: line.to_string(),
    };

    let caps = LINE_RE.captures(line).ok_or_else(malformed)?;
    let field = |i: usize| caps.get(i).map(|m| m.as_str()).unwrap_or_default();

    let stamp = format!("{} {}", field(1), field(2));
    let datetime = NaiveDateTime::parse_from_str(&stamp, DATETIME_FORMAT).map_err(|_| malformed())?;
    let resp_status_code: i64 = field(12).parse().map_err(|_| malformed())?;

    Ok(LogLine {
        datetime,
        server_ip: field(3),
        method: field(4),
        url: field(5),
        body: field(6),
        server_port: field(7),
        username: field(8),
        client_ip: field(9),
        user_agent: field(10),
        referrer: field(11),
        resp_status_code,
        substatus: field(13),
        win32_status: field(14),
        time_taken: field(15),
    })
}
