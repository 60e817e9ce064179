//! Directory listing parsers
//!
//! `MLSD`/`MLST` facts (RFC 3659) are preferred. Servers without them send
//! `LIST` output, which comes in Unix `ls -l` or Windows/IIS flavours.
//! All timestamps are normalized to UTC.

use std::sync::LazyLock;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use regex::Regex;

/// One parsed listing line, before it is bound to a directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

static UNIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^([\-dlbcps])[rwxsStT\-]{9}[+@.]?\s+\d+\s+\S+\s+\S+\s+(\d+)\s+(\w{3}\s+\d{1,2}\s+(?:\d{1,2}:\d{2}|\d{4}))\s+(.+)$",
    )
    .expect("static regex")
});

static WINDOWS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{2}-\d{2}-\d{2,4})\s+(\d{1,2}:\d{2}\s*[AaPp][Mm])\s+(<DIR>|\d+)\s+(.+)$")
        .expect("static regex")
});

const MONTHS: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

fn is_dot_entry(name: &str) -> bool {
    name == "." || name == ".."
}

/// Parse an `MLSD` body
pub fn parse_mlsd(text: &str) -> Vec<ListingEntry> {
    text.lines().filter_map(parse_mlsd_line).collect()
}

/// Parse one `MLSD` line: `type=file;size=12;modify=20240101120000; name`.
///
/// The `cdir`/`pdir` entries and `.`/`..` are dropped.
pub fn parse_mlsd_line(line: &str) -> Option<ListingEntry> {
    let (kind, entry) = parse_facts(line)?;
    match kind.as_deref() {
        Some("cdir") | Some("pdir") => None,
        _ if is_dot_entry(&entry.name) => None,
        _ => Some(entry),
    }
}

/// Parse the fact line of an `MLST` reply, whose name is the full path
pub fn parse_mlst_line(line: &str) -> Option<ListingEntry> {
    parse_facts(line).map(|(_, entry)| entry)
}

fn parse_facts(line: &str) -> Option<(Option<String>, ListingEntry)> {
    let line = line.trim_end_matches(['\r', '\n']).trim_start();
    let (facts, name) = line.split_once(' ')?;
    if name.is_empty() {
        return None;
    }

    let mut kind = None;
    let mut size = 0;
    let mut modified = None;
    for fact in facts.split(';').filter(|f| !f.is_empty()) {
        let Some((key, value)) = fact.split_once('=') else {
            continue;
        };
        match key.to_ascii_lowercase().as_str() {
            "type" => kind = Some(value.to_ascii_lowercase()),
            "size" | "sizd" => size = value.parse().unwrap_or(0),
            "modify" => modified = parse_mlsd_time(value),
            _ => {}
        }
    }

    let is_dir = matches!(kind.as_deref(), Some("dir" | "cdir" | "pdir"));
    let entry = ListingEntry {
        name: name.to_string(),
        is_dir,
        size: if is_dir { 0 } else { size },
        modified,
    };
    Some((kind, entry))
}

/// `YYYYMMDDHHMMSS[.sss]`, always UTC
pub fn parse_mlsd_time(value: &str) -> Option<DateTime<Utc>> {
    let stamp = value.get(..14)?;
    NaiveDateTime::parse_from_str(stamp, "%Y%m%d%H%M%S")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Parse `LIST` output in whichever format each line matches.
///
/// `now` anchors Unix dates that omit the year.
pub fn parse_list(text: &str, now: DateTime<Utc>) -> Vec<ListingEntry> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim_end_matches('\r');
            parse_unix_line(line, now).or_else(|| parse_windows_line(line))
        })
        .filter(|e| !is_dot_entry(&e.name))
        .collect()
}

fn parse_unix_line(line: &str, now: DateTime<Utc>) -> Option<ListingEntry> {
    let caps = UNIX_RE.captures(line)?;
    let kind = &caps[1];
    let mut name = caps[4].to_string();
    if kind == "l" {
        if let Some((link, _target)) = name.split_once(" -> ") {
            name = link.to_string();
        }
    }
    let is_dir = kind == "d";
    Some(ListingEntry {
        name,
        is_dir,
        size: if is_dir { 0 } else { caps[2].parse().unwrap_or(0) },
        modified: parse_unix_date(&caps[3], now),
    })
}

/// `Jan  5 12:30` (within the last year) or `Jan  5  2023`
fn parse_unix_date(text: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let mut parts = text.split_whitespace();
    let month_name = parts.next()?.to_ascii_lowercase();
    let month = MONTHS.iter().position(|m| *m == month_name)? as u32 + 1;
    let day: u32 = parts.next()?.parse().ok()?;
    let last = parts.next()?;

    if let Some((h, m)) = last.split_once(':') {
        let time = NaiveTime::from_hms_opt(h.parse().ok()?, m.parse().ok()?, 0)?;
        let mut year = now.year();
        let mut date = NaiveDate::from_ymd_opt(year, month, day);
        // ls shows a time only for recent files; a date ahead of now is last year's
        if date.is_some_and(|d| d.and_time(time).and_utc() > now + Duration::days(1)) {
            year -= 1;
            date = NaiveDate::from_ymd_opt(year, month, day);
        }
        Some(date?.and_time(time).and_utc())
    } else {
        let year: i32 = last.parse().ok()?;
        Some(NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(0, 0, 0)?.and_utc())
    }
}

fn parse_windows_line(line: &str) -> Option<ListingEntry> {
    let caps = WINDOWS_RE.captures(line)?;
    let is_dir = &caps[3] == "<DIR>";
    let stamp = format!("{} {}", &caps[1], caps[2].replace(' ', "").to_uppercase());
    let date_fmt = if caps[1].len() == 10 { "%m-%d-%Y" } else { "%m-%d-%y" };
    let modified = NaiveDateTime::parse_from_str(&stamp, &format!("{} %I:%M%p", date_fmt))
        .ok()
        .map(|naive| naive.and_utc());

    Some(ListingEntry {
        name: caps[4].to_string(),
        is_dir,
        size: if is_dir { 0 } else { caps[3].parse().unwrap_or(0) },
        modified,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_mlsd() {
        let body = "type=cdir;modify=20250101000000; .\r\n\
                    type=pdir;modify=20250101000000; ..\r\n\
                    type=file;size=1024;modify=20250102030405; report.pdf\r\n\
                    type=dir;modify=20250101000000; photos\r\n\
                    type=file;size=5;modify=20250102030405.123; with space.txt\r\n";
        let entries = parse_mlsd(body);
        assert_eq!(entries.len(), 3);

        assert_eq!(entries[0].name, "report.pdf");
        assert_eq!(entries[0].size, 1024);
        assert_eq!(
            entries[0].modified,
            Some(Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap())
        );
        assert!(entries[1].is_dir);
        assert_eq!(entries[2].name, "with space.txt");
        assert!(entries[2].modified.is_some());
    }

    #[test]
    fn test_unix_list() {
        let body = "total 12\r\n\
                    drwxr-xr-x    2 ftp      ftp          4096 Jan 15 09:30 docs\r\n\
                    -rw-r--r--    1 ftp      ftp         12345 Nov  3  2023 archive.tar\r\n\
                    lrwxrwxrwx    1 ftp      ftp             7 Feb  1 10:00 latest -> archive.tar\r\n\
                    drwxr-xr-x    2 ftp      ftp          4096 Mar  1 08:00 .\r\n";
        let entries = parse_list(body, now());
        assert_eq!(entries.len(), 3);

        assert_eq!(entries[0].name, "docs");
        assert!(entries[0].is_dir);
        assert_eq!(
            entries[0].modified,
            Some(Utc.with_ymd_and_hms(2025, 1, 15, 9, 30, 0).unwrap())
        );

        assert_eq!(entries[1].size, 12345);
        assert_eq!(
            entries[1].modified,
            Some(Utc.with_ymd_and_hms(2023, 11, 3, 0, 0, 0).unwrap())
        );

        assert_eq!(entries[2].name, "latest");
        assert!(!entries[2].is_dir);
    }

    #[test]
    fn test_unix_date_without_year_rolls_back() {
        // December with no year, seen in March: last year
        let dt = parse_unix_date("Dec 24 18:00", now()).unwrap();
        assert_eq!(dt, Utc.with_ymd_and_hms(2024, 12, 24, 18, 0, 0).unwrap());
    }

    #[test]
    fn test_windows_list() {
        let body = "03-05-25  10:15AM       <DIR>          Backups\r\n\
                    12-31-24  11:59PM                 2048 notes.txt\r\n";
        let entries = parse_list(body, now());
        assert_eq!(entries.len(), 2);

        assert!(entries[0].is_dir);
        assert_eq!(entries[0].name, "Backups");
        assert_eq!(
            entries[0].modified,
            Some(Utc.with_ymd_and_hms(2025, 3, 5, 10, 15, 0).unwrap())
        );
        assert_eq!(entries[1].size, 2048);
        assert_eq!(
            entries[1].modified,
            Some(Utc.with_ymd_and_hms(2024, 12, 31, 23, 59, 0).unwrap())
        );
    }

    #[test]
    fn test_unrecognized_lines_skipped() {
        assert!(parse_list("garbage line\r\n\r\n", now()).is_empty());
        assert!(parse_mlsd_line("nofacts").is_none());
    }

    #[test]
    fn test_mlst_keeps_directory_markers() {
        let entry = parse_mlst_line(" type=cdir;modify=20250101000000; /srv/www").unwrap();
        assert!(entry.is_dir);
        assert_eq!(entry.name, "/srv/www");
        assert!(parse_mlsd_line("type=cdir;modify=20250101000000; /srv/www").is_none());
    }
}
