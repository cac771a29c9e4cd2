//! Load-address selection.
//!
//! The textual selector syntax picks the session the loader reads:
//! `auto` (last session), `session=N`, `track=N`, `lba=N` (with growisofs
//! alignment tolerance), or `volid=pattern` (literal or regular
//! expression, matched across all sessions). Parsing is a pure step
//! returning a tagged descriptor; resolution happens against a TOC.

use regex::Regex;

use crate::toc::Toc;
use crate::{Error, Result};

/// Tolerated deviation of an `lba=` selector from a session start.
const LBA_TOLERANCE: u32 = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadAddress {
    /// The last session of the table of contents.
    Auto,
    /// 1-based session index.
    Session(u32),
    /// 1-based track index, counted across all sessions.
    Track(u32),
    /// Exact session start, give or take 16 blocks.
    Lba(u32),
    /// Volume id, literal or regular expression.
    Volid(String),
}

impl LoadAddress {
    /// Parses the selector syntax. Numbers are decimal.
    pub fn parse(text: &str) -> Result<Self> {
        if text == "auto" {
            return Ok(LoadAddress::Auto);
        }
        if let Some((mode, value)) = text.split_once('=') {
            return match mode {
                "session" => Ok(LoadAddress::Session(parse_number(value)?)),
                "track" => Ok(LoadAddress::Track(parse_number(value)?)),
                "lba" | "sbsector" => Ok(LoadAddress::Lba(parse_number(value)?)),
                "volid" => Ok(LoadAddress::Volid(value.to_string())),
                _ => Err(Error::BadValue(format!("unknown load address mode: {mode}"))),
            };
        }
        Err(Error::BadValue(format!("malformed load address: {text}")))
    }

    /// Resolves the descriptor to a session start LBA.
    pub fn resolve(&self, toc: &Toc) -> Result<u32> {
        match self {
            LoadAddress::Auto => toc
                .last_session_start()
                .ok_or_else(|| Error::NotAnIso),
            LoadAddress::Session(wanted) => toc
                .sessions
                .iter()
                .find(|s| s.session == *wanted)
                .map(|s| s.start_lba())
                .ok_or_else(|| Error::BadValue(format!("no session {wanted} on this medium"))),
            LoadAddress::Track(wanted) => {
                let mut counted = 0u32;
                for session in &toc.sessions {
                    for track in &session.tracks {
                        counted += 1;
                        if counted == *wanted {
                            return Ok(track.entry.start_lba);
                        }
                    }
                }
                Err(Error::BadValue(format!("no track {wanted} on this medium")))
            }
            LoadAddress::Lba(wanted) => {
                for entry in toc.entries() {
                    let start = entry.start_lba;
                    if start == *wanted
                        || start.abs_diff(*wanted) == LBA_TOLERANCE
                    {
                        return Ok(start);
                    }
                }
                Err(Error::BadValue(format!(
                    "no session starts at or near LBA {wanted}"
                )))
            }
            LoadAddress::Volid(pattern) => {
                // Literal match first, then regular expression.
                for entry in toc.entries() {
                    if entry.volid.as_deref() == Some(pattern.as_str()) {
                        return Ok(entry.start_lba);
                    }
                }
                let regex = Regex::new(pattern)
                    .map_err(|e| Error::BadPattern(format!("{pattern}: {e}")))?;
                for entry in toc.entries() {
                    if let Some(volid) = &entry.volid {
                        if regex.is_match(volid) {
                            return Ok(entry.start_lba);
                        }
                    }
                }
                Err(Error::BadValue(format!(
                    "no session with volume id matching {pattern}"
                )))
            }
        }
    }
}

fn parse_number(value: &str) -> Result<u32> {
    value
        .parse::<u32>()
        .map_err(|_| Error::BadValue(format!("not a number: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::toc::TocEntry;

    fn toc() -> Toc {
        Toc::from_entries(&[
            TocEntry {
                session: 1,
                track: 1,
                start_lba: 32,
                blocks: 100,
                volid: Some("ARCHIVE_2024".into()),
                emulated: true,
            },
            TocEntry {
                session: 2,
                track: 2,
                start_lba: 160,
                blocks: 80,
                volid: Some("ARCHIVE_2025".into()),
                emulated: true,
            },
        ])
    }

    #[test]
    fn parse_recognizes_all_modes() {
        assert_eq!(LoadAddress::parse("auto").unwrap(), LoadAddress::Auto);
        assert_eq!(
            LoadAddress::parse("session=2").unwrap(),
            LoadAddress::Session(2)
        );
        assert_eq!(LoadAddress::parse("track=1").unwrap(), LoadAddress::Track(1));
        assert_eq!(LoadAddress::parse("lba=160").unwrap(), LoadAddress::Lba(160));
        assert_eq!(
            LoadAddress::parse("volid=FOO*").unwrap(),
            LoadAddress::Volid("FOO*".into())
        );
        assert!(LoadAddress::parse("bogus=1").is_err());
        assert!(LoadAddress::parse("justtext").is_err());
    }

    #[test]
    fn auto_picks_the_last_session() {
        assert_eq!(LoadAddress::Auto.resolve(&toc()).unwrap(), 160);
    }

    #[test]
    fn lba_tolerates_growisofs_alignment() {
        let toc = toc();
        assert_eq!(LoadAddress::Lba(32).resolve(&toc).unwrap(), 32);
        assert_eq!(LoadAddress::Lba(48).resolve(&toc).unwrap(), 32);
        assert_eq!(LoadAddress::Lba(16).resolve(&toc).unwrap(), 32);
        assert!(LoadAddress::Lba(40).resolve(&toc).is_err());
    }

    #[test]
    fn volid_matches_literally_then_by_regex() {
        let toc = toc();
        assert_eq!(
            LoadAddress::Volid("ARCHIVE_2024".into()).resolve(&toc).unwrap(),
            32
        );
        assert_eq!(
            LoadAddress::Volid("ARCHIVE_20.*".into()).resolve(&toc).unwrap(),
            32
        );
        assert!(LoadAddress::Volid("OTHER.*".into()).resolve(&toc).is_err());
    }
}
