//! Unified table-of-contents model.
//!
//! Sessions and tracks look the same to callers whether the backend
//! reported them or the classifier reconstructed them by scanning for
//! session headers.

/// One session/track entry. `volid` is only known for emulated entries,
/// where the session header carries the volume identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TocEntry {
    /// 1-based session index.
    pub session: u32,
    /// 1-based track index.
    pub track: u32,
    pub start_lba: u32,
    pub blocks: u32,
    pub volid: Option<String>,
    /// Whether this entry came from a header scan rather than the backend.
    pub emulated: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TocTrack {
    pub entry: TocEntry,
}

impl Default for TocEntry {
    fn default() -> Self {
        Self {
            session: 1,
            track: 1,
            start_lba: 0,
            blocks: 0,
            volid: None,
            emulated: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TocSession {
    pub session: u32,
    pub tracks: Vec<TocTrack>,
}

impl TocSession {
    pub fn sectors(&self) -> u32 {
        self.tracks.iter().map(|t| t.entry.blocks).sum()
    }

    pub fn start_lba(&self) -> u32 {
        self.tracks.first().map(|t| t.entry.start_lba).unwrap_or(0)
    }
}

/// Ordered list of sessions, immutable per load.
#[derive(Debug, Clone, Default)]
pub struct Toc {
    pub sessions: Vec<TocSession>,
    /// Open sessions reported by the backend; emulation never produces any.
    pub incomplete_sessions: u32,
}

impl Toc {
    /// Builds a TOC from a flat entry list, one track per session for
    /// emulated entries, grouping by session index otherwise.
    pub fn from_entries(entries: &[TocEntry]) -> Self {
        let mut sessions: Vec<TocSession> = Vec::new();
        for entry in entries {
            match sessions.last_mut() {
                Some(last) if last.session == entry.session => {
                    last.tracks.push(TocTrack {
                        entry: entry.clone(),
                    });
                }
                _ => sessions.push(TocSession {
                    session: entry.session,
                    tracks: vec![TocTrack {
                        entry: entry.clone(),
                    }],
                }),
            }
        }
        Self {
            sessions,
            incomplete_sessions: 0,
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn track_count(&self) -> usize {
        self.sessions.iter().map(|s| s.tracks.len()).sum()
    }

    /// Start plus length of the last counted track.
    pub fn total_sectors(&self) -> u32 {
        self.sessions
            .last()
            .and_then(|s| s.tracks.last())
            .map(|t| t.entry.start_lba + t.entry.blocks)
            .unwrap_or(0)
    }

    pub fn last_session_start(&self) -> Option<u32> {
        self.sessions.last().map(|s| s.start_lba())
    }

    pub fn entries(&self) -> impl Iterator<Item = &TocEntry> {
        self.sessions
            .iter()
            .flat_map(|s| s.tracks.iter().map(|t| &t.entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(session: u32, start: u32, blocks: u32) -> TocEntry {
        TocEntry {
            session,
            track: session,
            start_lba: start,
            blocks,
            volid: None,
            emulated: true,
        }
    }

    #[test]
    fn sessions_group_by_index() {
        let toc = Toc::from_entries(&[entry(1, 32, 256), entry(2, 320, 128)]);
        assert_eq!(toc.session_count(), 2);
        assert_eq!(toc.track_count(), 2);
        assert_eq!(toc.total_sectors(), 448);
        assert_eq!(toc.last_session_start(), Some(320));
    }

    #[test]
    fn empty_toc_reports_zero_sectors() {
        let toc = Toc::default();
        assert_eq!(toc.total_sectors(), 0);
        assert_eq!(toc.last_session_start(), None);
    }
}
