//! Table of contents: sessions, tracks and lead-outs of a disc

use crate::error::{Error, Result};
use crate::sector::SectorRange;
use serde::{Deserialize, Serialize};

/// One track entry from the TOC
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackDescriptor {
    /// Session holding the track
    pub session: u8,
    /// Track number (1-99)
    pub number: u8,
    /// First sector of the track
    pub first_sector: u64,
    /// Audio channels (2, or 4 for the rare four-channel discs)
    pub channels: u8,
    /// Audio was mastered with pre-emphasis
    pub pre_emphasis: bool,
    /// Digital copy permitted flag
    pub copy_permitted: bool,
    /// Track holds data rather than audio
    pub data_track: bool,
}

impl TrackDescriptor {
    /// Two-channel audio track
    pub fn audio(session: u8, number: u8, first_sector: u64) -> Self {
        Self {
            session,
            number,
            first_sector,
            channels: 2,
            pre_emphasis: false,
            copy_permitted: false,
            data_track: false,
        }
    }

    /// Decode the CONTROL nibble of a TOC entry
    pub fn from_control(session: u8, number: u8, first_sector: u64, control: u8) -> Self {
        Self {
            session,
            number,
            first_sector,
            channels: if control & 0x08 != 0 { 4 } else { 2 },
            pre_emphasis: control & 0x01 != 0,
            copy_permitted: control & 0x02 != 0,
            data_track: control & 0x04 != 0,
        }
    }
}

/// One session entry from the TOC
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    /// Session number (1-based)
    pub number: u8,
    /// First track in the session
    pub first_track: u8,
    /// Last track in the session
    pub last_track: u8,
    /// First sector of the session's lead-out
    pub lead_out: u64,
}

/// Table of contents read when a drive is opened
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Toc {
    sessions: Vec<SessionDescriptor>,
    tracks: Vec<TrackDescriptor>,
}

impl Toc {
    /// Build a TOC, sorting sessions and tracks by number
    ///
    /// Fails if either list is empty or a track refers to a missing session.
    pub fn new(
        mut sessions: Vec<SessionDescriptor>,
        mut tracks: Vec<TrackDescriptor>,
    ) -> Result<Self> {
        if sessions.is_empty() || tracks.is_empty() {
            return Err(Error::MalformedResponse {
                command: "READ TOC",
                message: "no sessions or tracks".to_string(),
            });
        }

        sessions.sort_by_key(|s| s.number);
        tracks.sort_by_key(|t| t.number);

        if let Some(orphan) = tracks
            .iter()
            .find(|t| !sessions.iter().any(|s| s.number == t.session))
        {
            return Err(Error::MalformedResponse {
                command: "READ TOC",
                message: format!(
                    "track {} refers to missing session {}",
                    orphan.number, orphan.session
                ),
            });
        }

        Ok(Self { sessions, tracks })
    }

    /// Single-session audio disc from track start sectors and the lead-out
    pub fn single_session(track_starts: &[u64], lead_out: u64) -> Result<Self> {
        let tracks: Vec<_> = track_starts
            .iter()
            .enumerate()
            .map(|(i, &start)| TrackDescriptor::audio(1, (i + 1) as u8, start))
            .collect();
        let session = SessionDescriptor {
            number: 1,
            first_track: 1,
            last_track: tracks.len() as u8,
            lead_out,
        };
        Self::new(vec![session], tracks)
    }

    /// All sessions
    pub fn sessions(&self) -> &[SessionDescriptor] {
        &self.sessions
    }

    /// All tracks
    pub fn tracks(&self) -> &[TrackDescriptor] {
        &self.tracks
    }

    /// Audio tracks only
    pub fn audio_tracks(&self) -> impl Iterator<Item = &TrackDescriptor> {
        self.tracks.iter().filter(|t| !t.data_track)
    }

    /// First session number
    pub fn first_session(&self) -> u8 {
        self.sessions[0].number
    }

    /// Last session number
    pub fn last_session(&self) -> u8 {
        self.sessions[self.sessions.len() - 1].number
    }

    /// Session by number
    pub fn session(&self, number: u8) -> Option<&SessionDescriptor> {
        self.sessions.iter().find(|s| s.number == number)
    }

    /// First track of a session
    pub fn first_track_for_session(&self, session: u8) -> Option<u8> {
        self.session(session).map(|s| s.first_track)
    }

    /// Last track of a session
    pub fn last_track_for_session(&self, session: u8) -> Option<u8> {
        self.session(session).map(|s| s.last_track)
    }

    /// First sector of a session's first track
    pub fn first_sector_for_session(&self, session: u8) -> Option<u64> {
        self.first_track_for_session(session)
            .and_then(|n| self.first_sector_for_track(n))
    }

    /// Last sector before a session's lead-out
    pub fn last_sector_for_session(&self, session: u8) -> Option<u64> {
        self.lead_out_for_session(session).map(|l| l.saturating_sub(1))
    }

    /// Lead-out of a session
    pub fn lead_out_for_session(&self, session: u8) -> Option<u64> {
        self.session(session).map(|s| s.lead_out)
    }

    /// Session whose program area holds `sector`
    pub fn session_containing_sector(&self, sector: u64) -> Option<u8> {
        self.sessions.iter().map(|s| s.number).find(|&n| {
            self.session_range(n)
                .is_some_and(|range| range.contains_sector(sector))
        })
    }

    /// Session whose program area holds all of `range`
    pub fn session_containing_range(&self, range: &SectorRange) -> Option<u8> {
        self.sessions.iter().map(|s| s.number).find(|&n| {
            self.session_range(n)
                .is_some_and(|session| session.contains_sector_range(range))
        })
    }

    /// Program area of a session
    pub fn session_range(&self, session: u8) -> Option<SectorRange> {
        let first = self.first_sector_for_session(session)?;
        let last = self.last_sector_for_session(session)?;
        (first <= last).then(|| SectorRange::new(first, last))
    }

    /// Track by number
    pub fn track(&self, number: u8) -> Option<&TrackDescriptor> {
        self.tracks.iter().find(|t| t.number == number)
    }

    /// First track number on the disc
    pub fn first_track(&self) -> u8 {
        self.tracks[0].number
    }

    /// Last track number on the disc
    pub fn last_track(&self) -> u8 {
        self.tracks[self.tracks.len() - 1].number
    }

    /// First sector of a track
    pub fn first_sector_for_track(&self, number: u8) -> Option<u64> {
        self.track(number).map(|t| t.first_sector)
    }

    /// Last sector of a track
    ///
    /// A track ends just before the next track of the same session, or just
    /// before the session lead-out if it is the session's last track.
    pub fn last_sector_for_track(&self, number: u8) -> Option<u64> {
        let track = self.track(number)?;
        let next_in_session = self
            .tracks
            .iter()
            .find(|t| t.number > number && t.session == track.session);

        let end = match next_in_session {
            Some(next) => next.first_sector,
            None => self.lead_out_for_session(track.session)?,
        };
        end.checked_sub(1).filter(|&last| last >= track.first_sector)
    }

    /// Sectors of a track
    pub fn track_range(&self, number: u8) -> Option<SectorRange> {
        let first = self.first_sector_for_track(number)?;
        let last = self.last_sector_for_track(number)?;
        Some(SectorRange::new(first, last))
    }

    /// First sector of the disc's first track
    pub fn first_sector(&self) -> u64 {
        self.tracks[0].first_sector
    }

    /// Last sector before the final lead-out
    pub fn last_sector(&self) -> u64 {
        self.sessions[self.sessions.len() - 1]
            .lead_out
            .saturating_sub(1)
    }

    /// Every sector from the first track to the final lead-out
    pub fn disc_range(&self) -> SectorRange {
        SectorRange::new(self.first_sector(), self.last_sector().max(self.first_sector()))
    }
}
