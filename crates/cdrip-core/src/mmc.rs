//! MMC command codec
//!
//! Builders for the command descriptor blocks the ripper sends and parsers
//! for the responses it gets back. Nothing here touches hardware; the
//! [`CdDrive`](crate::drive::CdDrive) pairs these with a transport.

use crate::error::{Error, Result};
use crate::sector::{
    bcd_to_binary, msf_to_lba, CDDA_SECTOR_SIZE, ERROR_FLAGS_SIZE, Q_SUBCHANNEL_SIZE,
    SECTORS_PER_SECOND,
};
use crate::toc::{SessionDescriptor, Toc, TrackDescriptor};

/// Operation codes used by the ripper
pub mod opcode {
    /// TEST UNIT READY
    pub const TEST_UNIT_READY: u8 = 0x00;
    /// READ SUB-CHANNEL
    pub const READ_SUB_CHANNEL: u8 = 0x42;
    /// READ TOC/PMA/ATIP
    pub const READ_TOC: u8 = 0x43;
    /// MODE SENSE (10)
    pub const MODE_SENSE_10: u8 = 0x5A;
    /// SET CD SPEED
    pub const SET_CD_SPEED: u8 = 0xBB;
    /// READ CD
    pub const READ_CD: u8 = 0xBE;
}

/// Speed value meaning "as fast as the drive can go"
pub const MAXIMUM_SPEED: u16 = 0xFFFF;

/// MM capabilities and mechanical status mode page
const CAPABILITIES_PAGE: u8 = 0x2A;

/// Size of one full-TOC descriptor
const FULL_TOC_DESCRIPTOR_SIZE: usize = 11;

/// Payloads requested per sector by a READ CD command
///
/// Per-sector data comes back in the order audio, error flags, Q sub-channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadFormat {
    /// 2352 bytes of CDDA
    pub audio: bool,
    /// 294 bytes of C2 error pointers
    pub error_flags: bool,
    /// 16 bytes of formatted Q sub-channel
    pub q_subchannel: bool,
}

impl ReadFormat {
    /// Audio only
    pub const AUDIO: Self = Self::new(true, false, false);
    /// Q sub-channel only
    pub const Q_SUBCHANNEL: Self = Self::new(false, false, true);
    /// C2 error pointers only
    pub const ERROR_FLAGS: Self = Self::new(false, true, false);
    /// Audio followed by Q sub-channel
    pub const AUDIO_AND_Q: Self = Self::new(true, false, true);
    /// Audio followed by C2 error pointers
    pub const AUDIO_AND_ERROR_FLAGS: Self = Self::new(true, true, false);
    /// Audio, C2 error pointers, Q sub-channel
    pub const ALL: Self = Self::new(true, true, true);

    const fn new(audio: bool, error_flags: bool, q_subchannel: bool) -> Self {
        Self {
            audio,
            error_flags,
            q_subchannel,
        }
    }

    /// Bytes transferred per sector
    pub fn bytes_per_sector(&self) -> usize {
        let mut size = 0;
        if self.audio {
            size += CDDA_SECTOR_SIZE;
        }
        if self.error_flags {
            size += ERROR_FLAGS_SIZE;
        }
        if self.q_subchannel {
            size += Q_SUBCHANNEL_SIZE;
        }
        size
    }

    /// Offset of the error flags within one sector's payload
    pub fn error_flags_offset(&self) -> usize {
        if self.audio {
            CDDA_SECTOR_SIZE
        } else {
            0
        }
    }

    /// Offset of the Q sub-channel within one sector's payload
    pub fn q_subchannel_offset(&self) -> usize {
        self.error_flags_offset() + if self.error_flags { ERROR_FLAGS_SIZE } else { 0 }
    }
}

// ============================================================================
// Command builders
// ============================================================================

/// TEST UNIT READY
pub fn test_unit_ready() -> [u8; 6] {
    [opcode::TEST_UNIT_READY, 0, 0, 0, 0, 0]
}

/// READ CD for `count` CDDA sectors starting at `lba`
pub fn read_cd(lba: u32, count: u32, format: ReadFormat) -> [u8; 12] {
    let mut cdb = [0u8; 12];
    cdb[0] = opcode::READ_CD;
    // Expected sector type: CD-DA
    cdb[1] = 0x04;
    cdb[2..6].copy_from_slice(&lba.to_be_bytes());
    cdb[6..9].copy_from_slice(&count.to_be_bytes()[1..]);
    if format.audio {
        cdb[9] |= 0x10;
    }
    if format.error_flags {
        // C2 error block data, 294 bytes
        cdb[9] |= 0x02;
    }
    if format.q_subchannel {
        // Formatted Q sub-channel, 16 bytes
        cdb[10] = 0x02;
    }
    cdb
}

/// READ TOC format 2 (full TOC) from the first session onward
pub fn read_full_toc(allocation_length: u16) -> [u8; 10] {
    let mut cdb = [0u8; 10];
    cdb[0] = opcode::READ_TOC;
    cdb[2] = 0x02;
    cdb[6] = 1;
    cdb[7..9].copy_from_slice(&allocation_length.to_be_bytes());
    cdb
}

/// READ SUB-CHANNEL returning the media catalog number
pub fn read_mcn(allocation_length: u16) -> [u8; 10] {
    read_subchannel(0x02, 0, allocation_length)
}

/// READ SUB-CHANNEL returning the ISRC of `track`
pub fn read_isrc(track: u8, allocation_length: u16) -> [u8; 10] {
    read_subchannel(0x03, track, allocation_length)
}

fn read_subchannel(format: u8, track: u8, allocation_length: u16) -> [u8; 10] {
    let mut cdb = [0u8; 10];
    cdb[0] = opcode::READ_SUB_CHANNEL;
    // SubQ
    cdb[2] = 0x40;
    cdb[3] = format;
    cdb[6] = track;
    cdb[7..9].copy_from_slice(&allocation_length.to_be_bytes());
    cdb
}

/// MODE SENSE(10) for the capabilities page, block descriptors disabled
pub fn mode_sense_capabilities(allocation_length: u16) -> [u8; 10] {
    let mut cdb = [0u8; 10];
    cdb[0] = opcode::MODE_SENSE_10;
    cdb[1] = 0x08;
    cdb[2] = CAPABILITIES_PAGE;
    cdb[7..9].copy_from_slice(&allocation_length.to_be_bytes());
    cdb
}

/// SET CD SPEED with a read speed in KB/s, write speed left at maximum
pub fn set_cd_speed(read_speed: u16) -> [u8; 12] {
    let mut cdb = [0u8; 12];
    cdb[0] = opcode::SET_CD_SPEED;
    cdb[2..4].copy_from_slice(&read_speed.to_be_bytes());
    cdb[4..6].copy_from_slice(&MAXIMUM_SPEED.to_be_bytes());
    cdb
}

// ============================================================================
// Response parsers
// ============================================================================

fn malformed(command: &'static str, message: impl Into<String>) -> Error {
    Error::MalformedResponse {
        command,
        message: message.into(),
    }
}

/// Parse a full-TOC response into a [`Toc`]
///
/// Only mode-1 Q entries are used: track starts (points 1-99) and the
/// first track, last track and lead-out pointers (A0, A1, A2) of each
/// session. All addresses are binary MSF.
pub fn parse_full_toc(data: &[u8]) -> Result<Toc> {
    if data.len() < 4 {
        return Err(malformed("READ TOC", "truncated header"));
    }
    let data_length = usize::from(u16::from_be_bytes([data[0], data[1]]));
    let end = (data_length + 2).clamp(4, data.len());

    let mut sessions: Vec<SessionDescriptor> = Vec::new();
    let mut tracks = Vec::new();

    for descriptor in data[4..end].chunks_exact(FULL_TOC_DESCRIPTOR_SIZE) {
        let session_number = descriptor[0];
        let adr = descriptor[1] >> 4;
        let control = descriptor[1] & 0x0F;
        let point = descriptor[3];
        let (pmin, psec, pframe) = (descriptor[8], descriptor[9], descriptor[10]);

        if adr != 1 {
            continue;
        }

        let session = match sessions.iter().position(|s| s.number == session_number) {
            Some(i) => &mut sessions[i],
            None => {
                sessions.push(SessionDescriptor {
                    number: session_number,
                    first_track: 0,
                    last_track: 0,
                    lead_out: 0,
                });
                let last = sessions.len() - 1;
                &mut sessions[last]
            }
        };

        match point {
            1..=99 => {
                let lba = address(pmin, psec, pframe)?;
                tracks.push(TrackDescriptor::from_control(
                    session_number,
                    point,
                    lba,
                    control,
                ));
            }
            0xA0 => session.first_track = pmin,
            0xA1 => session.last_track = pmin,
            0xA2 => session.lead_out = address(pmin, psec, pframe)?,
            _ => {}
        }
    }

    if let Some(session) = sessions
        .iter()
        .find(|s| s.first_track == 0 || s.last_track < s.first_track || s.lead_out == 0)
    {
        return Err(malformed(
            "READ TOC",
            format!("session {} lacks first/last track or lead-out", session.number),
        ));
    }

    Toc::new(sessions, tracks)
}

fn address(minutes: u8, seconds: u8, frames: u8) -> Result<u64> {
    u64::try_from(msf_to_lba(minutes, seconds, frames)).map_err(|_| {
        malformed(
            "READ TOC",
            format!("address {minutes}:{seconds}:{frames} precedes the program area"),
        )
    })
}

/// Decoded formatted Q sub-channel block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QSubchannel {
    /// CONTROL nibble
    pub control: u8,
    /// ADR nibble (1 = position, 2 = MCN, 3 = ISRC)
    pub adr: u8,
    /// Track number
    pub track: u8,
    /// Index within the track
    pub index: u8,
    /// Position relative to the track start, in frames
    pub relative_frames: u64,
    /// Absolute disc position, in frames
    pub absolute_frames: u64,
}

impl QSubchannel {
    /// Parse the 16-byte block returned by READ CD with formatted Q
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Q_SUBCHANNEL_SIZE {
            return Err(malformed(
                "READ CD",
                format!("Q sub-channel block is {} bytes", data.len()),
            ));
        }
        let frames = |m: u8, s: u8, f: u8| {
            (u64::from(bcd_to_binary(m)) * 60 + u64::from(bcd_to_binary(s))) * SECTORS_PER_SECOND
                + u64::from(bcd_to_binary(f))
        };
        Ok(Self {
            control: data[0] >> 4,
            adr: data[0] & 0x0F,
            track: bcd_to_binary(data[1]),
            index: bcd_to_binary(data[2]),
            relative_frames: frames(data[3], data[4], data[5]),
            absolute_frames: frames(data[7], data[8], data[9]),
        })
    }

    /// Absolute position as a logical block address, if it lies past the lead-in
    pub fn absolute_lba(&self) -> Option<u64> {
        self.absolute_frames.checked_sub(crate::sector::LEAD_IN_SECTORS)
    }
}

/// Extract the media catalog number from a READ SUB-CHANNEL format 2 response
pub fn parse_mcn(data: &[u8]) -> Option<String> {
    if data.get(8)? & 0x80 == 0 {
        return None;
    }
    ascii_field(data.get(9..22)?)
}

/// Extract the ISRC from a READ SUB-CHANNEL format 3 response
pub fn parse_isrc(data: &[u8]) -> Option<String> {
    if data.get(8)? & 0x80 == 0 {
        return None;
    }
    ascii_field(data.get(9..21)?)
}

fn ascii_field(bytes: &[u8]) -> Option<String> {
    let text: String = bytes
        .iter()
        .take_while(|&&b| b != 0)
        .map(|&b| b as char)
        .collect();
    let usable = !text.is_empty()
        && text.chars().all(|c| c.is_ascii_alphanumeric())
        && text.chars().any(|c| c != '0');
    usable.then_some(text)
}

/// Fields of interest from the capabilities mode page
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriveCapabilities {
    /// Read buffer size in bytes
    pub buffer_size: Option<usize>,
    /// Maximum read speed in KB/s
    pub max_read_speed: Option<u16>,
}

/// Parse a MODE SENSE(10) response holding the capabilities page
pub fn parse_capabilities(data: &[u8]) -> Result<DriveCapabilities> {
    if data.len() < 8 {
        return Err(malformed("MODE SENSE", "truncated header"));
    }
    let block_descriptors = usize::from(u16::from_be_bytes([data[6], data[7]]));
    let page = data
        .get(8 + block_descriptors..)
        .filter(|p| p.len() >= 2)
        .ok_or_else(|| malformed("MODE SENSE", "missing mode page"))?;

    if page[0] & 0x3F != CAPABILITIES_PAGE {
        return Err(malformed(
            "MODE SENSE",
            format!("expected page 0x2a, got 0x{:02x}", page[0] & 0x3F),
        ));
    }

    let field = |offset: usize| {
        page.get(offset..offset + 2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
            .filter(|&v| v != 0)
    };

    Ok(DriveCapabilities {
        buffer_size: field(12).map(|kb| usize::from(kb) * 1024),
        max_read_speed: field(8),
    })
}
