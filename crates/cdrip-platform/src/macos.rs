//! macOS platform implementation
//!
//! macOS has no generic SCSI pass-through for optical drives, so the MMC
//! commands the ripper issues are translated into the `DKIOCCD*` ioctls of
//! the CD media BSD client on the raw device node (`/dev/rdiskN`). Drives are
//! enumerated with `diskutil`.

use crate::{
    DataDirection, OpticalDrive, PlatformError, PlatformOps, Result, ScsiTransport,
    STATUS_CHECK_CONDITION,
};
use std::fs::{self, File, OpenOptions as StdOpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

// ioctl encoding from <sys/ioccom.h>
const IOC_OUT: libc::c_ulong = 0x4000_0000;
const IOC_IN: libc::c_ulong = 0x8000_0000;
const IOC_INOUT: libc::c_ulong = IOC_IN | IOC_OUT;
const IOCPARM_MASK: libc::c_ulong = 0x1fff;

const fn disk_ioctl(direction: libc::c_ulong, number: u8, len: usize) -> libc::c_ulong {
    direction
        | ((len as libc::c_ulong & IOCPARM_MASK) << 16)
        | ((b'd' as libc::c_ulong) << 8)
        | number as libc::c_ulong
}

/// `dk_cd_read_t`
#[repr(C)]
struct DkCdRead {
    offset: u64,
    sector_area: u8,
    sector_type: u8,
    reserved: [u8; 10],
    buffer_length: u32,
    buffer: *mut libc::c_void,
}

/// `dk_cd_read_toc_t`
#[repr(C)]
struct DkCdReadToc {
    format: u8,
    format_as_time: u8,
    reserved0016: [u8; 5],
    address: u8,
    reserved0064: [u8; 6],
    buffer_length: u16,
    buffer: *mut libc::c_void,
}

/// `dk_cd_read_mcn_t`
#[repr(C)]
struct DkCdReadMcn {
    mcn: [u8; 14],
    reserved: [u8; 2],
}

/// `dk_cd_read_isrc_t`
#[repr(C)]
struct DkCdReadIsrc {
    isrc: [u8; 13],
    track: u8,
    reserved: [u8; 2],
}

const DKIOCGETBLOCKCOUNT: libc::c_ulong = disk_ioctl(IOC_OUT, 25, 8);
const DKIOCCDREAD: libc::c_ulong = disk_ioctl(IOC_INOUT, 96, std::mem::size_of::<DkCdRead>());
const DKIOCCDREADISRC: libc::c_ulong =
    disk_ioctl(IOC_INOUT, 98, std::mem::size_of::<DkCdReadIsrc>());
const DKIOCCDREADMCN: libc::c_ulong = disk_ioctl(IOC_INOUT, 99, std::mem::size_of::<DkCdReadMcn>());
const DKIOCCDREADTOC: libc::c_ulong =
    disk_ioctl(IOC_INOUT, 100, std::mem::size_of::<DkCdReadToc>());
const DKIOCCDSETSPEED: libc::c_ulong = disk_ioctl(IOC_IN, 103, 2);

// kCDSectorArea* and kCDSectorType* from <IOKit/storage/IOCDTypes.h>
const SECTOR_AREA_USER: u8 = 0x10;
const SECTOR_AREA_ERROR_FLAGS: u8 = 0x02;
const SECTOR_AREA_SUBCHANNEL_Q: u8 = 0x04;
const SECTOR_TYPE_CDDA: u8 = 0x01;

const AUDIO_SIZE: usize = 2352;
const ERROR_FLAGS_SIZE: usize = 294;
const Q_SIZE: usize = 16;

/// Length of a READ SUB-CHANNEL response for MCN and ISRC
const SUBCHANNEL_RESPONSE_LEN: usize = 24;

/// A command the transport knows how to carry out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CdCommand {
    TestUnitReady,
    ReadCd {
        lba: u32,
        count: u32,
        sector_area: u8,
        sector_size: usize,
    },
    ReadToc {
        format: u8,
        msf: bool,
        address: u8,
    },
    ReadMcn,
    ReadIsrc {
        track: u8,
    },
    SetSpeed {
        read_speed: u16,
    },
}

impl CdCommand {
    /// Decode the subset of MMC the ripper uses
    fn decode(cdb: &[u8]) -> Result<Self> {
        let opcode = cdb.first().copied().unwrap_or(0);
        let unsupported =
            || PlatformError::NotSupported(format!("command 0x{opcode:02x} on macOS"));

        match (opcode, cdb.len()) {
            (0x00, 6..) => Ok(Self::TestUnitReady),
            (0xBE, 12..) => {
                let lba = u32::from_be_bytes([cdb[2], cdb[3], cdb[4], cdb[5]]);
                let count = u32::from_be_bytes([0, cdb[6], cdb[7], cdb[8]]);
                let mut sector_area = 0;
                let mut sector_size = 0;
                if cdb[9] & 0x10 != 0 {
                    sector_area |= SECTOR_AREA_USER;
                    sector_size += AUDIO_SIZE;
                }
                if cdb[9] & 0x06 == 0x02 {
                    sector_area |= SECTOR_AREA_ERROR_FLAGS;
                    sector_size += ERROR_FLAGS_SIZE;
                }
                if cdb[10] == 0x02 {
                    sector_area |= SECTOR_AREA_SUBCHANNEL_Q;
                    sector_size += Q_SIZE;
                }
                if sector_area == 0 {
                    return Err(unsupported());
                }
                Ok(Self::ReadCd {
                    lba,
                    count,
                    sector_area,
                    sector_size,
                })
            }
            (0x43, 10..) => Ok(Self::ReadToc {
                format: cdb[2] & 0x0F,
                msf: cdb[1] & 0x02 != 0,
                address: cdb[6],
            }),
            (0x42, 10..) => match cdb[3] {
                0x02 => Ok(Self::ReadMcn),
                0x03 => Ok(Self::ReadIsrc { track: cdb[6] }),
                _ => Err(unsupported()),
            },
            (0xBB, 12..) => Ok(Self::SetSpeed {
                read_speed: u16::from_be_bytes([cdb[2], cdb[3]]),
            }),
            _ => Err(unsupported()),
        }
    }
}

/// READ SUB-CHANNEL response carrying an MCN (format 2) or ISRC (format 3)
///
/// `code` is `None` when the disc has none, which clears the valid bit.
fn subchannel_response(format: u8, track: u8, code: Option<&[u8]>) -> [u8; SUBCHANNEL_RESPONSE_LEN] {
    let mut response = [0u8; SUBCHANNEL_RESPONSE_LEN];
    response[3] = (SUBCHANNEL_RESPONSE_LEN - 4) as u8;
    response[4] = format;
    response[6] = track;
    if let Some(code) = code {
        response[8] = 0x80;
        let len = code.len().min(SUBCHANNEL_RESPONSE_LEN - 9);
        response[9..9 + len].copy_from_slice(&code[..len]);
    }
    response
}

/// macOS platform implementation
pub struct MacOSPlatform;

impl PlatformOps for MacOSPlatform {
    fn open_transport(path: &str) -> Result<Box<dyn ScsiTransport>> {
        MacOSTransport::open(path).map(|t| Box::new(t) as Box<dyn ScsiTransport>)
    }

    fn list_optical_drives() -> Result<Vec<OpticalDrive>> {
        let mut drives = Vec::new();
        for entry in fs::read_dir("/dev")? {
            let name = entry?.file_name().to_string_lossy().to_string();
            if !is_whole_disk(&name) {
                continue;
            }

            let output = match Command::new("diskutil")
                .args(["info", &format!("/dev/{name}")])
                .output()
            {
                Ok(output) if output.status.success() => output,
                Ok(_) => continue,
                Err(e) => {
                    return Err(PlatformError::NotSupported(format!(
                        "Failed to run diskutil: {e}"
                    )))
                }
            };

            if let Some(model) = parse_diskutil_info(&String::from_utf8_lossy(&output.stdout)) {
                drives.push(OpticalDrive {
                    path: format!("/dev/r{name}"),
                    vendor: None,
                    model,
                });
            }
        }

        drives.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(drives)
    }
}

/// `diskN` without a slice suffix
fn is_whole_disk(name: &str) -> bool {
    name.strip_prefix("disk")
        .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
}

/// Optical drives report an "Optical Drive Type" line
///
/// Returns `Some(media name)` for optical drives and `None` otherwise.
fn parse_diskutil_info(info: &str) -> Option<Option<String>> {
    let mut optical = false;
    let mut name = None;
    for line in info.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key.trim() {
            "Optical Drive Type" => optical = true,
            "Device / Media Name" => {
                name = Some(value.trim().to_string()).filter(|v| !v.is_empty());
            }
            _ => {}
        }
    }
    optical.then_some(name)
}

/// Convert a disk path to its raw device equivalent
///
/// /dev/disk2 -> /dev/rdisk2
fn to_raw_device_path(path: &str) -> String {
    if path.starts_with("/dev/disk") {
        path.replacen("/dev/disk", "/dev/rdisk", 1)
    } else {
        path.to_string()
    }
}

/// CD media ioctl transport over a raw disk node
pub struct MacOSTransport {
    file: File,
    path: String,
}

impl MacOSTransport {
    /// Open a drive
    ///
    /// `/dev/diskN` is converted to `/dev/rdiskN`.
    pub fn open(path: &str) -> Result<Self> {
        let raw_path = to_raw_device_path(path);
        if !Path::new(&raw_path).exists() {
            return Err(PlatformError::DeviceNotFound(path.to_string()));
        }

        let file = StdOpenOptions::new()
            .read(true)
            .open(&raw_path)
            .map_err(|e| match e.raw_os_error() {
                _ if e.kind() == std::io::ErrorKind::PermissionDenied => {
                    PlatformError::PermissionDenied(format!(
                        "Cannot open {raw_path}: {e}. Try running with sudo."
                    ))
                }
                Some(libc::EBUSY) => PlatformError::DeviceBusy(format!(
                    "{raw_path} is busy. Try running: diskutil unmountDisk {path}"
                )),
                Some(libc::ENXIO) | Some(libc::ENODEV) => {
                    PlatformError::DeviceNotFound(path.to_string())
                }
                _ => PlatformError::Io(e),
            })?;

        tracing::debug!("Opened {} for CD media ioctls", raw_path);

        Ok(Self {
            file,
            path: raw_path,
        })
    }

    /// Issue one ioctl, mapping errno the way the ripper expects
    fn ioctl<T>(&self, request: libc::c_ulong, arg: &mut T, opcode: u8) -> Result<()> {
        let fd = self.file.as_raw_fd();
        // SAFETY: `arg` is a live, exclusively borrowed `repr(C)` value whose
        // size is encoded in `request`; any buffer it points at outlives the
        // call. The ioctls are synchronous.
        #[allow(unsafe_code)]
        let rc = unsafe { libc::ioctl(fd, request, arg as *mut T) };
        if rc == 0 {
            return Ok(());
        }

        let err = std::io::Error::last_os_error();
        Err(match err.raw_os_error() {
            Some(libc::ENXIO) | Some(libc::ENODEV) => PlatformError::DeviceNotFound(self.path.clone()),
            Some(libc::EBUSY) => PlatformError::DeviceBusy(self.path.clone()),
            Some(libc::EIO) => PlatformError::CommandFailed {
                opcode,
                status: STATUS_CHECK_CONDITION,
                sense: None,
            },
            _ => PlatformError::Io(err),
        })
    }
}

impl ScsiTransport for MacOSTransport {
    fn path(&self) -> &str {
        &self.path
    }

    fn execute(
        &mut self,
        cdb: &[u8],
        _direction: DataDirection,
        buffer: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize> {
        let opcode = cdb.first().copied().unwrap_or(0);

        match CdCommand::decode(cdb)? {
            CdCommand::TestUnitReady => {
                let mut blocks: u64 = 0;
                match self.ioctl(DKIOCGETBLOCKCOUNT, &mut blocks, opcode) {
                    Ok(()) if blocks > 0 => Ok(0),
                    Ok(()) => Err(PlatformError::NotReady(format!("No disc in {}", self.path))),
                    Err(PlatformError::CommandFailed { .. }) => {
                        Err(PlatformError::NotReady(format!("No disc in {}", self.path)))
                    }
                    Err(e) => Err(e),
                }
            }
            CdCommand::ReadCd {
                lba,
                count,
                sector_area,
                sector_size,
            } => {
                let wanted = (count as usize * sector_size).min(buffer.len());
                let mut request = DkCdRead {
                    // Offsets count in units of the selected per-sector size
                    offset: u64::from(lba) * sector_size as u64,
                    sector_area,
                    sector_type: SECTOR_TYPE_CDDA,
                    reserved: [0; 10],
                    buffer_length: u32::try_from(wanted).unwrap_or(u32::MAX),
                    buffer: buffer.as_mut_ptr().cast(),
                };
                self.ioctl(DKIOCCDREAD, &mut request, opcode)?;
                Ok((request.buffer_length as usize).min(wanted))
            }
            CdCommand::ReadToc {
                format,
                msf,
                address,
            } => {
                let wanted = buffer.len().min(usize::from(u16::MAX));
                let mut request = DkCdReadToc {
                    format,
                    format_as_time: u8::from(msf),
                    reserved0016: [0; 5],
                    address,
                    reserved0064: [0; 6],
                    buffer_length: wanted as u16,
                    buffer: buffer.as_mut_ptr().cast(),
                };
                self.ioctl(DKIOCCDREADTOC, &mut request, opcode)?;
                // The header carries the length of the data following it
                let reported = buffer
                    .get(..2)
                    .map_or(0, |h| usize::from(u16::from_be_bytes([h[0], h[1]])) + 2);
                Ok(reported.min(wanted))
            }
            CdCommand::ReadMcn => {
                let mut request = DkCdReadMcn {
                    mcn: [0; 14],
                    reserved: [0; 2],
                };
                let code = match self.ioctl(DKIOCCDREADMCN, &mut request, opcode) {
                    Ok(()) => Some(&request.mcn[..13]),
                    Err(PlatformError::CommandFailed { .. }) => None,
                    Err(e) => return Err(e),
                };
                let response = subchannel_response(0x02, 0, code);
                let n = response.len().min(buffer.len());
                buffer[..n].copy_from_slice(&response[..n]);
                Ok(n)
            }
            CdCommand::ReadIsrc { track } => {
                let mut request = DkCdReadIsrc {
                    isrc: [0; 13],
                    track,
                    reserved: [0; 2],
                };
                let code = match self.ioctl(DKIOCCDREADISRC, &mut request, opcode) {
                    Ok(()) => Some(&request.isrc[..12]),
                    Err(PlatformError::CommandFailed { .. }) => None,
                    Err(e) => return Err(e),
                };
                let response = subchannel_response(0x03, track, code);
                let n = response.len().min(buffer.len());
                buffer[..n].copy_from_slice(&response[..n]);
                Ok(n)
            }
            CdCommand::SetSpeed { read_speed } => {
                let mut speed = read_speed;
                self.ioctl(DKIOCCDSETSPEED, &mut speed, opcode)?;
                Ok(0)
            }
        }
    }
}

// ============================================================================
// UNIT TESTS
// ============================================================================
