//! libcdio-paranoia corrector
//!
//! Requires the libcdio system libraries (`libcdio`, `libcdio_cdda`,
//! `libcdio_paranoia`):
//! - macOS: `brew install libcdio-paranoia`
//! - Linux: `apt-get install libcdio-paranoia-dev` or `dnf install libcdio-paranoia-devel`

#![allow(unsafe_code)]

use super::{JitterCorrector, SectorVerdict};
use crate::error::{Error, Result};
use crate::sector::CDDA_SECTOR_SIZE;
use std::cell::Cell;
use std::ffi::{c_char, c_int, c_long, CString};
use tracing::{debug, info};

// libcdio_sys links libcdio itself; the cdda and paranoia layers are declared here.
use libcdio_sys as _;

#[repr(C)]
struct CdromDrive {
    _private: [u8; 0],
}

#[repr(C)]
struct CdromParanoia {
    _private: [u8; 0],
}

/// `PARANOIA_MODE_FULL`
const MODE_FULL: c_int = 0xff;
/// `PARANOIA_MODE_NEVERSKIP`
const MODE_NEVERSKIP: c_int = 0x20;
/// `CDDA_MESSAGE_FORGETIT`
const MESSAGE_FORGETIT: c_int = 0;
/// `SEEK_SET`
const SEEK_SET: c_int = 0;

// Callback events from cdda_paranoia.h
const CB_FIXUP_EDGE: c_int = 2;
const CB_FIXUP_ATOM: c_int = 3;
const CB_SCRATCH: c_int = 4;
const CB_REPAIR: c_int = 5;
const CB_SKIP: c_int = 6;
const CB_DRIFT: c_int = 7;
const CB_FIXUP_DROPPED: c_int = 10;
const CB_FIXUP_DUPED: c_int = 11;
const CB_READERR: c_int = 12;

#[link(name = "cdio_cdda")]
unsafe extern "C" {
    fn cdio_cddap_identify(
        device: *const c_char,
        messagedest: c_int,
        messages: *mut *mut c_char,
    ) -> *mut CdromDrive;
    fn cdio_cddap_open(drive: *mut CdromDrive) -> c_int;
    fn cdio_cddap_close(drive: *mut CdromDrive) -> c_int;
}

#[link(name = "cdio_paranoia")]
unsafe extern "C" {
    fn cdio_paranoia_init(drive: *mut CdromDrive) -> *mut CdromParanoia;
    fn cdio_paranoia_free(paranoia: *mut CdromParanoia);
    fn cdio_paranoia_modeset(paranoia: *mut CdromParanoia, mode: c_int);
    fn cdio_paranoia_seek(paranoia: *mut CdromParanoia, seek: i32, whence: c_int) -> i32;
    fn cdio_paranoia_read_limited(
        paranoia: *mut CdromParanoia,
        callback: Option<extern "C" fn(c_long, c_int)>,
        max_retries: c_int,
    ) -> *mut i16;
}

const CORRECTED: u8 = 1;
const FAILED: u8 = 2;

thread_local! {
    /// Events seen during the current read
    static EVENTS: Cell<u8> = const { Cell::new(0) };
}

extern "C" fn record_event(_position: c_long, event: c_int) {
    let bit = match event {
        CB_SKIP | CB_READERR => FAILED,
        CB_FIXUP_EDGE | CB_FIXUP_ATOM | CB_SCRATCH | CB_REPAIR | CB_DRIFT | CB_FIXUP_DROPPED
        | CB_FIXUP_DUPED => CORRECTED,
        _ => 0,
    };
    EVENTS.with(|events| events.set(events.get() | bit));
}

/// libcdio-paranoia in full paranoia mode
pub struct LibcdioParanoia {
    drive: *mut CdromDrive,
    paranoia: *mut CdromParanoia,
    device_path: String,
    retries_per_read: c_int,
}

// The handles are only ever used through `&mut self`
unsafe impl Send for LibcdioParanoia {}

impl LibcdioParanoia {
    /// Open `device_path` for paranoia reads
    ///
    /// `retries_per_read` bounds libcdio's own retries inside one read.
    pub fn open(device_path: &str, retries_per_read: u32) -> Result<Self> {
        let c_path = CString::new(device_path)
            .map_err(|_| Error::Paranoia(format!("invalid device path {device_path:?}")))?;

        unsafe {
            let drive = cdio_cddap_identify(c_path.as_ptr(), MESSAGE_FORGETIT, std::ptr::null_mut());
            if drive.is_null() {
                return Err(Error::Device(format!(
                    "libcdio could not identify {device_path}"
                )));
            }
            if cdio_cddap_open(drive) != 0 {
                cdio_cddap_close(drive);
                return Err(Error::Device(format!("libcdio could not open {device_path}")));
            }

            let paranoia = cdio_paranoia_init(drive);
            if paranoia.is_null() {
                cdio_cddap_close(drive);
                return Err(Error::Paranoia("paranoia initialization failed".to_string()));
            }
            cdio_paranoia_modeset(paranoia, MODE_FULL ^ MODE_NEVERSKIP);

            info!(device = device_path, "Opened libcdio-paranoia");
            Ok(Self {
                drive,
                paranoia,
                device_path: device_path.to_string(),
                retries_per_read: c_int::try_from(retries_per_read).unwrap_or(c_int::MAX),
            })
        }
    }

    /// Device this corrector reads from
    pub fn device_path(&self) -> &str {
        &self.device_path
    }
}

impl JitterCorrector for LibcdioParanoia {
    fn seek(&mut self, sector: u64) -> Result<()> {
        let lsn = i32::try_from(sector)
            .map_err(|_| Error::InvalidRange(format!("sector {sector} beyond libcdio range")))?;
        let position = unsafe { cdio_paranoia_seek(self.paranoia, lsn, SEEK_SET) };
        if position < 0 {
            return Err(Error::Paranoia(format!("seek to sector {sector} failed")));
        }
        Ok(())
    }

    fn read_sector(&mut self) -> Result<SectorVerdict> {
        EVENTS.with(|events| events.set(0));
        let samples = unsafe {
            cdio_paranoia_read_limited(self.paranoia, Some(record_event), self.retries_per_read)
        };
        if samples.is_null() {
            return Err(Error::Paranoia("paranoia read returned no data".to_string()));
        }

        let data = unsafe {
            std::slice::from_raw_parts(samples.cast::<u8>().cast_const(), CDDA_SECTOR_SIZE)
        }
        .to_vec();

        let events = EVENTS.with(Cell::get);
        debug!(events, "Paranoia read");
        Ok(if events & FAILED != 0 {
            SectorVerdict::Unverified(data)
        } else if events & CORRECTED != 0 {
            SectorVerdict::Corrected(data)
        } else {
            SectorVerdict::Verified(data)
        })
    }
}

impl Drop for LibcdioParanoia {
    fn drop(&mut self) {
        unsafe {
            cdio_paranoia_free(self.paranoia);
            cdio_cddap_close(self.drive);
        }
    }
}
