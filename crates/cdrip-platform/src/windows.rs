//! Windows platform implementation
//!
//! Commands go through `IOCTL_SCSI_PASS_THROUGH_DIRECT` on a `\\.\D:` handle.
//! Drives are enumerated with `GetLogicalDrives`/`GetDriveTypeW`.

use crate::{
    DataDirection, OpticalDrive, PlatformError, PlatformOps, Result, ScsiTransport, SenseData,
};
use std::ffi::c_void;
use std::ptr;
use std::time::Duration;
use windows_sys::Win32::Foundation::{
    CloseHandle, GENERIC_READ, GENERIC_WRITE, HANDLE, INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, GetDriveTypeW, GetLogicalDrives, FILE_SHARE_READ, FILE_SHARE_WRITE,
    OPEN_EXISTING,
};
use windows_sys::Win32::Storage::IscsiDisc::{
    IOCTL_SCSI_PASS_THROUGH_DIRECT, SCSI_IOCTL_DATA_IN, SCSI_IOCTL_DATA_OUT,
    SCSI_IOCTL_DATA_UNSPECIFIED, SCSI_PASS_THROUGH_DIRECT,
};
use windows_sys::Win32::System::IO::DeviceIoControl;

/// `GetDriveTypeW` result for optical drives
const DRIVE_CDROM: u32 = 5;

const SENSE_BUFFER_LEN: usize = 32;

/// Pass-through request followed by its sense buffer
#[repr(C)]
struct SptdWithSense {
    sptd: SCSI_PASS_THROUGH_DIRECT,
    sense: [u8; SENSE_BUFFER_LEN],
}

/// Windows platform implementation
pub struct WindowsPlatform;

impl PlatformOps for WindowsPlatform {
    fn open_transport(path: &str) -> Result<Box<dyn ScsiTransport>> {
        WindowsTransport::open(path).map(|t| Box::new(t) as Box<dyn ScsiTransport>)
    }

    fn list_optical_drives() -> Result<Vec<OpticalDrive>> {
        let mut drives = Vec::new();

        // SAFETY: GetLogicalDrives takes no arguments and returns a bitmask.
        #[allow(unsafe_code)]
        let mask = unsafe { GetLogicalDrives() };

        for (bit, letter) in (b'A'..=b'Z').enumerate() {
            if mask & (1 << bit) == 0 {
                continue;
            }

            let root: Vec<u16> = format!("{}:\\", letter as char)
                .encode_utf16()
                .chain(std::iter::once(0))
                .collect();

            // SAFETY: `root` is a NUL-terminated UTF-16 string that outlives the call.
            #[allow(unsafe_code)]
            let drive_type = unsafe { GetDriveTypeW(root.as_ptr()) };

            if drive_type == DRIVE_CDROM {
                drives.push(OpticalDrive {
                    path: format!("{}:", letter as char),
                    vendor: None,
                    model: None,
                });
            }
        }

        Ok(drives)
    }
}

/// Pass-through transport over an open optical drive
pub struct WindowsTransport {
    handle: HANDLE,
    path: String,
}

// SAFETY: the handle is owned exclusively by this value and only used through &mut self.
#[allow(unsafe_code)]
unsafe impl Send for WindowsTransport {}

impl WindowsTransport {
    /// Open a drive (`D:`, `D:\` or `\\.\D:`) for pass-through
    pub fn open(path: &str) -> Result<Self> {
        let device_path = normalize_windows_path(path);

        let wide_path: Vec<u16> = device_path
            .encode_utf16()
            .chain(std::iter::once(0))
            .collect();

        // SAFETY: `wide_path` is NUL-terminated and outlives the call; the
        // remaining pointer arguments are allowed to be null.
        #[allow(unsafe_code)]
        let handle = unsafe {
            CreateFileW(
                wide_path.as_ptr(),
                GENERIC_READ | GENERIC_WRITE,
                FILE_SHARE_READ | FILE_SHARE_WRITE,
                ptr::null(),
                OPEN_EXISTING,
                0,
                0,
            )
        };

        if handle == INVALID_HANDLE_VALUE {
            let error = std::io::Error::last_os_error();
            return Err(match error.raw_os_error() {
                Some(5) => PlatformError::PermissionDenied(format!(
                    "Cannot open {}. Run as Administrator.",
                    device_path
                )),
                Some(32) => PlatformError::DeviceBusy(format!("{} is in use", device_path)),
                Some(2) | Some(3) => PlatformError::DeviceNotFound(device_path),
                Some(21) => PlatformError::NotReady(device_path),
                _ => PlatformError::Io(error),
            });
        }

        tracing::debug!("Opened {} for SCSI pass-through", device_path);

        Ok(Self {
            handle,
            path: device_path,
        })
    }
}

impl ScsiTransport for WindowsTransport {
    fn path(&self) -> &str {
        &self.path
    }

    fn execute(
        &mut self,
        cdb: &[u8],
        direction: DataDirection,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        // SAFETY: SCSI_PASS_THROUGH_DIRECT is plain data; all-zero is a valid value.
        #[allow(unsafe_code)]
        let mut request: SptdWithSense = unsafe { std::mem::zeroed() };

        let (data_in, transfer_len) = match direction {
            DataDirection::None => (SCSI_IOCTL_DATA_UNSPECIFIED, 0),
            DataDirection::FromDevice => (SCSI_IOCTL_DATA_IN, buffer.len()),
            DataDirection::ToDevice => (SCSI_IOCTL_DATA_OUT, buffer.len()),
        };

        let cdb_len = cdb.len().min(16);
        request.sptd.Length = std::mem::size_of::<SCSI_PASS_THROUGH_DIRECT>() as u16;
        request.sptd.CdbLength = cdb_len as u8;
        request.sptd.SenseInfoLength = SENSE_BUFFER_LEN as u8;
        request.sptd.DataIn = data_in as u8;
        request.sptd.DataTransferLength = transfer_len as u32;
        request.sptd.TimeOutValue = timeout.as_secs().max(1) as u32;
        request.sptd.DataBuffer = buffer.as_mut_ptr().cast::<c_void>();
        request.sptd.SenseInfoOffset = std::mem::size_of::<SCSI_PASS_THROUGH_DIRECT>() as u32;
        request.sptd.Cdb[..cdb_len].copy_from_slice(&cdb[..cdb_len]);

        let request_size = std::mem::size_of::<SptdWithSense>() as u32;
        let request_ptr = ptr::addr_of_mut!(request).cast::<c_void>();
        let mut returned = 0u32;

        // SAFETY: `request` and `buffer` outlive the synchronous call and the
        // sizes passed match the allocations they describe.
        #[allow(unsafe_code)]
        let ok = unsafe {
            DeviceIoControl(
                self.handle,
                IOCTL_SCSI_PASS_THROUGH_DIRECT,
                request_ptr,
                request_size,
                request_ptr,
                request_size,
                &mut returned,
                ptr::null_mut(),
            )
        };

        if ok == 0 {
            let error = std::io::Error::last_os_error();
            return Err(match error.raw_os_error() {
                Some(21) => PlatformError::NotReady(self.path.clone()),
                Some(1167) | Some(55) => PlatformError::DeviceNotFound(self.path.clone()),
                _ => PlatformError::Io(error),
            });
        }

        if request.sptd.ScsiStatus != 0 {
            return Err(PlatformError::CommandFailed {
                opcode: cdb.first().copied().unwrap_or(0),
                status: request.sptd.ScsiStatus,
                sense: SenseData::parse(&request.sense),
            });
        }

        Ok(request.sptd.DataTransferLength as usize)
    }
}

impl Drop for WindowsTransport {
    fn drop(&mut self) {
        // SAFETY: the handle came from CreateFileW and is closed exactly once.
        #[allow(unsafe_code)]
        unsafe {
            CloseHandle(self.handle);
        }
    }
}

/// Normalize a drive letter path to the `\\.\X:` device form
fn normalize_windows_path(path: &str) -> String {
    if path.starts_with("\\\\.\\") {
        return path.to_string();
    }
    let trimmed = path.trim_end_matches('\\');
    format!("\\\\.\\{}", trimmed)
}
