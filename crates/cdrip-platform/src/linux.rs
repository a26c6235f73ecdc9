//! Linux platform implementation
//!
//! Commands go through the `SG_IO` ioctl on the `/dev/sr*` block device.
//! Drives are enumerated from `/sys/block`.

use crate::{
    DataDirection, OpticalDrive, PlatformError, PlatformOps, Result, ScsiTransport, SenseData,
    STATUS_CHECK_CONDITION,
};
use std::fs::{self, File, OpenOptions as StdOpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::time::Duration;

/// `SG_IO` ioctl request number
const SG_IO: libc::c_ulong = 0x2285;

const SG_DXFER_NONE: libc::c_int = -1;
const SG_DXFER_TO_DEV: libc::c_int = -2;
const SG_DXFER_FROM_DEV: libc::c_int = -3;

/// Mask for the "command did not complete cleanly" bit in `info`
const SG_INFO_OK_MASK: libc::c_uint = 0x1;

const SENSE_BUFFER_LEN: usize = 64;

/// `struct sg_io_hdr` from `<scsi/sg.h>`
#[repr(C)]
struct SgIoHdr {
    interface_id: libc::c_int,
    dxfer_direction: libc::c_int,
    cmd_len: libc::c_uchar,
    mx_sb_len: libc::c_uchar,
    iovec_count: libc::c_ushort,
    dxfer_len: libc::c_uint,
    dxferp: *mut libc::c_void,
    cmdp: *const libc::c_uchar,
    sbp: *mut libc::c_uchar,
    timeout: libc::c_uint,
    flags: libc::c_uint,
    pack_id: libc::c_int,
    usr_ptr: *mut libc::c_void,
    status: libc::c_uchar,
    masked_status: libc::c_uchar,
    msg_status: libc::c_uchar,
    sb_len_wr: libc::c_uchar,
    host_status: libc::c_ushort,
    driver_status: libc::c_ushort,
    resid: libc::c_int,
    duration: libc::c_uint,
    info: libc::c_uint,
}

/// Linux platform implementation
pub struct LinuxPlatform;

impl PlatformOps for LinuxPlatform {
    fn open_transport(path: &str) -> Result<Box<dyn ScsiTransport>> {
        LinuxTransport::open(path).map(|t| Box::new(t) as Box<dyn ScsiTransport>)
    }

    fn list_optical_drives() -> Result<Vec<OpticalDrive>> {
        list_optical_drives_in(Path::new("/sys/block"), Path::new("/dev"))
    }
}

/// `SG_IO` transport over an open optical drive
pub struct LinuxTransport {
    file: File,
    path: String,
}

impl LinuxTransport {
    /// Open a drive for pass-through
    ///
    /// The device is opened non-blocking so that a drive without a disc can
    /// still be opened and asked why it is not ready.
    pub fn open(path: &str) -> Result<Self> {
        let device_path = Path::new(path);

        if !device_path.exists() {
            return Err(PlatformError::DeviceNotFound(path.to_string()));
        }

        let file = StdOpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(device_path)
            .map_err(|e| match e.raw_os_error() {
                _ if e.kind() == std::io::ErrorKind::PermissionDenied => {
                    PlatformError::PermissionDenied(format!(
                        "Cannot open {}: {}. Add your user to the 'cdrom' group.",
                        path, e
                    ))
                }
                Some(libc::EBUSY) => PlatformError::DeviceBusy(format!("{} is busy", path)),
                Some(libc::ENOMEDIUM) => PlatformError::NotReady(format!("No disc in {}", path)),
                Some(libc::ENXIO) | Some(libc::ENODEV) => {
                    PlatformError::DeviceNotFound(path.to_string())
                }
                _ => PlatformError::Io(e),
            })?;

        tracing::debug!("Opened {} for SG_IO", path);

        Ok(Self {
            file,
            path: path.to_string(),
        })
    }
}

impl ScsiTransport for LinuxTransport {
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
        let mut sense = [0u8; SENSE_BUFFER_LEN];

        let (dxfer_direction, dxfer_len) = match direction {
            DataDirection::None => (SG_DXFER_NONE, 0),
            DataDirection::FromDevice => (SG_DXFER_FROM_DEV, buffer.len()),
            DataDirection::ToDevice => (SG_DXFER_TO_DEV, buffer.len()),
        };

        let mut hdr = SgIoHdr {
            interface_id: libc::c_int::from(b'S'),
            dxfer_direction,
            cmd_len: cdb.len() as libc::c_uchar,
            mx_sb_len: SENSE_BUFFER_LEN as libc::c_uchar,
            iovec_count: 0,
            dxfer_len: dxfer_len as libc::c_uint,
            dxferp: buffer.as_mut_ptr().cast(),
            cmdp: cdb.as_ptr(),
            sbp: sense.as_mut_ptr(),
            timeout: timeout.as_millis().min(u128::from(u32::MAX)) as libc::c_uint,
            flags: 0,
            pack_id: 0,
            usr_ptr: std::ptr::null_mut(),
            status: 0,
            masked_status: 0,
            msg_status: 0,
            sb_len_wr: 0,
            host_status: 0,
            driver_status: 0,
            resid: 0,
            duration: 0,
            info: 0,
        };

        let fd = self.file.as_raw_fd();
        // SAFETY: `hdr` points at `cdb`, `buffer` and `sense`, all of which
        // outlive the call, and `dxfer_len`/`mx_sb_len` match their lengths.
        // SG_IO is synchronous, so the kernel is done with the pointers when
        // ioctl returns.
        #[allow(unsafe_code)]
        let rc = unsafe { libc::ioctl(fd, SG_IO as _, &mut hdr as *mut SgIoHdr) };

        if rc < 0 {
            let err = std::io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::ENOMEDIUM) => PlatformError::NotReady(format!("No disc in {}", self.path)),
                Some(libc::ENODEV) | Some(libc::ENXIO) => {
                    PlatformError::DeviceNotFound(self.path.clone())
                }
                _ => PlatformError::Io(err),
            });
        }

        if hdr.info & SG_INFO_OK_MASK != 0 {
            let sense_len = usize::from(hdr.sb_len_wr).min(SENSE_BUFFER_LEN);
            let sense_data = SenseData::parse(&sense[..sense_len]);

            if hdr.status == 0 && sense_data.is_none() {
                return Err(PlatformError::Transport(format!(
                    "{}: host status 0x{:x}, driver status 0x{:x}",
                    self.path, hdr.host_status, hdr.driver_status
                )));
            }

            return Err(PlatformError::CommandFailed {
                opcode: cdb.first().copied().unwrap_or(0),
                status: if hdr.status == 0 {
                    STATUS_CHECK_CONDITION
                } else {
                    hdr.status
                },
                sense: sense_data,
            });
        }

        let resid = usize::try_from(hdr.resid).unwrap_or(0);
        Ok(dxfer_len.saturating_sub(resid))
    }
}

/// Enumerate optical drives below a sysfs block directory
///
/// Every `sr*` entry is reported with the matching node under `dev_dir`.
/// Vendor and model strings come from `device/vendor` and `device/model`.
pub fn list_optical_drives_in(sys_block: &Path, dev_dir: &Path) -> Result<Vec<OpticalDrive>> {
    let mut drives = Vec::new();

    if !sys_block.exists() {
        tracing::debug!("{:?} not found, no drives to enumerate", sys_block);
        return Ok(drives);
    }

    for entry in fs::read_dir(sys_block)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();

        if !is_optical_device(&name) {
            continue;
        }

        let sys_path = entry.path();
        drives.push(OpticalDrive {
            path: dev_dir.join(&name).to_string_lossy().to_string(),
            vendor: read_sys_string(&sys_path.join("device/vendor")),
            model: read_sys_string(&sys_path.join("device/model")),
        });
    }

    drives.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(drives)
}

/// SCSI CD-ROM nodes are `sr<N>`
fn is_optical_device(name: &str) -> bool {
    name.strip_prefix("sr")
        .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
}

fn read_sys_string(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
