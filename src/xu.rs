//! UVC extension unit controls.
//!
//! Vendor-specific camera controls are exposed by the `uvcvideo` driver
//! through `UVCIOC_CTRL_QUERY`. A query names the extension unit, the control
//! selector within it and the request (GET_CUR, SET_CUR, ...); the payload
//! length is obtained first with GET_LEN.
#![allow(unsafe_code)]

use std::io;
use std::mem;
use std::ptr;

use tracing::debug;

use crate::device::V4l2Device;
use crate::error::{CaptureError, Result};

/// UVC control request codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum XuQuery {
    /// Set the current value.
    SetCur = 0x01,
    /// Current value.
    GetCur = 0x81,
    /// Minimum value.
    GetMin = 0x82,
    /// Maximum value.
    GetMax = 0x83,
    /// Resolution (step).
    GetRes = 0x84,
    /// Payload length in bytes.
    GetLen = 0x85,
    /// Capability bitmap.
    GetInfo = 0x86,
    /// Default value.
    GetDef = 0x87,
}

impl XuQuery {
    /// Raw request code.
    pub const fn code(self) -> u8 {
        self as u8
    }
}

/// Devices that can answer extension unit queries.
pub trait ExtensionControls {
    /// Payload length of a control (GET_LEN).
    fn xu_length(&mut self, unit: u8, selector: u8) -> Result<u16>;

    /// Run `query` against a control. `data` is read for SET requests and
    /// filled for GET requests.
    fn xu_query(&mut self, unit: u8, selector: u8, query: XuQuery, data: &mut [u8]) -> Result<()>;
}

/// Query a control, sizing the payload with GET_LEN first.
pub fn query_control<C>(controls: &mut C, unit: u8, selector: u8, query: XuQuery) -> Result<Vec<u8>>
where
    C: ExtensionControls + ?Sized,
{
    let len = controls.xu_length(unit, selector)?;
    if len == 0 {
        return Err(CaptureError::Control(format!(
            "unit {unit} selector {selector} reports zero length"
        )));
    }
    let mut data = vec![0u8; usize::from(len)];
    controls.xu_query(unit, selector, query, &mut data)?;
    debug!(unit, selector, ?query, len, "Extension unit query");
    Ok(data)
}

/// Mirror of the kernel's `struct uvc_xu_control_query`.
#[repr(C)]
struct UvcXuControlQuery {
    unit: u8,
    selector: u8,
    query: u8,
    size: u16,
    data: *mut u8,
}

const IOC_READ_WRITE: u32 = 3 << 30;

#[allow(clippy::cast_possible_truncation)]
const UVCIOC_CTRL_QUERY: u32 = IOC_READ_WRITE
    | ((mem::size_of::<UvcXuControlQuery>() as u32) << 16)
    | ((b'u' as u32) << 8)
    | 0x21;

impl V4l2Device {
    fn uvc_query(&self, unit: u8, selector: u8, query: XuQuery, data: &mut [u8]) -> Result<()> {
        let size = u16::try_from(data.len())
            .map_err(|_| CaptureError::Control(format!("payload of {} bytes too large", data.len())))?;
        let mut request = UvcXuControlQuery {
            unit,
            selector,
            query: query.code(),
            size,
            data: data.as_mut_ptr(),
        };

        loop {
            // SAFETY: request points at `data`, which stays borrowed and holds
            // `size` bytes for the duration of the call.
            let ret = unsafe {
                libc::ioctl(
                    self.fd(),
                    UVCIOC_CTRL_QUERY as _,
                    ptr::addr_of_mut!(request),
                )
            };
            if ret != -1 {
                return Ok(());
            }
            match io::Error::last_os_error() {
                err if err.kind() == io::ErrorKind::Interrupted => {}
                err => {
                    return Err(CaptureError::Control(format!(
                        "UVCIOC_CTRL_QUERY ({query:?}) unit {unit} selector {selector}: {err}"
                    )))
                }
            }
        }
    }
}

impl ExtensionControls for V4l2Device {
    fn xu_length(&mut self, unit: u8, selector: u8) -> Result<u16> {
        let mut raw = [0u8; 2];
        self.uvc_query(unit, selector, XuQuery::GetLen, &mut raw)?;
        Ok(u16::from_le_bytes(raw))
    }

    fn xu_query(&mut self, unit: u8, selector: u8, query: XuQuery, data: &mut [u8]) -> Result<()> {
        self.uvc_query(unit, selector, query, data)
    }
}
