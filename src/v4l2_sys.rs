//! Raw V4L2 / UVC ioctl structures and request codes.
//!
//! Layout follows the kernel's `videodev2.h` / `linux/usb/g_uvc.h`; the
//! retry-on-EINTR `xioctl` wrapper and `iow`/`ior`/`iowr` request-code
//! helpers follow the teacher crate's own V4L2 FFI style, with request
//! codes additionally cross-checked against the numbers used by
//! `libv4l-rs`/`v4l2-rs` for the same ioctls.

use std::ffi::c_void;
use std::os::fd::RawFd;

use nix::errno::Errno;

pub const V4L2_BUF_TYPE_VIDEO_OUTPUT: u32 = 2;
pub const V4L2_MEMORY_MMAP: u32 = 1;
pub const V4L2_FIELD_NONE: u32 = 1;

/// UVC-specific class event, values 8..0xFFFF are driver-private in the
/// kernel's `enum v4l2_event_type` space; `UVC_EVENT_FIRST` in
/// `linux/usb/g_uvc.h` is `V4L2_EVENT_PRIVATE_START`.
const V4L2_EVENT_PRIVATE_START: u32 = 0x08000000;
pub const UVC_EVENT_CONNECT: u32 = V4L2_EVENT_PRIVATE_START + 0;
pub const UVC_EVENT_DISCONNECT: u32 = V4L2_EVENT_PRIVATE_START + 1;
pub const UVC_EVENT_STREAMON: u32 = V4L2_EVENT_PRIVATE_START + 2;
pub const UVC_EVENT_STREAMOFF: u32 = V4L2_EVENT_PRIVATE_START + 3;
pub const UVC_EVENT_SETUP: u32 = V4L2_EVENT_PRIVATE_START + 4;
pub const UVC_EVENT_DATA: u32 = V4L2_EVENT_PRIVATE_START + 5;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2PixFormat {
    pub width: u32,
    pub height: u32,
    pub pixelformat: u32,
    pub field: u32,
    pub bytesperline: u32,
    pub sizeimage: u32,
    pub colorspace: u32,
    pub priv_: u32,
    pub flags: u32,
    pub ycbcr_enc: u32,
    pub quantization: u32,
    pub xfer_func: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union V4l2FormatUnion {
    pub pix: V4l2PixFormat,
    pub raw_data: [u8; 200],
}

#[repr(C)]
pub struct V4l2Format {
    pub type_: u32,
    pub fmt: V4l2FormatUnion,
}

#[repr(C)]
pub struct V4l2RequestBuffers {
    pub count: u32,
    pub type_: u32,
    pub memory: u32,
    pub reserved: [u32; 2],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct TimeVal {
    pub tv_sec: i64,
    pub tv_usec: i64,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2Timecode {
    pub type_: u32,
    pub flags: u32,
    pub frames: u8,
    pub seconds: u8,
    pub minutes: u8,
    pub hours: u8,
    pub userbits: [u8; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union V4l2BufferUnion {
    pub offset: u32,
    pub userptr: std::os::raw::c_ulong,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2Buffer {
    pub index: u32,
    pub type_: u32,
    pub bytesused: u32,
    pub flags: u32,
    pub field: u32,
    pub timestamp: TimeVal,
    pub timecode: V4l2Timecode,
    pub sequence: u32,
    pub memory: u32,
    pub m: V4l2BufferUnion,
    pub length: u32,
    pub input: u32,
    pub reserved: u32,
}

impl Default for V4l2Buffer {
    fn default() -> Self {
        unsafe { std::mem::zeroed() }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2EventSubscription {
    pub type_: u32,
    pub id: u32,
    pub flags: u32,
    pub reserved: [u32; 5],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union V4l2EventUnion {
    pub data: [u8; 64],
}

#[repr(C)]
pub struct V4l2Event {
    pub type_: u32,
    pub u: V4l2EventUnion,
    pub pending: u32,
    pub sequence: u32,
    pub timestamp: TimeVal,
    pub id: u32,
    pub reserved: [u32; 8],
}

impl Default for V4l2Event {
    fn default() -> Self {
        unsafe { std::mem::zeroed() }
    }
}

/// `struct uvc_request_data` from `linux/usb/g_uvc.h`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct UvcRequestData {
    pub length: i32,
    pub data: [u8; 60],
}

impl Default for UvcRequestData {
    fn default() -> Self {
        UvcRequestData { length: 0, data: [0; 60] }
    }
}

/// `struct usb_ctrlrequest` as embedded in `struct uvc_event`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct UsbCtrlRequest {
    pub bm_request_type: u8,
    pub b_request: u8,
    pub w_value: u16,
    pub w_index: u16,
    pub w_length: u16,
}

const fn iow(ty: u8, nr: u8, size: usize) -> std::os::raw::c_ulong {
    (0x40_u64 << 24 | (size as u64 & 0x1fff) << 16 | (ty as u64) << 8 | nr as u64) as _
}
const fn ior(ty: u8, nr: u8, size: usize) -> std::os::raw::c_ulong {
    (0x80_u64 << 24 | (size as u64 & 0x1fff) << 16 | (ty as u64) << 8 | nr as u64) as _
}
const fn iowr(ty: u8, nr: u8, size: usize) -> std::os::raw::c_ulong {
    (0xc0_u64 << 24 | (size as u64 & 0x1fff) << 16 | (ty as u64) << 8 | nr as u64) as _
}

pub const VIDIOC_S_FMT: std::os::raw::c_ulong = iowr(b'V', 5, std::mem::size_of::<V4l2Format>());
pub const VIDIOC_REQBUFS: std::os::raw::c_ulong =
    iowr(b'V', 8, std::mem::size_of::<V4l2RequestBuffers>());
pub const VIDIOC_QUERYBUF: std::os::raw::c_ulong =
    iowr(b'V', 9, std::mem::size_of::<V4l2Buffer>());
pub const VIDIOC_QBUF: std::os::raw::c_ulong = iowr(b'V', 15, std::mem::size_of::<V4l2Buffer>());
pub const VIDIOC_DQBUF: std::os::raw::c_ulong = iowr(b'V', 17, std::mem::size_of::<V4l2Buffer>());
pub const VIDIOC_STREAMON: std::os::raw::c_ulong =
    iow(b'V', 18, std::mem::size_of::<std::os::raw::c_int>());
pub const VIDIOC_STREAMOFF: std::os::raw::c_ulong =
    iow(b'V', 19, std::mem::size_of::<std::os::raw::c_int>());
pub const VIDIOC_DQEVENT: std::os::raw::c_ulong = ior(b'V', 89, std::mem::size_of::<V4l2Event>());
pub const VIDIOC_SUBSCRIBE_EVENT: std::os::raw::c_ulong =
    iow(b'V', 90, std::mem::size_of::<V4l2EventSubscription>());

pub const UVCIOC_SEND_RESPONSE: std::os::raw::c_ulong =
    iow(b'U', 1, std::mem::size_of::<UvcRequestData>());

extern "C" {
    fn ioctl(fd: RawFd, request: std::os::raw::c_ulong, ...) -> std::os::raw::c_int;
}

/// Retry-on-EINTR ioctl, mirroring the teacher crate's own `xioctl`.
///
/// # Safety
/// `arg` must point to a correctly sized/initialized object for
/// `request`, or be null when the ioctl takes no argument.
pub unsafe fn xioctl(fd: RawFd, request: std::os::raw::c_ulong, arg: *mut c_void) -> nix::Result<std::os::raw::c_int> {
    loop {
        let r = ioctl(fd, request, arg);
        if r != -1 {
            return Ok(r);
        }
        let errno = Errno::last();
        if errno != Errno::EINTR {
            return Err(errno);
        }
    }
}
