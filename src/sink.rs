//! Video Sink (spec §4.2): wraps the kernel `/dev/videoN` gadget node —
//! format negotiation, buffer allocation/mmap, stream on/off, UVC event
//! subscribe/dequeue, and the class "send response" ioctl.

use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::ptr::NonNull;

use nix::errno::Errno;
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};

use crate::config::FourCc;
use crate::control::StreamingControl;
use crate::error::{Error, Result};
use crate::pool::{Buffer, BufferPool};
use crate::v4l2_sys::*;

/// One dequeued class-specific UVC event (spec §3 "Event Subscription").
#[derive(Debug, Clone, Copy)]
pub enum UvcEvent {
    Connect,
    Disconnect,
    StreamOn,
    StreamOff,
    Setup(UsbCtrlRequest),
    Data { length: usize, data: [u8; 60] },
}

pub struct Sink {
    file: File,
    current_format: Option<FourCc>,
}

impl Sink {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .map_err(|e| Error::device("open", e))?;
        Ok(Sink { file, current_format: None })
    }

    pub fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Subscribe to exactly the four event kinds spec §3 names (SETUP,
    /// DATA, STREAMON, STREAMOFF). CONNECT/DISCONNECT are never
    /// subscribed — the kernel driver still delivers them unsolicited on
    /// some code paths, and `decode_event` accepts and ignores those too,
    /// but this daemon never asks for them.
    pub fn subscribe_events(&self) -> Result<()> {
        for ty in [UVC_EVENT_SETUP, UVC_EVENT_STREAMON, UVC_EVENT_STREAMOFF, UVC_EVENT_DATA] {
            let mut sub = V4l2EventSubscription { type_: ty, id: 0, flags: 0, reserved: [0; 5] };
            unsafe {
                xioctl(self.fd(), VIDIOC_SUBSCRIBE_EVENT, (&mut sub as *mut V4l2EventSubscription).cast())
                    .map_err(|e| Error::device("VIDIOC_SUBSCRIBE_EVENT", e.into()))?;
            }
        }
        Ok(())
    }

    /// Retrieve the next pending UVC event. Returns `Ok(None)` on
    /// would-block (nothing pending right now).
    pub fn dequeue_event(&self) -> Result<Option<UvcEvent>> {
        let mut ev = V4l2Event::default();
        let r = unsafe { xioctl(self.fd(), VIDIOC_DQEVENT, (&mut ev as *mut V4l2Event).cast()) };
        match r {
            Ok(_) => Ok(Some(decode_event(&ev))),
            Err(Errno::EAGAIN) => Ok(None),
            Err(e) => Err(Error::device("VIDIOC_DQEVENT", e.into())),
        }
    }

    /// Issue the UVC class "send response" ioctl with a populated
    /// control-transfer reply.
    pub fn send_response(&self, data: &[u8]) -> Result<()> {
        let mut req = UvcRequestData::default();
        req.length = data.len() as i32;
        let n = data.len().min(60);
        req.data[..n].copy_from_slice(&data[..n]);
        unsafe {
            xioctl(self.fd(), UVCIOC_SEND_RESPONSE, (&mut req as *mut UvcRequestData).cast())
                .map_err(|e| Error::device("UVCIOC_SEND_RESPONSE", e.into()))?;
        }
        Ok(())
    }

    /// Set the pixel format; idempotent if unchanged. Returns the
    /// kernel-adjusted effective `(width, height)` for bookkeeping
    /// (`dwMaxVideoFrameSize` is computed by the caller, spec §4.5 step 4).
    pub fn set_format(&mut self, fourcc: FourCc, width: u32, height: u32) -> Result<(u32, u32)> {
        let mut fmt = V4l2Format {
            type_: V4L2_BUF_TYPE_VIDEO_OUTPUT,
            fmt: crate::v4l2_sys::V4l2FormatUnion {
                pix: V4l2PixFormat {
                    width,
                    height,
                    pixelformat: fourcc.as_u32(),
                    field: V4L2_FIELD_NONE,
                    bytesperline: 0,
                    sizeimage: 0,
                    colorspace: 0,
                    priv_: 0,
                    flags: 0,
                    ycbcr_enc: 0,
                    quantization: 0,
                    xfer_func: 0,
                },
            },
        };
        unsafe {
            xioctl(self.fd(), VIDIOC_S_FMT, (&mut fmt as *mut V4l2Format).cast())
                .map_err(|e| Error::device("VIDIOC_S_FMT", e.into()))?;
        }
        self.current_format = Some(fourcc);
        let (w, h) = unsafe { (fmt.fmt.pix.width, fmt.fmt.pix.height) };
        Ok((w, h))
    }

    /// Allocate `count` mmap'able buffers and map each into user space.
    pub fn request_buffers(&mut self, count: u32) -> Result<BufferPool> {
        let mut req = V4l2RequestBuffers {
            count,
            type_: V4L2_BUF_TYPE_VIDEO_OUTPUT,
            memory: V4L2_MEMORY_MMAP,
            reserved: [0; 2],
        };
        unsafe {
            xioctl(self.fd(), VIDIOC_REQBUFS, (&mut req as *mut V4l2RequestBuffers).cast())
                .map_err(|e| Error::resource("VIDIOC_REQBUFS", e.into()))?;
        }

        let mut buffers = Vec::with_capacity(req.count as usize);
        for index in 0..req.count {
            let mut buf = V4l2Buffer {
                index,
                type_: V4L2_BUF_TYPE_VIDEO_OUTPUT,
                memory: V4L2_MEMORY_MMAP,
                ..V4l2Buffer::default()
            };
            unsafe {
                xioctl(self.fd(), VIDIOC_QUERYBUF, (&mut buf as *mut V4l2Buffer).cast())
                    .map_err(|e| Error::resource("VIDIOC_QUERYBUF", e.into()))?;
            }
            let length = buf.length as usize;
            let offset = unsafe { buf.m.offset } as i64;
            let ptr = unsafe {
                mmap(
                    None,
                    std::num::NonZeroUsize::new(length).ok_or_else(|| {
                        Error::resource("mmap", std::io::Error::new(std::io::ErrorKind::InvalidData, "zero-length buffer"))
                    })?,
                    ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                    MapFlags::MAP_SHARED,
                    Some(&self.file),
                    offset,
                )
                .map_err(|e| Error::resource("mmap", e.into()))?
            };
            let memory = NonNull::new(ptr).expect("mmap returned null on success");
            buffers.push(unsafe { Buffer::new(index, memory, length) });
        }
        Ok(BufferPool::new(buffers))
    }

    /// Unmap and free a pool's buffers. No-op if the pool is empty.
    pub fn release_buffers(&mut self, pool: BufferPool) -> Result<()> {
        for buf in pool.iterate() {
            let ptr = buf.as_raw_ptr();
            if !ptr.is_null() {
                unsafe {
                    let _ = munmap(ptr, buf.capacity);
                }
            }
        }
        // VIDIOC_REQBUFS with count=0 releases the kernel-side allocation.
        let mut req = V4l2RequestBuffers {
            count: 0,
            type_: V4L2_BUF_TYPE_VIDEO_OUTPUT,
            memory: V4L2_MEMORY_MMAP,
            reserved: [0; 2],
        };
        unsafe {
            xioctl(self.fd(), VIDIOC_REQBUFS, (&mut req as *mut V4l2RequestBuffers).cast())
                .map_err(|e| Error::resource("VIDIOC_REQBUFS(0)", e.into()))?;
        }
        Ok(())
    }

    /// Hand a buffer to the kernel. Fails if already queued (the caller
    /// is expected to only call this on a `Free`/`Filled` buffer).
    pub fn queue(&self, index: u32, bytesused: u32) -> Result<()> {
        let mut buf = V4l2Buffer {
            index,
            type_: V4L2_BUF_TYPE_VIDEO_OUTPUT,
            memory: V4L2_MEMORY_MMAP,
            bytesused,
            ..V4l2Buffer::default()
        };
        unsafe {
            xioctl(self.fd(), VIDIOC_QBUF, (&mut buf as *mut V4l2Buffer).cast())
                .map_err(|e| Error::device("VIDIOC_QBUF", e.into()))?;
        }
        Ok(())
    }

    /// Retrieve a completed buffer index from the kernel, or `None` on
    /// would-block.
    pub fn dequeue(&self) -> Result<Option<u32>> {
        let mut buf = V4l2Buffer {
            type_: V4L2_BUF_TYPE_VIDEO_OUTPUT,
            memory: V4L2_MEMORY_MMAP,
            ..V4l2Buffer::default()
        };
        let r = unsafe { xioctl(self.fd(), VIDIOC_DQBUF, (&mut buf as *mut V4l2Buffer).cast()) };
        match r {
            Ok(_) => Ok(Some(buf.index)),
            Err(Errno::EAGAIN) => Ok(None),
            Err(e) => Err(Error::device("VIDIOC_DQBUF", e.into())),
        }
    }

    pub fn stream_on(&self) -> Result<()> {
        let mut ty = V4L2_BUF_TYPE_VIDEO_OUTPUT as i32;
        unsafe {
            xioctl(self.fd(), VIDIOC_STREAMON, (&mut ty as *mut i32).cast())
                .map_err(|e| Error::device("VIDIOC_STREAMON", e.into()))?;
        }
        Ok(())
    }

    pub fn stream_off(&self) -> Result<()> {
        let mut ty = V4L2_BUF_TYPE_VIDEO_OUTPUT as i32;
        unsafe {
            xioctl(self.fd(), VIDIOC_STREAMOFF, (&mut ty as *mut i32).cast())
                .map_err(|e| Error::device("VIDIOC_STREAMOFF", e.into()))?;
        }
        Ok(())
    }
}

fn decode_event(ev: &V4l2Event) -> UvcEvent {
    match ev.type_ {
        UVC_EVENT_CONNECT => UvcEvent::Connect,
        UVC_EVENT_DISCONNECT => UvcEvent::Disconnect,
        UVC_EVENT_STREAMON => UvcEvent::StreamOn,
        UVC_EVENT_STREAMOFF => UvcEvent::StreamOff,
        UVC_EVENT_SETUP => {
            let req: UsbCtrlRequest = unsafe {
                std::ptr::read(ev.u.data.as_ptr().cast())
            };
            UvcEvent::Setup(req)
        }
        UVC_EVENT_DATA => {
            let data: UvcRequestData = unsafe { std::ptr::read(ev.u.data.as_ptr().cast()) };
            let length = data.length.max(0) as usize;
            UvcEvent::Data { length, data: data.data }
        }
        _ => UvcEvent::Connect,
    }
}

pub fn decode_streaming_control(bytes: &[u8]) -> StreamingControl {
    let mut padded = [0u8; std::mem::size_of::<StreamingControl>()];
    let n = bytes.len().min(padded.len());
    padded[..n].copy_from_slice(&bytes[..n]);
    zerocopy::FromBytes::read_from(&padded[..]).expect("fixed-size buffer")
}
