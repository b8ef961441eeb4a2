//! Gadget Configuration Reader (spec §4.7, §A.4): parses the gadget's
//! descriptor filesystem into an immutable `FunctionConfig`.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Pixel format FourCC, restricted to the two this runtime understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FourCc {
    Yuyv,
    Mjpeg,
}

impl FourCc {
    pub fn as_u32(self) -> u32 {
        match self {
            FourCc::Yuyv => v4l2_fourcc(b"YUYV"),
            FourCc::Mjpeg => v4l2_fourcc(b"MJPG"),
        }
    }

    fn dir_name(self) -> &'static str {
        match self {
            FourCc::Yuyv => "uncompressed",
            FourCc::Mjpeg => "mjpeg",
        }
    }
}

pub const fn v4l2_fourcc(a: &[u8; 4]) -> u32 {
    (a[0] as u32) | ((a[1] as u32) << 8) | ((a[2] as u32) << 16) | ((a[3] as u32) << 24)
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    /// Declared order, as read from `dwFrameInterval` (100ns units).
    pub intervals: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct Format {
    pub fourcc: FourCc,
    pub frames: Vec<Frame>,
}

impl Format {
    pub fn frame(&self, index_1based: usize) -> &Frame {
        &self.frames[index_1based - 1]
    }
}

/// Immutable function configuration (spec §3), read once at startup.
#[derive(Debug, Clone)]
pub struct FunctionConfig {
    pub formats: Vec<Format>,
    pub streaming_max_packet_size: u32,
    pub control_interface: u8,
    pub streaming_interface: u8,
    pub video_node: PathBuf,
}

impl FunctionConfig {
    pub fn format(&self, index_1based: usize) -> &Format {
        &self.formats[index_1based - 1]
    }

    pub fn num_formats(&self) -> usize {
        self.formats.len()
    }
}

/// Reads `<root>/<function>` (or a fully qualified gadget path) into a
/// `FunctionConfig`. Any missing mandatory leaf or malformed value is a
/// fatal `ConfigError`. `video_node_override` bypasses the UDC-binding
/// traversal entirely (spec §A.4's `--video-node` escape hatch for test
/// rigs that never bind a real UDC).
pub fn read_function_config(
    root: &Path,
    function: &str,
    video_node_override: Option<&Path>,
) -> Result<FunctionConfig> {
    let function_dir = resolve_function_dir(root, function)?;

    let mut formats = Vec::new();
    for fourcc in [FourCc::Yuyv, FourCc::Mjpeg] {
        let group_dir = function_dir.join("streaming").join(fourcc.dir_name());
        if !group_dir.is_dir() {
            continue;
        }
        let frames = read_frames(&group_dir)?;
        if !frames.is_empty() {
            formats.push(Format { fourcc, frames });
        }
    }
    if formats.is_empty() {
        return Err(Error::config(&function_dir, "no formats with at least one frame"));
    }

    let streaming_max_packet_size =
        read_u32(&function_dir.join("streaming_maxpacket"))?;
    let control_interface = read_interface_number(&function_dir, "control")?;
    let streaming_interface = read_interface_number(&function_dir, "streaming")?;
    let video_node = match video_node_override {
        Some(path) => path.to_path_buf(),
        None => resolve_video_node(root, &function_dir)?,
    };

    Ok(FunctionConfig {
        formats,
        streaming_max_packet_size,
        control_interface,
        streaming_interface,
        video_node,
    })
}

fn resolve_function_dir(root: &Path, function: &str) -> Result<PathBuf> {
    let candidate = Path::new(function);
    let path = if candidate.is_absolute() || function.contains('/') {
        root.join(candidate)
    } else {
        // Bare function name: search configfs gadget directories for it.
        find_function_by_name(root, function)?
    };
    if !path.is_dir() {
        return Err(Error::config(&path, "function directory does not exist"));
    }
    Ok(path)
}

fn find_function_by_name(root: &Path, function: &str) -> Result<PathBuf> {
    let entries = fs::read_dir(root)
        .map_err(|e| Error::config(root, format!("cannot read gadget root: {e}")))?;
    for gadget in entries.flatten() {
        let candidate = gadget.path().join("functions").join(function);
        if candidate.is_dir() {
            return Ok(candidate);
        }
    }
    Err(Error::config(root, format!("no gadget exposes function {function:?}")))
}

/// `group_dir` is e.g. `streaming/uncompressed`; below it sits one (or,
/// rarely, more) configfs-assigned format-instance directory (conventionally
/// named `u`/`u1`/`m1`, arbitrary), and frame directories (`360p`, `720p`,
/// ...) live inside *that*, alongside a `header` directory we skip since it
/// never matches the `<digits>p` naming.
fn read_frames(group_dir: &Path) -> Result<Vec<Frame>> {
    let mut named: Vec<(u32, PathBuf)> = Vec::new();
    let instances = fs::read_dir(group_dir)
        .map_err(|e| Error::config(group_dir, format!("cannot read format dir: {e}")))?;
    for instance in instances.flatten() {
        let instance_dir = instance.path();
        if !instance_dir.is_dir() {
            continue;
        }
        let Ok(entries) = fs::read_dir(&instance_dir) else { continue };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else { continue };
            let Some(digits) = name.strip_suffix('p') else { continue };
            let Ok(height) = digits.parse::<u32>() else { continue };
            named.push((height, path));
        }
    }
    named.sort_by_key(|(height, _)| *height);

    let mut frames = Vec::with_capacity(named.len());
    for (_, path) in named {
        let width = read_u32(&path.join("wWidth"))?;
        let height = read_u32(&path.join("wHeight"))?;
        let intervals = read_interval_list(&path.join("dwFrameInterval"))?;
        if intervals.is_empty() {
            return Err(Error::config(&path, "dwFrameInterval has no entries"));
        }
        frames.push(Frame { width, height, intervals });
    }
    Ok(frames)
}

fn read_interface_number(function_dir: &Path, class: &str) -> Result<u8> {
    // The interface number isn't a plain leaf in configfs; it is assigned
    // at UDC bind time and surfaced by the kernel under the bound
    // video4linux device. Test rigs and already-bound gadgets alike
    // expose it via `<class>/interface` once bound; fall back to 0 for
    // the (single-function) common case where the wire request always
    // targets the sole interface of that class.
    let leaf = function_dir.join(class).join("interface");
    if leaf.is_file() {
        read_u32(&leaf).map(|v| v as u8)
    } else {
        Ok(0)
    }
}

/// Resolves the kernel-assigned `videoN` node bound to this function
/// (spec §A.4): `<function_dir>` is `<root>/<gadget>/functions/<name>`,
/// so its grandparent's parent is `<gadget>`; that directory's `UDC`
/// leaf names the bound UDC once the gadget is enabled, and the bound
/// node is exposed under `<root>/udc/<udc>/device/gadget/video4linux`.
fn resolve_video_node(root: &Path, function_dir: &Path) -> Result<PathBuf> {
    let gadget_dir = function_dir
        .parent()
        .and_then(Path::parent)
        .ok_or_else(|| Error::config(function_dir, "cannot locate gadget directory"))?;

    let udc_leaf = gadget_dir.join("UDC");
    let udc_name = fs::read_to_string(&udc_leaf)
        .map_err(|e| Error::config(&udc_leaf, format!("cannot read: {e}")))?;
    let udc_name = udc_name.trim();
    if udc_name.is_empty() {
        return Err(Error::config(&udc_leaf, "gadget is not bound to a UDC"));
    }

    let video4linux = root.join("udc").join(udc_name).join("device/gadget/video4linux");
    let entries = fs::read_dir(&video4linux)
        .map_err(|e| Error::config(&video4linux, format!("cannot read: {e}")))?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("video") {
            return Ok(PathBuf::from("/dev").join(name.as_ref()));
        }
    }
    Err(Error::config(&video4linux, "no videoN device bound under the UDC's video4linux dir"))
}

fn read_u32(path: &Path) -> Result<u32> {
    let text = fs::read_to_string(path)
        .map_err(|e| Error::config(path, format!("cannot read: {e}")))?;
    text.trim()
        .parse::<u32>()
        .map_err(|e| Error::config(path, format!("not a decimal integer: {e}")))
}

fn read_interval_list(path: &Path) -> Result<Vec<u32>> {
    let text = fs::read_to_string(path)
        .map_err(|e| Error::config(path, format!("cannot read: {e}")))?;
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| l.parse::<u32>().map_err(|e| Error::config(path, format!("bad interval {l:?}: {e}"))))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn reads_formats_frames_and_intervals_in_order() {
        let dir = tempfile_dir();
        let func = dir.join("g1/functions/uvc.0");
        write(&func.join("streaming/uncompressed/u/360p/wWidth"), "640");
        write(&func.join("streaming/uncompressed/u/360p/wHeight"), "360");
        write(
            &func.join("streaming/uncompressed/u/360p/dwFrameInterval"),
            "166666\n200000\n333333\n500000\n",
        );
        write(&func.join("streaming/uncompressed/u/720p/wWidth"), "1280");
        write(&func.join("streaming/uncompressed/u/720p/wHeight"), "720");
        write(
            &func.join("streaming/uncompressed/u/720p/dwFrameInterval"),
            "333333\n",
        );
        write(&func.join("streaming_maxpacket"), "3072");
        write(&dir.join("g1/UDC"), "fe980000.usb\n");
        fs::create_dir_all(dir.join("udc/fe980000.usb/device/gadget/video4linux/video3")).unwrap();

        let cfg = read_function_config(&dir, "uvc.0", None).unwrap();
        assert_eq!(cfg.formats.len(), 1);
        let fmt = &cfg.formats[0];
        assert_eq!(fmt.fourcc, FourCc::Yuyv);
        assert_eq!(fmt.frames[0].width, 640);
        assert_eq!(fmt.frames[0].height, 360);
        assert_eq!(fmt.frames[0].intervals, vec![166666, 200000, 333333, 500000]);
        assert_eq!(fmt.frames[1].width, 1280);
        assert_eq!(cfg.streaming_max_packet_size, 3072);
        assert_eq!(cfg.video_node, PathBuf::from("/dev/video3"));
    }

    #[test]
    fn missing_config_is_fatal() {
        let dir = tempfile_dir();
        assert!(read_function_config(&dir, "uvc.0", None).is_err());
    }

    #[test]
    fn video_node_override_skips_udc_traversal() {
        let dir = tempfile_dir();
        let func = dir.join("g1/functions/uvc.0");
        write(&func.join("streaming/uncompressed/u/360p/wWidth"), "640");
        write(&func.join("streaming/uncompressed/u/360p/wHeight"), "360");
        write(&func.join("streaming/uncompressed/u/360p/dwFrameInterval"), "166666\n");
        write(&func.join("streaming_maxpacket"), "3072");
        // No UDC leaf and no udc/ tree at all: this must still resolve
        // when an override is supplied.

        let cfg = read_function_config(&dir, "uvc.0", Some(Path::new("/dev/video7"))).unwrap();
        assert_eq!(cfg.video_node, PathBuf::from("/dev/video7"));
    }

    #[test]
    fn unbound_udc_is_a_config_error() {
        let dir = tempfile_dir();
        let func = dir.join("g1/functions/uvc.0");
        write(&func.join("streaming/uncompressed/u/360p/wWidth"), "640");
        write(&func.join("streaming/uncompressed/u/360p/wHeight"), "360");
        write(&func.join("streaming/uncompressed/u/360p/dwFrameInterval"), "166666\n");
        write(&func.join("streaming_maxpacket"), "3072");
        write(&dir.join("g1/UDC"), "\n");

        assert!(read_function_config(&dir, "uvc.0", None).is_err());
    }

    fn tempfile_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "uvc-gadget-daemon-test-{}-{}",
            std::process::id(),
            NEXT.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    static NEXT: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(0);
}
