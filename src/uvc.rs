//! UVC Control State Machine (spec §4.5): interprets class-specific
//! setup packets and the probe/commit negotiation they drive.

use std::cell::RefCell;
use std::rc::Rc;

use crate::config::FunctionConfig;
use crate::control::*;
use crate::orchestrator::Orchestrator;
use crate::sink::{Sink, UvcEvent};
use crate::v4l2_sys::UsbCtrlRequest;

const BM_REQUEST_TYPE_CLASS: u8 = 0x20;
const BM_REQUEST_TYPE_TYPE_MASK: u8 = 0x60;
const BM_REQUEST_TYPE_RECIPIENT_MASK: u8 = 0x1f;
const RECIPIENT_INTERFACE: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingControl {
    None,
    Probe,
    Commit,
}

pub struct UvcControlStateMachine {
    config: FunctionConfig,
    sink: Rc<RefCell<Sink>>,
    orchestrator: Rc<RefCell<Orchestrator>>,
    probe: StreamingControl,
    commit: StreamingControl,
    pending: PendingControl,
}

impl UvcControlStateMachine {
    pub fn new(
        config: FunctionConfig,
        sink: Rc<RefCell<Sink>>,
        orchestrator: Rc<RefCell<Orchestrator>>,
    ) -> Self {
        let mut sm = UvcControlStateMachine {
            config,
            sink,
            orchestrator,
            probe: StreamingControl::default(),
            commit: StreamingControl::default(),
            pending: PendingControl::None,
        };
        // Initialize probe & commit to (format=1, frame=1, interval=0) per spec §4.8 step 5.
        sm.probe = sm.fill(1, 1, 0);
        sm.commit = sm.probe;
        sm
    }

    /// Entry point invoked by the reactor when the sink signals
    /// exceptional readiness. Drains every pending UVC event in one call
    /// (spec §5: "the SM must drain all pending UVC events per callback
    /// invocation").
    pub fn on_reactor_ready(&mut self) {
        loop {
            let event = match self.sink.borrow().dequeue_event() {
                Ok(Some(ev)) => ev,
                Ok(None) => return,
                Err(e) => {
                    log::warn!("failed to dequeue UVC event: {e}");
                    return;
                }
            };
            self.dispatch(event);
        }
    }

    fn dispatch(&mut self, event: UvcEvent) {
        // pending_control is reset at the top of every SETUP event, per
        // spec's invariant; DATA/other events never clear it themselves.
        let mut response: Option<Vec<u8>> = None;

        match event {
            UvcEvent::Connect | UvcEvent::Disconnect => {}
            UvcEvent::Setup(req) => {
                self.pending = PendingControl::None;
                response = self.handle_setup(req);
            }
            UvcEvent::Data { length, data } => {
                self.handle_data(&data[..length]);
            }
            UvcEvent::StreamOn => {
                Orchestrator::enable(&self.orchestrator, true);
            }
            UvcEvent::StreamOff => {
                Orchestrator::enable(&self.orchestrator, false);
            }
        }

        if let Some(bytes) = response {
            if let Err(e) = self.sink.borrow().send_response(&bytes) {
                log::warn!("failed to send UVC control response: {e}");
            }
        }
    }

    fn handle_setup(&mut self, req: UsbCtrlRequest) -> Option<Vec<u8>> {
        // Only class-typed requests addressed to an interface are
        // processed; standard and vendor requests are ignored.
        if req.bm_request_type & BM_REQUEST_TYPE_TYPE_MASK != BM_REQUEST_TYPE_CLASS {
            return None;
        }
        if req.bm_request_type & BM_REQUEST_TYPE_RECIPIENT_MASK != RECIPIENT_INTERFACE {
            return None;
        }
        let interface = (req.w_index & 0xff) as u8;
        log::debug!(
            "SETUP bRequest={:#04x} wValue={:#06x} wIndex={:#06x} wLength={}",
            req.b_request, req.w_value, req.w_index, req.w_length
        );

        if interface == self.config.control_interface {
            Some(self.control_interface_response(req.w_length))
        } else if interface == self.config.streaming_interface {
            self.streaming_response(req)
        } else {
            log::warn!("SETUP addressed unknown interface {interface}");
            None
        }
    }

    /// Stub processing-unit/terminal responder: acknowledges both GET
    /// and SET (spec §1 "no processing-unit control semantics beyond a
    /// stub").
    fn control_interface_response(&self, w_length: u16) -> Vec<u8> {
        let mut buf = vec![0u8; w_length as usize];
        if !buf.is_empty() {
            buf[0] = 0x03;
        }
        buf
    }

    fn streaming_response(&mut self, req: UsbCtrlRequest) -> Option<Vec<u8>> {
        let selector = (req.w_value >> 8) as u8;
        if selector != PROBE_CONTROL && selector != COMMIT_CONTROL {
            return None;
        }

        match req.b_request {
            SET_CUR => {
                self.pending = if selector == PROBE_CONTROL {
                    PendingControl::Probe
                } else {
                    PendingControl::Commit
                };
                Some(vec![0u8; 34])
            }
            GET_CUR => {
                let block = if selector == PROBE_CONTROL { self.probe } else { self.commit };
                Some(zerocopy::AsBytes::as_bytes(&block).to_vec())
            }
            GET_MIN | GET_DEF => Some(zerocopy::AsBytes::as_bytes(&self.fill(1, 1, 0)).to_vec()),
            GET_MAX => Some(zerocopy::AsBytes::as_bytes(&self.fill(-1, -1, u32::MAX)).to_vec()),
            GET_RES => Some(vec![0u8; 34]),
            GET_LEN => Some(vec![0x22, 0x00]),
            GET_INFO => Some(vec![0x03]),
            _ => None,
        }
    }

    fn handle_data(&mut self, payload: &[u8]) {
        let pending = self.pending;
        self.pending = PendingControl::None;
        if pending == PendingControl::None {
            log::warn!("{}", crate::error::Error::protocol("DATA event with no pending control"));
            return;
        }

        let incoming = crate::sink::decode_streaming_control(payload);
        let block = self.fill(
            incoming.b_format_index as i32,
            incoming.b_frame_index as i32,
            incoming.dw_frame_interval,
        );
        log::debug!("{:?} block after fill: {:?}", pending, block);

        match pending {
            PendingControl::Probe => self.probe = block,
            PendingControl::Commit => {
                self.commit = block;
                self.commit_to_stream(block);
            }
            PendingControl::None => unreachable!(),
        }
    }

    fn commit_to_stream(&mut self, block: StreamingControl) {
        let fps = 10_000_000u32 / block.dw_frame_interval.max(1);
        let format = self.config.format(block.b_format_index as usize);
        let frame = format.frame(block.b_frame_index as usize);
        let mut orch = self.orchestrator.borrow_mut();
        orch.apply_format(frame.width, frame.height, format.fourcc);
        orch.set_fps(fps);
    }

    /// The fill algorithm (spec §4.5): clamp `(iformat, iframe)` with an
    /// *unsigned* coercion (so a negative input wraps to the max index),
    /// select the smallest interval `>= ival`, and compute the
    /// frame-size/payload fields.
    ///
    /// Negative/oversized inputs are only ever fed here from the
    /// GET_MAX path (`i32::MAX`-as-u32-style sentinels); DATA-derived
    /// values are always small non-negative `u8`s already, so they can
    /// never alias the wrap-to-max behavior by accident.
    fn fill(&self, iformat: i32, iframe: i32, ival: u32) -> StreamingControl {
        let num_formats = self.config.num_formats() as u32;
        let format_index = clamp_unsigned(iformat, num_formats);
        let format = self.config.format(format_index as usize);
        let num_frames = format.frames.len() as u32;
        let frame_index = clamp_unsigned(iframe, num_frames);
        let frame = format.frame(frame_index as usize);

        let interval = select_interval(&frame.intervals, ival);
        let max_video_frame_size = frame.width * frame.height * 2;

        StreamingControl {
            bm_hint: 1,
            b_format_index: format_index as u8,
            b_frame_index: frame_index as u8,
            dw_frame_interval: interval,
            w_key_frame_rate: 0,
            w_p_frame_rate: 0,
            w_comp_quality: 0,
            w_comp_window_size: 0,
            w_delay: 0,
            dw_max_video_frame_size: max_video_frame_size,
            dw_max_payload_transfer_size: self.config.streaming_max_packet_size,
            dw_clock_frequency: 0,
            bm_framing_info: 3,
            b_prefered_version: 1,
            b_min_version: 1,
            b_max_version: 1,
        }
    }
}

/// Clamp `value` (interpreted as unsigned after the cast) into `[1, max]`.
/// A negative `value` therefore wraps to `max`, matching §4.5 step 1/2
/// and the documented GET_MAX policy (open question in spec §9).
fn clamp_unsigned(value: i32, max: u32) -> u32 {
    let unsigned = value as u32;
    if unsigned == 0 {
        1
    } else if unsigned > max {
        max
    } else {
        unsigned
    }
}

/// First interval `>= ival` in declared order, or the largest if none
/// qualifies (spec §4.5 step 3, §8 property 5).
fn select_interval(intervals: &[u32], ival: u32) -> u32 {
    intervals
        .iter()
        .copied()
        .find(|&i| i >= ival)
        .unwrap_or_else(|| *intervals.iter().max().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Format, Frame, FunctionConfig};
    use crate::reactor::Reactor;
    use crate::sink::Sink;
    use std::path::PathBuf;

    /// Single-format fixture matching spec §8 scenarios S1/S2: YUYV,
    /// frames `[(640,360),(1280,720)]`, both with intervals
    /// `[166666,200000,333333,500000]`.
    fn s1_s2_config() -> FunctionConfig {
        let intervals = vec![166666, 200000, 333333, 500000];
        FunctionConfig {
            formats: vec![Format {
                fourcc: crate::config::FourCc::Yuyv,
                frames: vec![
                    Frame { width: 640, height: 360, intervals: intervals.clone() },
                    Frame { width: 1280, height: 720, intervals },
                ],
            }],
            streaming_max_packet_size: 3072,
            control_interface: 0,
            streaming_interface: 1,
            video_node: PathBuf::from("/dev/video0"),
        }
    }

    /// Builds a real `UvcControlStateMachine` against a plain temp file
    /// standing in for the kernel device node — sufficient for anything
    /// that never issues an ioctl against `sink` (`fill`, and the
    /// refusal path of `Orchestrator::enable_streaming`).
    fn make_sm(config: FunctionConfig) -> UvcControlStateMachine {
        let path = std::env::temp_dir().join(format!(
            "uvc-gadget-daemon-uvc-test-{}-{}",
            std::process::id(),
            NEXT.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
        ));
        std::fs::write(&path, b"").unwrap();
        let sink = Rc::new(RefCell::new(Sink::open(&path).unwrap()));
        let source: Box<dyn crate::source::VideoSource> = Box::new(crate::source::StaticSource::new());
        let reactor = Rc::new(Reactor::new().unwrap());
        let orchestrator = Rc::new(RefCell::new(Orchestrator::new(sink.clone(), source, reactor)));
        UvcControlStateMachine::new(config, sink, orchestrator)
    }

    static NEXT: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(0);

    /// S1 — probe/commit with defaults: GET_DEF(PROBE) resolves to
    /// format=1, frame=1, interval=166666, dwMaxVideoFrameSize=460800.
    #[test]
    fn s1_probe_get_def_matches_defaults() {
        let sm = make_sm(s1_s2_config());
        let block = sm.fill(1, 1, 0);
        let format_index = block.b_format_index;
        let frame_index = block.b_frame_index;
        let interval = block.dw_frame_interval;
        let max_frame_size = block.dw_max_video_frame_size;
        assert_eq!(format_index, 1);
        assert_eq!(frame_index, 1);
        assert_eq!(interval, 166666);
        assert_eq!(max_frame_size, 640 * 360 * 2);
    }

    /// S2 — host requests largest: GET_MAX(PROBE) resolves to format=1
    /// (only one format exists), frame=2, interval=500000,
    /// dwMaxVideoFrameSize=1843200.
    #[test]
    fn s2_probe_get_max_picks_largest_frame_and_interval() {
        let sm = make_sm(s1_s2_config());
        let block = sm.fill(-1, -1, u32::MAX);
        let format_index = block.b_format_index;
        let frame_index = block.b_frame_index;
        let interval = block.dw_frame_interval;
        let max_frame_size = block.dw_max_video_frame_size;
        assert_eq!(format_index, 1);
        assert_eq!(frame_index, 2);
        assert_eq!(interval, 500000);
        assert_eq!(max_frame_size, 1280 * 720 * 2);
    }

    fn streaming_get_request(selector: u8, b_request: u8) -> UsbCtrlRequest {
        UsbCtrlRequest {
            bm_request_type: BM_REQUEST_TYPE_CLASS | RECIPIENT_INTERFACE,
            b_request,
            w_value: (selector as u16) << 8,
            w_index: 1, // matches s1_s2_config's streaming_interface
            w_length: 34,
        }
    }

    /// S1, at the SETUP/wire level: GET_DEF(PROBE) response bytes
    /// decode to format=1, frame=1, interval=166666,
    /// dwMaxVideoFrameSize=460800.
    #[test]
    fn s1_setup_get_def_wire_bytes() {
        let mut sm = make_sm(s1_s2_config());
        let resp = sm.handle_setup(streaming_get_request(PROBE_CONTROL, GET_DEF)).unwrap();
        assert_eq!(resp.len(), 34);
        assert_eq!(resp[2], 1);
        assert_eq!(resp[3], 1);
        assert_eq!(u32::from_le_bytes(resp[4..8].try_into().unwrap()), 166666);
        assert_eq!(u32::from_le_bytes(resp[18..22].try_into().unwrap()), 640 * 360 * 2);
    }

    /// S2, at the SETUP/wire level: GET_MAX(PROBE) response bytes decode
    /// to format=1, frame=2, interval=500000, dwMaxVideoFrameSize=1843200.
    #[test]
    fn s2_setup_get_max_wire_bytes() {
        let mut sm = make_sm(s1_s2_config());
        let resp = sm.handle_setup(streaming_get_request(PROBE_CONTROL, GET_MAX)).unwrap();
        assert_eq!(resp.len(), 34);
        assert_eq!(resp[2], 1);
        assert_eq!(resp[3], 2);
        assert_eq!(u32::from_le_bytes(resp[4..8].try_into().unwrap()), 500000);
        assert_eq!(u32::from_le_bytes(resp[18..22].try_into().unwrap()), 1280 * 720 * 2);
    }

    /// S3 — commit flow: SET_CUR(PROBE)+DATA(format=1,frame=2,
    /// interval=250000) clamps the probe block to (1, 2, 333333)
    /// (interval rounded up to the next declared value); GET_CUR(PROBE)
    /// then returns that same block.
    #[test]
    fn s3_probe_set_cur_then_get_cur_round_trips_clamped_block() {
        let mut sm = make_sm(s1_s2_config());
        let set_cur = sm.handle_setup(streaming_get_request(PROBE_CONTROL, SET_CUR)).unwrap();
        assert_eq!(set_cur.len(), 34);

        let mut payload = [0u8; 34];
        payload[2] = 1; // b_format_index
        payload[3] = 2; // b_frame_index
        payload[4..8].copy_from_slice(&250_000u32.to_le_bytes());
        sm.handle_data(&payload);

        let get_cur = sm.handle_setup(streaming_get_request(PROBE_CONTROL, GET_CUR)).unwrap();
        assert_eq!(get_cur[2], 1);
        assert_eq!(get_cur[3], 2);
        assert_eq!(u32::from_le_bytes(get_cur[4..8].try_into().unwrap()), 333_333);
    }

    #[test]
    fn clamp_wraps_negative_to_max() {
        assert_eq!(clamp_unsigned(-1, 5), 5);
        assert_eq!(clamp_unsigned(i32::MAX, 5), 5);
        assert_eq!(clamp_unsigned(0, 5), 1);
        assert_eq!(clamp_unsigned(3, 5), 3);
        assert_eq!(clamp_unsigned(100, 5), 5);
    }

    #[test]
    fn clamp_is_monotonic_and_pinned() {
        let max = 4;
        let mut prev = clamp_unsigned(1, max);
        for v in 1..20 {
            let cur = clamp_unsigned(v, max);
            assert!(cur >= prev);
            prev = cur;
        }
        assert_eq!(clamp_unsigned(20, max), max);
    }

    #[test]
    fn interval_selection_picks_min_geq_or_max() {
        let intervals = vec![166666, 200000, 333333, 500000];
        assert_eq!(select_interval(&intervals, 250000), 333333);
        assert_eq!(select_interval(&intervals, 0), 166666);
        assert_eq!(select_interval(&intervals, 10_000_000), 500000);
        assert_eq!(select_interval(&intervals, 500000), 500000);
    }
}
