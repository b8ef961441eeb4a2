//! Streaming Control Block (spec §3) and the probe/commit fill algorithm
//! (spec §4.5).

use zerocopy::{AsBytes, FromBytes, FromZeroes};

pub const PROBE_CONTROL: u8 = 0x01;
pub const COMMIT_CONTROL: u8 = 0x02;

pub const GET_CUR: u8 = 0x81;
pub const GET_MIN: u8 = 0x82;
pub const GET_MAX: u8 = 0x83;
pub const GET_RES: u8 = 0x84;
pub const GET_LEN: u8 = 0x85;
pub const GET_INFO: u8 = 0x86;
pub const GET_DEF: u8 = 0x87;
pub const SET_CUR: u8 = 0x01;

/// The 34-byte UVC `VS_PROBE_CONTROL` / `VS_COMMIT_CONTROL` block,
/// little-endian on the wire (spec §3, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct StreamingControl {
    pub bm_hint: u16,
    pub b_format_index: u8,
    pub b_frame_index: u8,
    pub dw_frame_interval: u32,
    pub w_key_frame_rate: u16,
    pub w_p_frame_rate: u16,
    pub w_comp_quality: u16,
    pub w_comp_window_size: u16,
    pub w_delay: u16,
    pub dw_max_video_frame_size: u32,
    pub dw_max_payload_transfer_size: u32,
    pub dw_clock_frequency: u32,
    pub bm_framing_info: u8,
    pub b_prefered_version: u8,
    pub b_min_version: u8,
    pub b_max_version: u8,
}

const _: () = assert!(std::mem::size_of::<StreamingControl>() == 34);

impl Default for StreamingControl {
    fn default() -> Self {
        StreamingControl {
            bm_hint: 0,
            b_format_index: 0,
            b_frame_index: 0,
            dw_frame_interval: 0,
            w_key_frame_rate: 0,
            w_p_frame_rate: 0,
            w_comp_quality: 0,
            w_comp_window_size: 0,
            w_delay: 0,
            dw_max_video_frame_size: 0,
            dw_max_payload_transfer_size: 0,
            dw_clock_frequency: 0,
            bm_framing_info: 0,
            b_prefered_version: 0,
            b_min_version: 0,
            b_max_version: 0,
        }
    }
}
