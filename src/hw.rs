//! Hardware encoder discovery.
//!
//! Finds a hardware-accelerated encoder (NVENC/VAAPI/QSV/V4L2M2M) for a
//! software codec name; callers fall back to the software codec when none is
//! present or it refuses to open.

use ffmpeg_next::format::Pixel;

/// Returns the first available hardware encoder for `codec_name`, or None.
///
/// Alpha-carrying VP9 never goes to hardware: none of the hardware VP9
/// encoders accept a YUVA input.
pub fn find_hw_encoder(codec_name: &str, alpha: bool) -> Option<ffmpeg_next::Codec> {
    let hw_names: &[&str] = match (codec_name, alpha) {
        ("libx264" | "h264", _) => &["h264_nvenc", "h264_vaapi", "h264_qsv", "h264_v4l2m2m"],
        ("libvpx-vp9" | "vp9", false) => &["vp9_vaapi", "vp9_qsv"],
        _ => &[],
    };

    for name in hw_names {
        if let Some(codec) = ffmpeg_next::encoder::find_by_name(name) {
            log::info!("found hardware encoder: {}", name);
            return Some(codec);
        }
    }
    None
}

pub fn is_hw_encoder(codec_name: &str) -> bool {
    ["nvenc", "vaapi", "qsv", "v4l2m2m"]
        .iter()
        .any(|suffix| codec_name.contains(suffix))
}

/// Input pixel format for the encoder: hardware encoders prefer NV12,
/// software ones get planar YUV, with an alpha plane when requested.
pub fn pixel_format_for_encoder(codec_name: &str, alpha: bool) -> Pixel {
    if is_hw_encoder(codec_name) {
        Pixel::NV12
    } else if alpha {
        Pixel::YUVA420P
    } else {
        Pixel::YUV420P
    }
}
