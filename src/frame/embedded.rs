/// Embedded JPEG previews in camera RAW files
///
/// Most RAW containers carry one or more full JPEG previews next to the
/// sensor data. Decoding the smallest preview that still covers the target
/// size is far cheaper than demosaicing, and plenty for a sharpness estimate.

use super::FillMode;
use image::{ImageFormat, ImageReader};
use std::io::Cursor;
use std::path::Path;

/// Supported RAW file extensions (common formats)
pub const RAW_EXTENSIONS: &[&str] = &[
    "nef", "dng", "cr2", "cr3", "arw", "raf", "orf", "rw2",
    "pef", "srw", "erf", "kdc", "dcr", "mos", "raw", "rwl",
];

/// Check if this is a RAW file by extension
pub fn is_raw_path(path: &Path) -> bool {
    path.extension()
        .map(|ext| {
            let ext = ext.to_string_lossy().to_lowercase();
            RAW_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// Byte length of the JPEG starting at `start`, following its segment structure
///
/// Walking segment lengths skips APP1/EXIF payloads, which often contain a
/// nested thumbnail whose EOI would otherwise end the outer image early.
fn jpeg_extent(data: &[u8], start: usize) -> Option<usize> {
    let mut pos = start + 2;
    loop {
        if pos + 1 >= data.len() || data[pos] != 0xFF {
            return None;
        }
        let marker = data[pos + 1];
        match marker {
            // Fill byte before a marker
            0xFF => {
                pos += 1;
                continue;
            }
            0xD9 => return Some(pos + 2 - start),
            // Standalone markers carry no length
            0x01 | 0xD0..=0xD7 => {
                pos += 2;
                continue;
            }
            _ => {}
        }

        if pos + 3 >= data.len() {
            return None;
        }
        let len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        if len < 2 {
            return None;
        }
        pos += 2 + len;

        if marker == 0xDA {
            // Entropy-coded data runs until the next real marker
            while pos + 1 < data.len() {
                if data[pos] == 0xFF {
                    let next = data[pos + 1];
                    if next == 0x00 || (0xD0..=0xD7).contains(&next) {
                        pos += 2;
                        continue;
                    }
                    if next != 0xFF {
                        break;
                    }
                }
                pos += 1;
            }
        }
    }
}

/// Find every complete JPEG stream embedded in `data`
pub fn find_embedded_jpegs(data: &[u8]) -> Vec<&[u8]> {
    let jpeg_start = [0xFF, 0xD8, 0xFF]; // JPEG Start Of Image (SOI)

    let mut found = Vec::new();
    let mut pos = 0;
    while pos + jpeg_start.len() <= data.len() {
        if data[pos..].starts_with(&jpeg_start) {
            if let Some(len) = jpeg_extent(data, pos) {
                found.push(&data[pos..pos + len]);
                pos += len;
                continue;
            }
        }
        pos += 1;
    }
    found
}

/// Choose the preview to decode for a `target_size` square frame
///
/// Picks the smallest preview whose covering side reaches `target_size`;
/// when none does, the largest one available.
pub fn select_preview(data: &[u8], target_size: u32, fill: FillMode) -> Option<&[u8]> {
    let mut candidates: Vec<(u64, u32, &[u8])> = find_embedded_jpegs(data)
        .into_iter()
        .filter_map(|jpeg| {
            let (w, h) = ImageReader::with_format(Cursor::new(jpeg), ImageFormat::Jpeg)
                .into_dimensions()
                .ok()?;
            Some((w as u64 * h as u64, fill.covering_side(w, h), jpeg))
        })
        .collect();

    tracing::trace!(previews = candidates.len(), "embedded previews found");
    candidates.sort_by_key(|(area, _, _)| *area);

    candidates
        .iter()
        .find(|(_, side, _)| *side >= target_size)
        .or_else(|| candidates.last())
        .map(|(_, _, jpeg)| *jpeg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{codecs::jpeg::JpegEncoder, RgbImage};

    fn encode_jpeg(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x * 7) as u8, (y * 5) as u8, ((x + y) * 3) as u8])
        });
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, 90)
            .encode_image(&img)
            .unwrap();
        out
    }

    fn fake_raw(previews: &[Vec<u8>]) -> Vec<u8> {
        // Header bytes, then each preview separated by sensor-like noise
        let mut data = b"II*\0fake-raw-header".to_vec();
        for preview in previews {
            data.extend((0..97u32).map(|i| (i * 31 % 251) as u8));
            data.extend_from_slice(preview);
        }
        data.extend_from_slice(&[0xFF, 0xD8, 0x00, 0x12]);
        data
    }

    #[test]
    fn test_raw_extension_detection() {
        assert!(is_raw_path(Path::new("/photos/DSC_0001.NEF")));
        assert!(is_raw_path(Path::new("a.cr3")));
        assert!(!is_raw_path(Path::new("a.jpg")));
        assert!(!is_raw_path(Path::new("no_extension")));
    }

    #[test]
    fn test_finds_complete_streams() {
        let small = encode_jpeg(32, 24);
        let large = encode_jpeg(160, 120);
        let data = fake_raw(&[small.clone(), large.clone()]);

        let found = find_embedded_jpegs(&data);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0], small.as_slice());
        assert_eq!(found[1], large.as_slice());
    }

    #[test]
    fn test_selects_smallest_covering_preview() {
        let small = encode_jpeg(32, 24);
        let medium = encode_jpeg(96, 64);
        let large = encode_jpeg(400, 300);
        let data = fake_raw(&[large.clone(), small.clone(), medium.clone()]);

        // Fill needs the short side to reach 64
        assert_eq!(select_preview(&data, 64, FillMode::Fill), Some(medium.as_slice()));
        // Fit only needs the long side
        assert_eq!(select_preview(&data, 30, FillMode::Fit), Some(small.as_slice()));
        // Nothing covers 1000: fall back to the largest
        assert_eq!(select_preview(&data, 1000, FillMode::Fill), Some(large.as_slice()));
    }

    #[test]
    fn test_no_preview_in_garbage() {
        let data: Vec<u8> = (0..4096u32).map(|i| (i * 13 % 200) as u8).collect();
        assert!(select_preview(&data, 64, FillMode::Fill).is_none());
    }
}
