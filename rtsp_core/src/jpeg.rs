//! RFC 2435 JPEG-over-RTP packetization, restricted quantization-table
//! variant: only the entropy-coded scan data travels, with a fixed Q so no
//! quantization-table header is needed in-band.

use rtp_audio::RtpHeader;

pub const JPEG_PAYLOAD_TYPE: u8 = 26;
/// Fixed Q announcing the standard tables; Q >= 128 would require sending
/// the actual tables in-band.
pub const JPEG_QUALITY: u8 = 80;
/// 1200-byte MTU budget minus the 8-byte JPEG header.
pub const MAX_RTP_PAYLOAD: usize = 1192;
/// RTP header plus JPEG main header.
pub const RTP_JPEG_HEADER_LEN: usize = 20;

/// Entropy-coded scan data located inside a JPEG buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanData<'a> {
    pub data: &'a [u8],
    /// RFC 2435 type: 0 = 4:2:0, 1 = 4:2:2.
    pub kind: u8,
    pub quality: u8,
}

/// Walk the JPEG markers from SOI: SOF0 reveals the chroma subsampling,
/// SOS marks the start of scan data. The trailing EOI is stripped.
/// Returns `None` for anything that does not look like a baseline JPEG;
/// the frame is then dropped.
pub fn find_scan_data(jpeg: &[u8]) -> Option<ScanData<'_>> {
    let mut kind = 0u8; // default 4:2:0

    if jpeg.len() < 2 || jpeg[0] != 0xFF || jpeg[1] != 0xD8 {
        return None;
    }

    let mut i = 2usize;
    while i + 1 < jpeg.len() {
        if jpeg[i] != 0xFF {
            return None;
        }
        let marker = jpeg[i + 1];
        i += 2;

        // SOF0: first component's sampling byte decides the type.
        if marker == 0xC0 {
            if i + 9 >= jpeg.len() {
                return None;
            }
            kind = match jpeg[i + 9] {
                0x21 => 1, // 4:2:2
                _ => 0,    // 4:2:0 (0x22) and anything exotic
            };
        }

        // SOS: scan data begins right after the segment.
        if marker == 0xDA {
            if i + 2 > jpeg.len() {
                return None;
            }
            let sos_len = be16(jpeg, i) as usize;
            let start = i + sos_len;
            if start == 0 || start >= jpeg.len() {
                return None;
            }

            let mut end = jpeg.len();
            if end - start >= 2 && jpeg[end - 2] == 0xFF && jpeg[end - 1] == 0xD9 {
                end -= 2;
            }
            return Some(ScanData {
                data: &jpeg[start..end],
                kind,
                quality: JPEG_QUALITY,
            });
        }

        // Skip any other marker segment (standalone markers carry no
        // length field).
        if marker != 0xD8 && marker != 0xD9 && !(0xD0..=0xD7).contains(&marker) {
            if i + 2 > jpeg.len() {
                return None;
            }
            i += be16(jpeg, i) as usize;
        }
    }

    None
}

fn be16(buf: &[u8], i: usize) -> u16 {
    ((buf[i] as u16) << 8) | buf[i + 1] as u16
}

/// Write the 12-byte RTP header plus the 8-byte JPEG main header
/// (RFC 2435 §3.1) for one fragment.
#[allow(clippy::too_many_arguments)]
pub fn write_rtp_jpeg_header(
    buf: &mut [u8; RTP_JPEG_HEADER_LEN],
    seq: u16,
    timestamp: u32,
    ssrc: u32,
    is_last: bool,
    frag_offset: u32,
    kind: u8,
    quality: u8,
    width: u16,
    height: u16,
) {
    let header = RtpHeader {
        marker: is_last,
        payload_type: JPEG_PAYLOAD_TYPE,
        sequence_number: seq,
        timestamp,
        ssrc,
        ..Default::default()
    };
    let (rtp, jpeg) = buf.split_at_mut(12);
    header.write(rtp.try_into().expect("12-byte header slice"));

    jpeg[0] = 0; // type-specific
    jpeg[1] = ((frag_offset >> 16) & 0xFF) as u8;
    jpeg[2] = ((frag_offset >> 8) & 0xFF) as u8;
    jpeg[3] = (frag_offset & 0xFF) as u8;
    jpeg[4] = kind;
    jpeg[5] = quality;
    jpeg[6] = (width / 8) as u8;
    jpeg[7] = (height / 8) as u8;
}

/// Fragment iterator over scan data: yields `(offset, chunk, is_last)`
/// with contiguous offsets starting at 0.
pub fn fragments(scan: &[u8]) -> impl Iterator<Item = (u32, &[u8], bool)> {
    let total = scan.len();
    scan.chunks(MAX_RTP_PAYLOAD).scan(0usize, move |offset, chunk| {
        let frag_offset = *offset as u32;
        *offset += chunk.len();
        Some((frag_offset, chunk, *offset >= total))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hardware::camera::synth_baseline_jpeg;

    #[test]
    fn locates_scan_data_and_strips_eoi() {
        let jpeg = synth_baseline_jpeg(640, 480, 3000);
        let scan = find_scan_data(&jpeg).unwrap();
        assert_eq!(scan.kind, 0, "4:2:0 sampling");
        assert_eq!(scan.quality, JPEG_QUALITY);
        assert_eq!(scan.data.len(), 3000, "EOI stripped, scan intact");
        // scan content survives
        assert_eq!(scan.data[0], 0);
        assert_eq!(scan.data[1], 1);
    }

    #[test]
    fn missing_sof0_defaults_to_type0_q80() {
        // SOI straight to SOS: no SOF0 segment at all.
        let mut jpeg = vec![0xFF, 0xD8];
        jpeg.extend_from_slice(&[
            0xFF, 0xDA, 0x00, 0x0C, 0x03, 0x01, 0x00, 0x02, 0x11, 0x03, 0x11, 0x00,
            0x3F, 0x00,
        ]);
        jpeg.extend_from_slice(&[1, 2, 3, 4]);
        jpeg.extend_from_slice(&[0xFF, 0xD9]);

        let scan = find_scan_data(&jpeg).unwrap();
        assert_eq!(scan.kind, 0);
        assert_eq!(scan.quality, 80);
        assert_eq!(scan.data, &[1, 2, 3, 4]);
    }

    #[test]
    fn short_or_bogus_buffers_are_dropped() {
        assert!(find_scan_data(&[]).is_none());
        assert!(find_scan_data(&[0xFF]).is_none());
        assert!(find_scan_data(&[0x12, 0x34, 0x56]).is_none());
        // SOI but no SOS
        assert!(find_scan_data(&[0xFF, 0xD8, 0xFF, 0xD9]).is_none());
    }

    #[test]
    fn fragment_offsets_cover_scan_exactly() {
        let jpeg = synth_baseline_jpeg(640, 480, 2_900);
        let scan = find_scan_data(&jpeg).unwrap();

        let mut total = 0usize;
        let mut markers = 0usize;
        let mut expected_offset = 0u32;
        for (offset, chunk, is_last) in fragments(scan.data) {
            assert_eq!(offset, expected_offset, "offsets contiguous from 0");
            expected_offset += chunk.len() as u32;
            total += chunk.len();
            if is_last {
                markers += 1;
            }
            assert!(chunk.len() <= MAX_RTP_PAYLOAD);
        }
        assert_eq!(total, scan.data.len());
        assert_eq!(markers, 1, "exactly one fragment has the marker bit");
    }

    #[test]
    fn header_fields_land_where_rfc2435_says() {
        let mut buf = [0u8; RTP_JPEG_HEADER_LEN];
        write_rtp_jpeg_header(
            &mut buf, 7, 0x01020304, 0xA0B0C0D0, true, 0x0A0B0C, 1, 80, 640, 480,
        );
        assert_eq!(buf[0], 0x80, "V=2");
        assert_eq!(buf[1], 0x80 | 26, "marker | PT=26");
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), 7);
        assert_eq!(&buf[12..16], &[0, 0x0A, 0x0B, 0x0C], "type-specific + 24-bit offset");
        assert_eq!(buf[16], 1, "type");
        assert_eq!(buf[17], 80, "Q");
        assert_eq!(buf[18], 80, "width/8");
        assert_eq!(buf[19], 60, "height/8");
    }

    #[test]
    fn sampling_422_reports_type_1() {
        let mut jpeg = synth_baseline_jpeg(320, 240, 100);
        // patch the first component's sampling byte (SOF0 payload idx 9)
        let sof = jpeg
            .windows(2)
            .position(|w| w == [0xFF, 0xC0])
            .unwrap();
        jpeg[sof + 2 + 9] = 0x21;
        let scan = find_scan_data(&jpeg).unwrap();
        assert_eq!(scan.kind, 1);
    }
}
