//! RFC 3640 AAC-hbr packetization: one access unit per RTP packet, one
//! 16-bit AU header carrying `size << 3 | index(=0)`.

use rtp_audio::RtpHeader;

pub const AAC_PAYLOAD_TYPE: u8 = 96;
/// AU-headers-length in bits: a single 16-bit AU header.
pub const AU_HEADERS_LENGTH: u16 = 0x0010;

/// Build a complete RTP packet around one AAC frame. Marker is always set
/// (each packet holds a whole access unit).
pub fn write_rtp_aac_packet(
    out: &mut Vec<u8>,
    seq: u16,
    timestamp: u32,
    ssrc: u32,
    aac: &[u8],
) {
    out.clear();

    let header = RtpHeader {
        marker: true,
        payload_type: AAC_PAYLOAD_TYPE,
        sequence_number: seq,
        timestamp,
        ssrc,
        ..Default::default()
    };
    let mut rtp = [0u8; 12];
    header.write(&mut rtp);
    out.extend_from_slice(&rtp);

    out.extend_from_slice(&AU_HEADERS_LENGTH.to_be_bytes());
    let au_header = ((aac.len() as u16) << 3) & 0xFFF8;
    out.extend_from_slice(&au_header.to_be_bytes());
    out.extend_from_slice(aac);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_au_per_packet_with_hbr_headers() {
        let aac = [0xAAu8; 200];
        let mut pkt = Vec::new();
        write_rtp_aac_packet(&mut pkt, 99, 1024, 0xC0FFEE00, &aac);

        assert_eq!(pkt.len(), 12 + 4 + 200);
        assert_eq!(pkt[0], 0x80);
        assert_eq!(pkt[1], 0x80 | AAC_PAYLOAD_TYPE, "marker set, PT=96");
        assert_eq!(u16::from_be_bytes([pkt[2], pkt[3]]), 99);

        // AU-headers-length is exactly 0x0010
        assert_eq!(u16::from_be_bytes([pkt[12], pkt[13]]), 0x0010);
        // 13 high bits of the AU header equal the frame size
        let au = u16::from_be_bytes([pkt[14], pkt[15]]);
        assert_eq!(au >> 3, 200);
        assert_eq!(au & 0x07, 0, "AU index 0");
        assert_eq!(&pkt[16..], &aac[..]);
    }

    #[test]
    fn packet_is_rebuilt_from_scratch() {
        let mut pkt = vec![1, 2, 3];
        write_rtp_aac_packet(&mut pkt, 1, 0, 0, &[9]);
        assert_eq!(pkt.len(), 12 + 4 + 1);
    }
}
