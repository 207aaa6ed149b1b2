//! Camera collaborator seam. The sensor driver is out of scope; the core
//! only needs "give me one JPEG frame" plus a readiness probe.

/// One captured frame. The buffer is returned to the driver when the frame
/// is dropped.
#[derive(Debug, Clone)]
pub struct JpegFrame {
    pub data: Vec<u8>,
    pub width: u16,
    pub height: u16,
}

pub trait Camera: Send + Sync {
    fn is_ready(&self) -> bool;
    fn capture(&self) -> Option<JpegFrame>;
}

/// Placeholder for builds without a sensor driver wired in: never ready,
/// never captures.
#[derive(Debug, Default)]
pub struct NoCamera;

impl Camera for NoCamera {
    fn is_ready(&self) -> bool {
        false
    }

    fn capture(&self) -> Option<JpegFrame> {
        None
    }
}

/// Host camera: a deterministic baseline JPEG with real SOI/SOF0/SOS/EOI
/// markers, enough for the RTP packetizer to find the scan data.
#[derive(Debug)]
pub struct TestPatternCamera {
    pub width: u16,
    pub height: u16,
    pub scan_bytes: usize,
}

impl Default for TestPatternCamera {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            scan_bytes: 4096,
        }
    }
}

impl TestPatternCamera {
    pub fn new(width: u16, height: u16, scan_bytes: usize) -> Self {
        Self {
            width,
            height,
            scan_bytes,
        }
    }
}

impl Camera for TestPatternCamera {
    fn is_ready(&self) -> bool {
        true
    }

    fn capture(&self) -> Option<JpegFrame> {
        Some(JpegFrame {
            data: synth_baseline_jpeg(self.width, self.height, self.scan_bytes),
            width: self.width,
            height: self.height,
        })
    }
}

/// Build a syntactically valid baseline JPEG: SOI, SOF0 (4:2:0 sampling),
/// SOS, `scan_bytes` of entropy-coded filler (0xFF avoided), EOI.
pub fn synth_baseline_jpeg(width: u16, height: u16, scan_bytes: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(scan_bytes + 64);

    out.extend_from_slice(&[0xFF, 0xD8]); // SOI

    // SOF0: precision 8, dims, 3 components, Y sampling 0x22 (4:2:0)
    out.extend_from_slice(&[0xFF, 0xC0, 0x00, 0x11, 0x08]);
    out.extend_from_slice(&height.to_be_bytes());
    out.extend_from_slice(&width.to_be_bytes());
    out.extend_from_slice(&[0x03, 0x01, 0x22, 0x00, 0x02, 0x11, 0x01, 0x03, 0x11, 0x01]);

    // SOS: 3 components, spectral selection 0..63
    out.extend_from_slice(&[
        0xFF, 0xDA, 0x00, 0x0C, 0x03, 0x01, 0x00, 0x02, 0x11, 0x03, 0x11, 0x00, 0x3F,
        0x00,
    ]);

    for i in 0..scan_bytes {
        out.push((i % 251) as u8);
    }

    out.extend_from_slice(&[0xFF, 0xD9]); // EOI
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_jpeg_has_markers() {
        let jpeg = synth_baseline_jpeg(320, 240, 100);
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);
        // SOF0 marker present
        assert!(jpeg.windows(2).any(|w| w == [0xFF, 0xC0]));
        // SOS marker present
        assert!(jpeg.windows(2).any(|w| w == [0xFF, 0xDA]));
    }

    #[test]
    fn camera_reports_frame_dimensions() {
        let cam = TestPatternCamera::new(800, 600, 256);
        let frame = cam.capture().unwrap();
        assert_eq!(frame.width, 800);
        assert_eq!(frame.height, 600);
        assert!(frame.data.len() > 256);
    }
}
