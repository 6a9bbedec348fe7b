//! Magic-byte content sniffing for downloaded segments.
//!
//! Origin servers sometimes misname segments (an `.jpeg` URL carrying
//! transport-stream bytes), so the reassembly strategy is chosen from the
//! actual leading bytes, never from the filename.

const JPEG_SIGNATURE: [u8; 3] = [0xFF, 0xD8, 0xFF];
const PNG_SIGNATURE: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

/// Content class of a segment, decided by its leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    /// A still image (JPEG or PNG); reassembled by frame synthesis.
    StillImage,
    /// Anything else is treated as a transport-stream chunk and
    /// reassembled by concatenation.
    TransportStream,
}

impl SegmentKind {
    pub fn sniff(bytes: &[u8]) -> Self {
        if bytes.starts_with(&JPEG_SIGNATURE) || bytes.starts_with(&PNG_SIGNATURE) {
            Self::StillImage
        } else {
            Self::TransportStream
        }
    }

    /// File extension used for the segment's workspace file.
    pub fn extension(self) -> &'static str {
        match self {
            Self::StillImage => "jpeg",
            Self::TransportStream => "ts",
        }
    }
}
