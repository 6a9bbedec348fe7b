// Reassembler: folds ordered, locally stored segments into one playable
// output file. The strategy is chosen by sniffing the first segment's
// leading bytes, never its filename: transport-stream chunks are
// concatenated, still images are synthesized into a video track.

pub mod mp4;
pub mod sink;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::imageops::FilterType;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ReassemblyConfig;
use crate::error::DownloadError;
use crate::sniff::SegmentKind;
use crate::workspace::SessionWorkspace;

pub use sink::{FrameSink, FrameSinkFactory, PixelFrame, SinkStatus};

pub struct Reassembler {
    sink_factory: Arc<dyn FrameSinkFactory>,
    config: ReassemblyConfig,
}

impl Reassembler {
    pub fn new(sink_factory: Arc<dyn FrameSinkFactory>, config: ReassemblyConfig) -> Self {
        Self {
            sink_factory,
            config,
        }
    }

    /// Produces `<output_base_name>.mp4` inside the workspace from the
    /// ordered segment files. Each consumed segment is deleted as it is
    /// folded in, bounding peak disk usage.
    pub async fn reassemble(
        &self,
        segment_files: &[PathBuf],
        workspace: &SessionWorkspace,
        output_base_name: &str,
        token: &CancellationToken,
    ) -> Result<PathBuf, DownloadError> {
        let Some(first) = segment_files.first() else {
            return Err(DownloadError::reassembly(
                "strategy selection",
                std::io::Error::other("no segment files to reassemble"),
            ));
        };

        let head = read_head(first).await?;
        match SegmentKind::sniff(&head) {
            SegmentKind::StillImage => {
                debug!(segments = segment_files.len(), "frame-sequence reassembly");
                self.synthesize_frames(segment_files, workspace, output_base_name, token)
                    .await
            }
            SegmentKind::TransportStream => {
                // also the fallback for misnamed "image" segments whose
                // bytes are not actually an image
                debug!(
                    segments = segment_files.len(),
                    "transport-stream reassembly"
                );
                concatenate(segment_files, workspace, output_base_name, token).await
            }
        }
    }

    async fn synthesize_frames(
        &self,
        segment_files: &[PathBuf],
        workspace: &SessionWorkspace,
        output_base_name: &str,
        token: &CancellationToken,
    ) -> Result<PathBuf, DownloadError> {
        let first_bytes = tokio::fs::read(&segment_files[0])
            .await
            .map_err(|e| DownloadError::reassembly("frame read", e))?;
        let first_frame = decode_frame(0, &first_bytes)?;
        let (width, height) = (first_frame.width, first_frame.height);

        let output = workspace.output_path(&format!("{output_base_name}.mp4"));
        let mut sink = self.sink_factory.open(&output, width, height).await?;

        for (index, file) in segment_files.iter().enumerate() {
            if token.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }

            sink.wait_ready().await?;

            let frame = if index == 0 {
                first_frame.clone()
            } else {
                let bytes = tokio::fs::read(file)
                    .await
                    .map_err(|e| DownloadError::reassembly("frame read", e))?;
                let mut frame = decode_frame(index, &bytes)?;
                if frame.width != width || frame.height != height {
                    frame = resize_frame(&frame, width, height);
                }
                frame
            };

            let timestamp = self.config.frame_duration * index as u32;
            sink.append(&frame, timestamp).await?;

            tokio::fs::remove_file(file)
                .await
                .map_err(|e| DownloadError::reassembly("frame cleanup", e))?;
        }

        match sink.finish().await? {
            SinkStatus::Completed => {
                info!(
                    frames = segment_files.len(),
                    output = %output.display(),
                    "frame sequence synthesized"
                );
                Ok(output)
            }
            SinkStatus::Failed(reason) => Err(DownloadError::sink(reason)),
        }
    }
}

/// Transport-stream path: ordered byte concatenation into `<base>.ts`,
/// relabelled `.mp4` once complete. The elementary-stream framing is
/// self-describing, so no re-encoding happens here.
async fn concatenate(
    segment_files: &[PathBuf],
    workspace: &SessionWorkspace,
    output_base_name: &str,
    token: &CancellationToken,
) -> Result<PathBuf, DownloadError> {
    let staging = workspace.output_path(&format!("{output_base_name}.ts"));
    let output_file = File::create(&staging)
        .await
        .map_err(|e| DownloadError::reassembly("concat open", e))?;
    let mut writer = BufWriter::new(output_file);

    for file in segment_files {
        if token.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        let bytes = tokio::fs::read(file)
            .await
            .map_err(|e| DownloadError::reassembly("segment read", e))?;
        writer
            .write_all(&bytes)
            .await
            .map_err(|e| DownloadError::reassembly("concat write", e))?;

        tokio::fs::remove_file(file)
            .await
            .map_err(|e| DownloadError::reassembly("segment cleanup", e))?;
    }

    writer
        .flush()
        .await
        .map_err(|e| DownloadError::reassembly("concat flush", e))?;
    drop(writer);

    let output = workspace.output_path(&format!("{output_base_name}.mp4"));
    tokio::fs::rename(&staging, &output)
        .await
        .map_err(|e| DownloadError::reassembly("container relabel", e))?;

    info!(
        segments = segment_files.len(),
        output = %output.display(),
        "transport stream concatenated"
    );
    Ok(output)
}

async fn read_head(path: &Path) -> Result<Vec<u8>, DownloadError> {
    let mut file = File::open(path)
        .await
        .map_err(|e| DownloadError::reassembly("strategy selection", e))?;
    let mut head = vec![0u8; 16];
    let read = file
        .read(&mut head)
        .await
        .map_err(|e| DownloadError::reassembly("strategy selection", e))?;
    head.truncate(read);
    Ok(head)
}

fn decode_frame(index: usize, bytes: &[u8]) -> Result<PixelFrame, DownloadError> {
    let image = image::load_from_memory(bytes)
        .map_err(|source| DownloadError::FrameDecode { index, source })?;
    let rgb = image.to_rgb8();
    Ok(PixelFrame {
        width: rgb.width(),
        height: rgb.height(),
        rgb: rgb.into_raw(),
    })
}

/// Frames occasionally differ from the first frame's geometry; the sink is
/// fixed-dimension, so stragglers are scaled to fit.
fn resize_frame(frame: &PixelFrame, width: u32, height: u32) -> PixelFrame {
    let Some(buffer) =
        image::RgbImage::from_raw(frame.width, frame.height, frame.rgb.clone())
    else {
        warn!("frame buffer length mismatch, passing through unscaled");
        return frame.clone();
    };
    let resized = image::imageops::resize(&buffer, width, height, FilterType::Triangle);
    PixelFrame {
        width,
        height,
        rgb: resized.into_raw(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reassemble::mp4::Mp4SinkFactory;
    use image::codecs::jpeg::JpegEncoder;
    use mockall::predicate::always;
    use sink::{MockFrameSink, MockFrameSinkFactory};
    use std::time::Duration;
    use uuid::Uuid;

    fn reassembler() -> Reassembler {
        Reassembler::new(Arc::new(Mp4SinkFactory::new(85)), ReassemblyConfig::default())
    }

    fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
        let pixels = vec![0x60u8; (width * height * 3) as usize];
        let mut out = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut out, 85);
        encoder
            .encode(&pixels, width, height, image::ExtendedColorType::Rgb8)
            .unwrap();
        out
    }

    async fn write_segments(
        ws: &SessionWorkspace,
        extension: &str,
        payloads: &[Vec<u8>],
    ) -> Vec<PathBuf> {
        let mut files = Vec::new();
        for (i, payload) in payloads.iter().enumerate() {
            let path = ws.segment_path(i, extension);
            tokio::fs::write(&path, payload).await.unwrap();
            files.push(path);
        }
        files
    }

    #[tokio::test]
    async fn transport_segments_are_concatenated_in_order() {
        let ws = SessionWorkspace::create(None, Uuid::new_v4()).unwrap();
        let payloads: Vec<Vec<u8>> = (0..4u8).map(|i| vec![0x47, i, i, i]).collect();
        let files = write_segments(&ws, "ts", &payloads).await;

        let output = reassembler()
            .reassemble(&files, &ws, "video", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(output, ws.output_path("video.mp4"));
        let merged = tokio::fs::read(&output).await.unwrap();
        let expected: Vec<u8> = payloads.concat();
        assert_eq!(merged, expected);
        // consumed segments are deleted as they are folded in
        for file in &files {
            assert!(!file.exists());
        }
        ws.remove().await.unwrap();
    }

    #[tokio::test]
    async fn twelve_jpeg_frames_become_a_48_second_track() {
        let ws = SessionWorkspace::create(None, Uuid::new_v4()).unwrap();
        let payloads: Vec<Vec<u8>> = (0..12).map(|_| jpeg_bytes(16, 16)).collect();
        let files = write_segments(&ws, "jpeg", &payloads).await;

        let output = reassembler()
            .reassemble(&files, &ws, "slides", &CancellationToken::new())
            .await
            .unwrap();

        let data = tokio::fs::read(&output).await.unwrap();
        assert_eq!(&data[4..8], b"ftyp");
        // stts: one run of 12 samples, 4000 ms apart
        let stts = data
            .windows(4)
            .position(|w| w == b"stts".as_slice())
            .unwrap()
            - 4;
        let count = u32::from_be_bytes(data[stts + 16..stts + 20].try_into().unwrap());
        let delta = u32::from_be_bytes(data[stts + 20..stts + 24].try_into().unwrap());
        assert_eq!(count * delta, 48_000);
        ws.remove().await.unwrap();
    }

    #[tokio::test]
    async fn misnamed_jpeg_with_transport_bytes_falls_back_to_concatenation() {
        let ws = SessionWorkspace::create(None, Uuid::new_v4()).unwrap();
        // .jpeg filenames, transport-stream payloads
        let payloads: Vec<Vec<u8>> = (0..3u8).map(|i| vec![0x47, 0x40, i]).collect();
        let files = write_segments(&ws, "jpeg", &payloads).await;

        let output = reassembler()
            .reassemble(&files, &ws, "misnamed", &CancellationToken::new())
            .await
            .unwrap();

        let merged = tokio::fs::read(&output).await.unwrap();
        assert_eq!(merged, payloads.concat());
        ws.remove().await.unwrap();
    }

    #[tokio::test]
    async fn frame_timestamps_follow_the_configured_duration() {
        let ws = SessionWorkspace::create(None, Uuid::new_v4()).unwrap();
        let payloads: Vec<Vec<u8>> = (0..3).map(|_| jpeg_bytes(8, 8)).collect();
        let files = write_segments(&ws, "jpeg", &payloads).await;

        let mut factory = MockFrameSinkFactory::new();
        factory
            .expect_open()
            .with(always(), always(), always())
            .returning(|_, _, _| {
                let mut sink = MockFrameSink::new();
                sink.expect_wait_ready().times(3).returning(|| Ok(()));
                let mut expected_ts = 0u64;
                sink.expect_append().times(3).returning(move |_, ts| {
                    assert_eq!(ts, Duration::from_secs(expected_ts));
                    expected_ts += 2;
                    Ok(())
                });
                sink.expect_finish()
                    .times(1)
                    .returning(|| Ok(SinkStatus::Completed));
                Ok(Box::new(sink))
            });

        let config = ReassemblyConfig::default().with_frame_duration(Duration::from_secs(2));
        let reassembler = Reassembler::new(Arc::new(factory), config);
        reassembler
            .reassemble(&files, &ws, "timed", &CancellationToken::new())
            .await
            .unwrap();
        ws.remove().await.unwrap();
    }

    #[tokio::test]
    async fn failed_sink_status_surfaces_as_a_reassembly_error() {
        let ws = SessionWorkspace::create(None, Uuid::new_v4()).unwrap();
        let files = write_segments(&ws, "jpeg", &[jpeg_bytes(8, 8)]).await;

        let mut factory = MockFrameSinkFactory::new();
        factory.expect_open().returning(|_, _, _| {
            let mut sink = MockFrameSink::new();
            sink.expect_wait_ready().returning(|| Ok(()));
            sink.expect_append().returning(|_, _| Ok(()));
            sink.expect_finish()
                .returning(|| Ok(SinkStatus::Failed("encoder exploded".to_owned())));
            Ok(Box::new(sink))
        });

        let reassembler = Reassembler::new(Arc::new(factory), ReassemblyConfig::default());
        let err = reassembler
            .reassemble(&files, &ws, "bad", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("encoder exploded"));
        ws.remove().await.unwrap();
    }

    #[tokio::test]
    async fn cancellation_mid_reassembly_stops_the_iteration() {
        let ws = SessionWorkspace::create(None, Uuid::new_v4()).unwrap();
        let payloads: Vec<Vec<u8>> = (0..3u8).map(|i| vec![0x47, i]).collect();
        let files = write_segments(&ws, "ts", &payloads).await;

        let token = CancellationToken::new();
        token.cancel();
        let err = reassembler()
            .reassemble(&files, &ws, "cancelled", &token)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        ws.remove().await.unwrap();
    }
}
