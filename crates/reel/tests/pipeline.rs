// End-to-end pipeline tests through the public downloader API, with the
// manifest and segment sources stubbed so no network is involved.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tempfile::tempdir;
use url::Url;

use reel_engine::{
    DownloadConfig, DownloadError, DownloadState, HlsDownloader, ManifestSource, ProgressCallback,
    SegmentSource,
};

const MASTER: &str = "\
#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=5000000,RESOLUTION=1920x1080
hd/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=640x360
sd/index.m3u8
";

fn media_manifest(count: usize, extension: &str) -> String {
    let mut text = String::from("#EXTM3U\n#EXT-X-TARGETDURATION:4\n");
    for i in 0..count {
        text.push_str(&format!("#EXTINF:4.0,\nseg{i}.{extension}\n"));
    }
    text.push_str("#EXT-X-ENDLIST\n");
    text
}

struct TextManifest(String);

#[async_trait]
impl ManifestSource for TextManifest {
    async fn fetch_manifest(&self, _url: &Url) -> Result<String, DownloadError> {
        Ok(self.0.clone())
    }
}

struct StaticSegments(Bytes);

#[async_trait]
impl SegmentSource for StaticSegments {
    async fn fetch_segment(&self, _url: &Url) -> Result<Bytes, DownloadError> {
        Ok(self.0.clone())
    }
}

fn jpeg_payload(width: u32, height: u32) -> Bytes {
    let pixels = vec![0x40u8; (width * height * 3) as usize];
    let mut out = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, 85);
    encoder
        .encode(&pixels, width, height, image::ExtendedColorType::Rgb8)
        .unwrap();
    Bytes::from(out)
}

fn downloader(
    manifest: String,
    payload: Bytes,
    staging: PathBuf,
) -> Result<HlsDownloader, DownloadError> {
    Ok(
        HlsDownloader::new(DownloadConfig::default().with_staging_root(staging))?
            .with_manifest_source(Arc::new(TextManifest(manifest)))
            .with_segment_source(Arc::new(StaticSegments(payload))),
    )
}

#[tokio::test]
async fn discovery_over_an_injected_source_sorts_by_height() {
    let staging = tempdir().unwrap();
    let downloader = downloader(
        MASTER.to_owned(),
        Bytes::new(),
        staging.path().to_path_buf(),
    )
    .unwrap();

    let variants = downloader
        .discover_qualities("https://h/x/master.m3u8")
        .await
        .unwrap();

    assert_eq!(variants.len(), 2);
    assert_eq!(variants[0].label, "1080p");
    assert_eq!(variants[0].bandwidth, 5_000_000);
    assert_eq!(variants[0].url.as_str(), "https://h/x/hd/index.m3u8");
    assert_eq!(variants[1].label, "360p");
}

#[tokio::test]
async fn transport_stream_download_completes_with_pinned_progress() {
    let staging = tempdir().unwrap();
    let dest = tempdir().unwrap();
    let downloader = downloader(
        media_manifest(6, "ts"),
        Bytes::from_static(&[0x47, 0x00, 0x11]),
        staging.path().to_path_buf(),
    )
    .unwrap();

    let fractions: Arc<Mutex<Vec<f64>>> = Arc::new(Mutex::new(Vec::new()));
    let fractions_cb = Arc::clone(&fractions);
    let callback: ProgressCallback = Arc::new(move |p| fractions_cb.lock().push(p.fraction));

    let variants = downloader
        .discover_qualities("https://h/x/media.m3u8")
        .await
        .unwrap();
    let handle = downloader.start_download(
        variants[0].clone(),
        "stream",
        dest.path(),
        Some(callback),
    );
    let progress = handle.progress();
    let path = handle.wait().await.unwrap();

    assert_eq!(path, dest.path().join("stream.mp4"));
    assert!(path.exists());
    let expected: Vec<u8> = std::iter::repeat_n([0x47, 0x00, 0x11], 6).flatten().collect();
    assert_eq!(tokio::fs::read(&path).await.unwrap(), expected);

    // monotonically non-decreasing, capped below 1.0 until the file
    // existed, pinned to exactly 1.0 at the end
    let seen = fractions.lock();
    assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    assert!(seen.iter().rev().skip(1).all(|&f| f <= 0.95));
    assert_eq!(*seen.last().unwrap(), 1.0);
    assert_eq!(progress.borrow().state, DownloadState::Completed);

    // workspace removed on the success path too
    let mut leftovers = tokio::fs::read_dir(staging.path()).await.unwrap();
    assert!(leftovers.next_entry().await.unwrap().is_none());
}

#[tokio::test]
async fn frame_sequence_download_builds_a_timed_video_track() {
    let staging = tempdir().unwrap();
    let dest = tempdir().unwrap();
    let downloader = downloader(
        media_manifest(12, "jpeg"),
        jpeg_payload(32, 32),
        staging.path().to_path_buf(),
    )
    .unwrap();

    let variants = downloader
        .discover_qualities("https://h/x/slides.m3u8")
        .await
        .unwrap();
    let handle = downloader.start_download(variants[0].clone(), "slides", dest.path(), None);
    let path = handle.wait().await.unwrap();

    let data = tokio::fs::read(&path).await.unwrap();
    assert_eq!(&data[4..8], b"ftyp");

    // 12 frames at the default 4s spacing: total track duration 48s
    let stts = data
        .windows(4)
        .position(|w| w == b"stts".as_slice())
        .unwrap()
        - 4;
    let count = u32::from_be_bytes(data[stts + 16..stts + 20].try_into().unwrap());
    let delta = u32::from_be_bytes(data[stts + 20..stts + 24].try_into().unwrap());
    assert_eq!(count, 12);
    assert_eq!(count * delta, 48_000);
}

#[tokio::test]
async fn configured_frame_duration_changes_the_track_timing() {
    let staging = tempdir().unwrap();
    let dest = tempdir().unwrap();
    let config = DownloadConfig::default()
        .with_staging_root(staging.path())
        .with_reassembly(
            reel_engine::ReassemblyConfig::default().with_frame_duration(Duration::from_secs(1)),
        );
    let downloader = HlsDownloader::new(config)
        .unwrap()
        .with_manifest_source(Arc::new(TextManifest(media_manifest(5, "jpeg"))))
        .with_segment_source(Arc::new(StaticSegments(jpeg_payload(16, 16))));

    let variants = downloader
        .discover_qualities("https://h/x/slides.m3u8")
        .await
        .unwrap();
    let handle = downloader.start_download(variants[0].clone(), "fast", dest.path(), None);
    let path = handle.wait().await.unwrap();

    let data = tokio::fs::read(&path).await.unwrap();
    let stts = data
        .windows(4)
        .position(|w| w == b"stts".as_slice())
        .unwrap()
        - 4;
    let count = u32::from_be_bytes(data[stts + 16..stts + 20].try_into().unwrap());
    let delta = u32::from_be_bytes(data[stts + 20..stts + 24].try_into().unwrap());
    assert_eq!(count, 5);
    assert_eq!(delta, 1000);
}

#[tokio::test]
async fn cancelling_mid_fetch_leaves_no_artifacts() {
    struct Stalling;

    #[async_trait]
    impl SegmentSource for Stalling {
        async fn fetch_segment(&self, _url: &Url) -> Result<Bytes, DownloadError> {
            tokio::time::sleep(Duration::from_millis(25)).await;
            Ok(Bytes::from_static(&[0x47]))
        }
    }

    let staging = tempdir().unwrap();
    let dest = tempdir().unwrap();
    let downloader =
        HlsDownloader::new(DownloadConfig::default().with_staging_root(staging.path()))
            .unwrap()
            .with_manifest_source(Arc::new(TextManifest(media_manifest(20, "ts"))))
            .with_segment_source(Arc::new(Stalling));

    let variants = downloader
        .discover_qualities("https://h/x/media.m3u8")
        .await
        .unwrap();
    let handle = downloader.start_download(variants[0].clone(), "doomed", dest.path(), None);

    // cancel while the first wave of segments is still in flight
    tokio::time::sleep(Duration::from_millis(5)).await;
    handle.cancel();

    let progress = handle.progress();
    let err = handle.wait().await.unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(progress.borrow().state, DownloadState::Cancelled);

    // zero files in the staging area, nothing at the destination
    let mut leftovers = tokio::fs::read_dir(staging.path()).await.unwrap();
    assert!(leftovers.next_entry().await.unwrap().is_none());
    let mut dest_entries = tokio::fs::read_dir(dest.path()).await.unwrap();
    assert!(dest_entries.next_entry().await.unwrap().is_none());
}

#[tokio::test]
async fn misnamed_image_segments_fall_back_to_concatenation() {
    let staging = tempdir().unwrap();
    let dest = tempdir().unwrap();
    // .jpeg segment names, transport-stream payloads
    let downloader = downloader(
        media_manifest(3, "jpeg"),
        Bytes::from_static(&[0x47, 0x40, 0x00]),
        staging.path().to_path_buf(),
    )
    .unwrap();

    let variants = downloader
        .discover_qualities("https://h/x/misnamed.m3u8")
        .await
        .unwrap();
    let handle = downloader.start_download(variants[0].clone(), "misnamed", dest.path(), None);
    let path = handle.wait().await.unwrap();

    let expected: Vec<u8> = std::iter::repeat_n([0x47, 0x40, 0x00], 3).flatten().collect();
    assert_eq!(tokio::fs::read(&path).await.unwrap(), expected);
}
