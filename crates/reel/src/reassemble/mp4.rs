// Default frame sink: a minimal unfragmented ISO-BMFF (MP4) writer for a
// single MJPEG video track. Layout is `ftyp` + streamed `mdat` (size
// patched on finish) + trailing `moov` built from the recorded samples.

use std::io::SeekFrom;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use image::ExtendedColorType;
use image::codecs::jpeg::JpegEncoder;
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter};
use tracing::debug;

use crate::error::DownloadError;
use crate::reassemble::sink::{FrameSink, FrameSinkFactory, PixelFrame, SinkStatus};

/// Track timescale: milliseconds.
const TIMESCALE: u32 = 1000;

const MATRIX_IDENTITY: [u32; 9] = [
    0x0001_0000,
    0,
    0,
    0,
    0x0001_0000,
    0,
    0,
    0,
    0x4000_0000,
];

pub struct Mp4SinkFactory {
    jpeg_quality: u8,
}

impl Mp4SinkFactory {
    pub fn new(jpeg_quality: u8) -> Self {
        Self { jpeg_quality }
    }
}

#[async_trait]
impl FrameSinkFactory for Mp4SinkFactory {
    async fn open(
        &self,
        output: &Path,
        width: u32,
        height: u32,
    ) -> Result<Box<dyn FrameSink>, DownloadError> {
        let sink = Mp4FrameSink::create(output, width, height, self.jpeg_quality).await?;
        Ok(Box::new(sink))
    }
}

struct Sample {
    offset: u64,
    size: u32,
    pts: Duration,
}

pub struct Mp4FrameSink {
    writer: BufWriter<File>,
    width: u32,
    height: u32,
    jpeg_quality: u8,
    /// Absolute offset of the `mdat` size field, patched on finish.
    mdat_start: u64,
    /// Absolute offset of the next write.
    position: u64,
    samples: Vec<Sample>,
}

impl Mp4FrameSink {
    pub async fn create(
        output: &Path,
        width: u32,
        height: u32,
        jpeg_quality: u8,
    ) -> Result<Self, DownloadError> {
        let file = File::create(output)
            .await
            .map_err(|e| DownloadError::reassembly("sink open", e))?;
        let mut writer = BufWriter::new(file);

        let mut ftyp_payload = BytesMut::new();
        ftyp_payload.put_slice(b"isom");
        ftyp_payload.put_u32(0x200);
        ftyp_payload.put_slice(b"isom");
        ftyp_payload.put_slice(b"iso2");
        ftyp_payload.put_slice(b"mp41");
        let ftyp = boxed(b"ftyp", &ftyp_payload);

        writer
            .write_all(&ftyp)
            .await
            .map_err(|e| DownloadError::reassembly("sink open", e))?;

        let mdat_start = ftyp.len() as u64;
        // mdat header with a zero size placeholder
        let mut mdat_header = BytesMut::with_capacity(8);
        mdat_header.put_u32(0);
        mdat_header.put_slice(b"mdat");
        writer
            .write_all(&mdat_header)
            .await
            .map_err(|e| DownloadError::reassembly("sink open", e))?;

        Ok(Self {
            writer,
            width,
            height,
            jpeg_quality,
            mdat_start,
            position: mdat_start + 8,
            samples: Vec::new(),
        })
    }
}

#[async_trait]
impl FrameSink for Mp4FrameSink {
    async fn wait_ready(&mut self) -> Result<(), DownloadError> {
        // ready once the buffered writer has drained
        self.writer
            .flush()
            .await
            .map_err(|e| DownloadError::reassembly("sink ready", e))
    }

    async fn append(
        &mut self,
        frame: &PixelFrame,
        timestamp: Duration,
    ) -> Result<(), DownloadError> {
        let mut jpeg = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut jpeg, self.jpeg_quality);
        encoder
            .encode(&frame.rgb, frame.width, frame.height, ExtendedColorType::Rgb8)
            .map_err(|e| DownloadError::sink(format!("jpeg encode failed: {e}")))?;

        self.writer
            .write_all(&jpeg)
            .await
            .map_err(|e| DownloadError::reassembly("sample write", e))?;

        self.samples.push(Sample {
            offset: self.position,
            size: jpeg.len() as u32,
            pts: timestamp,
        });
        self.position += jpeg.len() as u64;
        Ok(())
    }

    async fn finish(&mut self) -> Result<SinkStatus, DownloadError> {
        if self.samples.is_empty() {
            return Ok(SinkStatus::Failed("no frames were appended".to_owned()));
        }

        self.writer
            .flush()
            .await
            .map_err(|e| DownloadError::reassembly("sink finish", e))?;

        // patch the mdat size now that its extent is known
        let mdat_size = (self.position - self.mdat_start) as u32;
        let file = self.writer.get_mut();
        file.seek(SeekFrom::Start(self.mdat_start))
            .await
            .map_err(|e| DownloadError::reassembly("mdat patch", e))?;
        file.write_all(&mdat_size.to_be_bytes())
            .await
            .map_err(|e| DownloadError::reassembly("mdat patch", e))?;
        file.seek(SeekFrom::Start(self.position))
            .await
            .map_err(|e| DownloadError::reassembly("mdat patch", e))?;

        let moov = self.build_moov();
        self.writer
            .write_all(&moov)
            .await
            .map_err(|e| DownloadError::reassembly("moov write", e))?;
        self.writer
            .flush()
            .await
            .map_err(|e| DownloadError::reassembly("sink finish", e))?;
        self.writer
            .get_ref()
            .sync_all()
            .await
            .map_err(|e| DownloadError::reassembly("sink finish", e))?;

        debug!(
            samples = self.samples.len(),
            bytes = self.position + moov.len() as u64,
            "mp4 sink finished"
        );
        Ok(SinkStatus::Completed)
    }
}

impl Mp4FrameSink {
    /// Per-sample durations in timescale units, from the recorded pts
    /// deltas. The last sample reuses the previous delta (one second when
    /// there is a single sample).
    fn sample_deltas(&self) -> Vec<u32> {
        let ts = |d: Duration| d.as_millis() as u64;
        let mut deltas: Vec<u32> = self
            .samples
            .windows(2)
            .map(|pair| (ts(pair[1].pts) - ts(pair[0].pts)) as u32)
            .collect();
        let last = deltas.last().copied().unwrap_or(TIMESCALE);
        deltas.push(last);
        deltas
    }

    fn build_moov(&self) -> BytesMut {
        let deltas = self.sample_deltas();
        let duration: u64 = deltas.iter().map(|&d| d as u64).sum();

        let mvhd = self.build_mvhd(duration);
        let trak = {
            let tkhd = self.build_tkhd(duration);
            let mdia = {
                let mdhd = self.build_mdhd(duration);
                let hdlr = build_hdlr();
                let minf = {
                    let vmhd = full_box(b"vmhd", 0, 1, &{
                        let mut p = BytesMut::new();
                        p.put_u16(0); // graphicsmode
                        p.put_u16(0);
                        p.put_u16(0);
                        p.put_u16(0); // opcolor
                        p
                    });
                    let dinf = {
                        let url = full_box(b"url ", 0, 1, &BytesMut::new());
                        let mut dref_payload = BytesMut::new();
                        dref_payload.put_u32(1);
                        dref_payload.put_slice(&url);
                        let dref = full_box(b"dref", 0, 0, &dref_payload);
                        boxed(b"dinf", &dref)
                    };
                    let stbl = self.build_stbl(&deltas);

                    let mut minf_payload = BytesMut::new();
                    minf_payload.put_slice(&vmhd);
                    minf_payload.put_slice(&dinf);
                    minf_payload.put_slice(&stbl);
                    boxed(b"minf", &minf_payload)
                };

                let mut mdia_payload = BytesMut::new();
                mdia_payload.put_slice(&mdhd);
                mdia_payload.put_slice(&hdlr);
                mdia_payload.put_slice(&minf);
                boxed(b"mdia", &mdia_payload)
            };

            let mut trak_payload = BytesMut::new();
            trak_payload.put_slice(&tkhd);
            trak_payload.put_slice(&mdia);
            boxed(b"trak", &trak_payload)
        };

        let mut moov_payload = BytesMut::new();
        moov_payload.put_slice(&mvhd);
        moov_payload.put_slice(&trak);
        boxed(b"moov", &moov_payload)
    }

    fn build_mvhd(&self, duration: u64) -> BytesMut {
        let mut p = BytesMut::new();
        p.put_u32(0); // creation_time
        p.put_u32(0); // modification_time
        p.put_u32(TIMESCALE);
        p.put_u32(duration as u32);
        p.put_u32(0x0001_0000); // rate 1.0
        p.put_u16(0x0100); // volume 1.0
        p.put_u16(0);
        p.put_u64(0); // reserved
        for value in MATRIX_IDENTITY {
            p.put_u32(value);
        }
        for _ in 0..6 {
            p.put_u32(0); // pre_defined
        }
        p.put_u32(2); // next_track_id
        full_box(b"mvhd", 0, 0, &p)
    }

    fn build_tkhd(&self, duration: u64) -> BytesMut {
        let mut p = BytesMut::new();
        p.put_u32(0); // creation_time
        p.put_u32(0); // modification_time
        p.put_u32(1); // track_id
        p.put_u32(0); // reserved
        p.put_u32(duration as u32);
        p.put_u64(0); // reserved
        p.put_u16(0); // layer
        p.put_u16(0); // alternate_group
        p.put_u16(0); // volume (video track)
        p.put_u16(0);
        for value in MATRIX_IDENTITY {
            p.put_u32(value);
        }
        p.put_u32(self.width << 16); // 16.16 fixed point
        p.put_u32(self.height << 16);
        // flags: track enabled + in movie
        full_box(b"tkhd", 0, 3, &p)
    }

    fn build_mdhd(&self, duration: u64) -> BytesMut {
        let mut p = BytesMut::new();
        p.put_u32(0);
        p.put_u32(0);
        p.put_u32(TIMESCALE);
        p.put_u32(duration as u32);
        p.put_u16(0x55C4); // language: und
        p.put_u16(0);
        full_box(b"mdhd", 0, 0, &p)
    }

    fn build_stbl(&self, deltas: &[u32]) -> BytesMut {
        let stsd = {
            let mut entry = BytesMut::new();
            entry.put_slice(&[0u8; 6]); // reserved
            entry.put_u16(1); // data_reference_index
            entry.put_u16(0); // pre_defined
            entry.put_u16(0); // reserved
            for _ in 0..3 {
                entry.put_u32(0); // pre_defined
            }
            entry.put_u16(self.width as u16);
            entry.put_u16(self.height as u16);
            entry.put_u32(0x0048_0000); // 72 dpi horizontal
            entry.put_u32(0x0048_0000); // 72 dpi vertical
            entry.put_u32(0); // reserved
            entry.put_u16(1); // frame_count
            let mut compressor = [0u8; 32];
            compressor[0] = 4;
            compressor[1..5].copy_from_slice(b"jpeg");
            entry.put_slice(&compressor);
            entry.put_u16(24); // depth
            entry.put_i16(-1); // pre_defined
            let sample_entry = boxed(b"jpeg", &entry);

            let mut p = BytesMut::new();
            p.put_u32(1); // entry_count
            p.put_slice(&sample_entry);
            full_box(b"stsd", 0, 0, &p)
        };

        let stts = {
            // run-length encode consecutive equal deltas
            let mut runs: Vec<(u32, u32)> = Vec::new();
            for &delta in deltas {
                match runs.last_mut() {
                    Some((count, value)) if *value == delta => *count += 1,
                    _ => runs.push((1, delta)),
                }
            }
            let mut p = BytesMut::new();
            p.put_u32(runs.len() as u32);
            for (count, delta) in runs {
                p.put_u32(count);
                p.put_u32(delta);
            }
            full_box(b"stts", 0, 0, &p)
        };

        let stsc = {
            // one sample per chunk throughout
            let mut p = BytesMut::new();
            p.put_u32(1);
            p.put_u32(1); // first_chunk
            p.put_u32(1); // samples_per_chunk
            p.put_u32(1); // sample_description_index
            full_box(b"stsc", 0, 0, &p)
        };

        let stsz = {
            let mut p = BytesMut::new();
            p.put_u32(0); // per-sample sizes follow
            p.put_u32(self.samples.len() as u32);
            for sample in &self.samples {
                p.put_u32(sample.size);
            }
            full_box(b"stsz", 0, 0, &p)
        };

        let stco = {
            let mut p = BytesMut::new();
            p.put_u32(self.samples.len() as u32);
            for sample in &self.samples {
                p.put_u32(sample.offset as u32);
            }
            full_box(b"stco", 0, 0, &p)
        };

        let mut stbl_payload = BytesMut::new();
        stbl_payload.put_slice(&stsd);
        stbl_payload.put_slice(&stts);
        stbl_payload.put_slice(&stsc);
        stbl_payload.put_slice(&stsz);
        stbl_payload.put_slice(&stco);
        boxed(b"stbl", &stbl_payload)
    }
}

fn boxed(fourcc: &[u8; 4], payload: &[u8]) -> BytesMut {
    let mut b = BytesMut::with_capacity(payload.len() + 8);
    b.put_u32((payload.len() + 8) as u32);
    b.put_slice(fourcc);
    b.put_slice(payload);
    b
}

fn full_box(fourcc: &[u8; 4], version: u8, flags: u32, payload: &[u8]) -> BytesMut {
    let mut b = BytesMut::with_capacity(payload.len() + 12);
    b.put_u32((payload.len() + 12) as u32);
    b.put_slice(fourcc);
    b.put_u8(version);
    // 24-bit flags
    b.put_slice(&flags.to_be_bytes()[1..]);
    b.put_slice(payload);
    b
}

fn build_hdlr() -> BytesMut {
    let mut p = BytesMut::new();
    p.put_u32(0); // pre_defined
    p.put_slice(b"vide");
    for _ in 0..3 {
        p.put_u32(0); // reserved
    }
    p.put_slice(b"ReelVideoHandler\0");
    full_box(b"hdlr", 0, 0, &p)
}
