use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::frame::{DecodedFrame, FrameError, OwnedFrame};
use crate::gate::FrameSink;

pub const DEFAULT_JPEG_QUALITY: u8 = 80;

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("invalid frame: {0}")]
    Frame(#[from] FrameError),
    #[error("frame dimensions {width}x{height} do not fit a JPEG")]
    Dimensions { width: usize, height: usize },
    #[error("failed to encode JPEG: {0}")]
    Encode(#[from] image::ImageError),
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Persists one captured frame.
pub trait FrameWriter: Send + Sync + 'static {
    fn write(&self, frame: OwnedFrame) -> Result<PathBuf, WriteError>;
}

/// Encodes frames as JPEG and replaces the file at a fixed path.
#[derive(Debug, Clone)]
pub struct JpegFileWriter {
    path: PathBuf,
    quality: u8,
}

impl JpegFileWriter {
    pub fn new(path: impl Into<PathBuf>, quality: u8) -> Self {
        Self {
            path: path.into(),
            quality: quality.clamp(1, 100),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn encode(&self, frame: OwnedFrame) -> Result<Vec<u8>, WriteError> {
        let (width, height) = (frame.width, frame.height);
        let dims = u32::try_from(width)
            .ok()
            .zip(u32::try_from(height).ok())
            .filter(|(w, h)| *w <= u16::MAX as u32 && *h <= u16::MAX as u32);
        let Some((w, h)) = dims else {
            return Err(WriteError::Dimensions { width, height });
        };

        let rgb = frame.into_rgb_packed()?;
        let mut jpeg = Vec::with_capacity(rgb.len() / 8);
        JpegEncoder::new_with_quality(&mut jpeg, self.quality).encode(
            &rgb,
            w,
            h,
            ExtendedColorType::Rgb8,
        )?;
        Ok(jpeg)
    }

    /// Writes next to the target and renames over it, so readers only ever see
    /// a complete image.
    fn replace_file(&self, bytes: &[u8]) -> Result<(), WriteError> {
        let io_err = |source: io::Error| WriteError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let mut tmp_name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        tmp_name.push(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
        let tmp_path = self.path.with_file_name(tmp_name);

        let result = File::create(&tmp_path)
            .and_then(|file| {
                let mut out = BufWriter::new(file);
                out.write_all(bytes)?;
                out.into_inner().map_err(|e| e.into_error())?.sync_all()
            })
            .and_then(|()| fs::rename(&tmp_path, &self.path));

        if let Err(e) = result {
            let _ = fs::remove_file(&tmp_path);
            return Err(io_err(e));
        }
        Ok(())
    }
}

impl FrameWriter for JpegFileWriter {
    fn write(&self, frame: OwnedFrame) -> Result<PathBuf, WriteError> {
        let jpeg = self.encode(frame)?;
        self.replace_file(&jpeg)?;
        Ok(self.path.clone())
    }
}

/// Writes on the delivering thread.
pub struct DirectSink<W> {
    writer: W,
}

impl<W: FrameWriter> DirectSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }
}

impl<W: FrameWriter> FrameSink for DirectSink<W> {
    fn accept(&self, frame: &DecodedFrame<'_>) {
        let result = frame
            .to_owned_frame()
            .map_err(WriteError::from)
            .and_then(|owned| self.writer.write(owned));
        log_write_result(result);
    }
}

fn log_write_result(result: Result<PathBuf, WriteError>) {
    match result {
        Ok(path) => info!(path = %path.display(), "frame saved to file"),
        Err(e) => error!(error = %e, "failed to save frame"),
    }
}

#[derive(Debug, Default)]
struct Slot {
    pending: Mutex<Option<OwnedFrame>>,
    closed: AtomicBool,
    notify: Notify,
}

impl Slot {
    fn put(&self, frame: OwnedFrame) -> bool {
        let replaced = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(frame)
            .is_some();
        self.notify.notify_one();
        replaced
    }

    fn take(&self) -> Option<OwnedFrame> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Hands captured frames to a [`WriterTask`] through a single slot.
///
/// A frame that arrives while another is still pending replaces it; the slot
/// never grows into a queue.
#[derive(Debug, Clone)]
pub struct HandoffSink {
    slot: Arc<Slot>,
}

impl FrameSink for HandoffSink {
    fn accept(&self, frame: &DecodedFrame<'_>) {
        if self.slot.closed.load(Ordering::Acquire) {
            debug!("writer closed, dropping frame");
            return;
        }
        match frame.to_owned_frame() {
            Ok(owned) => {
                if self.slot.put(owned) {
                    debug!("replaced pending frame that was not written yet");
                }
            }
            Err(e) => error!(error = %e, "failed to copy frame for writing"),
        }
    }
}

/// Background task that drains a [`HandoffSink`] into a [`FrameWriter`].
pub struct WriterTask {
    slot: Arc<Slot>,
    task: JoinHandle<()>,
}

impl WriterTask {
    pub fn spawn<W: FrameWriter>(writer: W) -> (HandoffSink, WriterTask) {
        let slot = Arc::new(Slot::default());
        let writer = Arc::new(writer);
        let task = tokio::spawn(run_writer(slot.clone(), writer));
        (HandoffSink { slot: slot.clone() }, WriterTask { slot, task })
    }

    /// Stops accepting frames, finishes a pending write and waits for the task.
    pub async fn shutdown(self) {
        self.slot.closed.store(true, Ordering::Release);
        self.slot.notify.notify_one();
        if let Err(e) = self.task.await {
            warn!(error = %e, "writer task ended abnormally");
        }
    }
}

async fn run_writer<W: FrameWriter>(slot: Arc<Slot>, writer: Arc<W>) {
    loop {
        if let Some(frame) = slot.take() {
            let writer = writer.clone();
            match tokio::task::spawn_blocking(move || writer.write(frame)).await {
                Ok(result) => log_write_result(result),
                Err(e) => error!(error = %e, "writer panicked"),
            }
            continue;
        }
        if slot.closed.load(Ordering::Acquire) {
            break;
        }
        slot.notify.notified().await;
    }
    debug!("writer task finished");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;
    use crate::frame::PixelFormat;

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("whep-snapshot-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// 16x16 frame of one BGR colour, with 4 bytes of row padding.
    fn solid_bgr(b: u8, g: u8, r: u8) -> OwnedFrame {
        let (width, height, stride) = (16, 16, 16 * 3 + 4);
        let mut data = vec![0xAB; height * stride];
        for row in data.chunks_exact_mut(stride) {
            for px in row[..width * 3].chunks_exact_mut(3) {
                px.copy_from_slice(&[b, g, r]);
            }
        }
        OwnedFrame {
            data,
            width,
            height,
            stride,
            format: PixelFormat::Bgr24,
        }
    }

    fn close(a: u8, b: u8) -> bool {
        a.abs_diff(b) <= 12
    }

    #[test]
    fn jpeg_writer_stores_rgb_image() {
        let dir = scratch_dir();
        let path = dir.join("frame.jpg");
        let writer = JpegFileWriter::new(&path, DEFAULT_JPEG_QUALITY);

        // pure blue in BGR order
        let written = writer.write(solid_bgr(255, 0, 0)).unwrap();
        assert_eq!(written, path);

        let img = image::open(&path).unwrap().to_rgb8();
        assert_eq!(img.dimensions(), (16, 16));
        let [r, g, b] = img.get_pixel(8, 8).0;
        assert!(close(r, 0) && close(g, 0) && close(b, 255), "{r} {g} {b}");

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn jpeg_writer_overwrites_previous_snapshot() {
        let dir = scratch_dir();
        let path = dir.join("nested").join("frame.jpg");
        let writer = JpegFileWriter::new(&path, DEFAULT_JPEG_QUALITY);

        writer.write(solid_bgr(0, 0, 255)).unwrap();
        writer.write(solid_bgr(0, 255, 0)).unwrap();

        let img = image::open(&path).unwrap().to_rgb8();
        let [r, g, b] = img.get_pixel(3, 3).0;
        assert!(close(r, 0) && close(g, 255) && close(b, 0), "{r} {g} {b}");

        let leftovers = fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn jpeg_writer_reports_io_failure() {
        let dir = scratch_dir();
        let blocker = dir.join("not-a-dir");
        fs::write(&blocker, b"x").unwrap();
        let writer = JpegFileWriter::new(blocker.join("frame.jpg"), DEFAULT_JPEG_QUALITY);

        let err = writer.write(solid_bgr(1, 2, 3)).unwrap_err();
        assert!(matches!(err, WriteError::Io { .. }), "{err}");
        fs::remove_dir_all(dir).unwrap();
    }

    struct SlowWriter {
        written: Arc<Mutex<Vec<u8>>>,
        started: Arc<AtomicUsize>,
        delay: Duration,
    }

    impl FrameWriter for SlowWriter {
        fn write(&self, frame: OwnedFrame) -> Result<PathBuf, WriteError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            self.written.lock().unwrap().push(frame.data[0]);
            Ok(PathBuf::from("memory"))
        }
    }

    fn tagged(tag: u8) -> Vec<u8> {
        vec![tag; 12]
    }

    fn view(data: &[u8]) -> DecodedFrame<'_> {
        DecodedFrame {
            data,
            width: 2,
            height: 2,
            stride: 6,
            format: PixelFormat::Bgr24,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn handoff_replaces_pending_frame_while_busy() {
        let written = Arc::new(Mutex::new(Vec::new()));
        let started = Arc::new(AtomicUsize::new(0));
        let (sink, task) = WriterTask::spawn(SlowWriter {
            written: written.clone(),
            started: started.clone(),
            delay: Duration::from_millis(200),
        });

        sink.accept(&view(&tagged(1)));
        while started.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // writer is busy with frame 1; 2 and 3 compete for the single slot
        sink.accept(&view(&tagged(2)));
        sink.accept(&view(&tagged(3)));

        task.shutdown().await;
        assert_eq!(*written.lock().unwrap(), vec![1, 3]);
    }

    #[tokio::test]
    async fn closed_handoff_drops_frames() {
        let written = Arc::new(Mutex::new(Vec::new()));
        let (sink, task) = WriterTask::spawn(SlowWriter {
            written: written.clone(),
            started: Arc::new(AtomicUsize::new(0)),
            delay: Duration::ZERO,
        });
        task.shutdown().await;

        sink.accept(&view(&tagged(9)));
        assert!(written.lock().unwrap().is_empty());
    }

    #[test]
    fn direct_sink_writes_inline() {
        let written = Arc::new(Mutex::new(Vec::new()));
        let sink = DirectSink::new(SlowWriter {
            written: written.clone(),
            started: Arc::new(AtomicUsize::new(0)),
            delay: Duration::ZERO,
        });
        sink.accept(&view(&tagged(4)));
        assert_eq!(*written.lock().unwrap(), vec![4]);
    }
}
