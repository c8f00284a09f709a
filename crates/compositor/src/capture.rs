use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

/// Raw RGBA8 pixels of one presented frame, rows top to bottom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedFrame {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

/// Downstream consumer of captured frames (network output, recorder).
pub trait FrameSink {
    fn name(&self) -> &str;

    fn deliver(&mut self, frame: &CapturedFrame) -> Result<()>;
}

/// Sinks registered on a surface; frames are only read back while any exist.
#[derive(Default)]
pub struct SinkRegistry {
    sinks: Vec<Box<dyn FrameSink>>,
}

impl SinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, sink: Box<dyn FrameSink>) {
        info!(sink = sink.name(), "registered frame sink");
        self.sinks.push(sink);
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        let before = self.sinks.len();
        self.sinks.retain(|sink| sink.name() != name);
        before != self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Hands `frame` to every sink; a failing sink is logged and kept.
    pub fn deliver(&mut self, frame: &CapturedFrame) {
        for sink in &mut self.sinks {
            if let Err(err) = sink.deliver(frame) {
                warn!(sink = sink.name(), error = %err, "frame sink failed");
            }
        }
    }
}

/// Writes every `every`-th frame to `<dir>/frame-<n>.png`.
pub struct PngSnapshotSink {
    dir: PathBuf,
    every: u64,
    seen: u64,
    written: u64,
}

impl PngSnapshotSink {
    pub fn new(dir: impl Into<PathBuf>, every: u64) -> Self {
        Self {
            dir: dir.into(),
            every: every.max(1),
            seen: 0,
            written: 0,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

impl FrameSink for PngSnapshotSink {
    fn name(&self) -> &str {
        "png-snapshot"
    }

    fn deliver(&mut self, frame: &CapturedFrame) -> Result<()> {
        let index = self.seen;
        self.seen += 1;
        if index % self.every != 0 {
            return Ok(());
        }
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        let path = self.dir.join(format!("frame-{index:06}.png"));
        let image = image::RgbaImage::from_raw(frame.width, frame.height, frame.rgba.clone())
            .context("captured frame has an invalid buffer length")?;
        image
            .save(&path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        self.written += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;

    impl FrameSink for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn deliver(&mut self, _frame: &CapturedFrame) -> Result<()> {
            anyhow::bail!("disconnected")
        }
    }

    #[test]
    fn png_sink_writes_every_nth_frame() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut sink = PngSnapshotSink::new(dir.path().join("shots"), 2);
        let frame = CapturedFrame {
            width: 2,
            height: 2,
            rgba: vec![255; 16],
        };

        for _ in 0..5 {
            sink.deliver(&frame).expect("deliver");
        }

        assert_eq!(sink.written(), 3);
        assert!(dir.path().join("shots/frame-000004.png").exists());
        assert!(!dir.path().join("shots/frame-000001.png").exists());
    }

    #[test]
    fn failing_sink_does_not_stop_delivery() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut registry = SinkRegistry::new();
        registry.register(Box::new(Failing));
        registry.register(Box::new(PngSnapshotSink::new(dir.path(), 1)));

        registry.deliver(&CapturedFrame {
            width: 1,
            height: 1,
            rgba: vec![0, 0, 0, 255],
        });

        assert!(dir.path().join("frame-000000.png").exists());
        assert!(registry.unregister("failing"));
        assert_eq!(registry.len(), 1);
    }
}
