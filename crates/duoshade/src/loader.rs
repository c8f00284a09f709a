use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Result};
use compositor::{LoadResult, LoadedImage, TextureLoader};
use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, warn};

/// Decodes texture references on worker threads.
///
/// References resolve against the configured roots in order; absolute paths
/// are used as given. Completed loads wait in a channel until the owning
/// surface drains them at the start of its next tick.
pub struct ThreadedLoader {
    jobs: Option<Sender<String>>,
    results: Receiver<LoadResult>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadedLoader {
    pub fn spawn(label: &str, roots: Vec<PathBuf>, workers: usize) -> Result<Self> {
        let (job_tx, job_rx) = unbounded::<String>();
        let (result_tx, result_rx) = unbounded();
        let mut handles = Vec::with_capacity(workers.max(1));
        for worker in 0..workers.max(1) {
            let jobs = job_rx.clone();
            let results = result_tx.clone();
            let roots = roots.clone();
            let handle = thread::Builder::new()
                .name(format!("duoshade-{label}-loader-{worker}"))
                .spawn(move || run_worker(&roots, jobs, results))
                .map_err(|err| anyhow!("failed to spawn texture loader thread: {err}"))?;
            handles.push(handle);
        }
        Ok(Self {
            jobs: Some(job_tx),
            results: result_rx,
            workers: handles,
        })
    }
}

impl TextureLoader for ThreadedLoader {
    fn request(&mut self, reference: &str) {
        let Some(jobs) = &self.jobs else {
            return;
        };
        if jobs.send(reference.to_string()).is_err() {
            warn!(reference, "texture loader stopped; request dropped");
        }
    }

    fn drain(&mut self) -> Vec<LoadResult> {
        self.results.try_iter().collect()
    }
}

impl Drop for ThreadedLoader {
    fn drop(&mut self) {
        // Closing the job queue ends every worker loop.
        self.jobs.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn run_worker(roots: &[PathBuf], jobs: Receiver<String>, results: Sender<LoadResult>) {
    for reference in jobs.iter() {
        let image = resolve(roots, &reference)
            .ok_or_else(|| format!("no texture named '{reference}' in the search roots"))
            .and_then(|path| {
                debug!(reference, path = %path.display(), "decoding texture");
                LoadedImage::open(&path).map_err(|err| format!("{err:#}"))
            });
        if results.send(LoadResult { reference, image }).is_err() {
            break;
        }
    }
}

fn resolve(roots: &[PathBuf], reference: &str) -> Option<PathBuf> {
    let direct = Path::new(reference);
    if direct.is_absolute() {
        return direct.is_file().then(|| direct.to_path_buf());
    }
    roots
        .iter()
        .map(|root| root.join(reference))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;

    fn wait_for(loader: &mut ThreadedLoader, count: usize) -> Vec<LoadResult> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut results = Vec::new();
        while results.len() < count && Instant::now() < deadline {
            results.extend(loader.drain());
            thread::sleep(Duration::from_millis(5));
        }
        results
    }

    #[test]
    fn resolves_references_against_roots_in_order() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        std::fs::write(second.path().join("noise.png"), b"").unwrap();
        let roots = vec![first.path().to_path_buf(), second.path().to_path_buf()];

        assert_eq!(
            resolve(&roots, "noise.png"),
            Some(second.path().join("noise.png"))
        );
        assert_eq!(resolve(&roots, "missing.png"), None);
    }

    #[test]
    fn loads_complete_off_thread() {
        let dir = tempfile::tempdir().unwrap();
        image::RgbaImage::from_pixel(2, 2, image::Rgba([40, 50, 60, 255]))
            .save(dir.path().join("dot.png"))
            .unwrap();
        let mut loader = ThreadedLoader::spawn("test", vec![dir.path().to_path_buf()], 2).unwrap();

        loader.request("dot.png");
        loader.request("absent.png");
        let mut results = wait_for(&mut loader, 2);
        results.sort_by(|a, b| a.reference.cmp(&b.reference));

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].reference, "absent.png");
        assert!(results[0].image.is_err());
        let image = results[1].image.as_ref().unwrap();
        assert_eq!((image.width, image.height), (2, 2));
        assert_eq!(image.pixel(1, 1), [40, 50, 60, 255]);
    }
}
