//! Producer / worker / writer pipeline
//!
//! Every per-file stage (pack, diff, merge) runs through [`run`]:
//!
//! 1. A producer thread feeds tasks into a bounded queue in the order given
//! 2. `threads` workers each pull one task at a time and compute a result
//! 3. The calling thread consumes results in completion order and is the
//!    only place output offsets are assigned
//!
//! The first error from any stage cancels the rest of the pipeline and is
//! returned to the caller.

use crate::digest::Digest;
use crate::entry::{EntryType, FileEntry};
use crate::error::ImageError;
use crate::Result;
use crossbeam_channel::bounded;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tracing::{debug, warn};

/// Shared failure state of one pipeline run
struct Failure {
    cancelled: AtomicBool,
    first: Mutex<Option<ImageError>>,
}

impl Failure {
    fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            first: Mutex::new(None),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn record(&self, err: ImageError) {
        self.cancelled.store(true, Ordering::Release);
        let mut first = self.first.lock();
        if first.is_none() {
            *first = Some(err);
        } else {
            debug!("suppressed follow-up error: {}", err);
        }
    }
}

/// Run `work` over `tasks` on `threads` workers, feeding results to `write`
///
/// Returns the number of results written.
pub(crate) fn run<T, R, F, W>(
    stage: &str,
    threads: usize,
    tasks: Vec<T>,
    work: F,
    mut write: W,
) -> Result<usize>
where
    T: Send,
    R: Send,
    F: Fn(T) -> Result<R> + Sync,
    W: FnMut(R) -> Result<()>,
{
    let total = tasks.len();
    if total == 0 {
        return Ok(0);
    }
    let threads = threads.clamp(1, total);
    debug!("{}: {} tasks on {} workers", stage, total, threads);

    let failure = Failure::new();
    let (task_tx, task_rx) = bounded::<T>(threads * 2);
    let (done_tx, done_rx) = bounded::<R>(threads * 2);
    let mut written = 0usize;

    thread::scope(|s| {
        let failure = &failure;
        let work = &work;

        s.spawn(move || {
            for task in tasks {
                if failure.is_cancelled() || task_tx.send(task).is_err() {
                    break;
                }
            }
        });

        for _ in 0..threads {
            let rx = task_rx.clone();
            let tx = done_tx.clone();
            s.spawn(move || {
                for task in rx.iter() {
                    if failure.is_cancelled() {
                        break;
                    }
                    match work(task) {
                        Ok(result) => {
                            if tx.send(result).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("{}: worker failed: {}", stage, e);
                            failure.record(e);
                            break;
                        }
                    }
                }
            });
        }
        drop(task_rx);
        drop(done_tx);

        for result in done_rx.iter() {
            if failure.is_cancelled() {
                break;
            }
            if let Err(e) = write(result) {
                failure.record(e);
                break;
            }
            written += 1;
        }
        // Unblock workers still sending
        drop(done_rx);
    });

    if let Some(err) = failure.first.into_inner() {
        return Err(err);
    }
    if written != total {
        return Err(ImageError::Cancelled);
    }
    Ok(written)
}

/// Result of one per-file task, ready to be placed in the output blob
#[derive(Debug)]
pub(crate) struct FileOutput {
    /// Tree path of the entry to stamp
    pub path: String,
    pub entry_type: EntryType,
    /// Stored bytes; empty for `file_same`
    pub body: Vec<u8>,
    pub uncompressed_gz: bool,
    pub plugin: String,
    /// Content digest, when the task computed one
    pub digest: Option<Digest>,
}

impl FileOutput {
    pub fn new(path: String, entry_type: EntryType, body: Vec<u8>) -> Self {
        Self {
            path,
            entry_type,
            body,
            uncompressed_gz: false,
            plugin: String::new(),
            digest: None,
        }
    }
}

/// Single owner of an output blob under construction
#[derive(Debug, Default)]
pub(crate) struct BlobWriter {
    blob: Vec<u8>,
}

impl BlobWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a result and stamp its entry in `tree`
    pub fn write(&mut self, tree: &mut FileEntry, out: FileOutput) -> Result<()> {
        let entry = tree.lookup_mut(&out.path)?;
        entry.entry_type = out.entry_type;
        entry.uncompressed_gz = out.uncompressed_gz;
        entry.plugin = out.plugin;
        if out.digest.is_some() {
            entry.digest = out.digest;
        }
        if out.body.is_empty() && !entry.has_body() {
            entry.offset = 0;
            entry.compressed_size = 0;
            return Ok(());
        }
        entry.offset = self.blob.len() as u64;
        entry.compressed_size = out.body.len() as u64;
        self.blob.extend_from_slice(&out.body);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.blob.len()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.blob
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_results_written() -> Result<()> {
        let mut sum = 0u64;
        let n = run("test", 4, (1..=100u64).collect(), |x| Ok(x * 2), |r| {
            sum += r;
            Ok(())
        })?;
        assert_eq!(n, 100);
        assert_eq!(sum, 10100);
        Ok(())
    }

    #[test]
    fn test_worker_error_aborts() {
        let res = run(
            "test",
            3,
            (0..1000u32).collect(),
            |x| {
                if x == 17 {
                    Err(ImageError::inconsistent("x", "boom"))
                } else {
                    Ok(x)
                }
            },
            |_| Ok(()),
        );
        assert!(matches!(res, Err(ImageError::InconsistentTree { .. })));
    }

    #[test]
    fn test_writer_error_aborts() {
        let res = run("test", 2, (0..1000u32).collect(), Ok, |x| {
            if x == 3 {
                Err(ImageError::NotFound("3".into()))
            } else {
                Ok(())
            }
        });
        assert!(matches!(res, Err(ImageError::NotFound(_))));
    }

    #[test]
    fn test_empty_task_list() -> Result<()> {
        let n = run("test", 4, Vec::<u8>::new(), Ok, |_| Ok(()))?;
        assert_eq!(n, 0);
        Ok(())
    }

    #[test]
    fn test_blob_writer_assigns_disjoint_offsets() -> Result<()> {
        let mut tree = FileEntry::root();
        for name in ["a", "b", "c"] {
            tree.childs
                .insert(name.into(), FileEntry::new(name, EntryType::FileNew));
        }
        let mut writer = BlobWriter::new();
        writer.write(&mut tree, FileOutput::new("b".into(), EntryType::FileNew, vec![1; 4]))?;
        writer.write(&mut tree, FileOutput::new("a".into(), EntryType::FileSame, Vec::new()))?;
        writer.write(&mut tree, FileOutput::new("c".into(), EntryType::FileDiff, vec![2; 3]))?;

        let b = tree.lookup("b")?;
        let c = tree.lookup("c")?;
        assert_eq!((b.offset, b.compressed_size), (0, 4));
        assert_eq!((c.offset, c.compressed_size), (4, 3));
        assert_eq!(tree.lookup("a")?.compressed_size, 0);
        assert_eq!(writer.len(), 7);
        Ok(())
    }
}
