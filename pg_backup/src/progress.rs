//! Observable progress, injected rather than printed directly, so tests can
//! assert on file ordering and byte counts without scraping stderr.

use camino::Utf8Path;

pub trait ProgressSink: Send {
    fn on_file_started(&mut self, _path: &Utf8Path) {}
    fn on_file_finished(&mut self, _path: &Utf8Path, _write_size: i64) {}
    fn on_bytes(&mut self, _n: u64) {}
}

/// The default sink: writes nothing. `BackupOrchestrator` logs through
/// `tracing` regardless of the sink; this trait exists only for structured
/// hooks a caller wants wired up (a progress bar, a test probe), not as the
/// sole source of user-visible output.
pub struct NullProgress;

impl ProgressSink for NullProgress {}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    #[derive(Default)]
    pub struct RecordingProgress {
        pub started: Vec<String>,
        pub finished: Vec<(String, i64)>,
        pub bytes: u64,
    }

    impl ProgressSink for RecordingProgress {
        fn on_file_started(&mut self, path: &Utf8Path) {
            self.started.push(path.to_string());
        }
        fn on_file_finished(&mut self, path: &Utf8Path, write_size: i64) {
            self.finished.push((path.to_string(), write_size));
        }
        fn on_bytes(&mut self, n: u64) {
            self.bytes += n;
        }
    }
}
