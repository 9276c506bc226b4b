use std::path::Path;

/// Capability invoked once for every file the pipeline writes, both the
/// top-level record files and members of extracted archives. `name` is
/// relative to `dir`.
pub(crate) trait FileObserver {
    fn on_new_file(&mut self, dir: &Path, name: &Path);
}

/// Default observer, only reports what was extracted.
pub(crate) struct LogObserver;

impl FileObserver for LogObserver {
    fn on_new_file(&mut self, dir: &Path, name: &Path) {
        tracing::info!("extracted {}", dir.join(name).display());
    }
}

#[cfg(test)]
pub(crate) use self::tests::Manifest;
