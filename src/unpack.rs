use std::io::Read;
use std::path::{Component, Path, PathBuf};

use crate::observer::FileObserver;

/// Tar members with this suffix are LZMA-compressed tar archives themselves
/// and get decompressed and walked in place of being written out.
const NESTED_SUFFIX: &str = ".ugb";

#[derive(thiserror::Error, Debug, displaydoc::Display)]
pub(crate) enum ArchiveExtractionError {
    /// invalid compressed stream in {0}
    BadCompression(String, #[source] std::io::Error),
    /// malformed tar data in {0}
    BadTarFraming(String, #[source] std::io::Error),
    /// archive entry {0:?} contains a `..` or root segment
    EscapingPath(PathBuf),
    /// filesystem failure on {0:?}
    WriteFailure(PathBuf, #[source] std::io::Error),
}

/// Extracts a gzip-compressed tar archive into `output` and deletes the
/// archive file afterwards; it is an intermediate artifact, not an output.
/// Nested archives are handled transparently at any depth.
#[culpa::throws(ArchiveExtractionError)]
pub(crate) fn extract_ugb(archive: &Path, output: &Path, observer: &mut dyn FileObserver) {
    let compressed = std::fs::read(archive)
        .map_err(|error| ArchiveExtractionError::WriteFailure(archive.to_owned(), error))?;

    let mut outer = Vec::new();
    flate2::read::GzDecoder::new(&compressed[..])
        .read_to_end(&mut outer)
        .map_err(|error| {
            ArchiveExtractionError::BadCompression(archive.display().to_string(), error)
        })?;

    extract_tar(&outer, &archive.display().to_string(), output, observer)?;

    std::fs::remove_file(archive)
        .map_err(|error| ArchiveExtractionError::WriteFailure(archive.to_owned(), error))?;
}

/// Walks an uncompressed tar stream held in memory. Entries named
/// `*.ugb` are decompressed as a single LZMA stream and recursed into;
/// everything else unpacks into `output` keeping its relative path.
#[culpa::throws(ArchiveExtractionError)]
fn extract_tar(data: &[u8], label: &str, output: &Path, observer: &mut dyn FileObserver) {
    let framing = |error| ArchiveExtractionError::BadTarFraming(label.to_owned(), error);

    let mut archive = tar::Archive::new(data);
    let mut entries = archive.entries().map_err(framing)?;
    while let Some(mut entry) = entries.next().transpose().map_err(framing)? {
        let path = entry.path().map_err(framing)?.into_owned();
        if path.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        }) {
            culpa::throw!(ArchiveExtractionError::EscapingPath(path));
        }

        if path.to_string_lossy().ends_with(NESTED_SUFFIX) {
            tracing::debug!("decompressing nested archive {}", path.display());
            let mut nested = Vec::new();
            xz2::read::XzDecoder::new(&mut entry)
                .read_to_end(&mut nested)
                .map_err(|error| {
                    ArchiveExtractionError::BadCompression(path.display().to_string(), error)
                })?;
            extract_tar(&nested, &path.display().to_string(), output, observer)?;
        } else {
            let dst = output.join(&path);
            std::fs::create_dir_all(dst.parent().unwrap_or(output))
                .map_err(|error| ArchiveExtractionError::WriteFailure(dst.clone(), error))?;
            entry
                .unpack(&dst)
                .map_err(|error| ArchiveExtractionError::WriteFailure(dst, error))?;
            observer.on_new_file(output, &path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::Manifest;
    use std::io::Write;

    fn plain_tar(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn gz(data: &[u8]) -> Vec<u8> {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn xz(data: &[u8]) -> Vec<u8> {
        let mut encoder = xz2::write::XzEncoder::new(Vec::new(), 6);
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn extracts_nested_archives_and_removes_the_outer_file() {
        let inner = xz(&plain_tar(&[
            ("bin/app", b"\x7fELF"),
            ("bin/uninstall.sh", b"#!/bin/sh\n"),
        ]));
        let outer = gz(&plain_tar(&[
            ("readme.txt", b"hello"),
            ("payload.ugb", &inner),
        ]));

        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("ugb.ugb");
        std::fs::write(&archive, outer).unwrap();

        let mut seen = Manifest::default();
        extract_ugb(&archive, dir.path(), &mut seen).unwrap();

        let names: Vec<_> = seen.0.iter().map(|p| p.to_str().unwrap()).collect();
        assert_eq!(names, ["readme.txt", "bin/app", "bin/uninstall.sh"]);
        assert!(!archive.exists());
        assert_eq!(
            std::fs::read(dir.path().join("readme.txt")).unwrap(),
            b"hello"
        );
        assert_eq!(
            std::fs::read(dir.path().join("bin/app")).unwrap(),
            b"\x7fELF"
        );
    }

    #[test]
    fn rejects_garbage_instead_of_gzip() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("ugb.ugb");
        std::fs::write(&archive, b"not gzip at all").unwrap();

        let mut seen = Manifest::default();
        assert!(matches!(
            extract_ugb(&archive, dir.path(), &mut seen),
            Err(ArchiveExtractionError::BadCompression(..))
        ));
        assert!(seen.0.is_empty());
        // the outer file only gets cleaned up after a successful run
        assert!(archive.exists());
    }

    #[test]
    fn rejects_nested_member_that_is_not_lzma() {
        let outer = gz(&plain_tar(&[("payload.ugb", b"not an xz stream" as &[u8])]));
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("ugb.ugb");
        std::fs::write(&archive, outer).unwrap();

        let mut seen = Manifest::default();
        assert!(matches!(
            extract_ugb(&archive, dir.path(), &mut seen),
            Err(ArchiveExtractionError::BadCompression(name, _)) if name == "payload.ugb"
        ));
    }

    #[test]
    fn rejects_entries_escaping_the_output_directory() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        // Builder::append_data refuses `..` segments, write the name raw
        header.as_old_mut().name[..7].copy_from_slice(b"../evil");
        header.set_size(1);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, &b"x"[..]).unwrap();
        let outer = gz(&builder.into_inner().unwrap());

        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("ugb.ugb");
        std::fs::write(&archive, outer).unwrap();

        let mut seen = Manifest::default();
        assert!(matches!(
            extract_ugb(&archive, dir.path(), &mut seen),
            Err(ArchiveExtractionError::EscapingPath(path)) if path == Path::new("../evil")
        ));
        assert!(seen.0.is_empty());
    }

    #[test]
    fn doubly_nested_archives_are_walked_recursively() {
        let innermost = xz(&plain_tar(&[("deep.txt", b"bottom" as &[u8])]));
        let middle = xz(&plain_tar(&[("level2.ugb", &innermost)]));
        let outer = gz(&plain_tar(&[("level1.ugb", &middle)]));

        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("ugb.ugb");
        std::fs::write(&archive, outer).unwrap();

        let mut seen = Manifest::default();
        extract_ugb(&archive, dir.path(), &mut seen).unwrap();

        assert_eq!(seen.0, [PathBuf::from("deep.txt")]);
        assert_eq!(
            std::fs::read(dir.path().join("deep.txt")).unwrap(),
            b"bottom"
        );
    }
}
