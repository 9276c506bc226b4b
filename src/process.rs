use anyhow::{Context, Error};
use base64::{engine::general_purpose::STANDARD, Engine};
use std::path::Path;

use crate::container::{Record, RecordTag};
use crate::observer::FileObserver;
use crate::unpack;

/// Routes each container record to disk and onward processing: every
/// payload lands in `<output>/<tag>.<tag>`, nested archives get unpacked
/// into the same directory.
pub(crate) struct Dispatcher<'a, O> {
    output: &'a Path,
    observer: O,
    seen: Vec<RecordTag>,
}

impl<'a, O: FileObserver> Dispatcher<'a, O> {
    pub(crate) fn new(output: &'a Path, observer: O) -> Self {
        Self {
            output,
            observer,
            seen: Vec::new(),
        }
    }

    #[culpa::throws]
    #[fn_error_context::context("processing {} record ({}b)", record.tag, record.payload.len())]
    pub(crate) fn dispatch(&mut self, record: &Record<'_>) {
        tracing::info!("upk record {} {}b", record.tag, record.payload.len());

        // Records sharing a tag share an output filename; the last one wins,
        // same as the original tool.
        if self.seen.contains(&record.tag) {
            tracing::warn!(
                "duplicate {} record overwrites the previously written one",
                record.tag
            );
        } else {
            self.seen.push(record.tag);
        }

        let name = format!("{0}.{0}", record.tag);
        let out_fn = self.output.join(&name);
        std::fs::write(&out_fn, record.payload)
            .with_context(|| format!("writing {}", out_fn.display()))?;
        self.observer.on_new_file(self.output, Path::new(&name));

        match record.tag {
            RecordTag::PUBLIC_KEY => {
                tracing::debug!("this is a public key");
                match STANDARD.decode(record.payload.trim_ascii()) {
                    Ok(decoded) => {
                        tracing::debug!("decoded key: {}", String::from_utf8_lossy(&decoded));
                    }
                    Err(error) => tracing::warn!(%error, "public key is not valid base64"),
                }
            }
            RecordTag::ICON => tracing::debug!("this is an image"),
            RecordTag::NESTED_ARCHIVE => {
                unpack::extract_ugb(&out_fn, self.output, &mut self.observer)?;
            }
            _ => tracing::debug!("unknown tag, payload left as written"),
        }
    }
}
