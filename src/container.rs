//! Reader for the UPK container format: a fixed magic prefix followed by
//! records of the form `tag ':' decimal-length ':' payload`.

use memchr::memchr;

pub(crate) const MAGIC: &[u8] = b"UGREEN-PKG-FORMAT";

const DELIMITER: u8 = b':';
const TAG_LEN: usize = 3;

#[derive(thiserror::Error, Clone, Debug, displaydoc::Display)]
pub(crate) enum HeaderError {
    /// file is {0} bytes, too short to hold the UPK magic
    TooShort(usize),
    /// file does not start with the UPK magic
    BadMagic,
}

#[derive(thiserror::Error, Clone, Debug, displaydoc::Display)]
pub(crate) enum RecordFormatError {
    /// record tag is {0} bytes, tags are exactly 3 bytes
    InvalidTagLength(usize),
    /// record length field {0:?} is not an unsigned decimal integer
    InvalidLength(String),
    /// record declares a {declared} byte payload but only {remaining} bytes remain
    TruncatedPayload { declared: usize, remaining: usize },
}

/// Three byte identifier naming what a record's payload is.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct RecordTag([u8; TAG_LEN]);

impl RecordTag {
    /// Base64-encoded package signing key.
    pub(crate) const PUBLIC_KEY: Self = Self(*b"pub");
    /// Raw image bytes (a PNG in observed packages).
    pub(crate) const ICON: Self = Self(*b"ico");
    /// Gzip-compressed tar archive holding the package contents.
    pub(crate) const NESTED_ARCHIVE: Self = Self(*b"ugb");
}

impl std::fmt::Display for RecordTag {
    #[culpa::throws(std::fmt::Error)]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) {
        f.pad(&String::from_utf8_lossy(&self.0))?;
    }
}

/// One tagged record, borrowed from the container buffer.
#[derive(Debug)]
pub(crate) struct Record<'a> {
    pub(crate) tag: RecordTag,
    pub(crate) payload: &'a [u8],
}

/// Owns the whole package file plus a cursor that only moves forward.
/// Records are materialized lazily, one per `next_record` call.
pub(crate) struct Container {
    data: Vec<u8>,
    offset: usize,
}

impl Container {
    #[culpa::throws(HeaderError)]
    pub(crate) fn new(data: Vec<u8>) -> Self {
        if data.len() <= MAGIC.len() {
            culpa::throw!(HeaderError::TooShort(data.len()));
        }
        if &data[..MAGIC.len()] != MAGIC {
            culpa::throw!(HeaderError::BadMagic);
        }
        Self {
            data,
            offset: MAGIC.len(),
        }
    }

    /// Returns the bytes before the next `:` and leaves the cursor past the
    /// delimiter. Without a remaining delimiter the rest of the buffer is
    /// consumed.
    fn read_field(&mut self) -> &[u8] {
        let rest = &self.data[self.offset..];
        match memchr(DELIMITER, rest) {
            Some(i) => {
                self.offset += i + 1;
                &rest[..i]
            }
            None => {
                self.offset = self.data.len();
                rest
            }
        }
    }

    /// Reads the next record in file order, or `None` once the buffer is
    /// exhausted. After an error the cursor position is unreliable and the
    /// container must not be read further.
    #[culpa::throws(RecordFormatError)]
    pub(crate) fn next_record(&mut self) -> Option<Record<'_>> {
        if self.offset >= self.data.len() {
            tracing::debug!("end of stream");
            return None;
        }

        let field = self.read_field();
        let tag = RecordTag(
            field
                .try_into()
                .map_err(|_| RecordFormatError::InvalidTagLength(field.len()))?,
        );

        let field = self.read_field();
        let declared = parse_length(field).ok_or_else(|| {
            RecordFormatError::InvalidLength(String::from_utf8_lossy(field).into_owned())
        })?;

        // The original tool trusted the declared length and would happily
        // slice past the end of the buffer; check it against what is left.
        let remaining = self.data.len() - self.offset;
        if declared > remaining {
            culpa::throw!(RecordFormatError::TruncatedPayload {
                declared,
                remaining
            });
        }

        let start = self.offset;
        self.offset += declared;
        Some(Record {
            tag,
            payload: &self.data[start..start + declared],
        })
    }
}

/// Base-10 ASCII digits only, no sign, no whitespace.
fn parse_length(field: &[u8]) -> Option<usize> {
    if field.is_empty() || !field.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(field).ok()?.parse().ok()
}
