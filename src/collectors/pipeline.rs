//! Line filtering applied to collected content.
//!
//! Each line is normalized first, then dropped if it contains any exclude
//! pattern, then kept only if it contains an include pattern (when any are
//! given). Lines keep their original terminators, so content passes through
//! byte-for-byte when nothing matches.
//!
//! Lines are read with a size cap. A longer line is split into chunks of at
//! most [`MAX_LINE_BYTES`] and each chunk is filtered on its own.

use std::borrow::Cow;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::constants::MAX_LINE_BYTES;
use crate::security::ContentNormalizer;

/// Append the next line to `buf`, stopping after `\n` or once `buf` holds
/// `max` bytes. Returns the number of bytes appended; `0` at end of input.
pub async fn read_line_bounded<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max: usize,
) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let start = buf.len();
    while buf.len() - start < max {
        let (used, found_newline) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                break;
            }
            let room = max - (buf.len() - start);
            let window = &available[..available.len().min(room)];
            match window.iter().position(|&b| b == b'\n') {
                Some(i) => {
                    buf.extend_from_slice(&window[..=i]);
                    (i + 1, true)
                }
                None => {
                    buf.extend_from_slice(window);
                    (window.len(), false)
                }
            }
        };
        reader.consume(used);
        if found_newline {
            break;
        }
    }
    Ok(buf.len() - start)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.len() <= haystack.len() && haystack.windows(needle.len()).any(|w| w == needle)
}

fn split_terminator(line: &[u8]) -> (&[u8], &[u8]) {
    let mut end = line.len();
    if line.ends_with(b"\n") {
        end -= 1;
        if line[..end].ends_with(b"\r") {
            end -= 1;
        }
    }
    line.split_at(end)
}

#[derive(Debug, Clone)]
pub struct LineFilter {
    normalizer: Arc<ContentNormalizer>,
    include: Vec<Vec<u8>>,
    exclude: Vec<Vec<u8>>,
}

impl LineFilter {
    pub fn new(normalizer: Arc<ContentNormalizer>, include: &[String], exclude: &[String]) -> Self {
        let bytes = |patterns: &[String]| -> Vec<Vec<u8>> {
            patterns
                .iter()
                .filter(|p| !p.is_empty())
                .map(|p| p.as_bytes().to_vec())
                .collect()
        };
        Self {
            normalizer,
            include: bytes(include),
            exclude: bytes(exclude),
        }
    }

    /// Filter one line (terminator included). `None` drops the line.
    pub fn apply<'a>(&self, line: &'a [u8]) -> Option<Cow<'a, [u8]>> {
        let (body, terminator) = split_terminator(line);
        let normalized = self.normalizer.normalize(body);

        if self.exclude.iter().any(|p| contains(&normalized, p)) {
            return None;
        }
        if !self.include.is_empty() && !self.include.iter().any(|p| contains(&normalized, p)) {
            return None;
        }

        match normalized {
            Cow::Borrowed(_) => Some(Cow::Borrowed(line)),
            Cow::Owned(mut changed) => {
                changed.extend_from_slice(terminator);
                Some(Cow::Owned(changed))
            }
        }
    }

    /// Copy `reader` to `writer` line by line through the filter.
    ///
    /// Returns the number of bytes written.
    pub async fn filter_stream<R, W>(&self, reader: &mut R, writer: &mut W) -> std::io::Result<u64>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut written = 0u64;
        let mut line = Vec::new();
        loop {
            line.clear();
            if read_line_bounded(reader, &mut line, MAX_LINE_BYTES).await? == 0 {
                break;
            }
            if let Some(out) = self.apply(&line) {
                writer.write_all(&out).await?;
                written += out.len() as u64;
            }
        }
        writer.flush().await?;
        Ok(written)
    }
}
