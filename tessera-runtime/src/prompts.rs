//! Start-id files: one comma-separated prompt per line

use std::fs;
use std::io::ErrorKind as IoErrorKind;
use std::path::Path;

use tessera::{Error, Result};
use tracing::{info, warn};

/// Right-padded prompts ready for the `input_ids` / `input_lengths` keys.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StartIds {
    /// `[batch][max_input_len]`, padded with `end_id`.
    pub ids: Vec<i32>,
    pub lengths: Vec<i32>,
    pub max_input_len: usize,
}

impl StartIds {
    /// No prompts: the request runs unconditionally.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.max_input_len == 0
    }

    /// Parse start ids from CSV text.
    ///
    /// # Errors
    /// `InvalidConfig` if a field is not an integer.
    pub fn parse(text: &str, batch_size: usize, end_id: u32) -> Result<Self> {
        let mut rows = Vec::new();
        for (line_no, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let row = line
                .split(',')
                .map(|field| {
                    field.trim().parse::<i32>().map_err(|e| {
                        Error::InvalidConfig(format!(
                            "start ids line {}: '{field}': {e}",
                            line_no + 1
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            rows.push(row);
        }
        if rows.len() > batch_size {
            warn!(
                prompts = rows.len(),
                batch_size, "more prompts than batch entries, extra lines ignored"
            );
            rows.truncate(batch_size);
        }

        let max_input_len = rows.iter().map(Vec::len).max().unwrap_or(0);
        if max_input_len == 0 {
            return Ok(Self::default());
        }
        #[allow(clippy::cast_possible_wrap)]
        let pad = end_id as i32;
        let mut ids = Vec::with_capacity(batch_size * max_input_len);
        let mut lengths = Vec::with_capacity(batch_size);
        for row in &rows {
            ids.extend_from_slice(row);
            ids.resize(ids.len() + max_input_len - row.len(), pad);
            lengths.push(to_i32(row.len())?);
        }
        for _ in rows.len()..batch_size {
            ids.resize(ids.len() + max_input_len, pad);
            lengths.push(to_i32(max_input_len)?);
        }
        Ok(Self {
            ids,
            lengths,
            max_input_len,
        })
    }
}

/// Read a start-id file.
///
/// A missing file is not an error: it yields empty start ids, and the
/// request falls back to unconditional generation.
///
/// # Errors
/// `Io` if the file exists but cannot be read, `InvalidConfig` on a
/// malformed line.
pub fn load_start_ids(path: impl AsRef<Path>, batch_size: usize, end_id: u32) -> Result<StartIds> {
    let path = path.as_ref();
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == IoErrorKind::NotFound => {
            warn!(path = %path.display(), "cannot open start ids file, generating unconditionally");
            return Ok(StartIds::default());
        }
        Err(e) => return Err(e.into()),
    };
    let start_ids = StartIds::parse(&text, batch_size, end_id)?;
    info!(
        path = %path.display(),
        max_input_len = start_ids.max_input_len,
        "loaded start ids"
    );
    Ok(start_ids)
}

fn to_i32(n: usize) -> Result<i32> {
    i32::try_from(n).map_err(|_| Error::InvalidConfig(format!("prompt length {n} exceeds i32")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pads_short_prompts_and_fills_batch() {
        let ids = StartIds::parse("1,2,3\n4\n", 3, 9).unwrap();
        assert_eq!(ids.max_input_len, 3);
        assert_eq!(ids.ids, vec![1, 2, 3, 4, 9, 9, 9, 9, 9]);
        assert_eq!(ids.lengths, vec![3, 1, 3]);
    }

    #[test]
    fn test_blank_lines_and_spaces() {
        let ids = StartIds::parse("\n 5, 6 \n\n", 1, 0).unwrap();
        assert_eq!(ids.ids, vec![5, 6]);
        assert_eq!(ids.lengths, vec![2]);
    }

    #[test]
    fn test_extra_lines_truncated() {
        let ids = StartIds::parse("1\n2,3\n", 1, 0).unwrap();
        assert_eq!(ids.ids, vec![1]);
        assert_eq!(ids.max_input_len, 1);
    }

    #[test]
    fn test_malformed_field() {
        let err = StartIds::parse("1,x\n", 1, 0).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_missing_file_is_unconditional() {
        let ids = load_start_ids("/nonexistent/start_ids.csv", 4, 0).unwrap();
        assert!(ids.is_empty());
        assert!(ids.ids.is_empty());
    }

    #[test]
    fn test_empty_text() {
        assert!(StartIds::parse("\n\n", 2, 0).unwrap().is_empty());
    }
}
