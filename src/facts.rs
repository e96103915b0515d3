//! Tab-separated `.facts` dumps of pass internals.
//!
//! Each relation goes to `<dir>/<relation>.facts`, one tuple per line with no
//! header, which is the layout Datalog engines read.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Path of `relation`'s fact file in `dir`.
pub fn facts_path(dir: &Path, relation: &str) -> PathBuf {
    dir.join(format!("{}.facts", relation))
}

/// Write `rows` as relation `relation`. Returns the number of rows written.
pub fn write_facts<R, I>(dir: &Path, relation: &str, rows: I) -> anyhow::Result<usize>
where
    R: Serialize,
    I: IntoIterator<Item = R>,
{
    let path = facts_path(dir, relation);
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .from_path(&path)
        .with_context(|| format!("creating {}", path.display()))?;

    let mut count = 0;
    for row in rows {
        writer
            .serialize(row)
            .with_context(|| format!("writing {}", path.display()))?;
        count += 1;
    }
    writer.flush()?;
    log::debug!("Wrote {} tuples to {}", count, path.display());
    Ok(count)
}

/// Read back a relation written by [`write_facts`].
pub fn read_facts<R: DeserializeOwned>(dir: &Path, relation: &str) -> anyhow::Result<Vec<R>> {
    let path = facts_path(dir, relation);
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .from_path(&path)
        .with_context(|| format!("opening {}", path.display()))?;

    reader
        .deserialize()
        .collect::<Result<Vec<R>, _>>()
        .with_context(|| format!("reading {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let rows = vec![(4096u64, 1u8, "push".to_string()), (4097, 3, "mov".to_string())];

        assert_eq!(write_facts(dir.path(), "instruction", &rows).unwrap(), 2);
        let text = std::fs::read_to_string(facts_path(dir.path(), "instruction")).unwrap();
        assert_eq!(text, "4096\t1\tpush\n4097\t3\tmov\n");

        let back: Vec<(u64, u8, String)> = read_facts(dir.path(), "instruction").unwrap();
        assert_eq!(back, rows);
    }

    #[test]
    fn test_missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(write_facts(&missing, "x", [(1u64,)]).is_err());
    }
}
