// File: src/line_database.rs
//
// Loading and lookup of localized dialogue lines and their metadata.
// The compiler emits one CSV of line text and one of metadata per module;
// both are keyed by line id, and the id is the join key the runner uses
// when a RUN_LINE instruction arrives.

use crate::errors::DialogueError;
use ahash::AHashMap;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::mem::size_of;
use std::path::Path;
use std::time::{Duration, Instant};

/// Metadata columns before the variable-width tag list begin.
const TAGS_COLUMN_INDEX: usize = 3;

/// One localized line of dialogue.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LineRecord {
    pub id: String,
    pub text: String,
    pub file: String,
    pub node: String,
    #[serde(rename = "lineNumber")]
    pub line_number: u32,
}

impl LineRecord {
    pub fn size_bytes(&self) -> u64 {
        (self.id.len()
            + self.text.len()
            + self.file.len()
            + self.node.len()
            + 4 * size_of::<String>()
            + size_of::<u32>()) as u64
    }
}

/// In-memory line and metadata storage for one loaded module.
#[derive(Debug, Default)]
pub struct LineDatabase {
    pub lines: AHashMap<String, LineRecord>,
    pub tags: AHashMap<String, HashSet<String>>,
    parse_time: Duration,
}

impl LineDatabase {
    pub fn new() -> LineDatabase {
        LineDatabase::default()
    }

    /// Load both CSV files for a module.
    pub fn load(
        &mut self,
        lines_path: impl AsRef<Path>,
        metadata_path: impl AsRef<Path>,
    ) -> Result<(), DialogueError> {
        self.load_lines(lines_path)?;
        self.load_metadata(metadata_path)
    }

    pub fn load_lines(&mut self, path: impl AsRef<Path>) -> Result<(), DialogueError> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| DialogueError::io(format!("cannot read lines {}: {}", path.display(), e)))?;
        self.read_lines(file)
    }

    pub fn load_metadata(&mut self, path: impl AsRef<Path>) -> Result<(), DialogueError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            DialogueError::io(format!("cannot read metadata {}: {}", path.display(), e))
        })?;
        self.read_metadata(file)
    }

    /// Parse line records from any CSV source with columns
    /// `id,text,file,node,lineNumber`.
    pub fn read_lines<R: Read>(&mut self, source: R) -> Result<(), DialogueError> {
        let start = Instant::now();

        let mut reader = csv::Reader::from_reader(source);
        for row in reader.deserialize::<LineRecord>() {
            let record = row?;
            self.lines.insert(record.id.clone(), record);
        }

        self.parse_time += start.elapsed();
        Ok(())
    }

    /// Parse metadata from any CSV source. Rows are variable-width;
    /// everything from the fourth column onward is a tag.
    pub fn read_metadata<R: Read>(&mut self, source: R) -> Result<(), DialogueError> {
        let start = Instant::now();

        let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(source);
        for row in reader.records() {
            let row = row?;
            let Some(id) = row.get(0) else { continue };

            let tags = self.tags.entry(id.to_string()).or_default();
            for tag in row.iter().skip(TAGS_COLUMN_INDEX) {
                if !tag.is_empty() {
                    tags.insert(tag.to_string());
                }
            }
        }

        self.parse_time += start.elapsed();
        Ok(())
    }

    pub fn line(&self, id: &str) -> Option<&LineRecord> {
        self.lines.get(id)
    }

    pub fn tags_for(&self, id: &str) -> Option<&HashSet<String>> {
        self.tags.get(id)
    }

    pub fn line_count(&self) -> u64 {
        self.lines.len() as u64
    }

    /// Rough in-memory footprint of the loaded line data.
    pub fn size_bytes(&self) -> u64 {
        self.lines
            .iter()
            .map(|(id, record)| record.size_bytes() + id.len() as u64 + 1)
            .sum()
    }

    /// Cumulative time spent parsing CSV input.
    pub fn parse_time(&self) -> Duration {
        self.parse_time
    }
}

#[cfg(test)]
mod tests {
    use super::LineDatabase;

    const LINES_CSV: &str = "\
id,text,file,node,lineNumber
line:intro.1,Hello there!,intro.yarn,Start,3
line:intro.2,\"Fine, thanks.\",intro.yarn,Start,5
";

    const METADATA_CSV: &str = "\
id,node,lineNumber,tags
line:intro.1,Start,3,sarcastic
line:intro.2,Start,5,quiet,tired
";

    #[test]
    fn test_read_lines_keys_by_id() {
        let mut db = LineDatabase::new();
        db.read_lines(LINES_CSV.as_bytes()).unwrap();

        assert_eq!(db.line_count(), 2);
        let record = db.line("line:intro.2").unwrap();
        assert_eq!(record.text, "Fine, thanks.");
        assert_eq!(record.node, "Start");
        assert_eq!(record.line_number, 5);
        assert!(db.line("line:missing").is_none());
    }

    #[test]
    fn test_read_metadata_collects_variable_width_tags() {
        let mut db = LineDatabase::new();
        db.read_metadata(METADATA_CSV.as_bytes()).unwrap();

        let tags = db.tags_for("line:intro.2").unwrap();
        assert!(tags.contains("quiet"));
        assert!(tags.contains("tired"));
        assert_eq!(db.tags_for("line:intro.1").unwrap().len(), 1);
    }

    #[test]
    fn test_size_accounting_is_nonzero_after_load() {
        let mut db = LineDatabase::new();
        db.read_lines(LINES_CSV.as_bytes()).unwrap();
        assert!(db.size_bytes() > 0);
    }
}
