//! Shard Persistence
//!
//! One shard of a partition: an append-only JSON-lines log replayed at
//! open into an in-memory document map (ordered by document id, which is
//! time order) plus per-field token dictionaries.

use crate::store::document::{value_tokens, Document};
use crate::store::StoreError;
use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

pub struct Shard {
    path: PathBuf,
    docs: BTreeMap<String, Document>,
    /// field -> token -> occurrence count
    dict: HashMap<String, BTreeMap<String, u64>>,
    /// field -> number of documents carrying it
    field_docs: HashMap<String, u64>,
    writer: BufWriter<File>,
}

impl Shard {
    /// Open a shard file, creating it when missing, and replay its log.
    /// Unreadable lines are skipped with a warning rather than failing
    /// the whole partition.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let mut docs = BTreeMap::new();
        let mut dict: HashMap<String, BTreeMap<String, u64>> = HashMap::new();
        let mut field_docs: HashMap<String, u64> = HashMap::new();

        if path.exists() {
            let reader = BufReader::new(File::open(path)?);
            for (lineno, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Document>(&line) {
                    Ok(doc) => {
                        index_maps(&doc, &mut dict, &mut field_docs);
                        docs.insert(doc.id.clone(), doc);
                    }
                    Err(e) => {
                        tracing::warn!(
                            "skipping corrupt document at {}:{}: {}",
                            path.display(),
                            lineno + 1,
                            e
                        );
                    }
                }
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            docs,
            dict,
            field_docs,
            writer: BufWriter::new(file),
        })
    }

    /// Append documents to the log and the in-memory maps, preserving
    /// input order on disk.
    pub fn index(&mut self, docs: Vec<Document>) -> Result<(), StoreError> {
        for doc in docs {
            let line = serde_json::to_string(&doc)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            self.writer.write_all(line.as_bytes())?;
            self.writer.write_all(b"\n")?;
            index_maps(&doc, &mut self.dict, &mut self.field_docs);
            self.docs.insert(doc.id.clone(), doc);
        }
        self.writer.flush()?;
        Ok(())
    }

    /// Flush buffered writes and sync the log to disk.
    pub fn close(&mut self) -> Result<(), StoreError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }

    pub fn doc_count(&self) -> u64 {
        self.docs.len() as u64
    }

    pub fn docs(&self) -> impl Iterator<Item = &Document> {
        self.docs.values()
    }

    pub fn fields(&self) -> impl Iterator<Item = &String> {
        self.field_docs.keys()
    }

    pub fn dict(&self, field: &str) -> Option<&BTreeMap<String, u64>> {
        self.dict.get(field)
    }
}

fn index_maps(
    doc: &Document,
    dict: &mut HashMap<String, BTreeMap<String, u64>>,
    field_docs: &mut HashMap<String, u64>,
) {
    for (field, value) in &doc.fields {
        *field_docs.entry(field.clone()).or_insert(0) += 1;
        let terms = dict.entry(field.clone()).or_default();
        for token in value_tokens(value) {
            *terms.entry(token).or_insert(0) += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FieldValue;
    use tempfile::tempdir;

    fn doc(id: &str, message: &str) -> Document {
        let mut fields = HashMap::new();
        fields.insert("message".to_string(), FieldValue::Text(message.to_string()));
        Document::new(id, fields)
    }

    #[test]
    fn test_index_and_replay() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shard-000.log");

        {
            let mut shard = Shard::open(&path).unwrap();
            shard
                .index(vec![doc("a", "hello world"), doc("b", "hello again")])
                .unwrap();
            shard.close().unwrap();
            assert_eq!(shard.doc_count(), 2);
        }

        let shard = Shard::open(&path).unwrap();
        assert_eq!(shard.doc_count(), 2);
        assert_eq!(shard.dict("message").unwrap().get("hello"), Some(&2));
        assert_eq!(shard.dict("message").unwrap().get("world"), Some(&1));
    }

    #[test]
    fn test_docs_iterate_in_id_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shard-000.log");
        let mut shard = Shard::open(&path).unwrap();
        shard
            .index(vec![doc("b", "second"), doc("a", "first")])
            .unwrap();

        let ids: Vec<&str> = shard.docs().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_corrupt_line_is_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shard-000.log");
        {
            let mut shard = Shard::open(&path).unwrap();
            shard.index(vec![doc("a", "ok")]).unwrap();
            shard.close().unwrap();
        }
        std::fs::write(
            &path,
            format!(
                "{}\nnot json at all\n",
                std::fs::read_to_string(&path).unwrap().trim_end()
            ),
        )
        .unwrap();

        let shard = Shard::open(&path).unwrap();
        assert_eq!(shard.doc_count(), 1);
    }
}
