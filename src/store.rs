//! The metadata store boundary (spec §6, "Store interface").
//!
//! Modeled as a trait rather than a concrete SQL client, mirroring how the
//! teacher keeps `indexing/store.rs`'s SQLite schema and queries behind a
//! narrow `IndexStore` surface that the rest of `indexing/` never bypasses
//! directly (design note, spec §9: "dynamic dispatch -> trait sum types").
//! The core never parses the graph-statement language it sends through this
//! trait; it only assembles templated fragments (`StoreStatement`).

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum TypedValue {
    Integer(i64),
    Text(String),
    Boolean(bool),
    Date(String),
}

pub type Row = Vec<TypedValue>;

#[derive(Debug)]
pub enum StoreError {
    Io(String),
    Corruption(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Io(msg) => write!(f, "store I/O error: {msg}"),
            StoreError::Corruption(msg) => write!(f, "store row corruption: {msg}"),
        }
    }
}
impl std::error::Error for StoreError {}

/// Required external collaborator (spec §1, §6). The core only ever
/// concatenates templated text into these calls; it never interprets the
/// query language itself.
#[async_trait::async_trait(?Send)]
pub trait Store {
    async fn query(&self, text: &str) -> Result<Vec<Row>, StoreError>;
    async fn update_array(&self, texts: &[String]) -> Result<Vec<Result<(), StoreError>>, StoreError>;
    async fn update(&self, text: &str) -> Result<(), StoreError> {
        let results = self.update_array(std::slice::from_ref(&text.to_string())).await?;
        results.into_iter().next().unwrap_or(Ok(()))
    }
}

/// Templated builder for the graph-statement fragments the core sends to
/// the store (spec §9, "store query text assembly -> templated builder").
/// Kept deliberately close to the diff logic in `file_notifier` and
/// `miner` rather than shared as generic string utilities.
#[derive(Default)]
pub struct StoreStatement {
    parts: Vec<String>,
}

impl StoreStatement {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delete_subject(mut self, iri: &str) -> Self {
        self.parts.push(format!("DELETE {{ <{iri}> ?p ?o }} WHERE {{ <{iri}> ?p ?o }}"));
        self
    }

    pub fn insert_triple(mut self, subject: &str, predicate: &str, object_literal: &str) -> Self {
        self.parts
            .push(format!("INSERT {{ <{subject}> {predicate} {} }}", escape_literal(object_literal)));
        self
    }

    pub fn rename(mut self, iri: &str, new_filename: &str, new_uri: &str) -> Self {
        self.parts.push(format!(
            "DELETE {{ <{iri}> nie:isStoredAs ?old }} INSERT {{ <{iri}> nie:isStoredAs <{new_uri}> }} WHERE {{ <{iri}> nie:isStoredAs ?old }}"
        ));
        self.parts
            .push(format!("DELETE {{ <{iri}> nfo:fileName ?n }} INSERT {{ <{iri}> nfo:fileName {} }} WHERE {{ <{iri}> nfo:fileName ?n }}", escape_literal(new_filename)));
        self
    }

    pub fn build(self) -> String {
        self.parts.join("\n")
    }
}

/// Escapes a value for use inside a double-quoted graph-statement string
/// literal (spec §6: "string/date literal escaping"). Beyond `\` and `"`,
/// raw control characters must be escaped too: a literal newline/carriage
/// return/tab cannot appear unescaped inside a `"..."` string, and callers
/// like `rename()` (store.rs below) feed real filesystem basenames through
/// here, which may legally contain any of the three.
fn escape_literal(value: &str) -> String {
    format!(
        "\"{}\"",
        value
            .replace('\\', "\\\\")
            .replace('"', "\\\"")
            .replace('\n', "\\n")
            .replace('\r', "\\r")
            .replace('\t', "\\t")
    )
}
