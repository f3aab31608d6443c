//! Master log schema - the authoritative, ordered column set
//!
//! Every destination table carries a subset of these columns, always in the
//! order they are declared here. That order drives INSERT column lists and
//! the deterministic schema fingerprint, so it must never be shuffled;
//! new columns go at the end.

use sha2::{Digest, Sha256};

/// SQL type of a master-schema column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Integer,
    Boolean,
    Datetime,
}

impl ColumnType {
    pub fn sql(self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::Integer => "INTEGER",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Datetime => "DATETIME",
        }
    }
}

/// One column declaration: name, SQL type, optional constraint clause, and
/// whether the table gets an `idx_<name>` index for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub ty: ColumnType,
    pub constraints: Option<&'static str>,
    pub indexed: bool,
}

impl Column {
    const fn new(name: &'static str, ty: ColumnType) -> Self {
        Self {
            name,
            ty,
            constraints: None,
            indexed: false,
        }
    }

    const fn primary_key(mut self) -> Self {
        self.constraints = Some("PRIMARY KEY");
        self
    }

    const fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    /// `"name" TYPE [constraints]` as used in CREATE TABLE / ADD COLUMN.
    pub fn definition(&self) -> String {
        match self.constraints {
            Some(constraints) => format!("\"{}\" {} {}", self.name, self.ty.sql(), constraints),
            None => format!("\"{}\" {}", self.name, self.ty.sql()),
        }
    }

    /// Name of the index created for an `indexed` column.
    pub fn index_name(&self) -> String {
        format!("idx_{}", self.name)
    }
}

use ColumnType::{Boolean, Datetime, Integer, Text};

/// The full master schema, in authoritative order.
pub static MASTER_SCHEMA: &[Column] = &[
    // Identifiers
    Column::new("logId", Text).primary_key(),
    Column::new("rayId", Text).indexed(),
    Column::new("fpID", Text).indexed(),
    Column::new("deviceHash", Text),
    Column::new("connectionHash", Text).indexed(),
    Column::new("tlsHash", Text),
    // Timing
    Column::new("requestTime", Integer),
    Column::new("receivedAt", Datetime).indexed(),
    Column::new("processedAt", Datetime),
    Column::new("processingDurationMs", Integer),
    Column::new("clientTcpRtt", Integer),
    // Sampling buckets
    Column::new("sample10", Integer),
    Column::new("sample100", Integer),
    // Request
    Column::new("url", Text),
    Column::new("urlHost", Text),
    Column::new("urlPathname", Text),
    Column::new("urlSearch", Text),
    Column::new("method", Text),
    Column::new("headers", Text),
    Column::new("body", Text),
    Column::new("bodyTruncated", Boolean),
    Column::new("bodySize", Integer),
    Column::new("mime", Text),
    Column::new("userAgent", Text),
    Column::new("referer", Text),
    // Client and session cookies
    Column::new("cId", Text),
    Column::new("sId", Text),
    Column::new("eId", Text),
    Column::new("uID", Text),
    Column::new("emID", Text),
    Column::new("emA", Text),
    // Edge annotations
    Column::new("asn", Integer),
    Column::new("colo", Text),
    Column::new("continent", Text),
    Column::new("country", Text),
    Column::new("region", Text),
    Column::new("regionCode", Text),
    Column::new("city", Text),
    Column::new("postalCode", Text),
    Column::new("latitude", Text),
    Column::new("longitude", Text),
    Column::new("timezone", Text),
    Column::new("httpProtocol", Text),
    Column::new("tlsCipher", Text),
    Column::new("tlsVersion", Text),
    Column::new("tlsClientRandom", Text),
    Column::new("tlsClientAuth", Text),
    Column::new("ja3", Text),
    Column::new("threatScore", Integer),
    Column::new("verifiedBot", Boolean),
    Column::new("botScore", Integer),
    Column::new("corporateProxy", Boolean),
    // Derived
    Column::new("deviceType", Text),
    Column::new("geoId", Text).indexed(),
    // Snapshots
    Column::new("environment", Text),
    Column::new("data", Text),
];

/// Look up a master-schema column by name.
pub fn column(name: &str) -> Option<&'static Column> {
    MASTER_SCHEMA.iter().find(|c| c.name == name)
}

/// Build the subset of the master schema named by `names`, preserving master
/// order. Returns the first unknown name on failure.
pub fn subset(names: &[String]) -> Result<Vec<Column>, String> {
    for name in names {
        if column(name).is_none() {
            return Err(name.clone());
        }
    }
    Ok(MASTER_SCHEMA
        .iter()
        .filter(|c| names.iter().any(|n| n == c.name))
        .cloned()
        .collect())
}

/// Deterministic 16-character fingerprint of an ordered column set.
///
/// Hashes the ordered (name, type, constraints, indexed) tuples with
/// SHA-256 and renders the first 8 bytes as hex. Identical ordered schemas
/// hash identically on every platform; any change to a column's declaration
/// or to the order changes the fingerprint.
pub fn schema_hash(schema: &[Column]) -> String {
    let mut hasher = Sha256::new();
    for col in schema {
        hasher.update(col.name.as_bytes());
        hasher.update([0u8]);
        hasher.update(col.ty.sql().as_bytes());
        hasher.update([0u8]);
        hasher.update(col.constraints.unwrap_or("").as_bytes());
        hasher.update([0u8]);
        hasher.update([col.indexed as u8]);
    }
    let digest = hasher.finalize();
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}
