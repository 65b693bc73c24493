use bson::{Bson, Document, oid::ObjectId};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod, Runtime};
use parking_lot::Mutex;
use std::collections::HashSet;
use tokio_postgres::NoTls;

use super::translate::build_where_from_filter;
use super::{DocumentSource, next_timestamp, oplog_modifier};
use crate::cursor::CursorDescription;
use crate::doc_id::DocId;
use crate::error::{Error, Result};
use crate::fence::WriteFence;
use crate::fetcher::BoxFuture;
use crate::matcher::{Matcher, Projection, is_modifier, modify};
use crate::oplog::{OplogEntry, OplogHandle};

const SCHEMA: &str = "livedata";

/// Postgres-backed documents: one table per collection with the document as
/// `jsonb` for querying and as raw BSON for lossless reads.
pub struct PgSource {
    pool: Pool,
    oplog: Option<OplogHandle>,
    ensured: Mutex<HashSet<String>>,
}

impl PgSource {
    pub async fn connect(url: &str, max_size: usize, oplog: Option<OplogHandle>) -> Result<Self> {
        let pg_config: tokio_postgres::Config = url.parse().map_err(err_msg)?;
        let manager_config = ManagerConfig { recycling_method: RecyclingMethod::Fast, ..Default::default() };
        let manager = Manager::from_config(pg_config, NoTls, manager_config);
        let pool = Pool::builder(manager)
            .max_size(max_size.max(1))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(err_msg)?;
        let source = Self { pool, oplog, ensured: Mutex::new(HashSet::new()) };
        source.bootstrap().await?;
        Ok(source)
    }

    async fn bootstrap(&self) -> Result<()> {
        let client = self.pool.get().await.map_err(err_msg)?;
        client.batch_execute(&format!("CREATE SCHEMA IF NOT EXISTS {}", q_ident(SCHEMA))).await.map_err(err_msg)?;
        Ok(())
    }

    pub async fn ensure_collection(&self, coll: &str) -> Result<()> {
        if self.ensured.lock().contains(coll) {
            return Ok(());
        }
        let client = self.pool.get().await.map_err(err_msg)?;
        let idx_name = format!("idx_{}_doc_gin", coll);
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {table} (id text PRIMARY KEY, doc jsonb NOT NULL, doc_bson bytea NOT NULL);\nCREATE INDEX IF NOT EXISTS {idx} ON {table} USING GIN (doc jsonb_path_ops)",
            table = table(coll),
            idx = q_ident(&idx_name),
        );
        client.batch_execute(&ddl).await.map_err(err_msg)?;
        self.ensured.lock().insert(coll.to_string());
        Ok(())
    }

    fn publish(&self, entry: OplogEntry, fence: Option<&WriteFence>) {
        if let Some(oplog) = &self.oplog {
            oplog.publish(entry, fence);
        }
    }

    pub async fn insert(&self, coll: &str, mut doc: Document, fence: Option<&WriteFence>) -> Result<DocId> {
        self.ensure_collection(coll).await?;
        if !doc.contains_key("_id") {
            doc.insert("_id", Bson::ObjectId(ObjectId::new()));
        }
        let id = DocId::of(&doc).ok_or_else(|| Error::Msg("unsupported _id type".into()))?;
        let (bytes, json) = encode(&doc)?;
        let client = self.pool.get().await.map_err(err_msg)?;
        let sql = format!("INSERT INTO {} (id, doc_bson, doc) VALUES ($1, $2, $3) ON CONFLICT (id) DO NOTHING", table(coll));
        let n = client.execute(&sql, &[&id.storage_key(), &bytes, &json]).await.map_err(err_msg)?;
        if n == 0 {
            return Err(Error::Msg(format!("duplicate key: {id}")));
        }
        self.publish(OplogEntry::insert(coll, doc, next_timestamp()), fence);
        Ok(id)
    }

    /// Read-modify-write under a row lock. Returns false when the document does not exist.
    pub async fn update(&self, coll: &str, id: &DocId, update: &Document, fence: Option<&WriteFence>) -> Result<bool> {
        self.ensure_collection(coll).await?;
        let mut client = self.pool.get().await.map_err(err_msg)?;
        let tx = client.transaction().await.map_err(err_msg)?;
        let select = format!("SELECT doc_bson, doc FROM {} WHERE id = $1 FOR UPDATE", table(coll));
        let Some(row) = tx.query_opt(&select, &[&id.storage_key()]).await.map_err(err_msg)? else {
            return Ok(false);
        };
        let before = decode_row(&row)?;
        let mut after = before.clone();
        modify(&mut after, update)?;
        let (bytes, json) = encode(&after)?;
        let write = format!("UPDATE {} SET doc_bson = $2, doc = $3 WHERE id = $1", table(coll));
        tx.execute(&write, &[&id.storage_key(), &bytes, &json]).await.map_err(err_msg)?;
        tx.commit().await.map_err(err_msg)?;

        let logged = if is_modifier(update) { oplog_modifier(&before, &after) } else { after };
        if !logged.is_empty() {
            self.publish(OplogEntry::update(coll, id, logged, next_timestamp()), fence);
        }
        Ok(true)
    }

    pub async fn remove(&self, coll: &str, id: &DocId, fence: Option<&WriteFence>) -> Result<bool> {
        self.ensure_collection(coll).await?;
        let client = self.pool.get().await.map_err(err_msg)?;
        let sql = format!("DELETE FROM {} WHERE id = $1", table(coll));
        let n = client.execute(&sql, &[&id.storage_key()]).await.map_err(err_msg)?;
        if n > 0 {
            self.publish(OplogEntry::delete(coll, id, next_timestamp()), fence);
        }
        Ok(n > 0)
    }

    pub async fn drop_collection(&self, coll: &str, fence: Option<&WriteFence>) -> Result<()> {
        let client = self.pool.get().await.map_err(err_msg)?;
        client.batch_execute(&format!("DROP TABLE IF EXISTS {}", table(coll))).await.map_err(err_msg)?;
        self.ensured.lock().remove(coll);
        if let Some(oplog) = &self.oplog {
            oplog.publish_drop_collection(coll, fence);
        }
        Ok(())
    }
}

impl DocumentSource for PgSource {
    fn find<'a>(&'a self, cursor: &'a CursorDescription) -> BoxFuture<'a, Result<Vec<Document>>> {
        Box::pin(async move {
            let matcher = Matcher::compile(&cursor.selector)?;
            let projection = match &cursor.options.fields {
                Some(fields) => Projection::compile(fields)?,
                None => Projection::all(),
            };
            self.ensure_collection(&cursor.collection_name).await?;
            let client = self.pool.get().await.map_err(err_msg)?;
            let where_sql = build_where_from_filter(&cursor.selector);
            let sql = format!("SELECT doc_bson, doc FROM {} WHERE {} ORDER BY id", table(&cursor.collection_name), where_sql);
            tracing::debug!(collection = %cursor.collection_name, sql = %sql, "find");
            let rows = client.query(&sql, &[]).await.map_err(err_msg)?;

            let skip = cursor.options.skip.unwrap_or(0).max(0) as usize;
            let limit = cursor.options.limit.filter(|l| *l > 0).map(|l| l as usize).unwrap_or(usize::MAX);
            let mut out = Vec::new();
            for row in &rows {
                let doc = decode_row(row)?;
                if matcher.document_matches(&doc) {
                    out.push(projection.apply(&doc));
                }
            }
            Ok(out.into_iter().skip(skip).take(limit).collect())
        })
    }

    fn find_one<'a>(&'a self, collection: &'a str, id: &'a DocId) -> BoxFuture<'a, Result<Option<Document>>> {
        Box::pin(async move {
            self.ensure_collection(collection).await?;
            let client = self.pool.get().await.map_err(err_msg)?;
            let sql = format!("SELECT doc_bson, doc FROM {} WHERE id = $1", table(collection));
            let row = client.query_opt(&sql, &[&id.storage_key()]).await.map_err(err_msg)?;
            row.as_ref().map(decode_row).transpose()
        })
    }
}

fn encode(doc: &Document) -> Result<(Vec<u8>, serde_json::Value)> {
    let bytes = bson::to_vec(doc)?;
    let json = Bson::Document(doc.clone()).into_relaxed_extjson();
    Ok((bytes, json))
}

fn decode_row(row: &tokio_postgres::Row) -> Result<Document> {
    let bson_bytes: Option<Vec<u8>> = row.try_get(0).ok();
    if let Some(bytes) = bson_bytes
        && let Ok(doc) = Document::from_reader(&mut std::io::Cursor::new(bytes))
    {
        return Ok(doc);
    }
    let json: serde_json::Value = row.try_get(1).map_err(err_msg)?;
    match Bson::try_from(json).map_err(|e| Error::Bson(e.to_string()))? {
        Bson::Document(d) => Ok(d),
        other => Err(Error::Bson(format!("stored document is not an object: {other}"))),
    }
}

fn table(coll: &str) -> String {
    format!("{}.{}", q_ident(SCHEMA), q_ident(coll))
}

fn q_ident(ident: &str) -> String {
    let escaped = ident.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}

fn err_msg<E: std::fmt::Display>(e: E) -> Error {
    Error::Postgres(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(table("we\"ird"), "\"livedata\".\"we\"\"ird\"");
    }

    #[test]
    fn encode_keeps_bson_and_json_in_sync() {
        let (bytes, json) = encode(&doc! { "_id": "a", "n": 2 }).unwrap();
        let back = Document::from_reader(&mut std::io::Cursor::new(bytes)).unwrap();
        assert_eq!(back, doc! { "_id": "a", "n": 2 });
        assert_eq!(json, serde_json::json!({ "_id": "a", "n": 2 }));
    }
}
