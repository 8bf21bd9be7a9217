//! SQLite Engine
//!
//! File-backed storage. All collections share one `documents` table holding
//! JSON text; declared indexes become expression indexes over `json_extract`
//! so queries compiled from the same expressions can use them.
//!
//! Each transaction runs on its own connection (`BEGIN IMMEDIATE`), so its
//! writes stay invisible to other connections until commit.

use async_trait::async_trait;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use super::eval::{self, ComputedKeys};
use crate::domain::{
    CollectionSpec, Condition, CountOptions, DeleteOptions, Document, EngineHandle,
    EngineTransaction, EventBus, FindOptions, GetOptions, IndexDeclaration, IndexKey, Instance,
    PutOptions, Query, StorageEngine, StoreEvent,
};
use crate::error::{Result, StorageError};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS documents (
        collection TEXT NOT NULL,
        id TEXT NOT NULL,
        doc TEXT NOT NULL,
        PRIMARY KEY (collection, id)
    ) WITHOUT ROWID;

    CREATE TABLE IF NOT EXISTS collections (
        name TEXT PRIMARY KEY
    );
";

fn connect(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    debug!("Opened SQLite connection to {:?} (journal_mode={})", path, mode);
    Ok(conn)
}

// ═══════════════════════════════════════════════════════════════════════════
// Expression Compilation
// ═══════════════════════════════════════════════════════════════════════════

fn sql_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

fn sql_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `json_extract` over a dotted property path
fn path_expression(path: &str) -> Result<String> {
    if path.is_empty() || path.contains('"') {
        return Err(StorageError::validation(format!(
            "Invalid property path '{}'",
            path
        )));
    }
    let json_path: String = path
        .split('.')
        .map(|segment| format!(".\"{}\"", segment))
        .collect();
    Ok(format!("json_extract(doc, {})", sql_literal(&format!("${}", json_path))))
}

/// SQL expression of an index key
///
/// A membership key is `1` when the class list contains the member and
/// `NULL` otherwise. `json_extract` returns arrays as minified JSON text, so
/// the JSON-encoded member is searched as a substring.
fn key_expression(key: &IndexKey) -> Result<String> {
    match key {
        IndexKey::Property(path) => path_expression(path),
        IndexKey::Membership { field, member, .. } => {
            let needle = serde_json::to_string(member)?;
            Ok(format!(
                "CASE WHEN instr({}, {}) > 0 THEN 1 END",
                path_expression(field)?,
                sql_literal(&needle)
            ))
        }
    }
}

fn property_expression(property: &str, computed: &ComputedKeys) -> Result<String> {
    match computed.get(property) {
        Some(key) => key_expression(key),
        None => path_expression(property),
    }
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        Value::Number(number) => match number.as_i64() {
            Some(integer) => SqlValue::Integer(integer),
            None => SqlValue::Real(number.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(text) => SqlValue::Text(text.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

/// Range comparisons only hold between values of the same JSON type
fn type_guard(expression: &str, operand: &Value) -> String {
    match operand {
        Value::Number(_) => format!("typeof({}) IN ('integer', 'real')", expression),
        Value::String(_) => format!("typeof({}) = 'text'", expression),
        Value::Bool(_) => format!("typeof({}) = 'integer'", expression),
        _ => "0".to_string(),
    }
}

fn range_sql(
    expression: &str,
    operator: &str,
    operand: &Value,
    params: &mut Vec<SqlValue>,
) -> String {
    params.push(to_sql(operand));
    format!(
        "({} {} ? AND {})",
        expression,
        operator,
        type_guard(expression, operand)
    )
}

fn condition_sql(expression: &str, condition: &Condition, params: &mut Vec<SqlValue>) -> String {
    match condition {
        Condition::Eq(Value::Null) => format!("{} IS NULL", expression),
        Condition::Ne(Value::Null) => format!("{} IS NOT NULL", expression),
        Condition::Eq(value) => {
            params.push(to_sql(value));
            format!("{} = ?", expression)
        }
        Condition::Ne(value) => {
            params.push(to_sql(value));
            format!("{} IS NOT ?", expression)
        }
        Condition::Gt(operand) => range_sql(expression, ">", operand, params),
        Condition::Gte(operand) => range_sql(expression, ">=", operand, params),
        Condition::Lt(operand) => range_sql(expression, "<", operand, params),
        Condition::Lte(operand) => range_sql(expression, "<=", operand, params),
        Condition::In(candidates) => {
            let mut alternatives = Vec::new();
            let values: Vec<&Value> = candidates.iter().filter(|v| !v.is_null()).collect();
            if !values.is_empty() {
                params.extend(values.iter().map(|v| to_sql(v)));
                alternatives.push(format!(
                    "{} IN ({})",
                    expression,
                    vec!["?"; values.len()].join(", ")
                ));
            }
            if candidates.iter().any(Value::is_null) {
                alternatives.push(format!("{} IS NULL", expression));
            }
            if alternatives.is_empty() {
                return "0".to_string();
            }
            format!("({})", alternatives.join(" OR "))
        }
    }
}

fn compile_filter(
    collection: &str,
    query: &Query,
    computed: &ComputedKeys,
    params: &mut Vec<SqlValue>,
) -> Result<Vec<String>> {
    params.push(SqlValue::Text(collection.to_string()));
    let mut clauses = vec!["collection = ?".to_string()];
    for (property, condition) in query.iter() {
        let expression = property_expression(property, computed)?;
        clauses.push(condition_sql(&expression, condition, params));
    }
    Ok(clauses)
}

/// Row-value bound over the leading order expressions
fn compile_bound(
    clauses: &mut Vec<String>,
    params: &mut Vec<SqlValue>,
    order: &[String],
    bound: Option<&[Value]>,
    operator: &str,
) {
    let Some(bound) = bound else {
        return;
    };
    let width = bound.len().min(order.len());
    if width == 0 {
        // An empty prefix compares equal to every tuple
        if operator == ">" || operator == "<" {
            clauses.push("0".to_string());
        }
        return;
    }
    params.extend(bound[..width].iter().map(to_sql));
    clauses.push(format!(
        "({}) {} ({})",
        order[..width].join(", "),
        operator,
        vec!["?"; width].join(", ")
    ));
}

struct Compiled {
    sql: String,
    params: Vec<SqlValue>,
}

fn compile_select(
    collection: &str,
    options: &FindOptions,
    computed: &ComputedKeys,
    columns: &str,
) -> Result<Compiled> {
    let mut params = Vec::new();
    let mut clauses = compile_filter(collection, &options.query, computed, &mut params)?;

    let order = options
        .order
        .iter()
        .map(|property| property_expression(property, computed))
        .collect::<Result<Vec<_>>>()?;
    compile_bound(&mut clauses, &mut params, &order, options.start.as_deref(), ">=");
    compile_bound(&mut clauses, &mut params, &order, options.start_after.as_deref(), ">");
    compile_bound(&mut clauses, &mut params, &order, options.end.as_deref(), "<=");
    compile_bound(&mut clauses, &mut params, &order, options.end_before.as_deref(), "<");

    let direction = if options.reverse { "DESC" } else { "ASC" };
    let ordering = order
        .iter()
        .map(String::as_str)
        .chain(std::iter::once("id"))
        .map(|expression| format!("{} {}", expression, direction))
        .collect::<Vec<_>>()
        .join(", ");
    let limit = options
        .limit
        .map_or(-1, |limit| i64::try_from(limit).unwrap_or(i64::MAX));

    let sql = format!(
        "SELECT {} FROM documents WHERE {} ORDER BY {} LIMIT {} OFFSET {}",
        columns,
        clauses.join(" AND "),
        ordering,
        limit,
        options.offset.unwrap_or(0)
    );
    Ok(Compiled { sql, params })
}

fn index_statement(collection: &str, index: &IndexDeclaration) -> Result<(String, String)> {
    let name = format!("{}/{}", collection, index.name);
    let expressions = index
        .keys
        .iter()
        .map(key_expression)
        .collect::<Result<Vec<_>>>()?;
    let sql = format!(
        "CREATE INDEX IF NOT EXISTS {} ON documents (collection, {})",
        sql_identifier(&name),
        expressions.join(", ")
    );
    Ok((name, sql))
}

// ═══════════════════════════════════════════════════════════════════════════
// Statements (shared by root and transaction connections)
// ═══════════════════════════════════════════════════════════════════════════

fn parse_document(key: String, text: &str) -> Result<Document> {
    match serde_json::from_str(text)? {
        Value::Object(value) => Ok(Document::new(key, value)),
        _ => Err(StorageError::serialization(format!(
            "Document '{}' is not a JSON object",
            key
        ))),
    }
}

fn get_on(conn: &Connection, collection: &str, key: &str) -> Result<Option<Document>> {
    let text: Option<String> = conn
        .query_row(
            "SELECT doc FROM documents WHERE collection = ?1 AND id = ?2",
            params![collection, key],
            |row| row.get(0),
        )
        .optional()?;
    text.map(|text| parse_document(key.to_string(), &text))
        .transpose()
}

fn put_on(
    conn: &Connection,
    collection: &str,
    key: &str,
    value: &Instance,
    options: PutOptions,
) -> Result<()> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM documents WHERE collection = ?1 AND id = ?2",
            params![collection, key],
            |_| Ok(()),
        )
        .optional()?
        .is_some();
    options.check(exists, collection, key)?;

    conn.execute(
        "INSERT OR REPLACE INTO documents (collection, id, doc) VALUES (?1, ?2, ?3)",
        params![collection, key, serde_json::to_string(value)?],
    )?;
    Ok(())
}

fn delete_on(
    conn: &Connection,
    collection: &str,
    key: &str,
    options: DeleteOptions,
) -> Result<bool> {
    let deleted = conn.execute(
        "DELETE FROM documents WHERE collection = ?1 AND id = ?2",
        params![collection, key],
    )?;
    if deleted == 0 && options.error_if_missing {
        return Err(StorageError::not_found(collection, key));
    }
    Ok(deleted > 0)
}

fn find_on(
    conn: &Connection,
    collection: &str,
    options: &FindOptions,
    computed: &ComputedKeys,
) -> Result<Vec<Document>> {
    let compiled = compile_select(collection, options, computed, "id, doc")?;
    let mut stmt = conn.prepare(&compiled.sql)?;
    let rows = stmt
        .query_map(params_from_iter(compiled.params.iter()), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter()
        .map(|(key, text)| {
            let document = parse_document(key, &text)?;
            Ok(match &options.properties {
                Some(properties) => {
                    Document::new(document.key, eval::project(document.value, properties))
                }
                None => document,
            })
        })
        .collect()
}

fn count_on(
    conn: &Connection,
    collection: &str,
    query: &Query,
    computed: &ComputedKeys,
) -> Result<usize> {
    let mut params = Vec::new();
    let clauses = compile_filter(collection, query, computed, &mut params)?;
    let sql = format!(
        "SELECT COUNT(*) FROM documents WHERE {}",
        clauses.join(" AND ")
    );
    let count: i64 = conn.query_row(&sql, params_from_iter(params.iter()), |row| row.get(0))?;
    Ok(usize::try_from(count).unwrap_or(0))
}

fn find_and_delete_on(
    conn: &Connection,
    collection: &str,
    options: &FindOptions,
    computed: &ComputedKeys,
) -> Result<usize> {
    let compiled = compile_select(collection, options, computed, "id")?;
    let sql = format!(
        "DELETE FROM documents WHERE collection = ? AND id IN ({})",
        compiled.sql
    );
    let params = std::iter::once(SqlValue::Text(collection.to_string())).chain(compiled.params);
    Ok(conn.execute(&sql, params_from_iter(params))?)
}

// ═══════════════════════════════════════════════════════════════════════════
// Root Engine
// ═══════════════════════════════════════════════════════════════════════════

struct SqliteShared {
    path: PathBuf,
    collections: Vec<CollectionSpec>,
    computed: HashMap<String, ComputedKeys>,
    root: Mutex<Option<Connection>>,
    lock: Semaphore,
    /// One writer at a time: waiters suspend here instead of spinning on
    /// the database lock
    writer: Arc<Semaphore>,
}

impl SqliteShared {
    fn with_root<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self
            .root
            .lock()
            .map_err(|_| StorageError::database("SQLite connection lock poisoned"))?;
        let conn = guard
            .as_ref()
            .ok_or_else(|| StorageError::database("SQLite engine is closed"))?;
        f(conn)
    }

    async fn writer(&self) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.writer)
            .acquire_owned()
            .await
            .map_err(|_| StorageError::database("SQLite writer gate closed"))
    }

    /// Run a write on the root connection once no transaction is open
    async fn write_root<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let _writer = self.writer().await?;
        self.with_root(f)
    }

    fn computed(&self, collection: &str) -> &ComputedKeys {
        static EMPTY: OnceLock<ComputedKeys> = OnceLock::new();
        self.computed
            .get(collection)
            .unwrap_or_else(|| EMPTY.get_or_init(ComputedKeys::new))
    }
}

#[derive(Clone)]
pub struct SqliteEngine {
    shared: Arc<SqliteShared>,
}

impl SqliteEngine {
    /// Open (or create) the database file at `path`
    pub fn open(path: impl AsRef<Path>, collections: Vec<CollectionSpec>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = connect(&path)?;
        conn.execute_batch(SCHEMA)?;

        let computed = collections
            .iter()
            .map(|spec| (spec.name.clone(), spec.computed_keys()))
            .collect();

        Ok(Self {
            shared: Arc::new(SqliteShared {
                path,
                collections,
                computed,
                root: Mutex::new(Some(conn)),
                lock: Semaphore::new(1),
                writer: Arc::new(Semaphore::new(1)),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// `EXPLAIN QUERY PLAN` details for a find
    pub fn explain(&self, collection: &str, options: &FindOptions) -> Result<Vec<String>> {
        let compiled = compile_select(collection, options, self.shared.computed(collection), "id")?;
        self.shared.with_root(|conn| {
            let mut stmt = conn.prepare(&format!("EXPLAIN QUERY PLAN {}", compiled.sql))?;
            let details = stmt
                .query_map(params_from_iter(compiled.params.iter()), |row| {
                    row.get::<_, String>(3)
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(details)
        })
    }

    fn migrate(&self, conn: &Connection, spec: &CollectionSpec, events: &EventBus) -> Result<()> {
        let statements = spec
            .indexes
            .iter()
            .map(|index| index_statement(&spec.name, index))
            .collect::<Result<Vec<_>>>()?;

        let known = conn
            .query_row(
                "SELECT 1 FROM collections WHERE name = ?1",
                params![spec.name],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        let mut missing = 0;
        for (name, _) in &statements {
            let exists = conn
                .query_row(
                    "SELECT 1 FROM sqlite_master WHERE type = 'index' AND name = ?1",
                    params![name],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if !exists {
                missing += 1;
            }
        }
        if known && missing == 0 {
            return Ok(());
        }

        events.emit(StoreEvent::WillMigrate {
            collection: spec.name.clone(),
        });
        let tx = conn.unchecked_transaction()?;
        for (_, sql) in &statements {
            tx.execute(sql, [])?;
        }
        tx.execute(
            "INSERT OR IGNORE INTO collections (name) VALUES (?1)",
            params![spec.name],
        )?;
        tx.commit()?;
        debug!(
            "Migrated collection '{}' ({} indexes created)",
            spec.name, missing
        );
        events.emit(StoreEvent::DidMigrate {
            collection: spec.name.clone(),
        });
        Ok(())
    }
}

#[async_trait]
impl EngineHandle for SqliteEngine {
    async fn get(
        &self,
        collection: &str,
        key: &str,
        options: GetOptions,
    ) -> Result<Option<Document>> {
        let document = self.shared.with_root(|conn| get_on(conn, collection, key))?;
        if document.is_none() && options.error_if_missing {
            return Err(StorageError::not_found(collection, key));
        }
        Ok(document)
    }

    async fn put(
        &self,
        collection: &str,
        key: &str,
        value: Instance,
        options: PutOptions,
    ) -> Result<()> {
        self.shared
            .write_root(|conn| {
                let tx = conn.unchecked_transaction()?;
                put_on(&tx, collection, key, &value, options)?;
                tx.commit()?;
                Ok(())
            })
            .await
    }

    async fn delete(&self, collection: &str, key: &str, options: DeleteOptions) -> Result<bool> {
        self.shared
            .write_root(|conn| delete_on(conn, collection, key, options))
            .await
    }

    async fn find(&self, collection: &str, options: &FindOptions) -> Result<Vec<Document>> {
        let computed = self.shared.computed(collection);
        self.shared
            .with_root(|conn| find_on(conn, collection, options, computed))
    }

    async fn count(&self, collection: &str, options: &CountOptions) -> Result<usize> {
        let computed = self.shared.computed(collection);
        self.shared
            .with_root(|conn| count_on(conn, collection, &options.query, computed))
    }

    async fn find_and_delete(&self, collection: &str, options: &FindOptions) -> Result<usize> {
        let computed = self.shared.computed(collection);
        self.shared
            .write_root(|conn| find_and_delete_on(conn, collection, options, computed))
            .await
    }
}

#[async_trait]
impl StorageEngine for SqliteEngine {
    fn as_handle(&self) -> &dyn EngineHandle {
        self
    }

    async fn initialize(&self, events: &EventBus) -> Result<()> {
        self.shared
            .write_root(|conn| {
                conn.execute_batch(SCHEMA)?;
                for spec in &self.shared.collections {
                    self.migrate(conn, spec, events)?;
                }
                Ok(())
            })
            .await
    }

    async fn destroy_all(&self) -> Result<()> {
        self.shared
            .write_root(|conn| {
                conn.execute_batch(
                    "DROP TABLE IF EXISTS documents;
                     DROP TABLE IF EXISTS collections;",
                )?;
                Ok(())
            })
            .await?;
        info!("Destroyed SQLite data in {:?}", self.shared.path);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let conn = self
            .shared
            .root
            .lock()
            .map_err(|_| StorageError::database("SQLite connection lock poisoned"))?
            .take();
        if let Some(conn) = conn {
            conn.close().map_err(|(_, err)| StorageError::from(err))?;
        }
        Ok(())
    }

    async fn lock(&self) -> Result<()> {
        self.shared
            .lock
            .acquire()
            .await
            .map_err(|_| StorageError::database("SQLite engine lock closed"))?
            .forget();
        Ok(())
    }

    async fn unlock(&self) -> Result<()> {
        if self.shared.lock.available_permits() == 0 {
            self.shared.lock.add_permits(1);
        }
        Ok(())
    }

    async fn begin(&self) -> Result<Arc<dyn EngineTransaction>> {
        self.shared.with_root(|_| Ok(()))?;
        let writer = self.shared.writer().await?;
        let conn = connect(&self.shared.path)?;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        debug!("SQLite transaction started");
        Ok(Arc::new(SqliteTransaction {
            shared: Arc::clone(&self.shared),
            open: Mutex::new(Some(OpenTransaction {
                conn,
                _writer: writer,
            })),
        }))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Transactions
// ═══════════════════════════════════════════════════════════════════════════

/// A transaction on a dedicated connection
///
/// Holds the engine's writer permit until it finishes. Dropping it without
/// `commit` closes the connection, which rolls back.
pub struct SqliteTransaction {
    shared: Arc<SqliteShared>,
    open: Mutex<Option<OpenTransaction>>,
}

struct OpenTransaction {
    conn: Connection,
    _writer: OwnedSemaphorePermit,
}

impl SqliteTransaction {
    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self
            .open
            .lock()
            .map_err(|_| StorageError::transaction("Transaction state poisoned"))?;
        let open = guard
            .as_ref()
            .ok_or_else(|| StorageError::transaction("Transaction already finished"))?;
        f(&open.conn)
    }

    fn finish(&self, statement: &str) -> Result<()> {
        let open = self
            .open
            .lock()
            .map_err(|_| StorageError::transaction("Transaction state poisoned"))?
            .take()
            .ok_or_else(|| StorageError::transaction("Transaction already finished"))?;
        open.conn.execute_batch(statement)?;
        debug!("SQLite transaction finished ({})", statement);
        Ok(())
    }
}

#[async_trait]
impl EngineHandle for SqliteTransaction {
    async fn get(
        &self,
        collection: &str,
        key: &str,
        options: GetOptions,
    ) -> Result<Option<Document>> {
        let document = self.with_conn(|conn| get_on(conn, collection, key))?;
        if document.is_none() && options.error_if_missing {
            return Err(StorageError::not_found(collection, key));
        }
        Ok(document)
    }

    async fn put(
        &self,
        collection: &str,
        key: &str,
        value: Instance,
        options: PutOptions,
    ) -> Result<()> {
        self.with_conn(|conn| put_on(conn, collection, key, &value, options))
    }

    async fn delete(&self, collection: &str, key: &str, options: DeleteOptions) -> Result<bool> {
        self.with_conn(|conn| delete_on(conn, collection, key, options))
    }

    async fn find(&self, collection: &str, options: &FindOptions) -> Result<Vec<Document>> {
        let computed = self.shared.computed(collection);
        self.with_conn(|conn| find_on(conn, collection, options, computed))
    }

    async fn count(&self, collection: &str, options: &CountOptions) -> Result<usize> {
        let computed = self.shared.computed(collection);
        self.with_conn(|conn| count_on(conn, collection, &options.query, computed))
    }

    async fn find_and_delete(&self, collection: &str, options: &FindOptions) -> Result<usize> {
        let computed = self.shared.computed(collection);
        self.with_conn(|conn| find_and_delete_on(conn, collection, options, computed))
    }
}

#[async_trait]
impl EngineTransaction for SqliteTransaction {
    fn as_handle(&self) -> &dyn EngineHandle {
        self
    }

    async fn commit(&self) -> Result<()> {
        self.finish("COMMIT")
    }

    async fn rollback(&self) -> Result<()> {
        self.finish("ROLLBACK")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::run_transaction;
    use crate::error::ErrorKind;
    use serde_json::json;
    use tempfile::TempDir;

    fn instance(value: Value) -> Instance {
        value.as_object().cloned().unwrap()
    }

    fn people() -> CollectionSpec {
        let person = IndexKey::Membership {
            name: "Person?".into(),
            field: "_classes".into(),
            member: "Person".into(),
        };
        CollectionSpec::new("people").with_indexes(vec![
            IndexDeclaration {
                name: "Person?".into(),
                keys: vec![person.clone()],
                projection: None,
            },
            IndexDeclaration {
                name: "Person?+age".into(),
                keys: vec![person, IndexKey::Property("age".into())],
                projection: None,
            },
        ])
    }

    fn open(dir: &TempDir) -> SqliteEngine {
        SqliteEngine::open(dir.path().join("store.db"), vec![people()]).unwrap()
    }

    async fn seed(engine: &SqliteEngine) {
        let rows = [
            ("a", json!(["Person"]), json!(40)),
            ("b", json!(["Person"]), json!(25)),
            ("c", json!(["Company"]), json!(10)),
            ("d", json!(["Account", "Person"]), json!(33)),
        ];
        for (key, classes, age) in rows {
            engine
                .put(
                    "people",
                    key,
                    instance(json!({"_classes": classes, "age": age, "name": key})),
                    PutOptions::default(),
                )
                .await
                .unwrap();
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Expression Tests
    // ═══════════════════════════════════════════════════════════════════════

    #[test]
    fn test_path_expression() {
        assert_eq!(
            path_expression("address.city").unwrap(),
            "json_extract(doc, '$.\"address\".\"city\"')"
        );
        assert!(path_expression("bad\"path").is_err());
    }

    #[test]
    fn test_membership_expression_escapes_member() {
        let key = IndexKey::Membership {
            name: "O'Brien?".into(),
            field: "_classes".into(),
            member: "O'Brien".into(),
        };
        assert_eq!(
            key_expression(&key).unwrap(),
            "CASE WHEN instr(json_extract(doc, '$.\"_classes\"'), '\"O''Brien\"') > 0 THEN 1 END"
        );
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Keyed Storage Tests
    // ═══════════════════════════════════════════════════════════════════════

    #[tokio::test]
    async fn test_put_get_delete() {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir);

        engine
            .put("people", "k", instance(json!({"n": 1})), PutOptions::create_only())
            .await
            .unwrap();
        let err = engine
            .put("people", "k", instance(json!({"n": 2})), PutOptions::create_only())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::AlreadyExists);

        let doc = engine.get("people", "k", GetOptions::default()).await.unwrap();
        assert_eq!(doc.unwrap().value, instance(json!({"n": 1})));

        assert!(engine.delete("people", "k", DeleteOptions::default()).await.unwrap());
        let err = engine.get("people", "k", GetOptions::default()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert!(engine
            .get("people", "k", GetOptions::allow_missing())
            .await
            .unwrap()
            .is_none());
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Query Tests
    // ═══════════════════════════════════════════════════════════════════════

    #[tokio::test]
    async fn test_membership_query_order_and_bounds() {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir);
        engine.initialize(&EventBus::new()).await.unwrap();
        seed(&engine).await;

        let members = FindOptions::new()
            .with_query(Query::new().eq("Person?", true))
            .order_by(["age"]);
        let keys = |docs: Vec<Document>| docs.into_iter().map(|d| d.key).collect::<Vec<_>>();

        assert_eq!(keys(engine.find("people", &members).await.unwrap()), vec!["b", "d", "a"]);
        assert_eq!(
            keys(engine.find("people", &members.clone().reversed()).await.unwrap()),
            vec!["a", "d", "b"]
        );
        assert_eq!(
            keys(
                engine
                    .find("people", &members.clone().start_after(vec![json!(25)]))
                    .await
                    .unwrap()
            ),
            vec!["d", "a"]
        );
        assert_eq!(
            keys(engine.find("people", &members.clone().end(vec![json!(33)])).await.unwrap()),
            vec!["b", "d"]
        );
        assert_eq!(
            engine
                .count("people", &CountOptions::from(&members))
                .await
                .unwrap(),
            3
        );

        let projected = engine
            .find("people", &members.clone().with_properties(["name"]).with_limit(1))
            .await
            .unwrap();
        assert_eq!(projected[0].value, instance(json!({"name": "b"})));
    }

    #[tokio::test]
    async fn test_membership_query_uses_expression_index() {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir);
        engine.initialize(&EventBus::new()).await.unwrap();
        seed(&engine).await;

        let plan = engine
            .explain(
                "people",
                &FindOptions::new().with_query(Query::new().eq("Person?", true)),
            )
            .unwrap();
        assert!(plan.iter().any(|detail| detail.contains("people/Person?")), "{:?}", plan);
    }

    #[tokio::test]
    async fn test_range_conditions_respect_types() {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir);
        seed(&engine).await;
        engine
            .put("people", "e", instance(json!({"age": "old"})), PutOptions::default())
            .await
            .unwrap();

        let options = FindOptions::new().with_query(Query::new().gte("age", 30));
        let found = engine.find("people", &options).await.unwrap();
        let keys: Vec<_> = found.iter().map(|d| d.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "d"]);

        let options = FindOptions::new()
            .with_query(Query::new().any_of("age", vec![json!(10), json!(25)]));
        assert_eq!(engine.find("people", &options).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_find_and_delete_respects_limit() {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir);
        seed(&engine).await;

        let options = FindOptions::new()
            .with_query(Query::new().eq("Person?", true))
            .order_by(["age"])
            .with_limit(2);
        assert_eq!(engine.find_and_delete("people", &options).await.unwrap(), 2);
        assert_eq!(engine.count("people", &CountOptions::new()).await.unwrap(), 2);
        assert!(engine.get("people", "a", GetOptions::allow_missing()).await.unwrap().is_some());
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Transaction Tests
    // ═══════════════════════════════════════════════════════════════════════

    #[tokio::test]
    async fn test_transaction_commit_and_rollback() {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir);

        let transaction = engine.begin().await.unwrap();
        transaction
            .put("people", "t", instance(json!({})), PutOptions::default())
            .await
            .unwrap();
        assert!(transaction
            .get("people", "t", GetOptions::allow_missing())
            .await
            .unwrap()
            .is_some());
        assert!(engine
            .get("people", "t", GetOptions::allow_missing())
            .await
            .unwrap()
            .is_none());
        transaction.commit().await.unwrap();
        assert!(engine.get("people", "t", GetOptions::allow_missing()).await.unwrap().is_some());

        let result: Result<()> = run_transaction(&engine, |transaction| async move {
            transaction.delete("people", "t", DeleteOptions::default()).await?;
            Err(StorageError::validation("abort"))
        })
        .await;
        assert!(result.is_err());
        assert!(engine.get("people", "t", GetOptions::allow_missing()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_root_writes_wait_for_open_transaction() {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir);
        let transaction = engine.begin().await.unwrap();
        transaction
            .put("people", "t", instance(json!({})), PutOptions::default())
            .await
            .unwrap();

        let mut waiting = engine.put("people", "w", instance(json!({})), PutOptions::default());
        assert!(futures::poll!(&mut waiting).is_pending());

        transaction.commit().await.unwrap();
        waiting.await.unwrap();
        assert_eq!(engine.count("people", &CountOptions::new()).await.unwrap(), 2);

        // A dropped transaction releases the writer as well
        drop(engine.begin().await.unwrap());
        engine
            .delete("people", "w", DeleteOptions::default())
            .await
            .unwrap();
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Lifecycle Tests
    // ═══════════════════════════════════════════════════════════════════════

    #[tokio::test]
    async fn test_migrations_persist_across_reopen() {
        let dir = TempDir::new().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let events = EventBus::new();
        let sink = Arc::clone(&seen);
        events.subscribe(Arc::new(move |event: &StoreEvent| {
            sink.lock().unwrap().push(event.kind());
        }));

        let engine = open(&dir);
        engine.initialize(&events).await.unwrap();
        engine
            .put("people", "k", instance(json!({"n": 1})), PutOptions::default())
            .await
            .unwrap();
        engine.close().await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["will-migrate", "did-migrate"]);

        let reopened = open(&dir);
        reopened.initialize(&events).await.unwrap();
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert!(reopened.get("people", "k", GetOptions::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_destroy_all_then_initialize() {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir);
        engine.initialize(&EventBus::new()).await.unwrap();
        seed(&engine).await;

        engine.destroy_all().await.unwrap();
        engine.initialize(&EventBus::new()).await.unwrap();
        assert_eq!(engine.count("people", &CountOptions::new()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_closed_engine_rejects_operations() {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir);
        engine.close().await.unwrap();

        let err = engine.get("people", "k", GetOptions::default()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Database);
        assert!(engine.begin().await.is_err());
    }
}
