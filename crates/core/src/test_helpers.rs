//! Fixtures shared by the unit tests of this crate.

use std::sync::{Arc, Mutex};

use tempfile::TempDir;

use crate::context::{ExecutionContext, PrintSink};
use crate::loader::ModuleLoader;
use crate::module::ModuleRegistry;
use crate::state::DATABASE_POOL;
use crate::transaction::{DbError, RowSet, SqlParam, Transaction, TransactionSource};

pub(crate) fn write_script(dir: &TempDir, relative: &str, source: &str) {
    let path = dir.path().join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, source).unwrap();
}

/// Root context with a loader attached and output discarded.
pub(crate) fn context_with(
    dir: &TempDir,
    script: &str,
    registry: ModuleRegistry,
) -> ExecutionContext {
    let mut ctx =
        ExecutionContext::with_registry(dir.path(), script, PrintSink::null(), Arc::new(registry))
            .unwrap();
    let loader = ModuleLoader::new_root(&ctx);
    ctx.attach_loader(loader);
    ctx
}

pub(crate) fn root_context(dir: &TempDir, script: &str) -> ExecutionContext {
    context_with(dir, script, ModuleRegistry::builtin())
}

/// Root context whose loader already holds `source` as the database pool.
pub(crate) fn db_context(
    dir: &TempDir,
    script: &str,
    source: &RecordingSource,
) -> ExecutionContext {
    let ctx = root_context(dir, script);
    let pool: Arc<dyn TransactionSource> = Arc::new(source.clone());
    ctx.loader().unwrap().set_state(&DATABASE_POOL, pool).unwrap();
    ctx
}

/// What the fake database saw.
#[derive(Debug, Default)]
pub(crate) struct DbLog {
    pub statements: Vec<String>,
    pub begins: usize,
    pub commits: usize,
    pub rollbacks: usize,
    /// Statements that survived a successful commit.
    pub persisted: Vec<String>,
}

/// In-memory transaction source that mimics PostgreSQL's savepoint and
/// aborted-transaction behavior closely enough for the module tests.
///
/// Any statement containing `bad` fails and aborts the transaction until a
/// `ROLLBACK TO SAVEPOINT`.
#[derive(Clone, Default)]
pub(crate) struct RecordingSource {
    pub log: Arc<Mutex<DbLog>>,
    /// Statements starting with this prefix fail.
    pub fail_prefix: Option<String>,
    /// Returned by every successful query.
    pub rows: RowSet,
}

impl RecordingSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(mut self, rows: RowSet) -> Self {
        self.rows = rows;
        self
    }

    pub fn failing(mut self, prefix: &str) -> Self {
        self.fail_prefix = Some(prefix.to_string());
        self
    }

    pub fn statements(&self) -> Vec<String> {
        self.log.lock().unwrap().statements.clone()
    }
}

impl TransactionSource for RecordingSource {
    fn begin(&self) -> Result<Box<dyn Transaction>, DbError> {
        self.log.lock().unwrap().begins += 1;
        Ok(Box::new(RecordingTransaction {
            source: self.clone(),
            pending: Vec::new(),
            savepoints: Vec::new(),
            aborted: false,
            finished: false,
        }))
    }
}

struct RecordingTransaction {
    source: RecordingSource,
    pending: Vec<String>,
    savepoints: Vec<(String, usize)>,
    aborted: bool,
    finished: bool,
}

impl RecordingTransaction {
    fn run(&mut self, sql: &str) -> Result<u64, DbError> {
        self.source.log.lock().unwrap().statements.push(sql.to_string());
        if self.finished {
            return Err(DbError::Closed);
        }
        if let Some(prefix) = &self.source.fail_prefix {
            if sql.starts_with(prefix.as_str()) {
                return Err(DbError::Statement(format!("injected failure: {sql}")));
            }
        }

        if let Some(name) = sql.strip_prefix("ROLLBACK TO SAVEPOINT ") {
            let (_, mark) = self
                .savepoints
                .iter()
                .rev()
                .find(|(sp, _)| sp == name)
                .cloned()
                .ok_or_else(|| DbError::Statement(format!("savepoint \"{name}\" does not exist")))?;
            self.pending.truncate(mark);
            self.aborted = false;
            return Ok(0);
        }
        if self.aborted {
            return Err(DbError::Statement(
                "current transaction is aborted, commands ignored until end of transaction block"
                    .to_string(),
            ));
        }
        if let Some(name) = sql.strip_prefix("SAVEPOINT ") {
            self.savepoints.push((name.to_string(), self.pending.len()));
            return Ok(0);
        }
        if let Some(name) = sql.strip_prefix("RELEASE SAVEPOINT ") {
            let idx = self
                .savepoints
                .iter()
                .rposition(|(sp, _)| sp == name)
                .ok_or_else(|| DbError::Statement(format!("savepoint \"{name}\" does not exist")))?;
            self.savepoints.truncate(idx);
            return Ok(0);
        }
        if sql.contains("bad") {
            self.aborted = true;
            return Err(DbError::Statement(
                "syntax error at or near \"bad\"".to_string(),
            ));
        }
        self.pending.push(sql.to_string());
        Ok(1)
    }
}

impl Transaction for RecordingTransaction {
    fn execute(&mut self, sql: &str, _params: &[SqlParam]) -> Result<u64, DbError> {
        self.run(sql)
    }

    fn query(&mut self, sql: &str, _params: &[SqlParam]) -> Result<RowSet, DbError> {
        self.run(sql)?;
        Ok(self.source.rows.clone())
    }

    fn commit(&mut self) -> Result<(), DbError> {
        let mut log = self.source.log.lock().unwrap();
        log.commits += 1;
        if self.finished {
            return Err(DbError::Closed);
        }
        self.finished = true;
        if self.aborted {
            return Err(DbError::Statement(
                "current transaction is aborted".to_string(),
            ));
        }
        log.persisted.append(&mut self.pending);
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), DbError> {
        self.source.log.lock().unwrap().rollbacks += 1;
        if !self.finished {
            self.finished = true;
            self.pending.clear();
        }
        Ok(())
    }
}
