//! Transactional database access.
//!
//! One transaction is opened when the module is first required and is
//! finalized when the root context is torn down: commit, then an
//! unconditional rollback that is a no-op after a successful commit.
//!
//! With auto-savepoints enabled each statement is wrapped in
//! `SAVEPOINT`/`RELEASE` so a failed statement only undoes itself. A failure
//! of the savepoint commands themselves poisons the module: the running
//! script is aborted and the transaction is rolled back instead of committed.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use mlua::{
    Lua, MetaMethod, MultiValue, Table, UserData, UserDataFields, UserDataMethods, Value,
};
use uuid::Uuid;

use crate::engine::{field_to_lua, raise, to_sql_param};
use crate::error::{ModuleError, ScriptError};
use crate::loader::ModuleLoader;
use crate::module::CapabilityModule;
use crate::state::DATABASE_POOL;
use crate::transaction::{FieldValue, SqlParam, Transaction};

pub const NAME: &str = "pglua/db";

pub fn construct(loader: &ModuleLoader) -> Result<Box<dyn CapabilityModule>, ModuleError> {
    let pool = loader.get_state(&DATABASE_POOL)?;
    let tx = pool.begin().map_err(|source| ModuleError::Begin {
        context: loader.context_name().to_string(),
        source,
    })?;
    let savepoint = format!("pglua_{}", Uuid::new_v4().simple());
    tracing::debug!(context = loader.context_name(), %savepoint, "Transaction started");

    Ok(Box::new(DbModule {
        inner: Rc::new(DbInner {
            context: loader.context_name().to_string(),
            savepoint,
            state: RefCell::new(TxState {
                tx,
                auto_savepoints: false,
                poisoned: false,
            }),
        }),
    }))
}

struct TxState {
    tx: Box<dyn Transaction>,
    auto_savepoints: bool,
    poisoned: bool,
}

struct DbInner {
    context: String,
    savepoint: String,
    state: RefCell<TxState>,
}

impl DbInner {
    /// Run a savepoint control command. Failure poisons the transaction and
    /// aborts the script.
    fn savepoint_command(&self, state: &mut TxState, command: &str) -> mlua::Result<()> {
        let sql = format!("{command} {}", self.savepoint);
        if let Err(e) = state.tx.execute(&sql, &[]) {
            state.poisoned = true;
            tracing::error!(context = %self.context, error = %e, "{command} failed");
            return Err(raise(ScriptError::Savepoint(format!("{sql}: {e}"))));
        }
        Ok(())
    }

    fn ensure_usable(&self, state: &TxState) -> mlua::Result<()> {
        if state.poisoned {
            return Err(raise(ScriptError::Savepoint(format!(
                "{}: transaction is no longer usable",
                self.context
            ))));
        }
        Ok(())
    }
}

/// Script-facing handle; `require("pglua/db")` returns it.
#[derive(Clone)]
pub struct DbModule {
    inner: Rc<DbInner>,
}

impl DbModule {
    fn query(
        &self,
        lua: &Lua,
        sql: &str,
        args: Option<Table>,
    ) -> mlua::Result<(Value, Option<String>)> {
        let params = collect_params(args)?;
        let mut state = self.inner.state.borrow_mut();
        self.inner.ensure_usable(&state)?;

        let wrapped = state.auto_savepoints;
        if wrapped {
            self.inner.savepoint_command(&mut state, "SAVEPOINT")?;
        }

        match state.tx.query(sql, &params) {
            Ok(rows) => {
                drop(state);
                let rows = Rows {
                    db: Rc::clone(&self.inner),
                    columns: rows.columns,
                    pending: rows.rows,
                    release_savepoint: wrapped,
                    closed: false,
                };
                Ok((Value::UserData(lua.create_userdata(rows)?), None))
            }
            Err(e) => {
                if wrapped {
                    self.inner.savepoint_command(&mut state, "ROLLBACK TO SAVEPOINT")?;
                }
                Ok((Value::Nil, Some(e.to_string())))
            }
        }
    }

    fn exec(&self, sql: &str, args: Option<Table>) -> mlua::Result<(i64, Option<String>)> {
        let params = collect_params(args)?;
        let mut state = self.inner.state.borrow_mut();
        self.inner.ensure_usable(&state)?;

        let wrapped = state.auto_savepoints;
        if wrapped {
            self.inner.savepoint_command(&mut state, "SAVEPOINT")?;
        }

        match state.tx.execute(sql, &params) {
            Ok(affected) => {
                if wrapped {
                    self.inner.savepoint_command(&mut state, "RELEASE SAVEPOINT")?;
                }
                Ok((i64::try_from(affected).unwrap_or(i64::MAX), None))
            }
            Err(e) => {
                if wrapped {
                    self.inner.savepoint_command(&mut state, "ROLLBACK TO SAVEPOINT")?;
                }
                Ok((0, Some(e.to_string())))
            }
        }
    }
}

fn collect_params(args: Option<Table>) -> mlua::Result<Vec<SqlParam>> {
    let Some(args) = args else {
        return Ok(Vec::new());
    };
    let len = args.raw_len();
    (1..=len)
        .map(|i| args.raw_get::<Value>(i).map(|v| to_sql_param(&v)))
        .collect()
}

impl CapabilityModule for DbModule {
    fn name(&self) -> &'static str {
        NAME
    }

    fn exports(&self, lua: &Lua) -> mlua::Result<Value> {
        lua.create_userdata(self.clone()).map(Value::UserData)
    }

    fn destroy(&self, _loader: &ModuleLoader) -> Result<(), ModuleError> {
        let mut state = self.inner.state.borrow_mut();
        let context = self.inner.context.clone();

        let result = if state.poisoned {
            Err(ModuleError::Aborted { context })
        } else {
            state
                .tx
                .commit()
                .map_err(|source| ModuleError::Commit { context, source })
        };
        if let Err(e) = state.tx.rollback() {
            tracing::warn!(
                context = %self.inner.context,
                error = %e,
                "Rollback after commit failed"
            );
        }
        if result.is_ok() {
            tracing::debug!(context = %self.inner.context, "Transaction committed");
        }
        result
    }
}

impl UserData for DbModule {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("savepoints", |_, this, enable: bool| {
            this.inner.state.borrow_mut().auto_savepoints = enable;
            Ok(())
        });
        methods.add_method("query", |lua, this, (sql, args): (String, Option<Table>)| {
            this.query(lua, &sql, args)
        });
        methods.add_method("exec", |_, this, (sql, args): (String, Option<Table>)| {
            this.exec(&sql, args)
        });
    }
}

/// Result rows of one query, consumed front to back.
///
/// The savepoint wrapping the query is released once the rows are exhausted
/// or closed, using the auto-savepoint setting in effect when the query ran.
pub struct Rows {
    db: Rc<DbInner>,
    columns: Vec<String>,
    pending: VecDeque<Vec<FieldValue>>,
    release_savepoint: bool,
    closed: bool,
}

impl Rows {
    fn next_record(&mut self, lua: &Lua) -> mlua::Result<Value> {
        if self.closed {
            return Ok(Value::Nil);
        }
        let Some(row) = self.pending.pop_front() else {
            self.close()?;
            return Ok(Value::Nil);
        };

        let record = lua.create_table_with_capacity(0, self.columns.len())?;
        for (column, field) in self.columns.iter().zip(&row) {
            record.raw_set(column.as_str(), field_to_lua(lua, field)?)?;
        }
        Ok(Value::Table(record))
    }

    fn close(&mut self) -> mlua::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.pending.clear();

        if self.release_savepoint {
            let mut state = self.db.state.borrow_mut();
            if !state.poisoned {
                self.db.savepoint_command(&mut state, "RELEASE SAVEPOINT")?;
            }
        }
        Ok(())
    }
}

impl UserData for Rows {
    fn add_fields<F: UserDataFields<Self>>(fields: &mut F) {
        fields.add_field_method_get("fields", |lua, this| {
            lua.create_sequence_from(this.columns.iter().cloned())
        });
    }

    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method_mut("next", |lua, this, ()| this.next_record(lua));
        methods.add_method_mut("close", |_, this, ()| this.close());
        // `for row in rows do` calls the rows value itself as the iterator.
        methods.add_meta_method_mut(MetaMethod::Call, |lua, this, _: MultiValue| {
            this.next_record(lua)
        });
        methods.add_meta_method_mut(MetaMethod::Close, |_, this, _: MultiValue| this.close());
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::context::RunOutcome;
    use crate::test_helpers::{db_context, write_script, RecordingSource};
    use crate::transaction::RowSet;

    fn two_rows() -> RowSet {
        RowSet::new(
            vec!["id".to_string(), "name".to_string()],
            vec![
                vec![FieldValue::Int(1), FieldValue::Text("ada".to_string())],
                vec![FieldValue::Int(2), FieldValue::Null],
            ],
        )
    }

    #[test]
    fn completed_context_commits_once_then_rolls_back_once() {
        let dir = tempfile::tempdir().unwrap();
        write_script(
            &dir,
            "main.lua",
            r#"
                local db = require("pglua/db")
                local n, err = db:exec("INSERT INTO t VALUES ($1)", {1})
                assert(n == 1 and err == nil)
            "#,
        );
        let source = RecordingSource::new();
        let ctx = db_context(&dir, "main.lua", &source);

        assert_matches!(ctx.execute(), RunOutcome::Completed(_));

        let log = source.log.lock().unwrap();
        assert_eq!(log.begins, 1);
        assert_eq!(log.commits, 1);
        assert_eq!(log.rollbacks, 1);
        assert_eq!(log.persisted, vec!["INSERT INTO t VALUES ($1)"]);
    }

    #[test]
    fn savepoint_keeps_earlier_insert_when_a_later_one_fails() {
        let dir = tempfile::tempdir().unwrap();
        write_script(
            &dir,
            "main.lua",
            r#"
                local db = require("pglua/db")
                db:savepoints(true)
                local _, err1 = db:exec("INSERT INTO t VALUES (1)")
                local _, err2 = db:exec("INSERT INTO t VALUES (bad)")
                failed = err1 == nil and err2 ~= nil
            "#,
        );
        let source = RecordingSource::new();
        let ctx = db_context(&dir, "main.lua", &source);

        let exports = assert_matches!(ctx.run(), RunOutcome::Completed(t) => t);
        assert!(exports.get::<bool>("failed").unwrap());
        ctx.teardown();

        let log = source.log.lock().unwrap();
        assert_eq!(log.persisted, vec!["INSERT INTO t VALUES (1)"]);
        let kinds: Vec<_> = log
            .statements
            .iter()
            .map(|s| s.split(" pglua_").next().unwrap().to_string())
            .collect();
        assert_eq!(
            kinds,
            vec![
                "SAVEPOINT",
                "INSERT INTO t VALUES (1)",
                "RELEASE SAVEPOINT",
                "SAVEPOINT",
                "INSERT INTO t VALUES (bad)",
                "ROLLBACK TO SAVEPOINT",
            ]
        );
    }

    #[test]
    fn without_savepoints_a_failed_statement_aborts_the_commit() {
        let dir = tempfile::tempdir().unwrap();
        write_script(
            &dir,
            "main.lua",
            r#"
                local db = require("pglua/db")
                db:exec("INSERT INTO t VALUES (1)")
                local n, err = db:exec("INSERT INTO t VALUES (bad)")
                assert(n == 0 and err:find("bad"))
            "#,
        );
        let source = RecordingSource::new();
        let ctx = db_context(&dir, "main.lua", &source);

        assert_matches!(ctx.execute(), RunOutcome::Completed(_));
        assert!(source.log.lock().unwrap().persisted.is_empty());
    }

    #[test]
    fn rows_iterate_and_release_their_savepoint_when_drained() {
        let dir = tempfile::tempdir().unwrap();
        write_script(
            &dir,
            "main.lua",
            r#"
                local db = require("pglua/db")
                db:savepoints(true)
                local rows, err = db:query("SELECT id, name FROM people")
                assert(err == nil)
                fields = table.concat(rows.fields, ",")
                ids = {}
                for row in rows do
                    ids[#ids + 1] = row.id
                    second_name = row.name
                end
            "#,
        );
        let source = RecordingSource::new().with_rows(two_rows());
        let ctx = db_context(&dir, "main.lua", &source);

        let exports = assert_matches!(ctx.run(), RunOutcome::Completed(t) => t);
        assert_eq!(exports.get::<String>("fields").unwrap(), "id,name");
        assert_eq!(exports.get::<Vec<i64>>("ids").unwrap(), vec![1, 2]);
        assert!(exports.get::<Value>("second_name").unwrap().is_nil());

        let statements = source.statements();
        assert!(statements.last().unwrap().starts_with("RELEASE SAVEPOINT pglua_"));
    }

    #[test]
    fn release_follows_the_mode_at_query_time() {
        let dir = tempfile::tempdir().unwrap();
        write_script(
            &dir,
            "main.lua",
            r#"
                local db = require("pglua/db")
                local rows = db:query("SELECT 1")
                db:savepoints(true)
                rows:close()
            "#,
        );
        let source = RecordingSource::new().with_rows(two_rows());
        let ctx = db_context(&dir, "main.lua", &source);

        assert_matches!(ctx.run(), RunOutcome::Completed(_));
        assert_eq!(source.statements(), vec!["SELECT 1"]);
    }

    #[test]
    fn failed_query_rolls_back_to_its_savepoint() {
        let dir = tempfile::tempdir().unwrap();
        write_script(
            &dir,
            "main.lua",
            r#"
                local db = require("pglua/db")
                db:savepoints(true)
                local rows, err = db:query("SELECT bad")
                query_failed = rows == nil and err:find("bad") ~= nil
                local n, exec_err = db:exec("INSERT INTO t VALUES (2)")
                inserted = n == 1 and exec_err == nil
            "#,
        );
        let source = RecordingSource::new();
        let ctx = db_context(&dir, "main.lua", &source);

        let exports = assert_matches!(ctx.run(), RunOutcome::Completed(t) => t);
        assert!(exports.get::<bool>("query_failed").unwrap());
        assert!(exports.get::<bool>("inserted").unwrap());
        ctx.teardown();

        let log = source.log.lock().unwrap();
        assert!(log.statements[2].starts_with("ROLLBACK TO SAVEPOINT pglua_"));
        assert_eq!(log.persisted, vec!["INSERT INTO t VALUES (2)"]);
        assert_eq!(log.commits, 1);
    }

    #[test]
    fn closing_rows_releases_their_savepoint_once() {
        let dir = tempfile::tempdir().unwrap();
        write_script(
            &dir,
            "main.lua",
            r#"
                local db = require("pglua/db")
                db:savepoints(true)
                local rows = db:query("SELECT id FROM people")
                first = rows:next().id
                rows:close()
                rows:close()
                after_close = rows:next()
            "#,
        );
        let source = RecordingSource::new().with_rows(two_rows());
        let ctx = db_context(&dir, "main.lua", &source);

        let exports = assert_matches!(ctx.run(), RunOutcome::Completed(t) => t);
        assert_eq!(exports.get::<i64>("first").unwrap(), 1);
        assert!(exports.get::<Value>("after_close").unwrap().is_nil());

        let releases = source
            .statements()
            .iter()
            .filter(|s| s.starts_with("RELEASE SAVEPOINT pglua_"))
            .count();
        assert_eq!(releases, 1);
    }

    #[test]
    fn savepoint_failure_aborts_the_script_and_skips_commit() {
        let dir = tempfile::tempdir().unwrap();
        write_script(
            &dir,
            "main.lua",
            r#"
                local db = require("pglua/db")
                db:savepoints(true)
                db:exec("INSERT INTO t VALUES (1)")
                reached = true
            "#,
        );
        let source = RecordingSource::new().failing("RELEASE SAVEPOINT");
        let ctx = db_context(&dir, "main.lua", &source);

        assert_matches!(ctx.execute(), RunOutcome::Failed(ScriptError::Savepoint(_)));

        let log = source.log.lock().unwrap();
        assert_eq!(log.commits, 0);
        assert_eq!(log.rollbacks, 1);
        assert!(log.persisted.is_empty());
    }

    #[test]
    fn missing_pool_fails_construction() {
        let dir = tempfile::tempdir().unwrap();
        write_script(&dir, "main.lua", "require('pglua/db')\nreached = true");
        let ctx = crate::test_helpers::root_context(&dir, "main.lua");

        let err = assert_matches!(
            ctx.execute(),
            RunOutcome::Failed(ScriptError::ModuleConstruction { module, reason }) => (module, reason)
        );
        assert_eq!(err.0, NAME);
        assert!(err.1.contains("database-pool"));
    }

    #[test]
    fn nested_scripts_share_one_transaction() {
        let dir = tempfile::tempdir().unwrap();
        write_script(
            &dir,
            "main.lua",
            r#"
                local db = require("pglua/db")
                require("lib.lua")
                db:exec("INSERT INTO t VALUES (2)")
            "#,
        );
        write_script(
            &dir,
            "lib.lua",
            r#"require("pglua/db"):exec("INSERT INTO t VALUES (1)")"#,
        );
        let source = RecordingSource::new();
        let ctx = db_context(&dir, "main.lua", &source);

        assert_matches!(ctx.execute(), RunOutcome::Completed(_));
        let log = source.log.lock().unwrap();
        assert_eq!(log.begins, 1);
        assert_eq!(log.commits, 1);
        assert_eq!(
            log.persisted,
            vec!["INSERT INTO t VALUES (1)", "INSERT INTO t VALUES (2)"]
        );
    }
}
