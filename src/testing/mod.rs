//! Test utilities.
//!
//! [`MemoryDriver`] is a scriptable in-memory stand-in for a real database
//! driver. Tests enqueue result sets or errors keyed by a SQL substring;
//! statements with no matching script default to an empty result set for
//! SELECTs and a journaled mutation for everything else. Mutations become
//! visible through [`MemoryDriver::committed`] only after the owning
//! connection commits, which lets tests assert transactional behavior.
//!
//! Like a real pyformat driver, the connection expands `%(name)s` markers
//! from named bindings and collapses `%%` escapes before journaling, so
//! tests see the SQL as the engine would receive it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::database::driver::{
    BoundArgs, DbConnection, DbDriver, DriverError, DriverResult, SqlRow,
};
use crate::database::param::{render_literal, ParamStyle};

/// A statement as a connection executed it.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedStatement {
    pub sql: String,
    pub args: BoundArgs,
}

#[derive(Debug)]
enum ScriptedOutcome {
    Rows(Vec<SqlRow>),
    Error(DriverError),
}

#[derive(Debug)]
struct Script {
    contains: String,
    outcome: ScriptedOutcome,
}

#[derive(Debug, Default)]
struct MemoryState {
    committed: Vec<ExecutedStatement>,
    scripts: Vec<Script>,
    connections_opened: usize,
    connections_closed: usize,
}

/// An in-memory driver for tests.
#[derive(Debug, Clone)]
pub struct MemoryDriver {
    state: Arc<Mutex<MemoryState>>,
    style: ParamStyle,
}

impl MemoryDriver {
    pub fn new(style: ParamStyle) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            style,
        }
    }

    /// Scripts a result set for the next statement containing `contains`.
    ///
    /// Scripts are consumed in FIFO order among those that match.
    pub fn script_rows(&self, contains: &str, rows: Vec<SqlRow>) {
        self.state.lock().unwrap().scripts.push(Script {
            contains: contains.to_string(),
            outcome: ScriptedOutcome::Rows(rows),
        });
    }

    /// Scripts an error for the next statement containing `contains`.
    pub fn script_error(&self, contains: &str, error: DriverError) {
        self.state.lock().unwrap().scripts.push(Script {
            contains: contains.to_string(),
            outcome: ScriptedOutcome::Error(error),
        });
    }

    /// Statements committed so far, in commit order.
    pub fn committed(&self) -> Vec<ExecutedStatement> {
        self.state.lock().unwrap().committed.clone()
    }

    /// Number of connections handed out so far.
    pub fn connections_opened(&self) -> usize {
        self.state.lock().unwrap().connections_opened
    }

    /// Number of connections physically closed so far.
    pub fn connections_closed(&self) -> usize {
        self.state.lock().unwrap().connections_closed
    }
}

#[async_trait]
impl DbDriver for MemoryDriver {
    fn param_style(&self) -> ParamStyle {
        self.style
    }

    async fn connect(&self) -> DriverResult<Box<dyn DbConnection>> {
        self.state.lock().unwrap().connections_opened += 1;
        Ok(Box::new(MemoryConnection {
            state: self.state.clone(),
            pending: Vec::new(),
            rows: VecDeque::new(),
            has_result: false,
        }))
    }
}

struct MemoryConnection {
    state: Arc<Mutex<MemoryState>>,
    /// Mutations journaled since the last commit or rollback.
    pending: Vec<ExecutedStatement>,
    rows: VecDeque<SqlRow>,
    has_result: bool,
}

impl MemoryConnection {
    fn take_script(&self, sql: &str) -> Option<ScriptedOutcome> {
        let mut state = self.state.lock().unwrap();
        let position = state
            .scripts
            .iter()
            .position(|s| sql.contains(&s.contains))?;
        Some(state.scripts.remove(position).outcome)
    }
}

/// Expands pyformat named bindings the way the engine-side driver would:
/// each `%(name)s` marker becomes the bound value, then `%%` escapes
/// collapse back to literal `%`.
fn expand_pyformat(sql: &str, args: &BoundArgs) -> String {
    let BoundArgs::Named(bindings) = args else {
        return sql.to_string();
    };
    if !sql.contains("%(") {
        return sql.to_string();
    }
    let mut expanded = sql.to_string();
    for (key, value) in bindings {
        expanded = expanded.replace(&format!("%({})s", key), &render_literal(value));
    }
    expanded.replace("%%", "%")
}

#[async_trait]
impl DbConnection for MemoryConnection {
    async fn execute(&mut self, sql: &str, args: &BoundArgs) -> DriverResult<bool> {
        self.rows.clear();
        self.has_result = false;

        let sql = expand_pyformat(sql, args);
        let sql = sql.as_str();

        match self.take_script(sql) {
            Some(ScriptedOutcome::Error(e)) => return Err(e),
            Some(ScriptedOutcome::Rows(rows)) => {
                self.rows = rows.into();
                self.has_result = true;
                return Ok(true);
            }
            None => {}
        }

        if sql.trim_start().to_ascii_uppercase().starts_with("SELECT") {
            self.has_result = true;
            Ok(true)
        } else {
            self.pending.push(ExecutedStatement {
                sql: sql.to_string(),
                args: args.clone(),
            });
            Ok(false)
        }
    }

    async fn fetch_all(&mut self) -> DriverResult<Vec<SqlRow>> {
        if !self.has_result {
            return Err(DriverError::Execution(
                "no result set to fetch from".to_string(),
            ));
        }
        Ok(self.rows.drain(..).collect())
    }

    async fn fetch_many(&mut self, max: usize) -> DriverResult<Vec<SqlRow>> {
        if !self.has_result {
            return Err(DriverError::Execution(
                "no result set to fetch from".to_string(),
            ));
        }
        let take = max.min(self.rows.len());
        Ok(self.rows.drain(..take).collect())
    }

    async fn commit(&mut self) -> DriverResult<()> {
        let mut state = self.state.lock().unwrap();
        state.committed.append(&mut self.pending);
        Ok(())
    }

    async fn rollback(&mut self) -> DriverResult<()> {
        self.pending.clear();
        Ok(())
    }

    async fn close(&mut self) -> DriverResult<()> {
        self.pending.clear();
        self.state.lock().unwrap().connections_closed += 1;
        Ok(())
    }
}
