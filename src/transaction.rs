//! Transaction control.
//!
//! Whether a transaction is open is always asked of the server; the local
//! savepoint list is bookkeeping for callers and is never consulted to decide
//! transaction state. Savepoint names are not checked locally: setting the
//! same name twice is valid and the server resolves which one a rollback or
//! release refers to.
//!
//! Every failing control statement is logged at ERROR and returned as
//! [`ConnectionError::TransactionControl`].

use crate::driver::{Driver, Handle, TransactionStatus};
use crate::error::{ConnectionError, Result, TransactionOp};
use crate::log::Level;
use crate::session::Session;

impl<D: Driver> Session<D> {
    /// `BEGIN TRANSACTION ISOLATION LEVEL <configured level>`.
    pub fn begin(&mut self) -> Result<()> {
        let sql = format!(
            "BEGIN TRANSACTION ISOLATION LEVEL {}",
            self.config.isolation_level().as_sql()
        );
        self.control(TransactionOp::Begin, &sql)?;
        self.savepoints.clear();
        Ok(())
    }

    pub fn commit(&mut self) -> Result<()> {
        self.control(TransactionOp::Commit, "COMMIT TRANSACTION")?;
        self.savepoints.clear();
        Ok(())
    }

    /// Roll back the whole transaction, or only to `savepoint`, which keeps
    /// the transaction and the savepoint itself open.
    pub fn rollback(&mut self, savepoint: Option<&str>) -> Result<()> {
        match savepoint {
            None => {
                self.control(TransactionOp::Rollback, "ROLLBACK TRANSACTION")?;
                self.savepoints.clear();
            }
            Some(name) => {
                let sql = format!("ROLLBACK TO SAVEPOINT {}", self.escape_identifier(name)?);
                self.control(TransactionOp::RollbackTo(name.to_string()), &sql)?;
                if let Some(pos) = self.savepoints.iter().rposition(|s| s == name) {
                    self.savepoints.truncate(pos + 1);
                }
            }
        }
        Ok(())
    }

    pub fn set_savepoint(&mut self, name: &str) -> Result<()> {
        let sql = format!("SAVEPOINT {}", self.escape_identifier(name)?);
        self.control(TransactionOp::SetSavepoint(name.to_string()), &sql)?;
        self.savepoints.push(name.to_string());
        Ok(())
    }

    /// Release the most recent savepoint called `name`, keeping its changes.
    pub fn release_savepoint(&mut self, name: &str) -> Result<()> {
        let sql = format!("RELEASE SAVEPOINT {}", self.escape_identifier(name)?);
        self.control(TransactionOp::ReleaseSavepoint(name.to_string()), &sql)?;
        if let Some(pos) = self.savepoints.iter().rposition(|s| s == name) {
            self.savepoints.truncate(pos);
        }
        Ok(())
    }

    /// True unless the server reports the connection idle. A failed
    /// transaction counts as open.
    pub fn is_in_transaction(&mut self) -> Result<bool> {
        Ok(self.transaction_status()? != TransactionStatus::Idle)
    }

    pub fn transaction_status(&mut self) -> Result<TransactionStatus> {
        Ok(self.handle()?.transaction_status())
    }

    /// Savepoints set since the transaction began, oldest first.
    pub fn savepoints(&self) -> &[String] {
        &self.savepoints
    }

    fn control(&mut self, operation: TransactionOp, sql: &str) -> Result<()> {
        match self.execute_anonymous_query(sql) {
            Ok(_) => Ok(()),
            Err(ConnectionError::QueryExecution { sql, source }) => {
                let isolation = self.config.isolation_level();
                Err(self.fail(
                    Level::Error,
                    ConnectionError::TransactionControl {
                        operation,
                        isolation,
                        sql,
                        source,
                    },
                ))
            }
            Err(other) => Err(other),
        }
    }
}
