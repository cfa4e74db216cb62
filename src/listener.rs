use crate::BoxError;

/// Callbacks for the lifecycle of an outermost transaction.
///
/// A listener registered with a begin call is notified once per event, in the
/// order begin, then commit or rollback. Nested transactions never notify.
/// Each yield counts as a commit followed by a fresh begin.
///
/// An error from [`on_begin`](Self::on_begin) aborts the transaction; an error
/// from [`on_commit`](Self::on_commit) turns the commit into a rollback. An
/// error from [`on_rollback`](Self::on_rollback) is reported after the
/// rollback has been carried out.
pub trait TransactionListener: Send + Sync {
   fn on_begin(&self) -> Result<(), BoxError> {
      Ok(())
   }

   fn on_commit(&self) -> Result<(), BoxError> {
      Ok(())
   }

   fn on_rollback(&self) -> Result<(), BoxError> {
      Ok(())
   }
}
