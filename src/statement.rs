//! Classification of raw SQL by its leading keyword

use std::sync::OnceLock;

use regex::Regex;

/// Kind of SQL statement, decided by its first keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlStatementType {
   Select,
   Insert,
   Update,
   Delete,
   /// `BEGIN ...`
   Begin,
   /// `COMMIT` or `END`
   Commit,
   /// `ROLLBACK` of the whole transaction (not `ROLLBACK TO` a savepoint)
   Abort,
   Pragma,
   /// `CREATE`, `ALTER` or `DROP`
   Ddl,
   Attach,
   Detach,
   Other,
}

fn leading_keyword() -> &'static Regex {
   static RE: OnceLock<Regex> = OnceLock::new();
   // Skips whitespace, `-- line` and `/* block */` comments
   RE.get_or_init(|| {
      Regex::new(r"^(?:\s+|--[^\n]*(?:\n|$)|/\*(?s:.*?)\*/)*([A-Za-z]+)").expect("valid regex")
   })
}

fn rollback_to_savepoint() -> &'static Regex {
   static RE: OnceLock<Regex> = OnceLock::new();
   RE.get_or_init(|| Regex::new(r"(?i)^ROLLBACK(?:\s+TRANSACTION)?\s+TO\b").expect("valid regex"))
}

impl SqlStatementType {
   /// Classifies `sql` by its first keyword, ignoring case, leading
   /// whitespace and comments.
   pub fn of(sql: &str) -> Self {
      let Some(captures) = leading_keyword().captures(sql) else {
         return SqlStatementType::Other;
      };
      let Some(keyword) = captures.get(1) else {
         return SqlStatementType::Other;
      };
      match keyword.as_str().to_ascii_uppercase().as_str() {
         "SELECT" | "VALUES" | "EXPLAIN" => SqlStatementType::Select,
         "INSERT" | "REPLACE" => SqlStatementType::Insert,
         "UPDATE" => SqlStatementType::Update,
         "DELETE" => SqlStatementType::Delete,
         "BEGIN" => SqlStatementType::Begin,
         "COMMIT" | "END" => SqlStatementType::Commit,
         "ROLLBACK" if rollback_to_savepoint().is_match(&sql[keyword.start()..]) => {
            SqlStatementType::Other
         }
         "ROLLBACK" => SqlStatementType::Abort,
         "PRAGMA" => SqlStatementType::Pragma,
         "CREATE" | "ALTER" | "DROP" => SqlStatementType::Ddl,
         "ATTACH" => SqlStatementType::Attach,
         "DETACH" => SqlStatementType::Detach,
         _ => SqlStatementType::Other,
      }
   }

   pub fn begins(self) -> bool {
      self == SqlStatementType::Begin
   }

   pub fn commits(self) -> bool {
      self == SqlStatementType::Commit
   }

   pub fn aborts(self) -> bool {
      self == SqlStatementType::Abort
   }

   /// True for statements that start or finish a transaction.
   pub fn is_transactional(self) -> bool {
      self.begins() || self.commits() || self.aborts()
   }

   /// Statements that can run on a read-only connection.
   pub fn is_read_only(self) -> bool {
      self == SqlStatementType::Select
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_plain_statements() {
      assert_eq!(SqlStatementType::of("SELECT * FROM t"), SqlStatementType::Select);
      assert_eq!(SqlStatementType::of("insert into t values (1)"), SqlStatementType::Insert);
      assert_eq!(SqlStatementType::of("REPLACE INTO t VALUES (1)"), SqlStatementType::Insert);
      assert_eq!(SqlStatementType::of("Update t SET a = 1"), SqlStatementType::Update);
      assert_eq!(SqlStatementType::of("DELETE FROM t"), SqlStatementType::Delete);
      assert_eq!(SqlStatementType::of("PRAGMA journal_mode"), SqlStatementType::Pragma);
      assert_eq!(SqlStatementType::of("CREATE TABLE t (a)"), SqlStatementType::Ddl);
      assert_eq!(SqlStatementType::of("drop table t"), SqlStatementType::Ddl);
      assert_eq!(SqlStatementType::of("ATTACH 'x.db' AS x"), SqlStatementType::Attach);
      assert_eq!(SqlStatementType::of("DETACH x"), SqlStatementType::Detach);
      assert_eq!(SqlStatementType::of("VACUUM"), SqlStatementType::Other);
      assert_eq!(SqlStatementType::of(""), SqlStatementType::Other);
      assert_eq!(SqlStatementType::of("   "), SqlStatementType::Other);
   }

   #[test]
   fn test_transactional_statements() {
      assert!(SqlStatementType::of("BEGIN").begins());
      assert!(SqlStatementType::of("begin immediate transaction").begins());
      assert!(SqlStatementType::of("COMMIT").commits());
      assert!(SqlStatementType::of("END TRANSACTION").commits());
      assert!(SqlStatementType::of("ROLLBACK").aborts());
      assert!(SqlStatementType::of("rollback transaction").aborts());

      for sql in ["BEGIN", "COMMIT", "END", "ROLLBACK"] {
         assert!(SqlStatementType::of(sql).is_transactional(), "{sql}");
      }
      assert!(!SqlStatementType::of("SELECT 1").is_transactional());
   }

   #[test]
   fn test_rollback_to_savepoint_is_not_an_abort() {
      assert_eq!(SqlStatementType::of("ROLLBACK TO sp1"), SqlStatementType::Other);
      assert_eq!(
         SqlStatementType::of("rollback transaction to savepoint sp1"),
         SqlStatementType::Other
      );
      assert_eq!(SqlStatementType::of("SAVEPOINT sp1"), SqlStatementType::Other);
   }

   #[test]
   fn test_leading_comments_and_whitespace_are_skipped() {
      assert_eq!(
         SqlStatementType::of("\n  -- setup\n  /* multi\n line */ BEGIN EXCLUSIVE"),
         SqlStatementType::Begin
      );
      assert_eq!(SqlStatementType::of("/**/select 1"), SqlStatementType::Select);
      assert_eq!(SqlStatementType::of("-- only a comment"), SqlStatementType::Other);
   }

   #[test]
   fn test_read_only() {
      assert!(SqlStatementType::of("SELECT 1").is_read_only());
      assert!(!SqlStatementType::of("INSERT INTO t VALUES (1)").is_read_only());
      assert!(!SqlStatementType::of("PRAGMA user_version = 3").is_read_only());
   }
}
