//! Database dispatch macros for reducing code duplication.
//!
//! The pool, connection and transaction wrappers are enums with one variant per
//! driver. These macros expand to the match over those variants so each call
//! site reads as one line per driver.

/// Generate a match over the `DbPool` or `DbTransaction` variants.
///
/// # Example
///
/// ```ignore
/// impl_db_dispatch!(pool, {
///     MySql(p) => p.size(),
///     Postgres(p) => p.size(),
///     SQLite(p) => p.size(),
/// });
///
/// impl_db_dispatch!(transaction tx, {
///     MySql(t) => t.commit().await,
///     Postgres(t) => t.commit().await,
///     SQLite(t) => t.commit().await,
/// });
/// ```
#[macro_export]
macro_rules! impl_db_dispatch {
    (transaction $tx:expr, { $($variant:ident($p:ident) => $body:expr),+ $(,)? }) => {
        match $tx {
            $(
                $crate::db::session::DbTransaction::$variant($p) => $body,
            )+
        }
    };
    ($pool:expr, { $($variant:ident($p:ident) => $body:expr),+ $(,)? }) => {
        match $pool {
            $(
                $crate::db::pool::DbPool::$variant($p) => $body,
            )+
        }
    };
}
