//! Server version policy.

/// Does this server predate MySQL 5.7 and therefore send an EOF packet
/// between the column definitions and the row data?
///
/// Versions are compared as plain strings, which is only meaningful for
/// `x.y.z` versions of equal shape. For MariaDB, a `<version>-MariaDB-...`
/// string is judged by its leading version; the `5.5.5-10.x.y-MariaDB-...`
/// form used by MariaDB 10 and later is never legacy.
pub fn less_than_57(version: &str) -> bool {
    if version.contains("MariaDB") {
        let mut parts = version.split('-');
        let leading = parts.next().unwrap_or_default();
        return match parts.next() {
            Some("MariaDB") => leading < "5.7.0",
            _ => false,
        };
    }
    version < "5.7.0"
}
