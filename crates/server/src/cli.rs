//! CLI argument parsing and subcommand dispatch.

use parsec_tool_runtime::sql_guard;

/// Parse CLI arguments and dispatch to the appropriate subcommand.
///
/// Returns `Ok(true)` if a subcommand was handled, `Ok(false)` if `serve`
/// should be started (handled by the caller).
pub fn dispatch(args: &[String]) -> anyhow::Result<bool> {
    match args.get(1).map(|s| s.as_str()) {
        None | Some("serve") => Ok(false),
        Some("check-sql") => {
            let sql = args.get(2..).map(|rest| rest.join(" ")).unwrap_or_default();
            if sql.trim().is_empty() {
                anyhow::bail!("Usage: parsec-server check-sql \"<sql>\"");
            }
            println!("{}", check_sql(&sql));
            Ok(true)
        }
        _ => {
            print_usage();
            Ok(true)
        }
    }
}

/// One-line verdict for `check-sql`.
pub fn check_sql(sql: &str) -> String {
    match sql_guard::validate(sql).reason() {
        None => "allowed".to_string(),
        Some(reason) => format!("rejected: {reason}"),
    }
}

fn print_usage() {
    println!("parsec-server v{}", env!("CARGO_PKG_VERSION"));
    println!("Usage: parsec-server <command>");
    println!("  serve                 Start HTTP server (default)");
    println!("  check-sql \"<sql>\"     Show whether a query passes the read-only gate");
}
