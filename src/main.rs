//! ctxmesh CLI entry point
//!
//! Parses arguments and dispatches to the CLI module. Errors are printed to
//! stderr and mapped to a non-zero exit code.

use ctxmesh::cli;

fn main() {
    if let Err(e) = cli::run() {
        eprintln!("{}", e);
        std::process::exit(e.exit_code());
    }
}
