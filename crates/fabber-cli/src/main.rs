//! Fabber CLI entry point.

use anyhow::Result;

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let code = fabber_cli::run_app(&args)?;
    std::process::exit(code);
}
