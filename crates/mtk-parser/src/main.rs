use std::{fs, path::PathBuf};

use clap::Parser;
use mtk_parser::parse_da;

/// Inspect the entries of a MediaTek Download Agent binary
#[derive(Parser)]
#[command(version)]
struct Cli {
    /// DA file
    input: PathBuf,
}

fn main() -> Result<(), String> {
    let cli = Cli::parse();
    let data = fs::read(&cli.input).map_err(|e| e.to_string())?;
    let da = parse_da(&data).map_err(|e| e.to_string())?;
    print!("{da}");
    Ok(())
}
