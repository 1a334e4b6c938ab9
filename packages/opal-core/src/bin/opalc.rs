//! opalc - compile an opal source file to C99

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use opal_core::{compile_source, CompilerConfig};

#[derive(Parser, Debug)]
#[command(name = "opalc", about = "Ahead-of-time S-expression to C compiler")]
struct Args {
    /// Input source file
    input: PathBuf,

    /// Output C file (defaults to the input with a .c extension)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Dump per-function analysis results as JSON to stderr
    #[arg(long)]
    dump_analysis: bool,

    /// Emit ASSERT_OWNED checks and tag diagnostics
    #[arg(long)]
    debug: bool,

    /// Log conservative fallbacks at warn level
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let source = match std::fs::read_to_string(&args.input) {
        Ok(text) => text,
        Err(err) => {
            eprintln!("error: cannot read {}: {}", args.input.display(), err);
            return ExitCode::FAILURE;
        }
    };

    let config = CompilerConfig {
        debug_assertions: args.debug,
        verbose: args.verbose,
        ..CompilerConfig::default()
    };

    let output = match compile_source(&source, &config) {
        Ok(output) => output,
        Err(err) => {
            eprintln!("error: {}", err);
            return ExitCode::FAILURE;
        }
    };

    if !output.diagnostics.is_empty() {
        eprint!("{}", output.diagnostics.report());
    }

    if args.dump_analysis {
        match serde_json::to_string_pretty(&output.analyses) {
            Ok(json) => eprintln!("{}", json),
            Err(err) => eprintln!("error: analysis dump failed: {}", err),
        }
    }

    let out_path = args
        .output
        .unwrap_or_else(|| args.input.with_extension("c"));
    if let Err(err) = std::fs::write(&out_path, &output.c_source) {
        eprintln!("error: cannot write {}: {}", out_path.display(), err);
        return ExitCode::FAILURE;
    }

    if output.diagnostics.has_errors() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
