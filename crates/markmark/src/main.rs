//
// main.rs
//

use std::env;

use markmark::cli::lint;
use markmark::config::Config;

fn print_usage() {
    println!(
        "markmark {}, a language server for linked markdown notes.",
        env!("CARGO_PKG_VERSION")
    );
    print!(
        r#"
Usage: markmark [OPTIONS]
       markmark lint <path> [--json]

Available options:

--stdio                      Start the LSP server using stdio transport
--version                    Print the version
--help                       Print this help message

Commands:

lint <path> [--json]         Report unresolved links under <path>

"#
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut argv = env::args();
    argv.next(); // skip executable name

    let mut use_stdio = false;

    while let Some(arg) = argv.next() {
        match arg.as_str() {
            "--stdio" => use_stdio = true,
            "--version" => {
                println!("markmark {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--help" => {
                print_usage();
                return Ok(());
            }
            "lint" => {
                env_logger::init();
                return run_lint(&mut argv).await;
            }
            other => {
                return Err(anyhow::anyhow!("Unknown argument: '{other}'"));
            }
        }
    }

    if !use_stdio {
        print_usage();
        return Ok(());
    }

    env_logger::init();

    markmark::backend::start_lsp().await
}

async fn run_lint(argv: &mut impl Iterator<Item = String>) -> anyhow::Result<()> {
    let args = lint::parse_args(argv).map_err(|err| anyhow::anyhow!(err))?;
    let reports = lint::run_lint(&args, Config::default()).await?;

    if args.json {
        lint::print_results_json(&reports)?;
    } else {
        let root = std::fs::canonicalize(&args.path)?;
        lint::print_results(&reports, &root);
    }

    if reports.iter().any(|report| !report.results.is_empty()) {
        std::process::exit(1);
    }
    Ok(())
}
