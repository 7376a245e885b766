use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Parser, Subcommand};
use kiln::graph::{load_records, read_record, write_precompiled_modules_report};

#[derive(Parser, Debug)]
#[command(name = "kiln-inspect", about = "Inspect persisted dependency records")]
struct Args {
    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a record as JSON
    Show { record: Utf8PathBuf },
    /// Write the precompiled modules report for every record in a directory
    Report {
        records: Utf8PathBuf,
        output: Utf8PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    kiln::logging::init(args.verbose)?;

    match args.command {
        Command::Show { record } => {
            let info = read_record(&record)?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Command::Report { records, output } => {
            let paths = find_records(&records)?;
            let records = load_records(&paths)?;
            let summary = write_precompiled_modules_report(records, &output)?;
            println!("{summary}");
        }
    }

    Ok(())
}

/// Every `*.scan` file under `dir`.
fn find_records(dir: &Utf8Path) -> anyhow::Result<Vec<Utf8PathBuf>> {
    let pattern = format!("{}/**/*.scan", glob::Pattern::escape(dir.as_str()));

    let mut found = glob::glob(&pattern)
        .with_context(|| format!("invalid record pattern '{pattern}'"))?
        .filter_map(|path| {
            let path = match path {
                Ok(path) => path,
                Err(error) => return Some(Err(anyhow::Error::from(error))),
            };
            match Utf8PathBuf::from_path_buf(path) {
                Ok(path) if path.is_dir() => None,
                Ok(path) => Some(Ok(path)),
                Err(path) => Some(Err(anyhow::anyhow!("{} is not valid UTF-8", path.display()))),
            }
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    found.sort();
    Ok(found)
}
