use std::fs::File;
use std::io::{stdin, stdout, BufReader, BufWriter};
use std::path::PathBuf;

use anyhow::Result;
use clap::Subcommand;
use log::info;

use typekv::db::Database;

use crate::dump;

/// The various kinds of commands `run` can execute against an open
/// `Database`.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Writes every document in a collection to stdout (or `--output`) as
    /// newline-delimited JSON.
    Dump {
        /// Collection path, e.g. `--collection users` or `--collection
        /// teams --collection members` for a nested collection.
        #[clap(long = "collection", required = true, num_args = 1..)]
        collection: Vec<String>,

        #[clap(long, short = 'o')]
        output: Option<PathBuf>,
    },

    /// Reads newline-delimited JSON dump records from stdin (or `--input`)
    /// and upserts each into a collection.
    Load {
        #[clap(long = "collection", required = true, num_args = 1..)]
        collection: Vec<String>,

        #[clap(long, short = 'i')]
        input: Option<PathBuf>,
    },

    /// Prints the total number of entries across every collection and key
    /// family in the backend.
    Count,

    /// Deletes every entry in the backend.
    Wipe,
}

pub fn run(db: &Database, command: Command) -> Result<()> {
    match command {
        Command::Dump { collection, output } => {
            let path: Vec<&str> = collection.iter().map(String::as_str).collect();
            let source = dump::open_collection(db, &path);
            let count = match output {
                Some(path) => dump::export(&source, BufWriter::new(File::create(path)?))?,
                None => dump::export(&source, stdout().lock())?,
            };
            info!("dumped {count} document(s) from {collection:?}");
            eprintln!("dumped {count} document(s)");
            Ok(())
        }
        Command::Load { collection, input } => {
            let path: Vec<&str> = collection.iter().map(String::as_str).collect();
            let target = dump::open_collection(db, &path);
            let count = match input {
                Some(path) => dump::import(&target, BufReader::new(File::open(path)?))?,
                None => dump::import(&target, BufReader::new(stdin().lock()))?,
            };
            info!("loaded {count} document(s) into {collection:?}");
            eprintln!("loaded {count} document(s)");
            Ok(())
        }
        Command::Count => {
            let count = db.count_all()?;
            println!("{count}");
            Ok(())
        }
        Command::Wipe => {
            db.wipe()?;
            eprintln!("wiped");
            Ok(())
        }
    }
}
