//! Interactive front-end for the store.
//!
//! Reads newline-separated tokens from standard input: `GET` followed by a
//! key line, or `PUT` followed by a key line and a value line. Anything else
//! prints a message and the loop continues.

use std::io::{self, BufRead, Write};

use clap::Parser;

use emberdb::{Error, LsmConfig, LsmStore, Store};

#[derive(Parser, Debug)]
#[command(name = "emberdb", about = "An embedded, ordered key-value store")]
struct Args {
    /// Directory the store owns.
    #[arg(long, default_value = "./emberdb")]
    dir: String,

    /// Maximum memtable byte size before a flush is triggered.
    #[arg(long, default_value_t = emberdb::config::DEFAULT_MEMTABLE_LIMIT)]
    memtable_limit: usize,

    /// Wipe any existing store files in the directory before starting.
    #[arg(long)]
    create_new: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> emberdb::Result<()> {
    let config = LsmConfig::new(&args.dir)
        .memtable_limit(args.memtable_limit)
        .create_new(args.create_new);
    let mut store = LsmStore::open_with_config(config)?;
    store.replay()?;

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut lines = stdin.lock().lines();

    while let Some(op) = next_line(&mut lines)? {
        match op.as_str() {
            "GET" => {
                println!("Enter key to GET!");
                let Some(key) = next_line(&mut lines)? else { break };
                match store.get(key.as_bytes()) {
                    Ok(value) => println!("Val is {}", String::from_utf8_lossy(&value)),
                    Err(Error::KeyNotFound) => println!("Key does not exist"),
                    Err(e) => return Err(e),
                }
            }
            "PUT" => {
                println!("Enter key and val to PUT!");
                let Some(key) = next_line(&mut lines)? else { break };
                let Some(value) = next_line(&mut lines)? else { break };
                match store.put(key.as_bytes(), value.as_bytes()) {
                    Ok(()) => println!("Success!"),
                    Err(e @ (Error::EmptyKey | Error::EmptyValue)) => println!("{e}"),
                    Err(e) => return Err(e),
                }
            }
            _ => println!("Invalid operation!"),
        }
        stdout.flush()?;
    }

    store.close()
}

fn next_line(
    lines: &mut impl Iterator<Item = io::Result<String>>,
) -> emberdb::Result<Option<String>> {
    match lines.next() {
        Some(line) => Ok(Some(line?)),
        None => Ok(None),
    }
}
