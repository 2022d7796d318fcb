#![allow(unknown_lints)]

extern crate chrono;
extern crate fern;
extern crate perfsonar_uploader;

#[macro_use]
extern crate log;

use chrono::Utc;
use perfsonar_uploader::config::{self, Args};
use perfsonar_uploader::datapoint::Collection;
use perfsonar_uploader::publisher::Publisher;
use perfsonar_uploader::uploader::Uploader;
use std::fs::File;
use std::io::{self, BufReader};
use std::process;

fn setup_logging(args: &Args) -> Result<(), fern::InitError> {
    let level = match args.verbose {
        0 => log::LevelFilter::Error,
        1 => log::LevelFilter::Warn,
        2 => log::LevelFilter::Info,
        3 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}][{}] {}",
                record.module_path().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                Utc::now().to_rfc3339(),
                record.level(),
                message
            ))
        })
        .level(level)
        .chain(io::stdout());
    if let Some(ref path) = args.log_file {
        dispatch = dispatch.chain(fern::log_file(path)?);
    }
    dispatch.apply()?;
    Ok(())
}

fn read_collection(input: &str) -> Result<Collection, String> {
    let collection = if input == "-" {
        let stdin = io::stdin();
        let lock = stdin.lock();
        Collection::from_reader(lock)
    } else {
        let fp = File::open(input).map_err(|e| format!("unable to open {}: {}", input, e))?;
        Collection::from_reader(BufReader::new(fp))
    };
    collection.map_err(|e| format!("unable to decode collector document {}: {}", input, e))
}

fn main() {
    let args = match config::parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("perfsonar-uploader: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = setup_logging(&args) {
        eprintln!("perfsonar-uploader: could not set up logging: {}", e);
        process::exit(1);
    }

    info!("perfsonar-uploader - {}", args.version);

    let collection = match read_collection(&args.input) {
        Ok(collection) => collection,
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    };

    let publisher = Publisher::connect(&args.mq);
    let mut uploader = Uploader::new(&args, publisher);
    match uploader.post_collection(&collection) {
        Ok(report) => {
            debug!("{:?}", report);
        }
        Err(e) => {
            error!(
                "Unable to checkpoint {} in {}: {}",
                collection.checkpoint_key,
                args.tmp_directory.display(),
                e
            );
            process::exit(1);
        }
    }
}
