//! STRATAFS host binary
//!
//! Loads the declarative configuration, initializes logging and services,
//! and builds the layer stack. The FUSE bridge mounts the returned root
//! layer through the library API; run standalone, the binary validates the
//! configuration end to end (including terminal connections and secrets
//! fetches) and reports the assembled stack.

use std::process::ExitCode;

use anyhow::Context;

use stratafs::{build_stack, Config, LayerRef, Services};

struct Args {
    config_path: String,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut config_path = "./config.toml".to_owned();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                config_path = args
                    .next()
                    .context("--config requires a path argument")?;
            }
            "--help" | "-h" => {
                println!("Usage: stratafs [--config <path>]");
                println!();
                println!("  --config <path>  Stack configuration file (default ./config.toml)");
                std::process::exit(0);
            }
            other => anyhow::bail!("unrecognized argument: {other}"),
        }
    }
    Ok(Args { config_path })
}

/// One line per layer, children indented.
fn describe(layer: &LayerRef, depth: usize, out: &mut Vec<String>) {
    out.push(format!("{}{}", "  ".repeat(depth), layer.kind()));
    for child in layer.children() {
        describe(child, depth + 1, out);
    }
}

fn run() -> anyhow::Result<()> {
    let args = parse_args()?;

    let config = Config::load(&args.config_path)
        .with_context(|| format!("loading {}", args.config_path))?;

    stratafs::logging::init(config.log_mode);

    log::info!("STRATAFS v{} starting", stratafs::VERSION);
    log::info!("configuration: {}", args.config_path);

    let services =
        Services::from_config(config.services.as_ref()).context("initializing services")?;

    let root = build_stack(&config, &services).context("building the layer stack")?;

    let mut lines = Vec::new();
    describe(&root, 0, &mut lines);
    log::info!("layer stack:\n{}", lines.join("\n"));

    // the stack is sound; hand it back to the host. Standalone, tear it
    // down cleanly and exit.
    root.destroy();
    services.close();

    log::info!("configuration OK");
    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("ERROR: {err:#}");
            ExitCode::FAILURE
        }
    }
}
