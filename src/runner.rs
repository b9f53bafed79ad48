use std::path::PathBuf;
use std::time::Duration;

use crate::cli::{Cli, Commands};
use sub_hunter::config::{Config, Timing};
use sub_hunter::enumerate::Enumeration;
use sub_hunter::output::{write_jsonl, Finding};
use sub_hunter::utils;

pub async fn run_from_cli(cli: Cli) -> anyhow::Result<()> {
    // Configure logging based on global flags. Keep external crates at INFO
    // so resolver and HTTP internals don't flood the CLI.
    use tracing_subscriber::EnvFilter;
    let crate_level = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else {
        "warn"
    };
    let filter_str = format!(
        "sub_hunter={crate_level},hickory_resolver=info,hickory_proto=info,reqwest=info,hyper=info"
    );
    let env_filter = EnvFilter::try_new(&filter_str).unwrap_or_else(|_| EnvFilter::new(crate_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_ansi(true)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Enum {
            domains,
            blacklist,
            wordlist,
            resolvers,
            ports,
            brute,
            no_recursive,
            min_for_recursive,
            alterations,
            active,
            passive,
            additional_domains,
            timing,
            watchdog,
            out,
        } => {
            let mut config = Config::new();
            config.brute_forcing = brute;
            config.recursive = !no_recursive;
            config.min_for_recursive = min_for_recursive.max(1);
            config.alterations = alterations;
            config.active = active;
            config.passive = passive;
            config.additional_domains = additional_domains;
            config.timing = Timing::from_level(timing);
            config.watchdog = Duration::from_secs(watchdog.max(1));
            config.resolvers = resolvers;
            if !ports.is_empty() {
                config.ports = ports;
            }
            for entry in blacklist {
                config.blacklist.insert(entry.to_lowercase());
            }
            if let Some(path) = wordlist {
                // Unreadable wordlists are fatal before enumeration begins.
                config.wordlist = utils::read_wordlist(&path)?;
            }
            for domain in domains {
                config.add_domain(&domain);
            }

            run_enum(config, out).await
        }
    }
}

async fn run_enum(config: Config, out: Option<PathBuf>) -> anyhow::Result<()> {
    let enumeration = Enumeration::new(config);
    let mut findings: Vec<Finding> = Vec::new();
    let mut output = enumeration.output_channel();

    let engine = {
        let enumeration = enumeration.clone();
        tokio::spawn(async move { enumeration.run().await })
    };

    while let Some(req) = output.recv().await {
        let finding = Finding::from(req.as_ref());
        match finding.addresses.first() {
            Some(addr) => println!("{:<40} {:<40} [{}] {}", finding.name, addr, finding.tag, finding.source),
            None => println!("{:<40} {:<40} [{}] {}", finding.name, "", finding.tag, finding.source),
        }
        findings.push(finding);
    }

    engine.await??;
    tracing::info!(found = findings.len(), "done");

    if let Some(path) = out {
        if let Some(parent) = path.parent() {
            sub_hunter::utils::ensure_dir(parent)?;
        }
        write_jsonl(&path, &findings)?;
        println!("Wrote {} findings to {}", findings.len(), path.display());
    }
    Ok(())
}
