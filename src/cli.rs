use std::path::PathBuf;

use clap::Parser;

#[derive(clap::Parser, Debug)]
#[command(
    author,
    version,
    about = "Sub Hunter - DNS Attack Surface Enumerator",
    long_about = None,
    after_help = "EXAMPLES:
  Passive sweep of one domain:
    subhunter enum -d example.com --passive

  Full enumeration with brute forcing and alterations:
    subhunter enum -d example.com --brute -w words.txt --alts

  Active mode with certificate grabbing and zone transfer attempts:
    subhunter enum -d example.com --active -p 443 -p 8443

  Polite timing against fragile infrastructure:
    subhunter enum -d example.com -T1
"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable detailed debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Enable verbose output
    #[arg(long, global = true)]
    pub verbose: bool,
}

#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    #[command(about = "Enumerate the DNS attack surface of one or more root domains")]
    Enum {
        /// Root domain to enumerate (repeatable)
        #[arg(short = 'd', long = "domain", required = true)]
        domains: Vec<String>,

        /// Subdomain names to exclude from all discovery (repeatable)
        #[arg(long = "blacklist")]
        blacklist: Vec<String>,

        /// Wordlist file for brute forcing; a built-in list is used if omitted
        #[arg(short = 'w', long)]
        wordlist: Option<PathBuf>,

        /// DNS resolver address (repeatable); public resolvers are used if omitted
        #[arg(short = 'r', long = "resolver")]
        resolvers: Vec<String>,

        /// Port to pull TLS certificates from in active mode (repeatable)
        #[arg(short = 'p', long = "port")]
        ports: Vec<u16>,

        /// Enable dictionary brute forcing
        #[arg(long = "brute")]
        brute: bool,

        /// Disable recursive brute forcing of discovered subdomains
        #[arg(long = "no-recursive")]
        no_recursive: bool,

        /// Subdomain sightings required before recursive brute forcing
        #[arg(long, default_value_t = 1)]
        min_for_recursive: usize,

        /// Enable name alterations and Markov guessing
        #[arg(long = "alts")]
        alterations: bool,

        /// Enable active techniques: certificate grabbing and zone transfers
        #[arg(long)]
        active: bool,

        /// Passive mode: no DNS resolution at all
        #[arg(long)]
        passive: bool,

        /// Allow certificates to add newly discovered root domains
        #[arg(long = "additional-domains")]
        additional_domains: bool,

        /// Timing profile 0 (paranoid) through 5 (insane)
        #[arg(short = 'T', long = "timing", default_value_t = 3)]
        timing: u8,

        /// Idle watchdog in seconds; the enumeration stops after this much
        /// output silence
        #[arg(long, default_value_t = 30)]
        watchdog: u64,

        /// Write findings as JSON lines to this file
        #[arg(short = 'o', long)]
        out: Option<PathBuf>,
    },
}

pub fn parse_cli() -> Cli {
    Cli::parse()
}
