#![forbid(unsafe_code)]

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ccs_conjoint::inference::{summarize, VariableSummary};
use ccs_conjoint::pipeline::{self, RunOptions, SUMMARY_VARIABLES};
use ccs_conjoint::{ModelVariant, PosteriorArchive, RunConfig};

#[derive(Parser)]
#[command(name = "conjoint", version, about = "Bayesian conjoint choice models")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the encoded level coordinate
    Levels {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, value_enum)]
        variant: Option<CliVariant>,
    },
    /// Sample the prior predictive and summarize it
    PriorCheck {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, value_enum)]
        variant: Option<CliVariant>,
        /// Write the summaries as JSON
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        samples: Option<usize>,
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Run the full analysis and write the posterior archive
    Fit {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, value_enum)]
        variant: Option<CliVariant>,
        #[arg(long)]
        skip_advi: bool,
        #[arg(long)]
        chains: Option<usize>,
        #[arg(long)]
        cores: Option<usize>,
        #[arg(long)]
        tune: Option<usize>,
        #[arg(long)]
        draws: Option<usize>,
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Summarize variables of a posterior archive
    Summarize {
        #[arg(long)]
        archive: PathBuf,
        /// Variables to summarize (defaults to beta, delta, gamma)
        #[arg(long = "var", value_delimiter = ',')]
        vars: Option<Vec<String>>,
    },
    /// Write the default configuration as JSON
    DefaultConfig {
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum CliVariant {
    Basic,
    Hybrid,
    HybridAggregate,
}

impl From<CliVariant> for ModelVariant {
    fn from(value: CliVariant) -> Self {
        match value {
            CliVariant::Basic => ModelVariant::Basic,
            CliVariant::Hybrid => ModelVariant::Hybrid,
            CliVariant::HybridAggregate => ModelVariant::HybridAggregate,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Levels {
            input,
            config,
            variant,
        } => {
            let config = load_config(config.as_deref(), variant)?;
            let table = pipeline::load_table(&input, &config)?;
            let coordinate = pipeline::level_coordinate(&table, &config)?;
            for (i, column) in coordinate.columns().iter().enumerate() {
                println!("{i}\t{}\t{}\t{}", column.name, column.attribute, column.level);
            }
            println!("fingerprint\t{}", coordinate.fingerprint());
        }
        Commands::PriorCheck {
            input,
            config,
            variant,
            out,
            samples,
            seed,
        } => {
            let mut config = load_config(config.as_deref(), variant)?;
            if let Some(v) = samples {
                config.inference.prior_samples = v;
            }
            if let Some(v) = seed {
                config.inference.seed = v;
            }
            config.validate()?;
            let table = pipeline::load_table(&input, &config)?;
            let model = pipeline::build_model(&table, &config)?;
            let prior = pipeline::prior_check(&model, &config);
            let summaries = prior.summary(&SUMMARY_VARIABLES);
            print_summaries(&summaries, false);
            if let Some(rate) = prior.left_choice_rate() {
                println!("simulated left-choice rate: {rate:.3}");
            }
            if let Some(path) = out {
                let mut file = File::create(&path)?;
                serde_json::to_writer_pretty(&mut file, &summaries)?;
                writeln!(file)?;
                eprintln!("[prior-check] summary written to {}", path.display());
            }
        }
        Commands::Fit {
            input,
            out,
            config,
            variant,
            skip_advi,
            chains,
            cores,
            tune,
            draws,
            seed,
        } => {
            let mut config = load_config(config.as_deref(), variant)?;
            let inf = &mut config.inference;
            if let Some(v) = chains {
                inf.chains = v;
            }
            if let Some(v) = cores {
                inf.cores = v;
            }
            if let Some(v) = tune {
                inf.tune = v;
            }
            if let Some(v) = draws {
                inf.draws = v;
            }
            if let Some(v) = seed {
                inf.seed = v;
            }
            config.validate()?;

            let outcome = pipeline::run_to_path(&input, &out, &config, &RunOptions { skip_advi })?;
            let archive = &outcome.archive;
            let summaries = summarize(&archive.posterior, &SUMMARY_VARIABLES, &archive.coords);
            print_summaries(&summaries, true);
            for caveat in &archive.convergence.caveats {
                println!("caveat: {caveat}");
            }
            eprintln!("[fit] archive written to {}", out.display());
        }
        Commands::Summarize { archive, vars } => {
            let archive = PosteriorArchive::read(&archive)?;
            let names: Vec<String> = vars
                .unwrap_or_else(|| SUMMARY_VARIABLES.iter().map(|s| s.to_string()).collect());
            for name in &names {
                archive.get(name)?;
            }
            let names: Vec<&str> = names.iter().map(String::as_str).collect();
            let summaries = summarize(&archive.posterior, &names, &archive.coords);
            print_summaries(&summaries, true);
            println!(
                "chains={} draws={} divergences={} flagged={}",
                archive.posterior.chains,
                archive.posterior.draws,
                archive.convergence.divergences,
                archive.convergence.flagged
            );
        }
        Commands::DefaultConfig { out } => {
            let json = RunConfig::default().to_json_pretty()?;
            match out {
                Some(path) => {
                    std::fs::write(&path, format!("{json}\n"))?;
                    eprintln!("[default-config] written to {}", path.display());
                }
                None => println!("{json}"),
            }
        }
    }

    Ok(())
}

fn load_config(
    path: Option<&Path>,
    variant: Option<CliVariant>,
) -> Result<RunConfig, Box<dyn std::error::Error>> {
    let mut config = match path {
        Some(p) => RunConfig::from_path(p)?,
        None => RunConfig::default(),
    };
    if let Some(v) = variant {
        config.model.variant = v.into();
    }
    Ok(config)
}

fn print_summaries(summaries: &[VariableSummary], with_convergence: bool) {
    let width = summaries
        .iter()
        .map(|s| s.label.len())
        .max()
        .unwrap_or(8)
        .max(8);
    if with_convergence {
        println!(
            "{:<width$} {:>9} {:>8} {:>9} {:>9} {:>7} {:>8}",
            "", "mean", "sd", "hdi_3%", "hdi_97%", "r_hat", "ess_bulk"
        );
    } else {
        println!("{:<width$} {:>9} {:>8} {:>9} {:>9}", "", "mean", "sd", "hdi_3%", "hdi_97%");
    }
    for s in summaries {
        print!(
            "{:<width$} {:>9.3} {:>8.3} {:>9.3} {:>9.3}",
            s.label, s.mean, s.sd, s.hdi_low, s.hdi_high
        );
        if with_convergence {
            let r_hat = s.r_hat.map_or_else(|| "-".to_string(), |r| format!("{r:.3}"));
            let ess = s.ess_bulk.map_or_else(|| "-".to_string(), |e| format!("{e:.0}"));
            print!(" {r_hat:>7} {ess:>8}");
        }
        println!();
    }
}
