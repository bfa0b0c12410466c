use std::time::Duration;

use anyhow::Context;
use rendezvous::scenarios::{Scenario, Timing, Transcript};
use structopt::StructOpt;
use tracing::level_filters::LevelFilter;

/// Run the select scenarios and report the first one that misbehaves.
#[derive(StructOpt, Debug)]
struct CmdLineOptions {
    /// How long the `read` scenario's worker waits before sending.
    #[structopt(long, default_value = "1000")]
    delay_ms: u64,
    /// Time given to workers to block before each select.
    #[structopt(long, default_value = "100")]
    settle_ms: u64,
    /// Fix the case order of every select. Same as setting RENDEZVOUS_SELECT_SEED.
    #[structopt(long)]
    seed: Option<u64>,
    /// Scenarios to run, in order. All of them when empty.
    scenarios: Vec<Scenario>,
}

fn main() -> anyhow::Result<()> {
    let opt = CmdLineOptions::from_args();

    // The transcript goes to stdout; logs, narration included, go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(rendezvous::env_filter(LevelFilter::INFO))
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();

    // Must happen before the first select reads the seed.
    if let Some(seed) = opt.seed {
        std::env::set_var(rendezvous::SEED_VAR, seed.to_string());
    }

    let timing = Timing {
        delay: Duration::from_millis(opt.delay_ms),
        settle: Duration::from_millis(opt.settle_ms),
    };
    let scenarios = if opt.scenarios.is_empty() {
        Scenario::ALL.to_vec()
    } else {
        opt.scenarios
    };

    for scenario in scenarios {
        println!(">>> Starting test {} <<<", scenario);
        scenario
            .run_with(&timing, Transcript::echo_to(std::io::stdout()))
            .with_context(|| format!("Scenario {} failed", scenario))?;
        println!(">>> Test {} over <<<", scenario);
        println!();
    }

    Ok(())
}
