// Runs every select scenario end to end with shortened timings, the way the `select_scenarios`
// binary does.

use std::time::Duration;

use anyhow::Result;
use rendezvous::scenarios::{Scenario, Timing};
use tracing::level_filters::LevelFilter;

fn quick() -> Timing {
    Timing {
        delay: Duration::from_millis(50),
        settle: Duration::from_millis(10),
    }
}

#[test]
fn main() -> Result<()> {
    tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(rendezvous::env_filter(LevelFilter::WARN))
        .with_target(false)
        .without_time()
        .init();

    for scenario in Scenario::ALL.iter() {
        let transcript = scenario.run(&quick())?;
        assert!(!transcript.lines().is_empty(), "{} said nothing", scenario);
    }
    Ok(())
}

/// The scenarios with two ready cases must see both winners over enough runs.
#[test]
fn both_cases_win_eventually() -> Result<()> {
    let timing = Timing {
        delay: Duration::from_millis(0),
        settle: Duration::from_millis(0),
    };
    for scenario in &[Scenario::ReadRead, Scenario::ReadWrite, Scenario::WriteWrite] {
        let mut last_lines = std::collections::HashSet::new();
        for _ in 0..200 {
            let transcript = scenario.run(&timing)?;
            last_lines.insert(transcript.lines().last().cloned());
            if last_lines.len() == 2 {
                break;
            }
        }
        assert_eq!(last_lines.len(), 2, "{} always picked {:?}", scenario, last_lines);
    }
    Ok(())
}

#[test]
fn read_reports_the_wait() -> Result<()> {
    let timing = quick();
    let transcript = Scenario::Read.run(&timing)?;
    let lines = transcript.lines();
    assert_eq!(lines.len(), 2);
    assert!(lines[1].starts_with("Waited "));
    Ok(())
}
