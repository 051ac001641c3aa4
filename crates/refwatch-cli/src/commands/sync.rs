//! One-shot synchronization command.

use anyhow::Result;
use refwatch_core::Repository;
use refwatch_scheduler::SyncResult;
use std::path::Path;

use super::{Runtime, runtime, select};

/// Synchronize every configured repository, or only `only`, once.
pub async fn run(config_path: &Path, only: Option<&str>) -> Result<()> {
    let Runtime {
        engine,
        reporter,
        repositories,
    } = runtime(config_path).await?;

    let targets: Vec<&Repository> = match only {
        Some(url) => vec![select(&repositories, url)?],
        None => repositories.iter().collect(),
    };

    let reporter_handle = tokio::spawn(reporter.run());

    let mut failures = 0;
    for repository in targets {
        match engine.synchronize(repository).await {
            Ok(result) => print_result(repository, &result),
            Err(e) => {
                failures += 1;
                println!("✗ {}: {}", repository.url, e);
            }
        }
    }

    // Let the reporter finish delivering statuses.
    drop(engine);
    let delivered = reporter_handle.await?;
    println!("{} commit status(es) delivered", delivered);

    if failures > 0 {
        anyhow::bail!("{} repositories failed to synchronize", failures);
    }
    Ok(())
}

fn print_result(repository: &Repository, result: &SyncResult) {
    if result.hook_skipped {
        println!("- {}: no webhook since last fetch", repository.url);
        return;
    }

    println!("✓ {}", repository.url);
    println!(
        "  refs {}, new branches {}, stale commits {}",
        result.refs, result.new_branches, result.stale
    );
    println!(
        "  builds created {} (duplicates {}), superseded {}, over capacity {}",
        result.created, result.duplicates, result.superseded, result.evicted
    );
    if result.promoted > 0 || result.filtered > 0 {
        println!(
            "  sticky promotions {}, skipped outside merge requests {}",
            result.promoted, result.filtered
        );
    }
}
