//! Merge request lookup command.

use anyhow::Result;
use refwatch_core::Branch;
use refwatch_core::branch::MERGE_REQUEST_PREFIX;
use std::path::Path;

use super::{Runtime, runtime, select};

pub async fn show(config_path: &Path, url: &str, number: u64) -> Result<()> {
    let Runtime {
        engine,
        repositories,
        ..
    } = runtime(config_path).await?;
    let repository = select(&repositories, url)?;

    let branch = Branch::new(
        repository.id,
        format!("{}{}", MERGE_REQUEST_PREFIX, number),
    );

    match engine.merge_request_info(repository, &branch).await? {
        Some(info) => {
            println!(
                "#{} {} -> {} ({})",
                number, info.head_ref, info.base_ref, info.state
            );
            if let Ok(endpoint) = repository.endpoint() {
                println!("{}", branch.url(repository.provider, &endpoint));
            }
        }
        None => {
            println!("No merge request {} on {}", number, repository.url);
        }
    }

    Ok(())
}
