//! Ref listing through a local bare mirror driven by the git CLI.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use refwatch_core::{FetchError, Provider, RefEntry, RefFetcher, Repository};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Fields requested from `git for-each-ref`, NUL separated.
const REF_FIELDS: [&str; 8] = [
    "refname",
    "objectname",
    "committerdate:iso8601",
    "authorname",
    "authoremail",
    "subject",
    "committername",
    "committeremail",
];

/// Fetches refs into bare mirrors under a work directory.
pub struct GitRefFetcher {
    /// Base directory for mirrors
    work_dir: PathBuf,
}

impl GitRefFetcher {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
        }
    }

    /// Local mirror path of a repository.
    pub fn mirror_path(&self, repository: &Repository) -> PathBuf {
        let repo_hash = format!("{:x}", md5::compute(&repository.url));
        self.work_dir.join(repo_hash)
    }

    /// Clone URL with the API token inserted for https remotes.
    fn authenticated_url(repository: &Repository) -> String {
        let (Some(token), Some(rest)) = (
            repository.token.as_deref(),
            repository.url.strip_prefix("https://"),
        ) else {
            return repository.url.clone();
        };

        match repository.provider {
            Provider::Gitlab => format!("https://oauth2:{}@{}", token, rest),
            Provider::Github => format!("https://x-access-token:{}@{}", token, rest),
            Provider::Plain => repository.url.clone(),
        }
    }

    /// Refspec mapping the provider's merge-request heads to `refs/pull/*`.
    fn merge_request_refspec(provider: Provider) -> Option<&'static str> {
        match provider {
            Provider::Gitlab => Some("+refs/merge-requests/*/head:refs/pull/*"),
            Provider::Github => Some("+refs/pull/*/head:refs/pull/*"),
            Provider::Plain => None,
        }
    }

    async fn git(
        mirror: &Path,
        args: &[&str],
        secret: Option<&str>,
    ) -> Result<String, FetchError> {
        let output = Command::new("git")
            .arg("--git-dir")
            .arg(mirror)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            return Err(FetchError::Git {
                command: args.first().copied().unwrap_or_default().to_string(),
                stderr: redact(&String::from_utf8_lossy(&output.stderr), secret),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn ensure_mirror(&self, repository: &Repository, mirror: &Path) -> Result<(), FetchError> {
        tokio::fs::create_dir_all(&self.work_dir).await?;

        if mirror.join("refs").is_dir() {
            return Ok(());
        }

        info!(repo = %repository.url, path = %mirror.display(), "Cloning bare mirror");

        let url = Self::authenticated_url(repository);
        let output = Command::new("git")
            .arg("clone")
            .arg("--bare")
            .arg(&url)
            .arg(mirror)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            // Don't log the full error as it may contain the token
            warn!(repo = %repository.url, "Git clone failed");
            return Err(FetchError::Git {
                command: "clone".to_string(),
                stderr: redact(
                    &String::from_utf8_lossy(&output.stderr),
                    repository.token.as_deref(),
                ),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl RefFetcher for GitRefFetcher {
    fn name(&self) -> &'static str {
        "git"
    }

    async fn list_refs(&self, repository: &Repository) -> Result<Vec<RefEntry>, FetchError> {
        let mirror = self.mirror_path(repository);
        self.ensure_mirror(repository, &mirror).await?;

        let secret = repository.token.as_deref();
        let url = Self::authenticated_url(repository);

        Self::git(&mirror, &["gc", "--auto", "--prune=all"], secret).await?;
        Self::git(
            &mirror,
            &["fetch", "-p", &url, "+refs/heads/*:refs/heads/*"],
            secret,
        )
        .await?;
        if let Some(refspec) = Self::merge_request_refspec(repository.provider) {
            Self::git(&mirror, &["fetch", "-p", &url, refspec], secret).await?;
        }

        let format = REF_FIELDS
            .iter()
            .map(|field| format!("%({})", field))
            .collect::<Vec<_>>()
            .join("%00");
        let listing = Self::git(
            &mirror,
            &[
                "for-each-ref",
                "--format",
                &format,
                "--sort=-committerdate",
                "refs/heads",
                "refs/pull",
            ],
            secret,
        )
        .await?;

        let refs = parse_ref_listing(&listing)?;
        debug!(repo = %repository.url, count = refs.len(), "Listed refs");
        Ok(refs)
    }

    async fn last_fetched(&self, repository: &Repository) -> Option<DateTime<Utc>> {
        let fetch_head = self.mirror_path(repository).join("FETCH_HEAD");
        let metadata = tokio::fs::metadata(fetch_head).await.ok()?;
        metadata.modified().ok().map(DateTime::<Utc>::from)
    }
}

/// Parse `git for-each-ref` output produced with [`REF_FIELDS`].
pub fn parse_ref_listing(listing: &str) -> Result<Vec<RefEntry>, FetchError> {
    listing
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(parse_ref_line)
        .collect()
}

fn parse_ref_line(line: &str) -> Result<RefEntry, FetchError> {
    let fields: Vec<&str> = line.split('\0').collect();
    let [name, sha, date, author, author_email, subject, committer, committer_email] =
        fields.as_slice()
    else {
        return Err(FetchError::Malformed(format!(
            "expected {} fields, got {}: {:?}",
            REF_FIELDS.len(),
            fields.len(),
            line
        )));
    };

    Ok(RefEntry {
        name: name.to_string(),
        commit_id: sha.to_string(),
        commit_date: parse_git_date(date)?,
        author: author.to_string(),
        author_email: trim_email(author_email),
        subject: subject.to_string(),
        committer: committer.to_string(),
        committer_email: trim_email(committer_email),
    })
}

/// Parse git's iso8601 date (`2024-05-01 12:30:00 +0200`).
///
/// Dates without a usable offset are read as UTC from their first 19 characters.
pub fn parse_git_date(date: &str) -> Result<DateTime<Utc>, FetchError> {
    let date = date.trim();
    if let Ok(parsed) = DateTime::parse_from_str(date, "%Y-%m-%d %H:%M:%S %z") {
        return Ok(parsed.with_timezone(&Utc));
    }

    date.get(..19)
        .and_then(|prefix| NaiveDateTime::parse_from_str(prefix, "%Y-%m-%d %H:%M:%S").ok())
        .map(|naive| naive.and_utc())
        .ok_or_else(|| FetchError::Malformed(format!("invalid commit date: {:?}", date)))
}

fn redact(stderr: &str, secret: Option<&str>) -> String {
    match secret {
        Some(secret) if !secret.is_empty() => stderr.replace(secret, "[REDACTED]"),
        _ => stderr.to_string(),
    }
}

fn trim_email(email: &str) -> String {
    email.trim_start_matches('<').trim_end_matches('>').to_string()
}
